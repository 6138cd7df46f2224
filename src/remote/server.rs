use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{RemoteMessage, REMOTE_PATH};
use crate::health::{bind_address, HealthMetrics};
use crate::ingest::SegmentObject;
use crate::stream::{BoxFuture, GraphRegistry};

/// Path of the segment ingestion endpoint.
pub const SEGMENTS_PATH: &str = "/v1/segments";

/// Receiver of decoded segments posted by agents.
pub trait SegmentSink: Send + Sync + 'static {
    /// Takes ownership of `segments`, returning how many were accepted.
    fn submit(&self, segments: Vec<SegmentObject>) -> BoxFuture<'_, usize>;
}

/// HTTP endpoint for inter-node messages and agent segments.
pub struct RemoteServer {
    addr: String,
    registry: Arc<GraphRegistry>,
    segments: Option<Arc<dyn SegmentSink>>,
    health: Arc<HealthMetrics>,
    shutdown: Mutex<Option<CancellationToken>>,
}

struct AppState {
    registry: Arc<GraphRegistry>,
    segments: Option<Arc<dyn SegmentSink>>,
    health: Arc<HealthMetrics>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: usize,
    rejected: usize,
}

impl RemoteServer {
    pub fn new(addr: &str, registry: Arc<GraphRegistry>, health: Arc<HealthMetrics>) -> Self {
        Self {
            addr: addr.to_string(),
            registry,
            segments: None,
            health,
            shutdown: Mutex::new(None),
        }
    }

    /// Also serves [`SEGMENTS_PATH`], feeding `sink`.
    pub fn with_segments(mut self, sink: Arc<dyn SegmentSink>) -> Self {
        self.segments = Some(sink);
        self
    }

    /// Binds and serves in the background, returning the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr, ":11800");

        let state = Arc::new(AppState {
            registry: Arc::clone(&self.registry),
            segments: self.segments.clone(),
            health: Arc::clone(&self.health),
        });

        let mut app = Router::new().route(REMOTE_PATH, post(remote_handler));
        if self.segments.is_some() {
            app = app.route(SEGMENTS_PATH, post(segments_handler));
        }
        let app = app.with_state(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "remote server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "remote server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops accepting requests.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// POST /remote - NDJSON remote messages, optionally gzip encoded.
async fn remote_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Accepted>, (StatusCode, String)> {
    let gzip = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));

    let data = if gzip {
        decompress_gzip(&body).map_err(|e| (StatusCode::BAD_REQUEST, format!("{e:#}")))?
    } else {
        body.to_vec()
    };

    let mut accepted = 0;
    let mut rejected = 0;

    for line in data.split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let message: RemoteMessage = match serde_json::from_slice(line) {
            Ok(message) => message,
            Err(e) => {
                rejected += 1;
                state
                    .health
                    .remote_messages
                    .with_label_values(&["malformed"])
                    .inc();
                tracing::debug!(error = %e, "malformed remote message");
                continue;
            }
        };

        match state.registry.deliver(message).await {
            Ok(()) => accepted += 1,
            Err(e) => {
                rejected += 1;
                tracing::debug!(error = %e, reason = e.reason(), "remote message rejected");
            }
        }
    }

    if rejected > 0 {
        tracing::warn!(accepted, rejected, "remote batch partially rejected");
    }

    Ok(Json(Accepted { accepted, rejected }))
}

/// POST /v1/segments - JSON array of decoded segments.
async fn segments_handler(
    State(state): State<Arc<AppState>>,
    Json(segments): Json<Vec<SegmentObject>>,
) -> Result<Json<Accepted>, StatusCode> {
    let Some(sink) = &state.segments else {
        return Err(StatusCode::NOT_FOUND);
    };

    let total = segments.len();
    state.health.segments_received.inc_by(total as f64);

    let accepted = sink.submit(segments).await;
    Ok(Json(Accepted {
        accepted,
        rejected: total - accepted.min(total),
    }))
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).context("gzip decode")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::clock::{time_bucket_of, Granularity};
    use crate::config::RemoteConfig;
    use crate::entity::{Entity, ServiceMetric};
    use crate::remote::{HttpRemoteClient, RemoteSender};
    use crate::storage::{decode_row, InMemoryStorage, Storage};
    use crate::stream::{Envelope, GraphId, StageId, StageKind, StreamOptions, StreamRuntime};

    struct Counting(parking_lot::Mutex<usize>);

    impl SegmentSink for Counting {
        fn submit(&self, segments: Vec<SegmentObject>) -> BoxFuture<'_, usize> {
            Box::pin(async move {
                *self.0.lock() += segments.len();
                segments.len()
            })
        }
    }

    #[tokio::test]
    async fn test_gzip_batch_reaches_persist_stage() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let storage = Arc::new(InMemoryStorage::new());
        let mut runtime = StreamRuntime::standalone(
            StreamOptions::default(),
            Arc::clone(&storage),
            Arc::clone(&health),
        );
        runtime
            .create_graph::<ServiceMetric>(GraphId(2))
            .add_node(StageKind::Aggregate)
            .add_next(StageKind::Dispatch)
            .add_next(StageKind::Persist)
            .build()
            .expect("graph");

        let server = RemoteServer::new(
            "127.0.0.1:0",
            Arc::clone(runtime.registry()),
            Arc::clone(&health),
        );
        let addr = server.start().await.expect("server starts");

        let client = HttpRemoteClient::new(&RemoteConfig {
            compression: "gzip".to_string(),
            timeout: Duration::from_secs(2),
            ..RemoteConfig::default()
        })
        .expect("client");

        let bucket = time_bucket_of(SystemTime::now(), Granularity::Minute);
        let mut metric = ServiceMetric::from_call(8, 1, bucket, 30, false, "t");
        metric.calls = 4;
        metric.duration_sum = 120;
        let message = RemoteMessage::encode(
            GraphId(2),
            StageId(23),
            &Envelope {
                origin: Arc::from("peer:11800"),
                record: metric.clone(),
            },
        )
        .expect("encode");

        client
            .send(&addr.to_string(), vec![message])
            .await
            .expect("delivered");
        server.stop();
        runtime.shutdown().await;

        let row = storage
            .get_by_id(ServiceMetric::TYPE_TAG, &metric.id())
            .await
            .expect("read")
            .expect("row");
        let stored: ServiceMetric = decode_row(&metric.id(), row).expect("decode");
        assert_eq!(stored.calls, 4);
    }

    #[tokio::test]
    async fn test_segments_endpoint_feeds_sink() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let registry = Arc::new(GraphRegistry::new(Arc::clone(&health)));
        let sink = Arc::new(Counting(parking_lot::Mutex::new(0)));

        let server = RemoteServer::new("127.0.0.1:0", registry, Arc::clone(&health))
            .with_segments(Arc::clone(&sink) as Arc<dyn SegmentSink>);
        let addr = server.start().await.expect("server starts");

        let body = serde_json::json!([{
            "trace_segment_id": "seg-1",
            "application_code": "shop",
            "instance_uuid": "uuid-1",
            "spans": [],
        }]);
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}{SEGMENTS_PATH}"))
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("request");

        assert!(resp.status().is_success());
        assert_eq!(*sink.0.lock(), 1);
        assert_eq!(health.segments_received.get(), 1.0);
        server.stop();
    }
}
