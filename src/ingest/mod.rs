//! Segment ingestion: name exchange, entity derivation and submission into
//! the graphs.
//!
//! A segment whose names cannot be exchanged yet is parked in a bounded
//! [`RetryQueue`] and tried again on every retry tick until it succeeds or
//! runs out of attempts.

pub mod retry;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SpanExchanger;
use crate::clock::{self, Granularity};
use crate::entity::{InstanceHeartbeat, NodeReferenceMetric, ServiceMetric};
use crate::error::StreamError;
use crate::health::HealthMetrics;
use crate::remote::SegmentSink;
use crate::storage::Storage;
use crate::stream::{BoxFuture, GraphHandle};

pub use retry::{Pending, Rejected, RetryQueue};

/// Role of a span within its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    /// Server side of an incoming call.
    Entry,
    /// Client side of an outgoing call.
    Exit,
    Local,
}

/// One span as decoded from an agent report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanObject {
    pub span_id: i32,
    #[serde(default = "root_parent")]
    pub parent_span_id: i32,
    pub span_type: SpanType,
    /// Epoch millis.
    pub start_time: i64,
    /// Epoch millis.
    pub end_time: i64,
    #[serde(default)]
    pub operation_name: String,
    #[serde(default)]
    pub operation_id: i32,
    #[serde(default)]
    pub peer: String,
    #[serde(default)]
    pub peer_id: i32,
    #[serde(default)]
    pub is_error: bool,
}

fn root_parent() -> i32 {
    -1
}

impl SpanObject {
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).max(0)
    }
}

/// The spans one agent recorded for one trace in one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentObject {
    pub trace_segment_id: String,
    pub application_code: String,
    #[serde(default)]
    pub application_id: i32,
    pub instance_uuid: String,
    #[serde(default)]
    pub instance_id: i32,
    #[serde(default)]
    pub spans: Vec<SpanObject>,
}

/// Entities derived from one exchanged segment.
#[derive(Debug, Default, PartialEq)]
pub struct Derived {
    pub references: Vec<NodeReferenceMetric>,
    pub services: Vec<ServiceMetric>,
    pub heartbeat: Option<InstanceHeartbeat>,
}

/// Builds entities from an exchanged segment.
///
/// Exit spans with a resolved peer become node references, entry spans with
/// a resolved operation become service metrics, and the segment itself
/// refreshes its instance heartbeat.
pub fn derive(segment: &SegmentObject, now_millis: i64) -> Derived {
    let mut derived = Derived::default();
    let application_id = segment.application_id;

    for span in &segment.spans {
        let bucket = clock::time_bucket(span.start_time, Granularity::Minute);
        match span.span_type {
            SpanType::Exit if span.peer_id != 0 => {
                derived.references.push(NodeReferenceMetric::from_call(
                    application_id,
                    span.peer_id,
                    bucket,
                    span.duration_ms(),
                    span.is_error,
                ));
            }
            SpanType::Entry if span.operation_id != 0 => {
                derived.services.push(ServiceMetric::from_call(
                    span.operation_id,
                    application_id,
                    bucket,
                    span.duration_ms(),
                    span.is_error,
                    &segment.trace_segment_id,
                ));
            }
            _ => {}
        }
    }

    if segment.instance_id != 0 {
        let heartbeat_time = segment
            .spans
            .iter()
            .map(|span| span.end_time)
            .max()
            .unwrap_or(now_millis);
        derived.heartbeat = Some(InstanceHeartbeat {
            instance_id: segment.instance_id,
            application_id,
            time_bucket: clock::time_bucket(heartbeat_time, Granularity::Day),
            heartbeat_time,
        });
    }

    derived
}

/// Graph entries fed by ingestion.
#[derive(Clone)]
pub struct IngestHandles {
    pub references: GraphHandle<NodeReferenceMetric>,
    pub services: GraphHandle<ServiceMetric>,
    pub heartbeats: GraphHandle<InstanceHeartbeat>,
}

/// What happened to one submitted segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Exchanged and submitted into the graphs.
    Submitted,
    /// Parked for a later retry.
    Deferred,
    /// Dropped for good.
    Discarded,
}

/// Counts for one retry tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub submitted: usize,
    pub deferred: usize,
    pub discarded: usize,
}

/// Entry point for decoded segments.
pub struct SegmentIngestor<S: Storage> {
    exchanger: SpanExchanger<S>,
    handles: IngestHandles,
    retry: Mutex<RetryQueue<SegmentObject>>,
    health: Arc<HealthMetrics>,
}

impl<S: Storage> SegmentIngestor<S> {
    pub fn new(
        exchanger: SpanExchanger<S>,
        handles: IngestHandles,
        retry: RetryQueue<SegmentObject>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            exchanger,
            handles,
            retry: Mutex::new(retry),
            health,
        }
    }

    /// Segments waiting for a retry.
    pub fn pending(&self) -> usize {
        self.retry.lock().len()
    }

    pub async fn ingest(&self, mut segment: SegmentObject) -> IngestOutcome {
        match self.process(&mut segment).await {
            Ok(()) => {
                self.count("resolved");
                IngestOutcome::Submitted
            }
            Err(e) => {
                debug!(
                    segment = %segment.trace_segment_id,
                    error = %e,
                    "exchange not ready, deferring segment",
                );
                self.defer(segment, 1)
            }
        }
    }

    /// Tries every parked segment once.
    pub async fn retry_pending(&self) -> RetryReport {
        let pending = self.retry.lock().take_all();
        let mut report = RetryReport::default();

        for Pending {
            item: mut segment,
            attempts,
        } in pending
        {
            self.count("retried");
            match self.process(&mut segment).await {
                Ok(()) => {
                    self.count("resolved");
                    report.submitted += 1;
                }
                Err(_) => match self.defer(segment, attempts + 1) {
                    IngestOutcome::Deferred => report.deferred += 1,
                    _ => report.discarded += 1,
                },
            }
        }

        if report != RetryReport::default() {
            debug!(
                submitted = report.submitted,
                deferred = report.deferred,
                discarded = report.discarded,
                "retry tick",
            );
        }
        report
    }

    /// Gives every parked segment one last attempt, then discards and counts
    /// whatever is still unresolved.
    pub async fn finish(&self) -> RetryReport {
        let mut report = self.retry_pending().await;

        let abandoned = self.retry.lock().take_all();
        if !abandoned.is_empty() {
            for _ in &abandoned {
                self.count("discarded");
            }
            report.deferred = report.deferred.saturating_sub(abandoned.len());
            report.discarded += abandoned.len();
            warn!(
                discarded = abandoned.len(),
                "discarding unresolved segments on shutdown",
            );
        }
        report
    }

    /// Spawns the periodic retry loop. Cancelling `ctx` runs [`finish`](Self::finish).
    pub fn spawn_retry(
        self: Arc<Self>,
        interval: Duration,
        ctx: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            info!(interval = ?interval, "segment retry loop started");

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        self.finish().await;
                        return;
                    }
                    _ = ticker.tick() => {
                        self.retry_pending().await;
                    }
                }
            }
        })
    }

    async fn process(&self, segment: &mut SegmentObject) -> Result<(), StreamError> {
        self.exchanger.exchange_segment(segment).await?;

        let now = clock::system_time_millis(SystemTime::now());
        let derived = derive(segment, now);

        self.handles.references.submit_all(derived.references).await;
        self.handles.services.submit_all(derived.services).await;
        if let Some(heartbeat) = derived.heartbeat {
            if let Err(e) = self.handles.heartbeats.submit(heartbeat).await {
                debug!(error = %e, "heartbeat rejected");
            }
        }

        Ok(())
    }

    fn defer(&self, segment: SegmentObject, attempts: u32) -> IngestOutcome {
        match self.retry.lock().push(segment, attempts) {
            Ok(()) => {
                self.count("deferred");
                IngestOutcome::Deferred
            }
            Err((segment, reason)) => {
                self.count("discarded");
                warn!(
                    segment = %segment.trace_segment_id,
                    attempts,
                    reason = reason.as_str(),
                    "discarding segment with unresolved names",
                );
                IngestOutcome::Discarded
            }
        }
    }

    fn count(&self, outcome: &str) {
        self.health
            .exchange_outcomes
            .with_label_values(&[outcome])
            .inc();
    }
}

impl<S: Storage> SegmentSink for SegmentIngestor<S> {
    fn submit(&self, segments: Vec<SegmentObject>) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let mut accepted = 0;
            for segment in segments {
                if self.ingest(segment).await != IngestOutcome::Discarded {
                    accepted += 1;
                }
            }
            accepted
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(kind: SpanType, start: i64, end: i64) -> SpanObject {
        SpanObject {
            span_id: 0,
            parent_span_id: -1,
            span_type: kind,
            start_time: start,
            end_time: end,
            operation_name: String::new(),
            operation_id: 0,
            peer: String::new(),
            peer_id: 0,
            is_error: false,
        }
    }

    // 2018-01-01 12:34:56.789 UTC
    const TS: i64 = 1_514_810_096_789;

    #[test]
    fn test_derive_maps_span_types_to_entities() {
        let mut entry = span(SpanType::Entry, TS, TS + 120);
        entry.operation_id = 7;
        let mut exit = span(SpanType::Exit, TS + 10, TS + 60);
        exit.peer_id = 3;
        exit.is_error = true;
        let local = span(SpanType::Local, TS + 20, TS + 30);

        let segment = SegmentObject {
            trace_segment_id: "seg-9".to_string(),
            application_code: String::new(),
            application_id: 2,
            instance_uuid: String::new(),
            instance_id: 5,
            spans: vec![entry, exit, local],
        };

        let derived = derive(&segment, 0);

        assert_eq!(derived.references.len(), 1);
        let reference = &derived.references[0];
        assert_eq!(
            (reference.front_application_id, reference.behind_application_id),
            (2, 3)
        );
        assert_eq!(reference.error, 1);
        assert_eq!(reference.time_bucket, 201801011234);

        assert_eq!(derived.services.len(), 1);
        assert_eq!(derived.services[0].service_id, 7);
        assert_eq!(derived.services[0].duration_sum, 120);
        assert_eq!(derived.services[0].slow_traces[0].trace_id, "seg-9");

        let heartbeat = derived.heartbeat.expect("heartbeat");
        assert_eq!(heartbeat.heartbeat_time, TS + 120);
        assert_eq!(heartbeat.time_bucket, 20180101);
    }

    #[test]
    fn test_unresolved_spans_derive_nothing() {
        let segment = SegmentObject {
            trace_segment_id: "seg-1".to_string(),
            application_code: "shop".to_string(),
            application_id: 0,
            instance_uuid: "u".to_string(),
            instance_id: 0,
            spans: vec![span(SpanType::Exit, TS, TS + 1)],
        };
        assert_eq!(derive(&segment, TS), Derived::default());
    }

    #[test]
    fn test_segment_json_defaults() {
        let segment: SegmentObject = serde_json::from_str(
            r#"{"trace_segment_id":"s","application_code":"a","instance_uuid":"u",
                "spans":[{"span_id":0,"span_type":"exit","start_time":1,"end_time":5,
                          "peer":"db:5432"}]}"#,
        )
        .expect("decode");

        assert_eq!(segment.application_id, 0);
        assert_eq!(segment.spans[0].parent_span_id, -1);
        assert_eq!(segment.spans[0].peer, "db:5432");
        assert_eq!(segment.spans[0].duration_ms(), 4);
    }
}
