use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use spanflow::cache::{CacheManager, RegisterService, SpanExchanger};
use spanflow::clock::{self, time_bucket_of, Granularity};
use spanflow::cluster::{HashRing, RingRouter, StaticDirectory};
use spanflow::collector::{build_graphs, Collector};
use spanflow::config::{AlarmConfig, Config};
use spanflow::entity::{Entity, InstanceHeartbeat, ServiceMetric};
use spanflow::error::StorageError;
use spanflow::health::HealthMetrics;
use spanflow::ingest::{
    IngestOutcome, RetryQueue, SegmentIngestor, SegmentObject, SpanObject, SpanType,
};
use spanflow::remote::InProcessTransport;
use spanflow::storage::{decode_row, InMemoryStorage, Row, Storage};
use spanflow::stream::{GraphId, StageKind, StreamOptions, StreamRuntime};
use tokio_util::sync::CancellationToken;

const NODES: [&str; 2] = ["10.0.0.1:11800", "10.0.0.2:11800"];

fn health() -> Arc<HealthMetrics> {
    Arc::new(HealthMetrics::new(":0").expect("metrics"))
}

fn node(
    address: &str,
    transport: &Arc<InProcessTransport>,
) -> (StreamRuntime<InMemoryStorage>, Arc<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let directory = Arc::new(StaticDirectory::new(
        NODES.iter().map(|n| n.to_string()).collect(),
    ));
    let runtime = StreamRuntime::new(
        StreamOptions::default(),
        Arc::clone(&storage),
        address,
        Arc::new(RingRouter::new(directory, 64, None)),
        Arc::clone(transport) as Arc<dyn spanflow::remote::RemoteSender>,
        health(),
    );
    (runtime, storage)
}

async fn stored_metric(storage: &InMemoryStorage, id: &str) -> Option<ServiceMetric> {
    let row = storage
        .get_by_id(ServiceMetric::TYPE_TAG, id)
        .await
        .expect("read")?;
    Some(decode_row(id, row).expect("decode"))
}

#[tokio::test]
async fn test_two_nodes_persist_each_key_once_on_its_owner() {
    let transport = Arc::new(InProcessTransport::new());
    let (mut a, storage_a) = node(NODES[0], &transport);
    let (mut b, storage_b) = node(NODES[1], &transport);
    transport.attach(NODES[0], Arc::clone(a.registry()));
    transport.attach(NODES[1], Arc::clone(b.registry()));

    let build = |runtime: &mut StreamRuntime<InMemoryStorage>| {
        runtime
            .create_graph::<ServiceMetric>(GraphId(2))
            .add_node(StageKind::Aggregate)
            .add_next(StageKind::Dispatch)
            .add_next(StageKind::Persist)
            .build()
            .expect("graph")
    };
    let on_a = build(&mut a);
    let on_b = build(&mut b);

    let bucket = time_bucket_of(SystemTime::now(), Granularity::Minute);
    let records: Vec<ServiceMetric> = (1..=20)
        .map(|service| ServiceMetric::from_call(service, 1, bucket, 50, false, "t"))
        .collect();

    // Both nodes see three calls per service.
    for _ in 0..3 {
        on_a.submit_all(records.clone()).await;
        on_b.submit_all(records.clone()).await;
    }

    let ring = HashRing::new(&NODES.map(String::from), 64);
    let mut settled = false;
    for _ in 0..100 {
        a.flush_now().await;
        b.flush_now().await;

        let mut all = true;
        for record in &records {
            let owner = if ring.owner(&record.routing_key()) == Some(NODES[0]) {
                &storage_a
            } else {
                &storage_b
            };
            let calls = stored_metric(owner, &record.id()).await.map_or(0, |m| m.calls);
            all &= calls == 6;
        }
        if all {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(settled, "every owner should hold both nodes' totals");

    // Repeated flushes do not count the same totals twice.
    a.flush_now().await;
    b.flush_now().await;

    for record in &records {
        let (owner, other) = if ring.owner(&record.routing_key()) == Some(NODES[0]) {
            (&storage_a, &storage_b)
        } else {
            (&storage_b, &storage_a)
        };
        assert_eq!(stored_metric(owner, &record.id()).await.expect("owned row").calls, 6);
        assert!(stored_metric(other, &record.id()).await.is_none());
    }

    a.shutdown().await;
    b.shutdown().await;
}

/// Storage whose name mappings can be switched off.
struct Flaky {
    inner: InMemoryStorage,
    mappings_down: AtomicBool,
}

impl Storage for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get_by_id(
        &self,
        entity_type: &'static str,
        id: &str,
    ) -> Result<Option<Row>, StorageError> {
        self.inner.get_by_id(entity_type, id).await
    }

    async fn get_by_ids(
        &self,
        entity_type: &'static str,
        ids: &[String],
    ) -> Result<HashMap<String, Row>, StorageError> {
        self.inner.get_by_ids(entity_type, ids).await
    }

    async fn batch_upsert(
        &self,
        entity_type: &'static str,
        rows: Vec<(String, Row)>,
    ) -> Result<(), StorageError> {
        self.inner.batch_upsert(entity_type, rows).await
    }

    async fn find_mapping(
        &self,
        namespace: &'static str,
        name: &str,
    ) -> Result<Option<i32>, StorageError> {
        if self.mappings_down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("mapping table offline".into()));
        }
        self.inner.find_mapping(namespace, name).await
    }

    async fn get_or_create_mapping(
        &self,
        namespace: &'static str,
        name: &str,
    ) -> Result<i32, StorageError> {
        if self.mappings_down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("mapping table offline".into()));
        }
        self.inner.get_or_create_mapping(namespace, name).await
    }

    async fn delete_expired(
        &self,
        entity_type: &'static str,
        before_bucket: u64,
    ) -> Result<usize, StorageError> {
        self.inner.delete_expired(entity_type, before_bucket).await
    }
}

fn segment(id: &str, now_millis: i64) -> SegmentObject {
    SegmentObject {
        trace_segment_id: id.to_string(),
        application_code: "shop".to_string(),
        application_id: 0,
        instance_uuid: "agent-1".to_string(),
        instance_id: 0,
        spans: vec![
            SpanObject {
                span_id: 0,
                parent_span_id: -1,
                span_type: SpanType::Entry,
                start_time: now_millis - 80,
                end_time: now_millis,
                operation_name: "/checkout".to_string(),
                operation_id: 0,
                peer: String::new(),
                peer_id: 0,
                is_error: false,
            },
            SpanObject {
                span_id: 1,
                parent_span_id: 0,
                span_type: SpanType::Exit,
                start_time: now_millis - 60,
                end_time: now_millis - 20,
                operation_name: "SELECT".to_string(),
                operation_id: 0,
                peer: "db:5432".to_string(),
                peer_id: 0,
                is_error: false,
            },
        ],
    }
}

#[tokio::test]
async fn test_unresolved_segment_is_retried_then_persisted() {
    let storage = Arc::new(Flaky {
        inner: InMemoryStorage::new(),
        mappings_down: AtomicBool::new(true),
    });
    let health = health();
    let mut runtime = StreamRuntime::standalone(
        StreamOptions::default(),
        Arc::clone(&storage),
        Arc::clone(&health),
    );
    let handles = build_graphs(
        &mut runtime,
        &AlarmConfig {
            enabled: false,
            ..AlarmConfig::default()
        },
        &health,
    )
    .expect("graphs");

    let register = Arc::new(RegisterService::new(
        Arc::clone(&storage),
        Arc::new(CacheManager::new()),
    ));
    let ingestor = SegmentIngestor::new(
        SpanExchanger::new(register),
        handles,
        RetryQueue::new(3, 100),
        Arc::clone(&health),
    );

    let now = clock::system_time_millis(SystemTime::now());
    assert_eq!(ingestor.ingest(segment("seg-1", now)).await, IngestOutcome::Deferred);
    assert_eq!(ingestor.pending(), 1);

    // Still down: the segment stays parked.
    let report = ingestor.retry_pending().await;
    assert_eq!(report.deferred, 1);

    storage.mappings_down.store(false, Ordering::SeqCst);
    let report = ingestor.retry_pending().await;
    assert_eq!(report.submitted, 1);
    assert_eq!(ingestor.pending(), 0);

    runtime.shutdown().await;

    assert_eq!(storage.inner.row_count(ServiceMetric::TYPE_TAG), 1);
    assert_eq!(storage.inner.row_count("node_reference_metric"), 1);
    assert_eq!(storage.inner.row_count(InstanceHeartbeat::TYPE_TAG), 1);
    assert_eq!(storage.inner.mapping_count("application"), 1);
}

#[tokio::test]
async fn test_segment_is_discarded_after_max_retries() {
    let storage = Arc::new(Flaky {
        inner: InMemoryStorage::new(),
        mappings_down: AtomicBool::new(true),
    });
    let health = health();
    let mut runtime = StreamRuntime::standalone(
        StreamOptions::default(),
        Arc::clone(&storage),
        Arc::clone(&health),
    );
    let handles = build_graphs(&mut runtime, &AlarmConfig::default(), &health).expect("graphs");

    let register = Arc::new(RegisterService::new(
        Arc::clone(&storage),
        Arc::new(CacheManager::new()),
    ));
    let ingestor = SegmentIngestor::new(
        SpanExchanger::new(register),
        handles,
        RetryQueue::new(2, 100),
        Arc::clone(&health),
    );

    let now = clock::system_time_millis(SystemTime::now());
    ingestor.ingest(segment("seg-2", now)).await;
    assert_eq!(ingestor.retry_pending().await.deferred, 1);
    assert_eq!(ingestor.retry_pending().await.discarded, 1);
    assert_eq!(ingestor.pending(), 0);
    assert_eq!(
        health
            .exchange_outcomes
            .with_label_values(&["discarded"])
            .get(),
        1.0
    );

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_parked_segments_get_a_last_attempt_on_shutdown() {
    let storage = Arc::new(Flaky {
        inner: InMemoryStorage::new(),
        mappings_down: AtomicBool::new(true),
    });
    let health = health();
    let mut runtime = StreamRuntime::standalone(
        StreamOptions::default(),
        Arc::clone(&storage),
        Arc::clone(&health),
    );
    let handles = build_graphs(&mut runtime, &AlarmConfig::default(), &health).expect("graphs");

    let register = Arc::new(RegisterService::new(
        Arc::clone(&storage),
        Arc::new(CacheManager::new()),
    ));
    let ingestor = Arc::new(SegmentIngestor::new(
        SpanExchanger::new(register),
        handles,
        RetryQueue::new(5, 100),
        Arc::clone(&health),
    ));
    let ctx = CancellationToken::new();
    let retry = Arc::clone(&ingestor).spawn_retry(Duration::from_secs(3600), ctx.clone());

    let now = clock::system_time_millis(SystemTime::now());
    assert_eq!(ingestor.ingest(segment("seg-5", now)).await, IngestOutcome::Deferred);

    // Still unresolved at shutdown: counted as discarded, not silently lost.
    ctx.cancel();
    retry.await.expect("retry task");
    assert_eq!(ingestor.pending(), 0);
    assert_eq!(
        health
            .exchange_outcomes
            .with_label_values(&["discarded"])
            .get(),
        1.0
    );

    // Resolvable at shutdown: submitted by the last attempt.
    ingestor.ingest(segment("seg-6", now)).await;
    storage.mappings_down.store(false, Ordering::SeqCst);
    let report = ingestor.finish().await;
    assert_eq!(report.submitted, 1);
    assert_eq!(report.discarded, 0);

    runtime.shutdown().await;
    assert_eq!(storage.inner.row_count(ServiceMetric::TYPE_TAG), 1);
}

#[tokio::test]
async fn test_collector_ingests_posted_segments() {
    let mut cfg = Config::default();
    cfg.cluster.self_address = "127.0.0.1:0".to_string();
    cfg.remote.listen_addr = "127.0.0.1:0".to_string();
    cfg.health.addr = "127.0.0.1:0".to_string();
    cfg.validate().expect("valid config");

    let storage = Arc::new(InMemoryStorage::new());
    let mut collector = Collector::new(cfg, Arc::clone(&storage)).expect("collector");
    collector.start().await.expect("start");
    let addr = collector.remote_addr().expect("bound");

    let now = clock::system_time_millis(SystemTime::now());
    let body = serde_json::to_string(&vec![segment("seg-3", now), segment("seg-4", now)])
        .expect("encode");
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/segments"))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .expect("post");
    assert!(resp.status().is_success());

    collector.stop().await.expect("stop");

    let application_id = storage
        .find_mapping("application", "shop")
        .await
        .expect("read")
        .expect("registered");
    let service_id = storage
        .find_mapping("service_name", &format!("{application_id}_/checkout"))
        .await
        .expect("read")
        .expect("registered");
    let bucket = clock::time_bucket(now - 80, Granularity::Minute);
    let id = ServiceMetric::from_call(service_id, application_id, bucket, 0, false, "").id();

    let metric = stored_metric(&storage, &id).await.expect("service row");
    assert_eq!(metric.calls, 2);
    assert_eq!(metric.duration_sum, 160);
    assert_eq!(storage.row_count(InstanceHeartbeat::TYPE_TAG), 1);
}
