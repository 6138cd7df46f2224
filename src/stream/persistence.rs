use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use super::{BoxFuture, Envelope, GraphId};
use crate::clock;
use crate::entity::{Entity, MergeMode};
use crate::error::StreamError;
use crate::storage::{decode_row, encode_row, Storage};

/// Called with the merged rows after every successful flush.
pub type PersistedHook<E> = Arc<dyn Fn(Vec<E>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Buffer key: producing node plus entity id.
type BufferKey = (Arc<str>, String);

/// Baselines outlive the aggregation window by this factor, so a snapshot
/// accepted just inside the window still finds its baseline at flush time.
const BASELINE_RETENTION_FACTOR: u32 = 2;

/// Latest snapshot per (origin, id), merged into storage on every flush tick.
///
/// Snapshots are running totals, so a buffered entry is overwritten rather
/// than summed and redelivery is idempotent. For additive entities the flush
/// writes only the growth since the last snapshot it persisted for the same
/// origin, so storage accumulates every origin's contribution exactly once.
pub struct PersistenceStage<E: Entity> {
    graph: GraphId,
    window: Duration,
    batch_size: usize,
    buffer: Mutex<HashMap<BufferKey, E>>,
    /// Last persisted snapshot per key. The lock also serializes flushes.
    baselines: tokio::sync::Mutex<HashMap<BufferKey, E>>,
}

impl<E: Entity> PersistenceStage<E> {
    pub fn new(graph: GraphId, window: Duration, batch_size: usize) -> Self {
        Self {
            graph,
            window,
            batch_size: batch_size.max(1),
            buffer: Mutex::new(HashMap::new()),
            baselines: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }

    /// Buffers a batch of snapshots and returns how many were late.
    ///
    /// Snapshots whose bucket left the window are dropped, so every snapshot
    /// that reaches a flush still has its baseline. Never blocks on storage.
    pub fn accept_batch(&self, batch: Vec<Envelope<E>>, now: SystemTime) -> usize {
        let mut late = 0;
        let mut buffer = self.buffer.lock();
        for envelope in batch {
            if clock::is_expired(envelope.record.time_bucket(), now, self.window) {
                late += 1;
                continue;
            }
            buffer.insert((envelope.origin, envelope.record.id()), envelope.record);
        }
        late
    }

    /// Currently buffered snapshot for `(origin, id)`.
    pub fn buffered(&self, origin: &str, id: &str) -> Option<E> {
        let key: BufferKey = (Arc::from(origin), id.to_string());
        self.buffer.lock().get(&key).cloned()
    }

    /// Number of buffered entries.
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    fn baseline_retention(&self) -> Duration {
        self.window * BASELINE_RETENTION_FACTOR
    }

    /// Merges the buffer into storage and returns the rows written.
    ///
    /// The buffer is swapped out first, so records accepted during the flush
    /// land in the next tick. On error the swapped-out snapshots are
    /// discarded; baselines of rows already written are kept so a later
    /// snapshot recovers the difference.
    pub async fn flush<S: Storage>(
        &self,
        storage: &S,
        now: SystemTime,
    ) -> Result<Vec<E>, StreamError> {
        let mut baselines = self.baselines.lock().await;
        let retention = self.baseline_retention();

        let mut drained: Vec<(BufferKey, E)> = std::mem::take(&mut *self.buffer.lock())
            .into_iter()
            .collect();
        drained.retain(|(_, snapshot)| !clock::is_expired(snapshot.time_bucket(), now, retention));

        let result = if drained.is_empty() {
            Ok(Vec::new())
        } else {
            self.write(storage, drained, &mut baselines).await
        };

        baselines.retain(|_, base| !clock::is_expired(base.time_bucket(), now, retention));

        result
    }

    async fn write<S: Storage>(
        &self,
        storage: &S,
        drained: Vec<(BufferKey, E)>,
        baselines: &mut HashMap<BufferKey, E>,
    ) -> Result<Vec<E>, StreamError> {
        // Group snapshots by id so each row is read and written once.
        let mut by_id: HashMap<String, Vec<(Arc<str>, E)>> = HashMap::new();
        for ((origin, id), snapshot) in drained {
            by_id.entry(id).or_default().push((origin, snapshot));
        }

        let mut ids: Vec<String> = by_id.keys().cloned().collect();
        ids.sort();

        let mut written = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.batch_size) {
            let stored = match E::MERGE_MODE {
                MergeMode::Additive => storage.get_by_ids(E::TYPE_TAG, chunk).await?,
                MergeMode::Replace => HashMap::new(),
            };

            let mut rows = Vec::with_capacity(chunk.len());
            let mut merged = Vec::with_capacity(chunk.len());
            for id in chunk {
                let Some(snapshots) = by_id.get(id) else {
                    continue;
                };
                let Some(mut value) = combine(id, snapshots, baselines) else {
                    continue;
                };

                if let Some(row) = stored.get(id) {
                    match decode_row::<E>(id, row.clone()) {
                        Ok(mut existing) => {
                            existing.merge(&value);
                            value = existing;
                        }
                        Err(e) => {
                            tracing::warn!(
                                graph = %self.graph,
                                error = %e,
                                "overwriting unreadable row",
                            );
                        }
                    }
                }

                rows.push((id.clone(), encode_row(&value)?));
                merged.push(value);
            }

            storage.batch_upsert(E::TYPE_TAG, rows).await?;

            if E::MERGE_MODE == MergeMode::Additive {
                for id in chunk {
                    if let Some(snapshots) = by_id.remove(id) {
                        for (origin, snapshot) in snapshots {
                            baselines.insert((origin, id.clone()), snapshot);
                        }
                    }
                }
            }
            written.extend(merged);
        }

        Ok(written)
    }
}

/// Folds every origin's contribution for one id.
fn combine<E: Entity>(
    id: &str,
    snapshots: &[(Arc<str>, E)],
    baselines: &HashMap<BufferKey, E>,
) -> Option<E> {
    let mut combined: Option<E> = None;

    for (origin, snapshot) in snapshots {
        let contribution = match E::MERGE_MODE {
            MergeMode::Additive => {
                let key: BufferKey = (Arc::clone(origin), id.to_string());
                match baselines.get(&key) {
                    Some(base) => snapshot.delta_since(base),
                    None => snapshot.clone(),
                }
            }
            MergeMode::Replace => snapshot.clone(),
        };

        combined = Some(match combined.take() {
            Some(mut acc) => {
                acc.merge(&contribution);
                acc
            }
            None => contribution,
        });
    }

    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{InstanceHeartbeat, ServiceMetric};
    use crate::storage::InMemoryStorage;

    const BUCKET: u64 = 201801011234;

    fn now() -> SystemTime {
        let millis = clock::bucket_start_millis(BUCKET).expect("bucket");
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis as u64 + 30_000)
    }

    fn stage<E: Entity>() -> PersistenceStage<E> {
        PersistenceStage::new(GraphId(2), Duration::from_secs(600), 2)
    }

    fn snapshot(origin: &str, calls: i64, errors: i64) -> Envelope<ServiceMetric> {
        let mut metric = ServiceMetric::from_call(7, 1, BUCKET, 10, false, "t-1");
        metric.calls = calls;
        metric.error_calls = errors;
        metric.duration_sum = calls * 10;
        Envelope {
            origin: Arc::from(origin),
            record: metric,
        }
    }

    async fn stored(storage: &InMemoryStorage, id: &str) -> ServiceMetric {
        let row = storage
            .get_by_id(ServiceMetric::TYPE_TAG, id)
            .await
            .expect("read")
            .expect("row present");
        decode_row(id, row).expect("decode")
    }

    #[tokio::test]
    async fn test_redelivered_snapshot_is_idempotent() {
        let stage = stage::<ServiceMetric>();
        stage.accept_batch(vec![snapshot("a", 5, 1)], now());
        let once = stage.buffered("a", &snapshot("a", 5, 1).record.id());

        stage.accept_batch(vec![snapshot("a", 5, 1)], now());
        let twice = stage.buffered("a", &snapshot("a", 5, 1).record.id());

        assert_eq!(once, twice);
        assert_eq!(stage.buffered_len(), 1);
    }

    #[tokio::test]
    async fn test_flush_merges_growth_across_ticks_and_origins() {
        let storage = InMemoryStorage::new();
        let stage = stage::<ServiceMetric>();
        let id = snapshot("a", 0, 0).record.id();

        stage.accept_batch(vec![snapshot("a", 3, 0), snapshot("a", 5, 1)], now());
        stage.accept_batch(vec![snapshot("b", 2, 0)], now());
        let written = stage.flush(&storage, now()).await.expect("flush");
        assert_eq!(written.len(), 1);
        assert_eq!(stored(&storage, &id).await.calls, 7);

        // Origin a's running total grows to 9; only the growth is added.
        stage.accept_batch(vec![snapshot("a", 9, 2)], now());
        stage.flush(&storage, now()).await.expect("flush");

        let row = stored(&storage, &id).await;
        assert_eq!(row.calls, 11);
        assert_eq!(row.error_calls, 2);
        assert_eq!(row.duration_sum, 110);
    }

    #[tokio::test]
    async fn test_empty_flush_writes_nothing() {
        let storage = InMemoryStorage::new();
        let stage = stage::<ServiceMetric>();
        let written = stage.flush(&storage, now()).await.expect("flush");
        assert!(written.is_empty());
        assert_eq!(storage.row_count(ServiceMetric::TYPE_TAG), 0);
    }

    #[tokio::test]
    async fn test_replace_entities_overwrite_stored_rows() {
        let storage = InMemoryStorage::new();
        let stage = stage::<InstanceHeartbeat>();
        let beat = |time| Envelope {
            origin: Arc::from("a"),
            record: InstanceHeartbeat {
                instance_id: 4,
                application_id: 1,
                time_bucket: 20180101,
                heartbeat_time: time,
            },
        };

        stage.accept_batch(vec![beat(100)], now());
        stage.flush(&storage, now()).await.expect("flush");
        stage.accept_batch(vec![beat(250)], now());
        stage.flush(&storage, now()).await.expect("flush");

        let row = storage
            .get_by_id(InstanceHeartbeat::TYPE_TAG, "20180101_4")
            .await
            .expect("read")
            .expect("present");
        let beat: InstanceHeartbeat = decode_row("20180101_4", row).expect("decode");
        assert_eq!(beat.heartbeat_time, 250);
    }

    #[tokio::test]
    async fn test_late_snapshot_is_not_counted_twice() {
        let storage = InMemoryStorage::new();
        let stage = stage::<ServiceMetric>();
        let id = snapshot("a", 0, 0).record.id();
        let later = |minutes: u64| now() + Duration::from_secs(minutes * 60);

        stage.accept_batch(vec![snapshot("a", 3, 0)], now());
        stage.flush(&storage, now()).await.expect("flush");

        // Accepted just inside the window, flushed after it closed.
        assert_eq!(stage.accept_batch(vec![snapshot("a", 4, 0)], later(9)), 0);
        stage.flush(&storage, later(11)).await.expect("flush");
        assert_eq!(stored(&storage, &id).await.calls, 4);

        // A snapshot arriving once the bucket is out of the window is late.
        assert_eq!(stage.accept_batch(vec![snapshot("a", 5, 0)], later(11)), 1);
        assert_eq!(stage.buffered_len(), 0);
        stage.flush(&storage, later(11)).await.expect("flush");
        assert_eq!(stored(&storage, &id).await.calls, 4);
    }

    #[tokio::test]
    async fn test_snapshot_accepted_during_flush_lands_in_next_tick() {
        let storage = Arc::new(InMemoryStorage::new());
        let stage = Arc::new(stage::<ServiceMetric>());
        let id = snapshot("a", 0, 0).record.id();

        stage.accept_batch(vec![snapshot("a", 2, 0)], now());
        let writer = {
            let stage = Arc::clone(&stage);
            tokio::spawn(async move {
                for calls in 3..=50 {
                    stage.accept_batch(vec![snapshot("a", calls, 0)], now());
                    tokio::task::yield_now().await;
                }
            })
        };
        while !writer.is_finished() {
            stage.flush(&*storage, now()).await.expect("flush");
            tokio::task::yield_now().await;
        }
        writer.await.expect("writer");
        stage.flush(&*storage, now()).await.expect("flush");

        // The last running total always reaches storage.
        assert_eq!(stored(&storage, &id).await.calls, 50);
        assert_eq!(stage.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_flush_chunks_by_batch_size() {
        let storage = InMemoryStorage::new();
        let stage = stage::<ServiceMetric>();
        let batch: Vec<_> = (0..5)
            .map(|service| Envelope {
                origin: Arc::from("a"),
                record: ServiceMetric::from_call(service, 1, BUCKET, 5, false, "t"),
            })
            .collect();

        stage.accept_batch(batch, now());
        let written = stage.flush(&storage, now()).await.expect("flush");
        assert_eq!(written.len(), 5);
        assert_eq!(storage.row_count(ServiceMetric::TYPE_TAG), 5);
    }
}
