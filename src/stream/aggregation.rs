use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use super::Envelope;
use crate::clock;
use crate::entity::Entity;

/// Minimum spacing between sweeps for keys that fell out of the window.
const EVICT_EVERY: Duration = Duration::from_secs(30);

/// In-memory accumulation keyed by entity id (identity plus time bucket).
///
/// Owned by exactly one worker, so the map is never shared. Every accepted
/// record yields the key's running total, which the worker forwards
/// downstream as a standing snapshot.
pub struct AggregationStage<E: Entity> {
    window: Duration,
    totals: HashMap<String, E>,
    last_eviction: SystemTime,
}

/// Result of folding a batch.
pub struct AggregatedBatch<E> {
    /// One snapshot per accepted record, in arrival order.
    pub snapshots: Vec<Envelope<E>>,
    /// Records rejected because their bucket is older than the window.
    pub late: usize,
}

impl<E: Entity> AggregationStage<E> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            totals: HashMap::new(),
            last_eviction: SystemTime::UNIX_EPOCH,
        }
    }

    /// Folds `record` into its key's total and returns the new total.
    ///
    /// Returns `None` for late records.
    pub fn accept(&mut self, record: E, now: SystemTime) -> Option<E> {
        if clock::is_expired(record.time_bucket(), now, self.window) {
            return None;
        }

        let total = match self.totals.entry(record.id()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().merge(&record);
                slot.get().clone()
            }
            Entry::Vacant(slot) => slot.insert(record).clone(),
        };

        Some(total)
    }

    /// Folds a batch, evicting expired keys at most every [`EVICT_EVERY`].
    pub fn accept_batch(&mut self, batch: Vec<Envelope<E>>, now: SystemTime) -> AggregatedBatch<E> {
        self.maybe_evict(now);

        let mut snapshots = Vec::with_capacity(batch.len());
        let mut late = 0;

        for envelope in batch {
            match self.accept(envelope.record, now) {
                Some(total) => snapshots.push(Envelope {
                    origin: envelope.origin,
                    record: total,
                }),
                None => late += 1,
            }
        }

        AggregatedBatch { snapshots, late }
    }

    fn maybe_evict(&mut self, now: SystemTime) {
        let due = now
            .duration_since(self.last_eviction)
            .map_or(true, |elapsed| elapsed >= EVICT_EVERY);
        if due {
            let evicted = self.evict_expired(now);
            if evicted > 0 {
                tracing::debug!(evicted, entity = E::TYPE_TAG, "evicted aggregation keys");
            }
            self.last_eviction = now;
        }
    }

    /// Drops keys whose bucket left the window. Returns how many were removed.
    pub fn evict_expired(&mut self, now: SystemTime) -> usize {
        let before = self.totals.len();
        let window = self.window;
        self.totals
            .retain(|_, total| !clock::is_expired(total.time_bucket(), now, window));
        before - self.totals.len()
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.totals.get(id)
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}
