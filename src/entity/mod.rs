//! Aggregatable telemetry entities.
//!
//! Every entity carries its own identity (subject ids plus time bucket) and a
//! commutative, associative merge. The stream stages are generic over
//! [`Entity`] and never inspect fields directly.

pub mod alarm;
pub mod instance;
pub mod node_reference;
pub mod service_metric;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use alarm::Alarm;
pub use instance::InstanceHeartbeat;
pub use node_reference::NodeReferenceMetric;
pub use service_metric::ServiceMetric;

/// How buffered values combine with the row already in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Counters accumulate across flush cycles.
    Additive,
    /// The newest value replaces the stored row.
    Replace,
}

/// Contract for records flowing through a graph.
pub trait Entity: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Tag carried on the wire and used as the storage table name.
    const TYPE_TAG: &'static str;

    /// Storage semantics across flush cycles.
    const MERGE_MODE: MergeMode;

    /// Aggregation key: identity plus time bucket.
    fn id(&self) -> String;

    /// Encoded time bucket (see [`crate::clock`]).
    fn time_bucket(&self) -> u64;

    /// Key hashed onto the cluster ring to find the owning node.
    fn routing_key(&self) -> String {
        self.id()
    }

    /// Folds `other` (same id) into `self`.
    fn merge(&mut self, other: &Self);

    /// Portion of `self` not yet contained in `base`, an earlier snapshot of
    /// the same running total.
    ///
    /// Idempotent fields (max, min, bounded top-N) are carried whole. When a
    /// counter went backwards the running total was restarted and `self` is
    /// returned unchanged.
    fn delta_since(&self, base: &Self) -> Self {
        let _ = base;
        self.clone()
    }
}

/// `a - b` for running counters, or `None` when `a` restarted below `b`.
pub(crate) fn counter_delta(a: i64, b: i64) -> Option<i64> {
    if a < b {
        None
    } else {
        Some(a - b)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Entity;

    /// Merges `items` in the given order starting from the first element.
    pub fn fold<E: Entity>(items: &[E]) -> Option<E> {
        let mut iter = items.iter();
        let mut acc = iter.next()?.clone();
        for item in iter {
            acc.merge(item);
        }
        Some(acc)
    }
}
