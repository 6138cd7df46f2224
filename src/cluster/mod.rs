//! Cluster membership as consumed by remote dispatch.
//!
//! Membership discovery is external: something keeps a [`NodeDirectory`]
//! current, and dispatch re-reads it on every batch through [`RingRouter`].

pub mod ring;

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::health::HealthMetrics;

pub use ring::HashRing;

/// Source of the live cluster address list.
pub trait NodeDirectory: Send + Sync + 'static {
    /// Current addresses. Implementations may change the list at any time.
    fn current_nodes(&self) -> Arc<Vec<String>>;
}

/// Directory holding an address list replaced wholesale by an external
/// coordinator.
pub struct StaticDirectory {
    nodes: ArcSwap<Vec<String>>,
}

impl StaticDirectory {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes: ArcSwap::from_pointee(nodes),
        }
    }

    /// Replaces the address list.
    pub fn update(&self, nodes: Vec<String>) {
        tracing::info!(nodes = nodes.len(), "cluster directory updated");
        self.nodes.store(Arc::new(nodes));
    }
}

impl NodeDirectory for StaticDirectory {
    fn current_nodes(&self) -> Arc<Vec<String>> {
        self.nodes.load_full()
    }
}

/// Hash ring kept in step with a directory.
///
/// The ring is rebuilt whenever the directory hands out a different list, so
/// no lookup uses a membership snapshot older than the call.
pub struct RingRouter {
    directory: Arc<dyn NodeDirectory>,
    virtual_nodes: usize,
    cached: Mutex<Option<(Arc<Vec<String>>, Arc<HashRing>)>>,
    health: Option<Arc<HealthMetrics>>,
}

impl RingRouter {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        virtual_nodes: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            directory,
            virtual_nodes,
            cached: Mutex::new(None),
            health,
        }
    }

    /// Ring for the directory's current membership.
    pub fn ring(&self) -> Arc<HashRing> {
        let nodes = self.directory.current_nodes();
        let mut cached = self.cached.lock();

        if let Some((seen, ring)) = cached.as_ref() {
            if Arc::ptr_eq(seen, &nodes) {
                return Arc::clone(ring);
            }
        }

        let ring = Arc::new(HashRing::new(&nodes, self.virtual_nodes));
        if let Some(health) = &self.health {
            health.cluster_nodes.set(ring.nodes().len() as f64);
        }
        tracing::debug!(nodes = ring.nodes().len(), "hash ring rebuilt");

        *cached = Some((nodes, Arc::clone(&ring)));
        ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_follows_directory_updates() {
        let directory = Arc::new(StaticDirectory::new(vec!["a:1".to_string()]));
        let router = RingRouter::new(directory.clone(), 32, None);

        let first = router.ring();
        assert!(Arc::ptr_eq(&first, &router.ring()));
        assert_eq!(first.owner("k"), Some("a:1"));

        directory.update(vec!["b:1".to_string()]);
        let second = router.ring();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.owner("k"), Some("b:1"));
    }
}
