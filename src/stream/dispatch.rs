use std::collections::HashMap;
use std::sync::Arc;

use super::{Envelope, GraphId, StageId};
use crate::cluster::RingRouter;
use crate::entity::Entity;
use crate::health::HealthMetrics;
use crate::remote::{RemoteMessage, RemoteSender};

/// Routes each record to the cluster node owning its routing key.
///
/// Records owned locally are returned for in-process delivery to the next
/// stage; the rest are grouped per owner and sent to the same stage id on
/// that node. Failed deliveries are dropped, since upstream keeps resending
/// the running total.
pub struct DispatchStage<E: Entity> {
    graph: GraphId,
    target: StageId,
    local: Arc<str>,
    router: Arc<RingRouter>,
    transport: Arc<dyn RemoteSender>,
    health: Arc<HealthMetrics>,
    _entity: std::marker::PhantomData<fn() -> E>,
}

/// Outcome of routing one batch.
pub struct RoutedBatch<E> {
    /// Records owned by this node.
    pub local: Vec<Envelope<E>>,
    /// Records handed to a remote node.
    pub sent: usize,
    /// Records lost to unreachable nodes or encoding failures.
    pub failed: usize,
}

impl<E: Entity> DispatchStage<E> {
    pub fn new(
        graph: GraphId,
        target: StageId,
        local: Arc<str>,
        router: Arc<RingRouter>,
        transport: Arc<dyn RemoteSender>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            graph,
            target,
            local,
            router,
            transport,
            health,
            _entity: std::marker::PhantomData,
        }
    }

    pub async fn route_batch(&self, batch: Vec<Envelope<E>>) -> RoutedBatch<E> {
        // Re-read membership for every batch.
        let ring = self.router.ring();

        let mut local = Vec::new();
        let mut remote: HashMap<String, Vec<RemoteMessage>> = HashMap::new();
        let mut failed = 0;

        for envelope in batch {
            let owner = ring.owner(&envelope.record.routing_key());
            match owner {
                Some(node) if node != &*self.local => {
                    match RemoteMessage::encode(self.graph, self.target, &envelope) {
                        Ok(message) => remote.entry(node.to_string()).or_default().push(message),
                        Err(e) => {
                            tracing::warn!(
                                graph = %self.graph,
                                error = %e,
                                "encoding remote record",
                            );
                            failed += 1;
                        }
                    }
                }
                // Owned here, or no membership known yet.
                _ => local.push(envelope),
            }
        }

        let mut sent = 0;
        for (node, messages) in remote {
            let count = messages.len();
            match self.transport.send(&node, messages).await {
                Ok(()) => {
                    sent += count;
                    self.health
                        .remote_messages
                        .with_label_values(&["sent"])
                        .inc_by(count as f64);
                }
                Err(e) => {
                    failed += count;
                    self.health
                        .remote_messages
                        .with_label_values(&["failed"])
                        .inc_by(count as f64);
                    tracing::warn!(
                        graph = %self.graph,
                        node = %node,
                        records = count,
                        error = %e,
                        "remote dispatch failed, dropping records",
                    );
                }
            }
        }

        RoutedBatch {
            local,
            sent,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{HashRing, StaticDirectory};
    use crate::entity::NodeReferenceMetric;
    use crate::remote::InProcessTransport;
    use crate::stream::StageKind;

    fn stage(
        local: &str,
        nodes: &[&str],
        transport: Arc<dyn RemoteSender>,
    ) -> DispatchStage<NodeReferenceMetric> {
        let directory = Arc::new(StaticDirectory::new(
            nodes.iter().map(|n| n.to_string()).collect(),
        ));
        let graph = GraphId(1);
        DispatchStage::new(
            graph,
            StageId::of(graph, StageKind::Persist),
            Arc::from(local),
            Arc::new(RingRouter::new(directory, 64, None)),
            transport,
            Arc::new(HealthMetrics::new(":0").expect("metrics")),
        )
    }

    fn batch() -> Vec<Envelope<NodeReferenceMetric>> {
        (0..200)
            .map(|front| Envelope {
                origin: Arc::from("a:1"),
                record: NodeReferenceMetric::from_call(front, 1, 201801011234, 5, false),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_node_keeps_everything_local() {
        let stage = stage("a:1", &["a:1"], Arc::new(InProcessTransport::new()));
        let routed = stage.route_batch(batch()).await;
        assert_eq!(routed.local.len(), 200);
        assert_eq!(routed.sent + routed.failed, 0);
    }

    #[tokio::test]
    async fn test_unreachable_owner_drops_only_its_records() {
        let stage = stage("a:1", &["a:1", "b:1"], Arc::new(InProcessTransport::new()));
        let ring = HashRing::new(&["a:1".to_string(), "b:1".to_string()], 64);
        let owned_by_b = batch()
            .iter()
            .filter(|e| ring.owner(&e.record.routing_key()) == Some("b:1"))
            .count();

        let routed = stage.route_batch(batch()).await;
        assert!(owned_by_b > 0);
        assert_eq!(routed.failed, owned_by_b);
        assert_eq!(routed.local.len(), 200 - owned_by_b);
        assert_eq!(routed.sent, 0);
    }
}
