//! Inter-node transport for dispatched records.
//!
//! A dispatched record travels as a [`RemoteMessage`] naming the target graph
//! and stage by number, so the receiver resolves it against its own
//! [`GraphRegistry`] without shared process state.

pub mod client;
pub mod server;

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::StreamError;
use crate::stream::{BoxFuture, Envelope, GraphId, GraphRegistry, StageId};

pub use client::HttpRemoteClient;
pub use server::{RemoteServer, SegmentSink};

/// Path of the inter-node endpoint.
pub const REMOTE_PATH: &str = "/remote";

/// One dispatched record on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub graph_id: GraphId,
    pub stage_id: StageId,
    pub entity_type: String,
    pub origin: String,
    pub payload: serde_json::Value,
}

impl RemoteMessage {
    /// Wraps an envelope for delivery to `stage` of `graph` on another node.
    pub fn encode<E: Entity>(
        graph: GraphId,
        stage: StageId,
        envelope: &Envelope<E>,
    ) -> Result<Self, StreamError> {
        let payload = serde_json::to_value(&envelope.record).map_err(|source| {
            StreamError::Decode {
                entity_type: E::TYPE_TAG,
                source,
            }
        })?;

        Ok(Self {
            graph_id: graph,
            stage_id: stage,
            entity_type: E::TYPE_TAG.to_string(),
            origin: envelope.origin.to_string(),
            payload,
        })
    }

    /// Recovers the envelope. The caller has already checked the type tag.
    pub fn decode<E: Entity>(self) -> Result<Envelope<E>, StreamError> {
        let record = serde_json::from_value(self.payload).map_err(|source| StreamError::Decode {
            entity_type: E::TYPE_TAG,
            source,
        })?;

        Ok(Envelope {
            origin: Arc::from(self.origin),
            record,
        })
    }
}

/// Delivers messages to another cluster node.
pub trait RemoteSender: Send + Sync + 'static {
    /// Sends `messages` to `node`. All messages share the outcome.
    fn send<'a>(
        &'a self,
        node: &'a str,
        messages: Vec<RemoteMessage>,
    ) -> BoxFuture<'a, Result<(), StreamError>>;
}

/// Transport that hands messages straight to registries in this process.
///
/// Nodes are registered by address; sending to an unregistered address fails
/// like an unreachable node.
#[derive(Default)]
pub struct InProcessTransport {
    peers: DashMap<String, Arc<GraphRegistry>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `registry` reachable under `address`.
    pub fn attach(&self, address: &str, registry: Arc<GraphRegistry>) {
        self.peers.insert(address.to_string(), registry);
    }

    /// Makes `address` unreachable.
    pub fn detach(&self, address: &str) {
        self.peers.remove(address);
    }
}

impl RemoteSender for InProcessTransport {
    fn send<'a>(
        &'a self,
        node: &'a str,
        messages: Vec<RemoteMessage>,
    ) -> BoxFuture<'a, Result<(), StreamError>> {
        Box::pin(async move {
            let registry = self
                .peers
                .get(node)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| StreamError::RemoteUnreachable {
                    node: node.to_string(),
                    reason: "not attached".to_string(),
                })?;

            for message in messages {
                if let Err(e) = registry.deliver(message).await {
                    tracing::debug!(node, error = %e, "in-process delivery rejected");
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NodeReferenceMetric;

    #[test]
    fn test_message_carries_type_tag_and_origin() {
        let envelope = Envelope {
            origin: Arc::from("10.0.0.1:11800"),
            record: NodeReferenceMetric::from_call(1, 2, 201801011234, 30, false),
        };
        let message = RemoteMessage::encode(GraphId(1), StageId(13), &envelope).expect("encode");

        assert_eq!(message.entity_type, "node_reference_metric");
        assert_eq!(message.stage_id, StageId(13));

        let line = serde_json::to_string(&message).expect("serialize");
        assert!(line.contains("\"graph_id\":1"));

        let back: Envelope<NodeReferenceMetric> = message.decode().expect("decode");
        assert_eq!(&*back.origin, "10.0.0.1:11800");
        assert_eq!(back.record, envelope.record);
    }

    #[test]
    fn test_decode_rejects_foreign_payload() {
        let message = RemoteMessage {
            graph_id: GraphId(1),
            stage_id: StageId(13),
            entity_type: "node_reference_metric".to_string(),
            origin: "x".to_string(),
            payload: serde_json::json!({"calls": 3}),
        };
        let err = message
            .decode::<NodeReferenceMetric>()
            .expect_err("should fail");
        assert_eq!(err.reason(), "decode");
    }

    #[tokio::test]
    async fn test_in_process_transport_fails_for_unknown_node() {
        let transport = InProcessTransport::new();
        let err = transport
            .send("nowhere:1", Vec::new())
            .await
            .expect_err("unattached");
        assert_eq!(err.reason(), "remote_unreachable");
    }
}
