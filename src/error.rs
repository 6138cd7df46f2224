//! Error taxonomy for the streaming core.
//!
//! Per-record failures are always recoverable: callers log, count and drop.
//! Only graph construction errors are fatal, and they surface at startup.

use thiserror::Error;

use crate::stream::{GraphId, StageId};

/// Errors raised while moving a single record through the pipeline.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("name {name:?} in namespace {namespace} is not registered yet")]
    TransientResolution {
        namespace: &'static str,
        name: String,
    },

    #[error("stage {stage} queue is saturated")]
    QueueSaturated { stage: StageId },

    #[error("remote node {node} unreachable: {reason}")]
    RemoteUnreachable { node: String, reason: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    #[error("unknown graph {0}")]
    UnknownGraph(GraphId),

    #[error("graph {graph} has no stage {stage}")]
    UnknownStage { graph: GraphId, stage: StageId },

    #[error("graph {graph} carries {expected}, message declares {actual}")]
    EntityTypeMismatch {
        graph: GraphId,
        expected: &'static str,
        actual: String,
    },

    #[error("decoding {entity_type} payload: {source}")]
    Decode {
        entity_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("pipeline is shutting down")]
    Closed,
}

impl StreamError {
    /// Short label used as the `reason` dimension on drop counters.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TransientResolution { .. } => "unresolved",
            Self::QueueSaturated { .. } => "queue_saturated",
            Self::RemoteUnreachable { .. } => "remote_unreachable",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::UnknownGraph(_) | Self::UnknownStage { .. } => "unknown_target",
            Self::EntityTypeMismatch { .. } => "type_mismatch",
            Self::Decode { .. } => "decode",
            Self::Closed => "closed",
        }
    }
}

/// Errors returned by storage engines.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("row {id} of {entity_type} is malformed: {reason}")]
    Malformed {
        entity_type: &'static str,
        id: String,
        reason: String,
    },
}

/// Configuration bugs detected while building a graph.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GraphBuildError {
    #[error("graph {0} has no stages")]
    Empty(GraphId),

    #[error("graph {graph}: stage {stage} follows a terminal persistence stage")]
    StageAfterTerminal { graph: GraphId, stage: StageId },

    #[error("graph {graph}: stage {stage} declared twice")]
    DuplicateStage { graph: GraphId, stage: StageId },

    #[error("graph {graph}: dispatch stage {stage} has no downstream stage to target")]
    DispatchWithoutTarget { graph: GraphId, stage: StageId },

    #[error("graph {0} is already registered")]
    DuplicateGraph(GraphId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_labels_are_stable() {
        let saturated = StreamError::QueueSaturated { stage: StageId(11) };
        assert_eq!(saturated.reason(), "queue_saturated");

        let storage = StreamError::from(StorageError::Unavailable("down".into()));
        assert_eq!(storage.reason(), "storage_unavailable");
        assert!(storage.to_string().contains("down"));
    }

    #[test]
    fn test_build_error_display_names_graph() {
        let err = GraphBuildError::DispatchWithoutTarget {
            graph: GraphId(3),
            stage: StageId(32),
        };
        let msg = err.to_string();
        assert!(msg.contains("graph 3"));
        assert!(msg.contains("32"));
    }
}
