//! Streaming aggregation pipeline.
//!
//! A graph is a chain of stages for one entity type:
//!
//! ```text
//! submit -> [aggregate] -> [dispatch] --local--> [persist] <- flush timer
//!                                     \--remote--> owning node's [persist]
//! ```
//!
//! Every stage owns one bounded queue drained by one worker task, so stage
//! state is never shared between tasks. Stages are addressed by a numeric
//! [`StageId`] derived from the graph id and stage kind, which lets a remote
//! node feed the matching stage of its own graph instance.

pub mod aggregation;
pub mod dispatch;
pub mod flush;
pub mod graph;
pub mod persistence;
pub mod queue;
pub mod runtime;
pub mod worker;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use graph::{GraphBuilder, GraphHandle, GraphRegistry};
pub use persistence::PersistedHook;
pub use queue::QueuePolicy;
pub use runtime::{StreamOptions, StreamRuntime};

/// Boxed future used at dynamically dispatched seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identifies a graph across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub u16);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a stage across the cluster: `graph * 10 + kind code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub u32);

impl StageId {
    pub fn of(graph: GraphId, kind: StageKind) -> Self {
        Self(u32::from(graph.0) * 10 + kind.code())
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of stage variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Aggregate,
    Dispatch,
    Persist,
}

impl StageKind {
    /// Drain order on shutdown, upstream first.
    pub const TOPOLOGICAL: [StageKind; 3] = [Self::Aggregate, Self::Dispatch, Self::Persist];

    pub fn code(self) -> u32 {
        match self {
            Self::Aggregate => 1,
            Self::Dispatch => 2,
            Self::Persist => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::Dispatch => "dispatch",
            Self::Persist => "persist",
        }
    }
}

/// A record in flight plus the node whose aggregation produced it.
#[derive(Debug, Clone)]
pub struct Envelope<E> {
    pub origin: Arc<str>,
    pub record: E,
}
