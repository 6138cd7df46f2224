use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::queue::StageSender;
use super::runtime::StreamRuntime;
use super::{BoxFuture, Envelope, GraphId, PersistedHook, StageId, StageKind};
use crate::entity::Entity;
use crate::error::{GraphBuildError, StreamError};
use crate::health::HealthMetrics;
use crate::remote::RemoteMessage;
use crate::storage::Storage;

/// Type-erased entry into a graph for messages from other nodes.
pub trait RemoteInlet: Send + Sync + 'static {
    /// Type tag the graph accepts.
    fn entity_type(&self) -> &'static str;

    /// Decodes `message` and enqueues it at the stage it names.
    fn inject(&self, message: RemoteMessage) -> BoxFuture<'_, Result<(), StreamError>>;
}

struct GraphInlet<E: Entity> {
    graph: GraphId,
    stages: HashMap<StageId, StageSender<Envelope<E>>>,
}

impl<E: Entity> RemoteInlet for GraphInlet<E> {
    fn entity_type(&self) -> &'static str {
        E::TYPE_TAG
    }

    fn inject(&self, message: RemoteMessage) -> BoxFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            if message.entity_type != E::TYPE_TAG {
                return Err(StreamError::EntityTypeMismatch {
                    graph: self.graph,
                    expected: E::TYPE_TAG,
                    actual: message.entity_type,
                });
            }

            let sender = self
                .stages
                .get(&message.stage_id)
                .ok_or(StreamError::UnknownStage {
                    graph: self.graph,
                    stage: message.stage_id,
                })?;

            let envelope = message.decode::<E>()?;
            sender.send(envelope).await
        })
    }
}

/// Remote entry for a graph whose stages are fed through `stages`.
pub(crate) fn inlet<E: Entity>(
    graph: GraphId,
    stages: HashMap<StageId, StageSender<Envelope<E>>>,
) -> Arc<dyn RemoteInlet> {
    Arc::new(GraphInlet { graph, stages })
}

/// Graphs of this node, addressable by number from other nodes.
pub struct GraphRegistry {
    graphs: DashMap<GraphId, Arc<dyn RemoteInlet>>,
    health: Arc<HealthMetrics>,
}

impl GraphRegistry {
    pub fn new(health: Arc<HealthMetrics>) -> Self {
        Self {
            graphs: DashMap::new(),
            health,
        }
    }

    pub fn contains(&self, graph: GraphId) -> bool {
        self.graphs.contains_key(&graph)
    }

    /// Entity type tag registered for `graph`.
    pub fn entity_type(&self, graph: GraphId) -> Option<&'static str> {
        self.graphs.get(&graph).map(|inlet| inlet.entity_type())
    }

    pub(crate) fn register(
        &self,
        graph: GraphId,
        inlet: Arc<dyn RemoteInlet>,
    ) -> Result<(), GraphBuildError> {
        match self.graphs.entry(graph) {
            Entry::Occupied(_) => Err(GraphBuildError::DuplicateGraph(graph)),
            Entry::Vacant(slot) => {
                slot.insert(inlet);
                Ok(())
            }
        }
    }

    /// Feeds a message from another node into the stage it names.
    pub async fn deliver(&self, message: RemoteMessage) -> Result<(), StreamError> {
        let graph = message.graph_id;
        let inlet = self
            .graphs
            .get(&graph)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StreamError::UnknownGraph(graph))?;

        let result = inlet.inject(message).await;
        let outcome = if result.is_ok() { "received" } else { "rejected" };
        self.health
            .remote_messages
            .with_label_values(&[outcome])
            .inc();
        result
    }
}

/// Submits records into a graph's entry stage.
pub struct GraphHandle<E: Entity> {
    graph: GraphId,
    entry: StageSender<Envelope<E>>,
    origin: Arc<str>,
    health: Arc<HealthMetrics>,
}

impl<E: Entity> Clone for GraphHandle<E> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph,
            entry: self.entry.clone(),
            origin: Arc::clone(&self.origin),
            health: Arc::clone(&self.health),
        }
    }
}

impl<E: Entity> GraphHandle<E> {
    pub(crate) fn new(
        graph: GraphId,
        entry: StageSender<Envelope<E>>,
        origin: Arc<str>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            graph,
            entry,
            origin,
            health,
        }
    }

    pub fn id(&self) -> GraphId {
        self.graph
    }

    /// Records rejected by the entry stage's queue so far.
    pub fn dropped(&self) -> u64 {
        self.entry.dropped()
    }

    /// Enqueues one record at the entry stage.
    pub async fn submit(&self, record: E) -> Result<(), StreamError> {
        self.health
            .records_submitted
            .with_label_values(&[E::TYPE_TAG])
            .inc();

        let envelope = Envelope {
            origin: Arc::clone(&self.origin),
            record,
        };

        let result = self.entry.send(envelope).await;
        if let Err(e) = &result {
            self.health
                .records_dropped
                .with_label_values(&[E::TYPE_TAG, &self.entry.stage().to_string(), e.reason()])
                .inc();
        }
        result
    }

    /// Enqueues every record, returning how many were accepted.
    pub async fn submit_all(&self, records: impl IntoIterator<Item = E>) -> usize {
        let mut accepted = 0;
        let mut rejected = 0;

        for record in records {
            match self.submit(record).await {
                Ok(()) => accepted += 1,
                Err(_) => rejected += 1,
            }
        }

        if rejected > 0 {
            tracing::warn!(
                graph = %self.graph,
                entity = E::TYPE_TAG,
                rejected,
                "graph entry rejected records",
            );
        }
        accepted
    }
}

/// Declarative construction of one graph.
///
/// ```ignore
/// let handle = runtime
///     .create_graph::<ServiceMetric>(GraphId(2))
///     .add_node(StageKind::Aggregate)
///     .add_next(StageKind::Dispatch)
///     .add_next(StageKind::Persist)
///     .build()?;
/// ```
///
/// Every stage carries the graph's entity type, so stage inputs and outputs
/// match by construction. Ordering mistakes are rejected by [`build`].
///
/// [`build`]: GraphBuilder::build
pub struct GraphBuilder<'a, S: Storage, E: Entity> {
    runtime: &'a mut StreamRuntime<S>,
    graph: GraphId,
    kinds: Vec<StageKind>,
    hook: Option<PersistedHook<E>>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, S: Storage, E: Entity> GraphBuilder<'a, S, E> {
    pub(crate) fn new(runtime: &'a mut StreamRuntime<S>, graph: GraphId) -> Self {
        Self {
            runtime,
            graph,
            kinds: Vec::new(),
            hook: None,
            _entity: PhantomData,
        }
    }

    /// Sets the entry stage, discarding any stages added before.
    pub fn add_node(mut self, kind: StageKind) -> Self {
        self.kinds.clear();
        self.kinds.push(kind);
        self
    }

    /// Appends a stage fed by the previous one.
    pub fn add_next(mut self, kind: StageKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Runs `hook` with the merged rows after each successful flush.
    pub fn on_persisted(mut self, hook: PersistedHook<E>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Validates the chain, spawns one worker per stage and registers the
    /// graph for remote delivery.
    pub fn build(self) -> Result<GraphHandle<E>, GraphBuildError> {
        validate_stages(self.graph, &self.kinds)?;
        if self.runtime.registry().contains(self.graph) {
            return Err(GraphBuildError::DuplicateGraph(self.graph));
        }
        self.runtime.install(self.graph, &self.kinds, self.hook)
    }
}

/// Checks stage ordering for one graph.
pub(crate) fn validate_stages(graph: GraphId, kinds: &[StageKind]) -> Result<(), GraphBuildError> {
    if kinds.is_empty() {
        return Err(GraphBuildError::Empty(graph));
    }

    let mut seen = Vec::with_capacity(kinds.len());
    for (pos, kind) in kinds.iter().enumerate() {
        let stage = StageId::of(graph, *kind);

        if seen.contains(kind) {
            return Err(GraphBuildError::DuplicateStage { graph, stage });
        }
        if seen.contains(&StageKind::Persist) {
            return Err(GraphBuildError::StageAfterTerminal { graph, stage });
        }
        if *kind == StageKind::Dispatch && pos + 1 == kinds.len() {
            return Err(GraphBuildError::DispatchWithoutTarget { graph, stage });
        }

        seen.push(*kind);
    }

    Ok(())
}
