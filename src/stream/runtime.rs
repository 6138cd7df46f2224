use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::aggregation::AggregationStage;
use super::dispatch::DispatchStage;
use super::flush::{FlushReport, FlushTargets, FlushTimer, PersistBinding};
use super::graph::{GraphBuilder, GraphHandle, GraphRegistry};
use super::persistence::{PersistedHook, PersistenceStage};
use super::queue::{stage_queue, QueuePolicy, StageSender};
use super::worker::{Stage, StageWorker};
use super::{Envelope, GraphId, StageId, StageKind};
use crate::cluster::{RingRouter, StaticDirectory};
use crate::config::Config;
use crate::entity::Entity;
use crate::error::GraphBuildError;
use crate::health::HealthMetrics;
use crate::remote::{InProcessTransport, RemoteSender};
use crate::storage::Storage;

/// Address used by a runtime with no cluster.
const STANDALONE_ADDRESS: &str = "local";

/// Tunables shared by every graph of a runtime.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub queue_capacity: usize,
    pub queue_policy: QueuePolicy,
    pub aggregation_window: Duration,
    pub flush_interval: Duration,
    pub flush_batch_size: usize,
    pub shutdown_timeout: Duration,
}

impl StreamOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            queue_capacity: cfg.stream.queue_capacity,
            queue_policy: QueuePolicy::from(&cfg.stream),
            aggregation_window: cfg.stream.aggregation_window,
            flush_interval: cfg.persistence.flush_interval,
            flush_batch_size: cfg.persistence.batch_size,
            shutdown_timeout: cfg.persistence.shutdown_timeout,
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            queue_policy: QueuePolicy::Drop,
            aggregation_window: Duration::from_secs(600),
            flush_interval: Duration::from_secs(3),
            flush_batch_size: 2000,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

struct WorkerTask {
    graph: GraphId,
    kind: StageKind,
    closed: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every graph of one node: stage workers, the registry used for
/// remote delivery and the flush timer.
///
/// Graphs may be built before or after [`start`](Self::start); the timer
/// flushes every persistence stage registered by the time of each tick.
pub struct StreamRuntime<S: Storage> {
    options: StreamOptions,
    storage: Arc<S>,
    local: Arc<str>,
    router: Arc<RingRouter>,
    transport: Arc<dyn RemoteSender>,
    registry: Arc<GraphRegistry>,
    health: Arc<HealthMetrics>,
    flush_targets: FlushTargets,
    workers: Vec<WorkerTask>,
    timer: Option<(CancellationToken, JoinHandle<()>)>,
}

impl<S: Storage> StreamRuntime<S> {
    pub fn new(
        options: StreamOptions,
        storage: Arc<S>,
        local_address: &str,
        router: Arc<RingRouter>,
        transport: Arc<dyn RemoteSender>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            options,
            storage,
            local: Arc::from(local_address),
            router,
            transport,
            registry: Arc::new(GraphRegistry::new(Arc::clone(&health))),
            health,
            flush_targets: FlushTargets::new(),
            workers: Vec::new(),
            timer: None,
        }
    }

    /// Runtime for a single node: every record is owned locally.
    pub fn standalone(options: StreamOptions, storage: Arc<S>, health: Arc<HealthMetrics>) -> Self {
        let directory = Arc::new(StaticDirectory::new(vec![STANDALONE_ADDRESS.to_string()]));
        let router = Arc::new(RingRouter::new(directory, 1, None));
        Self::new(
            options,
            storage,
            STANDALONE_ADDRESS,
            router,
            Arc::new(InProcessTransport::new()),
            health,
        )
    }

    /// Starts declaring a graph carrying `E`.
    pub fn create_graph<E: Entity>(&mut self, graph: GraphId) -> GraphBuilder<'_, S, E> {
        GraphBuilder::new(self, graph)
    }

    pub fn registry(&self) -> &Arc<GraphRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn local_address(&self) -> &str {
        &self.local
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Creates queues and workers for a validated stage chain.
    pub(crate) fn install<E: Entity>(
        &mut self,
        graph: GraphId,
        kinds: &[StageKind],
        mut hook: Option<PersistedHook<E>>,
    ) -> Result<GraphHandle<E>, GraphBuildError> {
        let mut senders: Vec<StageSender<Envelope<E>>> = Vec::with_capacity(kinds.len());
        let mut receivers = Vec::with_capacity(kinds.len());
        let mut tokens = Vec::with_capacity(kinds.len());

        for kind in kinds {
            let closed = CancellationToken::new();
            let (tx, rx) = stage_queue(
                StageId::of(graph, *kind),
                self.options.queue_capacity,
                self.options.queue_policy,
                closed.clone(),
            );
            senders.push(tx);
            receivers.push(rx);
            tokens.push(closed);
        }

        let inlet_stages: HashMap<StageId, StageSender<Envelope<E>>> = senders
            .iter()
            .map(|tx| (tx.stage(), tx.clone()))
            .collect();
        self.registry
            .register(graph, super::graph::inlet(graph, inlet_stages))?;

        for (pos, (rx, closed)) in receivers.into_iter().zip(tokens).enumerate() {
            let kind = kinds[pos];
            let stage_id = StageId::of(graph, kind);

            let stage = match kind {
                StageKind::Aggregate => {
                    Stage::Aggregate(AggregationStage::new(self.options.aggregation_window))
                }
                StageKind::Dispatch => {
                    // Validation guarantees a following stage.
                    let target = StageId::of(graph, kinds[pos + 1]);
                    Stage::Dispatch(DispatchStage::new(
                        graph,
                        target,
                        Arc::clone(&self.local),
                        Arc::clone(&self.router),
                        Arc::clone(&self.transport),
                        Arc::clone(&self.health),
                    ))
                }
                StageKind::Persist => {
                    let persistence = Arc::new(PersistenceStage::new(
                        graph,
                        self.options.aggregation_window,
                        self.options.flush_batch_size,
                    ));
                    self.flush_targets.register(Arc::new(PersistBinding::new(
                        Arc::clone(&persistence),
                        Arc::clone(&self.storage),
                        hook.take(),
                    )));
                    Stage::Persist(persistence)
                }
            };

            let next = senders.get(pos + 1).cloned();
            let worker = StageWorker::new(
                graph,
                stage_id,
                stage,
                rx,
                next,
                Arc::clone(&self.health),
            );

            self.workers.push(WorkerTask {
                graph,
                kind,
                closed: closed.clone(),
                handle: tokio::spawn(worker.run(closed)),
            });
        }

        info!(
            graph = %graph,
            entity = E::TYPE_TAG,
            stages = ?kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "graph built",
        );

        Ok(GraphHandle::new(
            graph,
            senders[0].clone(),
            Arc::clone(&self.local),
            Arc::clone(&self.health),
        ))
    }

    /// Starts the periodic flush timer.
    pub fn start(&mut self) {
        if self.timer.is_some() {
            return;
        }

        let ctx = CancellationToken::new();
        let timer = FlushTimer::new(self.flush_targets.clone(), Arc::clone(&self.health));
        let handle = timer.spawn(self.options.flush_interval, ctx.clone());
        self.timer = Some((ctx, handle));
    }

    /// Flushes every persistence stage once, outside the timer.
    pub async fn flush_now(&self) -> FlushReport {
        FlushTimer::new(self.flush_targets.clone(), Arc::clone(&self.health))
            .flush_all(SystemTime::now())
            .await
    }

    /// Drains stage queues upstream first, stops the timer and runs a final
    /// flush.
    ///
    /// Workers still busy when `shutdown_timeout` runs out are aborted and
    /// whatever they held is lost.
    pub async fn shutdown(mut self) -> FlushReport {
        let deadline = Instant::now() + self.options.shutdown_timeout;

        for kind in StageKind::TOPOLOGICAL {
            let (stopping, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
                .into_iter()
                .partition(|task| task.kind == kind);
            self.workers = rest;

            for task in &stopping {
                task.closed.cancel();
            }

            for task in stopping {
                let abort = task.handle.abort_handle();
                let remaining = deadline.saturating_duration_since(Instant::now());

                match tokio::time::timeout(remaining, task.handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(
                            graph = %task.graph,
                            kind = kind.as_str(),
                            error = %e,
                            "stage worker failed",
                        );
                    }
                    Err(_) => {
                        warn!(
                            graph = %task.graph,
                            kind = kind.as_str(),
                            "stage worker did not drain in time, aborting",
                        );
                        abort.abort();
                    }
                }
            }
        }

        if let Some((ctx, handle)) = self.timer.take() {
            ctx.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "flush timer failed");
            }
        }

        let report = self.flush_now().await;
        info!(
            rows = report.rows,
            failed_targets = report.failed_targets,
            "stream runtime stopped",
        );
        report
    }
}
