use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::aggregation::AggregationStage;
use super::dispatch::DispatchStage;
use super::persistence::PersistenceStage;
use super::queue::StageSender;
use super::{Envelope, GraphId, StageId, StageKind};
use crate::entity::Entity;
use crate::health::HealthMetrics;

/// Maximum records handled per wake-up.
const BATCH_SIZE: usize = 256;

/// The three stage variants behind one "accept a batch" capability.
pub enum Stage<E: Entity> {
    Aggregate(AggregationStage<E>),
    Dispatch(DispatchStage<E>),
    Persist(Arc<PersistenceStage<E>>),
}

/// What a stage produced from one batch.
pub struct StageOutput<E> {
    /// Records for the next stage.
    pub forward: Vec<Envelope<E>>,
    /// Records dropped inside the stage, with the drop reason.
    pub dropped: Option<(&'static str, usize)>,
}

impl<E: Entity> Stage<E> {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Aggregate(_) => StageKind::Aggregate,
            Self::Dispatch(_) => StageKind::Dispatch,
            Self::Persist(_) => StageKind::Persist,
        }
    }

    pub async fn accept_batch(&mut self, batch: Vec<Envelope<E>>) -> StageOutput<E> {
        match self {
            Self::Aggregate(stage) => {
                let out = stage.accept_batch(batch, SystemTime::now());
                StageOutput {
                    forward: out.snapshots,
                    dropped: (out.late > 0).then_some(("late", out.late)),
                }
            }
            Self::Dispatch(stage) => {
                let out = stage.route_batch(batch).await;
                StageOutput {
                    forward: out.local,
                    dropped: (out.failed > 0).then_some(("remote_unreachable", out.failed)),
                }
            }
            Self::Persist(stage) => {
                let late = stage.accept_batch(batch, SystemTime::now());
                StageOutput {
                    forward: Vec::new(),
                    dropped: (late > 0).then_some(("late", late)),
                }
            }
        }
    }
}

/// Single reader of one stage queue.
pub(crate) struct StageWorker<E: Entity> {
    graph: GraphId,
    stage_id: StageId,
    stage: Stage<E>,
    rx: mpsc::Receiver<Envelope<E>>,
    next: Option<StageSender<Envelope<E>>>,
    health: Arc<HealthMetrics>,
    stage_label: String,
}

impl<E: Entity> StageWorker<E> {
    pub(crate) fn new(
        graph: GraphId,
        stage_id: StageId,
        stage: Stage<E>,
        rx: mpsc::Receiver<Envelope<E>>,
        next: Option<StageSender<Envelope<E>>>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            graph,
            stage_id,
            stage,
            rx,
            next,
            health,
            stage_label: stage_id.to_string(),
        }
    }

    /// Processes records until `ctx` is cancelled, then drains what is queued.
    pub(crate) async fn run(mut self, ctx: CancellationToken) {
        debug!(
            graph = %self.graph,
            stage = %self.stage_id,
            kind = self.stage.kind().as_str(),
            "stage worker started",
        );

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.drain().await;
                    return;
                }

                item = self.rx.recv() => {
                    match item {
                        Some(first) => {
                            let mut batch = Vec::with_capacity(BATCH_SIZE);
                            batch.push(first);

                            // Drain up to BATCH_SIZE-1 more records without blocking.
                            while batch.len() < BATCH_SIZE {
                                match self.rx.try_recv() {
                                    Ok(item) => batch.push(item),
                                    Err(_) => break,
                                }
                            }

                            self.process(batch).await;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn drain(&mut self) {
        self.rx.close();

        let mut drained = 0;
        loop {
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            while batch.len() < BATCH_SIZE {
                match self.rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            drained += batch.len();
            self.process(batch).await;
        }

        debug!(graph = %self.graph, stage = %self.stage_id, drained, "stage worker drained");
    }

    async fn process(&mut self, batch: Vec<Envelope<E>>) {
        let graph_label = E::TYPE_TAG;
        self.health
            .records_processed
            .with_label_values(&[graph_label, &self.stage_label])
            .inc_by(batch.len() as f64);

        let output = self.stage.accept_batch(batch).await;

        if let Some((reason, count)) = output.dropped {
            self.health
                .records_dropped
                .with_label_values(&[graph_label, &self.stage_label, reason])
                .inc_by(count as f64);
            debug!(graph = %self.graph, stage = %self.stage_id, reason, count, "records dropped");
        }

        if let Some(next) = &self.next {
            let mut rejected = 0usize;
            let mut last_reason = "";
            for envelope in output.forward {
                if let Err(e) = next.send(envelope).await {
                    rejected += 1;
                    last_reason = e.reason();
                    self.health
                        .records_dropped
                        .with_label_values(&[graph_label, &next.stage().to_string(), e.reason()])
                        .inc();
                }
            }

            if rejected > 0 {
                warn!(
                    graph = %self.graph,
                    from = %self.stage_id,
                    to = %next.stage(),
                    rejected,
                    reason = last_reason,
                    "downstream stage rejected records",
                );
            }
        }

        self.health
            .stage_queue_length
            .with_label_values(&[graph_label, &self.stage_label])
            .set(self.rx.len() as f64);
    }
}
