use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::persistence::{PersistedHook, PersistenceStage};
use super::BoxFuture;
use crate::entity::Entity;
use crate::error::StreamError;
use crate::health::HealthMetrics;
use crate::storage::Storage;

/// Something the flush timer drains into storage on every tick.
pub trait FlushTarget: Send + Sync + 'static {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Runs one flush, returning the number of rows written.
    fn flush(&self, now: SystemTime) -> BoxFuture<'_, Result<usize, StreamError>>;
}

/// A persistence stage bound to its storage engine and post-flush hook.
pub struct PersistBinding<S: Storage, E: Entity> {
    stage: Arc<PersistenceStage<E>>,
    storage: Arc<S>,
    hook: Option<PersistedHook<E>>,
}

impl<S: Storage, E: Entity> PersistBinding<S, E> {
    pub fn new(
        stage: Arc<PersistenceStage<E>>,
        storage: Arc<S>,
        hook: Option<PersistedHook<E>>,
    ) -> Self {
        Self {
            stage,
            storage,
            hook,
        }
    }
}

impl<S: Storage, E: Entity> FlushTarget for PersistBinding<S, E> {
    fn name(&self) -> &'static str {
        E::TYPE_TAG
    }

    fn flush(&self, now: SystemTime) -> BoxFuture<'_, Result<usize, StreamError>> {
        Box::pin(async move {
            let merged = self.stage.flush(&*self.storage, now).await?;
            let rows = merged.len();

            if let Some(hook) = &self.hook {
                if !merged.is_empty() {
                    hook(merged).await;
                }
            }

            Ok(rows)
        })
    }
}

/// Targets registered with a runtime, shared with its flush timer.
///
/// Targets registered after the timer started are picked up on its next tick.
#[derive(Clone, Default)]
pub struct FlushTargets(Arc<RwLock<Vec<Arc<dyn FlushTarget>>>>);

impl FlushTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target: Arc<dyn FlushTarget>) {
        self.0.write().push(target);
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn FlushTarget>> {
        self.0.read().clone()
    }
}

impl From<Vec<Arc<dyn FlushTarget>>> for FlushTargets {
    fn from(targets: Vec<Arc<dyn FlushTarget>>) -> Self {
        Self(Arc::new(RwLock::new(targets)))
    }
}

/// Totals for one tick across all targets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub rows: usize,
    pub failed_targets: usize,
}

/// Single periodic scheduler for every persistence stage.
///
/// Targets are flushed one after another within a tick and missed ticks are
/// skipped, so two flushes of the same target never overlap.
pub struct FlushTimer {
    targets: FlushTargets,
    health: Arc<HealthMetrics>,
}

impl FlushTimer {
    pub fn new(targets: FlushTargets, health: Arc<HealthMetrics>) -> Self {
        Self { targets, health }
    }

    /// Flushes every target once. A failing target does not stop the rest.
    pub async fn flush_all(&self, now: SystemTime) -> FlushReport {
        let mut report = FlushReport::default();

        for target in self.targets.snapshot() {
            let name = target.name();
            let started = Instant::now();
            let result = target.flush(now).await;

            self.health
                .flush_duration
                .with_label_values(&[name])
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok(rows) => {
                    report.rows += rows;
                    if rows > 0 {
                        self.health
                            .rows_flushed
                            .with_label_values(&[name])
                            .inc_by(rows as f64);
                        debug!(graph = name, rows, "flushed");
                    }
                }
                Err(e) => {
                    report.failed_targets += 1;
                    self.health.flush_errors.with_label_values(&[name]).inc();
                    error!(graph = name, error = %e, "flush failed, discarding tick");
                }
            }
        }

        report
    }

    /// Spawns the periodic flush loop.
    pub fn spawn(self, interval: Duration, ctx: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(
                targets = self.targets.len(),
                interval = ?interval,
                "flush timer started",
            );

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = ticker.tick() => {
                        self.flush_all(SystemTime::now()).await;
                    }
                }
            }
        })
    }
}
