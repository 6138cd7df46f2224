use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Storage;
use crate::clock::{cutoff_bucket, Granularity};
use crate::health::HealthMetrics;

/// Periodically deletes metric rows that fell out of the retention period.
pub struct TtlSweeper<S: Storage> {
    storage: Arc<S>,
    retention: Duration,
    /// Entity types and the bucket granularity their rows use.
    targets: Vec<(&'static str, Granularity)>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Storage> TtlSweeper<S> {
    pub fn new(storage: Arc<S>, retention: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            storage,
            retention,
            targets: Vec::new(),
            health,
        }
    }

    /// Adds an entity type to sweep.
    pub fn with_target(mut self, entity_type: &'static str, granularity: Granularity) -> Self {
        self.targets.push((entity_type, granularity));
        self
    }

    /// Runs one sweep over every target, returning the rows deleted.
    ///
    /// A failing target is logged and does not stop the others.
    pub async fn sweep(&self, now: SystemTime) -> usize {
        let mut total = 0;

        for (entity_type, granularity) in &self.targets {
            let before = cutoff_bucket(now, self.retention, *granularity);
            match self.storage.delete_expired(entity_type, before).await {
                Ok(deleted) => {
                    total += deleted;
                    if let Some(health) = &self.health {
                        health
                            .ttl_rows_deleted
                            .with_label_values(&[entity_type])
                            .inc_by(deleted as f64);
                    }
                    debug!(entity_type, before, deleted, "ttl sweep");
                }
                Err(e) => {
                    warn!(entity_type, error = %e, "ttl sweep failed");
                }
            }
        }

        total
    }

    /// Spawns the periodic sweep task.
    pub fn spawn(self, interval: Duration, ctx: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = ticker.tick() => {
                        let deleted = self.sweep(SystemTime::now()).await;
                        if deleted > 0 {
                            info!(
                                storage = self.storage.name(),
                                deleted,
                                "expired rows deleted",
                            );
                        }
                    }
                }
            }
        })
    }
}
