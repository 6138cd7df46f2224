//! Threshold alarms assessed on freshly persisted service metrics.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info};

use crate::clock;
use crate::config::AlarmConfig;
use crate::entity::alarm::{AlarmKind, AlarmScope};
use crate::entity::{Alarm, ServiceMetric};
use crate::health::HealthMetrics;
use crate::stream::{GraphHandle, PersistedHook};

/// Thresholds applied to every persisted service metric.
#[derive(Debug, Clone)]
pub struct AlarmRules {
    min_calls: i64,
    error_rate_threshold: f64,
    avg_latency_threshold_ms: i64,
}

impl AlarmRules {
    pub fn new(cfg: &AlarmConfig) -> Self {
        Self {
            min_calls: cfg.min_calls,
            error_rate_threshold: cfg.error_rate_threshold,
            avg_latency_threshold_ms: i64::try_from(cfg.avg_latency_threshold.as_millis())
                .unwrap_or(i64::MAX),
        }
    }

    /// Alarms raised by `metric`. Metrics with fewer than `min_calls` calls
    /// never alarm.
    pub fn evaluate(&self, metric: &ServiceMetric, now_millis: i64) -> Vec<Alarm> {
        let mut alarms = Vec::new();
        if metric.calls < self.min_calls || metric.calls == 0 {
            return alarms;
        }

        let rate = metric.error_rate();
        if rate >= self.error_rate_threshold {
            alarms.push(Alarm {
                scope: AlarmScope::Service,
                source_id: metric.service_id,
                kind: AlarmKind::ErrorRate,
                time_bucket: metric.time_bucket,
                last_time: now_millis,
                value: rate,
                content: format!(
                    "service {} error rate {:.2} reached threshold {:.2}",
                    metric.service_id, rate, self.error_rate_threshold
                ),
            });
        }

        let avg = metric.avg_duration();
        if avg >= self.avg_latency_threshold_ms {
            alarms.push(Alarm {
                scope: AlarmScope::Service,
                source_id: metric.service_id,
                kind: AlarmKind::SlowResponse,
                time_bucket: metric.time_bucket,
                last_time: now_millis,
                value: avg as f64,
                content: format!(
                    "service {} average response {}ms reached threshold {}ms",
                    metric.service_id, avg, self.avg_latency_threshold_ms
                ),
            });
        }

        alarms
    }

    /// Post-flush hook feeding raised alarms into the alarm graph.
    pub fn hook(
        self: Arc<Self>,
        alarms: GraphHandle<Alarm>,
        health: Arc<HealthMetrics>,
    ) -> PersistedHook<ServiceMetric> {
        Arc::new(move |rows: Vec<ServiceMetric>| {
            let rules = Arc::clone(&self);
            let alarms = alarms.clone();
            let health = Arc::clone(&health);

            Box::pin(async move {
                let now = clock::system_time_millis(SystemTime::now());
                let raised: Vec<Alarm> = rows
                    .iter()
                    .flat_map(|metric| rules.evaluate(metric, now))
                    .collect();

                if raised.is_empty() {
                    return;
                }

                for alarm in &raised {
                    health
                        .alarms_raised
                        .with_label_values(&[alarm.kind.as_str()])
                        .inc();
                    debug!(service = alarm.source_id, kind = alarm.kind.as_str(), "alarm raised");
                }

                let total = raised.len();
                let accepted = alarms.submit_all(raised).await;
                info!(raised = total, accepted, "service alarms assessed");
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn rules() -> AlarmRules {
        AlarmRules::new(&AlarmConfig {
            enabled: true,
            min_calls: 10,
            error_rate_threshold: 0.5,
            avg_latency_threshold: Duration::from_secs(3),
        })
    }

    fn metric(calls: i64, errors: i64, avg_ms: i64) -> ServiceMetric {
        let mut metric = ServiceMetric::from_call(4, 1, 201801011234, avg_ms, false, "t");
        metric.calls = calls;
        metric.error_calls = errors;
        metric.duration_sum = avg_ms * calls;
        metric
    }

    #[test]
    fn test_quiet_services_never_alarm() {
        assert!(rules().evaluate(&metric(9, 9, 10_000), 0).is_empty());
    }

    #[test]
    fn test_error_rate_and_latency_fire_independently() {
        let alarms = rules().evaluate(&metric(10, 5, 100), 42);
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].kind, AlarmKind::ErrorRate);
        assert_eq!(alarms[0].last_time, 42);

        let alarms = rules().evaluate(&metric(20, 0, 3_000), 42);
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].kind, AlarmKind::SlowResponse);
        assert_eq!(alarms[0].value, 3_000.0);

        assert_eq!(rules().evaluate(&metric(20, 19, 4_000), 0).len(), 2);
        assert!(rules().evaluate(&metric(20, 1, 200), 0).is_empty());
    }
}
