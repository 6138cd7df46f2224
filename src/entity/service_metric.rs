use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{counter_delta, Entity, MergeMode};

/// Number of slowest traces kept per service and bucket.
pub const TOP_N_CAP: usize = 5;

/// One slow trace sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowTrace {
    pub duration_ms: i64,
    pub trace_id: String,
}

/// Per-service call statistics for one minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetric {
    pub service_id: i32,
    pub application_id: i32,
    pub time_bucket: u64,
    pub calls: i64,
    pub error_calls: i64,
    pub duration_sum: i64,
    pub min_duration: i64,
    pub max_duration: i64,
    /// Slowest traces, longest first, at most [`TOP_N_CAP`].
    pub slow_traces: Vec<SlowTrace>,
}

impl ServiceMetric {
    /// Builds a single-call record from one entry span.
    pub fn from_call(
        service_id: i32,
        application_id: i32,
        time_bucket: u64,
        duration_ms: i64,
        is_error: bool,
        trace_id: &str,
    ) -> Self {
        let duration_ms = duration_ms.max(0);
        Self {
            service_id,
            application_id,
            time_bucket,
            calls: 1,
            error_calls: i64::from(is_error),
            duration_sum: duration_ms,
            min_duration: duration_ms,
            max_duration: duration_ms,
            slow_traces: vec![SlowTrace {
                duration_ms,
                trace_id: trace_id.to_string(),
            }],
        }
    }

    /// Mean call duration, or zero without calls.
    pub fn avg_duration(&self) -> i64 {
        if self.calls == 0 {
            0
        } else {
            self.duration_sum / self.calls
        }
    }

    /// Fraction of calls that failed.
    pub fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.error_calls as f64 / self.calls as f64
        }
    }
}

/// Union of both lists with one entry per trace id (its longest duration),
/// ordered slowest first (trace id breaks ties) and capped. The result does
/// not depend on argument order.
fn merge_slow_traces(a: &[SlowTrace], b: &[SlowTrace]) -> Vec<SlowTrace> {
    let mut longest: HashMap<&str, i64> = HashMap::with_capacity(a.len() + b.len());
    for trace in a.iter().chain(b.iter()) {
        let slot = longest.entry(trace.trace_id.as_str()).or_insert(trace.duration_ms);
        *slot = (*slot).max(trace.duration_ms);
    }

    let mut merged: Vec<SlowTrace> = longest
        .into_iter()
        .map(|(trace_id, duration_ms)| SlowTrace {
            duration_ms,
            trace_id: trace_id.to_string(),
        })
        .collect();
    merged.sort_by(|x, y| {
        y.duration_ms
            .cmp(&x.duration_ms)
            .then_with(|| x.trace_id.cmp(&y.trace_id))
    });
    merged.truncate(TOP_N_CAP);
    merged
}

impl Entity for ServiceMetric {
    const TYPE_TAG: &'static str = "service_metric";
    const MERGE_MODE: MergeMode = MergeMode::Additive;

    fn id(&self) -> String {
        format!("{}_{}", self.time_bucket, self.service_id)
    }

    fn time_bucket(&self) -> u64 {
        self.time_bucket
    }

    fn merge(&mut self, other: &Self) {
        if self.calls == 0 {
            self.min_duration = other.min_duration;
        } else if other.calls > 0 {
            self.min_duration = self.min_duration.min(other.min_duration);
        }
        self.max_duration = self.max_duration.max(other.max_duration);
        self.calls = self.calls.saturating_add(other.calls);
        self.error_calls = self.error_calls.saturating_add(other.error_calls);
        self.duration_sum = self.duration_sum.saturating_add(other.duration_sum);
        self.slow_traces = merge_slow_traces(&self.slow_traces, &other.slow_traces);
    }

    fn delta_since(&self, base: &Self) -> Self {
        let counters = (|| {
            Some((
                counter_delta(self.calls, base.calls)?,
                counter_delta(self.error_calls, base.error_calls)?,
                counter_delta(self.duration_sum, base.duration_sum)?,
            ))
        })();

        match counters {
            Some((calls, error_calls, duration_sum)) => Self {
                calls,
                error_calls,
                duration_sum,
                ..self.clone()
            },
            None => self.clone(),
        }
    }
}
