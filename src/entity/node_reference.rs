use serde::{Deserialize, Serialize};

use super::{counter_delta, Entity, MergeMode};

/// Latency band upper bounds in milliseconds.
const ONE_SECOND_MS: i64 = 1_000;
const THREE_SECONDS_MS: i64 = 3_000;
const FIVE_SECONDS_MS: i64 = 5_000;

/// Call summary between two applications for one minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReferenceMetric {
    pub front_application_id: i32,
    pub behind_application_id: i32,
    pub time_bucket: u64,
    /// Calls completing within 1s.
    pub s1_lte: i64,
    /// Calls completing within (1s, 3s].
    pub s3_lte: i64,
    /// Calls completing within (3s, 5s].
    pub s5_lte: i64,
    /// Calls slower than 5s.
    pub s5_gt: i64,
    pub error: i64,
    pub summary: i64,
    pub cost_sum: i64,
}

impl NodeReferenceMetric {
    /// Builds a single-call record from one observed exit span.
    pub fn from_call(
        front_application_id: i32,
        behind_application_id: i32,
        time_bucket: u64,
        duration_ms: i64,
        is_error: bool,
    ) -> Self {
        let mut metric = Self {
            front_application_id,
            behind_application_id,
            time_bucket,
            s1_lte: 0,
            s3_lte: 0,
            s5_lte: 0,
            s5_gt: 0,
            error: i64::from(is_error),
            summary: 1,
            cost_sum: duration_ms.max(0),
        };

        match duration_ms {
            d if d <= ONE_SECOND_MS => metric.s1_lte = 1,
            d if d <= THREE_SECONDS_MS => metric.s3_lte = 1,
            d if d <= FIVE_SECONDS_MS => metric.s5_lte = 1,
            _ => metric.s5_gt = 1,
        }

        metric
    }
}

impl Entity for NodeReferenceMetric {
    const TYPE_TAG: &'static str = "node_reference_metric";
    const MERGE_MODE: MergeMode = MergeMode::Additive;

    fn id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.time_bucket, self.front_application_id, self.behind_application_id
        )
    }

    fn time_bucket(&self) -> u64 {
        self.time_bucket
    }

    fn merge(&mut self, other: &Self) {
        self.s1_lte = self.s1_lte.saturating_add(other.s1_lte);
        self.s3_lte = self.s3_lte.saturating_add(other.s3_lte);
        self.s5_lte = self.s5_lte.saturating_add(other.s5_lte);
        self.s5_gt = self.s5_gt.saturating_add(other.s5_gt);
        self.error = self.error.saturating_add(other.error);
        self.summary = self.summary.saturating_add(other.summary);
        self.cost_sum = self.cost_sum.saturating_add(other.cost_sum);
    }

    fn delta_since(&self, base: &Self) -> Self {
        let delta = (|| {
            Some(Self {
                s1_lte: counter_delta(self.s1_lte, base.s1_lte)?,
                s3_lte: counter_delta(self.s3_lte, base.s3_lte)?,
                s5_lte: counter_delta(self.s5_lte, base.s5_lte)?,
                s5_gt: counter_delta(self.s5_gt, base.s5_gt)?,
                error: counter_delta(self.error, base.error)?,
                summary: counter_delta(self.summary, base.summary)?,
                cost_sum: counter_delta(self.cost_sum, base.cost_sum)?,
                ..self.clone()
            })
        })();
        delta.unwrap_or_else(|| self.clone())
    }
}
