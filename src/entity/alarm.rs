use serde::{Deserialize, Serialize};

use super::{Entity, MergeMode};

/// What an alarm is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmScope {
    Application,
    Service,
    Instance,
}

impl AlarmScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Service => "service",
            Self::Instance => "instance",
        }
    }
}

/// Which threshold fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    ErrorRate,
    SlowResponse,
}

impl AlarmKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::SlowResponse => "slow_response",
        }
    }
}

/// Raised alarm, one per scope/source/kind and minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub scope: AlarmScope,
    pub source_id: i32,
    pub kind: AlarmKind,
    pub time_bucket: u64,
    /// Epoch millis when the alarm was last evaluated as firing.
    pub last_time: i64,
    /// Observed value that crossed the threshold.
    pub value: f64,
    pub content: String,
}

impl Entity for Alarm {
    const TYPE_TAG: &'static str = "alarm";
    const MERGE_MODE: MergeMode = MergeMode::Replace;

    fn id(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.time_bucket,
            self.scope.as_str(),
            self.source_id,
            self.kind.as_str()
        )
    }

    fn time_bucket(&self) -> u64 {
        self.time_bucket
    }

    fn merge(&mut self, other: &Self) {
        // Latest evaluation wins; ties resolve on content so the result is order-free.
        let take_other = other.last_time > self.last_time
            || (other.last_time == self.last_time && other.content > self.content);
        if take_other {
            self.last_time = other.last_time;
            self.value = other.value;
            self.content = other.content.clone();
        }
    }
}
