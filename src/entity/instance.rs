use serde::{Deserialize, Serialize};

use super::{Entity, MergeMode};

/// Latest heartbeat observed for an agent instance.
///
/// The time bucket is the day of the heartbeat, so one row per instance per day
/// survives in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub instance_id: i32,
    pub application_id: i32,
    pub time_bucket: u64,
    pub heartbeat_time: i64,
}

impl Entity for InstanceHeartbeat {
    const TYPE_TAG: &'static str = "instance_heartbeat";
    const MERGE_MODE: MergeMode = MergeMode::Replace;

    fn id(&self) -> String {
        format!("{}_{}", self.time_bucket, self.instance_id)
    }

    fn time_bucket(&self) -> u64 {
        self.time_bucket
    }

    fn merge(&mut self, other: &Self) {
        self.heartbeat_time = self.heartbeat_time.max(other.heartbeat_time);
    }
}
