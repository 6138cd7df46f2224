//! Time-bucket arithmetic.
//!
//! A time bucket is a UTC timestamp truncated to a granularity and encoded as
//! decimal digits (`yyyyMMddHHmm` for minutes). The encoding is monotonic, so
//! buckets of the same granularity compare numerically.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Bucket granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
}

impl Granularity {
    fn format(self) -> &'static str {
        match self {
            Self::Second => "%Y%m%d%H%M%S",
            Self::Minute => "%Y%m%d%H%M",
            Self::Hour => "%Y%m%d%H",
            Self::Day => "%Y%m%d",
        }
    }

    fn digits(self) -> usize {
        match self {
            Self::Second => 14,
            Self::Minute => 12,
            Self::Hour => 10,
            Self::Day => 8,
        }
    }

    /// Infers the granularity of an encoded bucket from its digit count.
    pub fn of_bucket(bucket: u64) -> Option<Self> {
        match bucket.to_string().len() {
            14 => Some(Self::Second),
            12 => Some(Self::Minute),
            10 => Some(Self::Hour),
            8 => Some(Self::Day),
            _ => None,
        }
    }
}

/// Returns the bucket containing `millis` (epoch milliseconds, UTC).
pub fn time_bucket(millis: i64, granularity: Granularity) -> u64 {
    let Some(dt) = DateTime::<Utc>::from_timestamp_millis(millis) else {
        return 0;
    };
    dt.format(granularity.format())
        .to_string()
        .parse()
        .unwrap_or(0)
}

/// Returns the bucket containing `t`.
pub fn time_bucket_of(t: SystemTime, granularity: Granularity) -> u64 {
    time_bucket(system_time_millis(t), granularity)
}

/// Converts a bucket back to the epoch millis of its start.
pub fn bucket_start_millis(bucket: u64) -> Option<i64> {
    let granularity = Granularity::of_bucket(bucket)?;
    let text = format!("{bucket:0width$}", width = granularity.digits());

    let naive = match granularity {
        Granularity::Day => NaiveDate::parse_from_str(&text, "%Y%m%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?,
        Granularity::Hour => {
            NaiveDateTime::parse_from_str(&format!("{text}00"), "%Y%m%d%H%M").ok()?
        }
        Granularity::Minute | Granularity::Second => {
            NaiveDateTime::parse_from_str(&text, granularity.format()).ok()?
        }
    };

    Some(Utc.from_utc_datetime(&naive).timestamp_millis())
}

/// Oldest bucket still inside `window` before `now`, at `granularity`.
///
/// Buckets strictly below the cutoff are expired.
pub fn cutoff_bucket(now: SystemTime, window: Duration, granularity: Granularity) -> u64 {
    let cutoff = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
    time_bucket_of(cutoff, granularity)
}

/// Reports whether `bucket` falls before the cutoff for `window`.
///
/// Buckets that cannot be decoded are treated as live.
pub fn is_expired(bucket: u64, now: SystemTime, window: Duration) -> bool {
    match Granularity::of_bucket(bucket) {
        Some(granularity) => bucket < cutoff_bucket(now, window, granularity),
        None => false,
    }
}

/// Epoch milliseconds of `t`, saturating at zero for pre-epoch times.
pub fn system_time_millis(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2018-01-01T12:34:56.789Z
    const TS: i64 = 1_514_810_096_789;

    #[test]
    fn test_time_bucket_granularities() {
        assert_eq!(time_bucket(TS, Granularity::Second), 20180101123456);
        assert_eq!(time_bucket(TS, Granularity::Minute), 201801011234);
        assert_eq!(time_bucket(TS, Granularity::Hour), 2018010112);
        assert_eq!(time_bucket(TS, Granularity::Day), 20180101);
    }

    #[test]
    fn test_bucket_start_round_trip_truncates() {
        let minute = time_bucket(TS, Granularity::Minute);
        let start = bucket_start_millis(minute).expect("valid bucket");
        assert_eq!(start, 1_514_810_040_000);
        assert_eq!(time_bucket(start, Granularity::Minute), minute);

        let day = bucket_start_millis(20180101).expect("valid bucket");
        assert_eq!(day, 1_514_764_800_000);

        let hour = bucket_start_millis(2018010112).expect("valid bucket");
        assert_eq!(hour, 1_514_808_000_000);
    }

    #[test]
    fn test_granularity_of_bucket() {
        assert_eq!(Granularity::of_bucket(201801011234), Some(Granularity::Minute));
        assert_eq!(Granularity::of_bucket(20180101), Some(Granularity::Day));
        assert_eq!(Granularity::of_bucket(100), None);
        assert!(bucket_start_millis(100).is_none());
    }

    #[test]
    fn test_is_expired_against_window() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_millis(TS as u64);
        let current = time_bucket_of(now, Granularity::Minute);
        let old = time_bucket(TS - 20 * 60_000, Granularity::Minute);

        assert!(!is_expired(current, now, Duration::from_secs(600)));
        assert!(is_expired(old, now, Duration::from_secs(600)));
        // Undecodable buckets are never expired.
        assert!(!is_expired(100, now, Duration::from_secs(600)));
    }

    #[test]
    fn test_buckets_order_numerically() {
        let earlier = time_bucket(TS, Granularity::Minute);
        let later = time_bucket(TS + 3_600_000, Granularity::Minute);
        assert!(later > earlier);
    }
}
