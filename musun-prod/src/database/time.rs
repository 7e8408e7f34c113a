//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use chrono::{DateTime, TimeZone, Utc};

#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert stored epoch milliseconds back to a `DateTime<Utc>`.
///
/// Out-of-range values yield `None` rather than panicking.
pub fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_now() {
        let now = now_ms();
        let dt = ms_to_datetime(now).unwrap();
        assert_eq!(dt.timestamp_millis(), now);
    }

    #[test]
    fn test_out_of_range() {
        assert!(ms_to_datetime(i64::MAX).is_none());
    }
}
