//! Timestamp helpers for the database layer.
//!
//! Jobs and datasets store timestamps as `INTEGER` Unix epoch seconds (UTC).

use chrono::{DateTime, TimeZone, Utc};

/// Current time as Unix epoch seconds (UTC).
#[inline]
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Convert a `DateTime<Utc>` to Unix epoch seconds.
#[inline]
pub fn datetime_to_secs(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// Convert Unix epoch seconds to `DateTime<Utc>`.
///
/// Values outside chrono's supported range clamp to the Unix epoch.
#[inline]
pub fn secs_to_datetime(secs: i64) -> DateTime<Utc> {
    match Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => DateTime::<Utc>::UNIX_EPOCH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_now() {
        let now = now_secs();
        assert_eq!(datetime_to_secs(secs_to_datetime(now)), now);
    }

    #[test]
    fn test_out_of_range_clamps() {
        assert_eq!(secs_to_datetime(i64::MAX), DateTime::<Utc>::UNIX_EPOCH);
    }
}
