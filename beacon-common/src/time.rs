//! Timestamp utilities
//!
//! All Beacon time arithmetic is wall-clock UTC in whole unix seconds;
//! record fields and recurrence rules never carry time zone information.

use chrono::{DateTime, TimeZone, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current wall-clock time as whole unix seconds (UTC)
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Convert unix seconds into a UTC timestamp
///
/// Out-of-range values collapse to the unix epoch rather than panicking;
/// record timestamps come from client-supplied JSON and are not trusted.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
