//! Millisecond timestamps, the unit the index engine uses for file times.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Convert a system time to milliseconds since the Unix epoch (UTC).
///
/// Times before the epoch come back negative.
pub fn system_time_to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Convert milliseconds since the Unix epoch back into a system time.
pub fn millis_to_system_time(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    system_time_to_millis(SystemTime::now())
}
