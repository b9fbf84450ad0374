//! Conversions between OTLP `*_unix_nano` timestamps and UTC wall-clock
//! times. Stored times are u64 nanoseconds since the 1970 epoch; display
//! times resolve to 100 ns ticks, so `i64` nanosecond math (which wraps in
//! 2262) is avoided by splitting into seconds and sub-second parts.

use chrono::{DateTime, TimeZone, Utc};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Converts an OTLP unix-nano timestamp to UTC. Values beyond the
/// representable range saturate at `DateTime::<Utc>::MAX_UTC`.
pub fn unix_nanos_to_datetime(nanos: u64) -> DateTime<Utc> {
    let secs = (nanos / NANOS_PER_SECOND) as i64;
    let subsec = (nanos % NANOS_PER_SECOND) as u32;
    match Utc.timestamp_opt(secs, subsec) {
        chrono::LocalResult::Single(dt) => dt,
        _ => DateTime::<Utc>::MAX_UTC,
    }
}

/// Converts a UTC time back to unix nanoseconds. Times before the epoch
/// clamp to zero.
pub fn datetime_to_unix_nanos(dt: DateTime<Utc>) -> u64 {
    let secs = dt.timestamp();
    if secs < 0 {
        return 0;
    }
    (secs as u64)
        .saturating_mul(NANOS_PER_SECOND)
        .saturating_add(u64::from(dt.timestamp_subsec_nanos()))
}
