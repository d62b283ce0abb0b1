//! # Time Helpers
//!
//! Clock injection and the timestamp conventions both emulators share:
//! Bigtable cell timestamps are microseconds rounded down to millisecond
//! granularity, Cloud Storage generations are nanoseconds, and every
//! JSON-visible timestamp is RFC3339 with nanoseconds.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::time::SystemTime;

/// An injectable clock. Tests freeze time by supplying their own.
pub type Clock = fn() -> SystemTime;

/// The default clock: the real system time.
pub fn system_clock() -> SystemTime {
    SystemTime::now()
}

/// Nanoseconds since the Unix epoch on the real system clock.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Nanoseconds since the Unix epoch for an arbitrary instant.
pub fn nanos_of(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// A cell timestamp for "now": microseconds rounded down to a multiple of
/// 1000, matching the service's millisecond granularity.
pub fn micros_rounded(t: SystemTime) -> i64 {
    let micros = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    micros - micros % 1000
}

/// Format an instant as RFC3339 with nanosecond precision in UTC.
pub fn rfc3339_nanos(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC3339 timestamp, returning nanoseconds since the epoch.
pub fn parse_rfc3339_nanos(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .and_then(|dt| dt.timestamp_nanos_opt())
}

/// Build an RFC3339-nanos string from epoch nanoseconds.
pub fn rfc3339_from_nanos(nanos: i64) -> String {
    let dt = Utc.timestamp_nanos(nanos);
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
