//! Canonical timestamp handling. All persisted timestamps are UTC ISO-8601
//! with millisecond precision, which keeps string comparison consistent with
//! chronological order.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Current time in the canonical format, e.g. `2026-08-01T12:00:00.000Z`.
pub fn now_iso() -> String {
    to_iso(Utc::now())
}

/// Format a datetime in the canonical format.
pub fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp in any of the shapes the server and older snapshots
/// emit: RFC 3339, or a space-separated `YYYY-MM-DD HH:MM:SS[.fff][Z]`.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let trimmed = s.trim_end_matches('Z');
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}
