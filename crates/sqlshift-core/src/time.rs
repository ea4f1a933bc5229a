//! Timestamp helpers.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time in microseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Render a microsecond timestamp as RFC 3339.
pub fn to_rfc3339(micros: u64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| micros.to_string())
}
