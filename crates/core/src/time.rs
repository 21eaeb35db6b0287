use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Result, WgageError};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn at_unix(secs: i64) -> Self {
        Self(
            Utc.timestamp_opt(secs, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        )
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Floors an OTLP nanosecond timestamp to whole Unix seconds.
pub fn unix_seconds_from_nanos(nanos: u64) -> i64 {
    // u64::MAX / 1e9 fits comfortably in i64
    (nanos / NANOS_PER_SECOND) as i64
}

/// Whole seconds between `timestamp_nanos` and `now`, both floored.
/// Negative when the timestamp lies in the future.
pub fn elapsed_whole_seconds(now: DateTime<Utc>, timestamp_nanos: u64) -> f64 {
    (now.timestamp() - unix_seconds_from_nanos(timestamp_nanos)) as f64
}

/// Accepts RFC 3339, integer Unix seconds, or a duration meaning "that long ago".
pub fn parse_time_or_unix(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    if let Ok(secs) = input.parse::<i64>() {
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| WgageError::Parse(format!("unix seconds out of range: {input}")));
    }

    if let Ok(duration) = humantime::parse_duration(input) {
        return Ok(Utc::now()
            - chrono::Duration::from_std(duration).map_err(|e| {
                WgageError::Parse(format!("failed to parse duration to chrono: {e}"))
            })?);
    }

    Err(WgageError::Parse(format!(
        "expected RFC3339 time, unix seconds or duration, got {input}"
    )))
}

pub fn parse_duration_str(input: &str) -> Result<Duration> {
    humantime::parse_duration(input)
        .map_err(|e| WgageError::Parse(format!("invalid duration {input}: {e}")))
}
