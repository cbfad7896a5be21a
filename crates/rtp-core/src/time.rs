use std::fmt;
use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stamp format used to embed a time point in file names.
pub const FILENAME_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const STAMP_LEN: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("invalid ISO-8601 time: {0}")]
    InvalidIso(String),
    #[error("no YYYYmmdd_HHMMSS stamp found in {0}")]
    NoStamp(String),
    #[error("invalid duration {0:?} (expected e.g. 3d, 72h, 90m, 30s, 1w)")]
    InvalidDuration(String),
}

/// A timestamp at the pipeline cadence. All cross-stage maps are keyed by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimePoint(pub NaiveDateTime);

impl TimePoint {
    pub fn new(dt: NaiveDateTime) -> Self {
        Self(dt)
    }

    /// Accepts `YYYY-mm-ddTHH:MM:SS`, `YYYY-mm-ddTHH:MM`, a space instead of `T`, or a bare date.
    pub fn parse_iso(s: &str) -> Result<Self, TimeError> {
        let s = s.trim();
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(Self(dt));
            }
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Self)
            .ok_or_else(|| TimeError::InvalidIso(s.to_string()))
    }

    pub fn to_iso(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    pub fn to_filename_stamp(&self) -> String {
        self.0.format(FILENAME_STAMP_FORMAT).to_string()
    }

    /// strftime rendering; `None` when `fmt` contains an invalid specifier.
    pub fn format(&self, fmt: &str) -> Option<String> {
        use std::fmt::Write;
        let mut out = String::new();
        write!(out, "{}", self.0.format(fmt)).ok()?;
        Some(out)
    }

    /// Extract the first `YYYYmmdd_HHMMSS` stamp found anywhere in a path.
    pub fn from_filename(path: &Path) -> Result<Self, TimeError> {
        let s = path.to_string_lossy();
        let bytes = s.as_bytes();
        if bytes.len() >= STAMP_LEN {
            for start in 0..=bytes.len() - STAMP_LEN {
                let window = &bytes[start..start + STAMP_LEN];
                let shaped = window.iter().enumerate().all(|(i, b)| if i == 8 { *b == b'_' } else { b.is_ascii_digit() });
                if !shaped {
                    continue;
                }
                // window is pure ASCII here
                let text = std::str::from_utf8(window).unwrap_or_default();
                if let Ok(dt) = NaiveDateTime::parse_from_str(text, FILENAME_STAMP_FORMAT) {
                    return Ok(Self(dt));
                }
            }
        }
        Err(TimeError::NoStamp(s.into_owned()))
    }

    pub fn checked_sub(&self, d: Duration) -> Option<Self> {
        self.0.checked_sub_signed(d).map(Self)
    }

    pub fn checked_add(&self, d: Duration) -> Option<Self> {
        self.0.checked_add_signed(d).map(Self)
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso())
    }
}

/// Time points `start <= t < end` stepping by `step`. Empty if `step` is not positive.
pub fn time_range(start: TimePoint, end: TimePoint, step: Duration) -> Vec<TimePoint> {
    let mut out = Vec::new();
    if step <= Duration::zero() {
        return out;
    }
    let mut t = start;
    while t < end {
        out.push(t);
        match t.checked_add(step) {
            Some(next) => t = next,
            None => break,
        }
    }
    out
}

/// Parse a lifespan-style duration: `3d`, `72h`, `90m`, `30s`, `1w`, `3 days`, `12 hours`.
pub fn parse_duration(s: &str) -> Result<Duration, TimeError> {
    let trimmed = s.trim();
    let split = trimmed.find(|c: char| !c.is_ascii_digit()).unwrap_or(trimmed.len());
    let (num, unit) = trimmed.split_at(split);
    let n: i64 = num.parse().map_err(|_| TimeError::InvalidDuration(s.to_string()))?;
    let d = match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::try_seconds(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::try_minutes(n),
        "h" | "hour" | "hours" => Duration::try_hours(n),
        "d" | "day" | "days" => Duration::try_days(n),
        "w" | "week" | "weeks" => Duration::try_weeks(n),
        _ => None,
    };
    d.ok_or_else(|| TimeError::InvalidDuration(s.to_string()))
}
