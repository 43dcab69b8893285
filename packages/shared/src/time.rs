//! Time-related utilities with clock abstraction for testability.
//!
//! Playback anchors and the per-connection clock anchor are fractional Unix
//! seconds; everything that derives a "live" position from an anchor goes
//! through the [`Clock`] trait so tests can pin time.

use chrono::Utc;

/// Clock trait for dependency injection and testing
pub trait Clock: Send + Sync {
    /// Current Unix time in fractional seconds
    fn now_unix_secs(&self) -> f64;

    /// Current Unix timestamp in milliseconds
    fn now_unix_millis(&self) -> i64 {
        (self.now_unix_secs() * 1000.0) as i64
    }
}

/// System clock implementation (uses actual system time)
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_secs(&self) -> f64 {
        now_unix_secs()
    }
}

/// Fixed clock implementation for testing (returns a fixed time)
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    fixed_secs: f64,
}

impl FixedClock {
    /// Create a new fixed clock at the given Unix time (fractional seconds)
    pub fn new(fixed_secs: f64) -> Self {
        Self { fixed_secs }
    }
}

impl Clock for FixedClock {
    fn now_unix_secs(&self) -> f64 {
        self.fixed_secs
    }
}

/// Current Unix time in fractional seconds
pub fn now_unix_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Convert a Unix timestamp (milliseconds) to RFC 3339 (UTC)
pub fn timestamp_to_rfc3339(timestamp_millis: i64) -> String {
    let seconds = timestamp_millis.div_euclid(1000);
    let nanos = (timestamp_millis.rem_euclid(1000) * 1_000_000) as u32;
    match chrono::DateTime::from_timestamp(seconds, nanos) {
        Some(dt) => dt.to_rfc3339(),
        None => String::new(),
    }
}
