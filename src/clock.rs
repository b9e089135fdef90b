//! `Clock` collaborator: monotonic & wall-clock source,
//! abstracted so tests can control "now".

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Wall-clock instant, stored as nanoseconds since the Unix epoch.
///
/// Nanosecond precision is what the inverted-timestamp index
/// needs; millisecond- and RFC3339-based indexes derive their encodings from
/// this single representation so every index format is computed from the
/// same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    pub fn from_nanos(nanos: i64) -> Self {
        Timestamp(nanos)
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis.saturating_mul(1_000_000))
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn as_millis(self) -> i64 {
        self.0 / 1_000_000
    }

    pub fn inverted_key(self) -> String {
        crate::keycodec::inverted_nanos(self.0)
    }

    pub fn forward_millis_key(self) -> String {
        crate::keycodec::forward_millis(self.as_millis())
    }

    /// RFC3339Nano string representation, used by the `updated_at`/
    /// `deleted_at` sync indexes.
    pub fn to_rfc3339_nanos(self) -> String {
        let dt = OffsetDateTime::from_unix_timestamp_nanos(self.0 as i128)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        dt.format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default()
    }

    pub fn from_rfc3339_nanos(s: &str) -> Option<Self> {
        let dt = OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok()?;
        Some(Timestamp(dt.unix_timestamp_nanos() as i64))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339_nanos())
    }
}

/// Abstracted clock. Every store operation that stamps
/// `created_at`/`updated_at` goes through this trait rather than calling
/// `OffsetDateTime::now_utc()` directly, so tests can hold time fixed or
/// advance it deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    fn now_millis(&self) -> i64 {
        self.now().as_millis()
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() as i64;
        Timestamp(nanos)
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only moves
/// when explicitly advanced.
#[derive(Debug)]
pub struct TestClock {
    nanos: AtomicI64,
}

impl TestClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            nanos: AtomicI64::new(start.as_nanos()),
        }
    }

    pub fn advance(&self, duration: std::time::Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as i64, Ordering::Relaxed);
    }

    pub fn set(&self, ts: Timestamp) {
        self.nanos.store(ts.as_nanos(), Ordering::Relaxed);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_roundtrip() {
        let ts = Timestamp::from_millis(1_730_000_000_000);
        let s = ts.to_rfc3339_nanos();
        let back = Timestamp::from_rfc3339_nanos(&s).unwrap();
        assert_eq!(ts.as_millis(), back.as_millis());
    }

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::new(Timestamp::ZERO);
        clock.advance(std::time::Duration::from_secs(60));
        assert_eq!(clock.now().as_millis(), 60_000);
    }
}
