//! Injected clock.
//!
//! Single source of truth for wall time. Handlers and engines never call
//! `Utc::now()` directly; tests drive a `SimClock` forward instead.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests.
///
/// # Determinism Contract
/// - `now()` returns the simulated time, never system time
/// - `advance_to()` only moves forward, panics on backward movement
#[derive(Debug, Clone)]
pub struct SimClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl SimClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn from_unix_secs(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).expect("valid unix timestamp"))
    }

    pub fn advance_to(&self, new_time: DateTime<Utc>) {
        let mut cur = self.current.lock();
        assert!(
            new_time >= *cur,
            "SimClock: cannot go backward from {} to {}",
            *cur,
            new_time
        );
        *cur = new_time;
    }

    pub fn advance_by(&self, delta: Duration) {
        assert!(
            delta >= Duration::zero(),
            "SimClock: delta must be non-negative"
        );
        let mut cur = self.current.lock();
        *cur += delta;
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_monotonic() {
        let clock = SimClock::from_unix_secs(1_700_000_000);
        assert_eq!(clock.now().timestamp(), 1_700_000_000);

        clock.advance_by(Duration::seconds(90));
        assert_eq!(clock.now().timestamp(), 1_700_000_090);

        clock.advance_to(DateTime::from_timestamp(1_700_000_200, 0).unwrap());
        assert_eq!(clock.now().timestamp(), 1_700_000_200);
    }

    #[test]
    #[should_panic(expected = "cannot go backward")]
    fn sim_clock_backward_panics() {
        let clock = SimClock::from_unix_secs(1_700_000_000);
        clock.advance_to(DateTime::from_timestamp(1_600_000_000, 0).unwrap());
    }
}
