//! Per-provider circuit breaker.
//!
//! Rolling window of recent calls; opens on sustained failure or timeout
//! rates, probes half-open after a cooldown, closes on consecutive
//! successes. Time is injected so tests can drive the transitions.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{info, warn};

const WINDOW_SIZE: usize = 50;
/// Rate thresholds only apply once the window has some volume.
const MIN_CALLS: usize = 10;
const HALF_OPEN_AFTER_SECS: i64 = 30;
const CLOSE_AFTER_SUCCESSES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOutcome {
    Success,
    Failure,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    phase: Phase,
    window: VecDeque<CallOutcome>,
    opened_at: Option<DateTime<Utc>>,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    name: &'static str,
    error_rate_open: f64,
    timeout_rate_open: f64,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, error_rate_open: f64, timeout_rate_open: f64) -> Self {
        Self {
            name,
            error_rate_open,
            timeout_rate_open,
            state: Mutex::new(BreakerState {
                phase: Phase::Closed,
                window: VecDeque::with_capacity(WINDOW_SIZE),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    /// Whether a call may proceed. An open breaker transitions to half-open
    /// once the cooldown has elapsed; until then the tier is skipped.
    pub fn allow(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Closed | Phase::HalfOpen => true,
            Phase::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| now - t)
                    .unwrap_or_else(Duration::zero);
                if elapsed >= Duration::seconds(HALF_OPEN_AFTER_SECS) {
                    info!(breaker = self.name, "Circuit breaker half-open probe");
                    state.phase = Phase::HalfOpen;
                    state.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, _now: DateTime<Utc>) {
        let mut state = self.state.lock();
        push_window(&mut state.window, CallOutcome::Success);
        if state.phase == Phase::HalfOpen {
            state.half_open_successes += 1;
            if state.half_open_successes >= CLOSE_AFTER_SUCCESSES {
                info!(breaker = self.name, "Circuit breaker closed");
                state.phase = Phase::Closed;
                state.opened_at = None;
                state.window.clear();
            }
        }
    }

    /// Timeouts are classified by the adapter error text; they trip the
    /// breaker at a lower rate than hard failures.
    pub fn record_failure(&self, reason: &str, now: DateTime<Utc>) {
        let outcome = if reason.contains("timeout") {
            CallOutcome::Timeout
        } else {
            CallOutcome::Failure
        };

        let mut state = self.state.lock();
        push_window(&mut state.window, outcome);

        if state.phase == Phase::HalfOpen {
            warn!(breaker = self.name, reason, "Probe failed, breaker re-opened");
            state.phase = Phase::Open;
            state.opened_at = Some(now);
            return;
        }
        if state.phase == Phase::Open {
            return;
        }

        let total = state.window.len();
        if total < MIN_CALLS {
            return;
        }
        let failures = state
            .window
            .iter()
            .filter(|o| **o != CallOutcome::Success)
            .count();
        let timeouts = state
            .window
            .iter()
            .filter(|o| **o == CallOutcome::Timeout)
            .count();
        let failure_rate = failures as f64 / total as f64;
        let timeout_rate = timeouts as f64 / total as f64;

        if failure_rate >= self.error_rate_open || timeout_rate >= self.timeout_rate_open {
            warn!(
                breaker = self.name,
                failure_rate, timeout_rate, "Circuit breaker opened"
            );
            state.phase = Phase::Open;
            state.opened_at = Some(now);
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        !self.allow(now)
    }
}

fn push_window(window: &mut VecDeque<CallOutcome>, outcome: CallOutcome) {
    window.push_back(outcome);
    if window.len() > WINDOW_SIZE {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_760_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn opens_on_failure_rate() {
        let b = CircuitBreaker::new("llm_small", 0.30, 0.10);
        // 7 successes, 3 failures in 10 calls = 30% failure rate
        for _ in 0..7 {
            b.record_success(t(0));
        }
        for _ in 0..2 {
            b.record_failure("http 500", t(0));
        }
        assert!(b.allow(t(0)));
        b.record_failure("http 500", t(0));
        assert!(!b.allow(t(1)));
    }

    #[test]
    fn opens_on_timeout_rate() {
        let b = CircuitBreaker::new("embedding", 0.30, 0.10);
        for _ in 0..9 {
            b.record_success(t(0));
        }
        // 1/10 timeouts = 10%
        b.record_failure("timeout: embedding", t(0));
        assert!(!b.allow(t(1)));
    }

    #[test]
    fn below_min_volume_stays_closed() {
        let b = CircuitBreaker::new("llm_small", 0.30, 0.10);
        for _ in 0..5 {
            b.record_failure("http 500", t(0));
        }
        assert!(b.allow(t(0)));
    }

    #[test]
    fn half_open_probe_then_close() {
        let b = CircuitBreaker::new("llm_small", 0.30, 0.10);
        for _ in 0..10 {
            b.record_failure("http 500", t(0));
        }
        assert!(!b.allow(t(5)));

        // Cooldown elapsed: probe allowed
        assert!(b.allow(t(31)));
        b.record_success(t(31));
        b.record_success(t(32));
        assert!(b.allow(t(32)));
        b.record_success(t(33));

        // Closed again; a single failure does not re-open
        assert!(b.allow(t(34)));
        b.record_failure("http 500", t(34));
        assert!(b.allow(t(35)));
    }

    #[test]
    fn probe_failure_reopens() {
        let b = CircuitBreaker::new("llm_small", 0.30, 0.10);
        for _ in 0..10 {
            b.record_failure("http 500", t(0));
        }
        assert!(b.allow(t(31)));
        b.record_failure("http 500", t(31));
        assert!(!b.allow(t(32)));
        // And the cooldown restarts from the probe failure
        assert!(!b.allow(t(60)));
        assert!(b.allow(t(62)));
    }
}
