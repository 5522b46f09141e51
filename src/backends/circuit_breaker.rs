//! Per-backend circuit breaker: trips after a run of consecutive failures,
//! waits out a recovery window, then lets a handful of probe requests
//! through before fully re-closing.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Tracks the health of one upstream backend. `can_execute` gates whether a
/// call should be attempted at all; `record_success`/`record_failure` feed
/// the outcome back in.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_requests: u32,
    inner: Mutex<Inner>,
}

#[derive(Debug, Serialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub failures: u32,
    pub successes: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_requests: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_requests,
            inner: Mutex::new(Inner { state: BreakerState::Closed, failures: 0, successes: 0, last_failure: None }),
        }
    }

    /// Whether a call is currently allowed through. Transitions `Open` to
    /// `HalfOpen` once `recovery_timeout` has elapsed since the last failure.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.half_open_requests {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                }
            }
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.successes = 0;
            }
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        BreakerStatus { state: inner.state, failures: inner.failures, successes: inner.successes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed_and_allows_calls() {
        let cb = CircuitBreaker::new(3, Duration::from_millis(50), 2);
        assert!(cb.can_execute());
        assert_eq!(cb.status().state, BreakerState::Closed);
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(30), 2);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.can_execute());
        cb.record_failure();
        assert_eq!(cb.status().state, BreakerState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn half_opens_after_recovery_timeout_elapses() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(20), 2);
        cb.record_failure();
        assert!(!cb.can_execute());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_execute());
        assert_eq!(cb.status().state, BreakerState::HalfOpen);
    }

    #[test]
    fn closes_again_after_enough_half_open_successes() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10), 2);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.status().state, BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.status().state, BreakerState::Closed);
    }

    #[test]
    fn a_single_half_open_failure_reopens_the_breaker() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10), 3);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.can_execute());
        cb.record_failure();
        assert_eq!(cb.status().state, BreakerState::Open);
    }
}
