//! Circuit breaker over database acquisitions (§4.1, §8 property 7).
//!
//! `closed -> open` after `error_threshold` consecutive connection/timeout
//! errors; `open -> half-open` after `reset_timeout_ms`; `half-open ->
//! closed` on the next successful probe, `half-open -> open` on failure.

use parking_lot::Mutex;
use pipeline_config::BreakerConfig;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_errors: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_errors: 0,
                opened_at: None,
            }),
        }
    }

    /// Call before attempting an acquisition. Transitions `open -> half-open`
    /// automatically once `reset_timeout_ms` has elapsed, and returns
    /// whether the caller may proceed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= Duration::from_millis(self.config.reset_timeout_ms) {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_errors = 0;
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
    }

    /// Records a failure. Only connection/timeout-class errors should be
    /// passed in (the caller is expected to have classified first via
    /// `error::classify`); a half-open probe failure immediately reopens.
    pub fn record_connection_error(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.consecutive_errors += 1;
                if inner.consecutive_errors >= self.config.error_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            error_threshold: 3,
            reset_timeout_ms: 50,
        }
    }

    #[test]
    fn trips_after_threshold_consecutive_errors() {
        let breaker = CircuitBreaker::new(cfg());
        assert!(breaker.allow_request());
        breaker.record_connection_error();
        breaker.record_connection_error();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_connection_error();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn success_resets_counter() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.record_connection_error();
        breaker.record_connection_error();
        breaker.record_success();
        breaker.record_connection_error();
        breaker.record_connection_error();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_opens_after_reset_timeout_and_closes_on_success() {
        let breaker = CircuitBreaker::new(cfg());
        for _ in 0..3 {
            breaker.record_connection_error();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(cfg());
        for _ in 0..3 {
            breaker.record_connection_error();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_request());
        breaker.record_connection_error();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }
}
