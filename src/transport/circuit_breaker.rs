//! Three-state circuit breaker guarding pool acquisition (§4.1).

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::CircuitBreakerConfig;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure_at: Option<Instant>,
}

/// Shared, lock-guarded circuit breaker. Cheap to clone (an `Arc` wrapper
/// is expected at the call site; this type itself just holds the mutex).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Gate checked on every pool acquisition; transitions open -> half_open
    /// once `recovery_timeout` has elapsed.
    pub fn allow_request(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.last_failure_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_calls = 1;
                    Ok(())
                } else {
                    Err(TransportError::CircuitOpen {
                        retry_after: self.config.recovery_timeout.saturating_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(TransportError::CircuitOpen { retry_after: Duration::from_secs(0) })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_calls = 0;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.half_open_calls = 0;
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold, recovery_timeout, success_threshold, half_open_max_calls: 3 }
    }

    #[test]
    fn opens_after_failure_threshold() {
        let cb = CircuitBreaker::new(config(2, Duration::from_millis(100), 1));
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow_request().is_err());
    }

    #[test]
    fn half_opens_after_recovery_timeout_and_closes_on_success() {
        let cb = CircuitBreaker::new(config(2, Duration::from_millis(50), 1));
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow_request().is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow_request().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(config(1, Duration::from_millis(10), 2));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow_request().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
