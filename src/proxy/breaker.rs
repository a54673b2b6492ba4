//! Circuit breaker for the Copilot upstream.
//!
//! States transition as follows:
//!
//!   Closed (normal) --[5 consecutive failures]--> Open (reject all)
//!   Open --[timeout since last failure]--> HalfOpen (admit one probe)
//!   HalfOpen --[success]--> Closed
//!   HalfOpen --[failure]--> Open
//!
//! Admission checks are read-cheap; state transitions serialize on the
//! write lock, so observers see a linearizable history.

use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Consecutive failures required to trip from Closed to Open.
const FAILURE_THRESHOLD: u32 = 5;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Shared circuit breaker guarding the upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    timeout: Duration,
}

impl CircuitBreaker {
    /// Create a breaker that stays Open for `timeout` after the last
    /// failure before admitting a half-open probe.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
            timeout,
        }
    }

    /// Whether the breaker currently admits a request.
    ///
    /// An Open breaker whose timeout has elapsed transitions to HalfOpen
    /// and admits the caller as the probe.
    pub fn allow(&self) -> bool {
        {
            let inner = self.inner.read().expect("breaker lock poisoned");
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open => match inner.last_failure {
                    Some(t) if t.elapsed() > self.timeout => {}
                    _ => return false,
                },
            }
        }

        // Timeout elapsed: upgrade to the write lock and re-check, since
        // another probe may have raced us here.
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Open => match inner.last_failure {
                Some(t) if t.elapsed() > self.timeout => {
                    inner.state = CircuitState::HalfOpen;
                    true
                }
                _ => false,
            },
            _ => true,
        }
    }

    /// Record a successful upstream exchange.
    pub fn record_success(&self) {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
    }

    /// Record a failed upstream exchange (transport error or 5xx).
    pub fn record_failure(&self) {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
            }
            _ => {
                if inner.failure_count >= FAILURE_THRESHOLD {
                    inner.state = CircuitState::Open;
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().expect("breaker lock poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner
            .read()
            .expect("breaker lock poisoned")
            .failure_count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_admits() {
        let cb = CircuitBreaker::new(Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn test_trips_after_five_failures() {
        let cb = CircuitBreaker::new(Duration::from_secs(30));
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
        assert_eq!(cb.failure_count(), 5);
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = CircuitBreaker::new(Duration::from_secs(30));
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_within_timeout() {
        let cb = CircuitBreaker::new(Duration::from_secs(60));
        for _ in 0..5 {
            cb.record_failure();
        }
        assert!(!cb.allow());
        assert!(!cb.allow());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_probe_after_timeout() {
        let cb = CircuitBreaker::new(Duration::from_millis(0));
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Zero timeout: the next admission check becomes the probe.
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes_with_zero_counter() {
        let cb = CircuitBreaker::new(Duration::from_millis(0));
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(Duration::from_millis(0));
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_concurrent_admission_is_safe() {
        let cb = std::sync::Arc::new(CircuitBreaker::new(Duration::from_secs(30)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cb = cb.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = cb.allow();
                    cb.record_failure();
                    cb.record_success();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Final success leaves the breaker closed.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
