use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-endpoint health state machine. Closed lets traffic flow; after
/// `failure_threshold` consecutive failures the breaker opens and blocks
/// traffic until `recovery_timeout` elapses, then admits one trial request
/// in half-open state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    failure_count: Arc<AtomicU32>,
    endpoint: String,
}

#[derive(Debug, Clone)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(endpoint: String, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        debug!(
            "Creating circuit breaker for '{}' with threshold {} and timeout {:?}",
            endpoint, failure_threshold, recovery_timeout
        );

        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_threshold,
            recovery_timeout,
            failure_count: Arc::new(AtomicU32::new(0)),
            endpoint,
        }
    }

    pub fn with_defaults(endpoint: String) -> Self {
        Self::new(endpoint, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }

    /// Whether a request may be sent to this endpoint right now. An open
    /// breaker whose recovery timeout has elapsed transitions to half-open
    /// and admits the caller as the single trial request.
    pub fn allow_request(&self) -> bool {
        {
            let state = self.state.read();
            match *state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open { opened_at } => {
                    if opened_at.elapsed() < self.recovery_timeout {
                        debug!("Circuit for '{}' is open, rejecting", self.endpoint);
                        return false;
                    }
                }
            }
        }

        let mut state = self.state.write();
        // Re-check under the write lock; another caller may have raced.
        if let CircuitState::Open { opened_at } = *state {
            if opened_at.elapsed() >= self.recovery_timeout {
                *state = CircuitState::HalfOpen;
                info!("Circuit for '{}' transitioning to half-open", self.endpoint);
            } else {
                return false;
            }
        }
        true
    }

    pub fn record_success(&self) {
        let previous = self.failure_count.swap(0, Ordering::SeqCst);

        let mut state = self.state.write();
        match *state {
            CircuitState::HalfOpen => {
                *state = CircuitState::Closed;
                info!("Circuit for '{}' recovered, closing", self.endpoint);
            }
            CircuitState::Open { .. } => {
                *state = CircuitState::Closed;
                warn!(
                    "Circuit for '{}' saw a success while open, forcing closed",
                    self.endpoint
                );
            }
            CircuitState::Closed => {
                if previous > 0 {
                    debug!(
                        "Circuit for '{}' reset failure count from {}",
                        self.endpoint, previous
                    );
                }
            }
        }
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "Circuit for '{}' failure {}/{}",
            self.endpoint, failures, self.failure_threshold
        );

        let mut state = self.state.write();
        match *state {
            CircuitState::HalfOpen => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                warn!("Circuit for '{}' re-opened during trial", self.endpoint);
            }
            CircuitState::Closed if failures >= self.failure_threshold => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                warn!(
                    "Circuit for '{}' opened after {} consecutive failures",
                    self.endpoint, failures
                );
            }
            _ => {}
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.read(), CircuitState::Open { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.read(), CircuitState::Closed)
    }

    pub fn is_half_open(&self) -> bool {
        matches!(*self.state.read(), CircuitState::HalfOpen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new("https://e1.test".to_string(), threshold, recovery)
    }

    #[test]
    fn test_closed_to_open_at_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        assert!(cb.is_closed());

        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_closed());
        assert!(cb.allow_request());

        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.allow_request());
        assert_eq!(cb.failure_count(), 3);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(5, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.is_closed());
    }

    #[tokio::test]
    async fn test_recovery_via_half_open() {
        let cb = breaker(1, Duration::from_millis(40));
        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.allow_request());

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Timeout elapsed: one trial request is admitted.
        assert!(cb.allow_request());
        assert!(cb.is_half_open());

        cb.record_success();
        assert!(cb.is_closed());
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(40));
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cb.allow_request());
        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.allow_request());
    }
}
