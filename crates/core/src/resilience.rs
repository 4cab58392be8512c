//! Retry and circuit-breaker building blocks for outbound connector
//! clients (SPEC_FULL.md §A.5). Grounded in
//! `runtime-core/src/transport/client/retry.rs` and `circuit_breaker.rs`.
//! The pipeline engine itself never retries (spec §4.4); these are
//! composed internally by request/response connectors that want their
//! own retry policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::Result;

/// Exponential backoff with jitter, matching
/// `transport/client/retry.rs::RetryExecutor`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 200,
        }
    }
}

pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        let max_attempts = self.config.max_retries + 1;
        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => {
                    if attempts > 1 {
                        debug!(attempts, "operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) if attempts < max_attempts => {
                    let backoff = self.config.backoff_ms.saturating_mul(1 << (attempts - 1));
                    warn!(attempts, backoff_ms = backoff, error = %e, "retrying after transient failure");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Circuit breaker state, matching
/// `transport/client/circuit_breaker.rs::CircuitState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Thread-safe circuit breaker protecting one outbound endpoint.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<Inner>>,
    endpoint: String,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            })),
            endpoint: endpoint.into(),
        }
    }

    /// Whether a request should currently be allowed through.
    pub fn allow_request(&self) -> bool {
        let mut guard = self.state.write();
        match guard.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if let Some(opened_at) = guard.opened_at {
                    if opened_at.elapsed() >= self.config.reset_timeout {
                        guard.state = CircuitState::HalfOpen;
                        guard.consecutive_successes = 0;
                        debug!(endpoint = %self.endpoint, "circuit breaker entering half-open");
                        return true;
                    }
                }
                false
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.state.write();
        guard.consecutive_failures = 0;
        if guard.state == CircuitState::HalfOpen {
            guard.consecutive_successes += 1;
            if guard.consecutive_successes >= self.config.success_threshold {
                guard.state = CircuitState::Closed;
                debug!(endpoint = %self.endpoint, "circuit breaker closed");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut guard = self.state.write();
        guard.consecutive_successes = 0;
        guard.consecutive_failures += 1;
        if guard.consecutive_failures >= self.config.failure_threshold
            && guard.state != CircuitState::Open
        {
            guard.state = CircuitState::Open;
            guard.opened_at = Some(Instant::now());
            warn!(endpoint = %self.endpoint, "circuit breaker opened");
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.read().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let executor = RetryExecutor::new(RetryConfig {
            max_retries: 2,
            backoff_ms: 1,
        });
        let calls = AtomicU32::new(0);
        let result: Result<()> = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::Error::transport("nope"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn breaker_opens_after_threshold_and_rejects() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(60),
            },
        );
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }
}
