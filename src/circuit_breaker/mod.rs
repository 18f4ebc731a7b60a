//! Circuit breaker guarding admission, send and broadcast.
//!
//! One breaker is shared by every protected operation of a
//! `ConnectionManager`, so sustained failures on any path make all of them
//! fail fast until the recovery timeout has elapsed.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Successes required in half-open state before closing again
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;

fn current_time_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed, requests flow through normally
    Closed = 0,
    /// Circuit is open, requests are rejected
    Open = 1,
    /// Circuit is half-open, allowing test requests
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open state before closing
    pub success_threshold: u32,
    /// Quiet period after the last failure before probing again
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
///
/// `Rejected` is the fast-fail signal; the wrapped operation was never run.
#[derive(Debug)]
pub enum CallError<E> {
    Rejected,
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected)
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Rejected => f.write_str("circuit breaker is open"),
            CallError::Failed(e) => e.fmt(f),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CallError<E> {}

pub struct CircuitBreaker {
    /// Current state (0=Closed, 1=Open, 2=HalfOpen)
    state: AtomicU8,
    /// Consecutive failure count
    failure_count: AtomicU32,
    /// Consecutive success count (in half-open state)
    success_count: AtomicU32,
    /// Timestamp of the most recent failure (ms since epoch, 0 = never)
    last_failure: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure: AtomicI64::new(0),
            config,
        }
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.check_state_transition();
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Check if requests should be allowed
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    /// Run `op` under protection, counting every error as a failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(op, |_| true).await
    }

    /// Run `op` under protection.
    ///
    /// Errors for which `is_failure` returns false are passed through
    /// without touching the breaker's counters.
    pub async fn call_filtered<T, E, F, Fut, P>(
        &self,
        op: F,
        is_failure: P,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        if !self.allow_request() {
            tracing::debug!("Circuit breaker open, rejecting call");
            return Err(CallError::Rejected);
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.record_failure();
                }
                Err(CallError::Failed(e))
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let state = CircuitState::from(self.state.load(Ordering::Acquire));

        match state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let success_count = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if success_count >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                    tracing::info!("Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let state = CircuitState::from(self.state.load(Ordering::Acquire));
        self.last_failure.store(current_time_ms(), Ordering::Release);
        let failure_count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match state {
            CircuitState::Closed => {
                if failure_count >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                    tracing::warn!(
                        failures = failure_count,
                        "Circuit breaker opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while probing reopens the circuit
                self.transition_to(CircuitState::Open);
                tracing::warn!("Circuit breaker reopened after failure in half-open state");
            }
            CircuitState::Open => {}
        }
    }

    /// Check if we should transition from Open to HalfOpen
    fn check_state_transition(&self) {
        let state = CircuitState::from(self.state.load(Ordering::Acquire));

        if state == CircuitState::Open {
            let last_failure = self.last_failure.load(Ordering::Acquire);
            let elapsed = current_time_ms() - last_failure;

            if elapsed > self.config.recovery_timeout.as_millis() as i64
                && self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                self.success_count.store(0, Ordering::Release);
                tracing::info!("Circuit breaker transitioning to half-open state");
            }
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        self.state.store(new_state as u8, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        if new_state == CircuitState::Closed {
            self.failure_count.store(0, Ordering::Release);
        }
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> CircuitBreakerStats {
        let last_failure = self.last_failure.load(Ordering::Acquire);
        CircuitBreakerStats {
            state: self.state(),
            consecutive_failures: self.failure_count.load(Ordering::Acquire),
            half_open_successes: self.success_count.load(Ordering::Acquire),
            last_failure_at: (last_failure > 0)
                .then(|| DateTime::from_timestamp_millis(last_failure))
                .flatten(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn config(failure_threshold: u32, recovery_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 3,
            recovery_timeout: Duration::from_millis(recovery_ms),
        }
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::new();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
        assert!(cb.stats().last_failure_at.is_none());
    }

    #[test]
    fn test_circuit_breaker_opens_on_failures() {
        let cb = CircuitBreaker::with_config(config(3, 1000));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure(); // 3rd failure
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert!(cb.stats().last_failure_at.is_some());
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let cb = CircuitBreaker::with_config(config(3, 1000));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed); // Still closed, need 3 consecutive
    }

    #[test]
    fn test_circuit_breaker_closes_after_three_successes() {
        let cb = CircuitBreaker::with_config(config(1, 10));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[test]
    fn test_circuit_breaker_reopens_on_half_open_failure() {
        let cb = CircuitBreaker::with_config(config(1, 10));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        let state_raw = CircuitState::from(cb.state.load(Ordering::Acquire));
        assert_eq!(state_raw, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_open() {
        let cb = CircuitBreaker::with_config(config(2, 60_000));

        for _ in 0..2 {
            let result: Result<(), CallError<&str>> = cb.call(|| async { Err("boom") }).await;
            assert!(matches!(result, Err(CallError::Failed("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicBool::new(false);
        let result: Result<(), CallError<&str>> = cb
            .call(|| async {
                invoked.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_rejected());
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_call_retries_after_recovery_timeout() {
        let cb = CircuitBreaker::with_config(config(1, 20));

        let _: Result<(), _> = cb.call(|| async { Err("down") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        for _ in 0..3 {
            let result: Result<u32, CallError<&str>> = cb.call(|| async { Ok(7) }).await;
            assert_eq!(result.unwrap(), 7);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_filtered_ignores_neutral_errors() {
        let cb = CircuitBreaker::with_config(config(1, 60_000));

        let result: Result<(), CallError<&str>> = cb
            .call_filtered(|| async { Err("policy") }, |_| false)
            .await;

        assert!(matches!(result, Err(CallError::Failed("policy"))));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }
}
