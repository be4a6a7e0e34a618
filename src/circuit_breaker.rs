/*!
 * # Circuit Breaker
 *
 * Guards calls to external collaborators (payment gateway, invoice renderer,
 * mailer) so a failing dependency is short-circuited instead of stalling every
 * checkout behind its timeout.
 */

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

use crate::errors::ServiceError;

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Maximum number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub timeout: Duration,
    /// Number of successful requests needed in HalfOpen to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// Circuit breaker implementation
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<CircuitBreakerState>>,
}

/// Circuit breaker errors
#[derive(Error, Debug)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open")]
    CircuitOpen,
    #[error("Service call failed: {0}")]
    ServiceFailure(String),
}

impl From<CircuitBreakerError> for ServiceError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen => ServiceError::CircuitBreakerOpen,
            CircuitBreakerError::ServiceFailure(msg) => ServiceError::ExternalServiceError(msg),
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Execute an async operation with circuit breaker protection
    pub async fn call<F, Fut, R, E>(&self, f: F) -> Result<R, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: std::fmt::Display,
    {
        if !self.can_execute() {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match f().await {
            Ok(result) => {
                self.on_success();
                Ok(result)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitBreakerError::ServiceFailure(err.to_string()))
            }
        }
    }

    /// Like [`CircuitBreaker::call`], but a call that outlives `limit` counts as a failure.
    pub async fn call_with_timeout<F, Fut, R, E>(
        &self,
        limit: Duration,
        f: F,
    ) -> Result<R, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: std::fmt::Display,
    {
        let name = self.name;
        self.call(|| async move {
            match tokio::time::timeout(limit, f()).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("{} call timed out after {:?}", name, limit)),
            }
        })
        .await
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn can_execute(&self) -> bool {
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match state.last_failure_time {
                Some(last_failure) if last_failure.elapsed() >= self.config.timeout => {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    true
                }
                _ => false,
            },
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.last_failure_time = None;
                }
            }
            CircuitState::Open => {
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.success_count = 0;
                state.last_failure_time = None;
            }
        }
    }

    fn on_failure(&self) {
        let mut state = self.lock();

        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        let opened = match state.state {
            CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if opened {
            state.state = CircuitState::Open;
            state.success_count = 0;
            warn!(
                breaker = self.name,
                failures = state.failure_count,
                "circuit breaker opened"
            );
            metrics::increment_counter!("circuit_breaker_opened_total", "breaker" => self.name);
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.lock().state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                timeout,
                success_threshold: 1,
            },
        )
    }

    #[tokio::test]
    async fn stays_closed_on_success() {
        let cb = breaker(3, Duration::from_millis(100));

        let result = cb.call(|| async { Ok::<i32, &str>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects() {
        let cb = breaker(2, Duration::from_secs(60));

        let _ = cb.call(|| async { Err::<i32, &str>("boom") }).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = cb.call(|| async { Err::<i32, &str>("boom") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb.call(|| async { Ok::<i32, &str>(42) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn half_open_trial_call_closes_circuit() {
        let cb = breaker(1, Duration::from_millis(10));

        let _ = cb.call(|| async { Err::<(), &str>("boom") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = cb.call(|| async { Ok::<(), &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn slow_call_counts_as_failure() {
        let cb = breaker(1, Duration::from_secs(60));

        let result = cb
            .call_with_timeout(Duration::from_millis(10), || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), String>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::ServiceFailure(_))));
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
