// src/circuit_breaker.rs

use crate::config::CircuitBreakerConfig;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failing fast
    HalfOpen, // Testing for recovery
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.next_attempt = None;
    }
}

/// Read-only view of the breaker for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub next_attempt_in_ms: Option<u64>,
}

/// Clears the half-open trial flag even if the guarded call is dropped.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    active: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.breaker.state.lock().trial_in_flight = false;
        }
    }
}

/// Process-wide breaker guarding every upstream call.
///
/// Failures accumulate until `failure_threshold` trips the breaker to `Open`.
/// Once `open_duration` has elapsed a single trial call is admitted in
/// `HalfOpen`; `success_threshold` successes close it again, and any failure
/// while half-open re-opens it. Counters are only zeroed by a full reset.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Run `operation` if the breaker admits it, recording the outcome.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _trial = self.admit()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure();
                Err(error)
            }
        }
    }

    fn admit(&self) -> Result<TrialGuard<'_>> {
        let mut state = self.state.lock();
        let now = Instant::now();

        if state.state == CircuitState::Open {
            match state.next_attempt {
                Some(next) if now >= next => {
                    info!("Circuit breaker transitioning to HALF_OPEN");
                    state.state = CircuitState::HalfOpen;
                }
                _ => {
                    debug!("Circuit breaker is OPEN, failing fast");
                    return Err(AppError::CircuitOpen);
                }
            }
        }

        if state.state == CircuitState::HalfOpen {
            if state.trial_in_flight {
                debug!("Circuit breaker trial already in flight, failing fast");
                return Err(AppError::CircuitOpen);
            }
            state.trial_in_flight = true;
            return Ok(TrialGuard {
                breaker: self,
                active: true,
            });
        }

        Ok(TrialGuard {
            breaker: self,
            active: false,
        })
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen {
            state.success_count += 1;
            if state.success_count >= self.config.success_threshold {
                info!("Circuit breaker closing after successful recovery");
                state.reset();
            }
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;

        if state.state == CircuitState::HalfOpen
            || state.failure_count >= self.config.failure_threshold
        {
            warn!(
                failure_count = state.failure_count,
                threshold = self.config.failure_threshold,
                previous_state = ?state.state,
                "Circuit breaker opening"
            );
            state.state = CircuitState::Open;
            state.next_attempt = Some(Instant::now() + self.config.open_duration());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let state = self.state.lock();
        let now = Instant::now();
        CircuitBreakerStatus {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            next_attempt_in_ms: state
                .next_attempt
                .map(|next| next.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_duration_ms: 100,
        })
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err::<(), _>(AppError::Internal("boom".into())) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.execute(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_closed_passes_results_through() {
        let cb = breaker();
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert!(matches!(fail(&cb).await, Err(AppError::Internal(_))));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_in_closed_keeps_failure_count() {
        let cb = breaker();
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.status().failure_count, 2);
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_and_rejects_without_invoking() {
        let cb = breaker();
        for _ in 0..3 {
            fail(&cb).await.ok();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let mut invoked = false;
        let result = cb
            .execute(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(AppError::CircuitOpen)));
        assert!(!invoked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timeout() {
        let cb = breaker();
        for _ in 0..3 {
            fail(&cb).await.ok();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        fail(&cb).await.ok();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 4);
        assert_eq!(status.next_attempt_in_ms, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_successes_reset() {
        let cb = breaker();
        for _ in 0..3 {
            fail(&cb).await.ok();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.status().success_count, 1);

        succeed(&cb).await.unwrap();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 0);
        assert_eq!(status.next_attempt_in_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_in_flight() {
        let cb = breaker();
        for _ in 0..3 {
            fail(&cb).await.ok();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let trial = cb.execute(|| async move {
            wait.await.ok();
            Ok(())
        });
        tokio::pin!(trial);

        // Drive the trial until it parks on the channel.
        assert!(futures_util::poll!(&mut trial).is_pending());
        assert!(matches!(succeed(&cb).await, Err(AppError::CircuitOpen)));

        release.send(()).unwrap();
        trial.await.unwrap();
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let cb = breaker();
        for _ in 0..3 {
            fail(&cb).await.ok();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        {
            let trial = cb.execute(|| std::future::pending::<Result<()>>());
            tokio::pin!(trial);
            assert!(futures_util::poll!(&mut trial).is_pending());
        }

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[test]
    fn test_state_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            "HALF_OPEN"
        );
    }
}
