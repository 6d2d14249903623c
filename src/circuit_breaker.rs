// =============================================================================
// Circuit Breaker (C3) — wraps C2 per operation
// =============================================================================
//
// Same internal shape as the teacher's `RiskEngine`: a private `Inner` behind
// a `parking_lot::RwLock`, with a public `Serialize`-able snapshot struct for
// diagnostics. Generalized from four hard-coded trading breakers into one
// generic wrapper any fallible async call can go through.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::ErrorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout_secs: i64,
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 60,
            half_open_successes: 2,
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    half_open_success_count: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    fast_failures: u64,
    successful_recoveries: u64,
    last_failure_time: Option<i64>,
    next_attempt_time: Option<i64>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_success_count: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            fast_failures: 0,
            successful_recoveries: 0,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

/// Point-in-time metrics snapshot (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub enabled: bool,
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub fast_failures: u64,
    pub successful_recoveries: u64,
    pub success_rate: f64,
    pub last_failure_time: Option<i64>,
    pub next_attempt_time: Option<i64>,
}

/// Wraps fallible async upstream calls with closed/open/half-open breaker
/// logic. `enabled` is backed by an `AtomicBool` so the feature-flag gate
/// (C8) can toggle pass-through mode without taking the state lock.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    enabled: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(Inner::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Run `call` through the breaker. When disabled, this is a transparent
    /// pass-through. `classify` maps an `Err` into whether it counts against
    /// the breaker (§4.2/§4.3: business outcomes never count).
    pub async fn call<F, Fut, T>(
        &self,
        call: F,
        classify: impl Fn(&T) -> Option<ErrorType>,
    ) -> Result<T, ErrorType>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(call().await);
        }

        if let Some(fast_failure) = self.check_fast_fail() {
            return Err(fast_failure);
        }

        let outcome = call().await;
        let failure = classify(&outcome);
        self.record_outcome(failure);

        match failure {
            Some(err) if err.counts_as_breaker_failure() => Err(err),
            _ => Ok(outcome),
        }
    }

    fn check_fast_fail(&self) -> Option<ErrorType> {
        let mut inner = self.inner.write();
        inner.total_requests += 1;

        if inner.state != CircuitState::Open {
            return None;
        }

        let now = Utc::now().timestamp();
        match inner.next_attempt_time {
            Some(next) if now >= next => {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_success_count = 0;
                info!(breaker = %self.name, "circuit breaker transitioning to half-open");
                None
            }
            _ => {
                inner.fast_failures += 1;
                Some(ErrorType::CircuitOpen)
            }
        }
    }

    fn record_outcome(&self, failure: Option<ErrorType>) {
        let counts_as_failure = failure
            .map(|e| e.counts_as_breaker_failure())
            .unwrap_or(false);

        let mut inner = self.inner.write();

        if counts_as_failure {
            inner.failed_requests += 1;
            inner.failure_count += 1;
            inner.last_failure_time = Some(Utc::now().timestamp());

            match inner.state {
                CircuitState::HalfOpen => {
                    warn!(breaker = %self.name, "half-open probe failed, re-opening");
                    self.trip(&mut inner);
                }
                CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    warn!(breaker = %self.name, failures = inner.failure_count, "failure threshold reached, opening");
                    self.trip(&mut inner);
                }
                _ => {}
            }
        } else {
            inner.successful_requests += 1;

            match inner.state {
                CircuitState::HalfOpen => {
                    inner.half_open_success_count += 1;
                    if inner.half_open_success_count >= self.config.half_open_successes {
                        inner.successful_recoveries += 1;
                        inner.state = CircuitState::Closed;
                        inner.failure_count = 0;
                        info!(breaker = %self.name, "circuit breaker closed after recovery");
                    }
                }
                CircuitState::Closed => {
                    inner.failure_count = 0;
                }
                CircuitState::Open => {}
            }
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.next_attempt_time =
            Some(Utc::now().timestamp() + self.config.open_timeout_secs);
    }

    pub fn force_open(&self) {
        let mut inner = self.inner.write();
        self.trip(&mut inner);
        warn!(breaker = %self.name, "circuit breaker forced open");
    }

    pub fn force_close(&self) {
        let mut inner = self.inner.write();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.next_attempt_time = None;
        info!(breaker = %self.name, "circuit breaker forced closed");
    }

    pub fn reset_metrics(&self) {
        let mut inner = self.inner.write();
        let state = inner.state;
        *inner = Inner::new();
        inner.state = state;
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.read();
        let success_rate = if inner.total_requests == 0 {
            1.0
        } else {
            inner.successful_requests as f64 / inner.total_requests as f64
        };
        CircuitBreakerMetrics {
            enabled: self.enabled.load(Ordering::Relaxed),
            state: inner.state,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            fast_failures: inner.fast_failures,
            successful_recoveries: inner.successful_recoveries,
            success_rate,
            last_failure_time: inner.last_failure_time,
            next_attempt_time: inner.next_attempt_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold_two() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout_secs: 60,
            half_open_successes: 1,
        }
    }

    fn classify_result(outcome: &Result<(), ErrorType>) -> Option<ErrorType> {
        outcome.err()
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new("test", threshold_two());
        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), _>(ErrorType::ConnectionError) }, classify_result)
                .await;
        }
        assert_eq!(breaker.metrics().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_breaker_fast_fails_without_calling() {
        let breaker = CircuitBreaker::new("test", threshold_two());
        breaker.force_open();
        let mut called = false;
        let result = breaker
            .call(
                || async {
                    called = true;
                    Ok::<_, ErrorType>(())
                },
                classify_result,
            )
            .await;
        assert!(!called);
        assert_eq!(result, Err(ErrorType::CircuitOpen));
    }

    #[tokio::test]
    async fn business_outcomes_do_not_trip_breaker() {
        let breaker = CircuitBreaker::new("test", threshold_two());
        for _ in 0..5 {
            let _ = breaker
                .call(
                    || async { Err::<(), _>(ErrorType::BidTooLow) },
                    classify_result,
                )
                .await;
        }
        assert_eq!(breaker.metrics().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn disabled_breaker_is_pure_pass_through() {
        let breaker = CircuitBreaker::new("test", threshold_two());
        breaker.set_enabled(false);
        for _ in 0..10 {
            let _ = breaker
                .call(
                    || async { Err::<(), _>(ErrorType::ConnectionError) },
                    classify_result,
                )
                .await;
        }
        assert!(!breaker.metrics().enabled);
        assert_eq!(breaker.metrics().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn force_close_resets_to_closed() {
        let breaker = CircuitBreaker::new("test", threshold_two());
        breaker.force_open();
        breaker.force_close();
        assert_eq!(breaker.metrics().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_metrics_clears_counters_but_keeps_state() {
        let breaker = CircuitBreaker::new("test", threshold_two());
        breaker.force_open();
        breaker.reset_metrics();
        let metrics = breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.total_requests, 0);
    }
}
