// ABOUTME: Per-destination circuit breaker (CLOSED / OPEN / HALF_OPEN)
// ABOUTME: Permits settle outcomes; exactly one trial call is let through after the open window

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::DestinationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Value exported on the `circuit_breaker_state` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub threshold: u32,
    /// How long the breaker stays open before a trial call.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            open_timeout: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub destination: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(destination: impl Into<String>, config: BreakerConfig) -> Self {
        let breaker = Self {
            destination: destination.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                opened_at_wall: None,
            }),
        };
        breaker.publish(BreakerState::Closed);
        breaker
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    // A poisoned lock only means another worker panicked mid-update; the
    // counters are still consistent enough to keep serving.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to call the destination. Fails fast with `CircuitOpen` while open or
    /// while another caller holds the half-open trial.
    pub fn acquire(self: &Arc<Self>) -> Result<BreakerPermit, DestinationError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(self.permit(false)),
            BreakerState::Open => {
                let opened = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened.elapsed();
                if elapsed >= self.config.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    drop(inner);
                    self.publish(BreakerState::HalfOpen);
                    tracing::info!(destination = %self.destination, "circuit half-open, allowing one trial call");
                    Ok(self.permit(true))
                } else {
                    Err(self.rejection(self.config.open_timeout - elapsed))
                }
            }
            BreakerState::HalfOpen => {
                let wait = self.config.open_timeout.min(Duration::from_millis(250));
                Err(self.rejection(wait))
            }
        }
    }

    fn permit(self: &Arc<Self>, trial: bool) -> BreakerPermit {
        BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        }
    }

    fn rejection(&self, retry_after: Duration) -> DestinationError {
        DestinationError::CircuitOpen {
            destination: self.destination.clone(),
            retry_after,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        let was = inner.state;
        if trial || was == BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.opened_at_wall = None;
        }
        drop(inner);
        if trial && was != BreakerState::Closed {
            self.publish(BreakerState::Closed);
            tracing::info!(destination = %self.destination, "circuit closed after successful trial");
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let open = if trial {
            true
        } else {
            inner.state == BreakerState::Closed
                && inner.consecutive_failures >= self.config.threshold
        };
        if !open {
            return;
        }
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        let failures = inner.consecutive_failures;
        drop(inner);
        self.publish(BreakerState::Open);
        tracing::error!(
            destination = %self.destination,
            consecutive_failures = failures,
            open_for_ms = self.config.open_timeout.as_millis() as u64,
            "circuit breaker opened"
        );
    }

    fn publish(&self, state: BreakerState) {
        metrics::gauge!("circuit_breaker_state", "destination" => self.destination.clone())
            .set(state.gauge_value());
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            destination: self.destination.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at_wall,
        }
    }
}

/// Right to make one destination call. Settle with `success` or `failure`;
/// dropping an unsettled trial permit counts as a failure.
#[must_use]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

/// One breaker per destination name, created on first use.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, destination: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(destination, self.config)))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.destination.cmp(&b.destination));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "pg-replica",
            BreakerConfig {
                threshold,
                open_timeout: Duration::from_millis(timeout_ms),
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = breaker(5, 30_000);
        for _ in 0..4 {
            cb.acquire().unwrap().failure();
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.acquire().unwrap().failure();
        assert_eq!(cb.state(), BreakerState::Open);

        match cb.acquire() {
            Err(DestinationError::CircuitOpen { retry_after, .. }) => {
                assert!(retry_after <= Duration::from_millis(30_000));
            }
            other => panic!("expected fast failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_timeout() {
        let cb = breaker(1, 1_000);
        cb.acquire().unwrap().failure();
        assert!(cb.acquire().is_err());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let trial = cb.acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.acquire().is_err(), "second caller must be rejected during the trial");

        trial.success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        assert!(cb.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_restarts_timeout() {
        let cb = breaker(1, 1_000);
        cb.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        cb.acquire().unwrap().failure();
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.acquire().is_err());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_counts_as_failure() {
        let cb = breaker(1, 100);
        cb.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        drop(cb.acquire().unwrap());
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(3, 1_000);
        cb.acquire().unwrap().failure();
        cb.acquire().unwrap().failure();
        cb.acquire().unwrap().success();
        cb.acquire().unwrap().failure();
        cb.acquire().unwrap().failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_registry_shares_breakers_by_name() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.get("mysql-replica");
        let b = registry.get("mysql-replica");
        assert!(Arc::ptr_eq(&a, &b));
        registry.get("mongo-replica");
        let names: Vec<_> = registry.snapshots().into_iter().map(|s| s.destination).collect();
        assert_eq!(names, vec!["mongo-replica", "mysql-replica"]);
    }
}
