//! Fail-fast guard for calls against a pool or the registry endpoint.
//!
//! State transitions:
//! - Closed -> Open: `failure_threshold` consecutive failures
//! - Open -> HalfOpen: `cooldown` elapsed since the last failure
//! - HalfOpen -> Closed: the single trial call succeeds
//! - HalfOpen -> Open: the trial call fails, restarting the cooldown

use crate::exception::{TetherError, TetherResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Circuit breaker configuration, applied per target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial call
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Current state of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    // At most one trial call may be in flight while half-open
    trial_in_flight: bool,
}

/// Three-state circuit breaker guarding one target (a pool or the registry)
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new<S: Into<String>>(target: S, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                trial_in_flight: false,
            })),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().await;
        self.refresh_state(&mut inner);
        inner.state
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    /// Run `operation` through the breaker, recording its outcome.
    pub async fn execute<F, T>(&self, operation: F) -> TetherResult<T>
    where
        F: Future<Output = TetherResult<T>>,
    {
        self.try_acquire().await?;

        match operation.await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure().await;
                Err(e)
            }
        }
    }

    /// Record a successful call against this target.
    pub async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            debug!(target = %self.target, "circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
    }

    /// Record a failed call against this target.
    pub async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                // Failed trial restarts the cooldown clock
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                warn!(target = %self.target, "trial call failed, circuit re-opened");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        target = %self.target,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn try_acquire(&self) -> TetherResult<()> {
        let mut inner = self.inner.lock().await;
        self.refresh_state(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!(target = %self.target, "admitting trial call");
                Ok(())
            }
            _ => Err(TetherError::circuit_open(self.target.clone())),
        }
    }

    fn refresh_state(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .last_failure_at
                .map_or(true, |at| at.elapsed() >= self.config.cooldown);
            if cooled_down {
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = false;
            }
        }
    }
}
