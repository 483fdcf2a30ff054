//! Liveness probing for individual pooled connections.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tether_shared::{ClientId, ConnectionHealthState, TetherError, TetherResult};
use tokio::sync::RwLock;
use tokio::time::timeout;

/// Result of probing one connection endpoint
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub state: ConnectionHealthState,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            state: ConnectionHealthState::Healthy,
            response_time_ms,
            error: None,
        }
    }

    pub fn degraded(response_time_ms: u64, reason: String) -> Self {
        Self {
            state: ConnectionHealthState::Degraded,
            response_time_ms,
            error: Some(reason),
        }
    }

    pub fn unhealthy(error: String) -> Self {
        Self {
            state: ConnectionHealthState::Unhealthy,
            response_time_ms: 0,
            error: Some(error),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.state != ConnectionHealthState::Unhealthy
    }
}

/// Trait for probing the transport-level liveness of one connection
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, client_id: &ClientId) -> TetherResult<ProbeOutcome>;
}

/// Run a probe with a hard deadline; a timeout is an unhealthy outcome.
pub async fn probe_with_timeout(
    probe: &dyn HealthProbe,
    client_id: &ClientId,
    deadline: Duration,
) -> ProbeOutcome {
    match timeout(deadline, probe.probe(client_id)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => ProbeOutcome::unhealthy(e.to_string()),
        Err(_) => {
            ProbeOutcome::unhealthy(TetherError::timeout("health probe").to_string())
        }
    }
}

/// Default probe for transports without a liveness channel
#[derive(Debug, Default)]
pub struct NoopProbe;

#[async_trait]
impl HealthProbe for NoopProbe {
    async fn probe(&self, _client_id: &ClientId) -> TetherResult<ProbeOutcome> {
        Ok(ProbeOutcome::healthy(0))
    }
}

/// Exponentially weighted moving average of probe latencies.
///
/// Feeds `average_latency_ms` in the pool's registry heartbeats.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    alpha: f64,
    value: Arc<RwLock<Option<f64>>>,
}

impl LatencyTracker {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            value: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn record(&self, latency_ms: f64) {
        let mut value = self.value.write().await;
        *value = Some(match *value {
            Some(current) => current + self.alpha * (latency_ms - current),
            None => latency_ms,
        });
    }

    pub async fn average_ms(&self) -> f64 {
        self.value.read().await.unwrap_or(0.0)
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(0.2)
    }
}
