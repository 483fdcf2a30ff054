//! Fleet-level metrics snapshots and threshold alerting.

use crate::mesh::{HealthStatus, PoolId, PoolRegistryEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Periodic snapshot of fleet-wide pool state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetMetrics {
    pub total_pools: usize,
    pub healthy_pools: usize,
    pub total_capacity: u64,
    pub available_capacity: u64,
    pub average_latency_ms: f64,
    pub failover_events: u64,
}

impl FleetMetrics {
    /// Build a snapshot from the registry's current entries.
    pub fn from_entries(
        entries: &[PoolRegistryEntry],
        staleness_threshold: Duration,
        failover_events: u64,
    ) -> Self {
        let total_pools = entries.len();
        let healthy_pools = entries
            .iter()
            .filter(|e| e.effective_status(staleness_threshold) == HealthStatus::Healthy)
            .count();
        let total_capacity: u64 = entries.iter().map(|e| e.max_capacity as u64).sum();
        let used: u64 = entries.iter().map(|e| e.current_load as u64).sum();
        let average_latency_ms = if entries.is_empty() {
            0.0
        } else {
            entries.iter().map(|e| e.average_latency_ms).sum::<f64>() / entries.len() as f64
        };

        Self {
            total_pools,
            healthy_pools,
            total_capacity,
            available_capacity: total_capacity.saturating_sub(used),
            average_latency_ms,
            failover_events,
        }
    }

    /// Fleet-wide capacity utilization in [0.0, 1.0]
    pub fn utilization(&self) -> f64 {
        if self.total_capacity == 0 {
            return 0.0;
        }
        1.0 - (self.available_capacity as f64 / self.total_capacity as f64)
    }

    /// Publish the snapshot through the `metrics` facade.
    pub fn publish(&self) {
        metrics::gauge!("tether.pools.total").set(self.total_pools as f64);
        metrics::gauge!("tether.pools.healthy").set(self.healthy_pools as f64);
        metrics::gauge!("tether.capacity.total").set(self.total_capacity as f64);
        metrics::gauge!("tether.capacity.available").set(self.available_capacity as f64);
        metrics::gauge!("tether.latency.average_ms").set(self.average_latency_ms);
        metrics::gauge!("tether.failover.events").set(self.failover_events as f64);
    }
}

/// Threshold-crossing conditions reported to the alerting sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Alert {
    UtilizationHigh { utilization: f64 },
    LatencyHigh { average_latency_ms: f64 },
    PoolUnhealthy { pool_id: PoolId },
}

/// Alerting thresholds for the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub utilization: f64,
    pub latency_ms: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            utilization: 0.85,
            latency_ms: 100.0,
        }
    }
}

impl AlertThresholds {
    /// Evaluate a snapshot against the thresholds.
    pub fn evaluate(
        &self,
        snapshot: &FleetMetrics,
        entries: &[PoolRegistryEntry],
        staleness_threshold: Duration,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        if snapshot.utilization() > self.utilization {
            alerts.push(Alert::UtilizationHigh {
                utilization: snapshot.utilization(),
            });
        }
        if snapshot.average_latency_ms > self.latency_ms {
            alerts.push(Alert::LatencyHigh {
                average_latency_ms: snapshot.average_latency_ms,
            });
        }
        for entry in entries {
            if entry.effective_status(staleness_threshold) != HealthStatus::Healthy {
                alerts.push(Alert::PoolUnhealthy {
                    pool_id: entry.pool_id.clone(),
                });
            }
        }

        alerts
    }
}

/// Observability collaborator receiving snapshots and alerts
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn on_snapshot(&self, snapshot: &FleetMetrics);
    async fn on_alert(&self, alert: &Alert);
}

/// Default sink: structured log lines only
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    async fn on_snapshot(&self, snapshot: &FleetMetrics) {
        info!(
            total_pools = snapshot.total_pools,
            healthy_pools = snapshot.healthy_pools,
            available = snapshot.available_capacity,
            avg_latency_ms = snapshot.average_latency_ms,
            "fleet metrics snapshot"
        );
    }

    async fn on_alert(&self, alert: &Alert) {
        warn!(?alert, "fleet alert");
    }
}
