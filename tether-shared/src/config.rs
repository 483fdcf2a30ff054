use crate::exception::{TetherError, TetherResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fleet-wide configuration for pools, routing, and failover.
///
/// A single structured object; every cross-process component takes the
/// relevant slice of it at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Maximum connections a single pool will hold
    pub max_connections_per_pool: u32,
    /// Capacity floor used by utilization alerting
    pub min_connections_per_pool: u32,
    /// Interval between health sweeps over a pool's connections
    pub health_check_interval: Duration,
    /// Overall bound on admitting one connection (selection included)
    pub connection_timeout: Duration,
    /// Idle age beyond which a connection is unhealthy without probing
    pub max_idle_time: Duration,
    /// Sliding inactivity window for session affinity
    pub affinity_window: Duration,
    /// Consecutive failures before a circuit opens
    pub circuit_failure_threshold: u32,
    /// Cool-down before an open circuit admits a trial call
    pub circuit_cooldown: Duration,
    /// Load fraction at or above which a pool is excluded from routing
    pub max_load_threshold: f64,

    /// Interval between heartbeat upserts to the registry
    pub heartbeat_interval: Duration,
    /// Bound on any single coordination-store call
    pub registry_call_timeout: Duration,
    /// Liveness probe timeout, independent of the registry's
    pub probe_timeout: Duration,
    /// Heartbeat staleness (x heartbeat_interval) that marks a pool Suspected
    pub staleness_soft_multiplier: u32,
    /// Heartbeat staleness (x heartbeat_interval) that marks a pool Failed
    pub staleness_hard_multiplier: u32,
    /// Probe failures that force a pool Failed regardless of heartbeats
    pub probe_failure_threshold: u32,
    /// Transient-error retry budget for a single selection
    pub selection_retry_limit: u32,
    /// Initial selection retry backoff, doubled per attempt
    pub selection_backoff_initial: Duration,
    /// Per-connection migration retry budget
    pub migration_retry_limit: u32,
    /// Initial migration retry backoff, doubled per attempt
    pub migration_backoff_initial: Duration,
    /// Grace period for un-acknowledged connections on a Failed pool
    pub drain_grace_period: Duration,
    /// How long a cached registry snapshot may serve selection during outages
    pub snapshot_cache_ttl: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_connections_per_pool: 10_000,
            min_connections_per_pool: 0,
            health_check_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(5),
            max_idle_time: Duration::from_secs(300),
            affinity_window: Duration::from_secs(1800),
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
            max_load_threshold: 0.85,
            heartbeat_interval: Duration::from_secs(10),
            registry_call_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            staleness_soft_multiplier: 2,
            staleness_hard_multiplier: 5,
            probe_failure_threshold: 3,
            selection_retry_limit: 2,
            selection_backoff_initial: Duration::from_millis(50),
            migration_retry_limit: 3,
            migration_backoff_initial: Duration::from_millis(100),
            drain_grace_period: Duration::from_secs(30),
            snapshot_cache_ttl: Duration::from_secs(30),
        }
    }
}

impl FleetConfig {
    pub fn validate(&self) -> TetherResult<()> {
        if self.max_connections_per_pool == 0 {
            return Err(TetherError::configuration(
                "max_connections_per_pool must be positive",
            ));
        }
        if self.min_connections_per_pool > self.max_connections_per_pool {
            return Err(TetherError::configuration(
                "min_connections_per_pool exceeds max_connections_per_pool",
            ));
        }
        if !(0.0..=1.0).contains(&self.max_load_threshold) {
            return Err(TetherError::configuration(
                "max_load_threshold must be within [0.0, 1.0]",
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(TetherError::configuration(
                "circuit_failure_threshold must be positive",
            ));
        }
        if self.staleness_soft_multiplier == 0
            || self.staleness_hard_multiplier <= self.staleness_soft_multiplier
        {
            return Err(TetherError::configuration(
                "staleness multipliers must satisfy 0 < soft < hard",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(TetherError::configuration(
                "heartbeat_interval must be positive",
            ));
        }
        Ok(())
    }

    /// Heartbeat staleness that marks a pool Suspected
    pub fn staleness_soft(&self) -> Duration {
        self.heartbeat_interval * self.staleness_soft_multiplier
    }

    /// Heartbeat staleness that marks a pool Failed; also the registry entry TTL
    pub fn staleness_hard(&self) -> Duration {
        self.heartbeat_interval * self.staleness_hard_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FleetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_load_threshold, 0.85);
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.affinity_window, Duration::from_secs(1800));
    }

    #[test]
    fn test_staleness_thresholds() {
        let config = FleetConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.staleness_soft(), Duration::from_secs(20));
        assert_eq!(config.staleness_hard(), Duration::from_secs(50));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let config = FleetConfig {
            min_connections_per_pool: 50,
            max_connections_per_pool: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FleetConfig {
            max_load_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FleetConfig {
            staleness_soft_multiplier: 5,
            staleness_hard_multiplier: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
