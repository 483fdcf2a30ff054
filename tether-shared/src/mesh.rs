use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a connection pool in the fleet
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(String);

impl PoolId {
    /// Create a PoolId from a specific key
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// Generate a new random PoolId
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a worker process owning a pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally supplied identity of a logical client
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle unique within a pool, assigned at acquire time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(Uuid);

impl SlotId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network endpoint a client connects to for a given pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEndpoint {
    pub url: String,
    pub port: u16,
}

impl PoolEndpoint {
    pub fn new<S: Into<String>>(url: S, port: u16) -> Self {
        Self {
            url: url.into(),
            port,
        }
    }
}

impl fmt::Display for PoolEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.url, self.port)
    }
}

/// Health of a pool as published in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unavailable,
}

/// Health of a single pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionHealthState {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

/// One pool's registry record, shared fleet-wide
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRegistryEntry {
    pub pool_id: PoolId,
    pub owner: WorkerId,
    pub endpoint: PoolEndpoint,
    pub region: Option<String>,
    pub max_capacity: u32,
    pub current_load: u32,
    pub health_status: HealthStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub average_latency_ms: f64,
}

impl PoolRegistryEntry {
    pub fn new(pool_id: PoolId, owner: WorkerId, endpoint: PoolEndpoint, max_capacity: u32) -> Self {
        Self {
            pool_id,
            owner,
            endpoint,
            region: None,
            max_capacity,
            current_load: 0,
            health_status: HealthStatus::Healthy,
            last_heartbeat_at: Utc::now(),
            average_latency_ms: 0.0,
        }
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Fraction of capacity currently in use, in [0.0, 1.0]
    pub fn load_fraction(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        (self.current_load as f64 / self.max_capacity as f64).min(1.0)
    }

    /// Whether the last heartbeat is older than the given threshold
    pub fn is_stale(&self, threshold: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_heartbeat_at);
        age > ChronoDuration::from_std(threshold).unwrap_or(ChronoDuration::MAX)
    }

    /// Stored status overridden to Unavailable when the heartbeat is stale
    pub fn effective_status(&self, staleness_threshold: Duration) -> HealthStatus {
        if self.is_stale(staleness_threshold) {
            HealthStatus::Unavailable
        } else {
            self.health_status
        }
    }

    /// Whether the pool is below the routing load threshold
    pub fn under_load_threshold(&self, max_load_threshold: f64) -> bool {
        self.load_fraction() < max_load_threshold
    }

    /// Refresh the heartbeat timestamp
    pub fn touch(&mut self) {
        self.last_heartbeat_at = Utc::now();
    }
}

/// Sticky mapping from a client to the pool that last served it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityRecord {
    pub client_id: ClientId,
    pub pool_id: PoolId,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}

impl AffinityRecord {
    pub fn new(client_id: ClientId, pool_id: PoolId) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            pool_id,
            created_at: now,
            last_access_at: now,
        }
    }

    /// Whether the record has passed its inactivity window
    pub fn is_expired(&self, window: Duration) -> bool {
        let idle = Utc::now().signed_duration_since(self.last_access_at);
        idle > ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX)
    }

    /// Sliding expiry: refresh the access timestamp
    pub fn touch(&mut self) {
        self.last_access_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, max_capacity: u32, load: u32) -> PoolRegistryEntry {
        let mut e = PoolRegistryEntry::new(
            PoolId::new(key),
            WorkerId::new("worker-1"),
            PoolEndpoint::new("localhost", 7300),
            max_capacity,
        );
        e.current_load = load;
        e
    }

    #[test]
    fn test_pool_id_ordering() {
        let a = PoolId::new("pool-a");
        let b = PoolId::new("pool-b");
        assert!(a < b);
        assert_eq!(a.to_string(), "pool-a");
    }

    #[test]
    fn test_load_fraction() {
        assert_eq!(entry("p", 10, 2).load_fraction(), 0.2);
        assert_eq!(entry("p", 10, 15).load_fraction(), 1.0);
        // Zero capacity is treated as fully loaded
        assert_eq!(entry("p", 0, 0).load_fraction(), 1.0);
    }

    #[test]
    fn test_staleness_overrides_status() {
        let mut e = entry("p", 10, 0);
        assert_eq!(
            e.effective_status(Duration::from_secs(10)),
            HealthStatus::Healthy
        );

        e.last_heartbeat_at = Utc::now() - ChronoDuration::seconds(60);
        assert!(e.is_stale(Duration::from_secs(10)));
        assert_eq!(
            e.effective_status(Duration::from_secs(10)),
            HealthStatus::Unavailable
        );

        // Stored status is ignored while stale
        e.health_status = HealthStatus::Healthy;
        assert_eq!(
            e.effective_status(Duration::from_secs(10)),
            HealthStatus::Unavailable
        );
    }

    #[test]
    fn test_affinity_expiry() {
        let mut record = AffinityRecord::new(ClientId::new("c1"), PoolId::new("p1"));
        assert!(!record.is_expired(Duration::from_secs(30)));

        record.last_access_at = Utc::now() - ChronoDuration::minutes(31);
        assert!(record.is_expired(Duration::from_secs(1800)));

        record.touch();
        assert!(!record.is_expired(Duration::from_secs(1800)));
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = PoolEndpoint::new("ws-07.internal", 7300);
        assert_eq!(endpoint.to_string(), "ws-07.internal:7300");
    }
}
