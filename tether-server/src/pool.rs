//! Bounded connection pool owned by one worker process.

use crate::health::{probe_with_timeout, HealthProbe, LatencyTracker, NoopProbe};
use crate::registry::PoolRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_shared::{
    ClientId, ConnectionHealthState, FleetConfig, HealthStatus, PoolId, PoolRegistryEntry,
    SlotId, TetherError, TetherResult,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One live transport-level connection with its bookkeeping.
///
/// Belongs to exactly one pool at a time; ownership moves atomically
/// during migration, never duplicated.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    pub client_id: ClientId,
    pub slot_id: SlotId,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub health_state: ConnectionHealthState,
}

impl PooledConnection {
    fn new(client_id: ClientId) -> Self {
        let now = Instant::now();
        Self {
            client_id,
            slot_id: SlotId::generate(),
            created_at: now,
            last_activity_at: now,
            health_state: ConnectionHealthState::Healthy,
        }
    }

    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.last_activity_at.elapsed() > max_idle
    }

    pub fn is_usable(&self) -> bool {
        self.health_state != ConnectionHealthState::Unhealthy
    }

    fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }
}

/// Bounded collection of [`PooledConnection`]s with slot accounting.
///
/// `acquire` and `release` are non-blocking and return in bounded time;
/// capacity pressure is routed to other pools by the selector, never
/// queued here.
pub struct ConnectionPool {
    pool_id: PoolId,
    max_capacity: u32,
    max_idle_time: Duration,
    probe_timeout: Duration,
    connections: Arc<RwLock<HashMap<ClientId, PooledConnection>>>,
    probe: Arc<dyn HealthProbe>,
    latency: LatencyTracker,
    reported_status: Arc<RwLock<HealthStatus>>,
    registry: Arc<RwLock<Option<RegistryLink>>>,
}

/// Registry wiring for best-effort heartbeats on acquire/release
#[derive(Clone)]
struct RegistryLink {
    registry: Arc<PoolRegistry>,
    seed: PoolRegistryEntry,
}

impl ConnectionPool {
    pub fn new(pool_id: PoolId, config: &FleetConfig) -> Self {
        Self {
            pool_id,
            max_capacity: config.max_connections_per_pool,
            max_idle_time: config.max_idle_time,
            probe_timeout: config.probe_timeout,
            connections: Arc::new(RwLock::new(HashMap::new())),
            probe: Arc::new(NoopProbe),
            latency: LatencyTracker::default(),
            reported_status: Arc::new(RwLock::new(HealthStatus::Healthy)),
            registry: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Wire the registry used for best-effort heartbeat pushes.
    ///
    /// `seed` carries the identity fields (owner, endpoint, region,
    /// capacity); load, latency, and timestamps are filled per push.
    pub async fn attach_registry(&self, registry: Arc<PoolRegistry>, seed: PoolRegistryEntry) {
        let mut link = self.registry.write().await;
        *link = Some(RegistryLink { registry, seed });
    }

    pub fn pool_id(&self) -> &PoolId {
        &self.pool_id
    }

    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn available_slots(&self) -> u32 {
        self.max_capacity
            .saturating_sub(self.connections.read().await.len() as u32)
    }

    pub async fn get(&self, client_id: &ClientId) -> Option<PooledConnection> {
        self.connections.read().await.get(client_id).cloned()
    }

    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Admit `client_id` into the pool.
    ///
    /// Idempotent for a client whose connection is still usable: the
    /// existing connection is returned unchanged. A client whose
    /// connection went unhealthy gets a fresh one in the same slot.
    pub async fn acquire(&self, client_id: &ClientId) -> TetherResult<PooledConnection> {
        if client_id.is_empty() {
            return Err(TetherError::configuration("client id must be non-empty"));
        }

        let acquired = {
            let mut connections = self.connections.write().await;

            if let Some(existing) = connections.get_mut(client_id) {
                if existing.is_usable() {
                    existing.touch();
                    return Ok(existing.clone());
                }
                // Dead connection: replace in place, slot count unchanged
                let replacement = PooledConnection::new(client_id.clone());
                let snapshot = replacement.clone();
                *existing = replacement;
                debug!(pool = %self.pool_id, client = %client_id, "replaced unhealthy connection");
                return Ok(snapshot);
            }

            if connections.len() as u32 >= self.max_capacity {
                return Err(TetherError::pool_exhausted(self.pool_id.as_str()));
            }

            let connection = PooledConnection::new(client_id.clone());
            let snapshot = connection.clone();
            connections.insert(client_id.clone(), connection);
            snapshot
        };

        self.push_heartbeat(Some((client_id.clone(), 1))).await;
        Ok(acquired)
    }

    /// Remove `client_id`'s connection, freeing its slot. Idempotent.
    pub async fn release(&self, client_id: &ClientId) {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(client_id)
        };

        if removed.is_some() {
            self.push_heartbeat(Some((client_id.clone(), -1))).await;
        }
    }

    /// Probe one connection's liveness with a bounded timeout.
    ///
    /// A connection idle past `max_idle_time` is unhealthy without
    /// probing. Returns whether the connection is usable.
    pub async fn perform_health_check(&self, client_id: &ClientId) -> TetherResult<bool> {
        let connection = match self.get(client_id).await {
            Some(c) => c,
            None => return Ok(false),
        };

        if connection.is_idle(self.max_idle_time) {
            self.set_health(client_id, ConnectionHealthState::Unhealthy)
                .await;
            debug!(pool = %self.pool_id, client = %client_id, "idle connection marked unhealthy");
            return Ok(false);
        }

        let outcome = probe_with_timeout(self.probe.as_ref(), client_id, self.probe_timeout).await;
        if outcome.response_time_ms > 0 {
            self.latency.record(outcome.response_time_ms as f64).await;
        }
        self.set_health(client_id, outcome.state).await;

        Ok(outcome.is_usable())
    }

    /// Record client traffic on a connection (resets its idle clock).
    pub async fn touch_activity(&self, client_id: &ClientId) {
        if let Some(connection) = self.connections.write().await.get_mut(client_id) {
            connection.touch();
        }
    }

    /// Evict connections idle past `max_idle_time`; returns how many.
    pub async fn sweep_idle(&self) -> usize {
        let evicted: Vec<ClientId> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|c| c.is_idle(self.max_idle_time))
                .map(|c| c.client_id.clone())
                .collect()
        };

        for client_id in &evicted {
            self.release(client_id).await;
        }
        if !evicted.is_empty() {
            debug!(pool = %self.pool_id, count = evicted.len(), "evicted idle connections");
        }
        evicted.len()
    }

    /// Health status this pool reports in its heartbeats
    pub async fn set_reported_status(&self, status: HealthStatus) {
        *self.reported_status.write().await = status;
    }

    pub async fn reported_status(&self) -> HealthStatus {
        *self.reported_status.read().await
    }

    /// Build the registry record for this pool's current state.
    pub async fn registry_entry(&self, seed: &PoolRegistryEntry) -> PoolRegistryEntry {
        let mut entry = seed.clone();
        entry.current_load = self.len().await as u32;
        entry.average_latency_ms = self.latency.average_ms().await;
        entry.health_status = self.reported_status().await;
        entry.touch();
        entry
    }

    /// Re-upsert attribution records so they outlive their TTL for as
    /// long as the connection is actually held here.
    pub async fn refresh_attributions(&self) {
        let link = { self.registry.read().await.clone() };
        let Some(link) = link else { return };

        for client_id in self.client_ids().await {
            if let Err(e) = link
                .registry
                .attribute_connection(&self.pool_id, &client_id)
                .await
            {
                warn!(pool = %self.pool_id, "attribution refresh failed: {}", e);
                break;
            }
        }
    }

    async fn set_health(&self, client_id: &ClientId, state: ConnectionHealthState) {
        if let Some(connection) = self.connections.write().await.get_mut(client_id) {
            connection.health_state = state;
        }
    }

    /// Best-effort, non-blocking registry push after acquire/release.
    async fn push_heartbeat(&self, load_delta: Option<(ClientId, i64)>) {
        let link = { self.registry.read().await.clone() };
        let Some(link) = link else { return };

        let entry = self.registry_entry(&link.seed).await;
        let pool_id = self.pool_id.clone();

        tokio::spawn(async move {
            if let Err(e) = link.registry.register(&entry).await {
                warn!(pool = %pool_id, "heartbeat push failed: {}", e);
                return;
            }
            if let Some((client_id, delta)) = load_delta {
                let result = if delta >= 0 {
                    link.registry.increment_load(&pool_id).await.and(
                        link.registry
                            .attribute_connection(&pool_id, &client_id)
                            .await,
                    )
                } else {
                    link.registry.decrement_load(&pool_id).await.and(
                        link.registry
                            .release_attribution(&pool_id, &client_id)
                            .await,
                    )
                };
                if let Err(e) = result {
                    warn!(pool = %pool_id, client = %client_id, "load push failed: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::health::ProbeOutcome;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(max: u32) -> FleetConfig {
        FleetConfig {
            max_connections_per_pool: max,
            ..Default::default()
        }
    }

    fn test_pool(max: u32) -> ConnectionPool {
        ConnectionPool::new(PoolId::new("pool-test"), &test_config(max))
    }

    struct CountingProbe {
        calls: AtomicUsize,
        healthy: bool,
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn probe(&self, _client_id: &ClientId) -> TetherResult<ProbeOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(ProbeOutcome::healthy(5))
            } else {
                Ok(ProbeOutcome::unhealthy("probe refused".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = test_pool(4);
        let c1 = ClientId::new("c1");

        let connection = pool.acquire(&c1).await.unwrap();
        assert_eq!(connection.client_id, c1);
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.available_slots().await, 3);

        pool.release(&c1).await;
        assert_eq!(pool.len().await, 0);
        assert_eq!(pool.available_slots().await, 4);

        // Idempotent release
        pool.release(&c1).await;
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let pool = test_pool(2);

        pool.acquire(&ClientId::new("c1")).await.unwrap();
        pool.acquire(&ClientId::new("c2")).await.unwrap();

        let result = pool.acquire(&ClientId::new("c3")).await;
        assert!(matches!(result, Err(TetherError::PoolExhausted { .. })));
    }

    #[tokio::test]
    async fn test_idempotent_acquire() {
        let pool = test_pool(8);
        let c1 = ClientId::new("c1");

        let first = pool.acquire(&c1).await.unwrap();
        let second = pool.acquire(&c1).await.unwrap();

        assert_eq!(first.slot_id, second.slot_id);
        assert_eq!(pool.available_slots().await, 7);
    }

    #[tokio::test]
    async fn test_capacity_invariant_under_concurrency() {
        let capacity = 10u32;
        let extra = 5u32;
        let pool = Arc::new(test_pool(capacity));

        let tasks: Vec<_> = (0..capacity + extra)
            .map(|i| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.acquire(&ClientId::new(format!("c{}", i))).await })
            })
            .collect();

        let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(TetherError::PoolExhausted { .. })))
            .count();

        assert_eq!(succeeded, capacity as usize);
        assert_eq!(exhausted, extra as usize);
        assert_eq!(pool.len().await, capacity as usize);
    }

    #[tokio::test]
    async fn test_empty_client_id_rejected() {
        let pool = test_pool(2);
        let result = pool.acquire(&ClientId::new("")).await;
        assert!(matches!(result, Err(TetherError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_idle_connection_unhealthy_without_probe() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            healthy: true,
        });
        let config = FleetConfig {
            max_connections_per_pool: 2,
            max_idle_time: Duration::ZERO,
            ..Default::default()
        };
        let pool = ConnectionPool::new(PoolId::new("pool-test"), &config)
            .with_probe(Arc::clone(&probe) as Arc<dyn HealthProbe>);

        let c1 = ClientId::new("c1");
        pool.acquire(&c1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let usable = pool.perform_health_check(&c1).await.unwrap();
        assert!(!usable);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            pool.get(&c1).await.unwrap().health_state,
            ConnectionHealthState::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_unhealthy_connection_replaced_on_acquire() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            healthy: false,
        });
        let pool =
            test_pool(2).with_probe(Arc::clone(&probe) as Arc<dyn HealthProbe>);

        let c1 = ClientId::new("c1");
        let first = pool.acquire(&c1).await.unwrap();

        let usable = pool.perform_health_check(&c1).await.unwrap();
        assert!(!usable);

        let second = pool.acquire(&c1).await.unwrap();
        assert_ne!(first.slot_id, second.slot_id);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_idle_sweep() {
        let config = FleetConfig {
            max_connections_per_pool: 4,
            max_idle_time: Duration::from_millis(10),
            ..Default::default()
        };
        let pool = ConnectionPool::new(PoolId::new("pool-test"), &config);

        pool.acquire(&ClientId::new("c1")).await.unwrap();
        pool.acquire(&ClientId::new("c2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.touch_activity(&ClientId::new("c2")).await;

        let evicted = pool.sweep_idle().await;
        assert_eq!(evicted, 1);
        assert!(pool.get(&ClientId::new("c1")).await.is_none());
        assert!(pool.get(&ClientId::new("c2")).await.is_some());
    }

    #[tokio::test]
    async fn test_health_check_for_unknown_client() {
        let pool = test_pool(2);
        let usable = pool
            .perform_health_check(&ClientId::new("missing"))
            .await
            .unwrap();
        assert!(!usable);
    }
}
