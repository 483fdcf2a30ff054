//! Coordination client publishing and querying fleet-wide pool state.
//!
//! All store calls carry a bounded timeout and run through one circuit
//! breaker. Listing falls back to the last known-good snapshot while the
//! store is unreachable, so admission keeps working through registry
//! outages.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_shared::{
    CircuitBreaker, CircuitBreakerConfig, ClientId, CoordinationStore, FleetConfig, HealthStatus,
    PoolId, PoolRegistryEntry, TetherError, TetherResult,
};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

const ENTRY_PREFIX: &str = "tether/pools/";
const LOAD_PREFIX: &str = "tether/load/";
const CONN_PREFIX: &str = "tether/conns/";

/// Filter applied when listing candidate pools
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    /// Entries at or above this load fraction are excluded
    pub max_load_threshold: f64,
}

impl SelectionCriteria {
    pub fn new(max_load_threshold: f64) -> Self {
        Self { max_load_threshold }
    }
}

#[derive(Debug, Clone)]
struct CachedSnapshot {
    taken_at: Instant,
    entries: Vec<PoolRegistryEntry>,
}

/// Client for the shared pool registry.
pub struct PoolRegistry {
    store: Arc<dyn CoordinationStore>,
    breaker: CircuitBreaker,
    call_timeout: Duration,
    entry_ttl: Duration,
    staleness_threshold: Duration,
    attribution_ttl: Duration,
    snapshot_cache_ttl: Duration,
    cache: RwLock<Option<CachedSnapshot>>,
}

impl PoolRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &FleetConfig) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::new(
                "registry",
                CircuitBreakerConfig {
                    failure_threshold: config.circuit_failure_threshold,
                    cooldown: config.circuit_cooldown,
                },
            ),
            call_timeout: config.registry_call_timeout,
            entry_ttl: config.staleness_hard(),
            staleness_threshold: config.staleness_hard(),
            attribution_ttl: config.affinity_window,
            snapshot_cache_ttl: config.snapshot_cache_ttl,
            cache: RwLock::new(None),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Upsert a pool's entry, refreshing its TTL. Idempotent.
    pub async fn register(&self, entry: &PoolRegistryEntry) -> TetherResult<()> {
        let key = entry_key(&entry.pool_id);
        let bytes = serde_json::to_vec(entry)?;
        let ttl = self.entry_ttl;
        self.guarded("registry register", self.store.put_with_ttl(&key, bytes, ttl))
            .await?;
        debug!(pool = %entry.pool_id, load = entry.current_load, "registered pool entry");
        Ok(())
    }

    /// Fetch one pool's entry with the live load counter overlaid.
    pub async fn get_entry(&self, pool_id: &PoolId) -> TetherResult<Option<PoolRegistryEntry>> {
        let key = entry_key(pool_id);
        let bytes = self.guarded("registry get", self.store.get(&key)).await?;
        let Some(bytes) = bytes else { return Ok(None) };

        let mut entry: PoolRegistryEntry = serde_json::from_slice(&bytes)?;
        if let Ok(Some(load)) = self.read_load_counter(pool_id).await {
            entry.current_load = load;
        }
        Ok(Some(entry))
    }

    /// All entries currently in the registry, stale ones included.
    ///
    /// Failover detection needs to see the pools that stopped
    /// heartbeating recently; routing goes through `list_available`.
    pub async fn list_all(&self) -> TetherResult<Vec<PoolRegistryEntry>> {
        let listed = self
            .guarded("registry list", self.store.list_prefix(ENTRY_PREFIX))
            .await;

        match listed {
            Ok(items) => {
                let mut entries = Vec::with_capacity(items.len());
                for (_, bytes) in items {
                    entries.push(serde_json::from_slice::<PoolRegistryEntry>(&bytes)?);
                }
                self.overlay_load_counters(&mut entries).await;
                self.update_cache(&entries).await;
                Ok(entries)
            }
            Err(e) if e.is_transient() => self.cached_entries(e).await,
            Err(e) => Err(e),
        }
    }

    /// Candidate pools for admission: not expired, not Unavailable, below
    /// the load threshold; ascending load fraction, latency tie-break.
    pub async fn list_available(
        &self,
        criteria: &SelectionCriteria,
    ) -> TetherResult<Vec<PoolRegistryEntry>> {
        let mut entries = self.list_all().await?;

        entries.retain(|e| {
            e.effective_status(self.staleness_threshold) != HealthStatus::Unavailable
                && e.under_load_threshold(criteria.max_load_threshold)
        });
        entries.sort_by(|a, b| {
            a.load_fraction()
                .partial_cmp(&b.load_fraction())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.average_latency_ms
                        .partial_cmp(&b.average_latency_ms)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        Ok(entries)
    }

    /// Best-effort load hint; the pool itself enforces capacity.
    pub async fn increment_load(&self, pool_id: &PoolId) -> TetherResult<()> {
        self.guarded(
            "registry increment",
            self.store.increment(&load_key(pool_id), 1),
        )
        .await
        .map(|_| ())
    }

    pub async fn decrement_load(&self, pool_id: &PoolId) -> TetherResult<()> {
        self.guarded(
            "registry decrement",
            self.store.increment(&load_key(pool_id), -1),
        )
        .await
        .map(|_| ())
    }

    /// Record that `client_id` is currently served by `pool_id`.
    pub async fn attribute_connection(
        &self,
        pool_id: &PoolId,
        client_id: &ClientId,
    ) -> TetherResult<()> {
        let key = conn_key(pool_id, client_id);
        let value = client_id.as_str().as_bytes().to_vec();
        let ttl = self.attribution_ttl;
        self.guarded("registry attribute", self.store.put_with_ttl(&key, value, ttl))
            .await
    }

    /// Drop a connection's attribution to `pool_id`. Idempotent.
    pub async fn release_attribution(
        &self,
        pool_id: &PoolId,
        client_id: &ClientId,
    ) -> TetherResult<()> {
        let key = conn_key(pool_id, client_id);
        self.guarded(
            "registry release attribution",
            self.store.put_with_ttl(&key, Vec::new(), Duration::ZERO),
        )
        .await
    }

    /// All clients currently attributed to `pool_id`.
    pub async fn list_attributed(&self, pool_id: &PoolId) -> TetherResult<Vec<ClientId>> {
        let prefix = format!("{}{}/", CONN_PREFIX, pool_id);
        let items = self
            .guarded("registry list attributed", self.store.list_prefix(&prefix))
            .await?;

        Ok(items
            .into_iter()
            .filter_map(|(key, _)| {
                key.strip_prefix(&prefix)
                    .map(|suffix| ClientId::new(suffix.to_string()))
            })
            .collect())
    }

    /// Force a pool's published status to Unavailable so routing stops.
    pub async fn mark_unavailable(&self, pool_id: &PoolId) -> TetherResult<()> {
        let Some(mut entry) = self.get_entry(pool_id).await? else {
            return Ok(());
        };
        entry.health_status = HealthStatus::Unavailable;
        self.register(&entry).await
    }

    /// Remove a pool's entry and load counter (decommission).
    pub async fn remove_pool(&self, pool_id: &PoolId) -> TetherResult<()> {
        self.guarded(
            "registry remove entry",
            self.store
                .put_with_ttl(&entry_key(pool_id), Vec::new(), Duration::ZERO),
        )
        .await?;
        self.guarded(
            "registry remove load",
            self.store
                .put_with_ttl(&load_key(pool_id), Vec::new(), Duration::ZERO),
        )
        .await
    }

    async fn read_load_counter(&self, pool_id: &PoolId) -> TetherResult<Option<u32>> {
        let bytes = self
            .guarded("registry load read", self.store.get(&load_key(pool_id)))
            .await?;
        Ok(bytes
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .map(|n| n.max(0) as u32))
    }

    async fn overlay_load_counters(&self, entries: &mut [PoolRegistryEntry]) {
        for entry in entries.iter_mut() {
            if let Ok(Some(load)) = self.read_load_counter(&entry.pool_id).await {
                entry.current_load = load;
            }
        }
    }

    async fn update_cache(&self, entries: &[PoolRegistryEntry]) {
        let mut cache = self.cache.write().await;
        *cache = Some(CachedSnapshot {
            taken_at: Instant::now(),
            entries: entries.to_vec(),
        });
    }

    async fn cached_entries(&self, cause: TetherError) -> TetherResult<Vec<PoolRegistryEntry>> {
        let cache = self.cache.read().await;
        match cache.as_ref() {
            Some(snapshot) if snapshot.taken_at.elapsed() <= self.snapshot_cache_ttl => {
                warn!("registry unreachable, serving cached snapshot: {}", cause);
                Ok(snapshot.entries.clone())
            }
            _ => Err(TetherError::registry_unavailable(cause.to_string())),
        }
    }

    async fn guarded<F, T>(&self, operation: &'static str, call: F) -> TetherResult<T>
    where
        F: Future<Output = TetherResult<T>>,
    {
        let deadline = self.call_timeout;
        self.breaker
            .execute(async move {
                timeout(deadline, call)
                    .await
                    .map_err(|_| TetherError::timeout(operation))?
            })
            .await
    }
}

fn entry_key(pool_id: &PoolId) -> String {
    format!("{}{}", ENTRY_PREFIX, pool_id)
}

fn load_key(pool_id: &PoolId) -> String {
    format!("{}{}", LOAD_PREFIX, pool_id)
}

fn conn_key(pool_id: &PoolId, client_id: &ClientId) -> String {
    format!("{}{}/{}", CONN_PREFIX, pool_id, client_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tether_shared::{MemoryStore, PoolEndpoint, WorkerId};

    /// Store that can be switched to fail every call.
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                failing: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> TetherResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(TetherError::store("injected failure"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CoordinationStore for FlakyStore {
        async fn put_with_ttl(
            &self,
            key: &str,
            value: Vec<u8>,
            ttl: Duration,
        ) -> TetherResult<()> {
            self.check()?;
            self.inner.put_with_ttl(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> TetherResult<Option<Vec<u8>>> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn list_prefix(&self, prefix: &str) -> TetherResult<Vec<(String, Vec<u8>)>> {
            self.check()?;
            self.inner.list_prefix(prefix).await
        }

        async fn increment(&self, key: &str, delta: i64) -> TetherResult<i64> {
            self.check()?;
            self.inner.increment(key, delta).await
        }
    }

    fn test_entry(key: &str, max_capacity: u32, load: u32, latency: f64) -> PoolRegistryEntry {
        let mut e = PoolRegistryEntry::new(
            PoolId::new(key),
            WorkerId::new("worker-1"),
            PoolEndpoint::new("localhost", 7300),
            max_capacity,
        );
        e.current_load = load;
        e.average_latency_ms = latency;
        e
    }

    fn registry(store: Arc<dyn CoordinationStore>) -> PoolRegistry {
        PoolRegistry::new(store, &FleetConfig::default())
    }

    #[tokio::test]
    async fn test_register_and_list_ordering() {
        let reg = registry(Arc::new(MemoryStore::new()));

        reg.register(&test_entry("a", 100, 50, 20.0)).await.unwrap();
        reg.register(&test_entry("b", 100, 10, 5.0)).await.unwrap();
        // Same load fraction as "a", lower latency: latency breaks the tie
        reg.register(&test_entry("c", 100, 50, 10.0)).await.unwrap();

        let available = reg
            .list_available(&SelectionCriteria::new(0.85))
            .await
            .unwrap();
        let order: Vec<&str> = available.iter().map(|e| e.pool_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_list_available_filters() {
        let reg = registry(Arc::new(MemoryStore::new()));

        reg.register(&test_entry("ok", 100, 20, 1.0)).await.unwrap();
        reg.register(&test_entry("loaded", 100, 90, 1.0))
            .await
            .unwrap();

        let mut unavailable = test_entry("down", 100, 0, 1.0);
        unavailable.health_status = HealthStatus::Unavailable;
        reg.register(&unavailable).await.unwrap();

        let mut stale = test_entry("stale", 100, 0, 1.0);
        stale.last_heartbeat_at = Utc::now() - ChronoDuration::seconds(3600);
        reg.register(&stale).await.unwrap();

        let available = reg
            .list_available(&SelectionCriteria::new(0.85))
            .await
            .unwrap();
        let ids: Vec<&str> = available.iter().map(|e| e.pool_id.as_str()).collect();
        assert_eq!(ids, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_load_counter_overlay() {
        let reg = registry(Arc::new(MemoryStore::new()));
        reg.register(&test_entry("a", 100, 0, 1.0)).await.unwrap();

        for _ in 0..3 {
            reg.increment_load(&PoolId::new("a")).await.unwrap();
        }
        reg.decrement_load(&PoolId::new("a")).await.unwrap();

        let entry = reg.get_entry(&PoolId::new("a")).await.unwrap().unwrap();
        assert_eq!(entry.current_load, 2);
    }

    #[tokio::test]
    async fn test_snapshot_fallback_during_outage() {
        let store = Arc::new(FlakyStore::new());
        let reg = registry(Arc::clone(&store) as Arc<dyn CoordinationStore>);

        reg.register(&test_entry("a", 100, 10, 1.0)).await.unwrap();
        reg.list_available(&SelectionCriteria::new(0.85))
            .await
            .unwrap();

        store.set_failing(true);
        let available = reg
            .list_available(&SelectionCriteria::new(0.85))
            .await
            .unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].pool_id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_no_cache_means_registry_unavailable() {
        let store = Arc::new(FlakyStore::new());
        store.set_failing(true);
        let reg = registry(store);

        let result = reg.list_available(&SelectionCriteria::new(0.85)).await;
        assert!(matches!(
            result,
            Err(TetherError::RegistryUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_attribution_roundtrip() {
        let reg = registry(Arc::new(MemoryStore::new()));
        let pool = PoolId::new("p1");

        reg.attribute_connection(&pool, &ClientId::new("c1"))
            .await
            .unwrap();
        reg.attribute_connection(&pool, &ClientId::new("c2"))
            .await
            .unwrap();

        let mut attributed = reg.list_attributed(&pool).await.unwrap();
        attributed.sort();
        assert_eq!(
            attributed,
            vec![ClientId::new("c1"), ClientId::new("c2")]
        );

        reg.release_attribution(&pool, &ClientId::new("c1"))
            .await
            .unwrap();
        let attributed = reg.list_attributed(&pool).await.unwrap();
        assert_eq!(attributed, vec![ClientId::new("c2")]);
    }

    #[tokio::test]
    async fn test_mark_unavailable_and_remove() {
        let reg = registry(Arc::new(MemoryStore::new()));
        reg.register(&test_entry("a", 100, 0, 1.0)).await.unwrap();

        reg.mark_unavailable(&PoolId::new("a")).await.unwrap();
        let entry = reg.get_entry(&PoolId::new("a")).await.unwrap().unwrap();
        assert_eq!(entry.health_status, HealthStatus::Unavailable);
        assert!(reg
            .list_available(&SelectionCriteria::new(0.85))
            .await
            .unwrap()
            .is_empty());

        reg.remove_pool(&PoolId::new("a")).await.unwrap();
        assert!(reg.get_entry(&PoolId::new("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_breaker_opens_on_persistent_failure() {
        let store = Arc::new(FlakyStore::new());
        store.set_failing(true);
        let config = FleetConfig {
            circuit_failure_threshold: 3,
            circuit_cooldown: Duration::from_secs(60),
            ..Default::default()
        };
        let reg = PoolRegistry::new(Arc::clone(&store) as Arc<dyn CoordinationStore>, &config);

        for _ in 0..3 {
            let _ = reg.increment_load(&PoolId::new("a")).await;
        }

        let result = reg.increment_load(&PoolId::new("a")).await;
        assert!(matches!(result, Err(TetherError::CircuitOpen { .. })));
    }
}
