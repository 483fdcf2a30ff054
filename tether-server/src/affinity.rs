//! Sticky client-to-pool affinity over the coordination store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether_shared::{
    AffinityRecord, CircuitBreaker, CircuitBreakerConfig, ClientId, CoordinationStore,
    FleetConfig, PoolId, TetherError, TetherResult,
};
use tokio::time::timeout;
use tracing::debug;

const AFFINITY_PREFIX: &str = "tether/affinity/";

/// Records, per client, which pool last served it.
///
/// Records live fleet-wide (any process may look up a reconnecting
/// client) and expire after a sliding inactivity window.
pub struct SessionAffinityManager {
    store: Arc<dyn CoordinationStore>,
    breaker: CircuitBreaker,
    call_timeout: Duration,
    window: Duration,
}

impl SessionAffinityManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &FleetConfig) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::new(
                "affinity",
                CircuitBreakerConfig {
                    failure_threshold: config.circuit_failure_threshold,
                    cooldown: config.circuit_cooldown,
                },
            ),
            call_timeout: config.registry_call_timeout,
            window: config.affinity_window,
        }
    }

    /// Create or refresh the client's affinity to `pool_id`.
    pub async fn record_affinity(&self, client_id: &ClientId, pool_id: &PoolId) -> TetherResult<()> {
        let record = match self.load(client_id).await? {
            // Same pool: keep created_at, slide the window
            Some(mut existing) if existing.pool_id == *pool_id => {
                existing.touch();
                existing
            }
            _ => AffinityRecord::new(client_id.clone(), pool_id.clone()),
        };

        self.save(&record).await?;
        debug!(client = %client_id, pool = %pool_id, "affinity recorded");
        Ok(())
    }

    /// The pool the client should return to, if a live record exists.
    ///
    /// A successful lookup refreshes the record's access timestamp
    /// (sliding expiry).
    pub async fn get_affinity(&self, client_id: &ClientId) -> TetherResult<Option<PoolId>> {
        let Some(mut record) = self.load(client_id).await? else {
            return Ok(None);
        };

        if record.is_expired(self.window) {
            return Ok(None);
        }

        record.touch();
        self.save(&record).await?;
        Ok(Some(record.pool_id))
    }

    /// Drop the client's record so a stale affinity cannot re-route it
    /// to a pool it no longer belongs to. Idempotent.
    pub async fn invalidate(&self, client_id: &ClientId) -> TetherResult<()> {
        let key = affinity_key(client_id);
        self.guarded(
            "affinity invalidate",
            self.store.put_with_ttl(&key, Vec::new(), Duration::ZERO),
        )
        .await?;
        debug!(client = %client_id, "affinity invalidated");
        Ok(())
    }

    async fn load(&self, client_id: &ClientId) -> TetherResult<Option<AffinityRecord>> {
        let key = affinity_key(client_id);
        let bytes = self.guarded("affinity get", self.store.get(&key)).await?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &AffinityRecord) -> TetherResult<()> {
        let key = affinity_key(&record.client_id);
        let bytes = serde_json::to_vec(record)?;
        let ttl = self.window;
        self.guarded("affinity put", self.store.put_with_ttl(&key, bytes, ttl))
            .await
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

fn affinity_key(client_id: &ClientId) -> String {
    format!("{}{}", AFFINITY_PREFIX, client_id)
}
