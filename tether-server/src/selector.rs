//! Admission routing: pick the pool a client connection should land on.
//!
//! Selection is a pure function of the client id, the registry snapshot,
//! and the affinity state, plus the side effect of writing the new
//! affinity. Given fixed inputs it is deterministic, including the
//! tie-break.

use crate::affinity::SessionAffinityManager;
use crate::registry::{PoolRegistry, SelectionCriteria};
use std::sync::Arc;
use std::time::Duration;
use tether_shared::{
    ClientId, FleetConfig, HealthStatus, PoolRegistryEntry, TetherError, TetherResult,
};
use tokio::time::timeout;
use tracing::{debug, warn};

const WEIGHT_LOAD: f64 = 0.3;
const WEIGHT_HEALTH: f64 = 0.3;
const WEIGHT_GEO: f64 = 0.2;
const WEIGHT_LATENCY: f64 = 0.2;

/// Request context forwarded by the edge layer
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub client_region: Option<String>,
}

/// Weighted multi-criteria pool selection with sticky affinity.
pub struct PoolSelector {
    registry: Arc<PoolRegistry>,
    affinity: Arc<SessionAffinityManager>,
    criteria: SelectionCriteria,
    staleness_threshold: Duration,
    admission_timeout: Duration,
    retry_limit: u32,
    retry_backoff_initial: Duration,
}

impl PoolSelector {
    pub fn new(
        registry: Arc<PoolRegistry>,
        affinity: Arc<SessionAffinityManager>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            registry,
            affinity,
            criteria: SelectionCriteria::new(config.max_load_threshold),
            staleness_threshold: config.staleness_hard(),
            admission_timeout: config.connection_timeout,
            retry_limit: config.selection_retry_limit,
            retry_backoff_initial: config.selection_backoff_initial,
        }
    }

    /// Choose the pool for `client_id`, honoring sticky affinity.
    ///
    /// Bounded by the admission timeout even across retries; a stuck
    /// selection fails typed instead of hanging the connection attempt.
    pub async fn select(
        &self,
        client_id: &ClientId,
        metadata: &RequestMetadata,
    ) -> TetherResult<PoolRegistryEntry> {
        match timeout(self.admission_timeout, self.select_inner(client_id, metadata)).await {
            Ok(result) => result,
            Err(_) => Err(TetherError::timeout("pool selection")),
        }
    }

    async fn select_inner(
        &self,
        client_id: &ClientId,
        metadata: &RequestMetadata,
    ) -> TetherResult<PoolRegistryEntry> {
        if let Some(entry) = self.try_affinity_fast_path(client_id).await {
            debug!(client = %client_id, pool = %entry.pool_id, "sticky selection");
            return Ok(entry);
        }

        let candidates = self.list_with_retry().await?;
        if candidates.is_empty() {
            return Err(TetherError::NoAvailablePool);
        }

        let chosen = self.pick(&candidates, metadata);
        if let Err(e) = self
            .affinity
            .record_affinity(client_id, &chosen.pool_id)
            .await
        {
            // Selection stands even when the affinity write is lost
            warn!(client = %client_id, "affinity write failed: {}", e);
        }

        debug!(client = %client_id, pool = %chosen.pool_id, "scored selection");
        Ok(chosen)
    }

    /// Sticky fast path: the affinity pool, while it is Healthy and
    /// below the load threshold.
    async fn try_affinity_fast_path(&self, client_id: &ClientId) -> Option<PoolRegistryEntry> {
        let pool_id = match self.affinity.get_affinity(client_id).await {
            Ok(Some(pool_id)) => pool_id,
            Ok(None) => return None,
            Err(e) => {
                warn!(client = %client_id, "affinity lookup failed: {}", e);
                return None;
            }
        };

        match self.registry.get_entry(&pool_id).await {
            Ok(Some(entry))
                if entry.effective_status(self.staleness_threshold) == HealthStatus::Healthy
                    && entry.under_load_threshold(self.criteria.max_load_threshold) =>
            {
                Some(entry)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(client = %client_id, pool = %pool_id, "affinity target lookup failed: {}", e);
                None
            }
        }
    }

    async fn list_with_retry(&self) -> TetherResult<Vec<PoolRegistryEntry>> {
        let mut last_error = None;

        for attempt in 0..=self.retry_limit {
            match self.registry.list_available(&self.criteria).await {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_transient() => {
                    warn!(attempt, "candidate listing failed: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }

            if attempt < self.retry_limit {
                let delay = self.retry_backoff_initial * 2u32.saturating_pow(attempt);
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error.unwrap_or(TetherError::NoAvailablePool))
    }

    /// Highest score wins; ties go to the lowest pool id.
    fn pick(
        &self,
        candidates: &[PoolRegistryEntry],
        metadata: &RequestMetadata,
    ) -> PoolRegistryEntry {
        let max_latency = candidates
            .iter()
            .map(|e| e.average_latency_ms)
            .fold(0.0_f64, f64::max);

        let mut best: Option<(&PoolRegistryEntry, f64)> = None;
        for entry in candidates {
            let score = self.score(entry, max_latency, metadata);
            best = match best {
                None => Some((entry, score)),
                Some((current, current_score)) => {
                    if score > current_score
                        || (score == current_score && entry.pool_id < current.pool_id)
                    {
                        Some((entry, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }

        // candidates is non-empty by the caller's check
        best.map(|(entry, _)| entry.clone()).unwrap_or_else(|| {
            candidates[0].clone()
        })
    }

    fn score(
        &self,
        entry: &PoolRegistryEntry,
        max_latency: f64,
        metadata: &RequestMetadata,
    ) -> f64 {
        let health_factor = match entry.effective_status(self.staleness_threshold) {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unavailable => 0.0,
        };

        let geographic_factor = match (&metadata.client_region, &entry.region) {
            (Some(client), Some(pool)) if client == pool => 1.0,
            (Some(_), Some(_)) => 0.0,
            _ => 0.5,
        };

        let normalized_latency = if max_latency > 0.0 {
            entry.average_latency_ms / max_latency
        } else {
            0.0
        };

        WEIGHT_LOAD * (1.0 - entry.load_fraction())
            + WEIGHT_HEALTH * health_factor
            + WEIGHT_GEO * geographic_factor
            + WEIGHT_LATENCY * (1.0 - normalized_latency)
    }
}
