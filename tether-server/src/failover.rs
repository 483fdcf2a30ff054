//! Failure detection and live-connection migration.
//!
//! Each pool walks an explicit lifecycle:
//! Healthy -> Suspected -> Failed -> Draining -> Decommissioned.
//! Transitions are idempotent and re-entrant; duplicate detection of the
//! same failed pool never double-migrates a connection.

use crate::affinity::SessionAffinityManager;
use crate::registry::PoolRegistry;
use crate::selector::{PoolSelector, RequestMetadata};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_shared::{
    ClientId, FleetConfig, PoolEndpoint, PoolId, PoolRegistryEntry, TetherError, TetherResult,
};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Lifecycle phase of a pool as tracked by failover detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoolPhase {
    Healthy,
    Suspected,
    Failed,
    Draining,
    Decommissioned,
}

/// External push channel telling a client where to reconnect
#[async_trait]
pub trait ReconnectNotifier: Send + Sync {
    async fn notify_reconnect(
        &self,
        client_id: &ClientId,
        new_endpoint: &PoolEndpoint,
    ) -> TetherResult<()>;
}

/// Notifier for deployments without a push channel: log and move on.
///
/// Clients discover the new pool on their next reconnect attempt.
#[derive(Debug, Default)]
pub struct LogOnlyNotifier;

#[async_trait]
impl ReconnectNotifier for LogOnlyNotifier {
    async fn notify_reconnect(
        &self,
        client_id: &ClientId,
        new_endpoint: &PoolEndpoint,
    ) -> TetherResult<()> {
        info!(client = %client_id, endpoint = %new_endpoint, "reconnect requested");
        Ok(())
    }
}

/// Outcome of migrating one failed pool's connections
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub migrated: Vec<ClientId>,
    pub dropped: Vec<ClientId>,
}

#[derive(Debug)]
struct PoolWatch {
    phase: PoolPhase,
    probe_failures: u32,
}

impl PoolWatch {
    fn new() -> Self {
        Self {
            phase: PoolPhase::Healthy,
            probe_failures: 0,
        }
    }
}

/// Watches the registry for failed pools and re-homes their connections.
pub struct FailoverManager {
    registry: Arc<PoolRegistry>,
    selector: Arc<PoolSelector>,
    affinity: Arc<SessionAffinityManager>,
    notifier: Arc<dyn ReconnectNotifier>,
    staleness_soft: Duration,
    staleness_hard: Duration,
    probe_failure_threshold: u32,
    retry_limit: u32,
    backoff_initial: Duration,
    drain_grace: Duration,
    watches: Arc<RwLock<HashMap<PoolId, PoolWatch>>>,
    failover_events: AtomicU64,
}

impl FailoverManager {
    pub fn new(
        registry: Arc<PoolRegistry>,
        selector: Arc<PoolSelector>,
        affinity: Arc<SessionAffinityManager>,
        notifier: Arc<dyn ReconnectNotifier>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            affinity,
            notifier,
            staleness_soft: config.staleness_soft(),
            staleness_hard: config.staleness_hard(),
            probe_failure_threshold: config.probe_failure_threshold,
            retry_limit: config.migration_retry_limit,
            backoff_initial: config.migration_backoff_initial,
            drain_grace: config.drain_grace_period,
            watches: Arc::new(RwLock::new(HashMap::new())),
            failover_events: AtomicU64::new(0),
        }
    }

    /// Total failover events handled by this process
    pub fn failover_events(&self) -> u64 {
        self.failover_events.load(Ordering::Relaxed)
    }

    /// Current phase for a pool; unknown pools are Healthy.
    pub async fn phase(&self, pool_id: &PoolId) -> PoolPhase {
        self.watches
            .read()
            .await
            .get(pool_id)
            .map(|w| w.phase)
            .unwrap_or(PoolPhase::Healthy)
    }

    /// Feed an explicit health-check failure for a pool.
    pub async fn record_probe_failure(&self, pool_id: &PoolId) {
        let mut watches = self.watches.write().await;
        let watch = watches.entry(pool_id.clone()).or_insert_with(PoolWatch::new);
        watch.probe_failures += 1;
    }

    /// One detection pass over the registry.
    ///
    /// Returns the pools that entered Failed during this pass (and were
    /// migrated). Safe to call concurrently or repeatedly.
    pub async fn run_detection_cycle(&self) -> TetherResult<Vec<PoolId>> {
        let entries = self.registry.list_all().await?;
        let mut newly_failed = Vec::new();

        for entry in &entries {
            if self.step_watch(entry).await {
                newly_failed.push(entry.pool_id.clone());
            }
        }

        // Pools whose entry expired out of the registry entirely are past
        // the hard threshold by definition.
        let vanished: Vec<PoolId> = {
            let watches = self.watches.read().await;
            watches
                .iter()
                .filter(|(pool_id, watch)| {
                    watch.phase < PoolPhase::Failed
                        && !entries.iter().any(|e| &e.pool_id == *pool_id)
                })
                .map(|(pool_id, _)| pool_id.clone())
                .collect()
        };
        newly_failed.extend(vanished);

        for pool_id in &newly_failed {
            if let Err(e) = self.handle_failed_pool(pool_id).await {
                error!(pool = %pool_id, "failover failed: {}", e);
            }
        }

        Ok(newly_failed)
    }

    /// Advance one pool's watch from its registry entry; returns whether
    /// the pool just crossed into Failed.
    async fn step_watch(&self, entry: &PoolRegistryEntry) -> bool {
        let mut watches = self.watches.write().await;
        let watch = watches
            .entry(entry.pool_id.clone())
            .or_insert_with(PoolWatch::new);

        if watch.phase >= PoolPhase::Failed {
            return false;
        }

        let hard_stale = entry.is_stale(self.staleness_hard);
        let soft_stale = entry.is_stale(self.staleness_soft);
        let probes_exhausted = watch.probe_failures >= self.probe_failure_threshold;

        if hard_stale || probes_exhausted {
            info!(pool = %entry.pool_id, "pool failed");
            return true;
        }

        match watch.phase {
            PoolPhase::Healthy if soft_stale => {
                warn!(pool = %entry.pool_id, "pool suspected: heartbeat stale");
                watch.phase = PoolPhase::Suspected;
            }
            PoolPhase::Suspected if !soft_stale => {
                info!(pool = %entry.pool_id, "suspected pool recovered");
                watch.phase = PoolPhase::Healthy;
                watch.probe_failures = 0;
            }
            _ => {}
        }
        false
    }

    /// Drive a failed pool through migration, drain, and decommission.
    ///
    /// Re-entrant: only the caller that transitions the pool into Failed
    /// proceeds; everyone else returns an empty report.
    pub async fn handle_failed_pool(&self, pool_id: &PoolId) -> TetherResult<MigrationReport> {
        {
            let mut watches = self.watches.write().await;
            let watch = watches.entry(pool_id.clone()).or_insert_with(PoolWatch::new);
            if watch.phase >= PoolPhase::Failed {
                return Ok(MigrationReport::default());
            }
            watch.phase = PoolPhase::Failed;
        }
        self.failover_events.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tether.failover.pools").increment(1);

        // Stop new routing to the failed pool first
        if let Err(e) = self.registry.mark_unavailable(pool_id).await {
            warn!(pool = %pool_id, "could not mark pool unavailable: {}", e);
        }

        let clients = self.registry.list_attributed(pool_id).await?;
        info!(pool = %pool_id, connections = clients.len(), "migrating failed pool");

        let mut report = MigrationReport::default();
        for client_id in clients {
            match self.migrate_connection(pool_id, &client_id).await {
                Ok(new_pool) => {
                    info!(client = %client_id, from = %pool_id, to = %new_pool, "connection migrated");
                    // Ownership moved; retire the old attribution now
                    if let Err(e) = self.registry.release_attribution(pool_id, &client_id).await {
                        warn!(client = %client_id, "attribution release failed: {}", e);
                    }
                    report.migrated.push(client_id);
                }
                Err(e) => {
                    // Dropped, never left attributed to a dead pool
                    error!(client = %client_id, pool = %pool_id, "migration failed: {}", e);
                    metrics::counter!("tether.failover.dropped").increment(1);
                    if let Err(e) = self.registry.release_attribution(pool_id, &client_id).await {
                        warn!(client = %client_id, "attribution release failed: {}", e);
                    }
                    report.dropped.push(client_id);
                }
            }
        }

        self.drain_and_decommission(pool_id).await?;
        Ok(report)
    }

    /// Migrate one connection: invalidate its affinity, pick a new pool,
    /// and tell the client to reconnect there. Retried with exponential
    /// backoff up to the configured limit.
    async fn migrate_connection(
        &self,
        failed_pool: &PoolId,
        client_id: &ClientId,
    ) -> TetherResult<PoolId> {
        let mut last_error: Option<TetherError> = None;

        for attempt in 0..self.retry_limit {
            if attempt > 0 {
                let delay = self.backoff_initial * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }

            let result = async {
                self.affinity.invalidate(client_id).await?;
                let target = self
                    .selector
                    .select(client_id, &RequestMetadata::default())
                    .await?;
                self.notifier
                    .notify_reconnect(client_id, &target.endpoint)
                    .await?;
                Ok::<PoolId, TetherError>(target.pool_id)
            }
            .await;

            match result {
                Ok(new_pool) => return Ok(new_pool),
                Err(e) => {
                    warn!(
                        client = %client_id,
                        attempt = attempt + 1,
                        "migration attempt failed: {}",
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(TetherError::migration_failed(
            client_id.as_str(),
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("abandoning {}", failed_pool)),
        ))
    }

    /// Failed -> Draining -> Decommissioned.
    ///
    /// Waits out the grace period for un-acknowledged connections, then
    /// force-releases whatever is still attributed and removes the
    /// registry entry.
    async fn drain_and_decommission(&self, pool_id: &PoolId) -> TetherResult<()> {
        self.set_phase(pool_id, PoolPhase::Draining).await;

        // The grace period is for un-acknowledged connections only
        let mut remaining = self.registry.list_attributed(pool_id).await?;
        if !remaining.is_empty() && !self.drain_grace.is_zero() {
            tokio::time::sleep(self.drain_grace).await;
            remaining = self.registry.list_attributed(pool_id).await?;
        }
        if !remaining.is_empty() {
            warn!(
                pool = %pool_id,
                count = remaining.len(),
                "force-releasing connections past the drain grace period"
            );
            for client_id in &remaining {
                self.registry.release_attribution(pool_id, client_id).await?;
            }
        }

        self.registry.remove_pool(pool_id).await?;
        self.set_phase(pool_id, PoolPhase::Decommissioned).await;
        info!(pool = %pool_id, "pool decommissioned");
        Ok(())
    }

    async fn set_phase(&self, pool_id: &PoolId, phase: PoolPhase) {
        let mut watches = self.watches.write().await;
        watches
            .entry(pool_id.clone())
            .or_insert_with(PoolWatch::new)
            .phase = phase;
    }
}
