//! One worker process's wiring: pool, registry client, routing, and the
//! background maintenance loops.

use crate::affinity::SessionAffinityManager;
use crate::failover::{FailoverManager, LogOnlyNotifier, ReconnectNotifier};
use crate::health::HealthProbe;
use crate::pool::ConnectionPool;
use crate::registry::PoolRegistry;
use crate::selector::PoolSelector;
use std::sync::Arc;
use tether_shared::{
    AlertThresholds, CoordinationStore, FleetConfig, FleetMetrics, HealthStatus, MemoryStore,
    MetricsSink, PoolEndpoint, PoolId, PoolRegistryEntry, TetherResult, TracingSink, WorkerId,
};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

/// Builder for configuring and starting a [`PoolHost`]
pub struct PoolHostBuilder {
    config: FleetConfig,
    pool_id: Option<PoolId>,
    worker_id: Option<WorkerId>,
    endpoint: PoolEndpoint,
    region: Option<String>,
    store: Option<Arc<dyn CoordinationStore>>,
    probe: Option<Arc<dyn HealthProbe>>,
    notifier: Option<Arc<dyn ReconnectNotifier>>,
    sink: Option<Arc<dyn MetricsSink>>,
    thresholds: AlertThresholds,
}

impl PoolHostBuilder {
    pub fn new() -> Self {
        Self {
            config: FleetConfig::default(),
            pool_id: None,
            worker_id: None,
            endpoint: PoolEndpoint::new("0.0.0.0", 7300),
            region: None,
            store: None,
            probe: None,
            notifier: None,
            sink: None,
            thresholds: AlertThresholds::default(),
        }
    }

    pub fn with_config(mut self, config: FleetConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_pool_id(mut self, pool_id: PoolId) -> Self {
        self.pool_id = Some(pool_id);
        self
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_endpoint(mut self, endpoint: PoolEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ReconnectNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_alert_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn build(self) -> TetherResult<PoolHost> {
        self.config.validate()?;

        let pool_id = self.pool_id.unwrap_or_else(PoolId::generate);
        let worker_id = self.worker_id.unwrap_or_else(WorkerId::generate);
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let mut seed = PoolRegistryEntry::new(
            pool_id.clone(),
            worker_id,
            self.endpoint,
            self.config.max_connections_per_pool,
        );
        seed.region = self.region;

        let mut pool = ConnectionPool::new(pool_id, &self.config);
        if let Some(probe) = self.probe {
            pool = pool.with_probe(probe);
        }

        let registry = Arc::new(PoolRegistry::new(Arc::clone(&store), &self.config));
        let affinity = Arc::new(SessionAffinityManager::new(store, &self.config));
        let selector = Arc::new(PoolSelector::new(
            Arc::clone(&registry),
            Arc::clone(&affinity),
            &self.config,
        ));
        let failover = Arc::new(FailoverManager::new(
            Arc::clone(&registry),
            Arc::clone(&selector),
            Arc::clone(&affinity),
            self.notifier
                .unwrap_or_else(|| Arc::new(LogOnlyNotifier)),
            &self.config,
        ));

        Ok(PoolHost {
            config: self.config,
            seed,
            pool: Arc::new(pool),
            registry,
            affinity,
            selector,
            failover,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            thresholds: self.thresholds,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl Default for PoolHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker process: its pool, its registry presence, and the
/// background loops keeping both honest.
pub struct PoolHost {
    config: FleetConfig,
    seed: PoolRegistryEntry,
    pool: Arc<ConnectionPool>,
    registry: Arc<PoolRegistry>,
    affinity: Arc<SessionAffinityManager>,
    selector: Arc<PoolSelector>,
    failover: Arc<FailoverManager>,
    sink: Arc<dyn MetricsSink>,
    thresholds: AlertThresholds,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolHost {
    pub fn builder() -> PoolHostBuilder {
        PoolHostBuilder::new()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn affinity(&self) -> &Arc<SessionAffinityManager> {
        &self.affinity
    }

    pub fn selector(&self) -> &Arc<PoolSelector> {
        &self.selector
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    /// Register the pool and start the maintenance loops.
    pub async fn start(&self) -> TetherResult<()> {
        let entry = self.pool.registry_entry(&self.seed).await;
        self.registry.register(&entry).await?;
        self.pool
            .attach_registry(Arc::clone(&self.registry), self.seed.clone())
            .await;

        let handles = vec![
            self.spawn_heartbeat_loop(),
            self.spawn_health_sweep_loop(),
            self.spawn_failover_loop(),
            self.spawn_metrics_loop(),
        ];
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }

        info!(pool = %self.seed.pool_id, endpoint = %self.seed.endpoint, "pool host started");
        Ok(())
    }

    /// Stop routing to this pool, remove it from the registry, and stop
    /// the maintenance loops.
    pub async fn shutdown(&self) -> TetherResult<()> {
        self.abort_tasks();

        self.pool.set_reported_status(HealthStatus::Unavailable).await;
        let entry = self.pool.registry_entry(&self.seed).await;
        if let Err(e) = self.registry.register(&entry).await {
            warn!(pool = %self.seed.pool_id, "final heartbeat failed: {}", e);
        }

        // Drain the fleet-visible state for connections this pool holds
        for client_id in self.pool.client_ids().await {
            if let Err(e) = self
                .registry
                .release_attribution(&self.seed.pool_id, &client_id)
                .await
            {
                warn!(client = %client_id, "attribution release failed: {}", e);
            }
        }
        self.registry.remove_pool(&self.seed.pool_id).await?;

        info!(pool = %self.seed.pool_id, "pool host shut down");
        Ok(())
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let pool = Arc::clone(&self.pool);
        let registry = Arc::clone(&self.registry);
        let seed = self.seed.clone();
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let entry = pool.registry_entry(&seed).await;
                if let Err(e) = registry.register(&entry).await {
                    warn!(pool = %seed.pool_id, "heartbeat failed: {}", e);
                }
            }
        })
    }

    fn spawn_health_sweep_loop(&self) -> JoinHandle<()> {
        let pool = Arc::clone(&self.pool);
        let period = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;

                let evicted = pool.sweep_idle().await;
                if evicted > 0 {
                    metrics::counter!("tether.pool.idle_evictions").increment(evicted as u64);
                }

                let clients = pool.client_ids().await;
                let total = clients.len();
                let mut unusable = 0usize;
                for client_id in clients {
                    match pool.perform_health_check(&client_id).await {
                        Ok(true) => {}
                        Ok(false) => unusable += 1,
                        Err(e) => {
                            warn!(client = %client_id, "health check failed: {}", e);
                            unusable += 1;
                        }
                    }
                }

                // More than half the pool failing reads as pool-level trouble
                let status = if total > 0 && unusable * 2 > total {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                pool.set_reported_status(status).await;

                pool.refresh_attributions().await;
            }
        })
    }

    fn spawn_failover_loop(&self) -> JoinHandle<()> {
        let failover = Arc::clone(&self.failover);
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = failover.run_detection_cycle().await {
                    warn!("failover detection cycle failed: {}", e);
                }
            }
        })
    }

    fn spawn_metrics_loop(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let failover = Arc::clone(&self.failover);
        let sink = Arc::clone(&self.sink);
        let thresholds = self.thresholds.clone();
        let staleness = self.config.staleness_hard();
        let period = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;

                let entries = match registry.list_all().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!("metrics snapshot skipped: {}", e);
                        continue;
                    }
                };

                let snapshot =
                    FleetMetrics::from_entries(&entries, staleness, failover.failover_events());
                snapshot.publish();
                sink.on_snapshot(&snapshot).await;

                for alert in thresholds.evaluate(&snapshot, &entries, staleness) {
                    sink.on_alert(&alert).await;
                }
            }
        })
    }
}

impl Drop for PoolHost {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
