//! Cross-process fleet scenarios over one shared coordination store.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_server::{PoolHost, ReconnectNotifier, RequestMetadata};
use tether_shared::{
    ClientId, CoordinationStore, FleetConfig, MemoryStore, PoolEndpoint, PoolId, TetherResult,
};
use tokio::sync::Mutex;

struct RecordingNotifier {
    calls: Mutex<Vec<(ClientId, PoolEndpoint)>>,
}

impl RecordingNotifier {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ReconnectNotifier for RecordingNotifier {
    async fn notify_reconnect(
        &self,
        client_id: &ClientId,
        new_endpoint: &PoolEndpoint,
    ) -> TetherResult<()> {
        self.calls
            .lock()
            .await
            .push((client_id.clone(), new_endpoint.clone()));
        Ok(())
    }
}

fn fleet_config() -> FleetConfig {
    FleetConfig {
        max_connections_per_pool: 10,
        heartbeat_interval: Duration::from_millis(40),
        health_check_interval: Duration::from_millis(50),
        drain_grace_period: Duration::ZERO,
        migration_backoff_initial: Duration::from_millis(5),
        ..Default::default()
    }
}

async fn start_host(
    store: &Arc<MemoryStore>,
    pool: &str,
    port: u16,
    notifier: Option<Arc<dyn ReconnectNotifier>>,
) -> PoolHost {
    let mut builder = PoolHost::builder()
        .with_config(fleet_config())
        .with_pool_id(PoolId::new(pool))
        .with_endpoint(PoolEndpoint::new("localhost", port))
        .with_store(Arc::clone(store) as Arc<dyn CoordinationStore>);
    if let Some(notifier) = notifier {
        builder = builder.with_notifier(notifier);
    }

    let host = builder.build().unwrap();
    host.start().await.unwrap();
    host
}

async fn wait_until<F, Fut>(mut condition: F, deadline: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    while started.elapsed() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn admission_routes_to_least_loaded_pool() {
    let store = Arc::new(MemoryStore::new());
    let host_a = start_host(&store, "p-a", 7401, None).await;
    let host_b = start_host(&store, "p-b", 7402, None).await;

    // Load up p-b to 0.8 of capacity
    for i in 0..8 {
        host_b
            .pool()
            .acquire(&ClientId::new(format!("warm-{}", i)))
            .await
            .unwrap();
    }
    let pushed = wait_until(
        || async {
            host_a
                .registry()
                .get_entry(&PoolId::new("p-b"))
                .await
                .ok()
                .flatten()
                .map(|e| e.current_load == 8)
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(pushed, "p-b load never reached the registry");

    let fresh = ClientId::new("fresh-1");
    let chosen = host_a
        .selector()
        .select(&fresh, &RequestMetadata::default())
        .await
        .unwrap();
    assert_eq!(chosen.pool_id, PoolId::new("p-a"));

    // Affinity holds across repeated selections
    for _ in 0..10 {
        let again = host_b
            .selector()
            .select(&fresh, &RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(again.pool_id, PoolId::new("p-a"));
    }

    host_a.shutdown().await.unwrap();
    host_b.shutdown().await.unwrap();
}

#[tokio::test]
async fn crashed_worker_connections_migrate() {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let host_a = start_host(&store, "p-a", 7401, None).await;
    let host_b = start_host(
        &store,
        "p-b",
        7402,
        Some(Arc::clone(&notifier) as Arc<dyn ReconnectNotifier>),
    )
    .await;

    let c1 = ClientId::new("c1");
    let c2 = ClientId::new("c2");
    host_a.pool().acquire(&c1).await.unwrap();
    host_a.pool().acquire(&c2).await.unwrap();
    host_a.affinity().record_affinity(&c1, &PoolId::new("p-a")).await.unwrap();
    host_a.affinity().record_affinity(&c2, &PoolId::new("p-a")).await.unwrap();

    let attributed = wait_until(
        || async {
            host_b
                .registry()
                .list_attributed(&PoolId::new("p-a"))
                .await
                .map(|c| c.len() == 2)
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(attributed, "attributions never reached the registry");

    // Let host_b's failover watch see p-a alive at least once
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Simulated crash: loops stop, entry ages out at the hard threshold
    drop(host_a);

    let migrated = wait_until(
        || async {
            let gone = host_b
                .registry()
                .get_entry(&PoolId::new("p-a"))
                .await
                .map(|e| e.is_none())
                .unwrap_or(false);
            let drained = host_b
                .registry()
                .list_attributed(&PoolId::new("p-a"))
                .await
                .map(|c| c.is_empty())
                .unwrap_or(false);
            gone && drained
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(migrated, "failed pool never drained and decommissioned");

    // Both clients were re-homed onto p-b
    for client in [&c1, &c2] {
        let target = host_b.affinity().get_affinity(client).await.unwrap();
        assert_eq!(target, Some(PoolId::new("p-b")));
    }
    let calls = notifier.calls.lock().await;
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, endpoint)| endpoint.port == 7402));

    // The reconnect itself lands on the new pool
    drop(calls);
    host_b.pool().acquire(&c1).await.unwrap();
    assert_eq!(host_b.pool().len().await, 1);

    host_b.shutdown().await.unwrap();
}
