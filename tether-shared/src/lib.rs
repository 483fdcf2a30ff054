//! Shared data model and leaf components for the tether fleet.
//!
//! Everything here is process-agnostic: the identity and registry-entry
//! types, the typed error taxonomy, the fleet configuration object, the
//! five-operation coordination-store contract, the per-target circuit
//! breaker, and the metrics/alerting types. Worker-side and routing-side
//! components live in `tether-server`.

pub mod circuit_breaker;
pub mod config;
pub mod exception;
pub mod mesh;
pub mod metrics;
pub mod store;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::FleetConfig;
pub use exception::{TetherError, TetherResult};
pub use mesh::{
    AffinityRecord, ClientId, ConnectionHealthState, HealthStatus, PoolEndpoint, PoolId,
    PoolRegistryEntry, SlotId, WorkerId,
};
pub use metrics::{Alert, AlertThresholds, FleetMetrics, MetricsSink, TracingSink};
pub use store::{CoordinationStore, MemoryStore};
