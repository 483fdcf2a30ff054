use thiserror::Error;

/// Tether-specific error types
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("Pool exhausted: {pool_id}")]
    PoolExhausted { pool_id: String },

    #[error("No available pool matched the selection criteria")]
    NoAvailablePool,

    #[error("Circuit open for target: {target}")]
    CircuitOpen { target: String },

    #[error("Migration failed for client {client_id}: {reason}")]
    MigrationFailed { client_id: String, reason: String },

    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Coordination store error: {0}")]
    StoreError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TetherError {
    pub fn pool_exhausted<S: Into<String>>(pool_id: S) -> Self {
        TetherError::PoolExhausted {
            pool_id: pool_id.into(),
        }
    }

    pub fn circuit_open<S: Into<String>>(target: S) -> Self {
        TetherError::CircuitOpen {
            target: target.into(),
        }
    }

    pub fn migration_failed<S: Into<String>, R: Into<String>>(client_id: S, reason: R) -> Self {
        TetherError::MigrationFailed {
            client_id: client_id.into(),
            reason: reason.into(),
        }
    }

    pub fn registry_unavailable<S: Into<String>>(msg: S) -> Self {
        TetherError::RegistryUnavailable(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        TetherError::StoreError(msg.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        TetherError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        TetherError::ConfigurationError(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        TetherError::Internal(msg.into())
    }

    /// Whether a retry at the owning call site may change the outcome.
    ///
    /// Structural errors (PoolExhausted, NoAvailablePool) change the
    /// selection outcome, not the call parameters, and are never retried
    /// blindly.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TetherError::Timeout { .. }
                | TetherError::CircuitOpen { .. }
                | TetherError::RegistryUnavailable(_)
                | TetherError::StoreError(_)
        )
    }
}

/// Result type for tether operations
pub type TetherResult<T> = Result<T, TetherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = TetherError::pool_exhausted("pool-a");
        assert!(matches!(error, TetherError::PoolExhausted { .. }));
        assert_eq!(error.to_string(), "Pool exhausted: pool-a");
    }

    #[test]
    fn test_migration_error() {
        let error = TetherError::migration_failed("client-7", "no healthy target");
        assert!(error.to_string().contains("client-7"));
        assert!(error.to_string().contains("no healthy target"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(TetherError::timeout("registry get").is_transient());
        assert!(TetherError::circuit_open("pool-a").is_transient());
        assert!(TetherError::registry_unavailable("down").is_transient());
        assert!(!TetherError::NoAvailablePool.is_transient());
        assert!(!TetherError::pool_exhausted("pool-a").is_transient());
    }
}
