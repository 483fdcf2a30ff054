//! Coordination store contract and the in-process reference backend.
//!
//! The fleet shares state through a key-value service supporting exactly
//! five operations: upsert-with-TTL, get-by-key, list-by-prefix, and
//! atomic increment/decrement. Everything cross-process goes through
//! this seam so the backing service can be swapped or mocked.

use crate::exception::{TetherError, TetherResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Narrow contract over the shared coordination service.
///
/// Deletion is expressed as an upsert with a zero TTL; backends must
/// treat a zero TTL as immediate expiry.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Upsert a value, refreshing its TTL. Idempotent.
    async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> TetherResult<()>;

    /// Fetch a value by key; None if absent or expired.
    async fn get(&self, key: &str) -> TetherResult<Option<Vec<u8>>>;

    /// List all live (key, value) pairs under a prefix, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> TetherResult<Vec<(String, Vec<u8>)>>;

    /// Atomically add `delta` (negative to decrement) to an integer key,
    /// returning the new value. Missing keys start at zero.
    async fn increment(&self, key: &str, delta: i64) -> TetherResult<i64>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process store backend.
///
/// Serves tests and single-process deployments; distributed deployments
/// plug a real key-value service in behind [`CoordinationStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Drop every expired entry. Expiry is otherwise lazy, on access.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }

    fn parse_counter(bytes: &[u8]) -> TetherResult<i64> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| TetherError::store("counter key holds a non-integer value"))
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> TetherResult<()> {
        if ttl.is_zero() {
            self.entries.remove(key);
            return Ok(());
        }
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> TetherResult<Option<Vec<u8>>> {
        // The read guard must drop before the expired-entry removal below.
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.entries.remove(key);
        Ok(None)
    }

    async fn list_prefix(&self, prefix: &str) -> TetherResult<Vec<(String, Vec<u8>)>> {
        let mut items: Vec<(String, Vec<u8>)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.is_expired())
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items)
    }

    async fn increment(&self, key: &str, delta: i64) -> TetherResult<i64> {
        // The entry guard holds the shard lock, making read-add-write atomic.
        let mut entry = self.entries.entry(key.to_string()).or_insert(StoredEntry {
            value: b"0".to_vec(),
            expires_at: None,
        });
        let current = if entry.is_expired() {
            0
        } else {
            Self::parse_counter(&entry.value)?
        };
        let updated = current + delta;
        entry.value = updated.to_string().into_bytes();
        entry.expires_at = None;
        Ok(updated)
    }
}
