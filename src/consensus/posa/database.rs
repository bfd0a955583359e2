//! Snapshot persistence over the host key-value store.
//!
//! Snapshots are JSON-encoded and keyed by their block hash under a dedicated
//! prefix. A memory-backed store is provided for tests and light harnesses.

use super::{config::ChainConfig, PosaError, Snapshot};
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Key prefix for persisted snapshots in the host store.
pub const SNAPSHOT_KEY_PREFIX: &[u8] = b"posa-";

/// Host-provided durable key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` when absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PosaError>;

    /// Write a value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PosaError>;

    /// Remove a value, a no-op when absent.
    fn delete(&self, key: &[u8]) -> Result<(), PosaError>;
}

fn snapshot_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(SNAPSHOT_KEY_PREFIX.len() + 32);
    key.extend_from_slice(SNAPSHOT_KEY_PREFIX);
    key.extend_from_slice(hash.as_slice());
    key
}

/// Load a persisted snapshot by block hash, restoring the runtime
/// configuration the encoding omits.
pub fn load_snapshot<DB: KeyValueStore + ?Sized>(
    config: &ChainConfig,
    db: &DB,
    hash: B256,
) -> Result<Option<Snapshot>, PosaError> {
    let Some(raw) = db.get(&snapshot_key(hash))? else {
        return Ok(None);
    };
    let mut snapshot: Snapshot = serde_json::from_slice(&raw).map_err(|err| PosaError::Store {
        message: err.to_string(),
    })?;
    snapshot.config = config.clone();
    Ok(Some(snapshot))
}

/// Persist a snapshot keyed by its block hash.
pub fn store_snapshot<DB: KeyValueStore + ?Sized>(
    snapshot: &Snapshot,
    db: &DB,
) -> Result<(), PosaError> {
    let encoded = serde_json::to_vec(snapshot).map_err(|err| PosaError::Store {
        message: err.to_string(),
    })?;
    db.put(&snapshot_key(snapshot.hash), &encoded)
}

/// In-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty store behind an `Arc`.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PosaError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PosaError> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), PosaError> {
        self.entries.write().remove(key);
        Ok(())
    }
}
