//! Replica Cache
//!
//! Write-side memory of what each replica last persisted. It suppresses
//! redundant state writes, rejects stale snapshots before any I/O, and
//! answers MaxIndex lookups without touching storage.
//!
//! The lock is held only for single map operations. Per-replica ordering is
//! the caller's responsibility: two callers updating the same replica
//! concurrently is not supported.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::record::{ReplicaId, State};

#[derive(Debug, Default, Clone, Copy)]
struct CacheEntry {
    max_index: Option<u64>,
    state: Option<State>,
    snapshot_index: Option<u64>,
}

/// Per-shard replica cache
#[derive(Debug, Default)]
pub struct ReplicaCache {
    replicas: Mutex<HashMap<ReplicaId, CacheEntry>>,
}

impl ReplicaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_max_index(&self, id: ReplicaId) -> Option<u64> {
        self.replicas.lock().get(&id).and_then(|e| e.max_index)
    }

    /// Cached MaxIndex, falling back to `loader` on a miss
    ///
    /// A successful load is written back. The lock is not held while
    /// `loader` runs.
    pub fn max_index_or_load<F>(&self, id: ReplicaId, loader: F) -> Result<Option<u64>>
    where
        F: FnOnce() -> Result<Option<u64>>,
    {
        if let Some(index) = self.get_max_index(id) {
            return Ok(Some(index));
        }

        let loaded = loader()?;
        if let Some(index) = loaded {
            self.set_max_index(id, index);
        }
        Ok(loaded)
    }

    pub fn set_max_index(&self, id: ReplicaId, index: u64) {
        self.replicas.lock().entry(id).or_default().max_index = Some(index);
    }

    /// Record `state`, returning whether it differs from the cached value
    pub fn set_state(&self, id: ReplicaId, state: State) -> bool {
        let mut replicas = self.replicas.lock();
        let entry = replicas.entry(id).or_default();
        if entry.state == Some(state) {
            return false;
        }
        entry.state = Some(state);
        true
    }

    /// Accept `index` only if it is strictly greater than the last snapshot
    /// index seen for the replica
    pub fn try_save_snapshot(&self, id: ReplicaId, index: u64) -> bool {
        let mut replicas = self.replicas.lock();
        let entry = replicas.entry(id).or_default();
        if index > entry.snapshot_index.unwrap_or(0) {
            entry.snapshot_index = Some(index);
            true
        } else {
            false
        }
    }

    pub fn snapshot_index(&self, id: ReplicaId) -> u64 {
        self.replicas
            .lock()
            .get(&id)
            .and_then(|e| e.snapshot_index)
            .unwrap_or(0)
    }

    /// Cached snapshot index, seeded from `loader` on a miss
    ///
    /// The loaded value is kept unless a snapshot index was recorded while
    /// `loader` ran.
    pub fn snapshot_index_or_load<F>(&self, id: ReplicaId, loader: F) -> Result<u64>
    where
        F: FnOnce() -> Result<u64>,
    {
        let cached = self.replicas.lock().get(&id).and_then(|e| e.snapshot_index);
        if let Some(index) = cached {
            return Ok(index);
        }

        let loaded = loader()?;
        let mut replicas = self.replicas.lock();
        let index = *replicas
            .entry(id)
            .or_default()
            .snapshot_index
            .get_or_insert(loaded);
        Ok(index)
    }

    /// Refresh the snapshot index from a storage read
    pub fn set_snapshot_index(&self, id: ReplicaId, index: u64) {
        self.replicas.lock().entry(id).or_default().snapshot_index = Some(index);
    }

    /// Forget everything about the replica
    pub fn remove(&self, id: ReplicaId) {
        self.replicas.lock().remove(&id);
    }

    /// Number of replicas with cached state
    pub fn len(&self) -> usize {
        self.replicas.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
