//! In-memory store
//!
//! BTreeMap-based store with RwLock for concurrency.
//!
//! ## Data Structure Choice
//! - Ordered keys (required for entry range scans)
//! - Single-writer/multi-reader access through `parking_lot::RwLock`
//! - Batches applied under one write lock, so readers never observe a
//!   partially applied batch

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::Result;

use super::{is_valid_range, BatchItem, KvStore, WriteBatch};

/// Ordered in-memory key-value store
pub struct MemStore {
    /// Live key/value pairs
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,

    /// Number of compaction hints received
    compactions: AtomicUsize,
}

impl MemStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            compactions: AtomicUsize::new(0),
        }
    }

    /// Get entry count
    pub fn entry_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Number of compaction hints received (for testing)
    pub fn compactions(&self) -> usize {
        self.compactions.load(Ordering::Relaxed)
    }

    /// Raw key dump in key order (for testing and debugging)
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.data.read().keys().cloned().collect()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get_value<T, F>(&self, key: &[u8], op: F) -> Result<Option<T>>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        let data = self.data.read();
        match data.get(key) {
            Some(value) => op(value).map(Some),
            None => Ok(None),
        }
    }

    fn iterate_value<F>(&self, first: &[u8], last: &[u8], inclusive: bool, mut op: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        if !is_valid_range(first, last, inclusive) {
            return Ok(());
        }

        let upper = if inclusive {
            Bound::Included(last)
        } else {
            Bound::Excluded(last)
        };

        let data = self.data.read();
        for (key, value) in data.range::<[u8], _>((Bound::Included(first), upper)) {
            if !op(key, value)? {
                break;
            }
        }
        Ok(())
    }

    fn commit_write_batch(&self, wb: &WriteBatch) -> Result<()> {
        let mut data = self.data.write();
        for item in wb.iter() {
            match item {
                BatchItem::Put(key, value) => {
                    data.insert(key.to_vec(), value.to_vec());
                }
                BatchItem::Delete(key) => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }

    fn bulk_remove_entries(&self, first: &[u8], last: &[u8]) -> Result<()> {
        if !is_valid_range(first, last, false) {
            return Ok(());
        }

        let mut data = self.data.write();
        let mut tail = data.split_off(first);
        let mut rest = tail.split_off(last);
        data.append(&mut rest);
        Ok(())
    }

    fn compact_entries(&self, _first: &[u8], _last: &[u8]) -> Result<()> {
        // Nothing to reclaim: removed keys are already gone from the map
        self.compactions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
