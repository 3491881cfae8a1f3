//! KV Module
//!
//! The embedded ordered key-value engine each shard persists into.
//!
//! ## Responsibilities
//! - Point reads, forward range iteration over `[first, last)` or
//!   `[first, last]`
//! - Atomic multi-key write batches
//! - Bulk range deletion and a range-compaction hint
//!
//! ## Implementations
//! - [`FjallStore`]: one fjall keyspace per shard directory (production)
//! - [`MemStore`]: ordered in-memory map (tests, embedding)

mod batch;
mod fjall_store;
mod mem_store;

pub use batch::{BatchItem, WriteBatch};
pub use fjall_store::FjallStore;
pub use mem_store::MemStore;

use crate::error::Result;

/// Ordered key-value engine used by one shard
///
/// Implementations must apply a committed [`WriteBatch`] atomically and in
/// staging order: when a key is mutated twice, the later mutation wins.
pub trait KvStore: Send + Sync + 'static {
    /// Short engine name, for diagnostics
    fn name(&self) -> &'static str;

    /// Look up `key` and hand its value to `op`
    ///
    /// Returns `Ok(None)` when the key does not exist.
    fn get_value<T, F>(&self, key: &[u8], op: F) -> Result<Option<T>>
    where
        F: FnOnce(&[u8]) -> Result<T>;

    /// Visit pairs in ascending key order from `first` up to `last`
    ///
    /// `last` is included when `inclusive` is set. Iteration stops when `op`
    /// returns `Ok(false)` or an error.
    fn iterate_value<F>(&self, first: &[u8], last: &[u8], inclusive: bool, op: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>;

    /// Apply every mutation in `wb` atomically
    fn commit_write_batch(&self, wb: &WriteBatch) -> Result<()>;

    /// Delete every key in `[first, last)`
    fn bulk_remove_entries(&self, first: &[u8], last: &[u8]) -> Result<()>;

    /// Ask the engine to reclaim space held by `[first, last)`
    fn compact_entries(&self, first: &[u8], last: &[u8]) -> Result<()>;

    /// Make everything durable before shutdown
    fn close(&self) -> Result<()>;
}

/// Whether `[first, last)` (or `[first, last]`) contains anything
pub(crate) fn is_valid_range(first: &[u8], last: &[u8], inclusive: bool) -> bool {
    if inclusive {
        first <= last
    } else {
        first < last
    }
}
