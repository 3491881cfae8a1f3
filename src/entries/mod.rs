//! Entry Manager
//!
//! Encodes log entries into the key space and reads them back. Two layouts
//! exist, fixed per storage instance:
//!
//! ```text
//! Plain:    01 01 | 0000 | group | member | index       -> Entry
//! Batched:  07 07 | 0000 | group | member | slot start  -> EntryBatch
//! ```
//!
//! A batched slot covers [`ENTRY_BATCH_SIZE`] consecutive indices. Both
//! layouts share one contract: staging, size-bounded iteration, the span of
//! surviving entries, and ranged removal of everything at or below an index.
//!
//! The layout is chosen once when a shard opens. Existing content wins over
//! configuration so an instance never mixes the two.

pub mod batched;
pub mod plain;

use std::sync::Arc;

use crate::cache::ReplicaCache;
use crate::context::Context;
use crate::error::{Result, ShardLogError};
use crate::key::{Key, KeyKind};
use crate::kv::KvStore;
use crate::record::{codec, Entry, ReplicaId};

pub use batched::BatchedEntries;
pub use plain::PlainEntries;

/// Binary format identifier of the plain layout
pub const PLAIN_BINARY_FORMAT: u32 = 100;

/// Binary format identifier of the batched layout
pub const BATCHED_BINARY_FORMAT: u32 = 210;

/// Consecutive indices sharing one batched record
pub const ENTRY_BATCH_SIZE: u64 = 64;

/// On-disk entry layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryFormat {
    /// One record per entry
    #[default]
    Plain,

    /// Up to [`ENTRY_BATCH_SIZE`] entries per record
    Batched,
}

impl EntryFormat {
    pub fn binary_format(self) -> u32 {
        match self {
            EntryFormat::Plain => PLAIN_BINARY_FORMAT,
            EntryFormat::Batched => BATCHED_BINARY_FORMAT,
        }
    }
}

/// Format-specific entry access for one shard
pub enum EntryManager<S> {
    Plain(PlainEntries<S>),
    Batched(BatchedEntries<S>),
}

impl<S: KvStore> EntryManager<S> {
    pub fn new(format: EntryFormat, store: Arc<S>, cache: Arc<ReplicaCache>) -> Self {
        match format {
            EntryFormat::Plain => EntryManager::Plain(PlainEntries::new(store, cache)),
            EntryFormat::Batched => EntryManager::Batched(BatchedEntries::new(store, cache)),
        }
    }

    /// Pick the layout from the store's content, falling back to
    /// `configured` for a store without entries
    pub fn open(configured: EntryFormat, store: Arc<S>, cache: Arc<ReplicaCache>) -> Result<Self> {
        let format = match detect_format(store.as_ref())? {
            Some(detected) => {
                if detected != configured {
                    tracing::info!(
                        ?detected,
                        ?configured,
                        "existing entries keep their format, configured format ignored"
                    );
                }
                detected
            }
            None => configured,
        };
        Ok(Self::new(format, store, cache))
    }

    pub fn format(&self) -> EntryFormat {
        match self {
            EntryManager::Plain(_) => EntryFormat::Plain,
            EntryManager::Batched(_) => EntryFormat::Batched,
        }
    }

    pub fn binary_format(&self) -> u32 {
        self.format().binary_format()
    }

    /// Stage `entries` into the context's write batch
    ///
    /// Returns the highest staged index, or 0 when nothing was staged because
    /// the run ends below the replica's current MaxIndex.
    pub fn record(
        &self,
        ctx: &mut Context<'_>,
        group_id: u64,
        member_id: u64,
        entries: &[Entry],
    ) -> Result<u64> {
        let Some(last) = entries.last() else {
            return Ok(0);
        };

        let (store, cache) = self.parts();
        if let Some(max_index) = load_max_index(store, cache, ctx.key(), group_id, member_id)? {
            if last.index < max_index {
                tracing::trace!(
                    replica = %ReplicaId::new(group_id, member_id),
                    last = last.index,
                    max_index,
                    "skipped entries below max index"
                );
                return Ok(0);
            }
        }

        match self {
            EntryManager::Plain(p) => p.record(ctx, group_id, member_id, entries)?,
            EntryManager::Batched(b) => b.record(ctx, group_id, member_id, entries)?,
        }
        Ok(last.index)
    }

    /// Entries in `[low, min(high, max_index + 1))`, ascending
    ///
    /// Starts at the first surviving entry at or above `low` and stops at the
    /// first gap. The first entry is always returned; later ones only while
    /// the accumulated size stays within `max_size`. Returns the entries and
    /// their accumulated size.
    pub fn iterate(
        &self,
        group_id: u64,
        member_id: u64,
        low: u64,
        high: u64,
        max_index: u64,
        max_size: u64,
    ) -> Result<(Vec<Entry>, u64)> {
        let upper = high.min(max_index.saturating_add(1));
        if low >= upper {
            return Ok((Vec::new(), 0));
        }

        let mut collector = EntryCollector::new(max_size);
        match self {
            EntryManager::Plain(p) => p.iterate(group_id, member_id, low, upper, &mut collector)?,
            EntryManager::Batched(b) => b.iterate(group_id, member_id, low, upper, &mut collector)?,
        }
        Ok(collector.finish())
    }

    /// First surviving index at or above `snapshot_index`, and the number of
    /// entries from there up to `max_index`
    ///
    /// With no surviving entries the span is empty and starts right after
    /// the snapshot.
    pub fn get_range(
        &self,
        group_id: u64,
        member_id: u64,
        snapshot_index: u64,
        max_index: u64,
    ) -> Result<(u64, u64)> {
        let first = match self {
            EntryManager::Plain(p) => p.first_index(group_id, member_id, snapshot_index, max_index)?,
            EntryManager::Batched(b) => {
                b.first_index(group_id, member_id, snapshot_index, max_index)?
            }
        };

        Ok(match first {
            Some(first) => (first, max_index - first + 1),
            None => (snapshot_index.saturating_add(1), 0),
        })
    }

    /// Run `op` over the key range `[first, last)` holding every record whose
    /// entries are all at or below `index`
    pub fn ranged_op<F>(&self, group_id: u64, member_id: u64, index: u64, op: F) -> Result<()>
    where
        F: FnOnce(&[u8], &[u8]) -> Result<()>,
    {
        match self {
            EntryManager::Plain(p) => p.ranged_op(group_id, member_id, index, op),
            EntryManager::Batched(b) => b.ranged_op(group_id, member_id, index, op),
        }
    }

    fn parts(&self) -> (&S, &ReplicaCache) {
        match self {
            EntryManager::Plain(p) => (p.store.as_ref(), p.cache.as_ref()),
            EntryManager::Batched(b) => (b.store.as_ref(), b.cache.as_ref()),
        }
    }
}

/// Cached MaxIndex of a replica, read from `store` on a miss
///
/// `None` means nothing has been saved for the replica.
pub(crate) fn load_max_index<S: KvStore>(
    store: &S,
    cache: &ReplicaCache,
    key: &mut Key,
    group_id: u64,
    member_id: u64,
) -> Result<Option<u64>> {
    cache.max_index_or_load(ReplicaId::new(group_id, member_id), || {
        key.set_max_index_key(group_id, member_id);
        store.get_value(key.as_bytes(), codec::decode_max_index)
    })
}

/// Layout of the entries already in `store`, if any
pub fn detect_format<S: KvStore>(store: &S) -> Result<Option<EntryFormat>> {
    let plain = has_records(store, KeyKind::Entry)?;
    let batched = has_records(store, KeyKind::EntryBatch)?;
    match (plain, batched) {
        (true, true) => Err(ShardLogError::UnsupportedFormat(
            "both plain and batched entries present".to_string(),
        )),
        (true, false) => Ok(Some(EntryFormat::Plain)),
        (false, true) => Ok(Some(EntryFormat::Batched)),
        (false, false) => Ok(None),
    }
}

fn has_records<S: KvStore>(store: &S, kind: KeyKind) -> Result<bool> {
    let mut first = Key::new();
    let mut last = Key::new();
    first.set(kind, 0, 0, Some(0))?;
    last.set(kind, u64::MAX, u64::MAX, Some(u64::MAX))?;

    let mut found = false;
    store.iterate_value(first.as_bytes(), last.as_bytes(), true, |_, _| {
        found = true;
        Ok(false)
    })?;
    Ok(found)
}

/// Size-bounded, gap-free accumulation of entries
pub(crate) struct EntryCollector {
    entries: Vec<Entry>,
    size: u64,
    max_size: u64,
}

impl EntryCollector {
    fn new(max_size: u64) -> Self {
        Self {
            entries: Vec::new(),
            size: 0,
            max_size,
        }
    }

    /// Add `entry`, returning false once iteration should stop
    pub(crate) fn push(&mut self, entry: Entry) -> bool {
        if let Some(prev) = self.entries.last() {
            if entry.index != prev.index + 1 {
                return false;
            }
        }

        let size = entry.size_upper_limit();
        if !self.entries.is_empty() && self.size + size > self.max_size {
            return false;
        }
        self.size += size;
        self.entries.push(entry);
        true
    }

    fn finish(self) -> (Vec<Entry>, u64) {
        (self.entries, self.size)
    }
}
