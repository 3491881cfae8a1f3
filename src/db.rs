//! Per-shard log DB
//!
//! One `Db` owns one storage instance plus the write-side state in front of
//! it: the replica cache, the context and key pools, and the entry manager
//! chosen when the shard opened.
//!
//! ## Update Protocol
//! ```text
//! save_updates(updates)
//!   ├─► for each update, into one context-owned write batch:
//!   │     1. state      (only when the cache reports a change)
//!   │     2. snapshot   (only when newer than any seen; drops older ones,
//!   │                    MaxIndex = snapshot index)
//!   │     3. entries    (MaxIndex = last staged index)
//!   └─► commit once, if anything was staged
//! ```
//! A failed update evicts every replica it touched from the cache so the
//! next access reloads from storage.
//!
//! Commits and entry removal take the shard's write lock. Removal in the
//! batched layout rewrites the slot straddling the cutoff, and that slot may
//! be the one an append is merging into.

use std::borrow::Borrow;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::ReplicaCache;
use crate::config::Config;
use crate::context::{Context, ContextPool};
use crate::entries::{self, EntryFormat, EntryManager};
use crate::error::{invariant_violation, Result, ShardLogError};
use crate::key::{parse_key, Key, KeyPool};
use crate::kv::KvStore;
use crate::record::{
    codec, Bootstrap, Entry, RaftState, ReplicaId, Snapshot, State, StateMachineType, Update,
};

/// Log DB of one shard
pub struct Db<S: KvStore> {
    store: Arc<S>,
    cache: Arc<ReplicaCache>,
    contexts: ContextPool,
    keys: KeyPool,
    entries: EntryManager<S>,
    /// Held across read-modify-write of stored records
    write_lock: Mutex<()>,
}

impl<S: KvStore> Db<S> {
    /// Wrap `store`, detecting the entry format it already uses
    pub fn open(store: S, config: &Config) -> Result<Self> {
        let store = Arc::new(store);
        let cache = Arc::new(ReplicaCache::new());
        let entries =
            EntryManager::open(config.entry_format, Arc::clone(&store), Arc::clone(&cache))?;

        Ok(Self {
            store,
            cache,
            contexts: ContextPool::new(config.save_buffer_size, config.max_save_buffer_size),
            keys: KeyPool::new(),
            entries,
            write_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.store.name()
    }

    pub fn binary_format(&self) -> u32 {
        self.entries.binary_format()
    }

    pub fn entry_format(&self) -> EntryFormat {
        self.entries.format()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &ReplicaCache {
        &self.cache
    }

    pub fn close(&self) -> Result<()> {
        self.store.close()
    }

    // =========================================================================
    // Update Protocol
    // =========================================================================

    /// Persist a batch of updates atomically
    pub fn save_updates<U: Borrow<Update>>(&self, updates: &[U]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut ctx = self.contexts.acquire();
        let result = self.stage_updates(&mut ctx, updates).and_then(|()| {
            if ctx.write_batch().is_empty() {
                return Ok(());
            }
            self.store.commit_write_batch(ctx.write_batch())
        });

        if let Err(e) = &result {
            tracing::warn!(updates = updates.len(), error = %e, "failed to save updates");
            self.evict(updates);
        }
        result
    }

    fn stage_updates<U: Borrow<Update>>(&self, ctx: &mut Context<'_>, updates: &[U]) -> Result<()> {
        for update in updates {
            let update = update.borrow();
            self.stage_state(ctx, update)?;

            let snapshot = &update.snapshot;
            let accepted = if snapshot.is_empty() {
                None
            } else {
                self.accept_snapshot(update.replica(), snapshot.index)?
            };
            if let Some(previous) = accepted {
                if let Some(last) = update.entries_to_save.last() {
                    if snapshot.index > last.index {
                        invariant_violation(format!(
                            "{} snapshot index {} is beyond last entry index {}",
                            update.replica(),
                            snapshot.index,
                            last.index
                        ));
                    }
                }
                self.stage_snapshot(ctx, update.group_id, update.member_id, snapshot, previous)?;
                self.stage_max_index(ctx, update.group_id, update.member_id, snapshot.index);
            }

            let max_index = self.entries.record(
                ctx,
                update.group_id,
                update.member_id,
                &update.entries_to_save,
            )?;
            if max_index > 0 {
                self.stage_max_index(ctx, update.group_id, update.member_id, max_index);
            }
        }
        Ok(())
    }

    fn stage_state(&self, ctx: &mut Context<'_>, update: &Update) -> Result<()> {
        if update.state.is_empty() || !self.cache.set_state(update.replica(), update.state) {
            return Ok(());
        }
        ctx.key().set_state_key(update.group_id, update.member_id);
        ctx.put_record(&update.state)
    }

    /// Snapshot index seen before `index` was accepted, or `None` when
    /// `index` is stale
    ///
    /// A replica not yet in the cache is compared against the newest stored
    /// snapshot.
    fn accept_snapshot(&self, id: ReplicaId, index: u64) -> Result<Option<u64>> {
        let previous = self.cache.snapshot_index_or_load(id, || {
            let stored = self.snapshot_indices(id.group_id, id.member_id)?;
            Ok(stored.into_iter().max().unwrap_or(0))
        })?;
        Ok(self.cache.try_save_snapshot(id, index).then_some(previous))
    }

    /// Stage `snapshot` and drop every older snapshot record, including one
    /// staged earlier in this batch
    fn stage_snapshot(
        &self,
        ctx: &mut Context<'_>,
        group_id: u64,
        member_id: u64,
        snapshot: &Snapshot,
        previous: u64,
    ) -> Result<()> {
        for index in self.snapshot_indices(group_id, member_id)? {
            if index < snapshot.index {
                ctx.key().set_snapshot_key(group_id, member_id, index);
                ctx.delete_key();
            }
        }
        if previous > 0 && previous < snapshot.index {
            ctx.key().set_snapshot_key(group_id, member_id, previous);
            ctx.delete_key();
        }

        ctx.key().set_snapshot_key(group_id, member_id, snapshot.index);
        ctx.put_record(snapshot)
    }

    fn stage_max_index(&self, ctx: &mut Context<'_>, group_id: u64, member_id: u64, index: u64) {
        self.cache
            .set_max_index(ReplicaId::new(group_id, member_id), index);
        ctx.key().set_max_index_key(group_id, member_id);
        ctx.put_max_index(index);
    }

    fn evict<U: Borrow<Update>>(&self, updates: &[U]) {
        for update in updates {
            self.cache.remove(update.borrow().replica());
        }
    }

    /// Persist only the snapshots carried by `updates`
    pub fn save_snapshots<U: Borrow<Update>>(&self, updates: &[U]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut ctx = self.contexts.acquire();
        let result = self.stage_snapshots(&mut ctx, updates).and_then(|()| {
            if ctx.write_batch().is_empty() {
                return Ok(());
            }
            self.store.commit_write_batch(ctx.write_batch())
        });

        if result.is_err() {
            self.evict(updates);
        }
        result
    }

    fn stage_snapshots<U: Borrow<Update>>(&self, ctx: &mut Context<'_>, updates: &[U]) -> Result<()> {
        for update in updates {
            let update = update.borrow();
            let snapshot = &update.snapshot;
            if snapshot.is_empty() {
                continue;
            }
            if let Some(previous) = self.accept_snapshot(update.replica(), snapshot.index)? {
                self.stage_snapshot(ctx, update.group_id, update.member_id, snapshot, previous)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Highest index persisted for the replica
    pub fn get_max_index(&self, group_id: u64, member_id: u64) -> Result<u64> {
        let mut key = self.keys.get();
        entries::load_max_index(&*self.store, &self.cache, &mut key, group_id, member_id)?
            .ok_or_else(|| ShardLogError::not_found("max index", group_id, member_id))
    }

    pub fn get_state(&self, group_id: u64, member_id: u64) -> Result<State> {
        let mut key = self.keys.get();
        key.set_state_key(group_id, member_id);
        self.store
            .get_value(key.as_bytes(), codec::decode_record::<State>)?
            .ok_or_else(|| ShardLogError::not_found("state", group_id, member_id))
    }

    /// Persistent state plus the span of entries after `snapshot_index`
    pub fn read_raft_state(
        &self,
        group_id: u64,
        member_id: u64,
        snapshot_index: u64,
    ) -> Result<RaftState> {
        let (first_index, entry_count) = self.get_range(group_id, member_id, snapshot_index)?;
        let state = self.get_state(group_id, member_id)?;
        Ok(RaftState {
            state,
            first_index,
            entry_count,
        })
    }

    fn get_range(&self, group_id: u64, member_id: u64, snapshot_index: u64) -> Result<(u64, u64)> {
        let max_index = match self.get_max_index(group_id, member_id) {
            Ok(index) => index,
            Err(e) if e.is_not_found() => return Ok((snapshot_index, 0)),
            Err(e) => return Err(e),
        };
        if snapshot_index == max_index {
            return Ok((snapshot_index, 0));
        }
        self.entries
            .get_range(group_id, member_id, snapshot_index, max_index)
    }

    /// Entries in `[low, high)`, bounded by `max_size` bytes
    ///
    /// Returns the entries and their accumulated size. A replica without
    /// saved entries yields an empty result.
    pub fn iterate_entries(
        &self,
        group_id: u64,
        member_id: u64,
        low: u64,
        high: u64,
        max_size: u64,
    ) -> Result<(Vec<Entry>, u64)> {
        let max_index = match self.get_max_index(group_id, member_id) {
            Ok(index) => index,
            Err(e) if e.is_not_found() => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        self.entries
            .iterate(group_id, member_id, low, high, max_index, max_size)
    }

    // =========================================================================
    // Entry Removal
    // =========================================================================

    /// Delete every entry at or below `index`
    pub fn remove_entries_to(&self, group_id: u64, member_id: u64, index: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.remove_entries(group_id, member_id, index)
    }

    fn remove_entries(&self, group_id: u64, member_id: u64, index: u64) -> Result<()> {
        self.entries
            .ranged_op(group_id, member_id, index, |first, last| {
                self.store.bulk_remove_entries(first, last)
            })
    }

    /// Delete every entry at or below `index` and ask the engine to reclaim
    /// the space
    pub fn compact(&self, group_id: u64, member_id: u64, index: u64) -> Result<()> {
        tracing::debug!(
            replica = %ReplicaId::new(group_id, member_id),
            index,
            "compacting entries"
        );
        let _guard = self.write_lock.lock();
        self.entries
            .ranged_op(group_id, member_id, index, |first, last| {
                self.store.bulk_remove_entries(first, last)?;
                self.store.compact_entries(first, last)
            })
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// The retained snapshot of the replica
    pub fn get_snapshot(&self, group_id: u64, member_id: u64) -> Result<Snapshot> {
        let snapshot = self
            .list_snapshots(group_id, member_id)?
            .pop()
            .ok_or_else(|| ShardLogError::not_found("snapshot", group_id, member_id))?;
        self.cache
            .set_snapshot_index(ReplicaId::new(group_id, member_id), snapshot.index);
        Ok(snapshot)
    }

    /// Replace everything saved for the replica with an imported snapshot
    ///
    /// The replica restarts as a joining member with state
    /// `{term, commit: index}` and MaxIndex at the snapshot index.
    pub fn import_snapshot(&self, snapshot: &Snapshot, member_id: u64) -> Result<()> {
        let group_id = snapshot.group_id;
        let id = ReplicaId::new(group_id, member_id);
        if snapshot.state_machine_type == StateMachineType::Unknown {
            invariant_violation(format!("{} imported snapshot has unknown state machine type", id));
        }

        let _guard = self.write_lock.lock();
        let mut ctx = self.contexts.acquire();
        let stale: Vec<u64> = self
            .snapshot_indices(group_id, member_id)?
            .into_iter()
            .filter(|&index| index >= snapshot.index)
            .collect();
        Self::stage_remove_node_data(&mut ctx, group_id, member_id, &stale);

        let bootstrap = Bootstrap {
            join: true,
            state_machine_type: snapshot.state_machine_type,
            ..Default::default()
        };
        ctx.key().set_bootstrap_key(group_id, member_id);
        ctx.put_record(&bootstrap)?;

        let state = State {
            term: snapshot.term,
            commit: snapshot.index,
            ..Default::default()
        };
        ctx.key().set_state_key(group_id, member_id);
        ctx.put_record(&state)?;

        self.stage_snapshot(&mut ctx, group_id, member_id, snapshot, 0)?;
        ctx.key().set_max_index_key(group_id, member_id);
        ctx.put_max_index(snapshot.index);

        self.store.commit_write_batch(ctx.write_batch())?;
        self.cache.remove(id);

        tracing::info!(replica = %id, index = snapshot.index, "imported snapshot");
        Ok(())
    }

    fn list_snapshots(&self, group_id: u64, member_id: u64) -> Result<Vec<Snapshot>> {
        let (first, last) = snapshot_bounds(group_id, member_id);
        let mut snapshots: Vec<Snapshot> = Vec::new();
        self.store
            .iterate_value(first.as_bytes(), last.as_bytes(), true, |_, value| {
                snapshots.push(codec::decode_record(value)?);
                Ok(true)
            })?;
        Ok(snapshots)
    }

    fn snapshot_indices(&self, group_id: u64, member_id: u64) -> Result<Vec<u64>> {
        let (first, last) = snapshot_bounds(group_id, member_id);
        let mut indices = Vec::new();
        self.store
            .iterate_value(first.as_bytes(), last.as_bytes(), true, |key, _| {
                indices.extend(parse_key(key)?.index);
                Ok(true)
            })?;
        Ok(indices)
    }

    // =========================================================================
    // Bootstrap Records
    // =========================================================================

    pub fn save_bootstrap_info(
        &self,
        group_id: u64,
        member_id: u64,
        bootstrap: &Bootstrap,
    ) -> Result<()> {
        let mut ctx = self.contexts.acquire();
        ctx.key().set_bootstrap_key(group_id, member_id);
        ctx.put_record(bootstrap)?;
        self.store.commit_write_batch(ctx.write_batch())
    }

    pub fn get_bootstrap_info(&self, group_id: u64, member_id: u64) -> Result<Bootstrap> {
        let mut key = self.keys.get();
        key.set_bootstrap_key(group_id, member_id);
        self.store
            .get_value(key.as_bytes(), codec::decode_record::<Bootstrap>)?
            .ok_or_else(|| ShardLogError::not_found("bootstrap", group_id, member_id))
    }

    /// Every bootstrap record in this shard, in key order
    pub fn list_bootstrap_info(&self) -> Result<Vec<(ReplicaId, Bootstrap)>> {
        let mut first = Key::new();
        let mut last = Key::new();
        first.set_bootstrap_key(0, 0);
        last.set_bootstrap_key(u64::MAX, u64::MAX);

        let mut records = Vec::new();
        self.store
            .iterate_value(first.as_bytes(), last.as_bytes(), true, |key, value| {
                let parsed = parse_key(key)?;
                let bootstrap: Bootstrap = codec::decode_record(value)?;
                records.push((ReplicaId::new(parsed.group_id, parsed.member_id), bootstrap));
                Ok(true)
            })?;
        Ok(records)
    }

    // =========================================================================
    // Replica Removal
    // =========================================================================

    /// Delete everything saved for the replica
    pub fn remove_node_data(&self, group_id: u64, member_id: u64) -> Result<()> {
        let id = ReplicaId::new(group_id, member_id);
        let _guard = self.write_lock.lock();
        let snapshots = self.snapshot_indices(group_id, member_id)?;
        {
            let mut ctx = self.contexts.acquire();
            Self::stage_remove_node_data(&mut ctx, group_id, member_id, &snapshots);
            ctx.key().set_entry_key(group_id, member_id, u64::MAX);
            ctx.delete_key();
            self.store.commit_write_batch(ctx.write_batch())?;
        }
        self.cache.remove(id);
        self.remove_entries(group_id, member_id, u64::MAX)?;

        tracing::info!(replica = %id, "removed replica data");
        Ok(())
    }

    fn stage_remove_node_data(
        ctx: &mut Context<'_>,
        group_id: u64,
        member_id: u64,
        snapshots: &[u64],
    ) {
        ctx.key().set_state_key(group_id, member_id);
        ctx.delete_key();
        ctx.key().set_bootstrap_key(group_id, member_id);
        ctx.delete_key();
        ctx.key().set_max_index_key(group_id, member_id);
        ctx.delete_key();
        for &index in snapshots {
            ctx.key().set_snapshot_key(group_id, member_id, index);
            ctx.delete_key();
        }
    }
}

fn snapshot_bounds(group_id: u64, member_id: u64) -> (Key, Key) {
    let mut first = Key::new();
    let mut last = Key::new();
    first.set_snapshot_key(group_id, member_id, 0);
    last.set_snapshot_key(group_id, member_id, u64::MAX);
    (first, last)
}
