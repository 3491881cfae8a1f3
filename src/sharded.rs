//! Sharded Dispatch
//!
//! Splits the key space across independent shards, each with its own
//! storage instance and directory. Every operation for a replica group lands
//! on `group_id % shards`, so groups never need cross-shard atomicity.
//!
//! ## Directory Layout
//! ```text
//! one directory:      <dir>/shard-0, <dir>/shard-1, ...
//! one per shard:      <dir0>/shard-0, <dir1>/shard-1, ...
//! ```
//! Each distinct base directory is locked for the lifetime of the instance.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db::Db;
use crate::entries::{self, EntryFormat};
use crate::error::{Result, ShardLogError};
use crate::fs::{self, DirLock};
use crate::kv::{FjallStore, KvStore};
use crate::record::{Bootstrap, Entry, RaftState, ReplicaId, Snapshot, Update};

/// Deterministic group to shard routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    shards: u64,
}

impl Partitioner {
    /// `shards` must be non-zero; [`Config::validate`] enforces it
    pub fn new(shards: u64) -> Self {
        Self { shards }
    }

    pub fn shards(&self) -> u64 {
        self.shards
    }

    pub fn shard(&self, group_id: u64) -> usize {
        (group_id % self.shards) as usize
    }
}

/// Log DB spread over independent shards
pub struct ShardedDb<S: KvStore = FjallStore> {
    config: Config,
    partitioner: Partitioner,
    shards: Vec<Db<S>>,

    /// Held until drop so no other process opens the same directories
    _locks: Vec<DirLock>,
}

impl ShardedDb<FjallStore> {
    /// Open or create a sharded log DB under `dirs`
    ///
    /// `dirs` holds either one directory shared by every shard or exactly one
    /// directory per shard.
    pub fn open<P: AsRef<Path>>(config: Config, dirs: &[P]) -> Result<Self> {
        // Step 1: Reject inconsistent options before touching the disk
        config.validate()?;

        // Step 2: Map shards onto directories
        let dirs: Vec<PathBuf> = dirs.iter().map(|d| d.as_ref().to_path_buf()).collect();
        let shard_dirs = check_dirs(config.shards, &dirs)?;

        // Step 3: Lock every base directory and check its free space
        let mut locks = Vec::new();
        for dir in dirs.iter().collect::<BTreeSet<_>>() {
            locks.push(DirLock::acquire(dir)?);
            if config.min_free_disk_space > 0 {
                fs::check_free_space(dir, config.min_free_disk_space)?;
            }
        }

        // Step 4: Open one storage instance per shard
        let mut stores = Vec::with_capacity(shard_dirs.len());
        for dir in &shard_dirs {
            fs::prepare_dir(dir)?;
            stores.push(FjallStore::open(dir, &config)?);
        }

        let mut db = Self::from_stores(config, stores)?;
        db._locks = locks;
        Ok(db)
    }
}

impl<S: KvStore> ShardedDb<S> {
    /// Build from already opened storage instances, one per shard
    pub fn from_stores(mut config: Config, stores: Vec<S>) -> Result<Self> {
        config.validate()?;
        if stores.len() as u64 != config.shards {
            return Err(ShardLogError::Config(format!(
                "{} stores supplied for {} shards",
                stores.len(),
                config.shards
            )));
        }

        config.entry_format = resolve_format(config.entry_format, &stores)?;

        let shards = stores
            .into_iter()
            .map(|store| Db::open(store, &config))
            .collect::<Result<Vec<_>>>()?;

        let db = Self {
            partitioner: Partitioner::new(config.shards),
            config,
            shards,
            _locks: Vec::new(),
        };
        tracing::info!(
            engine = db.name(),
            shards = db.shard_count(),
            format = ?db.config.entry_format,
            "opened sharded log DB"
        );
        Ok(db)
    }

    pub fn name(&self) -> &'static str {
        self.shards.first().map_or("none", |db| db.name())
    }

    /// Binary format identifier of the stored entries
    pub fn binary_format(&self) -> u32 {
        self.config.entry_format.binary_format()
    }

    pub fn entry_format(&self) -> EntryFormat {
        self.config.entry_format
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(&self, group_id: u64) -> usize {
        self.partitioner.shard(group_id)
    }

    /// The shard at `index` (for diagnostics)
    pub fn shard(&self, index: usize) -> Option<&Db<S>> {
        self.shards.get(index)
    }

    fn db(&self, group_id: u64) -> &Db<S> {
        &self.shards[self.shard_index(group_id)]
    }

    // =========================================================================
    // Update Protocol
    // =========================================================================

    /// Persist `updates`, one atomic batch per shard involved
    ///
    /// Updates keep their submission order within each shard. Shards are
    /// written in parallel when more than one is involved; the first error is
    /// returned.
    pub fn save_updates(&self, updates: &[Update]) -> Result<()> {
        let mut batches: Vec<Vec<&Update>> = vec![Vec::new(); self.shards.len()];
        for update in updates {
            batches[self.shard_index(update.group_id)].push(update);
        }
        let active: Vec<(usize, Vec<&Update>)> = batches
            .into_iter()
            .enumerate()
            .filter(|(_, batch)| !batch.is_empty())
            .collect();

        match active.as_slice() {
            [] => Ok(()),
            [(index, batch)] => self.shards[*index].save_updates(batch),
            _ => self.fan_out(&active),
        }
    }

    fn fan_out(&self, active: &[(usize, Vec<&Update>)]) -> Result<()> {
        let results = crossbeam::scope(|scope| {
            let handles: Vec<_> = active
                .iter()
                .map(|(index, batch)| {
                    let db = &self.shards[*index];
                    scope.spawn(move |_| db.save_updates(batch))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>()
        });

        // a panicking shard is an invariant violation; keep unwinding
        let results = results.unwrap_or_else(|payload| std::panic::resume_unwind(payload));
        for result in results {
            result.unwrap_or_else(|payload| std::panic::resume_unwind(payload))?;
        }
        Ok(())
    }

    pub fn save_snapshots(&self, updates: &[Update]) -> Result<()> {
        let mut batches: Vec<Vec<&Update>> = vec![Vec::new(); self.shards.len()];
        for update in updates {
            batches[self.shard_index(update.group_id)].push(update);
        }
        for (index, batch) in batches.iter().enumerate() {
            if !batch.is_empty() {
                self.shards[index].save_snapshots(batch)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Per-Replica Operations
    // =========================================================================

    pub fn read_raft_state(
        &self,
        group_id: u64,
        member_id: u64,
        snapshot_index: u64,
    ) -> Result<RaftState> {
        self.db(group_id)
            .read_raft_state(group_id, member_id, snapshot_index)
    }

    pub fn iterate_entries(
        &self,
        group_id: u64,
        member_id: u64,
        low: u64,
        high: u64,
        max_size: u64,
    ) -> Result<(Vec<Entry>, u64)> {
        self.db(group_id)
            .iterate_entries(group_id, member_id, low, high, max_size)
    }

    pub fn remove_entries_to(&self, group_id: u64, member_id: u64, index: u64) -> Result<()> {
        self.db(group_id)
            .remove_entries_to(group_id, member_id, index)
    }

    pub fn compact(&self, group_id: u64, member_id: u64, index: u64) -> Result<()> {
        self.db(group_id).compact(group_id, member_id, index)
    }

    pub fn get_snapshot(&self, group_id: u64, member_id: u64) -> Result<Snapshot> {
        self.db(group_id).get_snapshot(group_id, member_id)
    }

    pub fn import_snapshot(&self, snapshot: &Snapshot, member_id: u64) -> Result<()> {
        self.db(snapshot.group_id)
            .import_snapshot(snapshot, member_id)
    }

    pub fn save_bootstrap_info(
        &self,
        group_id: u64,
        member_id: u64,
        bootstrap: &Bootstrap,
    ) -> Result<()> {
        self.db(group_id)
            .save_bootstrap_info(group_id, member_id, bootstrap)
    }

    pub fn get_bootstrap_info(&self, group_id: u64, member_id: u64) -> Result<Bootstrap> {
        self.db(group_id).get_bootstrap_info(group_id, member_id)
    }

    /// Bootstrap records of every replica on every shard
    ///
    /// Any failing shard fails the whole listing.
    pub fn list_all_bootstrap_info(&self) -> Result<Vec<(ReplicaId, Bootstrap)>> {
        let mut all = Vec::new();
        for db in &self.shards {
            all.extend(db.list_bootstrap_info()?);
        }
        Ok(all)
    }

    pub fn remove_node_data(&self, group_id: u64, member_id: u64) -> Result<()> {
        self.db(group_id).remove_node_data(group_id, member_id)
    }

    /// Flush every shard. Every shard is attempted; the first error is
    /// returned.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for (index, db) in self.shards.iter().enumerate() {
            if let Err(e) = db.close() {
                tracing::warn!(shard = index, error = %e, "failed to close shard");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::info!(shards = self.shards.len(), "closed sharded log DB");
                Ok(())
            }
        }
    }
}

/// Directory of each shard for the given base directories
pub fn check_dirs(shards: u64, dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let shards = shards as usize;
    match dirs.len() {
        1 => Ok((0..shards).map(|i| shard_dir(&dirs[0], i)).collect()),
        n if n == shards => Ok(dirs
            .iter()
            .enumerate()
            .map(|(i, dir)| shard_dir(dir, i))
            .collect()),
        n => Err(ShardLogError::Config(format!(
            "{} directories supplied for {} shards, expected 1 or {}",
            n, shards, shards
        ))),
    }
}

/// Like [`check_dirs`], but every shard directory must already exist
pub fn check_existing_dirs(shards: u64, dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let shard_dirs = check_dirs(shards, dirs)?;
    if let Some(missing) = shard_dirs.iter().find(|dir| !dir.is_dir()) {
        return Err(ShardLogError::Config(format!(
            "no shard data at {}",
            missing.display()
        )));
    }
    Ok(shard_dirs)
}

fn shard_dir(base: &Path, index: usize) -> PathBuf {
    base.join(format!("shard-{}", index))
}

/// The one entry format shared by every shard
///
/// Shards that already hold entries must agree; an instance without entries
/// uses `configured`.
fn resolve_format<S: KvStore>(configured: EntryFormat, stores: &[S]) -> Result<EntryFormat> {
    let mut resolved: Option<EntryFormat> = None;
    for (index, store) in stores.iter().enumerate() {
        let Some(detected) = entries::detect_format(store)? else {
            continue;
        };
        match resolved {
            Some(format) if format != detected => {
                return Err(ShardLogError::UnsupportedFormat(format!(
                    "shard {} uses {:?} entries, earlier shards use {:?}",
                    index, detected, format
                )));
            }
            _ => resolved = Some(detected),
        }
    }

    match resolved {
        Some(format) => {
            if format != configured {
                tracing::info!(
                    detected = ?format,
                    configured = ?configured,
                    "existing entries keep their format, configured format ignored"
                );
            }
            Ok(format)
        }
        None => Ok(configured),
    }
}
