//! Fjall-backed store
//!
//! Each shard owns one fjall keyspace in its own directory, holding a single
//! partition with every record kind. fjall gives us atomic cross-key batches,
//! ordered range iteration and background LSM compaction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::config::{BusyCallback, Config, SyncMode};
use crate::error::Result;

use super::{is_valid_range, BatchItem, KvStore, WriteBatch};

/// Name of the partition holding all log DB records
const PARTITION_NAME: &str = "logdb";

/// Keys deleted per batch during bulk removal
const REMOVE_CHUNK_ITEMS: usize = 10_000;

/// Ordered KV store on top of a fjall keyspace
pub struct FjallStore {
    dir: PathBuf,
    keyspace: Keyspace,
    partition: PartitionHandle,
    sync_mode: SyncMode,

    /// Invoked on every busy/idle transition
    busy_callback: Option<BusyCallback>,

    /// Write buffer size at which the store reports itself busy
    busy_threshold: u64,

    busy: AtomicBool,
}

impl FjallStore {
    /// Open or create a store in `dir`
    pub fn open(dir: &Path, config: &Config) -> Result<Self> {
        let write_buffer_limit = config
            .kv_write_buffer_size
            .saturating_mul(config.kv_max_write_buffer_number);

        let mut fjall_cfg = fjall::Config::new(dir)
            .max_write_buffer_size(write_buffer_limit)
            .max_journaling_size(config.kv_max_journaling_size)
            .flush_workers(config.kv_flush_workers)
            .compaction_workers(config.kv_compaction_workers);
        if config.kv_lru_cache_size > 0 {
            fjall_cfg = fjall_cfg.cache_size(config.kv_lru_cache_size);
        }
        if let SyncMode::Periodic { interval_ms } = config.sync_mode {
            fjall_cfg = fjall_cfg.fsync_ms(Some(interval_ms));
        }

        let keyspace = fjall_cfg.open()?;

        let memtable_size = u32::try_from(config.kv_write_buffer_size).unwrap_or(u32::MAX);
        let partition = keyspace.open_partition(
            PARTITION_NAME,
            PartitionCreateOptions::default()
                .block_size(config.kv_block_size)
                .max_memtable_size(memtable_size),
        )?;

        tracing::debug!(
            dir = %dir.display(),
            write_buffer_limit,
            "opened fjall keyspace"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            keyspace,
            partition,
            sync_mode: config.sync_mode,
            busy_callback: config.busy_callback.clone(),
            busy_threshold: write_buffer_limit,
            busy: AtomicBool::new(false),
        })
    }

    fn persist(&self) -> Result<()> {
        if self.sync_mode == SyncMode::EveryCommit {
            self.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }

    /// Report write pressure transitions to the busy callback
    fn check_busy(&self) {
        let Some(callback) = &self.busy_callback else {
            return;
        };

        let busy = self.keyspace.write_buffer_size() >= self.busy_threshold;
        if self.busy.swap(busy, Ordering::Relaxed) != busy {
            if busy {
                tracing::warn!(dir = %self.dir.display(), "log DB shard is busy");
            } else {
                tracing::info!(dir = %self.dir.display(), "log DB shard is no longer busy");
            }
            callback.call(busy);
        }
    }

    fn drive<I, F>(iter: I, mut op: F) -> Result<()>
    where
        I: Iterator<Item = fjall::Result<fjall::KvPair>>,
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        for item in iter {
            let (key, value) = item?;
            if !op(&key, &value)? {
                break;
            }
        }
        Ok(())
    }
}

impl KvStore for FjallStore {
    fn name(&self) -> &'static str {
        "fjall"
    }

    fn get_value<T, F>(&self, key: &[u8], op: F) -> Result<Option<T>>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        match self.partition.get(key)? {
            Some(value) => op(&value).map(Some),
            None => Ok(None),
        }
    }

    fn iterate_value<F>(&self, first: &[u8], last: &[u8], inclusive: bool, op: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        if !is_valid_range(first, last, inclusive) {
            return Ok(());
        }

        if inclusive {
            Self::drive(self.partition.range(first..=last), op)
        } else {
            Self::drive(self.partition.range(first..last), op)
        }
    }

    fn commit_write_batch(&self, wb: &WriteBatch) -> Result<()> {
        if wb.is_empty() {
            return Ok(());
        }

        // A fjall batch shares one sequence number, so only the last
        // mutation per key may be handed to it.
        let mut latest: BTreeMap<&[u8], Option<&[u8]>> = BTreeMap::new();
        for item in wb.iter() {
            match item {
                BatchItem::Put(key, value) => latest.insert(key, Some(value)),
                BatchItem::Delete(key) => latest.insert(key, None),
            };
        }

        let mut batch = self.keyspace.batch();
        for (key, value) in latest {
            match value {
                Some(value) => batch.insert(&self.partition, key, value),
                None => batch.remove(&self.partition, key),
            }
        }
        batch.commit()?;
        self.persist()?;

        self.check_busy();
        Ok(())
    }

    fn bulk_remove_entries(&self, first: &[u8], last: &[u8]) -> Result<()> {
        if !is_valid_range(first, last, false) {
            return Ok(());
        }

        // Collect first so the range iterator never observes our own deletes
        let mut doomed = Vec::new();
        for item in self.partition.range(first..last) {
            let (key, _) = item?;
            doomed.push(key);
        }
        if doomed.is_empty() {
            return Ok(());
        }

        let removed = doomed.len();
        for chunk in doomed.chunks(REMOVE_CHUNK_ITEMS) {
            let mut batch = self.keyspace.batch();
            for key in chunk {
                batch.remove(&self.partition, key.clone());
            }
            batch.commit()?;
        }
        self.persist()?;

        tracing::debug!(dir = %self.dir.display(), removed, "bulk removed keys");
        Ok(())
    }

    fn compact_entries(&self, first: &[u8], last: &[u8]) -> Result<()> {
        // fjall has no ranged compaction; tombstones in this range are
        // reclaimed by its background compaction workers.
        tracing::debug!(
            dir = %self.dir.display(),
            first = ?first,
            last = ?last,
            "compaction hint left to background workers"
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
