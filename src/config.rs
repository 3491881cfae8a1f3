//! Configuration for shardlog
//!
//! Centralized configuration with sensible defaults. Every `kv_*` knob is
//! handed to the embedded engine of each shard, so total memory scales with
//! the shard count (see [`Config::memory_size_mb`]).

use std::fmt;
use std::sync::Arc;

use crate::entries::EntryFormat;
use crate::error::{Result, ShardLogError};

/// Default number of shards
pub const DEFAULT_SHARDS: u64 = 16;

/// Main configuration for a sharded log DB
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Layout
    // -------------------------------------------------------------------------
    /// Number of independent storage instances. Changing it for an existing
    /// deployment requires resharding.
    pub shards: u64,

    /// Entry format for fresh instances. Existing instances keep the format
    /// they were created with.
    pub entry_format: EntryFormat,

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------
    pub sync_mode: SyncMode,

    /// Refuse to open when a data directory has less free space than this
    /// (0 disables the check)
    pub min_free_disk_space: u64,

    // -------------------------------------------------------------------------
    // Embedded Engine Tuning (per shard)
    // -------------------------------------------------------------------------
    /// Size of one memtable (write buffer)
    pub kv_write_buffer_size: u64,

    /// Memtables allowed before writes are considered under pressure
    pub kv_max_write_buffer_number: u64,

    /// Block cache size (0 keeps the engine default)
    pub kv_lru_cache_size: u64,

    pub kv_block_size: u32,

    /// Journal size that forces memtable flushes
    pub kv_max_journaling_size: u64,

    pub kv_flush_workers: usize,

    pub kv_compaction_workers: usize,

    // -------------------------------------------------------------------------
    // Save Buffers
    // -------------------------------------------------------------------------
    /// Initial value buffer size for each write context
    pub save_buffer_size: usize,

    /// Buffers grown beyond this are released instead of pooled
    pub max_save_buffer_size: usize,

    // -------------------------------------------------------------------------
    // Backpressure
    // -------------------------------------------------------------------------
    /// Called with `true` when a shard comes under write pressure and with
    /// `false` once it drains
    pub busy_callback: Option<BusyCallback>,
}

/// How commits are made durable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync after every committed batch (safest, slowest)
    EveryCommit,

    /// fsync from a background timer (bounded loss window)
    Periodic { interval_ms: u16 },
}

/// Write pressure notification hook
#[derive(Clone)]
pub struct BusyCallback(Arc<dyn Fn(bool) + Send + Sync>);

impl BusyCallback {
    pub fn new(f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, busy: bool) {
        (self.0)(busy)
    }
}

impl fmt::Debug for BusyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BusyCallback(..)")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::large_mem()
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Up to 8 GB of memtables across all shards (the default)
    pub fn large_mem() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            entry_format: EntryFormat::Plain,
            sync_mode: SyncMode::EveryCommit,
            min_free_disk_space: 0,
            kv_write_buffer_size: 128 * 1024 * 1024,
            kv_max_write_buffer_number: 4,
            kv_lru_cache_size: 0,
            kv_block_size: 32 * 1024,
            kv_max_journaling_size: 512 * 1024 * 1024,
            kv_flush_workers: 2,
            kv_compaction_workers: 2,
            save_buffer_size: 32 * 1024,
            max_save_buffer_size: 64 * 1024 * 1024,
            busy_callback: None,
        }
    }

    /// Up to 4 GB of memtables across all shards
    pub fn medium_mem() -> Self {
        Self {
            kv_write_buffer_size: 64 * 1024 * 1024,
            ..Self::large_mem()
        }
    }

    /// Up to 1 GB of memtables across all shards
    pub fn small_mem() -> Self {
        Self {
            kv_write_buffer_size: 16 * 1024 * 1024,
            ..Self::large_mem()
        }
    }

    /// Up to 256 MB of memtables across all shards
    pub fn tiny_mem() -> Self {
        Self {
            kv_write_buffer_size: 4 * 1024 * 1024,
            kv_max_journaling_size: 64 * 1024 * 1024,
            ..Self::large_mem()
        }
    }

    /// Estimated upper bound of memtable memory, in MB
    pub fn memory_size_mb(&self) -> u64 {
        let per_shard = self
            .kv_write_buffer_size
            .saturating_mul(self.kv_max_write_buffer_number);
        per_shard.saturating_mul(self.shards) / (1024 * 1024)
    }

    /// Check option consistency
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(ShardLogError::Config("shards must be at least 1".to_string()));
        }
        if self.kv_write_buffer_size == 0 || self.kv_max_write_buffer_number == 0 {
            return Err(ShardLogError::Config(
                "write buffer size and count must be non-zero".to_string(),
            ));
        }
        if self.save_buffer_size > self.max_save_buffer_size {
            return Err(ShardLogError::Config(format!(
                "save buffer size {} exceeds max save buffer size {}",
                self.save_buffer_size, self.max_save_buffer_size
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Start from a preset instead of the default
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Set the number of shards
    pub fn shards(mut self, shards: u64) -> Self {
        self.config.shards = shards;
        self
    }

    /// Set the entry format used by fresh instances
    pub fn entry_format(mut self, format: EntryFormat) -> Self {
        self.config.entry_format = format;
        self
    }

    /// Set the sync mode
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.config.sync_mode = mode;
        self
    }

    /// Set the minimum free disk space required at open
    pub fn min_free_disk_space(mut self, bytes: u64) -> Self {
        self.config.min_free_disk_space = bytes;
        self
    }

    /// Set the per-shard write buffer size (in bytes)
    pub fn kv_write_buffer_size(mut self, bytes: u64) -> Self {
        self.config.kv_write_buffer_size = bytes;
        self
    }

    pub fn kv_max_write_buffer_number(mut self, count: u64) -> Self {
        self.config.kv_max_write_buffer_number = count;
        self
    }

    /// Set the per-shard block cache size (in bytes)
    pub fn kv_lru_cache_size(mut self, bytes: u64) -> Self {
        self.config.kv_lru_cache_size = bytes;
        self
    }

    pub fn kv_block_size(mut self, bytes: u32) -> Self {
        self.config.kv_block_size = bytes;
        self
    }

    pub fn kv_max_journaling_size(mut self, bytes: u64) -> Self {
        self.config.kv_max_journaling_size = bytes;
        self
    }

    pub fn kv_flush_workers(mut self, workers: usize) -> Self {
        self.config.kv_flush_workers = workers;
        self
    }

    pub fn kv_compaction_workers(mut self, workers: usize) -> Self {
        self.config.kv_compaction_workers = workers;
        self
    }

    /// Set the initial and maximum pooled save buffer sizes (in bytes)
    pub fn save_buffer_sizes(mut self, initial: usize, max: usize) -> Self {
        self.config.save_buffer_size = initial;
        self.config.max_save_buffer_size = max;
        self
    }

    /// Install the write pressure callback
    pub fn busy_callback(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.config.busy_callback = Some(BusyCallback::new(f));
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
