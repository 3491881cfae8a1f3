//! # shardlog
//!
//! Durable log storage for a replicated consensus runtime:
//! - Per-replica state (term, vote, commit), log entries, snapshots and
//!   bootstrap records in one sorted key space
//! - Write-side replica cache suppressing redundant and stale writes
//! - Plain or batched entry layout, fixed per storage instance
//! - Replica groups sharded across independent storage instances
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Consensus Engine                          │
//! │          (save_updates / reads / compaction)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     ShardedDb                                │
//! │               (group_id % shards)                            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  one per shard
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │     Db      │   ...    │     Db      │
//!   │ cache, pool │          │ cache, pool │
//!   │ entry mgr   │          │ entry mgr   │
//!   └──────┬──────┘          └──────┬──────┘
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   KvStore   │          │   KvStore   │
//!   │   (fjall)   │          │   (fjall)   │
//!   └─────────────┘          └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod fs;

pub mod record;
pub mod key;
pub mod kv;
pub mod context;
pub mod cache;
pub mod entries;
pub mod db;
pub mod sharded;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, ShardLogError};
pub use config::{Config, ConfigBuilder, SyncMode};
pub use db::Db;
pub use entries::EntryFormat;
pub use kv::{FjallStore, KvStore, MemStore};
pub use record::{
    Bootstrap, Entry, EntryType, Membership, RaftState, ReplicaId, Snapshot, State,
    StateMachineType, Update,
};
pub use sharded::{Partitioner, ShardedDb};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of shardlog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
