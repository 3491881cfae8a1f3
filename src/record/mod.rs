//! Record Module
//!
//! Value types persisted for each replica and exchanged with the consensus
//! engine.
//!
//! ## Responsibilities
//! - Replica identity and its log-friendly display form
//! - Persistent state, log entries, snapshots and bootstrap records
//! - The per-replica `Update` submitted on the commit path
//!
//! Values are written through [`codec`], which frames the bincode payload
//! with a CRC32 so damaged bytes surface as `CorruptRecord`.

pub mod codec;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one replica's log: (group, member)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId {
    pub group_id: u64,
    pub member_id: u64,
}

impl ReplicaId {
    pub fn new(group_id: u64, member_id: u64) -> Self {
        Self {
            group_id,
            member_id,
        }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MOD: u64 = 100_000;
        write!(
            f,
            "[{:05}:{:05}]",
            self.group_id % MOD,
            self.member_id % MOD
        )
    }
}

// =============================================================================
// Persistent State
// =============================================================================

/// Term, vote and commit index of a replica
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl State {
    pub fn is_empty(&self) -> bool {
        *self == State::default()
    }
}

// =============================================================================
// Log Entries
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    #[default]
    Application,
    ConfigChange,
    Encoded,
    Metadata,
}

/// One log record at a specific index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub entry_type: EntryType,
    pub key: u64,
    pub client_id: u64,
    pub series_id: u64,
    pub responded_to: u64,
    pub cmd: Vec<u8>,
}

impl Entry {
    /// Fixed fields plus the command length prefix
    const FIXED_SIZE: u64 = 7 * 8 + 4 + 8;

    /// Upper bound of the entry's in-memory footprint, used for size-limited
    /// reads.
    pub fn size_upper_limit(&self) -> u64 {
        Self::FIXED_SIZE + self.cmd.len() as u64
    }
}

/// A run of consecutive entries stored under one key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBatch {
    pub entries: Vec<Entry>,
}

impl EntryBatch {
    pub fn first_index(&self) -> Option<u64> {
        self.entries.first().map(|e| e.index)
    }

    /// Upper index derived from the first index and the entry count
    pub fn last_index(&self) -> Option<u64> {
        self.first_index()
            .map(|first| first + self.entries.len() as u64 - 1)
    }
}

// =============================================================================
// Snapshots and Bootstrap
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateMachineType {
    #[default]
    Unknown,
    Regular,
    Concurrent,
    OnDisk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub config_change_id: u64,
    pub addresses: BTreeMap<u64, String>,
    pub removed: BTreeSet<u64>,
}

/// Snapshot metadata. The snapshot payload itself lives outside the log DB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub group_id: u64,
    pub index: u64,
    pub term: u64,
    pub filepath: String,
    pub file_size: u64,
    pub membership: Membership,
    pub state_machine_type: StateMachineType,
    pub on_disk_index: u64,
    pub imported: bool,
    pub witness: bool,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.index == 0
    }
}

/// One-time record describing how a replica was started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub join: bool,
    pub addresses: BTreeMap<u64, String>,
    pub state_machine_type: StateMachineType,
}

// =============================================================================
// Update Protocol Types
// =============================================================================

/// Everything the consensus engine wants made durable for one replica
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub group_id: u64,
    pub member_id: u64,
    pub state: State,
    pub entries_to_save: Vec<Entry>,
    pub snapshot: Snapshot,
}

impl Update {
    pub fn replica(&self) -> ReplicaId {
        ReplicaId::new(self.group_id, self.member_id)
    }
}

/// Persistent state plus the available span of entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaftState {
    pub state: State,
    pub first_index: u64,
    pub entry_count: u64,
}
