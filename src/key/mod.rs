//! Key Module
//!
//! Maps (record kind, replica identity, optional index) to fixed-layout,
//! sortable byte keys and back.
//!
//! ## Key Format
//! ```text
//! ┌──────────┬──────────────┬───────────┬────────────┬─────────────┐
//! │ Tag (2)  │ Reserved (2) │ Group (8) │ Member (8) │ Index (8)?  │
//! └──────────┴──────────────┴───────────┴────────────┴─────────────┘
//! ```
//! Integers are big-endian so byte order equals numeric order. All records of
//! one kind for one replica form a single contiguous range, and all entries
//! between two indices form a single range scan.

pub mod pool;

use bytes::{Buf, BufMut};

use crate::error::{Result, ShardLogError};

pub use pool::{KeyPool, PooledKey};

/// Size of keys without an index component
pub const FIXED_KEY_SIZE: usize = 20;

/// Size of keys carrying an index component
pub const INDEXED_KEY_SIZE: usize = 28;

/// Largest key produced by the codec
pub const MAX_KEY_SIZE: usize = INDEXED_KEY_SIZE;

/// Record kinds, one key-space partition each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Entry,
    State,
    MaxIndex,
    Bootstrap,
    Snapshot,
    EntryBatch,
}

impl KeyKind {
    /// Leading two bytes of every key of this kind
    pub fn header(self) -> [u8; 2] {
        let tag = match self {
            KeyKind::Entry => 0x01,
            KeyKind::State => 0x02,
            KeyKind::MaxIndex => 0x03,
            KeyKind::Bootstrap => 0x05,
            KeyKind::Snapshot => 0x06,
            KeyKind::EntryBatch => 0x07,
        };
        [tag, tag]
    }

    fn from_header(header: [u8; 2]) -> Option<Self> {
        if header[0] != header[1] {
            return None;
        }
        match header[0] {
            0x01 => Some(KeyKind::Entry),
            0x02 => Some(KeyKind::State),
            0x03 => Some(KeyKind::MaxIndex),
            0x05 => Some(KeyKind::Bootstrap),
            0x06 => Some(KeyKind::Snapshot),
            0x07 => Some(KeyKind::EntryBatch),
            _ => None,
        }
    }

    pub fn has_index(self) -> bool {
        matches!(
            self,
            KeyKind::Entry | KeyKind::Snapshot | KeyKind::EntryBatch
        )
    }

    pub fn key_size(self) -> usize {
        if self.has_index() {
            INDEXED_KEY_SIZE
        } else {
            FIXED_KEY_SIZE
        }
    }
}

/// A reusable key
///
/// Re-targeting keeps the backing allocation, so one `Key` can address any
/// number of records without reallocating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    data: Vec<u8>,
}

impl Key {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(MAX_KEY_SIZE),
        }
    }

    /// Checked form of the typed setters below
    ///
    /// Fails with `InvalidKey` when `index` is given for a kind without an
    /// index component, or missing for a kind that needs one.
    pub fn set(
        &mut self,
        kind: KeyKind,
        group_id: u64,
        member_id: u64,
        index: Option<u64>,
    ) -> Result<()> {
        if kind.has_index() != index.is_some() {
            return Err(ShardLogError::InvalidKey(format!(
                "{:?} key {} an index component",
                kind,
                if kind.has_index() { "requires" } else { "does not take" }
            )));
        }
        self.write(kind, group_id, member_id, index);
        Ok(())
    }

    pub fn set_entry_key(&mut self, group_id: u64, member_id: u64, index: u64) {
        self.write(KeyKind::Entry, group_id, member_id, Some(index));
    }

    pub fn set_entry_batch_key(&mut self, group_id: u64, member_id: u64, slot_start: u64) {
        self.write(KeyKind::EntryBatch, group_id, member_id, Some(slot_start));
    }

    pub fn set_state_key(&mut self, group_id: u64, member_id: u64) {
        self.write(KeyKind::State, group_id, member_id, None);
    }

    pub fn set_max_index_key(&mut self, group_id: u64, member_id: u64) {
        self.write(KeyKind::MaxIndex, group_id, member_id, None);
    }

    pub fn set_bootstrap_key(&mut self, group_id: u64, member_id: u64) {
        self.write(KeyKind::Bootstrap, group_id, member_id, None);
    }

    pub fn set_snapshot_key(&mut self, group_id: u64, member_id: u64, index: u64) {
        self.write(KeyKind::Snapshot, group_id, member_id, Some(index));
    }

    /// Placeholder without a backing allocation
    pub(crate) fn empty() -> Self {
        Self { data: Vec::new() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn write(&mut self, kind: KeyKind, group_id: u64, member_id: u64, index: Option<u64>) {
        self.data.clear();
        self.data.put_slice(&kind.header());
        self.data.put_u16(0);
        self.data.put_u64(group_id);
        self.data.put_u64(member_id);
        if let Some(index) = index {
            self.data.put_u64(index);
        }
    }
}

impl Default for Key {
    fn default() -> Self {
        Self::new()
    }
}

/// Ephemeral key for range bounds and one-off writes
pub fn entry_key(group_id: u64, member_id: u64, index: u64) -> Key {
    let mut key = Key::new();
    key.set_entry_key(group_id, member_id, index);
    key
}

/// Components recovered from a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedKey {
    pub kind: KeyKind,
    pub group_id: u64,
    pub member_id: u64,
    pub index: Option<u64>,
}

/// Decode a key produced by [`Key`]
pub fn parse_key(data: &[u8]) -> Result<ParsedKey> {
    if data.len() < FIXED_KEY_SIZE {
        return Err(ShardLogError::InvalidKey(format!(
            "key too short: {} bytes",
            data.len()
        )));
    }

    let mut buf = data;
    let header = [buf.get_u8(), buf.get_u8()];
    let kind = KeyKind::from_header(header).ok_or_else(|| {
        ShardLogError::InvalidKey(format!("unknown key header {:02x}{:02x}", header[0], header[1]))
    })?;

    if data.len() != kind.key_size() {
        return Err(ShardLogError::InvalidKey(format!(
            "{:?} key must be {} bytes, got {}",
            kind,
            kind.key_size(),
            data.len()
        )));
    }

    let reserved = buf.get_u16();
    if reserved != 0 {
        return Err(ShardLogError::InvalidKey(format!(
            "reserved bytes must be zero, got {:04x}",
            reserved
        )));
    }

    let group_id = buf.get_u64();
    let member_id = buf.get_u64();
    let index = if kind.has_index() {
        Some(buf.get_u64())
    } else {
        None
    };

    Ok(ParsedKey {
        kind,
        group_id,
        member_id,
        index,
    })
}
