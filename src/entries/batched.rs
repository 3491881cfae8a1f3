//! Batched layout: runs of entries grouped into fixed slots
//!
//! ```text
//! slot start = index - index % ENTRY_BATCH_SIZE
//!
//!   slot 0        slot 64       slot 128
//! ┌─────────────┬─────────────┬─────────────┐
//! │ 1 ..... 63  │ 64 .... 127 │ 128 ... 150 │
//! └─────────────┴─────────────┴─────────────┘
//! ```
//!
//! A slot record holds a contiguous run; its upper index is derived from the
//! first index and the entry count. Appending into a slot merges with the
//! record already staged or stored for it.

use std::sync::Arc;

use crate::cache::ReplicaCache;
use crate::context::Context;
use crate::error::Result;
use crate::key::Key;
use crate::kv::{KvStore, WriteBatch};
use crate::record::{codec, Entry, EntryBatch, ReplicaId};

use super::{EntryCollector, ENTRY_BATCH_SIZE};

pub struct BatchedEntries<S> {
    pub(super) store: Arc<S>,
    pub(super) cache: Arc<ReplicaCache>,
}

/// First index of the slot holding `index`
pub fn slot_start(index: u64) -> u64 {
    index - index % ENTRY_BATCH_SIZE
}

fn batch_key(group_id: u64, member_id: u64, slot: u64) -> Key {
    let mut key = Key::new();
    key.set_entry_batch_key(group_id, member_id, slot);
    key
}

impl<S: KvStore> BatchedEntries<S> {
    pub fn new(store: Arc<S>, cache: Arc<ReplicaCache>) -> Self {
        Self { store, cache }
    }

    pub(super) fn record(
        &self,
        ctx: &mut Context<'_>,
        group_id: u64,
        member_id: u64,
        entries: &[Entry],
    ) -> Result<()> {
        let mut rest = entries;
        while let Some(head) = rest.first() {
            let slot = slot_start(head.index);
            let len = rest
                .iter()
                .take_while(|e| slot_start(e.index) == slot)
                .count();
            let (run, tail) = rest.split_at(len);

            ctx.key().set_entry_batch_key(group_id, member_id, slot);
            let batch = self.merge(ctx, run)?;
            ctx.put_record(&batch)?;
            rest = tail;
        }
        Ok(())
    }

    /// Combine `run` with the record for the slot the context's key points
    /// at. Earlier entries survive only when the run continues them.
    fn merge(&self, ctx: &mut Context<'_>, run: &[Entry]) -> Result<EntryBatch> {
        let existing = match ctx.staged_value() {
            Some(Some(value)) => Some(codec::decode_record::<EntryBatch>(value)?),
            Some(None) => None,
            None => self
                .store
                .get_value(ctx.key().as_bytes(), codec::decode_record::<EntryBatch>)?,
        };

        let first = run[0].index;
        let mut entries = match existing {
            Some(batch) => {
                let kept: Vec<Entry> = batch
                    .entries
                    .into_iter()
                    .take_while(|e| e.index < first)
                    .collect();
                match kept.last() {
                    Some(prev) if prev.index + 1 == first => kept,
                    _ => Vec::with_capacity(run.len()),
                }
            }
            None => Vec::with_capacity(run.len()),
        };
        entries.extend_from_slice(run);
        Ok(EntryBatch { entries })
    }

    pub(super) fn iterate(
        &self,
        group_id: u64,
        member_id: u64,
        low: u64,
        upper: u64,
        collector: &mut EntryCollector,
    ) -> Result<()> {
        let first = batch_key(group_id, member_id, slot_start(low));
        let last = batch_key(group_id, member_id, slot_start(upper - 1));
        self.store
            .iterate_value(first.as_bytes(), last.as_bytes(), true, |_, value| {
                let batch: EntryBatch = codec::decode_record(value)?;
                for entry in batch.entries {
                    if entry.index < low {
                        continue;
                    }
                    if entry.index >= upper || !collector.push(entry) {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
    }

    pub(super) fn first_index(
        &self,
        group_id: u64,
        member_id: u64,
        snapshot_index: u64,
        max_index: u64,
    ) -> Result<Option<u64>> {
        let first = batch_key(group_id, member_id, slot_start(snapshot_index));
        let last = batch_key(group_id, member_id, slot_start(max_index));

        let mut found = None;
        self.store
            .iterate_value(first.as_bytes(), last.as_bytes(), true, |_, value| {
                let batch: EntryBatch = codec::decode_record(value)?;
                found = batch
                    .entries
                    .iter()
                    .map(|e| e.index)
                    .find(|&index| index >= snapshot_index && index <= max_index);
                Ok(found.is_none())
            })?;
        Ok(found)
    }

    pub(super) fn ranged_op<F>(&self, group_id: u64, member_id: u64, index: u64, op: F) -> Result<()>
    where
        F: FnOnce(&[u8], &[u8]) -> Result<()>,
    {
        let slot = slot_start(index);
        let end = if index % ENTRY_BATCH_SIZE == ENTRY_BATCH_SIZE - 1 {
            // the whole slot is covered; slot starts never reach u64::MAX
            slot.saturating_add(ENTRY_BATCH_SIZE)
        } else {
            self.split_slot(group_id, member_id, slot, index)?;
            slot
        };

        let first = batch_key(group_id, member_id, 0);
        let last = batch_key(group_id, member_id, end);
        op(first.as_bytes(), last.as_bytes())
    }

    /// Rewrite the slot straddling `index` with only the entries above it
    fn split_slot(&self, group_id: u64, member_id: u64, slot: u64, index: u64) -> Result<()> {
        let key = batch_key(group_id, member_id, slot);
        let Some(batch) = self
            .store
            .get_value(key.as_bytes(), codec::decode_record::<EntryBatch>)?
        else {
            return Ok(());
        };

        let (Some(first), Some(last)) = (batch.first_index(), batch.last_index()) else {
            return Ok(());
        };
        if first > index {
            return Ok(());
        }

        let mut wb = WriteBatch::new();
        if last <= index {
            wb.delete(key.as_bytes());
        } else {
            let kept: Vec<Entry> = batch
                .entries
                .into_iter()
                .filter(|e| e.index > index)
                .collect();
            let value = codec::encode_record(&EntryBatch { entries: kept })?;
            wb.put(key.as_bytes(), &value);
        }
        self.store.commit_write_batch(&wb)?;

        tracing::debug!(
            replica = %ReplicaId::new(group_id, member_id),
            slot,
            index,
            "split entry batch at compaction point"
        );
        Ok(())
    }
}
