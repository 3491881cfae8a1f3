//! Plain layout: one record per entry, keyed by the entry's own index

use std::sync::Arc;

use crate::cache::ReplicaCache;
use crate::context::Context;
use crate::error::Result;
use crate::key::{entry_key, parse_key};
use crate::kv::KvStore;
use crate::record::{codec, Entry};

use super::EntryCollector;

pub struct PlainEntries<S> {
    pub(super) store: Arc<S>,
    pub(super) cache: Arc<ReplicaCache>,
}

impl<S: KvStore> PlainEntries<S> {
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
        for entry in entries {
            ctx.key().set_entry_key(group_id, member_id, entry.index);
            ctx.put_record(entry)?;
        }
        Ok(())
    }

    pub(super) fn iterate(
        &self,
        group_id: u64,
        member_id: u64,
        low: u64,
        upper: u64,
        collector: &mut EntryCollector,
    ) -> Result<()> {
        let first = entry_key(group_id, member_id, low);
        let last = entry_key(group_id, member_id, upper);
        self.store
            .iterate_value(first.as_bytes(), last.as_bytes(), false, |_, value| {
                let entry: Entry = codec::decode_record(value)?;
                Ok(collector.push(entry))
            })
    }

    pub(super) fn first_index(
        &self,
        group_id: u64,
        member_id: u64,
        snapshot_index: u64,
        max_index: u64,
    ) -> Result<Option<u64>> {
        let first = entry_key(group_id, member_id, snapshot_index);
        let last = entry_key(group_id, member_id, max_index);

        let mut found = None;
        self.store
            .iterate_value(first.as_bytes(), last.as_bytes(), true, |key, _| {
                found = parse_key(key)?.index;
                Ok(false)
            })?;
        Ok(found)
    }

    pub(super) fn ranged_op<F>(&self, group_id: u64, member_id: u64, index: u64, op: F) -> Result<()>
    where
        F: FnOnce(&[u8], &[u8]) -> Result<()>,
    {
        let first = entry_key(group_id, member_id, 0);
        let last = entry_key(group_id, member_id, index.saturating_add(1));
        op(first.as_bytes(), last.as_bytes())
    }
}
