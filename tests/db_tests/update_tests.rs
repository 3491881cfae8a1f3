//! Tests for the update protocol of a single shard
//!
//! These tests verify:
//! - MaxIndex tracking and duplicate suppression
//! - State write suppression
//! - Snapshot acceptance and retention
//! - Cache eviction after a failed commit
//! - Import and removal of replica data

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use shardlog::key::{parse_key, KeyKind};
use shardlog::kv::{KvStore, MemStore, WriteBatch};
use shardlog::{
    Bootstrap, Config, Db, Entry, ReplicaId, Result, ShardLogError, Snapshot, State,
    StateMachineType, Update,
};

// =============================================================================
// Helper Functions
// =============================================================================

/// MemStore that counts commits and can be told to fail them
struct CountingStore {
    inner: MemStore,
    commits: AtomicUsize,
    fail: AtomicBool,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemStore::new(),
            commits: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn snapshot_keys(&self) -> Vec<u64> {
        self.inner
            .keys()
            .iter()
            .filter_map(|k| parse_key(k).ok())
            .filter(|k| k.kind == KeyKind::Snapshot)
            .filter_map(|k| k.index)
            .collect()
    }
}

impl KvStore for CountingStore {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn get_value<T, F>(&self, key: &[u8], op: F) -> Result<Option<T>>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        self.inner.get_value(key, op)
    }

    fn iterate_value<F>(&self, first: &[u8], last: &[u8], inclusive: bool, op: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        self.inner.iterate_value(first, last, inclusive, op)
    }

    fn commit_write_batch(&self, wb: &WriteBatch) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ShardLogError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected commit failure",
            )));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit_write_batch(wb)
    }

    fn bulk_remove_entries(&self, first: &[u8], last: &[u8]) -> Result<()> {
        self.inner.bulk_remove_entries(first, last)
    }

    fn compact_entries(&self, first: &[u8], last: &[u8]) -> Result<()> {
        self.inner.compact_entries(first, last)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

fn setup_db() -> Db<CountingStore> {
    Db::open(CountingStore::new(), &Config::default()).unwrap()
}

fn entries(indices: std::ops::RangeInclusive<u64>, term: u64) -> Vec<Entry> {
    indices
        .map(|index| Entry {
            term,
            index,
            cmd: format!("cmd-{}", index).into_bytes(),
            ..Default::default()
        })
        .collect()
}

fn update(group_id: u64, member_id: u64) -> Update {
    Update {
        group_id,
        member_id,
        ..Default::default()
    }
}

fn snapshot(group_id: u64, index: u64) -> Snapshot {
    Snapshot {
        group_id,
        index,
        term: 1,
        filepath: format!("/snapshots/{}", index),
        state_machine_type: StateMachineType::Regular,
        ..Default::default()
    }
}

fn state(term: u64, commit: u64) -> State {
    State {
        term,
        vote: 1,
        commit,
    }
}

// =============================================================================
// MaxIndex Tests
// =============================================================================

#[test]
fn test_max_index_follows_saved_entries() {
    let db = setup_db();

    let mut ud = update(1, 1);
    ud.entries_to_save = entries(1..=5, 1);
    db.save_updates(&[ud.clone()]).unwrap();
    assert_eq!(db.get_max_index(1, 1).unwrap(), 5);

    ud.entries_to_save = entries(6..=10, 1);
    db.save_updates(&[ud]).unwrap();
    assert_eq!(db.get_max_index(1, 1).unwrap(), 10);
}

#[test]
fn test_max_index_not_found_for_unknown_replica() {
    let db = setup_db();
    let err = db.get_max_index(9, 9).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_entries_below_max_index_are_skipped() {
    let db = setup_db();

    let mut ud = update(1, 1);
    ud.entries_to_save = entries(1..=10, 1);
    db.save_updates(&[ud.clone()]).unwrap();
    let commits = db.store().commits();

    ud.entries_to_save = entries(3..=5, 2);
    db.save_updates(&[ud]).unwrap();
    assert_eq!(db.store().commits(), commits);
    assert_eq!(db.get_max_index(1, 1).unwrap(), 10);

    let (got, _) = db.iterate_entries(1, 1, 3, 6, u64::MAX).unwrap();
    assert!(got.iter().all(|e| e.term == 1));
}

#[test]
fn test_rejected_snapshot_leaves_max_index() {
    let db = setup_db();

    let mut ud = update(1, 1);
    ud.snapshot = snapshot(1, 5);
    ud.entries_to_save = entries(1..=10, 1);
    db.save_updates(&[ud]).unwrap();
    assert_eq!(db.get_max_index(1, 1).unwrap(), 10);

    for stale in [5, 3] {
        let mut ud = update(1, 1);
        ud.snapshot = snapshot(1, stale);
        db.save_updates(&[ud]).unwrap();
        assert_eq!(db.get_max_index(1, 1).unwrap(), 10);
    }
    assert_eq!(db.get_snapshot(1, 1).unwrap().index, 5);
}

#[test]
fn test_snapshot_advances_max_index() {
    let db = setup_db();

    let mut ud = update(1, 1);
    ud.snapshot = snapshot(1, 20);
    db.save_updates(&[ud]).unwrap();
    assert_eq!(db.get_max_index(1, 1).unwrap(), 20);
}

// =============================================================================
// State Tests
// =============================================================================

#[test]
fn test_unchanged_state_persisted_once() {
    let db = setup_db();

    let mut ud = update(1, 1);
    ud.state = state(2, 7);
    db.save_updates(&[ud.clone()]).unwrap();
    db.save_updates(&[ud.clone()]).unwrap();
    assert_eq!(db.store().commits(), 1);

    ud.state = state(2, 8);
    db.save_updates(&[ud]).unwrap();
    assert_eq!(db.store().commits(), 2);
    assert_eq!(db.get_state(1, 1).unwrap(), state(2, 8));
}

#[test]
fn test_empty_updates_commit_nothing() {
    let db = setup_db();
    db.save_updates(&[update(1, 1), update(2, 1)]).unwrap();
    db.save_updates::<Update>(&[]).unwrap();
    assert_eq!(db.store().commits(), 0);
    assert!(db.get_state(1, 1).unwrap_err().is_not_found());
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_only_latest_snapshot_retained() {
    let db = setup_db();

    for index in [3, 7] {
        let mut ud = update(1, 1);
        ud.snapshot = snapshot(1, index);
        db.save_updates(&[ud]).unwrap();
    }

    assert_eq!(db.store().snapshot_keys(), vec![7]);
    assert_eq!(db.get_snapshot(1, 1).unwrap().index, 7);
}

#[test]
fn test_snapshots_in_one_batch_keep_latest() {
    let db = setup_db();

    let mut first = update(1, 1);
    first.snapshot = snapshot(1, 3);
    let mut second = update(1, 1);
    second.snapshot = snapshot(1, 7);
    db.save_updates(&[first, second]).unwrap();

    assert_eq!(db.store().snapshot_keys(), vec![7]);
}

#[test]
fn test_cold_cache_rejects_stale_snapshot() {
    let db = setup_db();

    let mut ud = update(1, 1);
    ud.snapshot = snapshot(1, 7);
    db.save_updates(&[ud]).unwrap();

    // a fresh cache only knows what storage holds
    db.cache().remove(ReplicaId::new(1, 1));
    let commits = db.store().commits();

    let mut stale = update(1, 1);
    stale.snapshot = snapshot(1, 3);
    db.save_updates(&[stale]).unwrap();

    assert_eq!(db.store().commits(), commits);
    assert_eq!(db.store().snapshot_keys(), vec![7]);
    assert_eq!(db.get_max_index(1, 1).unwrap(), 7);
}

#[test]
fn test_save_snapshots_writes_snapshot_only() {
    let db = setup_db();

    let mut ud = update(1, 1);
    ud.state = state(1, 1);
    ud.snapshot = snapshot(1, 4);
    db.save_snapshots(&[ud.clone()]).unwrap();

    assert_eq!(db.get_snapshot(1, 1).unwrap(), ud.snapshot);
    assert!(db.get_state(1, 1).unwrap_err().is_not_found());

    // already accepted
    db.save_snapshots(&[ud]).unwrap();
    assert_eq!(db.store().commits(), 1);
}

#[test]
fn test_missing_snapshot_is_not_found() {
    let db = setup_db();
    let err = db.get_snapshot(1, 1).unwrap_err();
    assert!(matches!(
        err,
        ShardLogError::NotFound {
            what: "snapshot",
            ..
        }
    ));
}

#[test]
#[should_panic(expected = "invariant violation")]
fn test_snapshot_beyond_entries_is_fatal() {
    let db = setup_db();

    let mut ud = update(1, 1);
    ud.snapshot = snapshot(1, 20);
    ud.entries_to_save = entries(1..=10, 1);
    let _ = db.save_updates(&[ud]);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_failed_commit_evicts_cache() {
    let db = setup_db();

    let mut ud = update(1, 1);
    ud.state = state(3, 9);
    ud.snapshot = snapshot(1, 4);
    ud.entries_to_save = entries(4..=6, 3);

    db.store().set_fail(true);
    let err = db.save_updates(&[ud.clone()]).unwrap_err();
    assert!(err.is_storage_io());
    assert_eq!(db.cache().get_max_index(ReplicaId::new(1, 1)), None);
    assert_eq!(db.cache().snapshot_index(ReplicaId::new(1, 1)), 0);

    // the retry is not mistaken for a duplicate
    db.store().set_fail(false);
    db.save_updates(&[ud]).unwrap();
    assert_eq!(db.get_state(1, 1).unwrap(), state(3, 9));
    assert_eq!(db.get_snapshot(1, 1).unwrap().index, 4);
    assert_eq!(db.get_max_index(1, 1).unwrap(), 6);
}

// =============================================================================
// Import and Removal Tests
// =============================================================================

#[test]
fn test_import_snapshot_replaces_replica() {
    let db = setup_db();

    let mut ud = update(1, 2);
    ud.state = state(1, 10);
    ud.snapshot = snapshot(1, 60);
    ud.entries_to_save = entries(60..=70, 1);
    db.save_updates(&[ud]).unwrap();

    let mut imported = snapshot(1, 50);
    imported.term = 4;
    imported.imported = true;
    db.import_snapshot(&imported, 2).unwrap();

    let bootstrap = db.get_bootstrap_info(1, 2).unwrap();
    assert!(bootstrap.join);
    assert_eq!(bootstrap.state_machine_type, StateMachineType::Regular);

    let rs = db.read_raft_state(1, 2, 50).unwrap();
    assert_eq!(
        rs.state,
        State {
            term: 4,
            vote: 0,
            commit: 50
        }
    );
    assert_eq!((rs.first_index, rs.entry_count), (50, 0));
    assert_eq!(db.store().snapshot_keys(), vec![50]);
    assert_eq!(db.get_snapshot(1, 2).unwrap(), imported);
}

#[test]
#[should_panic(expected = "invariant violation")]
fn test_import_unknown_state_machine_is_fatal() {
    let db = setup_db();
    let mut ss = snapshot(1, 5);
    ss.state_machine_type = StateMachineType::Unknown;
    let _ = db.import_snapshot(&ss, 1);
}

#[test]
fn test_remove_node_data_leaves_nothing() {
    let db = setup_db();

    db.save_bootstrap_info(1, 1, &Bootstrap::default()).unwrap();
    let mut ud = update(1, 1);
    ud.state = state(1, 5);
    ud.snapshot = snapshot(1, 2);
    ud.entries_to_save = entries(2..=10, 1);
    db.save_updates(&[ud]).unwrap();

    db.remove_node_data(1, 1).unwrap();

    assert!(db.get_state(1, 1).unwrap_err().is_not_found());
    assert!(db.get_bootstrap_info(1, 1).unwrap_err().is_not_found());
    assert!(db.get_snapshot(1, 1).unwrap_err().is_not_found());
    assert!(db.get_max_index(1, 1).unwrap_err().is_not_found());
    let (got, size) = db.iterate_entries(1, 1, 0, 100, u64::MAX).unwrap();
    assert!(got.is_empty());
    assert_eq!(size, 0);
    assert!(db.store().inner.is_empty());
}

#[test]
fn test_remove_node_data_keeps_other_replicas() {
    let db = setup_db();

    for member in [1, 2] {
        let mut ud = update(1, member);
        ud.state = state(1, 5);
        ud.entries_to_save = entries(1..=5, 1);
        db.save_updates(&[ud]).unwrap();
    }
    db.remove_node_data(1, 1).unwrap();

    assert_eq!(db.get_state(1, 2).unwrap(), state(1, 5));
    let (got, _) = db.iterate_entries(1, 2, 1, 6, u64::MAX).unwrap();
    assert_eq!(got.len(), 5);
}

#[test]
fn test_bootstrap_listing() {
    let db = setup_db();
    let bootstrap = Bootstrap {
        join: false,
        addresses: [(1, "a:1".to_string()), (2, "b:1".to_string())].into(),
        state_machine_type: StateMachineType::OnDisk,
    };
    db.save_bootstrap_info(5, 1, &bootstrap).unwrap();
    db.save_bootstrap_info(3, 2, &bootstrap).unwrap();

    let listed = db.list_bootstrap_info().unwrap();
    let ids: Vec<ReplicaId> = listed.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![ReplicaId::new(3, 2), ReplicaId::new(5, 1)]);
    assert_eq!(listed[0].1, bootstrap);
}
