//! Tests for ShardedDb
//!
//! These tests verify:
//! - Deterministic routing of groups to shards
//! - Multi-shard update batches
//! - Bootstrap listing across shards
//! - Directory layout, locking and free-space checks
//! - Durability and format detection across restarts

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use shardlog::kv::MemStore;
use shardlog::sharded::check_existing_dirs;
use shardlog::{
    Bootstrap, Config, Entry, EntryFormat, ReplicaId, ShardLogError, ShardedDb, Snapshot, State,
    StateMachineType, Update,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(shards: u64) -> Config {
    Config::builder()
        .shards(shards)
        .kv_write_buffer_size(1024 * 1024)
        .kv_max_journaling_size(16 * 1024 * 1024)
        .build()
}

fn setup_mem_db(shards: u64) -> ShardedDb<MemStore> {
    let stores = (0..shards).map(|_| MemStore::new()).collect();
    ShardedDb::from_stores(test_config(shards), stores).unwrap()
}

fn setup_temp_db(shards: u64) -> (TempDir, ShardedDb) {
    let temp_dir = TempDir::new().unwrap();
    let db = ShardedDb::open(test_config(shards), &[temp_dir.path()]).unwrap();
    (temp_dir, db)
}

fn entries(indices: std::ops::RangeInclusive<u64>) -> Vec<Entry> {
    indices
        .map(|index| Entry {
            term: 2,
            index,
            cmd: index.to_be_bytes().to_vec(),
            ..Default::default()
        })
        .collect()
}

fn update(group_id: u64, member_id: u64, indices: std::ops::RangeInclusive<u64>) -> Update {
    Update {
        group_id,
        member_id,
        state: State {
            term: 2,
            vote: member_id,
            commit: *indices.end(),
        },
        entries_to_save: entries(indices),
        ..Default::default()
    }
}

// =============================================================================
// Routing Tests
// =============================================================================

#[test]
fn test_shard_routing_is_modulo() {
    let db = setup_mem_db(4);
    assert_eq!(db.shard_count(), 4);
    for group in [0, 1, 5, 1_000_003, u64::MAX] {
        assert_eq!(db.shard_index(group), (group % 4) as usize);
    }
}

#[test]
fn test_updates_land_on_their_shard() {
    let db = setup_mem_db(4);
    db.save_updates(&[update(6, 1, 1..=3)]).unwrap();

    for index in 0..4 {
        let shard = db.shard(index).unwrap();
        assert_eq!(shard.store().is_empty(), index != 2, "shard {}", index);
    }
}

#[test]
fn test_multi_shard_batch() {
    let db = setup_mem_db(4);
    let updates: Vec<Update> = (0..8).map(|group| update(group, 1, 1..=5)).collect();
    db.save_updates(&updates).unwrap();

    for group in 0..8 {
        let rs = db.read_raft_state(group, 1, 0).unwrap();
        assert_eq!((rs.first_index, rs.entry_count), (1, 5));
        let (got, _) = db.iterate_entries(group, 1, 1, 6, u64::MAX).unwrap();
        assert_eq!(got, entries(1..=5));
    }
}

#[test]
#[should_panic(expected = "invariant violation")]
fn test_multi_shard_invariant_violation_propagates() {
    let db = setup_mem_db(2);
    let mut bad = update(1, 1, 1..=3);
    bad.snapshot = Snapshot {
        group_id: 1,
        index: 9,
        state_machine_type: StateMachineType::Regular,
        ..Default::default()
    };
    let _ = db.save_updates(&[update(0, 1, 1..=3), bad]);
}

#[test]
fn test_concurrent_writers_on_different_groups() {
    let db = Arc::new(setup_mem_db(4));
    let handles: Vec<_> = (0..8u64)
        .map(|group| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for batch in 0..10u64 {
                    let first = batch * 10 + 1;
                    db.save_updates(&[update(group, 1, first..=first + 9)]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for group in 0..8 {
        let (got, _) = db.iterate_entries(group, 1, 1, 101, u64::MAX).unwrap();
        assert_eq!(got.len(), 100);
    }
}

// =============================================================================
// Bootstrap Tests
// =============================================================================

#[test]
fn test_list_all_bootstrap_info_spans_shards() {
    let db = setup_mem_db(3);
    let bootstrap = Bootstrap {
        join: true,
        state_machine_type: StateMachineType::Concurrent,
        ..Default::default()
    };
    for group in 1..=6 {
        db.save_bootstrap_info(group, 7, &bootstrap).unwrap();
    }

    let mut ids: Vec<ReplicaId> = db
        .list_all_bootstrap_info()
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    ids.sort();
    let expected: Vec<ReplicaId> = (1..=6).map(|g| ReplicaId::new(g, 7)).collect();
    assert_eq!(ids, expected);

    assert_eq!(db.get_bootstrap_info(4, 7).unwrap(), bootstrap);
    assert!(db.get_bootstrap_info(4, 8).unwrap_err().is_not_found());
}

#[test]
fn test_remove_node_data_through_router() {
    let db = setup_mem_db(2);
    db.save_bootstrap_info(3, 1, &Bootstrap::default()).unwrap();
    db.save_updates(&[update(3, 1, 1..=4)]).unwrap();

    db.remove_node_data(3, 1).unwrap();
    assert!(db.read_raft_state(3, 1, 0).unwrap_err().is_not_found());
    assert!(db.list_all_bootstrap_info().unwrap().is_empty());
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_from_stores_checks_store_count() {
    let stores = vec![MemStore::new(), MemStore::new()];
    let err = ShardedDb::from_stores(test_config(3), stores).err().unwrap();
    assert!(matches!(err, ShardLogError::Config(_)));
}

#[test]
fn test_open_creates_shard_directories() {
    let (temp_dir, db) = setup_temp_db(3);
    assert_eq!(db.name(), "fjall");
    for i in 0..3 {
        assert!(temp_dir.path().join(format!("shard-{}", i)).is_dir());
    }
    db.close().unwrap();
}

#[test]
fn test_open_with_directory_per_shard() {
    let temp_dir = TempDir::new().unwrap();
    let dirs: Vec<PathBuf> = (0..2).map(|i| temp_dir.path().join(format!("disk{}", i))).collect();
    let db = ShardedDb::open(test_config(2), &dirs).unwrap();

    assert!(dirs[0].join("shard-0").is_dir());
    assert!(dirs[1].join("shard-1").is_dir());
    db.close().unwrap();
}

#[test]
fn test_open_rejects_directory_count() {
    let temp_dir = TempDir::new().unwrap();
    let dirs: Vec<PathBuf> = (0..2).map(|i| temp_dir.path().join(format!("d{}", i))).collect();
    let err = ShardedDb::open(test_config(3), &dirs).err().unwrap();
    assert!(matches!(err, ShardLogError::Config(_)));
}

#[test]
fn test_existing_dirs_required_for_inspection() {
    let temp_dir = TempDir::new().unwrap();
    let dirs = vec![temp_dir.path().to_path_buf()];

    let err = check_existing_dirs(2, &dirs).unwrap_err();
    assert!(matches!(err, ShardLogError::Config(_)));
    assert!(!temp_dir.path().join("shard-0").exists());

    let db = ShardedDb::open(test_config(2), &dirs).unwrap();
    db.close().unwrap();
    drop(db);

    let shard_dirs = check_existing_dirs(2, &dirs).unwrap();
    assert_eq!(shard_dirs[1], temp_dir.path().join("shard-1"));
}

#[test]
fn test_open_locks_directory() {
    let (temp_dir, db) = setup_temp_db(1);
    let err = ShardedDb::open(test_config(1), &[temp_dir.path()])
        .err()
        .unwrap();
    assert!(matches!(err, ShardLogError::DirLocked(_)));
    drop(db);
}

#[test]
fn test_open_checks_free_space() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .shards(1)
        .min_free_disk_space(u64::MAX)
        .build();
    let err = ShardedDb::open(config, &[temp_dir.path()]).err().unwrap();
    assert!(matches!(err, ShardLogError::InsufficientSpace { .. }));
}

#[test]
fn test_busy_callback_installed() {
    let temp_dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let config = Config::builder()
        .shards(1)
        .kv_write_buffer_size(1024 * 1024)
        .busy_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    let db = ShardedDb::open(config, &[temp_dir.path()]).unwrap();
    db.save_updates(&[update(1, 1, 1..=3)]).unwrap();
    // a tiny write never reaches the busy threshold
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    db.close().unwrap();
}

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let snapshot = Snapshot {
        group_id: 5,
        index: 3,
        term: 2,
        state_machine_type: StateMachineType::OnDisk,
        ..Default::default()
    };
    {
        let db = ShardedDb::open(test_config(2), &[temp_dir.path()]).unwrap();
        let mut ud = update(5, 1, 3..=12);
        ud.snapshot = snapshot.clone();
        db.save_updates(&[ud]).unwrap();
        db.save_bootstrap_info(5, 1, &Bootstrap::default()).unwrap();
        db.close().unwrap();
    }

    let db = ShardedDb::open(test_config(2), &[temp_dir.path()]).unwrap();
    let rs = db.read_raft_state(5, 1, 3).unwrap();
    assert_eq!(rs.state.commit, 12);
    assert_eq!((rs.first_index, rs.entry_count), (3, 10));
    assert_eq!(db.get_snapshot(5, 1).unwrap(), snapshot);
    assert_eq!(db.list_all_bootstrap_info().unwrap().len(), 1);

    // the cold cache still suppresses stale entries
    let mut stale = update(5, 1, 4..=6);
    stale.entries_to_save[0].term = 9;
    db.save_updates(&[stale]).unwrap();
    let (got, _) = db.iterate_entries(5, 1, 4, 5, u64::MAX).unwrap();
    assert_eq!(got[0].term, 2);

    // and an older snapshot than the stored one
    let mut older = update(5, 1, 13..=13);
    older.snapshot = Snapshot {
        index: 2,
        ..snapshot.clone()
    };
    db.save_updates(&[older]).unwrap();
    assert_eq!(db.get_snapshot(5, 1).unwrap(), snapshot);
    assert_eq!(db.read_raft_state(5, 1, 3).unwrap().entry_count, 11);
}

#[test]
fn test_existing_format_survives_reconfiguration() {
    let temp_dir = TempDir::new().unwrap();
    {
        let config = Config::builder()
            .shards(2)
            .entry_format(EntryFormat::Batched)
            .build();
        let db = ShardedDb::open(config, &[temp_dir.path()]).unwrap();
        db.save_updates(&[update(1, 1, 1..=100)]).unwrap();
        db.close().unwrap();
    }

    let config = Config::builder()
        .shards(2)
        .entry_format(EntryFormat::Plain)
        .build();
    let db = ShardedDb::open(config, &[temp_dir.path()]).unwrap();
    assert_eq!(db.entry_format(), EntryFormat::Batched);
    assert_eq!(db.binary_format(), shardlog::entries::BATCHED_BINARY_FORMAT);

    let (got, _) = db.iterate_entries(1, 1, 1, 101, u64::MAX).unwrap();
    assert_eq!(got.len(), 100);
}

#[test]
fn test_import_snapshot_through_router() {
    let (_temp_dir, db) = setup_temp_db(2);
    let snapshot = Snapshot {
        group_id: 9,
        index: 40,
        term: 3,
        state_machine_type: StateMachineType::Regular,
        imported: true,
        ..Default::default()
    };
    db.import_snapshot(&snapshot, 2).unwrap();

    let rs = db.read_raft_state(9, 2, 40).unwrap();
    assert_eq!(rs.state.commit, 40);
    assert_eq!(rs.state.term, 3);
    assert!(db.get_bootstrap_info(9, 2).unwrap().join);

    // the log resumes after the imported snapshot
    db.save_updates(&[update(9, 2, 41..=45)]).unwrap();
    let rs = db.read_raft_state(9, 2, 40).unwrap();
    assert_eq!((rs.first_index, rs.entry_count), (41, 5));
}
