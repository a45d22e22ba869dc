//! Sorted-duplicate values tests
//!
//! These tests verify:
//! - Insertion keeps the array sorted and unique
//! - Removal, membership and count queries
//! - Directional iteration with and without a start value
//! - Value-size validation for both element widths

use std::path::PathBuf;

use stratakv::{Config, CursorOp, Db, DbFlags, PutFlags, Store, StrataError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dup.db");
    (dir, path)
}

fn open_store(path: &PathBuf) -> Store {
    let config = Config::builder()
        .path(path)
        .fsm_strict(true)
        .rng_seed(0xd0d0)
        .build();
    Store::open(config).unwrap()
}

fn dup_values(db: &Db, key: &[u8]) -> Vec<u64> {
    let mut cur = db.cursor(CursorOp::Eq, Some(key)).unwrap();
    let mut out = Vec::new();
    cur.dup_iter(None, false, |v| {
        out.push(v);
        false
    })
    .unwrap();
    out
}

// =============================================================================
// Insert / Remove / Count
// =============================================================================

#[test]
fn test_sorted_unique_insertion() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
    for v in [5u32, 2, 5, 9] {
        db.put(b"k", &v.to_le_bytes(), PutFlags::default()).unwrap();
    }
    let mut cur = db.cursor(CursorOp::Eq, Some(b"k")).unwrap();
    assert_eq!(cur.dup_num().unwrap(), 3);
    assert_eq!(dup_values(&db, b"k"), vec![2, 5, 9]);

    cur.dup_rm(5).unwrap();
    assert_eq!(cur.dup_num().unwrap(), 2);
    assert_eq!(dup_values(&db, b"k"), vec![2, 9]);
}

#[test]
fn test_dup_remove_via_put_flag() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
    for v in [8u32, 1, 4] {
        db.put(b"k", &v.to_le_bytes(), PutFlags::default()).unwrap();
    }
    db.put(b"k", &4u32.to_le_bytes(), PutFlags::DUP_REMOVE).unwrap();
    assert_eq!(dup_values(&db, b"k"), vec![1, 8]);
    // removing a value that is not there
    assert!(matches!(
        db.put(b"k", &4u32.to_le_bytes(), PutFlags::DUP_REMOVE),
        Err(StrataError::NotFound)
    ));
    // removing under a key that does not exist
    assert!(matches!(
        db.put(b"ghost", &1u32.to_le_bytes(), PutFlags::DUP_REMOVE),
        Err(StrataError::NotFound)
    ));
}

#[test]
fn test_dup_contains() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::DUP_UINT64_VALS).unwrap();
    for v in [10u64, 30, 20] {
        db.put(b"k", &v.to_le_bytes(), PutFlags::default()).unwrap();
    }
    let mut cur = db.cursor(CursorOp::Eq, Some(b"k")).unwrap();
    assert!(cur.dup_contains(20).unwrap());
    assert!(!cur.dup_contains(25).unwrap());
}

#[test]
fn test_dup_array_growth_past_reserve() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
    // enough values to force several reserve doublings
    for v in (0..200u32).rev() {
        db.put(b"wide", &v.to_le_bytes(), PutFlags::default()).unwrap();
    }
    let got = dup_values(&db, b"wide");
    let want: Vec<u64> = (0..200u64).collect();
    assert_eq!(got, want);
    let mut cur = db.cursor(CursorOp::Eq, Some(b"wide")).unwrap();
    assert_eq!(cur.dup_num().unwrap(), 200);
}

#[test]
fn test_dup_shrink_after_removals() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
    for v in 0..64u32 {
        db.put(b"k", &v.to_le_bytes(), PutFlags::default()).unwrap();
    }
    let mut cur = db.cursor(CursorOp::Eq, Some(b"k")).unwrap();
    for v in 0..60u32 {
        cur.dup_rm(v as u64).unwrap();
    }
    assert_eq!(cur.dup_num().unwrap(), 4);
    assert_eq!(dup_values(&db, b"k"), vec![60, 61, 62, 63]);
}

// =============================================================================
// Iteration
// =============================================================================

#[test]
fn test_dup_iter_directions_and_start() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
    for v in [7u32, 3, 11, 5] {
        db.put(b"k", &v.to_le_bytes(), PutFlags::default()).unwrap();
    }
    let mut cur = db.cursor(CursorOp::Eq, Some(b"k")).unwrap();

    let mut asc = Vec::new();
    cur.dup_iter(None, false, |v| {
        asc.push(v);
        false
    })
    .unwrap();
    assert_eq!(asc, vec![3, 5, 7, 11]);

    let mut desc = Vec::new();
    cur.dup_iter(None, true, |v| {
        desc.push(v);
        false
    })
    .unwrap();
    assert_eq!(desc, vec![11, 7, 5, 3]);

    let mut from_five = Vec::new();
    cur.dup_iter(Some(5), false, |v| {
        from_five.push(v);
        false
    })
    .unwrap();
    assert_eq!(from_five, vec![5, 7, 11]);

    // a missing start value is an error
    assert!(matches!(
        cur.dup_iter(Some(6), false, |_| false),
        Err(StrataError::NotFound)
    ));

    // the visitor can stop the walk early
    let mut first_two = Vec::new();
    cur.dup_iter(None, false, |v| {
        first_two.push(v);
        first_two.len() == 2
    })
    .unwrap();
    assert_eq!(first_two, vec![3, 5]);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_dup_value_size_enforced() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db32 = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
    assert!(matches!(
        db32.put(b"k", b"abc", PutFlags::default()),
        Err(StrataError::DupValueSize)
    ));
    assert!(matches!(
        db32.put(b"k", &8u64.to_le_bytes(), PutFlags::default()),
        Err(StrataError::DupValueSize)
    ));
    let db64 = store.db(2, DbFlags::DUP_UINT64_VALS).unwrap();
    assert!(matches!(
        db64.put(b"k", &8u32.to_le_bytes(), PutFlags::default()),
        Err(StrataError::DupValueSize)
    ));
    // existing arrays enforce the same size on update
    db32.put(b"k", &1u32.to_le_bytes(), PutFlags::default()).unwrap();
    assert!(matches!(
        db32.put(b"k", &2u64.to_le_bytes(), PutFlags::default()),
        Err(StrataError::DupValueSize)
    ));
}

#[test]
fn test_dup_ops_rejected_on_plain_database() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    db.put(b"k", b"v", PutFlags::default()).unwrap();
    let mut cur = db.cursor(CursorOp::Eq, Some(b"k")).unwrap();
    assert!(matches!(cur.dup_num(), Err(StrataError::InvalidState(_))));
    assert!(matches!(cur.dup_add(1), Err(StrataError::InvalidState(_))));
    assert!(matches!(
        cur.dup_iter(None, false, |_| false),
        Err(StrataError::InvalidState(_))
    ));
}

#[test]
fn test_dup_survives_reopen() {
    let (_dir, path) = setup();
    {
        let store = open_store(&path);
        let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
        for v in [6u32, 2, 4] {
            db.put(b"k", &v.to_le_bytes(), PutFlags::default()).unwrap();
        }
        drop(db);
        store.close().unwrap();
    }
    let store = open_store(&path);
    let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
    assert_eq!(dup_values(&db, b"k"), vec![2, 4, 6]);
}
