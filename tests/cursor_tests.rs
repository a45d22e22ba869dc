//! Cursor tests
//!
//! These tests verify:
//! - Positioning operations (BeforeFirst/AfterLast/Next/Prev/Eq/Ge)
//! - Numeric key ordering through cursors
//! - Value updates through `set`
//! - Error behavior on empty databases and exhausted iteration

use std::path::PathBuf;

use stratakv::{Config, CursorOp, DbFlags, PutFlags, Store, StrataError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cursor.db");
    (dir, path)
}

fn open_store(path: &PathBuf) -> Store {
    let config = Config::builder()
        .path(path)
        .fsm_strict(true)
        .rng_seed(0xc0c0)
        .build();
    Store::open(config).unwrap()
}

// =============================================================================
// Basic Iteration
// =============================================================================

#[test]
fn test_forward_and_backward_iteration() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    for key in ["banana", "apple", "cherry"] {
        db.put(key.as_bytes(), key.as_bytes(), PutFlags::default())
            .unwrap();
    }

    let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
    cur.to(CursorOp::Next).unwrap();
    assert_eq!(cur.key().unwrap(), b"apple");
    cur.to(CursorOp::Next).unwrap();
    assert_eq!(cur.key().unwrap(), b"banana");
    cur.to(CursorOp::Next).unwrap();
    assert_eq!(cur.key().unwrap(), b"cherry");
    assert!(matches!(cur.to(CursorOp::Next), Err(StrataError::NotFound)));
    // the cursor stays on the last record after running off the end
    assert_eq!(cur.key().unwrap(), b"cherry");
    cur.to(CursorOp::Prev).unwrap();
    assert_eq!(cur.key().unwrap(), b"banana");
}

#[test]
fn test_uint64_keys_descend_numerically() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::UINT64_KEYS).unwrap();
    for v in [1u64, 1_000_000, 42] {
        db.put(&v.to_le_bytes(), b"v", PutFlags::default()).unwrap();
    }
    let mut cur = db.cursor(CursorOp::AfterLast, None).unwrap();
    let mut seen = Vec::new();
    loop {
        match cur.to(CursorOp::Prev) {
            Ok(()) => {
                let k = cur.key().unwrap();
                seen.push(u64::from_le_bytes(k.try_into().unwrap()));
            }
            Err(StrataError::NotFound) => break,
            Err(e) => panic!("cursor failed: {e}"),
        }
    }
    assert_eq!(seen, vec![1_000_000, 42, 1]);
}

#[test]
fn test_empty_database_iteration() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
    assert!(matches!(cur.to(CursorOp::Next), Err(StrataError::NotFound)));
    let mut cur = db.cursor(CursorOp::AfterLast, None).unwrap();
    assert!(matches!(cur.to(CursorOp::Prev), Err(StrataError::NotFound)));
}

#[test]
fn test_get_before_positioning_is_invalid() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    db.put(b"a", b"1", PutFlags::default()).unwrap();
    let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
    assert!(matches!(cur.get(), Err(StrataError::InvalidState(_))));
}

// =============================================================================
// Eq / Ge Positioning
// =============================================================================

#[test]
fn test_eq_positions_exactly() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    for i in 0..60u32 {
        db.put(format!("k{i:02}").as_bytes(), &i.to_le_bytes(), PutFlags::default())
            .unwrap();
    }
    let mut cur = db.cursor(CursorOp::Eq, Some(b"k17")).unwrap();
    let (k, v) = cur.get().unwrap();
    assert_eq!(k, b"k17");
    assert_eq!(v, 17u32.to_le_bytes());
    // cursor can keep walking from the match
    cur.to(CursorOp::Next).unwrap();
    assert_eq!(cur.key().unwrap(), b"k18");

    assert!(matches!(
        db.cursor(CursorOp::Eq, Some(b"missing")),
        Err(StrataError::NotFound)
    ));
}

#[test]
fn test_ge_positioning() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    for key in [b"k10".as_ref(), b"k20", b"k30"] {
        db.put(key, b"v", PutFlags::default()).unwrap();
    }
    // exact hit
    let mut cur = db.cursor(CursorOp::Ge, Some(b"k20")).unwrap();
    assert_eq!(cur.key().unwrap(), b"k20");
    // between keys: the first key at or above
    let mut cur = db.cursor(CursorOp::Ge, Some(b"k15")).unwrap();
    assert_eq!(cur.key().unwrap(), b"k20");
    // below every key: the first record
    let mut cur = db.cursor(CursorOp::Ge, Some(b"a")).unwrap();
    assert_eq!(cur.key().unwrap(), b"k10");
    // past every key: settles on the last record of the bounding node
    let mut cur = db.cursor(CursorOp::Ge, Some(b"k99")).unwrap();
    assert_eq!(cur.key().unwrap(), b"k30");
}

#[test]
fn test_ge_on_empty_database() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    assert!(matches!(
        db.cursor(CursorOp::Ge, Some(b"k")),
        Err(StrataError::NotFound)
    ));
}

#[test]
fn test_eq_requires_key() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    db.put(b"a", b"1", PutFlags::default()).unwrap();
    assert!(matches!(
        db.cursor(CursorOp::Eq, None),
        Err(StrataError::InvalidArgs(_))
    ));
    let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
    assert!(matches!(cur.to(CursorOp::Eq), Err(StrataError::InvalidArgs(_))));
}

// =============================================================================
// Cursor Set
// =============================================================================

#[test]
fn test_set_overwrites_value_at_position() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    for i in 0..40u32 {
        db.put(format!("k{i:02}").as_bytes(), b"old", PutFlags::default())
            .unwrap();
    }
    {
        let mut cur = db.cursor(CursorOp::Eq, Some(b"k25")).unwrap();
        cur.set(b"new-value", PutFlags::default()).unwrap();
        assert_eq!(cur.val().unwrap(), b"new-value");
    }
    assert_eq!(db.get(b"k25").unwrap(), b"new-value");
    assert_eq!(db.get(b"k24").unwrap(), b"old");

    // a value large enough to force slot reallocation still lands
    {
        let mut cur = db.cursor(CursorOp::Eq, Some(b"k10")).unwrap();
        cur.set(&[9u8; 900], PutFlags::default()).unwrap();
    }
    assert_eq!(db.get(b"k10").unwrap(), vec![9u8; 900]);
}

#[test]
fn test_cursor_survives_across_many_nodes() {
    let (_dir, path) = setup();
    let store = open_store(&path);
    let db = store.db(1, DbFlags::default()).unwrap();
    for i in 0..500u32 {
        db.put(format!("k{i:04}").as_bytes(), &i.to_le_bytes(), PutFlags::default())
            .unwrap();
    }
    let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
    let mut n = 0u32;
    while cur.to(CursorOp::Next).is_ok() {
        let (k, v) = cur.get().unwrap();
        assert_eq!(k, format!("k{n:04}").as_bytes());
        assert_eq!(v, n.to_le_bytes());
        n += 1;
    }
    assert_eq!(n, 500);
    // walk back from the final record to the first
    while cur.to(CursorOp::Prev).is_ok() {
        n -= 1;
    }
    assert_eq!(cur.key().unwrap(), b"k0000");
    assert_eq!(n, 1);
}
