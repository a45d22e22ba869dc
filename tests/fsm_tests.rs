//! Free-space manager tests (public API)
//!
//! These tests verify:
//! - Page-aligned allocation
//! - Locality hints
//! - Strict-mode read/write guards
//! - Allocation statistics across reopen

use std::path::PathBuf;

use stratakv::fsm::{AllocFlags, Fsm, FsmOptions};
use stratakv::StrataError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fsm.db");
    (dir, path)
}

fn open_fsm(path: &PathBuf, truncate: bool, strict: bool) -> Fsm {
    Fsm::open(&FsmOptions {
        path: path.clone(),
        hdrlen: 64,
        truncate,
        strict,
        ..FsmOptions::default()
    })
    .unwrap()
}

// =============================================================================
// Allocation Behavior
// =============================================================================

#[test]
fn test_page_aligned_allocation() {
    let (_dir, path) = setup();
    let mut fsm = open_fsm(&path, true, true);
    let (addr, len) = fsm
        .allocate(256, AllocFlags::PAGE_ALIGNED | AllocFlags::NO_OVERALLOCATE)
        .unwrap();
    assert_eq!(addr % 4096, 0, "offset must be page aligned");
    assert_eq!(len, 256);
    fsm.deallocate(addr, len).unwrap();
}

#[test]
fn test_allocation_near_hint_prefers_locality() {
    let (_dir, path) = setup();
    let mut fsm = open_fsm(&path, true, false);
    // carve two far-apart free islands of equal size
    let (a, alen) = fsm.allocate(32 * 1024, AllocFlags::NO_OVERALLOCATE).unwrap();
    let (b, blen) = fsm.allocate(32 * 1024, AllocFlags::NO_OVERALLOCATE).unwrap();
    let island_a = (a + 1024, 2048u64);
    let island_b = (b + 1024, 2048u64);
    fsm.deallocate(island_a.0, island_a.1).unwrap();
    fsm.deallocate(island_b.0, island_b.1).unwrap();

    let (near_b, _) = fsm
        .allocate_near(2048, island_b.0, AllocFlags::NO_OVERALLOCATE | AllocFlags::NO_EXTEND)
        .unwrap();
    assert_eq!(near_b, island_b.0);
    let (near_a, _) = fsm
        .allocate_near(2048, island_a.0, AllocFlags::NO_OVERALLOCATE | AllocFlags::NO_EXTEND)
        .unwrap();
    assert_eq!(near_a, island_a.0);

    fsm.deallocate(near_a, 2048).unwrap();
    fsm.deallocate(near_b, 2048).unwrap();
    let _ = (alen, blen);
}

#[test]
fn test_zeroed_allocation_is_blank() {
    let (_dir, path) = setup();
    let mut fsm = open_fsm(&path, true, true);
    let (addr, len) = fsm
        .allocate(1024, AllocFlags::NO_OVERALLOCATE | AllocFlags::ZEROED)
        .unwrap();
    // scribble, free, allocate again zeroed
    fsm.mm_mut().unwrap()[addr as usize..(addr + len) as usize].fill(0x5a);
    fsm.deallocate(addr, len).unwrap();
    let (addr2, len2) = fsm
        .allocate(1024, AllocFlags::NO_OVERALLOCATE | AllocFlags::ZEROED)
        .unwrap();
    assert!(fsm.mm()[addr2 as usize..(addr2 + len2) as usize]
        .iter()
        .all(|&b| b == 0));
}

// =============================================================================
// Strict Guards
// =============================================================================

#[test]
fn test_strict_io_requires_allocated_range() {
    let (_dir, path) = setup();
    let fsm_path = path.clone();
    let mut fsm = open_fsm(&fsm_path, true, true);
    let (addr, _len) = fsm.allocate(256, AllocFlags::NO_OVERALLOCATE).unwrap();
    fsm.write(addr, b"payload").unwrap();
    let mut buf = [0u8; 7];
    fsm.read(addr, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
    // an unallocated target far past every allocation is a segmentation error
    let free_addr = 64 * 1024;
    assert!(matches!(
        fsm.write(free_addr, b"x"),
        Err(StrataError::Segmentation)
    ));
    assert!(matches!(
        fsm.read(free_addr, &mut buf),
        Err(StrataError::Segmentation)
    ));
}

// =============================================================================
// Statistics
// =============================================================================

#[test]
fn test_allocation_stats_persist() {
    let (_dir, path) = setup();
    {
        let mut fsm = open_fsm(&path, true, false);
        for _ in 0..50 {
            let (addr, len) = fsm.allocate(512, AllocFlags::default()).unwrap();
            fsm.deallocate(addr, len).unwrap();
        }
        let st = fsm.state();
        assert!(st.avg_alloc_blocks > 0.0);
        fsm.close().unwrap();
    }
    let fsm = open_fsm(&path, false, false);
    let st = fsm.state();
    assert!(st.avg_alloc_blocks > 0.0, "stats must survive reopen");
}
