//! Databases
//!
//! A store holds a chain of named (numeric-id) databases, each the head of
//! its own skip list. The database header block carries the persistent chain
//! link, the per-level node counts and the level-30 forward pointers that
//! make the header the virtual head node of the list.
//!
//! ## Responsibilities
//! - Decode/encode database header blocks
//! - Route `put`/`get`/`del` through the skip-list core under the right locks
//! - Destroy databases asynchronously via a detached sweeper thread

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};

use crate::blockfile::{addr2blk, blk2addr};
use crate::codec;
use crate::config::{DbFlags, PutFlags};
use crate::cursor::{Cursor, CursorOp};
use crate::error::{Result, StrataError};
use crate::fsm::Fsm;
use crate::sblk::{DB_MAGIC, DB_SZ, DOFF_C0, DOFF_FLAGS, DOFF_ID, DOFF_MAGIC, DOFF_N0, DOFF_NEXTDB, SLEVELS};
use crate::skiplist::LookupCtx;
use crate::store::StoreInner;

/// Decoded database header block
pub(crate) struct DbHeader {
    pub id: u32,
    pub flags: DbFlags,
    pub next_addr: u64,
    pub lcnt: [u32; SLEVELS],
}

/// Parse a database header block at `addr`
pub(crate) fn load_db_header(mm: &[u8], addr: u64) -> Result<DbHeader> {
    let base = addr as usize;
    if base + DB_SZ as usize > mm.len() {
        return Err(StrataError::Corrupted("database header out of file"));
    }
    if codec::get_u32_be(&mm[base + DOFF_MAGIC..]) != DB_MAGIC {
        return Err(StrataError::Corrupted("database header magic"));
    }
    let flags = DbFlags::from_bits(mm[base + DOFF_FLAGS]);
    let id = codec::get_u32_be(&mm[base + DOFF_ID..]);
    let next_addr = blk2addr(codec::get_u32_be(&mm[base + DOFF_NEXTDB..]));
    let mut lcnt = [0u32; SLEVELS];
    for (i, c) in lcnt.iter_mut().enumerate() {
        *c = codec::get_u32_be(&mm[base + DOFF_C0 + i * 4..]);
    }
    Ok(DbHeader { id, flags, next_addr, lcnt })
}

/// Write the fixed part of a database header: magic, flags, id, chain link.
/// The skip-list fields are maintained by node flushes.
pub(crate) fn save_db_header(mm: &mut [u8], addr: u64, id: u32, flags: DbFlags, next_addr: u64) {
    let base = addr as usize;
    codec::put_u32_be(&mut mm[base + DOFF_MAGIC..], DB_MAGIC);
    mm[base + DOFF_FLAGS] = flags.bits();
    codec::put_u32_be(&mut mm[base + DOFF_ID..], id);
    codec::put_u32_be(&mut mm[base + DOFF_NEXTDB..], addr2blk(next_addr));
}

/// First skip-list node of the database, per its header
pub(crate) fn first_node_blk(mm: &[u8], addr: u64) -> u32 {
    codec::get_u32_be(&mm[addr as usize + DOFF_N0..])
}

/// Shared database record
pub(crate) struct DbInner {
    pub id: u32,
    pub addr: u64,
    pub flags: DbFlags,
    /// Database API lock: shared for reads, exclusive for writes
    pub rwl: RwLock<()>,
    pub open: AtomicBool,
    /// Per-level node counts (I5); mutated only under the write lock
    pub lcnt: Mutex<[u32; SLEVELS]>,
    /// Active workers bound to this database (cursors, sweeper); guarded by
    /// the store worker mutex
    pub wk_count: AtomicI32,
}

impl DbInner {
    pub(crate) fn new(id: u32, addr: u64, flags: DbFlags, lcnt: [u32; SLEVELS]) -> DbInner {
        DbInner {
            id,
            addr,
            flags,
            rwl: RwLock::new(()),
            open: AtomicBool::new(true),
            lcnt: Mutex::new(lcnt),
            wk_count: AtomicI32::new(0),
        }
    }
}

/// Handle to one database inside a store
#[derive(Clone)]
pub struct Db {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) inner: Arc<DbInner>,
}

impl Db {
    /// Numeric database id
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Database mode flags
    pub fn flags(&self) -> DbFlags {
        self.inner.flags
    }

    /// Per-level skip-list node counts
    pub fn level_counts(&self) -> [u32; SLEVELS] {
        *self.inner.lcnt.lock()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if !self.store.is_open() || !self.inner.open.load(Ordering::Acquire) {
            return Err(StrataError::InvalidState("database is closed"));
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(StrataError::InvalidArgs("empty key"));
        }
        if let Some(want) = self.inner.flags.fixed_key_size() {
            if key.len() != want {
                return Err(StrataError::KeyNumValueSize);
            }
        }
        Ok(())
    }

    /// Insert or update a key/value pair
    pub fn put(&self, key: &[u8], val: &[u8], opflags: PutFlags) -> Result<()> {
        self.ensure_open()?;
        if self.store.is_rdonly() {
            return Err(StrataError::ReadOnly);
        }
        self.check_key(key)?;
        let res = {
            let _api = self.store.api.read();
            self.ensure_open()?;
            let _dbl = self.inner.rwl.write();
            let mut fsm = self.store.fsm.write();
            let mut lcnt = self.inner.lcnt.lock();
            let mut rng = self.store.rng.lock();
            let mut ctx = LookupCtx::new(self.inner.addr, self.inner.flags, key);
            ctx.put(&mut fsm, &mut lcnt, &mut rng, val, opflags)
        };
        if res.is_ok() && opflags.contains(PutFlags::SYNC) {
            self.store.sync_locked(crate::blockfile::SyncFlags::DATA)?;
        }
        res
    }

    /// Look up the value for a key
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.check_key(key)?;
        let _api = self.store.api.read();
        self.ensure_open()?;
        let _dbl = self.inner.rwl.read();
        let fsm = self.store.fsm.read();
        let mut ctx = LookupCtx::new(self.inner.addr, self.inner.flags, key);
        ctx.get(&fsm)
    }

    /// Remove a key
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.store.is_rdonly() {
            return Err(StrataError::ReadOnly);
        }
        self.check_key(key)?;
        let _api = self.store.api.read();
        self.ensure_open()?;
        let _dbl = self.inner.rwl.write();
        let mut fsm = self.store.fsm.write();
        let mut lcnt = self.inner.lcnt.lock();
        let mut ctx = LookupCtx::new(self.inner.addr, self.inner.flags, key);
        ctx.del(&mut fsm, &mut lcnt)
    }

    /// Open a cursor positioned by `op` (and `key` for `Eq`/`Ge`)
    pub fn cursor(&self, op: CursorOp, key: Option<&[u8]>) -> Result<Cursor> {
        Cursor::open(self.clone(), op, key)
    }

    /// Destroy the database: unlink it from the chain and hand the skip list
    /// to a detached sweeper that returns every block to the free pool.
    pub fn destroy(self) -> Result<()> {
        self.ensure_open()?;
        if self.store.is_rdonly() {
            return Err(StrataError::ReadOnly);
        }
        let store = Arc::clone(&self.store);
        // Wait for every worker (open cursors, running sweepers) to drain,
        // then take the store exclusively.
        let _api = store.wait_workers_acquire_api();
        debug_assert_eq!(self.inner.wk_count.load(Ordering::Acquire), 0);
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return Err(StrataError::InvalidState("database is closed"));
        }
        store.worker_inc()?;
        let res = destroy_locked(&store, &self.inner);
        if res.is_err() {
            store.worker_dec();
        }
        res
    }
}

/// Unlink the database under the exclusive store lock and spawn the sweeper.
/// The caller holds one worker slot that the sweeper inherits.
fn destroy_locked(store: &Arc<StoreInner>, inner: &Arc<DbInner>) -> Result<()> {
    let (prev, next, was_first) = store.unregister_db(inner.id);
    let next_addr = next.as_ref().map_or(0, |n| n.addr);
    let first_blk;
    {
        let mut fsm = store.fsm.write();
        first_blk = first_node_blk(fsm.mm(), inner.addr);
        if let Some(p) = &prev {
            let mm = fsm.mm_mut()?;
            save_db_header(mm, p.addr, p.id, p.flags, next_addr);
        }
        if was_first {
            store.set_first_db_addr(&mut fsm, next_addr)?;
        }
        fsm.deallocate(inner.addr, DB_SZ)?;
    }
    tracing::info!(db = inner.id, "database destroyed, sweeping {} chain", if first_blk != 0 { "non-empty" } else { "empty" });
    if first_blk != 0 {
        let store = Arc::clone(store);
        let db = Arc::clone(inner);
        thread::Builder::new()
            .name("stratakv-sweeper".to_string())
            .spawn(move || {
                sweep_chain(&store, &db, first_blk);
                store.worker_dec();
            })
            .map_err(StrataError::Io)?;
    } else {
        store.worker_dec();
    }
    Ok(())
}

/// Walk the level-0 chain, deallocating one node and its KVBLK per lock
/// acquisition so concurrent work on other databases keeps flowing.
fn sweep_chain(store: &Arc<StoreInner>, db: &Arc<DbInner>, first_blk: u32) {
    let mut sbn = first_blk;
    while sbn != 0 {
        let mut fsm = store.fsm.write();
        match sweep_step(&mut fsm, sbn) {
            Ok(next) => sbn = next,
            Err(e) => {
                tracing::error!(db = db.id, "database sweep failed: {e}");
                break;
            }
        }
    }
    tracing::debug!(db = db.id, "database sweep complete");
}

/// Deallocate one skip-list node and its data block, returning the successor
fn sweep_step(fsm: &mut Fsm, sbn: u32) -> Result<u32> {
    let sba = blk2addr(sbn);
    let node = crate::sblk::Node::load(sba, fsm.mm())?;
    let next = node.n[0];
    let kvblkn = node.kvblkn;
    fsm.deallocate(sba, crate::sblk::SBLK_SZ)?;
    if kvblkn != 0 {
        let kvb_addr = blk2addr(kvblkn);
        let szpow = fsm.mm()[kvb_addr as usize];
        fsm.deallocate(kvb_addr, 1u64 << szpow)?;
    }
    Ok(next)
}
