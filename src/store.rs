//! Store
//!
//! The top-level handle over one backing file. Owns the free-space manager,
//! the database registry and the store-wide locks; routes every public
//! operation.
//!
//! ## Concurrency
//! - `api`: store-wide reader/writer lock; public operations take it shared,
//!   open/close/destroy take it exclusive
//! - each database adds its own reader/writer lock below `api`
//! - `fsm`: guards the extent tree and the mmap window; read guards serve
//!   lookups, the write guard serves every mutation
//! - a worker gauge (mutex + condvar) counts open cursors and sweepers so
//!   teardown can drain them

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::blockfile::{SyncFlags, BLOCK_POW};
use crate::codec;
use crate::config::{Config, DbFlags, OpenFlags};
use crate::db::{load_db_header, save_db_header, Db, DbInner};
use crate::error::{Result, StrataError};
use crate::fsm::{AllocFlags, Fsm, FsmOptions, FsmState};
use crate::sblk::DB_SZ;

/// Store file magic, the first four bytes of the user header
pub const STORE_MAGIC: u32 = 0x6977_6b76;

/// Reserved user header length inside the FSM custom header area
pub const KVHDRSZ: u32 = 255;

/// Registry of live databases, in on-disk chain order
#[derive(Default)]
struct Registry {
    by_id: HashMap<u32, Arc<DbInner>>,
    chain: Vec<Arc<DbInner>>,
}

/// A neighbor snapshot taken while unlinking a database from the chain
pub(crate) struct ChainLink {
    pub addr: u64,
    pub id: u32,
    pub flags: DbFlags,
}

pub(crate) struct StoreInner {
    pub(crate) api: RwLock<()>,
    pub(crate) fsm: RwLock<Fsm>,
    pub(crate) rng: Mutex<StdRng>,
    dbs: Mutex<Registry>,
    open: AtomicBool,
    rdonly: bool,
    wk_mtx: Mutex<()>,
    wk_cond: Condvar,
    wk_count: AtomicI32,
}

impl StoreInner {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn is_rdonly(&self) -> bool {
        self.rdonly
    }

    // -------------------------------------------------------------------------
    // Worker Gauge
    // -------------------------------------------------------------------------

    pub(crate) fn worker_inc(&self) -> Result<()> {
        if !self.is_open() {
            return Err(StrataError::InvalidState("store is closed"));
        }
        let _g = self.wk_mtx.lock();
        if !self.is_open() {
            return Err(StrataError::InvalidState("store is closed"));
        }
        self.wk_count.fetch_add(1, Ordering::AcqRel);
        self.wk_cond.notify_all();
        Ok(())
    }

    pub(crate) fn worker_dec(&self) {
        let _g = self.wk_mtx.lock();
        self.wk_count.fetch_sub(1, Ordering::AcqRel);
        self.wk_cond.notify_all();
    }

    pub(crate) fn db_worker_inc(&self, db: &DbInner) -> Result<()> {
        if !self.is_open() || !db.open.load(Ordering::Acquire) {
            return Err(StrataError::InvalidState("database is closed"));
        }
        let _g = self.wk_mtx.lock();
        if !self.is_open() || !db.open.load(Ordering::Acquire) {
            return Err(StrataError::InvalidState("database is closed"));
        }
        self.wk_count.fetch_add(1, Ordering::AcqRel);
        db.wk_count.fetch_add(1, Ordering::AcqRel);
        self.wk_cond.notify_all();
        Ok(())
    }

    pub(crate) fn db_worker_dec(&self, db: &DbInner) {
        let _g = self.wk_mtx.lock();
        self.wk_count.fetch_sub(1, Ordering::AcqRel);
        db.wk_count.fetch_sub(1, Ordering::AcqRel);
        self.wk_cond.notify_all();
    }

    /// Block until every worker has drained, then take the store exclusively.
    /// The worker mutex is held across the lock acquisition so no new worker
    /// can slip in between.
    pub(crate) fn wait_workers_acquire_api(&self) -> RwLockWriteGuard<'_, ()> {
        let mut g = self.wk_mtx.lock();
        while self.wk_count.load(Ordering::Acquire) > 0 {
            self.wk_cond.wait(&mut g);
        }
        let api = self.api.write();
        drop(g);
        api
    }

    // -------------------------------------------------------------------------
    // Database Registry
    // -------------------------------------------------------------------------

    fn lookup_db(&self, id: u32) -> Option<Arc<DbInner>> {
        self.dbs.lock().by_id.get(&id).cloned()
    }

    /// Remove a database from the registry. Returns its chain neighbors and
    /// whether it headed the chain.
    pub(crate) fn unregister_db(&self, id: u32) -> (Option<ChainLink>, Option<ChainLink>, bool) {
        let mut reg = self.dbs.lock();
        let Some(pos) = reg.chain.iter().position(|d| d.id == id) else {
            return (None, None, false);
        };
        let link = |d: &Arc<DbInner>| ChainLink {
            addr: d.addr,
            id: d.id,
            flags: d.flags,
        };
        let prev = pos.checked_sub(1).map(|p| link(&reg.chain[p]));
        let next = reg.chain.get(pos + 1).map(link);
        reg.chain.remove(pos);
        reg.by_id.remove(&id);
        (prev, next, pos == 0)
    }

    /// Persist the first-database pointer in the store header
    pub(crate) fn set_first_db_addr(&self, fsm: &mut Fsm, addr: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        codec::put_u64_be(&mut buf, addr);
        fsm.writehdr(4, &buf)
    }

    /// Flush under the shared store lock
    pub(crate) fn sync_locked(&self, flags: SyncFlags) -> Result<()> {
        if self.rdonly {
            return Err(StrataError::ReadOnly);
        }
        let _api = self.api.read();
        self.fsm.write().sync(flags)
    }

    fn close_impl(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let _api = self.wait_workers_acquire_api();
        self.dbs.lock().chain.clear();
        self.dbs.lock().by_id.clear();
        let res = self.fsm.write().close();
        tracing::info!("store closed");
        res
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close_impl() {
                tracing::error!("store close on drop failed: {e}");
            }
        }
    }
}

/// An open StrataKV store
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open or create a store per the configuration
    pub fn open(config: Config) -> Result<Store> {
        let oflags = config.open_flags;
        let rdonly = !oflags.writable();
        let fsm = Fsm::open(&FsmOptions {
            path: config.path.clone(),
            bpow: BLOCK_POW,
            hdrlen: KVHDRSZ,
            truncate: oflags.contains(OpenFlags::TRUNC),
            rdonly,
            no_lock: oflags.contains(OpenFlags::NOLOCKS),
            strict: config.fsm_strict,
        })?;
        let is_new = fsm.is_new();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let inner = Arc::new(StoreInner {
            api: RwLock::new(()),
            fsm: RwLock::new(fsm),
            rng: Mutex::new(rng),
            dbs: Mutex::new(Registry::default()),
            open: AtomicBool::new(true),
            rdonly,
            wk_mtx: Mutex::new(()),
            wk_cond: Condvar::new(),
            wk_count: AtomicI32::new(0),
        });
        {
            let mut fsm = inner.fsm.write();
            if is_new {
                let mut hdr = [0u8; 12];
                codec::put_u32_be(&mut hdr[0..4], STORE_MAGIC);
                // first database pointer starts at zero
                fsm.writehdr(0, &hdr)?;
                fsm.sync(SyncFlags::default())?;
            } else {
                let mut hdr = [0u8; 12];
                fsm.readhdr(0, &mut hdr)?;
                if codec::get_u32_be(&hdr[0..4]) != STORE_MAGIC {
                    return Err(StrataError::Corrupted("store magic"));
                }
                let first = codec::get_u64_be(&hdr[4..12]);
                Self::load_db_chain(&inner, &fsm, first)?;
            }
        }
        tracing::info!(
            path = %config.path.display(),
            new = is_new,
            rdonly,
            "store opened"
        );
        Ok(Store { inner })
    }

    fn load_db_chain(inner: &Arc<StoreInner>, fsm: &Fsm, first: u64) -> Result<()> {
        let mut reg = inner.dbs.lock();
        let mut addr = first;
        while addr != 0 {
            let hdr = load_db_header(fsm.mm(), addr)?;
            let db = Arc::new(DbInner::new(hdr.id, addr, hdr.flags, hdr.lcnt));
            if reg.by_id.insert(hdr.id, Arc::clone(&db)).is_some() {
                return Err(StrataError::Corrupted("duplicate database id in chain"));
            }
            reg.chain.push(db);
            addr = hdr.next_addr;
        }
        tracing::debug!("loaded {} database(s)", reg.chain.len());
        Ok(())
    }

    /// Get an existing database or create it. Mode flags must match on every
    /// subsequent open of the same id.
    pub fn db(&self, id: u32, flags: DbFlags) -> Result<Db> {
        if !self.inner.is_open() {
            return Err(StrataError::InvalidState("store is closed"));
        }
        {
            let _api = self.inner.api.read();
            if let Some(db) = self.inner.lookup_db(id) {
                if db.flags != flags {
                    return Err(StrataError::IncompatibleDbMode);
                }
                return Ok(Db {
                    store: Arc::clone(&self.inner),
                    inner: db,
                });
            }
        }
        if self.inner.is_rdonly() {
            return Err(StrataError::ReadOnly);
        }
        let _api = self.inner.api.write();
        if let Some(db) = self.inner.lookup_db(id) {
            if db.flags != flags {
                return Err(StrataError::IncompatibleDbMode);
            }
            return Ok(Db {
                store: Arc::clone(&self.inner),
                inner: db,
            });
        }
        let mut fsm = self.inner.fsm.write();
        let (addr, _len) = fsm.allocate(
            DB_SZ,
            AllocFlags::NO_OVERALLOCATE | AllocFlags::NO_STATS | AllocFlags::ZEROED,
        )?;
        let mut reg = self.inner.dbs.lock();
        let prev = reg.chain.last().cloned();
        {
            let mm = fsm.mm_mut()?;
            save_db_header(mm, addr, id, flags, 0);
            if let Some(p) = &prev {
                save_db_header(mm, p.addr, p.id, p.flags, addr);
            }
        }
        if prev.is_none() {
            self.inner.set_first_db_addr(&mut fsm, addr)?;
        }
        let db = Arc::new(DbInner::new(id, addr, flags, [0; crate::sblk::SLEVELS]));
        reg.by_id.insert(id, Arc::clone(&db));
        reg.chain.push(db.clone());
        tracing::info!(db = id, "database created");
        Ok(Db {
            store: Arc::clone(&self.inner),
            inner: db,
        })
    }

    /// Flush file state to a point covering every completed operation
    pub fn sync(&self, flags: SyncFlags) -> Result<()> {
        if !self.inner.is_open() {
            return Err(StrataError::InvalidState("store is closed"));
        }
        self.inner.sync_locked(flags)
    }

    /// Snapshot of the free-space manager state
    pub fn space_stats(&self) -> FsmState {
        self.inner.fsm.read().state()
    }

    /// Drain workers, flush, trim and close the backing file
    pub fn close(self) -> Result<()> {
        if !self.inner.is_open() {
            return Err(StrataError::InvalidState("store is closed"));
        }
        self.inner.close_impl()
    }
}
