//! Cursors
//!
//! A cursor binds to one database and walks the level-0 chain: `Next`
//! ascends, `Prev` descends, `Eq`/`Ge` jump through the skip list. The
//! cursor holds a worker slot on its database so `close()`/`destroy()` wait
//! for it; close cursors promptly.

use std::sync::Arc;

use crate::blockfile::{addr2blk, blk2addr};
use crate::codec;
use crate::config::PutFlags;
use crate::db::Db;
use crate::error::{Result, StrataError};
use crate::kvblk::{decode_dup_elem, dup_sorted_find, IDXNUM};
use crate::sblk::Node;
use crate::skiplist::{LookupCtx, MatchOp};

/// Cursor positioning operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// Park before the first record
    BeforeFirst,
    /// Park after the last record
    AfterLast,
    /// Advance to the next record in ascending key order
    Next,
    /// Step back to the previous record
    Prev,
    /// Position exactly at a key
    Eq,
    /// Position at the first record with key ≥ the given key
    Ge,
}

enum Anchor {
    BeforeFirst,
    AfterLast,
    None,
}

/// A cursor over one database
pub struct Cursor {
    db: Db,
    cn: Option<Node>,
    cnpos: u8,
    anchor: Anchor,
    closed: bool,
}

impl Cursor {
    pub(crate) fn open(db: Db, op: CursorOp, key: Option<&[u8]>) -> Result<Cursor> {
        db.ensure_open()?;
        db.store.db_worker_inc(&db.inner)?;
        let mut cur = Cursor {
            db,
            cn: None,
            cnpos: 0,
            anchor: Anchor::None,
            closed: false,
        };
        let res = match (op, key) {
            (CursorOp::Eq | CursorOp::Ge, Some(k)) => cur.to_key(op, k),
            (CursorOp::Eq | CursorOp::Ge, None) => {
                Err(StrataError::InvalidArgs("key required for Eq/Ge"))
            }
            (_, Some(_)) => Err(StrataError::InvalidArgs("key given without Eq/Ge")),
            (_, None) => cur.to(op),
        };
        match res {
            Ok(()) => Ok(cur),
            Err(e) => {
                cur.close_impl();
                Err(e)
            }
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed {
            return Err(StrataError::InvalidState("cursor is closed"));
        }
        self.db.ensure_open()
    }

    /// Reposition the cursor without a key
    pub fn to(&mut self, op: CursorOp) -> Result<()> {
        self.ensure_usable()?;
        match op {
            CursorOp::BeforeFirst => {
                self.cn = None;
                self.anchor = Anchor::BeforeFirst;
                self.cnpos = IDXNUM as u8 - 1;
                Ok(())
            }
            CursorOp::AfterLast => {
                self.cn = None;
                self.anchor = Anchor::AfterLast;
                self.cnpos = 0;
                Ok(())
            }
            CursorOp::Next | CursorOp::Prev => {
                let store = Arc::clone(&self.db.store);
                let db = Arc::clone(&self.db.inner);
                let _api = store.api.read();
                self.db.ensure_open()?;
                let _dbl = db.rwl.read();
                let fsm = store.fsm.read();
                self.step(&fsm, op == CursorOp::Next)
            }
            CursorOp::Eq | CursorOp::Ge => Err(StrataError::InvalidArgs("key required for Eq/Ge")),
        }
    }

    /// Position at (or at least at) the given key
    pub fn to_key(&mut self, op: CursorOp, key: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let mop = match op {
            CursorOp::Eq => MatchOp::Eq,
            CursorOp::Ge => MatchOp::Ge,
            _ => return Err(StrataError::InvalidArgs("to_key accepts Eq/Ge only")),
        };
        let store = Arc::clone(&self.db.store);
        let db = Arc::clone(&self.db.inner);
        let _api = store.api.read();
        self.db.ensure_open()?;
        let _dbl = db.rwl.read();
        let fsm = store.fsm.read();
        let mut ctx = LookupCtx::new(db.addr, db.flags, key);
        match ctx.ge_index(&fsm, mop) {
            Ok(idx) => {
                self.cn = Some(ctx.take_lower());
                self.cnpos = idx;
                self.anchor = Anchor::None;
                Ok(())
            }
            Err(StrataError::NotFound) if mop == MatchOp::Ge => {
                // the key sorts before every stored key: the first record is
                // the answer (or there is none)
                self.cn = None;
                self.anchor = Anchor::BeforeFirst;
                self.cnpos = IDXNUM as u8 - 1;
                self.step(&fsm, true)
            }
            Err(e) => Err(e),
        }
    }

    /// One step along the level-0 chain, skipping empty nodes
    fn step(&mut self, fsm: &crate::fsm::Fsm, forward: bool) -> Result<()> {
        let db_addr = self.db.inner.addr;
        let dbblk = addr2blk(db_addr);
        loop {
            if self.cn.is_none() {
                match self.anchor {
                    Anchor::BeforeFirst => {
                        self.cn = Some(Node::db_head(db_addr, fsm.mm()));
                        self.cnpos = IDXNUM as u8 - 1;
                    }
                    Anchor::AfterLast => {
                        self.cn = Some(Node::db_tail(db_addr, fsm.mm()));
                        self.cnpos = 0;
                    }
                    Anchor::None => return Err(StrataError::InvalidState("cursor is unpositioned")),
                }
                self.anchor = Anchor::None;
            }
            let cn = self.cn.as_ref().unwrap();
            if forward {
                if self.cnpos as usize + 1 >= cn.pnum as usize {
                    let n = cn.n[0];
                    if n == 0 {
                        return Err(StrataError::NotFound);
                    }
                    self.cn = Some(Node::load(blk2addr(n), fsm.mm())?);
                    self.cnpos = 0;
                    if self.cn.as_ref().unwrap().pnum > 0 {
                        return Ok(());
                    }
                    // empty node, keep walking
                } else {
                    if cn.is_db() {
                        return Err(StrataError::InvalidState("cursor on a header block"));
                    }
                    self.cnpos += 1;
                    return Ok(());
                }
            } else if self.cnpos == 0 {
                let n = cn.p0;
                if n == 0 || n == dbblk {
                    return Err(StrataError::NotFound);
                }
                self.cn = Some(Node::load(blk2addr(n), fsm.mm())?);
                let pnum = self.cn.as_ref().unwrap().pnum;
                if pnum > 0 {
                    self.cnpos = pnum - 1;
                    return Ok(());
                }
                self.cnpos = 0;
                // empty node, keep walking
            } else {
                if cn.is_db() {
                    return Err(StrataError::InvalidState("cursor on a header block"));
                }
                self.cnpos -= 1;
                return Ok(());
            }
        }
    }

    fn positioned(&self) -> Result<&Node> {
        let cn = self
            .cn
            .as_ref()
            .ok_or(StrataError::InvalidState("cursor is unpositioned"))?;
        if cn.is_db() || self.cnpos >= cn.pnum {
            return Err(StrataError::InvalidState("cursor is unpositioned"));
        }
        Ok(cn)
    }

    /// Current key and value
    pub fn get(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.ensure_usable()?;
        self.positioned()?;
        let store = Arc::clone(&self.db.store);
        let db = Arc::clone(&self.db.inner);
        let _api = store.api.read();
        self.db.ensure_open()?;
        let _dbl = db.rwl.read();
        let fsm = store.fsm.read();
        let cn = self.cn.as_mut().unwrap();
        cn.load_kvblk(fsm.mm())?;
        let idx = cn.pi[self.cnpos as usize] as usize;
        let (k, v) = cn.kvblk.as_ref().unwrap().kv_at(idx, fsm.mm())?;
        Ok((k.to_vec(), v.to_vec()))
    }

    /// Current key
    pub fn key(&mut self) -> Result<Vec<u8>> {
        Ok(self.get()?.0)
    }

    /// Current value
    pub fn val(&mut self) -> Result<Vec<u8>> {
        Ok(self.get()?.1)
    }

    /// Overwrite the value at the cursor position
    pub fn set(&mut self, val: &[u8], opflags: PutFlags) -> Result<()> {
        self.ensure_usable()?;
        if self.db.store.is_rdonly() {
            return Err(StrataError::ReadOnly);
        }
        self.positioned()?;
        let store = Arc::clone(&self.db.store);
        let db = Arc::clone(&self.db.inner);
        let _api = store.api.read();
        self.db.ensure_open()?;
        let _dbl = db.rwl.write();
        let mut fsm = store.fsm.write();
        let cnpos = self.cnpos as usize;
        let cn = self.cn.as_mut().unwrap();
        cn.load_kvblk(fsm.mm())?;
        cn.updatekv(&mut fsm, db.flags, cnpos, None, val, opflags)?;
        let lcnt = *db.lcnt.lock();
        cn.sync_mm(db.addr, &lcnt, fsm.mm_mut()?);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sorted-Duplicate Values
    // -------------------------------------------------------------------------

    fn dup_elem_size(&self) -> Result<usize> {
        self.db
            .inner
            .flags
            .dup_elem_size()
            .ok_or(StrataError::InvalidState("not a sorted-duplicates database"))
    }

    fn encode_dup(&self, dv: u64) -> Result<([u8; 8], usize)> {
        let elsz = self.dup_elem_size()?;
        let mut buf = [0u8; 8];
        if elsz == 4 {
            codec::put_u32_le(&mut buf[..4], dv as u32);
        } else {
            codec::put_u64_le(&mut buf, dv);
        }
        Ok((buf, elsz))
    }

    /// Insert a value into the sorted array at the cursor position
    pub fn dup_add(&mut self, dv: u64) -> Result<()> {
        let (buf, elsz) = self.encode_dup(dv)?;
        self.set(&buf[..elsz], PutFlags::default())
    }

    /// Remove a value from the sorted array at the cursor position
    pub fn dup_rm(&mut self, dv: u64) -> Result<()> {
        let (buf, elsz) = self.encode_dup(dv)?;
        self.set(&buf[..elsz], PutFlags::DUP_REMOVE)
    }

    /// Read the sorted array at the cursor position, as `(count, elements)`
    fn dup_snapshot(&mut self) -> Result<(usize, Vec<u8>)> {
        self.ensure_usable()?;
        let elsz = self.dup_elem_size()?;
        self.positioned()?;
        let store = Arc::clone(&self.db.store);
        let db = Arc::clone(&self.db.inner);
        let _api = store.api.read();
        self.db.ensure_open()?;
        let _dbl = db.rwl.read();
        let fsm = store.fsm.read();
        let cn = self.cn.as_mut().unwrap();
        cn.load_kvblk(fsm.mm())?;
        let idx = cn.pi[self.cnpos as usize] as usize;
        let val = cn.kvblk.as_ref().unwrap().val_at(idx, fsm.mm())?;
        if val.len() < 4 {
            return Err(StrataError::Corrupted("dup array header"));
        }
        let count = codec::get_u32_le(&val[0..4]) as usize;
        if val.len() < 4 + count * elsz {
            return Err(StrataError::Corrupted("dup array count"));
        }
        Ok((count, val[4..4 + count * elsz].to_vec()))
    }

    /// Number of values in the sorted array
    pub fn dup_num(&mut self) -> Result<u32> {
        let (count, _) = self.dup_snapshot()?;
        Ok(count as u32)
    }

    /// True when the array contains `dv`
    pub fn dup_contains(&mut self, dv: u64) -> Result<bool> {
        let elsz = self.dup_elem_size()?;
        let (count, elems) = self.dup_snapshot()?;
        Ok(dup_sorted_find(&elems, count, elsz, dv).is_ok())
    }

    /// Visit the array in order, optionally from `start` (which must exist),
    /// descending when `down`. The visitor returns `true` to stop.
    pub fn dup_iter(
        &mut self,
        start: Option<u64>,
        down: bool,
        mut visitor: impl FnMut(u64) -> bool,
    ) -> Result<()> {
        let elsz = self.dup_elem_size()?;
        let (count, elems) = self.dup_snapshot()?;
        if count == 0 {
            return Ok(());
        }
        let mut sidx: i64 = match start {
            Some(v) => match dup_sorted_find(&elems, count, elsz, v) {
                Ok(i) => i as i64,
                Err(_) => return Err(StrataError::NotFound),
            },
            None => {
                if down {
                    count as i64 - 1
                } else {
                    0
                }
            }
        };
        while sidx >= 0 && (sidx as usize) < count {
            let dv = decode_dup_elem(&elems[sidx as usize * elsz..], elsz);
            if visitor(dv) {
                break;
            }
            sidx += if down { -1 } else { 1 };
        }
        Ok(())
    }

    fn close_impl(&mut self) {
        if !self.closed {
            self.closed = true;
            self.db.store.db_worker_dec(&self.db.inner);
        }
    }

    /// Release the cursor's worker slot
    pub fn close(mut self) -> Result<()> {
        self.close_impl();
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close_impl();
    }
}
