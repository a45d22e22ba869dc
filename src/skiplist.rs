//! Skip-list descent and mutation algorithms
//!
//! One `LookupCtx` drives one operation: it descends the list from the
//! database header, keeping the current `lower`/`upper` bound views and, for
//! mutations that rewire pointers, the per-level rails `plower`/`pupper` pinned
//! along the search path. Node views live in an arena owned by the context so
//! a node pinned at several levels stays a single mutable view; everything
//! dirty is flushed back through the mapped file when the operation releases.
//!
//! ## Responsibilities
//! - Find bounds for a key (`lower` ≤ key < `upper`)
//! - Get / put / delete, including the split and node-removal paths
//! - Generate node levels from the store PRNG without orphan levels

use rand::rngs::StdRng;
use rand::Rng;

use crate::blockfile::{addr2blk, blk2addr};
use crate::config::{DbFlags, PutFlags};
use crate::error::{Result, StrataError};
use crate::fsm::{AllocFlags, Fsm};
use crate::kvblk::{self, KvBlock, IDXNUM, INISZPOW};
use crate::sblk::{cmp_keys, Node, SBLK_SZ, SLEVELS};

/// Split pivot: pairs at positions `pivot..pnum` move to the new node
const SPLIT_PIVOT: usize = IDXNUM / 2 + 1;

/// Cursor positioning for [`LookupCtx::ge_index`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Eq,
    Ge,
}

/// Draw a node level: count trailing zero bits of a uniform 32-bit draw,
/// clamped to the level cap, then lowered until no orphan level remains.
pub fn gen_level(rng: &mut StdRng, lcnt: &[u32; SLEVELS]) -> u8 {
    let r: u32 = rng.gen();
    let mut lvl = r.trailing_zeros().min(SLEVELS as u32 - 1) as u8;
    while lvl > 0 && lcnt[lvl as usize - 1] == 0 {
        lvl -= 1;
    }
    lvl
}

/// Per-operation lookup context
pub struct LookupCtx<'k> {
    db_addr: u64,
    dbflg: DbFlags,
    key: &'k [u8],
    /// Level of the node to insert or delete, -1 outside those paths
    nlvl: i8,
    /// Forced upper match by address, used by the delete re-descent
    upper_addr: u64,
    arena: Vec<Node>,
    head: Option<usize>,
    lower: Option<usize>,
    upper: Option<usize>,
    /// Newly created (or successor-of-deleted) node
    nb: Option<usize>,
    plower: [Option<usize>; SLEVELS],
    pupper: [Option<usize>; SLEVELS],
}

impl<'k> LookupCtx<'k> {
    pub fn new(db_addr: u64, dbflg: DbFlags, key: &'k [u8]) -> LookupCtx<'k> {
        LookupCtx {
            db_addr,
            dbflg,
            key,
            nlvl: -1,
            upper_addr: 0,
            arena: Vec::new(),
            head: None,
            lower: None,
            upper: None,
            nb: None,
            plower: [None; SLEVELS],
            pupper: [None; SLEVELS],
        }
    }

    fn reset(&mut self) {
        self.arena.clear();
        self.head = None;
        self.lower = None;
        self.upper = None;
        self.nb = None;
        self.plower = [None; SLEVELS];
        self.pupper = [None; SLEVELS];
    }

    fn alloc(&mut self, node: Node) -> usize {
        self.arena.push(node);
        self.arena.len() - 1
    }

    fn node(&self, idx: usize) -> &Node {
        &self.arena[idx]
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.arena[idx]
    }

    // -------------------------------------------------------------------------
    // Descent
    // -------------------------------------------------------------------------

    /// Compare a node's lowest key against the search key. Falls back to the
    /// node's KVBLK when the inline prefix cannot decide.
    fn cmp_node_key(&mut self, idx: usize, fsm: &Fsm) -> Result<std::cmp::Ordering> {
        let node = &self.arena[idx];
        if node.is_db() || node.pnum == 0 {
            return Err(StrataError::Corrupted("descent reached an empty node"));
        }
        if node.flags & crate::sblk::FLG_FULL_LKEY != 0 || self.key.len() < node.lkl as usize {
            return Ok(cmp_keys(self.dbflg, node.lower_key(), self.key));
        }
        let mm = fsm.mm();
        self.arena[idx].load_kvblk(mm)?;
        let node = &self.arena[idx];
        let kvblk = node.kvblk.as_ref().unwrap();
        let probe = kvblk.key_at(node.pi[0] as usize, mm)?;
        Ok(cmp_keys(self.dbflg, probe, self.key))
    }

    /// Advance `lower` along level `lvl` until the next node's lowest key
    /// exceeds the search key (that node becomes `upper`), reusing views
    /// already pinned one level above.
    fn roll_forward(&mut self, lvl: usize, fsm: &Fsm) -> Result<()> {
        loop {
            let lower = self.lower.expect("descent without lower bound");
            let blkn = self.node(lower).n[lvl];
            if blkn == 0 {
                return Ok(());
            }
            let blkaddr = blk2addr(blkn);
            let mut idx = None;
            if self.nlvl > -1 && (lvl as i8) < self.nlvl {
                let ulvl = lvl + 1;
                if let Some(u) = self.pupper[ulvl] {
                    if self.node(u).addr == blkaddr {
                        idx = Some(u);
                    }
                }
                if idx.is_none() {
                    if let Some(l) = self.plower[ulvl] {
                        if self.node(l).addr == blkaddr {
                            idx = Some(l);
                        }
                    }
                }
            }
            let idx = match idx {
                Some(i) => i,
                None => {
                    let node = Node::load(blkaddr, fsm.mm())?;
                    self.alloc(node)
                }
            };
            if self.upper_addr == blkaddr
                || self.cmp_node_key(idx, fsm)? == std::cmp::Ordering::Greater
            {
                self.upper = Some(idx);
                return Ok(());
            }
            self.lower = Some(idx);
        }
    }

    /// Descend from the database header, pinning `(lower, upper)` rails at
    /// every level at or below `nlvl`.
    pub fn find_bounds(&mut self, fsm: &Fsm) -> Result<()> {
        if self.head.is_none() {
            let head = Node::db_head(self.db_addr, fsm.mm());
            let h = self.alloc(head);
            self.head = Some(h);
        }
        let head = self.head.unwrap();
        if self.lower.is_none() {
            self.lower = Some(head);
        }
        if self.nlvl > self.node(head).lvl as i8 {
            // the new node introduces a fresh top level
            let nlvl = self.nlvl as u8;
            let h = self.node_mut(head);
            h.lvl = nlvl;
            h.mark_dirty();
        }
        let mut lvl = self.node(self.lower.unwrap()).lvl as i8;
        while lvl > -1 {
            self.roll_forward(lvl as usize, fsm)?;
            let blkn = self
                .upper
                .map(|u| addr2blk(self.node(u).addr))
                .unwrap_or(0);
            loop {
                if self.nlvl >= lvl {
                    self.plower[lvl as usize] = self.lower;
                    self.pupper[lvl as usize] = self.upper;
                }
                if lvl == 0 {
                    lvl = -1;
                    break;
                }
                lvl -= 1;
                if self.node(self.lower.unwrap()).n[lvl as usize] != blkn {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Flush every distinct dirty view pinned by this operation
    pub fn release(&mut self, fsm: &mut Fsm, lcnt: &[u32; SLEVELS]) -> Result<()> {
        let mut order: Vec<usize> = Vec::with_capacity(2 * SLEVELS + 3);
        if let Some(nb) = self.nb {
            order.push(nb);
        }
        for i in 0..SLEVELS {
            if let Some(u) = self.pupper[i] {
                order.push(u);
            }
            if let Some(l) = self.plower[i] {
                order.push(l);
            }
        }
        if let Some(u) = self.upper {
            order.push(u);
        }
        if let Some(l) = self.lower {
            order.push(l);
        }
        if let Some(h) = self.head {
            order.push(h);
        }
        let mut seen = vec![false; self.arena.len()];
        let db_addr = self.db_addr;
        let mm = fsm.mm_mut()?;
        for idx in order {
            if seen[idx] {
                continue;
            }
            seen[idx] = true;
            self.arena[idx].sync_mm(db_addr, lcnt, mm);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Get
    // -------------------------------------------------------------------------

    /// Point lookup; copies the value out of the mapped file
    pub fn get(&mut self, fsm: &Fsm) -> Result<Vec<u8>> {
        self.find_bounds(fsm)?;
        let lower = self.lower.unwrap();
        let mm = fsm.mm();
        self.arena[lower].load_kvblk(mm)?;
        let node = &self.arena[lower];
        let (found, idx) = node.find_pi(self.dbflg, self.key, mm)?;
        if !found {
            return Err(StrataError::NotFound);
        }
        let kvblk = node.kvblk.as_ref().unwrap();
        Ok(kvblk.val_at(node.pi[idx as usize] as usize, mm)?.to_vec())
    }

    /// Resolve the cursor position for an `EQ`/`GE` match. Returns the
    /// in-node position; the positioned node is [`LookupCtx::take_lower`].
    pub fn ge_index(&mut self, fsm: &Fsm, op: MatchOp) -> Result<u8> {
        self.find_bounds(fsm)?;
        let lower = self.lower.unwrap();
        let mm = fsm.mm();
        self.arena[lower].load_kvblk(mm)?;
        let node = &self.arena[lower];
        let (found, idx) = node.find_pi(self.dbflg, self.key, mm)?;
        if found {
            return Ok(idx);
        }
        if op == MatchOp::Eq || node.is_db() || node.pnum == 0 {
            return Err(StrataError::NotFound);
        }
        if idx < node.pnum {
            Ok(idx)
        } else {
            Ok(idx - 1)
        }
    }

    /// Move the positioned `lower` view out of the context
    pub fn take_lower(&mut self) -> Node {
        let idx = self.lower.take().expect("no positioned node");
        self.arena[idx].clone()
    }

    // -------------------------------------------------------------------------
    // Put
    // -------------------------------------------------------------------------

    /// Insert or update the key, retrying with a generated node level when a
    /// split becomes necessary.
    pub fn put(
        &mut self,
        fsm: &mut Fsm,
        lcnt: &mut [u32; SLEVELS],
        rng: &mut StdRng,
        val: &[u8],
        opflags: PutFlags,
    ) -> Result<()> {
        loop {
            self.find_bounds(fsm)?;
            match self.try_addkv(fsm, lcnt, val, opflags) {
                Err(StrataError::RequireNLevel) => {
                    self.reset();
                    self.nlvl = gen_level(rng, lcnt) as i8;
                }
                Err(e) => {
                    return if matches!(e, StrataError::KvBlockFull) {
                        tracing::error!("kv block overflow leaked out of the insert path");
                        Err(StrataError::Corrupted("unresolved kv block overflow"))
                    } else {
                        Err(e)
                    };
                }
                Ok(()) => return self.release(fsm, lcnt),
            }
        }
    }

    /// Replace missing upper rails with the implicit tail view
    fn init_chute(&mut self, fsm: &Fsm) -> Result<()> {
        debug_assert!(self.nlvl >= 0);
        if self.pupper[self.nlvl as usize].is_none() {
            let tail = Node::db_tail(self.db_addr, fsm.mm());
            let t = self.alloc(tail);
            for i in (0..=self.nlvl as usize).rev() {
                if self.pupper[i].is_some() {
                    break;
                }
                self.pupper[i] = Some(t);
            }
        }
        Ok(())
    }

    fn try_addkv(
        &mut self,
        fsm: &mut Fsm,
        lcnt: &mut [u32; SLEVELS],
        val: &[u8],
        opflags: PutFlags,
    ) -> Result<()> {
        if self.nlvl > -1 {
            self.init_chute(fsm)?;
        }
        let lower = self.lower.unwrap();
        self.arena[lower].load_kvblk(fsm.mm())?;
        let (found, idx) = self.arena[lower].find_pi(self.dbflg, self.key, fsm.mm())?;
        if found && opflags.contains(PutFlags::NO_OVERWRITE) {
            return Err(StrataError::KeyExists);
        }
        if !found && opflags.contains(PutFlags::DUP_REMOVE) {
            return Err(StrataError::NotFound);
        }
        let full = self.node(lower).pnum as usize >= IDXNUM;
        // Neighbor-append: the key lands past a full node whose successor
        // still has room, so it becomes the successor's new minimum.
        let uadd = !found
            && full
            && idx as usize >= IDXNUM
            && self
                .upper
                .map_or(false, |u| (self.node(u).pnum as usize) < IDXNUM);
        if !found && full {
            if uadd {
                let upper = self.upper.unwrap();
                self.arena[upper].load_kvblk(fsm.mm())?;
                let key = self.key;
                return self.arena[upper].addkv(fsm, self.dbflg, key, val, opflags, false);
            }
            if self.nlvl < 0 {
                return Err(StrataError::RequireNLevel);
            }
            return self.split_addkv(fsm, lcnt, idx as usize, val, opflags);
        }
        let key = self.key;
        if !found {
            self.arena[lower].addkv_at(fsm, self.dbflg, idx as usize, key, val, opflags, false)
        } else {
            self.arena[lower].updatekv(fsm, self.dbflg, idx as usize, Some(key), val, opflags)
        }
    }

    /// Create a node sized for the pairs it will receive, wired at `nlvl`
    fn create_node(
        &mut self,
        fsm: &mut Fsm,
        lcnt: &mut [u32; SLEVELS],
        kvbpow: u8,
        hint_addr: u64,
    ) -> Result<usize> {
        let kvbpow = kvbpow.max(INISZPOW);
        let kvblksz = 1u64 << kvbpow;
        let (addr, _len) = fsm.allocate_near(
            SBLK_SZ + kvblksz,
            hint_addr,
            AllocFlags::NO_OVERALLOCATE | AllocFlags::NO_STATS | AllocFlags::ZEROED,
        )?;
        let kvblk = KvBlock::create(addr + SBLK_SZ, kvbpow);
        let node = Node::create(addr, self.nlvl as u8, kvblk);
        lcnt[self.nlvl as usize] += 1;
        if let Some(h) = self.head {
            self.arena[h].mark_dirty();
        }
        Ok(self.alloc(node))
    }

    /// Split `lower` around the pivot and wire the new node into the rails
    fn split_addkv(
        &mut self,
        fsm: &mut Fsm,
        lcnt: &mut [u32; SLEVELS],
        idx: usize,
        val: &[u8],
        opflags: PutFlags,
    ) -> Result<()> {
        debug_assert!(idx > 0);
        let lower = self.lower.unwrap();
        let pnum = self.node(lower).pnum as usize;
        // Size the new KVBLK for everything that moves over.
        let mut kvbpow = 0u8;
        if idx < pnum {
            let node = &self.arena[lower];
            let kvblk = node
                .kvblk
                .as_ref()
                .ok_or(StrataError::InvalidState("kvblk not loaded"))?;
            let mut sz: u64 = (SPLIT_PIVOT..pnum)
                .map(|i| kvblk.pidx[node.pi[i] as usize].len as u64)
                .sum();
            if idx > SPLIT_PIVOT {
                sz += crate::codec::varint_size(self.key.len() as u64) as u64
                    + self.key.len() as u64
                    + val.len() as u64;
            }
            sz += kvblk::MAX_NKV_SZ;
            while (1u64 << kvbpow) < sz {
                kvbpow += 1;
            }
        }
        let hint = self.node(lower).addr;
        let nb = self.create_node(fsm, lcnt, kvbpow, hint)?;
        if let Err(e) = self.split_fill(fsm, nb, idx, pnum, val, opflags) {
            // the fresh node never went live, take it back apart
            self.destroy_node(fsm, lcnt, nb)?;
            return Err(e);
        }
        self.nb = Some(nb);
        Ok(())
    }

    fn split_fill(
        &mut self,
        fsm: &mut Fsm,
        nb: usize,
        idx: usize,
        pnum: usize,
        val: &[u8],
        opflags: PutFlags,
    ) -> Result<()> {
        let lower = self.lower.unwrap();
        let nblk = addr2blk(self.node(nb).addr);

        if idx == pnum {
            // all existing pairs stay put, the new key opens the new node
            let key = self.key;
            self.arena[nb].addkv(fsm, self.dbflg, key, val, opflags, false)?;
        } else {
            // move the upper half over, pair by pair
            for i in SPLIT_PIVOT..pnum {
                let (k, v) = {
                    let node = &self.arena[lower];
                    let kvblk = node.kvblk.as_ref().unwrap();
                    let (k, v) = kvblk.kv_at(node.pi[i] as usize, fsm.mm())?;
                    (k.to_vec(), v.to_vec())
                };
                self.arena[nb].addkv_at(
                    fsm,
                    self.dbflg,
                    i - SPLIT_PIVOT,
                    &k,
                    &v,
                    opflags,
                    true,
                )?;
            }
            {
                let node = &mut self.arena[lower];
                let kvblk = node.kvblk.as_mut().unwrap();
                for i in SPLIT_PIVOT..pnum {
                    let slot = node.pi[i] as usize;
                    kvblk.pidx[slot] = Default::default();
                }
                kvblk.zidx = node.pi[SPLIT_PIVOT] as i8;
                kvblk.dirty = true;
                let maxoff = kvblk.pidx.iter().map(|s| s.off).max().unwrap_or(0);
                kvblk.maxoff = maxoff;
                node.pnum = SPLIT_PIVOT as u8;
                node.mark_dirty();
            }
            let key = self.key;
            if idx > SPLIT_PIVOT {
                self.arena[nb].addkv(fsm, self.dbflg, key, val, opflags, false)?;
            } else {
                self.arena[lower].addkv(fsm, self.dbflg, key, val, opflags, false)?;
            }
        }

        // Wire the rails: [lower] -> [nb] -> [old uppers]
        let p0_upper = self.pupper[0].unwrap();
        self.arena[p0_upper].p0 = nblk;
        self.arena[p0_upper].mark_dirty();
        let plower0_blk = addr2blk(self.node(self.plower[0].unwrap()).addr);
        self.arena[nb].p0 = plower0_blk;
        for i in 0..=self.nlvl as usize {
            let pl = self.plower[i].unwrap();
            self.arena[pl].n[i] = nblk;
            self.arena[pl].mark_dirty();
            let pu_blk = addr2blk(self.node(self.pupper[i].unwrap()).addr);
            self.arena[nb].n[i] = pu_blk;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------------

    /// Remove the key. When the last pair of a node goes away the node is
    /// unlinked level by level and returned to the free-space manager.
    pub fn del(&mut self, fsm: &mut Fsm, lcnt: &mut [u32; SLEVELS]) -> Result<()> {
        self.find_bounds(fsm)?;
        let lower = self.lower.unwrap();
        self.arena[lower].load_kvblk(fsm.mm())?;
        let (found, idx) = self.arena[lower].find_pi(self.dbflg, self.key, fsm.mm())?;
        if !found {
            return Err(StrataError::NotFound);
        }
        if self.node(lower).pnum > 1 {
            self.arena[lower].rmkv(fsm, idx as usize)?;
            return self.release(fsm, lcnt);
        }

        // Last pair: re-descend pinning rails around the doomed node.
        let target = self.node(lower).addr;
        let target_lvl = self.node(lower).lvl;
        let kvblk = self.arena[lower].kvblk.take();
        self.reset();
        self.nlvl = target_lvl as i8;
        self.upper_addr = target;
        self.find_bounds(fsm)?;
        let upper = self.upper.ok_or(StrataError::Corrupted("unlink lost its node"))?;
        if self.node(upper).addr != target || self.node(upper).pnum != 1 {
            return Err(StrataError::Corrupted("unlink bounds moved"));
        }
        self.arena[upper].kvblk = kvblk;
        self.arena[upper].rmkv(fsm, idx as usize)?;

        for i in 0..=self.nlvl as usize {
            let un = self.node(upper).n[i];
            let pl = self.plower[i].unwrap();
            self.arena[pl].n[i] = un;
            self.arena[pl].mark_dirty();
            if self.node(pl).is_db() && un == 0 {
                self.arena[pl].lvl = self.arena[pl].lvl.saturating_sub(1);
            }
            if self.pupper[i] == Some(upper) {
                self.pupper[i] = None;
            }
        }
        // Patch the successor's back pointer.
        let succ_blk = self.node(upper).n[0];
        let target_p0 = self.node(upper).p0;
        let nb = if succ_blk != 0 {
            let node = Node::load(blk2addr(succ_blk), fsm.mm())?;
            self.alloc(node)
        } else {
            let tail = Node::db_tail(self.db_addr, fsm.mm());
            self.alloc(tail)
        };
        self.arena[nb].p0 = target_p0;
        self.arena[nb].mark_dirty();
        self.nb = Some(nb);

        self.destroy_node(fsm, lcnt, upper)?;
        self.upper = None;
        self.release(fsm, lcnt)
    }

    /// Deallocate a node and its KVBLK, maintaining the level counts
    fn destroy_node(&mut self, fsm: &mut Fsm, lcnt: &mut [u32; SLEVELS], idx: usize) -> Result<()> {
        let node = &mut self.arena[idx];
        debug_assert!(!node.is_db());
        let addr = node.addr;
        let lvl = node.lvl as usize;
        let kvb_addr = blk2addr(node.kvblkn);
        let kvb_szpow = match node.kvblk.take() {
            Some(kvblk) => kvblk.szpow,
            None => fsm.mm()[kvb_addr as usize],
        };
        node.flags &= !crate::sblk::FLG_DIRTY;
        if lcnt[lvl] > 0 {
            lcnt[lvl] -= 1;
        }
        if let Some(h) = self.head {
            self.arena[h].mark_dirty();
        }
        fsm.deallocate(addr, SBLK_SZ)?;
        fsm.deallocate(kvb_addr, 1u64 << kvb_szpow)?;
        Ok(())
    }
}
