//! SBLK: skip-list node
//!
//! A fixed 256-byte node at a block-aligned offset:
//!
//! ```text
//! flags:u8 | lvl:u8 | lkl:u8 | pnum:u8 |
//! p0:u32   | kvblkn:u32 | pi[32]:u8 |
//! n[30]:u32 | pad[28] | lk[64]
//! ```
//!
//! Fields are little-endian. Each node owns exactly one KVBLK; `pi[]` orders
//! the KVBLK's live slots by key and `lk` holds the (possibly truncated)
//! lowest key so most descent comparisons never touch the KVBLK.
//!
//! The database header doubles as the virtual level-30 head of the list and
//! decodes into the same view; a node with address zero stands for the
//! implicit tail and carries only the back pointer stored in the header.

use crate::blockfile::addr2blk;
use crate::codec;
use crate::config::{DbFlags, PutFlags};
use crate::error::{Result, StrataError};
use crate::fsm::Fsm;
use crate::kvblk::{KvBlock, RmFlags, IDXNUM};

/// Number of skip-list levels
pub const SLEVELS: usize = 30;

/// Node size in bytes (4 blocks)
pub const SBLK_SZ: u64 = 256;

/// Database header block size in bytes (5 blocks, ≥ 257 rounded to grain)
pub const DB_SZ: u64 = 320;

/// Inline lower-key capacity
pub const LKLEN: usize = 64;

/// Lowest key is fully contained in `lk`. The only persistent flag.
pub const FLG_FULL_LKEY: u8 = 0x01;
/// Node view stands for the database header (or tail). Runtime only.
pub const FLG_DB: u8 = 0x08;
/// View diverged from the mapped bytes. Runtime only.
pub const FLG_DIRTY: u8 = 0x10;

const PERSISTENT_FLAGS: u8 = FLG_FULL_LKEY;

// SBLK field offsets
const OFF_FLAGS: usize = 0;
const OFF_LVL: usize = 1;
const OFF_LKL: usize = 2;
const OFF_PNUM: usize = 3;
const OFF_P0: usize = 4;
const OFF_KVBLKN: usize = 8;
const OFF_PI: usize = 12;
const OFF_N0: usize = 44;
const OFF_LK: usize = 192;

/// Database header magic
pub const DB_MAGIC: u32 = 0x69776462;

// Database header field offsets (big-endian fields)
pub const DOFF_MAGIC: usize = 0;
pub const DOFF_FLAGS: usize = 4;
pub const DOFF_ID: usize = 5;
pub const DOFF_NEXTDB: usize = 9;
pub const DOFF_P0: usize = 13;
pub const DOFF_N0: usize = 17;
pub const DOFF_C0: usize = 137;

/// Compare two keys under the database mode: lexicographic bytes by default,
/// numeric after a little-endian decode for the fixed-width integer modes.
pub fn cmp_keys(dbflg: DbFlags, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    if dbflg.contains(DbFlags::UINT64_KEYS) && a.len() == 8 && b.len() == 8 {
        codec::get_u64_le(a).cmp(&codec::get_u64_le(b))
    } else if dbflg.contains(DbFlags::UINT32_KEYS) && a.len() == 4 && b.len() == 4 {
        codec::get_u32_le(a).cmp(&codec::get_u32_le(b))
    } else {
        a.cmp(b)
    }
}

/// In-memory view of one skip-list node (or of the database head/tail)
#[derive(Debug, Clone)]
pub struct Node {
    /// Node byte address; zero for the implicit tail view
    pub addr: u64,
    pub flags: u8,
    pub lvl: u8,
    pub lkl: u8,
    pub pnum: u8,
    /// Previous node block number; for the tail view, the last real node
    pub p0: u32,
    /// Owned KVBLK block number
    pub kvblkn: u32,
    /// Sorted permutation of live KVBLK slots
    pub pi: [u8; IDXNUM],
    /// Forward pointers, block numbers
    pub n: [u32; SLEVELS],
    /// Inline lower-key prefix
    pub lk: [u8; LKLEN],
    /// Lazily loaded KVBLK view
    pub kvblk: Option<KvBlock>,
}

impl Node {
    fn blank() -> Node {
        Node {
            addr: 0,
            flags: 0,
            lvl: 0,
            lkl: 0,
            pnum: 0,
            p0: 0,
            kvblkn: 0,
            pi: [0; IDXNUM],
            n: [0; SLEVELS],
            lk: [0; LKLEN],
            kvblk: None,
        }
    }

    /// Fresh node backed by a just-created KVBLK
    pub fn create(addr: u64, lvl: u8, kvblk: KvBlock) -> Node {
        let mut node = Node::blank();
        node.addr = addr;
        node.flags = FLG_DIRTY;
        node.lvl = lvl;
        node.kvblkn = addr2blk(kvblk.addr);
        node.kvblk = Some(kvblk);
        node
    }

    /// Decode a regular node at `addr`
    pub fn load(addr: u64, mm: &[u8]) -> Result<Node> {
        let base = addr as usize;
        if base + SBLK_SZ as usize > mm.len() {
            return Err(StrataError::Corrupted("node out of file"));
        }
        let mut node = Node::blank();
        node.addr = addr;
        node.flags = mm[base + OFF_FLAGS];
        if node.flags & !PERSISTENT_FLAGS != 0 {
            return Err(StrataError::Corrupted("node flags"));
        }
        node.lvl = mm[base + OFF_LVL];
        if node.lvl as usize >= SLEVELS {
            return Err(StrataError::Corrupted("node level"));
        }
        node.lkl = mm[base + OFF_LKL];
        if node.lkl as usize > LKLEN {
            return Err(StrataError::Corrupted("node lower-key length"));
        }
        node.pnum = mm[base + OFF_PNUM];
        if node.pnum as usize > IDXNUM {
            return Err(StrataError::Corrupted("node pair count"));
        }
        node.p0 = codec::get_u32_le(&mm[base + OFF_P0..]);
        node.kvblkn = codec::get_u32_le(&mm[base + OFF_KVBLKN..]);
        node.pi.copy_from_slice(&mm[base + OFF_PI..base + OFF_PI + IDXNUM]);
        for i in 0..=node.lvl as usize {
            node.n[i] = codec::get_u32_le(&mm[base + OFF_N0 + i * 4..]);
        }
        node.lk[..node.lkl as usize]
            .copy_from_slice(&mm[base + OFF_LK..base + OFF_LK + node.lkl as usize]);
        Ok(node)
    }

    /// Synthesize the skip-list head view from a database header. Its level
    /// is the topmost non-zero forward pointer.
    pub fn db_head(db_addr: u64, mm: &[u8]) -> Node {
        let base = db_addr as usize;
        let mut node = Node::blank();
        node.addr = db_addr;
        node.flags = FLG_DB;
        node.pnum = IDXNUM as u8;
        for i in 0..SLEVELS {
            node.n[i] = codec::get_u32_be(&mm[base + DOFF_N0 + i * 4..]);
            if node.n[i] != 0 {
                node.lvl = node.lvl.saturating_add(1);
            } else {
                break;
            }
        }
        node.lvl = node.lvl.saturating_sub(1);
        node
    }

    /// Synthesize the implicit tail view. Its `p0` is the last real node per
    /// the database header, or the header itself for an empty list.
    pub fn db_tail(db_addr: u64, mm: &[u8]) -> Node {
        let base = db_addr as usize;
        let mut node = Node::blank();
        node.addr = 0;
        node.flags = FLG_DB;
        node.pnum = IDXNUM as u8;
        node.p0 = codec::get_u32_be(&mm[base + DOFF_P0..]);
        if node.p0 == 0 {
            node.p0 = addr2blk(db_addr);
        }
        node
    }

    pub fn is_db(&self) -> bool {
        self.flags & FLG_DB != 0
    }

    /// True for the implicit tail view
    pub fn is_tail(&self) -> bool {
        self.is_db() && self.addr == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & FLG_DIRTY != 0
    }

    pub fn mark_dirty(&mut self) {
        self.flags |= FLG_DIRTY;
    }

    /// The inline lower-key prefix
    pub fn lower_key(&self) -> &[u8] {
        &self.lk[..self.lkl as usize]
    }

    /// Load the owned KVBLK view if not yet present
    pub fn load_kvblk(&mut self, mm: &[u8]) -> Result<()> {
        if self.kvblk.is_none() && self.kvblkn != 0 {
            self.kvblk = Some(KvBlock::load(crate::blockfile::blk2addr(self.kvblkn), mm)?);
        }
        Ok(())
    }

    fn kvblk_ref(&self) -> Result<&KvBlock> {
        self.kvblk
            .as_ref()
            .ok_or(StrataError::InvalidState("kvblk not loaded"))
    }

    /// Flush the node (and a dirty KVBLK view) back into the mapped file
    pub fn sync_mm(&mut self, db_addr: u64, lcnt: &[u32; SLEVELS], mm: &mut [u8]) {
        if self.is_dirty() {
            self.flags &= !FLG_DIRTY;
            if self.is_db() {
                let base = db_addr as usize;
                if self.addr != 0 {
                    debug_assert_eq!(self.addr, db_addr);
                    for i in 0..SLEVELS {
                        codec::put_u32_be(&mut mm[base + DOFF_N0 + i * 4..], self.n[i]);
                    }
                    for i in 0..SLEVELS {
                        codec::put_u32_be(&mut mm[base + DOFF_C0 + i * 4..], lcnt[i]);
                    }
                } else {
                    codec::put_u32_be(&mut mm[base + DOFF_P0..], self.p0);
                }
            } else {
                let base = self.addr as usize;
                mm[base + OFF_FLAGS] = self.flags & PERSISTENT_FLAGS;
                mm[base + OFF_LVL] = self.lvl;
                mm[base + OFF_LKL] = self.lkl;
                mm[base + OFF_PNUM] = self.pnum;
                codec::put_u32_le(&mut mm[base + OFF_P0..], self.p0);
                codec::put_u32_le(&mut mm[base + OFF_KVBLKN..], self.kvblkn);
                mm[base + OFF_PI..base + OFF_PI + IDXNUM].copy_from_slice(&self.pi);
                for i in 0..=self.lvl as usize {
                    codec::put_u32_le(&mut mm[base + OFF_N0 + i * 4..], self.n[i]);
                }
                mm[base + OFF_LK..base + OFF_LK + self.lkl as usize]
                    .copy_from_slice(&self.lk[..self.lkl as usize]);
            }
        }
        if let Some(kvblk) = self.kvblk.as_mut() {
            kvblk.sync_mm(mm);
        }
    }

    // -------------------------------------------------------------------------
    // Permutation Index
    // -------------------------------------------------------------------------

    /// Binary search the permutation. `(true, i)` when `pi[i]` holds the key,
    /// else `(false, i)` with `i` the insertion position.
    pub fn find_pi(&self, dbflg: DbFlags, key: &[u8], mm: &[u8]) -> Result<(bool, u8)> {
        if self.is_db() {
            return Ok((false, IDXNUM as u8));
        }
        if self.pnum == 0 {
            return Ok((false, 0));
        }
        let kvblk = self.kvblk_ref()?;
        let mut lb = 0usize;
        let mut ub = self.pnum as usize;
        while lb < ub {
            let mid = (lb + ub) / 2;
            let probe = kvblk.key_at(self.pi[mid] as usize, mm)?;
            match cmp_keys(dbflg, probe, key) {
                std::cmp::Ordering::Equal => return Ok((true, mid as u8)),
                std::cmp::Ordering::Less => lb = mid + 1,
                std::cmp::Ordering::Greater => ub = mid,
            }
        }
        Ok((false, lb as u8))
    }

    /// Binary-search-then-shift insert of `kvidx` into the permutation.
    /// Returns the position it landed at.
    fn insert_pi(&mut self, dbflg: DbFlags, kvidx: u8, key: &[u8], mm: &[u8]) -> Result<u8> {
        let (_, idx) = self.find_pi(dbflg, key, mm)?;
        self.shift_in_pi(idx as usize, kvidx);
        Ok(idx)
    }

    fn shift_in_pi(&mut self, idx: usize, kvidx: u8) {
        let nels = self.pnum as usize;
        if nels > idx {
            self.pi.copy_within(idx..nels, idx + 1);
        }
        self.pi[idx] = kvidx;
        self.pnum += 1;
    }

    /// Refresh the inline lower-key prefix from `key`
    fn update_lk(&mut self, key: &[u8]) {
        self.lkl = key.len().min(LKLEN) as u8;
        self.lk[..self.lkl as usize].copy_from_slice(&key[..self.lkl as usize]);
        if key.len() <= LKLEN {
            self.flags |= FLG_FULL_LKEY;
        } else {
            self.flags &= !FLG_FULL_LKEY;
        }
    }

    // -------------------------------------------------------------------------
    // Pair Operations
    // -------------------------------------------------------------------------

    /// Add a pair, searching the permutation for the position
    pub fn addkv(
        &mut self,
        fsm: &mut Fsm,
        dbflg: DbFlags,
        key: &[u8],
        val: &[u8],
        opflags: PutFlags,
        internal: bool,
    ) -> Result<()> {
        if self.pnum as usize >= IDXNUM {
            return Err(StrataError::KvBlockFull);
        }
        if !internal && opflags.contains(PutFlags::DUP_REMOVE) {
            return Err(StrataError::NotFound);
        }
        let kvblk = self
            .kvblk
            .as_mut()
            .ok_or(StrataError::InvalidState("kvblk not loaded"))?;
        let kvidx = kvblk.add_kv(fsm, dbflg, key, val, opflags, internal)?;
        self.kvblkn = addr2blk(kvblk.addr);
        let idx = self.insert_pi(dbflg, kvidx, key, fsm.mm())?;
        if idx == 0 {
            self.update_lk(key);
        }
        self.mark_dirty();
        Ok(())
    }

    /// Add a pair at a known permutation position
    pub fn addkv_at(
        &mut self,
        fsm: &mut Fsm,
        dbflg: DbFlags,
        idx: usize,
        key: &[u8],
        val: &[u8],
        opflags: PutFlags,
        internal: bool,
    ) -> Result<()> {
        if self.pnum as usize >= IDXNUM {
            return Err(StrataError::KvBlockFull);
        }
        if !internal && opflags.contains(PutFlags::DUP_REMOVE) {
            return Err(StrataError::NotFound);
        }
        let kvblk = self
            .kvblk
            .as_mut()
            .ok_or(StrataError::InvalidState("kvblk not loaded"))?;
        let kvidx = kvblk.add_kv(fsm, dbflg, key, val, opflags, internal)?;
        self.kvblkn = addr2blk(kvblk.addr);
        self.shift_in_pi(idx, kvidx);
        if idx == 0 {
            self.update_lk(key);
        }
        self.mark_dirty();
        Ok(())
    }

    /// Update the pair at permutation position `idx`
    pub fn updatekv(
        &mut self,
        fsm: &mut Fsm,
        dbflg: DbFlags,
        idx: usize,
        key: Option<&[u8]>,
        val: &[u8],
        opflags: PutFlags,
    ) -> Result<()> {
        debug_assert!(idx < self.pnum as usize);
        let kvblk = self
            .kvblk
            .as_mut()
            .ok_or(StrataError::InvalidState("kvblk not loaded"))?;
        let kvidx = self.pi[idx] as usize;
        let nidx = kvblk.update_kv(fsm, dbflg, kvidx, key, val, opflags, false)?;
        self.kvblkn = addr2blk(kvblk.addr);
        self.pi[idx] = nidx;
        self.mark_dirty();
        Ok(())
    }

    /// Remove the pair at permutation position `idx`, refreshing the lower
    /// key when the minimum goes away.
    pub fn rmkv(&mut self, fsm: &mut Fsm, idx: usize) -> Result<()> {
        debug_assert!(idx < self.pnum as usize);
        let kvblk = self
            .kvblk
            .as_mut()
            .ok_or(StrataError::InvalidState("kvblk not loaded"))?;
        kvblk.rm_kv(fsm, self.pi[idx] as usize, RmFlags::default())?;
        self.kvblkn = addr2blk(kvblk.addr);
        self.pnum -= 1;
        let nels = self.pnum as usize;
        if idx < nels {
            self.pi.copy_within(idx + 1..nels + 1, idx);
        }
        self.mark_dirty();
        if idx == 0 {
            if self.pnum > 0 {
                let key = {
                    let kvblk = self.kvblk_ref()?;
                    kvblk.key_at(self.pi[0] as usize, fsm.mm())?.to_vec()
                };
                self.update_lk(&key);
            } else {
                self.lkl = 0;
            }
        }
        Ok(())
    }
}
