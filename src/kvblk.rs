//! KVBLK: key/value data block
//!
//! A variable-size block of `2^szpow` bytes (512 minimum) holding up to 32
//! pairs. The header carries 32 slot descriptors `(offset-from-end, length)`
//! as varints; pair payloads grow from the block end toward the middle, each
//! `[klen:varint][key][value]`. Removal leaves holes that compaction slides
//! out; the whole block doubles or halves through the free-space manager as
//! occupancy changes.

use crate::codec;
use crate::config::{DbFlags, PutFlags};
use crate::error::{Result, StrataError};
use crate::fsm::{AllocFlags, Fsm};

/// Number of pair slots per block
pub const IDXNUM: usize = 32;

/// Initial (and minimum) block size as a power of two: 512 bytes
pub const INISZPOW: u8 = 9;

/// Header bytes ahead of the slot descriptors: `szpow:u8`, `idxsz:u16`
pub const HDRSZ: u64 = 3;

/// Upper bound of the serialized descriptor area
pub const MAX_IDX_SZ: u16 = ((8 + 5) * IDXNUM) as u16;

/// Upper bound of all non-payload bytes in a block
pub const MAX_NKV_SZ: u64 = HDRSZ + MAX_IDX_SZ as u64;

/// Largest encoded key+value payload: 256 MB − 1
pub const MAX_KV_SIZE: u64 = 0xfffffff;

/// Flags for [`KvBlock::rm_kv`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmFlags(u8);

impl RmFlags {
    /// Rewrite the block header after the removal
    pub const SYNC: RmFlags = RmFlags(0x01);
    /// Skip the shrink heuristic
    pub const NO_RESIZE: RmFlags = RmFlags(0x02);

    pub fn contains(self, other: RmFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RmFlags {
    type Output = RmFlags;
    fn bitor(self, rhs: RmFlags) -> RmFlags {
        RmFlags(self.0 | rhs.0)
    }
}

/// One slot descriptor: pair offset relative to the block end, and length
#[derive(Debug, Clone, Copy, Default)]
pub struct Slot {
    pub off: u64,
    pub len: u32,
}

/// In-memory view of one KVBLK
#[derive(Debug, Clone)]
pub struct KvBlock {
    /// Block byte address
    pub addr: u64,
    /// Block size as a power of two
    pub szpow: u8,
    /// Serialized size of the descriptor area
    pub idxsz: u16,
    /// First empty slot, or -1 when full
    pub zidx: i8,
    /// Largest live pair offset
    pub maxoff: u64,
    pub dirty: bool,
    pub pidx: [Slot; IDXNUM],
}

impl KvBlock {
    /// Initialize a fresh empty block at `addr`
    pub fn create(addr: u64, szpow: u8) -> KvBlock {
        KvBlock {
            addr,
            szpow,
            idxsz: (2 * codec::varint_size(0) * IDXNUM) as u16,
            zidx: 0,
            maxoff: 0,
            dirty: true,
            pidx: [Slot::default(); IDXNUM],
        }
    }

    /// Decode the block header at `addr` from the mapped file
    pub fn load(addr: u64, mm: &[u8]) -> Result<KvBlock> {
        let mut kb = KvBlock {
            addr,
            szpow: 0,
            idxsz: 0,
            zidx: -1,
            maxoff: 0,
            dirty: false,
            pidx: [Slot::default(); IDXNUM],
        };
        let base = addr as usize;
        if base + HDRSZ as usize > mm.len() {
            return Err(StrataError::Corrupted("kvblk header out of file"));
        }
        kb.szpow = mm[base];
        if kb.szpow < INISZPOW || base + (1usize << kb.szpow) > mm.len() {
            return Err(StrataError::Corrupted("kvblk size out of file"));
        }
        kb.idxsz = codec::get_u16_le(&mm[base + 1..base + 3]);
        if kb.idxsz > MAX_IDX_SZ {
            return Err(StrataError::Corrupted("kvblk index oversized"));
        }
        let mut rp = base + HDRSZ as usize;
        for i in 0..IDXNUM {
            let (off, step) = codec::read_varint(&mm[rp..])?;
            rp += step;
            let (len, step) = codec::read_varint(&mm[rp..])?;
            rp += step;
            let len = u32::try_from(len).map_err(|_| StrataError::Corrupted("kvblk slot length"))?;
            kb.pidx[i] = Slot { off, len };
            if len > 0 {
                if off == 0 || (len as u64) > off || off > kb.size() {
                    return Err(StrataError::Corrupted("kvblk slot descriptor"));
                }
                if off > kb.maxoff {
                    kb.maxoff = off;
                }
            } else if kb.zidx < 0 {
                kb.zidx = i as i8;
            }
        }
        Ok(kb)
    }

    /// Block size in bytes
    pub fn size(&self) -> u64 {
        1u64 << self.szpow
    }

    fn end(&self) -> usize {
        (self.addr + self.size()) as usize
    }

    /// Zero-copy key bytes of a live slot
    pub fn key_at<'m>(&self, idx: usize, mm: &'m [u8]) -> Result<&'m [u8]> {
        let slot = &self.pidx[idx];
        if slot.len == 0 {
            return Err(StrataError::Corrupted("kvblk read of empty slot"));
        }
        let rp = self.end() - slot.off as usize;
        let (klen, step) = codec::read_varint(&mm[rp..])?;
        if klen == 0 || klen + step as u64 > slot.len as u64 || slot.off < klen {
            return Err(StrataError::Corrupted("kvblk key length"));
        }
        Ok(&mm[rp + step..rp + step + klen as usize])
    }

    /// Zero-copy value bytes of a live slot
    pub fn val_at<'m>(&self, idx: usize, mm: &'m [u8]) -> Result<&'m [u8]> {
        let (_, val) = self.kv_at(idx, mm)?;
        Ok(val)
    }

    /// Zero-copy key and value bytes of a live slot
    pub fn kv_at<'m>(&self, idx: usize, mm: &'m [u8]) -> Result<(&'m [u8], &'m [u8])> {
        let slot = &self.pidx[idx];
        if slot.len == 0 {
            return Err(StrataError::Corrupted("kvblk read of empty slot"));
        }
        let rp = self.end() - slot.off as usize;
        let (klen, step) = codec::read_varint(&mm[rp..])?;
        let klen = klen as usize;
        if klen == 0 || klen + step > slot.len as usize || (slot.off as usize) < klen {
            return Err(StrataError::Corrupted("kvblk key length"));
        }
        let key = &mm[rp + step..rp + step + klen];
        let val = &mm[rp + step + klen..rp + slot.len as usize];
        Ok((key, val))
    }

    /// Sum of live pair lengths, the payload size in fully compacted form
    pub fn compacted_offset(&self) -> u64 {
        self.pidx.iter().map(|s| s.len as u64).sum()
    }

    /// Minimal block bytes needed to keep all live pairs
    fn compacted_dsize(&self) -> u64 {
        let mut sz = HDRSZ;
        for s in &self.pidx {
            sz += s.len as u64;
            sz += codec::varint_size(s.len as u64) as u64;
            sz += codec::varint_size(s.off) as u64;
        }
        sz
    }

    /// Rewrite the header descriptors if the block is dirty
    pub fn sync_mm(&mut self, mm: &mut [u8]) {
        if !self.dirty {
            return;
        }
        let base = self.addr as usize;
        mm[base] = self.szpow;
        let mut wp = base + HDRSZ as usize;
        for s in &self.pidx {
            wp += codec::write_varint(&mut mm[wp..], s.off);
            wp += codec::write_varint(&mut mm[wp..], s.len as u64);
        }
        self.idxsz = (wp - base - HDRSZ as usize) as u16;
        debug_assert!(self.idxsz <= MAX_IDX_SZ);
        codec::put_u16_le(&mut mm[base + 1..base + 3], self.idxsz);
        self.dirty = false;
    }

    /// Slide every live pair toward the block end, removing holes
    pub fn compact_mm(&mut self, mm: &mut [u8]) {
        if self.compacted_offset() == self.maxoff {
            return;
        }
        let end = self.end();
        let mut order: Vec<usize> = (0..IDXNUM).filter(|&i| self.pidx[i].off > 0).collect();
        order.sort_by_key(|&i| self.pidx[i].off);
        let mut coff = 0u64;
        for &i in &order {
            let len = self.pidx[i].len as u64;
            let noff = coff + len;
            let off = self.pidx[i].off;
            if off > noff {
                mm.copy_within(end - off as usize..end - off as usize + len as usize, end - noff as usize);
                self.pidx[i].off = noff;
            }
            coff = noff;
        }
        self.maxoff = coff;
        self.recompute_zidx();
        self.dirty = true;
        debug_assert_eq!(self.compacted_offset(), self.maxoff);
    }

    fn recompute_zidx(&mut self) {
        self.zidx = self
            .pidx
            .iter()
            .position(|s| s.len == 0)
            .map_or(-1, |i| i as i8);
    }

    fn recompute_maxoff(&mut self) {
        self.maxoff = self.pidx.iter().map(|s| s.off).max().unwrap_or(0);
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Add a key/value pair, compacting or growing the block as needed.
    /// Returns the claimed slot index, or `KvBlockFull` when all 32 slots are
    /// live.
    pub fn add_kv(
        &mut self,
        fsm: &mut Fsm,
        dbflg: DbFlags,
        key: &[u8],
        val: &[u8],
        opflags: PutFlags,
        internal: bool,
    ) -> Result<u8> {
        if self.zidx < 0 {
            return Err(StrataError::KvBlockFull);
        }
        let mut owned_val: Option<Vec<u8>> = None;
        if !internal && dbflg.is_dup() {
            if opflags.contains(PutFlags::DUP_REMOVE) {
                return Err(StrataError::NotFound);
            }
            let elsz = dbflg.dup_elem_size().unwrap();
            if val.len() != elsz {
                return Err(StrataError::DupValueSize);
            }
            let mut buf = Vec::with_capacity(4 + elsz);
            buf.extend_from_slice(&1u32.to_le_bytes());
            buf.extend_from_slice(val);
            owned_val = Some(buf);
        }
        let uval: &[u8] = owned_val.as_deref().unwrap_or(val);
        let psz = codec::varint_size(key.len() as u64) as u64 + key.len() as u64 + uval.len() as u64;
        if psz > MAX_KV_SIZE {
            return Err(StrataError::MaxKvSize);
        }

        let mut compacted = false;
        loop {
            let msz = self
                .size()
                .checked_sub(HDRSZ + self.idxsz as u64 + self.maxoff)
                .ok_or(StrataError::Corrupted("kvblk occupancy exceeds its size"))?;
            let noff = self.maxoff + psz;
            let rsz = psz
                + codec::varint_size(noff) as u64
                + codec::varint_size(psz) as u64;
            if msz < rsz {
                if !compacted {
                    compacted = true;
                    if self.compacted_offset() != self.maxoff {
                        self.compact_mm(fsm.mm_mut()?);
                        continue;
                    }
                }
                // Double the block until the pair fits, then repack the
                // payload against the new end.
                let nsz = (rsz - msz) + self.size();
                let mut npow = self.szpow;
                while (1u64 << npow) < nsz {
                    npow += 1;
                }
                let old_size = self.size();
                let maxoff = self.maxoff;
                let (naddr, nlen) = fsm.reallocate(
                    1u64 << npow,
                    self.addr,
                    old_size,
                    AllocFlags::NO_OVERALLOCATE | AllocFlags::NO_STATS,
                )?;
                debug_assert_eq!(nlen, 1u64 << npow);
                let mm = fsm.mm_mut()?;
                if maxoff > 0 {
                    let src = (naddr + old_size - maxoff) as usize;
                    let dst = (naddr + nlen - maxoff) as usize;
                    mm.copy_within(src..src + maxoff as usize, dst);
                }
                self.addr = naddr;
                self.szpow = npow;
                self.dirty = true;
                continue;
            }
            let idx = self.zidx as usize;
            self.pidx[idx] = Slot { off: noff, len: psz as u32 };
            self.maxoff = noff;
            self.dirty = true;
            self.zidx = self
                .pidx
                .iter()
                .enumerate()
                .position(|(i, s)| s.len == 0 && i != idx)
                .map_or(-1, |i| i as i8);
            let mm = fsm.mm_mut()?;
            let mut wp = (self.addr + self.size() - noff) as usize;
            wp += codec::write_varint(&mut mm[wp..], key.len() as u64);
            mm[wp..wp + key.len()].copy_from_slice(key);
            wp += key.len();
            mm[wp..wp + uval.len()].copy_from_slice(uval);
            return Ok(idx as u8);
        }
    }

    /// Update the value of a live slot. In-place when it fits, growing into
    /// the gap below the neighboring pair when possible, else remove + re-add
    /// (which may compact or resize the block). Returns the slot index, which
    /// changes only on the remove + re-add path.
    pub fn update_kv(
        &mut self,
        fsm: &mut Fsm,
        dbflg: DbFlags,
        idx: usize,
        key: Option<&[u8]>,
        val: &[u8],
        opflags: PutFlags,
        internal: bool,
    ) -> Result<u8> {
        let mut owned_val: Option<Vec<u8>> = None;
        if !internal && dbflg.is_dup() {
            match self.update_dup(fsm, dbflg, idx, val, opflags)? {
                DupOutcome::Done => return Ok(idx as u8),
                DupOutcome::Rewrite(buf) => owned_val = Some(buf),
            }
        }
        let uval: &[u8] = owned_val.as_deref().unwrap_or(val);

        let slot = self.pidx[idx];
        let end = self.end();
        let rp = end - slot.off as usize;
        let (klen, step) = {
            let mm = fsm.mm();
            codec::read_varint(&mm[rp..])?
        };
        let klen = klen as usize;
        if let Some(k) = key {
            let mm = fsm.mm();
            if klen != k.len() || &mm[rp + step..rp + step + klen] != k {
                return Err(StrataError::Corrupted("kvblk update key mismatch"));
            }
        }
        let rsize = codec::varint_size(klen as u64) as u64 + klen as u64 + uval.len() as u64;
        if rsize <= slot.len as u64 {
            let mm = fsm.mm_mut()?;
            let wp = rp + step + klen;
            mm[wp..wp + uval.len()].copy_from_slice(uval);
            let nlen = (step + klen + uval.len()) as u32;
            if nlen != slot.len {
                self.pidx[idx].len = nlen;
                self.dirty = true;
            }
            return Ok(idx as u8);
        }
        // Gap between this pair and the next one toward the block end.
        let prev_off = self
            .pidx
            .iter()
            .map(|s| s.off)
            .filter(|&o| o > 0 && o < slot.off)
            .max()
            .unwrap_or(0);
        if slot.off - prev_off >= rsize {
            let mm = fsm.mm_mut()?;
            let wp = rp + step + klen;
            mm[wp..wp + uval.len()].copy_from_slice(uval);
            self.pidx[idx].len = (step + klen + uval.len()) as u32;
            self.dirty = true;
            return Ok(idx as u8);
        }
        let owned_key = match key {
            Some(k) => k.to_vec(),
            None => self.key_at(idx, fsm.mm())?.to_vec(),
        };
        self.rm_kv(fsm, idx, RmFlags::NO_RESIZE)?;
        self.add_kv(fsm, dbflg, &owned_key, uval, opflags, true)
    }

    /// Clear a slot. Shrinks the block when compacted occupancy drops to half
    /// or less, never below the 512-byte minimum.
    pub fn rm_kv(&mut self, fsm: &mut Fsm, idx: usize, opts: RmFlags) -> Result<()> {
        if self.pidx[idx].off >= self.maxoff {
            self.pidx[idx] = Slot::default();
            self.recompute_maxoff();
        } else {
            self.pidx[idx] = Slot::default();
        }
        self.dirty = true;
        if self.zidx < 0 || (idx as i8) < self.zidx {
            self.zidx = idx as i8;
        }
        let mut opts = opts;
        if !opts.contains(RmFlags::NO_RESIZE) && self.szpow > INISZPOW {
            let dsz = self.compacted_dsize();
            if self.size() >= 2 * dsz {
                let mut npow = self.szpow - 1;
                while npow > INISZPOW && (1u64 << (npow - 1)) >= dsz {
                    npow -= 1;
                }
                self.compact_mm(fsm.mm_mut()?);
                let maxoff = self.maxoff;
                debug_assert!((1u64 << npow) > maxoff);
                let old_size = self.size();
                {
                    // Pre-pack the payload against the shrunken end while the
                    // old extent is still whole.
                    let mm = fsm.mm_mut()?;
                    let src = (self.addr + old_size - maxoff) as usize;
                    let dst = (self.addr + (1u64 << npow) - maxoff) as usize;
                    mm.copy_within(src..src + maxoff as usize, dst);
                }
                let (naddr, nlen) = fsm.reallocate(
                    1u64 << npow,
                    self.addr,
                    old_size,
                    AllocFlags::NO_OVERALLOCATE | AllocFlags::NO_STATS,
                )?;
                debug_assert_eq!(nlen, 1u64 << npow);
                self.addr = naddr;
                self.szpow = npow;
                opts = opts | RmFlags::SYNC;
            }
        }
        if opts.contains(RmFlags::SYNC) {
            self.sync_mm(fsm.mm_mut()?);
        }
        Ok(())
    }

    /// Release the block back to the free-space manager
    pub fn destroy(self, fsm: &mut Fsm) -> Result<()> {
        fsm.deallocate(self.addr, self.size())
    }

    // -------------------------------------------------------------------------
    // Sorted-Duplicate Values
    // -------------------------------------------------------------------------

    /// Apply a duplicate-array insert/remove against the slot value.
    fn update_dup(
        &mut self,
        fsm: &mut Fsm,
        dbflg: DbFlags,
        idx: usize,
        val: &[u8],
        opflags: PutFlags,
    ) -> Result<DupOutcome> {
        let elsz = dbflg.dup_elem_size().unwrap();
        if val.len() != elsz {
            return Err(StrataError::DupValueSize);
        }
        let target = decode_dup_elem(val, elsz);
        let slot = self.pidx[idx];
        let end = self.end();
        let rp = end - slot.off as usize;
        let (klen, step) = {
            let mm = fsm.mm();
            codec::read_varint(&mm[rp..])?
        };
        let vstart = rp + step + klen as usize;
        let vlen = slot.len as usize - step - klen as usize;
        if vlen < 4 {
            return Err(StrataError::Corrupted("dup array header"));
        }
        let count = {
            let mm = fsm.mm();
            codec::get_u32_le(&mm[vstart..vstart + 4]) as usize
        };
        if vlen < 4 + count * elsz {
            return Err(StrataError::Corrupted("dup array count"));
        }
        let avail = vlen - (4 + count * elsz);

        if opflags.contains(PutFlags::DUP_REMOVE) {
            let mm = fsm.mm_mut()?;
            let elems = &mut mm[vstart + 4..vstart + 4 + count * elsz];
            if count == 0 || !dup_sorted_remove(elems, count, elsz, target) {
                return Err(StrataError::NotFound);
            }
            let count = count - 1;
            codec::put_u32_le(&mut mm[vstart..vstart + 4], count as u32);
            if vlen >= (4 + count * elsz) * 2 {
                // Halve the value reserve.
                self.pidx[idx].len = slot.len - (vlen / 2) as u32;
                self.dirty = true;
            }
            return Ok(DupOutcome::Done);
        }

        if avail >= elsz {
            let mm = fsm.mm_mut()?;
            let elems = &mut mm[vstart + 4..vstart + 4 + (count + 1) * elsz];
            if dup_sorted_insert(elems, count, elsz, target) {
                codec::put_u32_le(&mut mm[vstart..vstart + 4], (count + 1) as u32);
            }
            return Ok(DupOutcome::Done);
        }

        // Reserve exhausted: rebuild the value at double size (zero padded)
        // and push it through the regular update path.
        let mut nlen = vlen;
        let mut navail = avail;
        while navail < elsz {
            nlen *= 2;
            navail = nlen - (4 + count * elsz);
        }
        let mut buf = vec![0u8; nlen];
        {
            let mm = fsm.mm();
            buf[..vlen].copy_from_slice(&mm[vstart..vstart + vlen]);
        }
        if dup_sorted_insert(&mut buf[4..4 + (count + 1) * elsz], count, elsz, target) {
            codec::put_u32_le(&mut buf[0..4], (count + 1) as u32);
        }
        Ok(DupOutcome::Rewrite(buf))
    }
}

enum DupOutcome {
    /// Mutated in place, nothing further to write
    Done,
    /// The slot value must be rewritten with this buffer
    Rewrite(Vec<u8>),
}

/// Decode one little-endian array element
pub fn decode_dup_elem(buf: &[u8], elsz: usize) -> u64 {
    if elsz == 4 {
        codec::get_u32_le(buf) as u64
    } else {
        codec::get_u64_le(buf)
    }
}

fn encode_dup_elem(buf: &mut [u8], elsz: usize, v: u64) {
    if elsz == 4 {
        codec::put_u32_le(buf, v as u32);
    } else {
        codec::put_u64_le(buf, v);
    }
}

/// Binary search in a sorted fixed-width array. `Ok(i)` when found.
pub fn dup_sorted_find(elems: &[u8], count: usize, elsz: usize, v: u64) -> std::result::Result<usize, usize> {
    let mut lb = 0usize;
    let mut ub = count;
    while lb < ub {
        let mid = (lb + ub) / 2;
        let e = decode_dup_elem(&elems[mid * elsz..], elsz);
        match e.cmp(&v) {
            std::cmp::Ordering::Equal => return Ok(mid),
            std::cmp::Ordering::Less => lb = mid + 1,
            std::cmp::Ordering::Greater => ub = mid,
        }
    }
    Err(lb)
}

/// Insert into a sorted array, skipping duplicates. `elems` must have room
/// for `count + 1` elements. Returns false when the value was already there.
fn dup_sorted_insert(elems: &mut [u8], count: usize, elsz: usize, v: u64) -> bool {
    match dup_sorted_find(elems, count, elsz, v) {
        Ok(_) => false,
        Err(pos) => {
            elems.copy_within(pos * elsz..count * elsz, (pos + 1) * elsz);
            encode_dup_elem(&mut elems[pos * elsz..], elsz, v);
            true
        }
    }
}

/// Remove from a sorted array. Returns false when the value was absent.
fn dup_sorted_remove(elems: &mut [u8], count: usize, elsz: usize, v: u64) -> bool {
    match dup_sorted_find(elems, count, elsz, v) {
        Ok(pos) => {
            elems.copy_within((pos + 1) * elsz..count * elsz, pos * elsz);
            true
        }
        Err(_) => false,
    }
}
