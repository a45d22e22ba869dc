//! Free-space manager
//!
//! Owns every byte range of the block file that is not allocated to a live
//! entity. Free space is tracked twice: a persistent bitmap inside the file
//! (one bit per block, set = allocated) and an in-memory best-fit tree of
//! free extents rebuilt from the bitmap on open.
//!
//! ## Responsibilities
//! - Persist its own metadata in the reserved header area
//! - Service allocate/deallocate/reallocate with alignment and locality hints
//! - Grow the bitmap (doubling) when the addressable range is exhausted
//! - Relocate the bitmap downward and trim the file tail on close
//! - Expose the custom user header region without further locking

pub mod bitmap;
pub mod extent;

use std::path::PathBuf;

use crate::blockfile::{round_up, BlockFile, BlockFileOpts, SyncFlags, BLOCK_POW};
use crate::codec;
use crate::error::{Result, StrataError};

use extent::{Extent, FreeTree};

/// FSM meta block magic
const FSM_MAGIC: u32 = 0x19cc7cc;

/// Serialized meta length:
/// `[magic:u32][bpow:u8][bmoff:u64][bmlen:u64][crzsum:u64][crznum:u32]
///  [crzvar:u64][reserved:32B][hdrlen:u32]`
pub const FSM_META_LEN: usize = 4 + 1 + 8 + 8 + 8 + 4 + 8 + 32 + 4;

/// Largest supported block size: 1 MiB
const MAX_BLOCK_POW: u8 = 20;

/// Allocation statistics reset threshold
const MAX_STATS_COUNT: u32 = 0xffff;

/// Allocation option flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags(u8);

impl AllocFlags {
    /// Split oversized extents instead of absorbing the remainder
    pub const NO_OVERALLOCATE: AllocFlags = AllocFlags(0x01);
    /// Fail with `NoFreeSpace` instead of growing the bitmap
    pub const NO_EXTEND: AllocFlags = AllocFlags(0x02);
    /// Return a page-aligned extent
    pub const PAGE_ALIGNED: AllocFlags = AllocFlags(0x04);
    /// Leave the allocation size distribution untouched
    pub const NO_STATS: AllocFlags = AllocFlags(0x08);
    /// Zero-fill the allocated range
    pub const ZEROED: AllocFlags = AllocFlags(0x10);

    pub fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AllocFlags {
    type Output = AllocFlags;
    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

/// Open options for an [`Fsm`]
#[derive(Debug, Clone)]
pub struct FsmOptions {
    pub path: PathBuf,
    /// Block size as a power of two; 6 (64-byte blocks) by default
    pub bpow: u8,
    /// Length of the custom user header region in bytes
    pub hdrlen: u32,
    pub truncate: bool,
    pub rdonly: bool,
    pub no_lock: bool,
    /// Verify every bitmap transition
    pub strict: bool,
}

impl Default for FsmOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./strata.fsm"),
            bpow: BLOCK_POW,
            hdrlen: 0,
            truncate: false,
            rdonly: false,
            no_lock: false,
            strict: false,
        }
    }
}

/// Point-in-time snapshot of the manager state
#[derive(Debug, Clone, Copy)]
pub struct FsmState {
    pub block_size: u64,
    /// Number of blocks addressable by the current bitmap
    pub total_blocks: u64,
    pub allocated_blocks: u64,
    pub free_blocks: u64,
    pub free_segments: usize,
    pub file_size: u64,
    pub hdrlen: u32,
    pub avg_alloc_blocks: f64,
    pub alloc_dispersion: f64,
}

/// The free-space manager over a block file
pub struct Fsm {
    file: BlockFile,
    bpow: u8,
    /// Full header length: meta + user header, block aligned
    hdrlen: u32,
    /// Bitmap byte offset, page aligned
    bmoff: u64,
    /// Bitmap byte length, page aligned
    bmlen: u64,
    tree: FreeTree,
    /// Cumulative sum of allocation sizes in blocks
    crzsum: u64,
    /// Cumulative number of allocations
    crznum: u32,
    /// Allocation size variance, `deviation^2 * N`
    crzvar: u64,
    strict: bool,
}

impl Fsm {
    /// Open or create the manager over the given file
    pub fn open(opts: &FsmOptions) -> Result<Fsm> {
        if opts.bpow == 0 || opts.bpow > MAX_BLOCK_POW {
            return Err(StrataError::InvalidBlockSize);
        }
        let file = BlockFile::open(&BlockFileOpts {
            path: opts.path.clone(),
            truncate: opts.truncate,
            rdonly: opts.rdonly,
            no_lock: opts.no_lock,
        })?;
        if (1u64 << opts.bpow) > file.page_size() {
            return Err(StrataError::PlatformPage);
        }
        let mut fsm = Fsm {
            file,
            bpow: opts.bpow,
            hdrlen: 0,
            bmoff: 0,
            bmlen: 0,
            tree: FreeTree::new(),
            crzsum: 0,
            crznum: 0,
            crzvar: 0,
            strict: opts.strict,
        };
        if fsm.file.is_new() {
            if fsm.file.is_rdonly() {
                return Err(StrataError::InvalidFileMeta);
            }
            fsm.init_new(opts)?;
        } else {
            fsm.init_existing()?;
        }
        Ok(fsm)
    }

    fn init_new(&mut self, opts: &FsmOptions) -> Result<()> {
        let bsize = self.block_size();
        let psize = self.file.page_size();
        self.hdrlen = round_up(opts.hdrlen as u64 + FSM_META_LEN as u64, bsize) as u32;
        let bmoff = round_up(self.hdrlen as u64, psize);
        let bmlen = psize;
        self.file.ensure_size(bmoff + bmlen)?;
        self.init_bitmap(bmoff, bmlen)
    }

    fn init_existing(&mut self) -> Result<()> {
        self.read_meta()?;
        if (self.bmoff + self.bmlen) > self.file.len() {
            return Err(StrataError::InvalidFileMeta);
        }
        self.reload_tree();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn block_size(&self) -> u64 {
        1u64 << self.bpow
    }

    pub fn is_rdonly(&self) -> bool {
        self.file.is_rdonly()
    }

    /// True when the backing file was created by this open
    pub fn is_new(&self) -> bool {
        self.file.is_new()
    }

    pub fn file_size(&self) -> u64 {
        self.file.len()
    }

    /// The whole mapped file as a shared slice
    pub fn mm(&self) -> &[u8] {
        self.file.mm()
    }

    /// The whole mapped file as a mutable slice
    pub fn mm_mut(&mut self) -> Result<&mut [u8]> {
        self.file.mm_mut()
    }

    pub fn state(&self) -> FsmState {
        let bm = self.bm_slice();
        FsmState {
            block_size: self.block_size(),
            total_blocks: self.bmlen * 8,
            allocated_blocks: bitmap::count_set(bm),
            free_blocks: self.tree.total_free(),
            free_segments: self.tree.len(),
            file_size: self.file.len(),
            hdrlen: self.hdrlen,
            avg_alloc_blocks: if self.crznum > 0 {
                self.crzsum as f64 / self.crznum as f64
            } else {
                0.0
            },
            alloc_dispersion: if self.crznum > 0 {
                self.crzvar as f64 / self.crznum as f64
            } else {
                0.0
            },
        }
    }

    fn bm_slice(&self) -> &[u8] {
        &self.file.mm()[self.bmoff as usize..(self.bmoff + self.bmlen) as usize]
    }

    // -------------------------------------------------------------------------
    // Meta Block
    // -------------------------------------------------------------------------

    fn write_meta(&mut self) -> Result<()> {
        let mut hdr = [0u8; FSM_META_LEN];
        codec::put_u32_be(&mut hdr[0..4], FSM_MAGIC);
        hdr[4] = self.bpow;
        codec::put_u64_be(&mut hdr[5..13], self.bmoff);
        codec::put_u64_be(&mut hdr[13..21], self.bmlen);
        codec::put_u64_be(&mut hdr[21..29], self.crzsum);
        codec::put_u32_be(&mut hdr[29..33], self.crznum);
        codec::put_u64_be(&mut hdr[33..41], self.crzvar);
        // 32 reserved bytes
        codec::put_u32_be(&mut hdr[73..77], self.hdrlen);
        let mm = self.file.mm_mut()?;
        mm[0..FSM_META_LEN].copy_from_slice(&hdr);
        Ok(())
    }

    fn read_meta(&mut self) -> Result<()> {
        let mut hdr = [0u8; FSM_META_LEN];
        let n = self.file.read(0, &mut hdr)?;
        if n < FSM_META_LEN {
            return Err(StrataError::InvalidFileMeta);
        }
        if codec::get_u32_be(&hdr[0..4]) != FSM_MAGIC {
            return Err(StrataError::InvalidFileMeta);
        }
        let bpow = hdr[4];
        if bpow == 0 || bpow > MAX_BLOCK_POW {
            return Err(StrataError::InvalidFileMeta);
        }
        if (1u64 << bpow) > self.file.page_size() {
            return Err(StrataError::PlatformPage);
        }
        self.bpow = bpow;
        self.bmoff = codec::get_u64_be(&hdr[5..13]);
        self.bmlen = codec::get_u64_be(&hdr[13..21]);
        if self.bmlen == 0 || self.bmlen % 8 != 0 {
            return Err(StrataError::InvalidFileMeta);
        }
        self.crzsum = codec::get_u64_be(&hdr[21..29]);
        self.crznum = codec::get_u32_be(&hdr[29..33]);
        self.crzvar = codec::get_u64_be(&hdr[33..41]);
        self.hdrlen = codec::get_u32_be(&hdr[73..77]);
        if (self.hdrlen as usize) < FSM_META_LEN {
            return Err(StrataError::InvalidFileMeta);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Custom User Header
    // -------------------------------------------------------------------------

    /// Write into the reserved user header region
    pub fn writehdr(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = FSM_META_LEN as u64 + off + buf.len() as u64;
        if end > self.hdrlen as u64 {
            return Err(StrataError::OutOfBounds);
        }
        let start = FSM_META_LEN + off as usize;
        let mm = self.file.mm_mut()?;
        mm[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    /// Read from the reserved user header region
    pub fn readhdr(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = FSM_META_LEN as u64 + off + buf.len() as u64;
        if end > self.hdrlen as u64 {
            return Err(StrataError::OutOfBounds);
        }
        let start = FSM_META_LEN + off as usize;
        buf.copy_from_slice(&self.file.mm()[start..start + buf.len()]);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Positional I/O with strict-mode allocation guards
    // -------------------------------------------------------------------------

    /// Positional read; in strict mode the whole range must be allocated
    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        if self.strict && !self.check_allocated(off, buf.len() as u64) {
            return Err(StrataError::Segmentation);
        }
        self.file.read(off, buf)
    }

    /// Positional write; in strict mode the whole range must be allocated
    pub fn write(&self, off: u64, buf: &[u8]) -> Result<usize> {
        if self.strict && !self.check_allocated(off, buf.len() as u64) {
            return Err(StrataError::Segmentation);
        }
        self.file.write(off, buf)
    }

    /// True when every block covering `[addr, addr+len)` is allocated
    pub fn check_allocated(&self, addr: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let first = addr >> self.bpow;
        let blocks = round_up(len, self.block_size()) >> self.bpow;
        bitmap::test_range(self.bm_slice(), first, blocks, true)
    }

    /// Flush file data and mmap pages
    pub fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        if self.file.is_rdonly() {
            return Err(StrataError::ReadOnly);
        }
        self.write_meta()?;
        self.file.sync(flags)
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate `len` bytes of contiguous blocks. Returns the byte address
    /// and the actual byte length, which may exceed the request when the
    /// overallocation heuristic absorbs an extent remainder.
    pub fn allocate(&mut self, len: u64, opts: AllocFlags) -> Result<(u64, u64)> {
        self.allocate_near(len, 0, opts)
    }

    /// Allocate with a locality hint: the returned extent is the best fit
    /// nearest to `hint_addr`.
    pub fn allocate_near(&mut self, len: u64, hint_addr: u64, opts: AllocFlags) -> Result<(u64, u64)> {
        if self.file.is_rdonly() {
            return Err(StrataError::ReadOnly);
        }
        if len == 0 {
            return Err(StrataError::InvalidArgs("zero-length allocation"));
        }
        let blocks = round_up(len, self.block_size()) >> self.bpow;
        let (off_blk, len_blk) = if opts.contains(AllocFlags::PAGE_ALIGNED) {
            self.allocate_aligned_blocks(blocks, u64::MAX, opts)?
        } else {
            self.allocate_blocks(blocks, hint_addr >> self.bpow, opts)?
        };
        let addr = off_blk << self.bpow;
        let alen = len_blk << self.bpow;
        if opts.contains(AllocFlags::ZEROED) {
            let range = addr as usize..(addr + alen) as usize;
            self.file.mm_mut()?[range].fill(0);
        }
        Ok((addr, alen))
    }

    fn allocate_blocks(&mut self, blocks: u64, hint_blk: u64, opts: AllocFlags) -> Result<(u64, u64)> {
        loop {
            let Some(ext) = self.tree.find_best_fit(hint_blk, blocks) else {
                if opts.contains(AllocFlags::NO_EXTEND) {
                    return Err(StrataError::NoFreeSpace);
                }
                self.resize_bitmap(self.bmlen * 2)?;
                continue;
            };
            self.tree.remove(&ext);
            let mut take = blocks;
            if ext.len > blocks {
                if !opts.contains(AllocFlags::NO_OVERALLOCATE) && self.crznum > 0 {
                    // Absorb the remainder when it is far below the running
                    // allocation size distribution: (avg - rest)^2 > 6*var.
                    let avg = self.crzsum as f64 / self.crznum as f64;
                    let d = avg - (ext.len - blocks) as f64;
                    let s = (self.crzvar as f64 / self.crznum as f64) * 6.0;
                    if s > 1.0 && d > 0.0 && d * d > s {
                        take = ext.len;
                    } else {
                        self.tree.insert(Extent::new(ext.off + blocks, ext.len - blocks));
                    }
                } else {
                    self.tree.insert(Extent::new(ext.off + blocks, ext.len - blocks));
                }
            }
            if let Err(e) = self.commit_allocation(ext.off, take) {
                // restore the tree before surfacing the failure
                if take < ext.len {
                    self.tree.remove(&Extent::new(ext.off + blocks, ext.len - blocks));
                }
                self.tree.insert(ext);
                return Err(e);
            }
            if !opts.contains(AllocFlags::NO_STATS) {
                self.update_stats(blocks);
            }
            return Ok((ext.off, take));
        }
    }

    /// Allocate a page-aligned extent with an offset not above
    /// `max_offset_blk`. Never grows the bitmap.
    fn allocate_aligned_blocks(&mut self, blocks: u64, max_offset_blk: u64, opts: AllocFlags) -> Result<(u64, u64)> {
        let psize_blk = self.file.page_size() >> self.bpow;
        // Fast path: a best-fit probe padded by one page usually leaves room
        // to round the offset up.
        let mut pick = None;
        for probe in [blocks + psize_blk, blocks] {
            if let Some(ext) = self.tree.find_best_fit(0, probe) {
                let noff = round_up(ext.off, psize_blk);
                if noff <= max_offset_blk && noff < ext.end() && ext.end() - noff >= blocks {
                    pick = Some(ext);
                    break;
                }
            }
        }
        // Fall back to a full scan for the lowest-offset extent that fits.
        if pick.is_none() {
            let mut best: Option<Extent> = None;
            for e in self.tree.iter() {
                let noff = round_up(e.off, psize_blk);
                if noff <= max_offset_blk && noff < e.end() && e.end() - noff >= blocks {
                    if best.map_or(true, |b| e.off < b.off) {
                        best = Some(*e);
                    }
                }
            }
            pick = best;
        }
        let Some(ext) = pick else {
            return Err(StrataError::NoFreeSpace);
        };
        let noff = round_up(ext.off, psize_blk);
        self.tree.remove(&ext);
        if noff > ext.off {
            self.tree.insert(Extent::new(ext.off, noff - ext.off));
        }
        if ext.end() > noff + blocks {
            self.tree.insert(Extent::new(noff + blocks, ext.end() - (noff + blocks)));
        }
        if let Err(e) = self.commit_allocation(noff, blocks) {
            if noff > ext.off {
                self.tree.remove(&Extent::new(ext.off, noff - ext.off));
            }
            if ext.end() > noff + blocks {
                self.tree.remove(&Extent::new(noff + blocks, ext.end() - (noff + blocks)));
            }
            self.tree.insert(ext);
            return Err(e);
        }
        if !opts.contains(AllocFlags::NO_STATS) {
            self.update_stats(blocks);
        }
        Ok((noff, blocks))
    }

    /// Grow the file over the chosen extent and flip its bits to allocated
    fn commit_allocation(&mut self, off_blk: u64, len_blk: u64) -> Result<()> {
        let end = (off_blk + len_blk) << self.bpow;
        self.file.ensure_size(end)?;
        let (bmoff, bmlen, strict) = (self.bmoff as usize, self.bmlen as usize, self.strict);
        let mm = self.file.mm_mut()?;
        bitmap::set_range(&mut mm[bmoff..bmoff + bmlen], off_blk, len_blk, true, strict)
    }

    fn update_stats(&mut self, blocks: u64) {
        if self.crznum > MAX_STATS_COUNT {
            self.crznum = 0;
            self.crzsum = 0;
            self.crzvar = 0;
        }
        self.crznum += 1;
        self.crzsum += blocks;
        let avg = self.crzsum as f64 / self.crznum as f64;
        let dev = blocks as f64 - avg;
        self.crzvar += (dev * dev + 0.5) as u64;
    }

    // -------------------------------------------------------------------------
    // Deallocation
    // -------------------------------------------------------------------------

    /// Return `[addr, addr+len)` to the free pool, merging with any adjacent
    /// free extent.
    pub fn deallocate(&mut self, addr: u64, len: u64) -> Result<()> {
        if self.file.is_rdonly() {
            return Err(StrataError::ReadOnly);
        }
        if addr & (self.block_size() - 1) != 0 {
            return Err(StrataError::RangeNotAligned);
        }
        let off_blk = addr >> self.bpow;
        let len_blk = round_up(len, self.block_size()) >> self.bpow;
        self.deallocate_blocks(off_blk, len_blk)
    }

    fn deallocate_blocks(&mut self, off_blk: u64, len_blk: u64) -> Result<()> {
        let (bmoff, bmlen, strict) = (self.bmoff as usize, self.bmlen as usize, self.strict);
        let mm = self.file.mm_mut()?;
        let bm = &mut mm[bmoff..bmoff + bmlen];
        bitmap::set_range(bm, off_blk, len_blk, false, strict)?;

        let total_bits = (bmlen as u64) * 8;
        let mut key_off = off_blk;
        let mut key_len = len_blk;
        // Merge left: the clear run between the previous set bit and us is a
        // registered extent.
        let left_edge = match bitmap::find_prev_set_bit(bm, off_blk, 0) {
            Some(bit) => bit + 1,
            None => 0,
        };
        if left_edge < off_blk {
            let rm = Extent::new(left_edge, off_blk - left_edge);
            debug_assert!(self.tree.contains(&rm));
            self.tree.remove(&rm);
            key_off = rm.off;
            key_len += rm.len;
        }
        // Merge right symmetrically.
        let end = off_blk + len_blk;
        let right_edge = bitmap::find_next_set_bit(bm, end, total_bits).unwrap_or(total_bits);
        if right_edge > end {
            let rm = Extent::new(end, right_edge - end);
            debug_assert!(self.tree.contains(&rm));
            self.tree.remove(&rm);
            key_len += rm.len;
        }
        self.tree.insert(Extent::new(key_off, key_len));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reallocation
    // -------------------------------------------------------------------------

    /// Grow or shrink an allocated extent. The extent stays in place when the
    /// free pool allows it; otherwise the content (up to `min(old, new)`
    /// bytes) moves to the returned address.
    pub fn reallocate(&mut self, nlen: u64, addr: u64, cur_len: u64, opts: AllocFlags) -> Result<(u64, u64)> {
        if self.file.is_rdonly() {
            return Err(StrataError::ReadOnly);
        }
        if addr & (self.block_size() - 1) != 0 {
            return Err(StrataError::RangeNotAligned);
        }
        self.deallocate(addr, cur_len)?;
        let alloc_opts = AllocFlags(opts.0 & !AllocFlags::ZEROED.0);
        let (naddr, nalen) = self.allocate_near(nlen, addr, alloc_opts)?;
        if naddr != addr {
            let copy = cur_len.min(nalen) as usize;
            let mm = self.file.mm_mut()?;
            mm.copy_within(addr as usize..addr as usize + copy, naddr as usize);
        }
        if opts.contains(AllocFlags::ZEROED) && nalen > cur_len {
            let start = (naddr + cur_len) as usize;
            let end = (naddr + nalen) as usize;
            self.file.mm_mut()?[start..end].fill(0);
        }
        Ok((naddr, nalen))
    }

    // -------------------------------------------------------------------------
    // Bitmap Lifecycle
    // -------------------------------------------------------------------------

    /// Install the bitmap at `[bmoff, bmoff+bmlen)`, carrying over the old
    /// content, and rebuild the extent tree.
    fn init_bitmap(&mut self, bmoff: u64, bmlen: u64) -> Result<()> {
        let bsize = self.block_size();
        let psize = self.file.page_size();
        if bmlen & (bsize - 1) != 0 || bmoff & (bsize - 1) != 0 || bmoff & (psize - 1) != 0 {
            return Err(StrataError::RangeNotAligned);
        }
        if bmlen < self.bmlen {
            return Err(StrataError::InvalidArgs("bitmap must not shrink"));
        }
        // The bitmap must address at least itself and the header.
        if bmlen * 8 < ((bmoff + bmlen) >> self.bpow) + 1 {
            return Err(StrataError::InvalidArgs("bitmap too small for its own range"));
        }
        let (old_bmoff, old_bmlen) = (self.bmoff, self.bmlen);
        {
            let mm = self.file.mm_mut()?;
            if old_bmlen > 0 {
                mm.copy_within(
                    old_bmoff as usize..(old_bmoff + old_bmlen) as usize,
                    bmoff as usize,
                );
                let tail = (bmoff + old_bmlen) as usize..(bmoff + bmlen) as usize;
                mm[tail].fill(0);
            } else {
                mm[bmoff as usize..(bmoff + bmlen) as usize].fill(0);
            }
        }
        self.bmoff = bmoff;
        self.bmlen = bmlen;
        {
            let (bpow, hdrlen) = (self.bpow, self.hdrlen);
            let mm = self.file.mm_mut()?;
            let bm = &mut mm[bmoff as usize..(bmoff + bmlen) as usize];
            bitmap::set_range(bm, bmoff >> bpow, bmlen >> bpow, true, false)?;
            if old_bmlen == 0 {
                // First-time initialization also claims the header area.
                bitmap::set_range(bm, 0, (hdrlen as u64) >> bpow, true, false)?;
            }
        }
        self.reload_tree();
        self.write_meta()?;
        if old_bmlen > 0 {
            self.deallocate_blocks(old_bmoff >> self.bpow, old_bmlen >> self.bpow)?;
        }
        Ok(())
    }

    /// Rebuild the extent tree from the bitmap
    fn reload_tree(&mut self) {
        let bm = self.bm_slice();
        let bits = (self.bmlen as u64) * 8;
        let mut extents = Vec::new();
        let mut run_start: Option<u64> = None;
        let mut bit = 0u64;
        while bit < bits {
            let byte = bm[(bit / 8) as usize];
            if byte == 0 {
                if run_start.is_none() {
                    run_start = Some(bit);
                }
                bit += 8;
                continue;
            }
            if byte == 0xff {
                if let Some(start) = run_start.take() {
                    extents.push(Extent::new(start, bit - start));
                }
                bit += 8;
                continue;
            }
            for i in 0..8 {
                if byte & (1 << i) != 0 {
                    if let Some(start) = run_start.take() {
                        extents.push(Extent::new(start, bit + i - start));
                    }
                } else if run_start.is_none() {
                    run_start = Some(bit + i);
                }
            }
            bit += 8;
        }
        if let Some(start) = run_start {
            extents.push(Extent::new(start, bits - start));
        }
        self.tree.clear();
        for e in extents {
            self.tree.insert(e);
        }
    }

    /// Double the bitmap: allocate aligned space for the new area from the
    /// pool itself, or append past the current addressable range.
    fn resize_bitmap(&mut self, size: u64) -> Result<()> {
        if self.bmlen >= size {
            return Ok(());
        }
        let psize = self.file.page_size();
        let bmlen = round_up(size, psize);
        let blocks = bmlen >> self.bpow;
        let bmoff = match self.allocate_aligned_blocks(
            blocks,
            u64::MAX,
            AllocFlags::NO_STATS | AllocFlags::NO_EXTEND | AllocFlags::NO_OVERALLOCATE,
        ) {
            Ok((off_blk, _)) => off_blk << self.bpow,
            Err(StrataError::NoFreeSpace) => {
                // Past the end of the addressable range.
                let off = round_up(self.bmlen * 8 * self.block_size(), psize);
                self.file.ensure_size(off + bmlen)?;
                off
            }
            Err(e) => return Err(e),
        };
        self.file.ensure_size(bmoff + bmlen)?;
        tracing::debug!(
            "fsm bitmap grows to {} bytes at offset {}",
            bmlen,
            bmoff
        );
        self.init_bitmap(bmoff, bmlen)
    }

    // -------------------------------------------------------------------------
    // Close / Trim
    // -------------------------------------------------------------------------

    /// Relocate the bitmap to the lowest suitable free extent, then cut all
    /// trailing free blocks off the file.
    fn trim_tail(&mut self) -> Result<()> {
        if self.file.is_rdonly() {
            return Ok(());
        }
        let max_off_blk = self.bmoff >> self.bpow;
        match self.allocate_aligned_blocks(
            self.bmlen >> self.bpow,
            max_off_blk,
            AllocFlags::NO_EXTEND | AllocFlags::NO_OVERALLOCATE | AllocFlags::NO_STATS,
        ) {
            Ok((off_blk, len_blk)) => {
                let off = off_blk << self.bpow;
                if off < self.bmoff {
                    self.init_bitmap(off, len_blk << self.bpow)?;
                } else {
                    self.deallocate_blocks(off_blk, len_blk)?;
                }
            }
            Err(StrataError::NoFreeSpace) => {}
            Err(e) => return Err(e),
        }
        let total_bits = self.bmlen * 8;
        if let Some(last) = bitmap::find_prev_set_bit(self.bm_slice(), total_bits, 0) {
            let cut = (last + 1) << self.bpow;
            if cut < self.file.len() {
                self.file.truncate(cut)?;
            }
        }
        Ok(())
    }

    /// Flush state and close the file, trimming trailing free space
    pub fn close(&mut self) -> Result<()> {
        if !self.file.is_rdonly() {
            self.trim_tail()?;
            self.write_meta()?;
            self.file.sync(SyncFlags::default())?;
        }
        self.file.unmap();
        Ok(())
    }
}
