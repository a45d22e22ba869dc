//! Block file
//!
//! The backing file of a store: block-granular persistent storage with a
//! whole-file memory-mapped window.
//!
//! ## Responsibilities
//! - Open/create the file and hold the advisory lock
//! - Positional read/write through the OS file handle
//! - Grow the file by a Fibonacci-like policy, remapping the window
//! - Flush file data and mmap pages on request

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use memmap2::{Mmap, MmapMut};

use crate::error::{Result, StrataError};

/// Block size as a power of two: 64-byte blocks
pub const BLOCK_POW: u8 = 6;

/// Block size in bytes
pub const BLOCK_SIZE: u64 = 1 << BLOCK_POW;

/// Maximum backing file size: ~255 GiB, block aligned
pub const MAX_FILE_SIZE: u64 = 0x3f_ffff_ffc0;

/// Convert a byte address to a block number
pub fn addr2blk(addr: u64) -> u32 {
    (addr >> BLOCK_POW) as u32
}

/// Convert a block number to a byte address
pub fn blk2addr(blk: u32) -> u64 {
    (blk as u64) << BLOCK_POW
}

/// Sync flags for [`BlockFile::sync`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFlags(u8);

impl SyncFlags {
    /// Flush file data only (`fdatasync`), skipping metadata
    pub const DATA: SyncFlags = SyncFlags(0x01);
    /// Skip syncing mmap pages
    pub const NO_MMAP: SyncFlags = SyncFlags(0x02);

    pub fn contains(self, other: SyncFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SyncFlags {
    type Output = SyncFlags;
    fn bitor(self, rhs: SyncFlags) -> SyncFlags {
        SyncFlags(self.0 | rhs.0)
    }
}

/// The mapped window over the whole file. Read-only stores map shared
/// read-only pages; writable stores map shared writable pages.
enum MapWindow {
    Ro(Mmap),
    Rw(MmapMut),
    /// Transient state while remapping or after close
    None,
}

/// Open options for a [`BlockFile`]
#[derive(Debug, Clone)]
pub struct BlockFileOpts {
    pub path: PathBuf,
    /// Create the file if missing and truncate it to zero length
    pub truncate: bool,
    /// Open without write access
    pub rdonly: bool,
    /// Skip the advisory `flock`
    pub no_lock: bool,
}

/// A block-grained file with a sliding (whole-file) mmap window
pub struct BlockFile {
    file: File,
    map: MapWindow,
    /// Current file length in bytes
    fsize: u64,
    /// Previous file length, for the Fibonacci growth policy
    prev_fsize: u64,
    /// True when the file was created (or truncated) by this open
    created: bool,
    rdonly: bool,
    locked: bool,
    /// System page size
    psize: u64,
}

impl BlockFile {
    /// Open or create the backing file and map it.
    ///
    /// A brand-new (or truncated) file is grown to one page before mapping so
    /// the window is never empty.
    pub fn open(opts: &BlockFileOpts) -> Result<Self> {
        let existed = opts.path.exists();
        let file = if opts.rdonly && !opts.truncate {
            OpenOptions::new().read(true).open(&opts.path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(opts.truncate)
                .open(&opts.path)?
        };

        let mut locked = false;
        if !opts.no_lock {
            Self::flock(&file, opts.rdonly && !opts.truncate)?;
            locked = true;
        }

        let psize = page_size();
        let mut fsize = file.metadata()?.len();
        let created = !existed || opts.truncate || fsize == 0;
        if fsize == 0 {
            if opts.rdonly && !opts.truncate {
                return Err(StrataError::InvalidFileMeta);
            }
            file.set_len(psize)?;
            fsize = psize;
        }

        let mut bf = BlockFile {
            file,
            map: MapWindow::None,
            fsize,
            prev_fsize: 0,
            created,
            rdonly: opts.rdonly && !opts.truncate,
            locked,
            psize,
        };
        bf.remap()?;
        Ok(bf)
    }

    fn flock(file: &File, shared: bool) -> Result<()> {
        let op = if shared { libc::LOCK_SH } else { libc::LOCK_EX } | libc::LOCK_NB;
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            return Err(StrataError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn remap(&mut self) -> Result<()> {
        self.map = MapWindow::None;
        self.map = if self.rdonly {
            MapWindow::Ro(unsafe { Mmap::map(&self.file)? })
        } else {
            MapWindow::Rw(unsafe { MmapMut::map_mut(&self.file)? })
        };
        Ok(())
    }

    /// True when the file was created (or truncated) by this open
    pub fn is_new(&self) -> bool {
        self.created
    }

    pub fn is_rdonly(&self) -> bool {
        self.rdonly
    }

    /// Current file length in bytes
    pub fn len(&self) -> u64 {
        self.fsize
    }

    pub fn is_empty(&self) -> bool {
        self.fsize == 0
    }

    /// System page size in bytes
    pub fn page_size(&self) -> u64 {
        self.psize
    }

    /// The mapped window as a shared slice
    pub fn mm(&self) -> &[u8] {
        match &self.map {
            MapWindow::Ro(m) => &m[..],
            MapWindow::Rw(m) => &m[..],
            MapWindow::None => &[],
        }
    }

    /// The mapped window as a mutable slice. Fails on read-only stores.
    pub fn mm_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.map {
            MapWindow::Rw(m) => Ok(&mut m[..]),
            MapWindow::Ro(_) => Err(StrataError::ReadOnly),
            MapWindow::None => Err(StrataError::InvalidState("file is closed")),
        }
    }

    /// Positional read through the file handle. Returns the number of bytes
    /// read, short at EOF.
    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.read_at(&mut buf[done..], off + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Positional write through the file handle
    pub fn write(&self, off: u64, buf: &[u8]) -> Result<usize> {
        if self.rdonly {
            return Err(StrataError::ReadOnly);
        }
        self.file.write_all_at(buf, off)?;
        Ok(buf.len())
    }

    /// Grow the file so that its length is at least `nsize` bytes.
    ///
    /// Growth follows a Fibonacci-like schedule: the new length is the sum of
    /// the current and previous lengths (roughly doubling per step), rounded
    /// up to the page size, never less than `nsize`, and capped at
    /// [`MAX_FILE_SIZE`]. The mmap window is re-established after growth.
    pub fn ensure_size(&mut self, nsize: u64) -> Result<()> {
        if nsize <= self.fsize {
            return Ok(());
        }
        if self.rdonly {
            return Err(StrataError::ReadOnly);
        }
        if nsize > MAX_FILE_SIZE {
            return Err(StrataError::MaxDbSize);
        }
        let fib = self.fsize.saturating_add(self.prev_fsize.max(self.psize));
        let mut target = round_up(fib.max(nsize), self.psize);
        if target > MAX_FILE_SIZE {
            target = MAX_FILE_SIZE & !(self.psize - 1);
            if target < nsize {
                return Err(StrataError::MaxDbSize);
            }
        }
        self.file.set_len(target)?;
        self.prev_fsize = self.fsize;
        self.fsize = target;
        self.remap()
    }

    /// Shrink the file to exactly `nsize` bytes, remapping the window
    pub fn truncate(&mut self, nsize: u64) -> Result<()> {
        if self.rdonly {
            return Err(StrataError::ReadOnly);
        }
        if nsize >= self.fsize {
            return Ok(());
        }
        // Drop the window first so no mapped page extends past the new end.
        self.map = MapWindow::None;
        self.file.set_len(nsize)?;
        self.fsize = nsize;
        self.prev_fsize = 0;
        self.remap()
    }

    /// Flush mmap pages and file data to disk
    pub fn sync(&self, flags: SyncFlags) -> Result<()> {
        if self.rdonly {
            return Err(StrataError::ReadOnly);
        }
        if !flags.contains(SyncFlags::NO_MMAP) {
            if let MapWindow::Rw(m) = &self.map {
                m.flush()?;
            }
        }
        if flags.contains(SyncFlags::DATA) {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Release the mmap window ahead of close so the final truncate does not
    /// race live mappings.
    pub fn unmap(&mut self) {
        self.map = MapWindow::None;
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        self.map = MapWindow::None;
        if self.locked {
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Round `v` up to the next multiple of `to` (a power of two)
pub fn round_up(v: u64, to: u64) -> u64 {
    (v + to - 1) & !(to - 1)
}

fn page_size() -> u64 {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps <= 0 {
        4096
    } else {
        ps as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp(truncate: bool) -> (TempDir, BlockFile) {
        let dir = TempDir::new().unwrap();
        let bf = BlockFile::open(&BlockFileOpts {
            path: dir.path().join("blocks.db"),
            truncate,
            rdonly: false,
            no_lock: false,
        })
        .unwrap();
        (dir, bf)
    }

    #[test]
    fn test_open_creates_one_page() {
        let (_dir, bf) = open_temp(true);
        assert!(bf.is_new());
        assert_eq!(bf.len(), bf.page_size());
        assert_eq!(bf.mm().len() as u64, bf.len());
    }

    #[test]
    fn test_read_write_roundtrip() {
        let (_dir, bf) = open_temp(true);
        bf.write(128, b"hello blocks").unwrap();
        let mut buf = [0u8; 12];
        let n = bf.read(128, &mut buf).unwrap();
        assert_eq!(n, 12);
        assert_eq!(&buf, b"hello blocks");
    }

    #[test]
    fn test_short_read_at_eof() {
        let (_dir, bf) = open_temp(true);
        let len = bf.len();
        let mut buf = [0u8; 64];
        let n = bf.read(len - 16, &mut buf).unwrap();
        assert_eq!(n, 16);
    }

    #[test]
    fn test_ensure_size_grows_roughly_fibonacci() {
        let (_dir, mut bf) = open_temp(true);
        let p = bf.page_size();
        bf.ensure_size(p + 1).unwrap();
        let first = bf.len();
        assert!(first >= p + 1);
        assert_eq!(first % p, 0);
        bf.ensure_size(first + 1).unwrap();
        let second = bf.len();
        // each step covers at least the sum of the two previous sizes
        assert!(second >= first + p);
        assert_eq!(bf.mm().len() as u64, second);
    }

    #[test]
    fn test_truncate_shrinks_and_remaps() {
        let (_dir, mut bf) = open_temp(true);
        let p = bf.page_size();
        bf.ensure_size(8 * p).unwrap();
        bf.truncate(2 * p).unwrap();
        assert_eq!(bf.len(), 2 * p);
        assert_eq!(bf.mm().len() as u64, 2 * p);
    }

    #[test]
    fn test_mmap_write_visible_through_read() {
        let (_dir, mut bf) = open_temp(true);
        bf.mm_mut().unwrap()[256..261].copy_from_slice(b"strat");
        let mut buf = [0u8; 5];
        bf.read(256, &mut buf).unwrap();
        assert_eq!(&buf, b"strat");
    }

    #[test]
    fn test_addr_blk_conversion() {
        assert_eq!(addr2blk(0), 0);
        assert_eq!(addr2blk(64), 1);
        assert_eq!(blk2addr(5), 320);
        assert_eq!(addr2blk(blk2addr(12345)), 12345);
    }
}
