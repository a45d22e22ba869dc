//! Configuration for StrataKV
//!
//! Centralized configuration with sensible defaults, plus the flag sets used
//! by the public API: store open flags, per-database flags and per-operation
//! flags.

use std::path::PathBuf;

/// Main configuration for a StrataKV store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Path of the backing file
    pub path: PathBuf,

    /// Store open flags
    pub open_flags: OpenFlags,

    /// Verify every free-space bitmap transition (allocating an allocated
    /// block or freeing a free block fails with `Segmentation`)
    pub fsm_strict: bool,

    // -------------------------------------------------------------------------
    // Skip-List Configuration
    // -------------------------------------------------------------------------
    /// Seed for the per-store level-generation PRNG. `None` seeds from
    /// entropy; pin it to make level assignments reproducible in tests.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./stratakv.db"),
            open_flags: OpenFlags::default(),
            fsm_strict: false,
            rng_seed: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn open_flags(mut self, flags: OpenFlags) -> Self {
        self.config.open_flags = flags;
        self
    }

    pub fn fsm_strict(mut self, strict: bool) -> Self {
        self.config.fsm_strict = strict;
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.config.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// Flag Sets
// =============================================================================

/// Store open flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(u8);

impl OpenFlags {
    /// Open the store in read-only mode
    pub const RDONLY: OpenFlags = OpenFlags(0x02);
    /// Truncate the backing file on open (implies write access)
    pub const TRUNC: OpenFlags = OpenFlags(0x04);
    /// Do not acquire the advisory file lock
    pub const NOLOCKS: OpenFlags = OpenFlags(0x08);

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the store may be written. `TRUNC` wins over `RDONLY` by
    /// implying write access.
    pub fn writable(self) -> bool {
        self.contains(OpenFlags::TRUNC) || !self.contains(OpenFlags::RDONLY)
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Per-database mode flags. Persisted in the database header; reopening an
/// existing database id with different flags fails with `IncompatibleDbMode`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbFlags(u8);

impl DbFlags {
    /// Keys are fixed 4-byte little-endian unsigned integers, ordered
    /// numerically
    pub const UINT32_KEYS: DbFlags = DbFlags(0x01);
    /// Keys are fixed 8-byte little-endian unsigned integers, ordered
    /// numerically
    pub const UINT64_KEYS: DbFlags = DbFlags(0x02);
    /// Values are sorted arrays of unique 4-byte unsigned integers
    pub const DUP_UINT32_VALS: DbFlags = DbFlags(0x04);
    /// Values are sorted arrays of unique 8-byte unsigned integers
    pub const DUP_UINT64_VALS: DbFlags = DbFlags(0x08);

    pub fn contains(self, other: DbFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if either sorted-duplicate values mode is selected
    pub fn is_dup(self) -> bool {
        self.0 & (Self::DUP_UINT32_VALS.0 | Self::DUP_UINT64_VALS.0) != 0
    }

    /// Width in bytes of a duplicate-array element, if in dup mode
    pub fn dup_elem_size(self) -> Option<usize> {
        if self.contains(Self::DUP_UINT32_VALS) {
            Some(4)
        } else if self.contains(Self::DUP_UINT64_VALS) {
            Some(8)
        } else {
            None
        }
    }

    /// Required key width in bytes for the numeric key modes, if any
    pub fn fixed_key_size(self) -> Option<usize> {
        if self.contains(Self::UINT32_KEYS) {
            Some(4)
        } else if self.contains(Self::UINT64_KEYS) {
            Some(8)
        } else {
            None
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> DbFlags {
        DbFlags(bits)
    }
}

impl std::ops::BitOr for DbFlags {
    type Output = DbFlags;
    fn bitor(self, rhs: DbFlags) -> DbFlags {
        DbFlags(self.0 | rhs.0)
    }
}

/// Per-operation flags for `put` and cursor mutations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutFlags(u8);

impl PutFlags {
    /// Fail with `KeyExists` instead of overwriting an existing key
    pub const NO_OVERWRITE: PutFlags = PutFlags(0x01);
    /// Remove the given value from a sorted-duplicate array instead of
    /// inserting it
    pub const DUP_REMOVE: PutFlags = PutFlags(0x02);
    /// Flush file state after the mutation completes
    pub const SYNC: PutFlags = PutFlags(0x04);

    pub fn contains(self, other: PutFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PutFlags {
    type Output = PutFlags;
    fn bitor(self, rhs: PutFlags) -> PutFlags {
        PutFlags(self.0 | rhs.0)
    }
}
