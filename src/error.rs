//! Error types for StrataKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for StrataKV operations
#[derive(Debug, Error)]
pub enum StrataError {
    // -------------------------------------------------------------------------
    // General Errors
    // -------------------------------------------------------------------------
    #[error("invalid arguments: {0}")]
    InvalidArgs(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store is opened in read-only mode")]
    ReadOnly,

    #[error("offset is out of bounds")]
    OutOfBounds,

    #[error("operation is not implemented")]
    NotImplemented,

    // -------------------------------------------------------------------------
    // Store / Database Errors
    // -------------------------------------------------------------------------
    #[error("database file invalid or corrupted: {0}")]
    Corrupted(&'static str),

    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    KeyExists,

    #[error("size of key+value must not be greater than 0xfffffff bytes")]
    MaxKvSize,

    #[error("database file size reached its maximum")]
    MaxDbSize,

    #[error("value size is not compatible with the sorted values array mode")]
    DupValueSize,

    #[error("key size is not compatible with the numeric keys mode")]
    KeyNumValueSize,

    #[error("incompatible database open mode")]
    IncompatibleDbMode,

    // -------------------------------------------------------------------------
    // Free-Space Manager Errors
    // -------------------------------------------------------------------------
    #[error("no free space available")]
    NoFreeSpace,

    #[error("invalid block size specified")]
    InvalidBlockSize,

    #[error("range/offset is not aligned with page/block")]
    RangeNotAligned,

    #[error("free-space map segmentation check failed")]
    Segmentation,

    #[error("invalid file metadata")]
    InvalidFileMeta,

    #[error("block size is incompatible with the system page size")]
    PlatformPage,

    // -------------------------------------------------------------------------
    // Internal Control-Flow Codes
    // -------------------------------------------------------------------------
    // Neither of these may escape the skip-list core: `KvBlockFull` triggers a
    // node split, `RequireNLevel` a re-descent with a freshly generated level.
    // A leak is translated to `Corrupted` at the public API boundary.
    #[doc(hidden)]
    #[error("kv block is full")]
    KvBlockFull,

    #[doc(hidden)]
    #[error("operation requires a new node level")]
    RequireNLevel,
}

impl StrataError {
    /// True for errors that are part of normal operation and must stay silent
    /// at the logging layer.
    pub fn is_light(&self) -> bool {
        matches!(
            self,
            StrataError::NotFound | StrataError::KeyExists | StrataError::DupValueSize
        )
    }
}
