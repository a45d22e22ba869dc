//! # StrataKV
//!
//! An embedded, single-process key/value store that keeps one or more
//! logically independent databases inside a single memory-mapped file:
//! - Ordered key access with forward/backward cursors
//! - A probabilistic skip list whose nodes live at fixed file offsets
//! - A free-space manager (bitmap + best-fit extent tree) under everything
//! - Optional sorted-duplicate numeric values for secondary indexing
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Store API                            │
//! │          (databases, cursors, put/get/del, sync)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 Skip-List Core (SBLK)                       │
//! │      descent · split-on-insert · unlink-on-delete           │
//! └─────────┬───────────────────────────────┬───────────────────┘
//!           │                               │
//!           ▼                               ▼
//!    ┌─────────────┐                 ┌─────────────┐
//!    │    KVBLK    │                 │     FSM     │
//!    │ (pair data) │                 │ (free space)│
//!    └──────┬──────┘                 └──────┬──────┘
//!           │                               │
//!           └───────────────┬───────────────┘
//!                           ▼
//!                   ┌───────────────┐
//!                   │  Block file   │
//!                   │ (mmap window) │
//!                   └───────────────┘
//! ```
//!
//! Durability: a mutation is on disk once [`Store::sync`] (or a put with
//! `PutFlags::SYNC`) completes. There is no write-ahead log; no crash-safety
//! guarantee is made across a partial write beyond the last sync point.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod codec;
pub mod blockfile;
pub mod fsm;
pub mod kvblk;
pub mod sblk;
pub mod skiplist;
pub mod db;
pub mod store;
pub mod cursor;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StrataError};
pub use config::{Config, DbFlags, OpenFlags, PutFlags};
pub use blockfile::SyncFlags;
pub use cursor::{Cursor, CursorOp};
pub use db::Db;
pub use store::Store;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of StrataKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
