//! Shared domain types for the depot attachment store.
//!
//! This crate holds the pieces every other crate agrees on:
//! - Content hashes and incremental hashing
//! - Application configuration
//! - HTTP byte-range parsing
//! - Upload metadata and result types

pub mod config;
pub mod error;
pub mod hash;
pub mod range;
pub mod upload;

pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use range::ByteRange;

/// Default spool threshold before an upload spills to a temp file (8 MiB).
pub const DEFAULT_SPOOL_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Default maximum upload size (256 MiB).
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 256 * 1024 * 1024;

/// Maximum number of files accepted by a single batch upload request.
pub const MAX_BATCH_UPLOAD_FILES: usize = 10;
