//! # FileMove Files
//!
//! File layer for the FileMove transfer protocol.
//!
//! This crate provides:
//! - SHA-256 content digests (whole files, readers, in-memory buffers)
//! - Per-user storage layout on the serving side
//! - Download target layout on the requesting side
//! - Verify-then-rename pending files, so no partial or corrupt file is
//!   ever visible under its final name

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod digest;
pub mod storage;

pub use digest::{DigestError, FileDigest, StreamingDigest, digest_bytes, digest_file, digest_reader};
pub use storage::{PendingFile, StorageError, StorageRoot, download_dir_for, validate_file_name};

/// Length of a SHA-256 digest in bytes
pub const DIGEST_SIZE: usize = 32;

/// Length of a SHA-256 digest rendered as lowercase hex
pub const DIGEST_HEX_LEN: usize = DIGEST_SIZE * 2;

/// Buffer size used when streaming file contents (64 KiB)
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;
