//! # FileMove Core
//!
//! Core protocol implementation for FileMove: moving single files between an
//! authenticated user and a remote storage host over TLS, with end-to-end
//! SHA-256 verification.
//!
//! This crate provides:
//! - The wire frame codec (pipe-delimited lines, plus a length-prefixed variant)
//! - Sessions: one connection, one username, one transfer
//! - The admission controller bounding concurrent server-side sessions
//! - The transfer engine (upload and download state machines, both sides)
//! - The server accept loop and the client entry points
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Server (accept loop)  /  Client (dial)              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Admission Controller                        │
//! │      (bounded token pool, cancellable active sessions)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Session                                  │
//! │   (one TLS stream, username, deadline, cancellation)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              Transfer Engine  ·  Frame Codec                     │
//! │   (frame → byte stream → verify → response)                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every session carries exactly one frame exchange and one byte stream,
//! always in that order.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod identity;
pub mod server;
pub mod session;
pub mod transfer;

pub use admission::{AdmissionController, AdmissionError, AdmissionMetrics, AdmissionToken};
pub use client::Client;
pub use config::{AdmissionConfig, ClientConfig, ConfigError, ServerConfig, TransferOptions};
pub use error::{FrameError, TransferError, TransferResult, ValidationError};
pub use frame::{Action, DownloadRequest, Frame, FrameFormat, Response, UploadMetadata};
pub use identity::{IdentityError, IdentityStore, Username};
pub use server::{Server, ServerStats};
pub use session::{Session, SessionId, SessionStats};
pub use transfer::{DownloadReport, NoProgress, ProgressSink, ServedTransfer, UploadReport};

use std::time::Duration;

/// Protocol version carried by length-prefixed frames
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest frame the serving side reads
pub const SERVER_FRAME_LIMIT: usize = 2048;

/// Largest frame the requesting side reads
pub const CLIENT_FRAME_LIMIT: usize = 4096;

/// Default admission capacity
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Default streaming chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = filemove_files::COPY_BUFFER_SIZE;

/// Default per-session inactivity limit
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default server port
pub const DEFAULT_PORT: u16 = 8080;
