//! Error types for the FileMove core protocol.
//!
//! Every error is local to one session. [`TransferError::response`] tells the
//! serving side which response frame (if any) to send before closing.

use crate::frame::{Action, Response};
use filemove_files::StorageError;
use filemove_transport::TransportError;
use std::io;
use thiserror::Error;

/// Frame-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Wrong number of fields for the message type
    #[error("expected {expected} fields, got {actual}")]
    FieldCount {
        /// Fields in the canonical shape
        expected: usize,
        /// Fields received
        actual: usize,
    },

    /// Frame has no action field
    #[error("frame has no action field ({0} fields)")]
    MissingAction(usize),

    /// Action field is not a known action
    #[error("unknown action: {0:?}")]
    UnknownAction(String),

    /// Action is valid but not the one expected here
    #[error("unexpected action: expected {expected}, got {actual}")]
    UnexpectedAction {
        /// Action the reader expected
        expected: Action,
        /// Action received
        actual: Action,
    },

    /// Size field is not a non-negative decimal integer
    #[error("invalid size field: {0:?}")]
    InvalidSize(String),

    /// Frame exceeds the reader's limit
    #[error("frame exceeds {limit} bytes")]
    TooLong {
        /// Reader limit in bytes
        limit: usize,
    },

    /// Stream ended inside a frame
    #[error("stream ended after {received} bytes of an incomplete frame")]
    Truncated {
        /// Bytes of the frame received before EOF
        received: usize,
    },

    /// Length-prefixed frame with a version this build does not speak
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Frame payload is not UTF-8
    #[error("frame is not valid UTF-8")]
    NonUtf8,

    /// A field cannot be represented in the chosen format
    #[error("field {index} contains a delimiter or line break")]
    DelimiterInField {
        /// Position of the offending field
        index: usize,
    },

    /// A field is longer than a length-prefixed frame can carry
    #[error("field {index} is {len} bytes, limit is {max}")]
    FieldTooLong {
        /// Position of the offending field
        index: usize,
        /// Field length
        len: usize,
        /// Maximum field length
        max: usize,
    },

    /// Response frame with an unrecognized code or text
    #[error("unrecognized response: {0:?}")]
    UnknownResponse(String),
}

/// Metadata that decoded but is not acceptable
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Required field is empty
    #[error("field `{0}` is empty")]
    EmptyField(&'static str),

    /// Declared size is zero
    #[error("declared size is zero")]
    ZeroSize,

    /// Checksum is not a 64-character hex digest
    #[error("malformed checksum: {0:?}")]
    InvalidChecksum(String),

    /// File name is not a bare file name
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    /// Username is not acceptable
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),

    /// Frame names a different user than the session carries
    #[error("frame is for user {frame:?} but session belongs to {session:?}")]
    IdentityMismatch {
        /// Session username
        session: String,
        /// Username carried in the frame
        frame: String,
    },

    /// Reply names a different file than was requested
    #[error("requested {requested:?} but peer described {received:?}")]
    NameMismatch {
        /// Name that was requested
        requested: String,
        /// Name in the reply
        received: String,
    },
}

/// Errors of one transfer
#[derive(Debug, Error)]
pub enum TransferError {
    /// Frame could not be decoded
    #[error("malformed frame: {source}")]
    MalformedFrame {
        /// Action of the frame, if it could be determined
        action: Option<Action>,
        /// Decode failure
        #[source]
        source: FrameError,
    },

    /// Frame decoded but its contents are not acceptable
    #[error("invalid metadata: {source}")]
    Validation {
        /// Action of the frame
        action: Action,
        /// What was wrong
        #[source]
        source: ValidationError,
    },

    /// Connection ended before the declared size arrived
    #[error("incomplete transfer: expected {expected} bytes, received {received}")]
    IncompleteTransfer {
        /// Declared size
        expected: u64,
        /// Bytes received before EOF
        received: u64,
    },

    /// Content digest does not match the declared checksum
    #[error(
        "checksum mismatch: expected {expected}{}",
        .actual.as_deref().map(|a| format!(", computed {a}")).unwrap_or_default()
    )]
    ChecksumMismatch {
        /// Declared checksum
        expected: String,
        /// Computed checksum, when computed locally
        actual: Option<String>,
    },

    /// Requested file does not exist
    #[error("file not found: {0}")]
    NotFound(String),

    /// File has no content
    #[error("file is empty: {0}")]
    EmptyFile(String),

    /// Connection failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local filesystem failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Peer answered with a negative response
    #[error("rejected by peer: {0}")]
    Rejected(Response),

    /// Session made no progress before its deadline
    #[error("session timed out")]
    Timeout,

    /// Session was cancelled
    #[error("session cancelled")]
    Cancelled,
}

impl TransferError {
    /// Network I/O failure
    pub fn net(err: io::Error) -> Self {
        Self::Transport(TransportError::Io(err))
    }

    /// Local file I/O failure
    pub fn storage(err: io::Error) -> Self {
        Self::Storage(StorageError::Io(err))
    }

    /// Frame decode failure
    pub fn malformed(action: Option<Action>, source: FrameError) -> Self {
        Self::MalformedFrame { action, source }
    }

    /// Validation failure
    pub fn invalid(action: Action, source: ValidationError) -> Self {
        Self::Validation { action, source }
    }

    /// Returns true for integrity failures (content arrived but does not verify)
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }

    /// Returns true if the error is fatal for the session
    ///
    /// A checksum mismatch is reported to the peer and the session still
    /// closes normally; everything else aborts the session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_integrity_failure()
    }

    /// Returns true if the peer went away or the session was cut short
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_disconnect(),
            Self::IncompleteTransfer { .. } | Self::Timeout | Self::Cancelled => true,
            Self::MalformedFrame {
                source: FrameError::Truncated { .. },
                ..
            } => true,
            _ => false,
        }
    }

    /// Response the serving side sends for this error, if any
    ///
    /// No response follows a broken connection or an incomplete upload.
    #[must_use]
    pub fn response(&self) -> Option<Response> {
        match self {
            Self::MalformedFrame {
                source: FrameError::Truncated { .. },
                ..
            } => None,
            Self::MalformedFrame { action, .. } => Some(match action {
                Some(Action::Upload) => Response::InvalidUploadMetadata,
                Some(Action::Download) => Response::InvalidDownloadMetadata,
                None => Response::UnknownAction,
            }),
            Self::Validation { action, .. } => Some(match action {
                Action::Upload => Response::InvalidUploadMetadata,
                Action::Download => Response::InvalidDownloadMetadata,
            }),
            Self::ChecksumMismatch { .. } => Some(Response::ChecksumMismatch),
            Self::NotFound(_) => Some(Response::FileNotFound),
            Self::EmptyFile(_) => Some(Response::EmptyFile),
            Self::Storage(_) => Some(Response::ServerError),
            Self::IncompleteTransfer { .. }
            | Self::Transport(_)
            | Self::Rejected(_)
            | Self::Timeout
            | Self::Cancelled => None,
        }
    }
}

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;
