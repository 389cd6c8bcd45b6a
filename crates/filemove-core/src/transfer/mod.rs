//! Transfer engine.
//!
//! The serving side reads one frame per session and dispatches on its
//! action:
//!
//! ```text
//! upload:   AwaitFrame → Validate → Stream → Verify → Respond → Closed
//! download: AwaitRequest → Validate → Locate → Emit → Stream → Closed
//! ```
//!
//! The requesting side mirrors both machines in [`upload::send`] and
//! [`download::fetch`]. In every case the frame is fully read before the
//! byte stream starts, and any metadata frame is written before its bytes.

pub mod download;
pub mod upload;

use crate::config::TransferOptions;
use crate::error::{TransferError, TransferResult};
use crate::frame::{self, Frame};
use crate::session::Session;
use filemove_files::{FileDigest, StorageRoot};
use std::fmt;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};

/// Observer of byte streaming
///
/// Front-ends implement this to drive progress bars.
pub trait ProgressSink: Send + Sync {
    /// Streaming of `total` bytes of `name` begins
    fn start(&self, name: &str, total: u64);

    /// `bytes` more bytes were moved
    fn advance(&self, bytes: u64);

    /// Streaming ended (successfully or not)
    fn finish(&self);
}

/// Progress sink that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn start(&self, _name: &str, _total: u64) {}
    fn advance(&self, _bytes: u64) {}
    fn finish(&self) {}
}

/// States of the upload machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Waiting for the metadata frame
    AwaitFrame,
    /// Checking the metadata
    Validate,
    /// Receiving file bytes
    Stream,
    /// Digesting the received file
    Verify,
    /// Sending the verdict
    Respond,
    /// Done
    Closed,
}

/// States of the download machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Waiting for the request frame
    AwaitRequest,
    /// Checking the request
    Validate,
    /// Finding the file
    Locate,
    /// Sending the file's metadata
    Emit,
    /// Sending file bytes
    Stream,
    /// Done
    Closed,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// File name
    pub name: String,
    /// Bytes transferred
    pub size: u64,
    /// Verified digest
    pub digest: FileDigest,
    /// Stored path (serving side) or source path (sending side)
    pub path: PathBuf,
}

/// Outcome of a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    /// File name
    pub name: String,
    /// Bytes transferred
    pub size: u64,
    /// Digest declared by the serving side (and verified by the receiver)
    pub digest: FileDigest,
    /// Source path (serving side) or written path (receiving side)
    pub path: PathBuf,
}

/// What a served session did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServedTransfer {
    /// Stored an upload
    Upload(UploadReport),
    /// Served a download
    Download(DownloadReport),
}

/// Serving-side parameters of one session
#[derive(Debug, Clone)]
pub struct ServeContext {
    /// Storage tree files are stored in and served from
    pub storage: StorageRoot,
    /// Codec and streaming options
    pub options: TransferOptions,
    /// Reject frames naming a user other than the session's
    pub enforce_session_identity: bool,
}

/// Serve one session: read its frame, run the matching state machine
///
/// Error responses are sent before returning. The session is left open;
/// the caller closes it.
pub async fn serve_session<S>(
    session: &mut Session<S>,
    ctx: &ServeContext,
    progress: &dyn ProgressSink,
) -> TransferResult<ServedTransfer>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let options = &ctx.options;
    let fields = match session.read_frame(options.format, options.frame_limit).await {
        Ok(fields) => fields,
        Err(e) => return reject(session, options, e).await,
    };

    let action = frame::peek_action(&fields).ok();
    let frame = match Frame::decode(&fields) {
        Ok(frame) => frame,
        Err(source) => {
            return reject(session, options, TransferError::malformed(action, source)).await;
        }
    };

    tracing::debug!(
        "Session {} received {} frame for {}",
        session.id(),
        frame.action(),
        frame.username()
    );

    match frame {
        Frame::Upload(meta) => upload::receive(session, ctx, meta, progress)
            .await
            .map(ServedTransfer::Upload),
        Frame::Download(request) => download::serve(session, ctx, request, progress)
            .await
            .map(ServedTransfer::Download),
    }
}

/// Send the response `err` calls for (best effort), then fail with `err`
pub(crate) async fn reject<S, T>(
    session: &mut Session<S>,
    options: &TransferOptions,
    err: TransferError,
) -> TransferResult<T>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Some(response) = err.response() {
        tracing::debug!("Session {} responding {:?}: {}", session.id(), response, err);
        if let Err(e) = session.write_response(response, options.format).await {
            tracing::debug!("Session {} could not send response: {}", session.id(), e);
        }
    }
    Err(err)
}

/// Check the frame's username against the session's
pub(crate) fn check_identity<S>(
    session: &Session<S>,
    ctx: &ServeContext,
    frame_user: &str,
) -> Result<(), crate::error::ValidationError> {
    if ctx.enforce_session_identity && session.username().as_str() != frame_user {
        return Err(crate::error::ValidationError::IdentityMismatch {
            session: session.username().to_string(),
            frame: frame_user.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFormat, Response};
    use crate::identity::Username;
    use crate::session::SessionId;
    use tokio::io::duplex;

    fn context(dir: &std::path::Path) -> ServeContext {
        ServeContext {
            storage: StorageRoot::new(dir),
            options: TransferOptions::server(),
            enforce_session_identity: false,
        }
    }

    fn pair() -> (Session<tokio::io::DuplexStream>, Session<tokio::io::DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let user = Username::new("alice").unwrap();
        (
            Session::new(SessionId::next(), user.clone(), a),
            Session::new(SessionId::next(), user, b),
        )
    }

    #[tokio::test]
    async fn test_unknown_action_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (mut client, mut server) = pair();

        client
            .write_frame(&["alice", "Delete", "a.txt"], FrameFormat::Delimited)
            .await
            .unwrap();
        let err = serve_session(&mut server, &ctx, &NoProgress).await.unwrap_err();
        assert!(matches!(err, TransferError::MalformedFrame { action: None, .. }));

        let reply = client.read_frame(FrameFormat::Delimited, 4096).await.unwrap();
        assert_eq!(
            Response::from_fields(&reply, FrameFormat::Delimited).unwrap(),
            Response::UnknownAction
        );
    }

    #[tokio::test]
    async fn test_wrong_field_count_rejected_per_action() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        for (frame, expected) in [
            (
                vec!["alice", "Upload", "a.txt", "3"],
                Response::InvalidUploadMetadata,
            ),
            (
                vec!["alice", "Download", "a.txt", "extra"],
                Response::InvalidDownloadMetadata,
            ),
        ] {
            let (mut client, mut server) = pair();
            client.write_frame(&frame, FrameFormat::Delimited).await.unwrap();

            let err = serve_session(&mut server, &ctx, &NoProgress).await.unwrap_err();
            assert!(matches!(err, TransferError::MalformedFrame { .. }));

            let reply = client.read_frame(FrameFormat::Delimited, 4096).await.unwrap();
            assert_eq!(
                Response::from_fields(&reply, FrameFormat::Delimited).unwrap(),
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (mut client, mut server) = pair();

        let long_name = "n".repeat(3000);
        client
            .write_frame(&["alice", "Download", long_name.as_str()], FrameFormat::Delimited)
            .await
            .unwrap();

        let err = serve_session(&mut server, &ctx, &NoProgress).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::MalformedFrame {
                source: crate::error::FrameError::TooLong { limit: 2048 },
                ..
            }
        ));
        assert_eq!(err.response(), Some(Response::InvalidDownloadMetadata));

        let reply = client.read_frame(FrameFormat::Delimited, 4096).await.unwrap();
        assert_eq!(
            Response::from_fields(&reply, FrameFormat::Delimited).unwrap(),
            Response::InvalidDownloadMetadata
        );
    }

    #[tokio::test]
    async fn test_identity_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.enforce_session_identity = true;
        let (mut client, mut server) = pair();

        client
            .write_frame(&["mallory", "Download", "a.txt"], FrameFormat::Delimited)
            .await
            .unwrap();
        let err = serve_session(&mut server, &ctx, &NoProgress).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Validation {
                source: crate::error::ValidationError::IdentityMismatch { .. },
                ..
            }
        ));
    }
}
