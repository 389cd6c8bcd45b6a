//! Upload: the serving side receives, the requesting side sends.

use super::{ProgressSink, ServeContext, UploadReport, UploadState, check_identity, reject};
use crate::config::TransferOptions;
use crate::error::{TransferError, TransferResult, ValidationError};
use crate::frame::{Action, Response, UploadMetadata};
use crate::session::{Session, SessionId};
use filemove_files::{PendingFile, digest_file, validate_file_name};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

fn enter(id: SessionId, state: UploadState) {
    tracing::debug!("Session {} upload: {}", id, state);
}

async fn discard(id: SessionId, pending: PendingFile) {
    if let Err(e) = pending.discard().await {
        tracing::warn!("Session {} failed to remove partial upload: {}", id, e);
    }
}

/// Serving side: receive, verify and store one file
///
/// The frame has already been read and decoded. Bytes go to a temporary
/// file that is renamed into `<root>/<username>/<name>` only after its
/// digest matches; on any failure it is deleted.
pub async fn receive<S>(
    session: &mut Session<S>,
    ctx: &ServeContext,
    meta: UploadMetadata,
    progress: &dyn ProgressSink,
) -> TransferResult<UploadReport>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let id = session.id();
    let options = &ctx.options;

    enter(id, UploadState::Validate);
    if let Err(e) = meta
        .validate()
        .and_then(|()| check_identity(session, ctx, &meta.username))
    {
        tracing::warn!("Session {} rejected upload metadata: {}", id, e);
        return reject(session, options, TransferError::invalid(Action::Upload, e)).await;
    }

    enter(id, UploadState::Stream);
    let mut pending = match ctx.storage.begin_upload(&meta.username, &meta.name).await {
        Ok(pending) => pending,
        Err(e) => return reject(session, options, e.into()).await,
    };

    progress.start(&meta.name, meta.size);
    let streamed = session
        .receive_into(pending.file_mut(), meta.size, options.chunk_size, progress)
        .await;
    progress.finish();

    if let Err(e) = streamed {
        if let TransferError::IncompleteTransfer { expected, received } = &e {
            tracing::warn!(
                "Session {} upload of {} incomplete: {} of {} bytes",
                id,
                meta.name,
                received,
                expected
            );
        }
        discard(id, pending).await;
        return reject(session, options, e).await;
    }

    enter(id, UploadState::Verify);
    let digest = match digest_file(pending.temp_path()).await {
        Ok((digest, _)) => digest,
        Err(e) => {
            discard(id, pending).await;
            return reject(session, options, TransferError::storage(e)).await;
        }
    };

    enter(id, UploadState::Respond);
    if !digest.matches_hex(&meta.checksum) {
        tracing::warn!(
            "Session {} checksum mismatch for {}/{}: expected {}, computed {}",
            id,
            meta.username,
            meta.name,
            meta.checksum,
            digest
        );
        discard(id, pending).await;
        let err = TransferError::ChecksumMismatch {
            expected: meta.checksum,
            actual: Some(digest.to_hex()),
        };
        return reject(session, options, err).await;
    }

    let path = match pending.commit().await {
        Ok(path) => path,
        Err(e) => return reject(session, options, e.into()).await,
    };
    session
        .write_response(Response::ChecksumMatch, options.format)
        .await?;

    enter(id, UploadState::Closed);
    Ok(UploadReport {
        name: meta.name,
        size: meta.size,
        digest,
        path,
    })
}

/// Requesting side: send one file and wait for the verdict
pub async fn send<S>(
    session: &mut Session<S>,
    path: &Path,
    options: &TransferOptions,
    progress: &dyn ProgressSink,
) -> TransferResult<UploadReport>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let invalid_name =
        || TransferError::invalid(Action::Upload, ValidationError::InvalidFileName(path.display().to_string()));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(invalid_name)?;
    validate_file_name(name).map_err(|_| invalid_name())?;

    let (digest, size) = digest_file(path).await.map_err(TransferError::storage)?;
    if size == 0 {
        return Err(TransferError::EmptyFile(name.to_string()));
    }

    let meta = UploadMetadata::new(session.username().as_str(), name, size, &digest);
    meta.validate()
        .map_err(|e| TransferError::invalid(Action::Upload, e))?;

    tracing::debug!(
        "Session {} uploading {} ({} bytes, {})",
        session.id(),
        name,
        size,
        digest
    );
    session.write_frame(&meta.to_fields(), options.format).await?;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(TransferError::storage)?;
    progress.start(name, size);
    let sent = session
        .send_from(&mut file, size, options.chunk_size, progress)
        .await;
    progress.finish();

    if let Err(e) = sent {
        // The peer may have answered before closing on us
        if matches!(e, TransferError::Transport(_)) {
            if let Ok(response) = read_response(session, options).await {
                return Err(verdict_error(response, &digest));
            }
        }
        return Err(e);
    }

    let response = read_response(session, options).await?;
    if !response.is_success() {
        return Err(verdict_error(response, &digest));
    }

    Ok(UploadReport {
        name: name.to_string(),
        size,
        digest,
        path: path.to_path_buf(),
    })
}

async fn read_response<S>(session: &mut Session<S>, options: &TransferOptions) -> TransferResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let reply = session
        .read_frame(options.format, options.frame_limit)
        .await?;
    Response::from_fields(&reply, options.format).map_err(|e| TransferError::malformed(None, e))
}

fn verdict_error(response: Response, digest: &filemove_files::FileDigest) -> TransferError {
    match response {
        Response::ChecksumMismatch => TransferError::ChecksumMismatch {
            expected: digest.to_hex(),
            actual: None,
        },
        other => TransferError::Rejected(other),
    }
}
