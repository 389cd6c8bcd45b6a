//! Download: the serving side emits, the requesting side fetches.

use super::{DownloadReport, DownloadState, ProgressSink, ServeContext, check_identity, reject};
use crate::config::TransferOptions;
use crate::error::{FrameError, TransferError, TransferResult, ValidationError};
use crate::frame::{Action, DownloadReply, DownloadRequest, Response, UploadMetadata};
use crate::session::{Session, SessionId};
use filemove_files::{PendingFile, digest_file, digest_reader, download_dir_for, validate_file_name};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};

fn enter(id: SessionId, state: DownloadState) {
    tracing::debug!("Session {} download: {}", id, state);
}

/// Serving side: emit metadata for a stored file, then its bytes
pub async fn serve<S>(
    session: &mut Session<S>,
    ctx: &ServeContext,
    request: DownloadRequest,
    progress: &dyn ProgressSink,
) -> TransferResult<DownloadReport>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let id = session.id();
    let options = &ctx.options;

    enter(id, DownloadState::Validate);
    if let Err(e) = request
        .validate()
        .and_then(|()| check_identity(session, ctx, &request.username))
    {
        tracing::warn!("Session {} rejected download request: {}", id, e);
        return reject(session, options, TransferError::invalid(Action::Download, e)).await;
    }

    enter(id, DownloadState::Locate);
    let mut file = match ctx.storage.open(&request.username, &request.name).await {
        Ok(Some(file)) => file,
        Ok(None) => {
            tracing::info!(
                "Session {} requested missing file {}/{}",
                id,
                request.username,
                request.name
            );
            return reject(session, options, TransferError::NotFound(request.name)).await;
        }
        Err(e) => return reject(session, options, e.into()).await,
    };

    enter(id, DownloadState::Emit);
    let (digest, size) = match digest_reader(&mut file).await {
        Ok(measured) => measured,
        Err(e) => return reject(session, options, TransferError::storage(e)).await,
    };
    if size == 0 {
        return reject(session, options, TransferError::EmptyFile(request.name)).await;
    }
    if let Err(e) = file.seek(SeekFrom::Start(0)).await {
        return reject(session, options, TransferError::storage(e)).await;
    }

    let meta = UploadMetadata::download_reply(&request.username, &request.name, size, &digest);
    session.write_frame(&meta.to_fields(), options.format).await?;

    enter(id, DownloadState::Stream);
    progress.start(&request.name, size);
    let sent = session
        .send_from(&mut file, size, options.chunk_size, progress)
        .await;
    progress.finish();
    sent?;

    enter(id, DownloadState::Closed);
    let path = ctx.storage.resolve(&request.username, &request.name)?;
    Ok(DownloadReport {
        name: request.name,
        size,
        digest,
        path,
    })
}

/// Requesting side: fetch `name` into `<download_root>/<stem>/<name>`
///
/// The received bytes are written to a temporary file sized up front and
/// renamed into place only once their digest matches the announced one.
pub async fn fetch<S>(
    session: &mut Session<S>,
    name: &str,
    download_root: &Path,
    options: &TransferOptions,
    progress: &dyn ProgressSink,
) -> TransferResult<DownloadReport>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    validate_file_name(name).map_err(|_| {
        TransferError::invalid(Action::Download, ValidationError::InvalidFileName(name.to_string()))
    })?;

    let request = DownloadRequest::new(session.username().as_str(), name);
    session.write_frame(&request.to_fields(), options.format).await?;

    let reply = session
        .read_frame(options.format, options.frame_limit)
        .await?;
    let meta = match DownloadReply::from_fields(&reply, options.format)
        .map_err(|e| TransferError::malformed(Some(Action::Download), e))?
    {
        DownloadReply::Metadata(meta) => meta,
        DownloadReply::Response(Response::FileNotFound) => {
            return Err(TransferError::NotFound(name.to_string()));
        }
        DownloadReply::Response(Response::EmptyFile) => {
            return Err(TransferError::EmptyFile(name.to_string()));
        }
        DownloadReply::Response(other) => return Err(TransferError::Rejected(other)),
    };

    if meta.action != Action::Download {
        return Err(TransferError::malformed(
            Some(Action::Download),
            FrameError::UnexpectedAction {
                expected: Action::Download,
                actual: meta.action,
            },
        ));
    }
    meta.validate()
        .map_err(|e| TransferError::invalid(Action::Download, e))?;
    if meta.name != name {
        return Err(TransferError::invalid(
            Action::Download,
            ValidationError::NameMismatch {
                requested: name.to_string(),
                received: meta.name,
            },
        ));
    }

    let dir = download_dir_for(download_root, name)?;
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(TransferError::storage)?;
    let mut pending = PendingFile::create(dir.join(name)).await?;
    pending.preallocate(meta.size).await?;

    tracing::debug!(
        "Session {} downloading {} ({} bytes) into {}",
        session.id(),
        name,
        meta.size,
        dir.display()
    );

    progress.start(name, meta.size);
    let received = session
        .receive_into(pending.file_mut(), meta.size, options.chunk_size, progress)
        .await;
    progress.finish();
    received?;

    let (digest, _) = digest_file(pending.temp_path())
        .await
        .map_err(TransferError::storage)?;
    if !digest.matches_hex(&meta.checksum) {
        tracing::warn!(
            "Session {} downloaded {} does not verify: expected {}, computed {}",
            session.id(),
            name,
            meta.checksum,
            digest
        );
        pending.discard().await?;
        return Err(TransferError::ChecksumMismatch {
            expected: meta.checksum,
            actual: Some(digest.to_hex()),
        });
    }

    let path = pending.commit().await?;
    Ok(DownloadReport {
        name: name.to_string(),
        size: meta.size,
        digest,
        path,
    })
}
