//! Client: one session per transfer.

use crate::config::{ClientConfig, ConfigError};
use crate::error::{TransferError, TransferResult};
use crate::identity::Username;
use crate::session::{Session, SessionId};
use crate::transfer::{DownloadReport, NoProgress, ProgressSink, UploadReport, download, upload};
use filemove_transport::Dialer;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// File transfer client bound to an authenticated identity
///
/// Every upload or download dials a fresh connection, runs exactly one
/// transfer on it and closes it.
pub struct Client<D: Dialer> {
    dialer: D,
    identity: Username,
    config: ClientConfig,
    cancel: CancellationToken,
}

impl<D: Dialer> Client<D> {
    /// Create a client that dials through `dialer`
    pub fn new(dialer: D, identity: Username, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            dialer,
            identity,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Identity frames are sent under
    pub fn identity(&self) -> &Username {
        &self.identity
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Upload a local file
    pub async fn upload(&self, path: impl AsRef<Path>) -> TransferResult<UploadReport> {
        self.upload_with_progress(path, &NoProgress).await
    }

    /// Upload a local file, reporting streaming progress
    pub async fn upload_with_progress(
        &self,
        path: impl AsRef<Path>,
        progress: &dyn ProgressSink,
    ) -> TransferResult<UploadReport> {
        let path = path.as_ref();
        let mut session = self.open_session().await?;
        let result = upload::send(&mut session, path, &self.config.transfer, progress).await;
        session.close().await;

        match &result {
            Ok(report) => tracing::info!(
                "Uploaded {} ({} bytes, {})",
                report.name,
                report.size,
                report.digest
            ),
            Err(e) => tracing::warn!("Upload of {} failed: {}", path.display(), e),
        }
        result
    }

    /// Download a file stored under this identity
    pub async fn download(&self, name: &str) -> TransferResult<DownloadReport> {
        self.download_with_progress(name, &NoProgress).await
    }

    /// Download a file, reporting streaming progress
    pub async fn download_with_progress(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
    ) -> TransferResult<DownloadReport> {
        let mut session = self.open_session().await?;
        let result = download::fetch(
            &mut session,
            name,
            &self.config.download_root,
            &self.config.transfer,
            progress,
        )
        .await;
        session.close().await;

        match &result {
            Ok(report) => tracing::info!(
                "Downloaded {} to {} ({} bytes)",
                report.name,
                report.path.display(),
                report.size
            ),
            Err(e) => tracing::warn!("Download of {} failed: {}", name, e),
        }
        result
    }

    /// Cancel every transfer in progress and refuse new ones
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn open_session(&self) -> TransferResult<Session<D::Stream>> {
        let connection = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            dialed = self.dialer.dial() => dialed?,
        };

        let session = Session::new(SessionId::next(), self.identity.clone(), connection.stream)
            .with_peer(connection.peer_addr)
            .with_cancellation(self.cancel.child_token())
            .with_timeout(self.config.session_timeout);
        tracing::debug!("Session {} connected to {}", session.id(), session.peer_label());
        Ok(session)
    }
}

impl<D: Dialer> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("identity", &self.identity)
            .field("server_addr", &self.config.server_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;
    use filemove_files::digest_bytes;
    use filemove_transport::memory::{self, DEFAULT_PIPE_BUFFER};

    struct Harness {
        server: Server,
        client: Client<memory::MemoryDialer>,
        run: tokio::task::JoinHandle<filemove_transport::TransportResult<()>>,
        _server_dir: tempfile::TempDir,
        client_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let server_dir = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();
        let alice = Username::new("alice").unwrap();

        let mut server_config = ServerConfig::default();
        server_config.storage_root = server_dir.path().to_path_buf();
        let server = Server::new(server_config, alice.clone()).unwrap();

        let mut client_config = ClientConfig::default();
        client_config.download_root = client_dir.path().to_path_buf();

        let (listener, dialer) = memory::pair(DEFAULT_PIPE_BUFFER);
        let client = Client::new(dialer, alice, client_config).unwrap();
        let run = tokio::spawn({
            let server = server.clone();
            async move { server.run(listener).await }
        });

        Harness {
            server,
            client,
            run,
            _server_dir: server_dir,
            client_dir,
        }
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let h = harness();
        let source = h.client_dir.path().join("notes.md");
        std::fs::write(&source, b"# notes\n").unwrap();

        let up = h.client.upload(&source).await.unwrap();
        assert_eq!(up.digest, digest_bytes(b"# notes\n"));

        let down = h.client.download("notes.md").await.unwrap();
        assert_eq!(down.digest, up.digest);
        assert_eq!(
            down.path,
            h.client_dir.path().join("down-notes").join("notes.md")
        );
        assert_eq!(std::fs::read(&down.path).unwrap(), b"# notes\n");

        h.server.shutdown();
        h.run.await.unwrap().unwrap();
        h.server.drain().await;
        assert_eq!(h.server.stats().uploads, 1);
        assert_eq!(h.server.stats().downloads, 1);
    }

    #[tokio::test]
    async fn test_download_missing() {
        let h = harness();
        let err = h.client.download("nope.txt").await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
        h.server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_transfers() {
        let h = harness();
        h.client.shutdown();
        let err = h.client.download("anything.txt").await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        h.server.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_listener, dialer) = memory::pair(DEFAULT_PIPE_BUFFER);
        let mut config = ClientConfig::default();
        config.server_addr = "no-port".into();
        assert!(Client::new(dialer, Username::new("alice").unwrap(), config).is_err());
    }
}
