//! TLS server fixture for integration testing
//!
//! Starts a real FileMove server on `127.0.0.1:0` behind a freshly generated
//! self-signed certificate, with scratch directories for server storage and
//! client downloads.
//!
//! # Example
//!
//! ```no_run
//! use filemove_integration_tests::fixtures::TlsFixture;
//!
//! #[tokio::test]
//! async fn test_basic_upload() {
//!     let fixture = TlsFixture::start().await.unwrap();
//!     let client = fixture.client("alice");
//!     // ... upload, download ...
//!     fixture.stop().await;
//! }
//! ```

use filemove_core::{Client, ClientConfig, Server, ServerConfig, Username};
use filemove_transport::{
    Listener, TlsDialer, TlsListener, TransportConfig, TransportError, TransportResult, tls,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Self-signed certificate for `localhost`, as server and client TLS configs
pub fn tls_pair() -> TransportResult<(Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>)> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| TransportError::Certificate(e.to_string()))?;
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let server = tls::server_config(vec![cert.clone()], key)?;
    let client = tls::client_config(vec![cert])?;
    Ok((server, client))
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A running server plus everything a test needs to talk to it
pub struct TlsFixture {
    /// The running server
    pub server: Server,
    /// Address the server listens on
    pub addr: SocketAddr,
    storage: TempDir,
    downloads: TempDir,
    client_tls: Arc<rustls::ClientConfig>,
    transport: TransportConfig,
    run: JoinHandle<TransportResult<()>>,
}

impl TlsFixture {
    /// Start a server for `alice` with default settings
    pub async fn start() -> TransportResult<Self> {
        Self::start_with("alice", |_| {}).await
    }

    /// Start a server for `identity`, adjusting its configuration first
    ///
    /// The listen address and storage root are always overridden.
    pub async fn start_with(
        identity: &str,
        configure: impl FnOnce(&mut ServerConfig),
    ) -> TransportResult<Self> {
        let storage = TempDir::new()?;
        let downloads = TempDir::new()?;
        let (server_tls, client_tls) = tls_pair()?;

        let mut config = ServerConfig::default();
        configure(&mut config);
        config.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        config.storage_root = storage.path().to_path_buf();

        let transport = config.transport.clone();
        let listener = TlsListener::bind(config.listen_addr, server_tls, &transport)?;
        let addr = listener
            .local_addr()
            .ok_or_else(|| TransportError::BindFailed("no local address".into()))?;

        let identity = Username::new(identity)
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        let server =
            Server::new(config, identity).map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        let run = tokio::spawn({
            let server = server.clone();
            async move { server.run(listener).await }
        });

        Ok(Self {
            server,
            addr,
            storage,
            downloads,
            client_tls,
            transport,
            run,
        })
    }

    /// Raw TLS dialer for protocol-level tests
    pub fn dialer(&self) -> TlsDialer {
        TlsDialer::new(
            self.addr.to_string(),
            "localhost",
            Arc::clone(&self.client_tls),
            &self.transport,
        )
        .expect("localhost is a valid server name")
    }

    /// Client logged in as `username`, downloading into the fixture's scratch dir
    pub fn client(&self, username: &str) -> Client<TlsDialer> {
        self.client_with(username, |_| {})
    }

    /// Client with an adjusted configuration
    pub fn client_with(
        &self,
        username: &str,
        configure: impl FnOnce(&mut ClientConfig),
    ) -> Client<TlsDialer> {
        let mut config = ClientConfig {
            server_addr: self.addr.to_string(),
            server_name: Some("localhost".to_string()),
            download_root: self.downloads.path().to_path_buf(),
            transport: self.transport.clone(),
            ..ClientConfig::default()
        };
        configure(&mut config);

        let username = Username::new(username).expect("test usernames are valid");
        Client::new(self.dialer(), username, config).expect("fixture client config is valid")
    }

    /// Server storage root
    pub fn storage_root(&self) -> &Path {
        self.storage.path()
    }

    /// Client download root
    pub fn download_root(&self) -> &Path {
        self.downloads.path()
    }

    /// Where the server keeps `name` for `username`
    pub fn stored_path(&self, username: &str, name: &str) -> PathBuf {
        self.storage.path().join(username).join(name)
    }

    /// Write a scratch file for uploading
    pub fn write_source(&self, name: &str, content: &[u8]) -> PathBuf {
        let dir = self.downloads.path().join("sources");
        std::fs::create_dir_all(&dir).expect("create source dir");
        let path = dir.join(name);
        std::fs::write(&path, content).expect("write source file");
        path
    }

    /// Place a file directly into server storage
    pub fn seed_stored(&self, username: &str, name: &str, content: &[u8]) {
        let path = self.stored_path(username, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create user dir");
        }
        std::fs::write(path, content).expect("write stored file");
    }

    /// Stop accepting, wait for every session, and clean up
    pub async fn stop(self) {
        self.server.shutdown();
        match self.run.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Server loop failed: {}", e),
            Err(e) => tracing::warn!("Server task panicked: {}", e),
        }
        self.server.drain().await;
    }
}
