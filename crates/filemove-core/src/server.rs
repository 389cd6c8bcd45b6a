//! Server: accept loop and per-connection handling.
//!
//! The accept loop takes an admission token for every accepted connection
//! *before* spawning its handler, so at most `max_connections` sessions run
//! at once and further connections wait in the listen backlog. The TLS
//! handshake runs inside the spawned task and cannot stall the loop.

use crate::admission::{AdmissionController, AdmissionError, AdmissionToken};
use crate::config::{ConfigError, ServerConfig};
use crate::identity::Username;
use crate::session::Session;
use crate::transfer::{self, NoProgress, ServeContext, ServedTransfer};
use filemove_files::StorageRoot;
use filemove_transport::{Incoming, Listener, TransportError, TransportResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pause after an accept error before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Counters of served sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Uploads stored
    pub uploads: u64,
    /// Downloads served
    pub downloads: u64,
    /// Sessions that ended in an error (including failed handshakes)
    pub failures: u64,
}

/// File transfer server
///
/// Cheap to clone; clones share the admission pool and shutdown state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    identity: Username,
    ctx: ServeContext,
    admission: AdmissionController,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    uploads: AtomicU64,
    downloads: AtomicU64,
    failures: AtomicU64,
}

impl Server {
    /// Create a server running as `identity`
    pub fn new(config: ServerConfig, identity: Username) -> Result<Self, ConfigError> {
        config.validate()?;

        let ctx = ServeContext {
            storage: StorageRoot::new(&config.storage_root),
            options: config.transfer.clone(),
            enforce_session_identity: config.enforce_session_identity,
        };
        let admission = AdmissionController::new(config.admission.max_connections);

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                identity,
                ctx,
                admission,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                uploads: AtomicU64::new(0),
                downloads: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        })
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Identity sessions are bound to
    pub fn identity(&self) -> &Username {
        &self.inner.identity
    }

    /// Admission pool
    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Counter snapshot
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            uploads: self.inner.uploads.load(Ordering::Relaxed),
            downloads: self.inner.downloads.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }

    /// Accept connections until shutdown or until the listener closes
    ///
    /// Returns once no further connections will be accepted. Sessions
    /// already running keep going; use [`drain`](Self::drain) to wait for
    /// them.
    pub async fn run<L: Listener>(&self, listener: L) -> TransportResult<()> {
        let inner = &self.inner;
        match listener.local_addr() {
            Some(addr) => tracing::info!("Server listening on {} as {}", addr, inner.identity),
            None => tracing::info!("Server listening as {}", inner.identity),
        }

        loop {
            let incoming = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let incoming = match incoming {
                Ok(incoming) => incoming,
                Err(TransportError::Closed) => {
                    tracing::info!("Listener closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let peer_addr = incoming.peer_addr();
            let token = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                token = inner.admission.acquire(&inner.identity, peer_addr) => token,
            };
            let token = match token {
                Ok(token) => token,
                Err(AdmissionError::Closed) => break,
            };

            tracing::debug!(
                "Admitted session {} ({}/{} active)",
                token.id(),
                inner.admission.active_count(),
                inner.admission.capacity()
            );

            let server = self.clone();
            inner
                .tasks
                .spawn(async move { server.handle_connection(incoming, token).await });
        }

        tracing::info!("Server stopped accepting connections");
        Ok(())
    }

    async fn handle_connection<I: Incoming>(&self, incoming: I, token: AdmissionToken) {
        let inner = &self.inner;
        let id = token.id();

        let connection = match incoming.establish().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("Session {} handshake failed: {}", id, e);
                inner.failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let mut session = Session::new(id, inner.identity.clone(), connection.stream)
            .with_peer(connection.peer_addr)
            .with_cancellation(token.cancellation())
            .with_timeout(inner.config.session_timeout);
        tracing::info!("Session {} opened from {}", id, session.peer_label());

        match transfer::serve_session(&mut session, &inner.ctx, &NoProgress).await {
            Ok(ServedTransfer::Upload(report)) => {
                inner.uploads.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "Session {} stored {} ({} bytes, {})",
                    id,
                    report.path.display(),
                    report.size,
                    report.digest
                );
            }
            Ok(ServedTransfer::Download(report)) => {
                inner.downloads.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "Session {} served {} ({} bytes)",
                    id,
                    report.path.display(),
                    report.size
                );
            }
            Err(e) => {
                inner.failures.fetch_add(1, Ordering::Relaxed);
                if e.is_disconnect() {
                    tracing::info!("Session {} ended early: {}", id, e);
                } else {
                    tracing::warn!("Session {} failed: {}", id, e);
                }
            }
        }

        session.close().await;
        drop(token);
    }

    /// Stop accepting connections
    ///
    /// Running sessions are not interrupted.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down server");
        self.inner.shutdown.cancel();
        self.inner.admission.close();
        self.inner.tasks.close();
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel every running session, returning how many were signalled
    pub fn cancel_sessions(&self) -> usize {
        let cancelled = self.inner.admission.cancel_all();
        if cancelled > 0 {
            tracing::warn!("Cancelled {} running sessions", cancelled);
        }
        cancelled
    }

    /// Wait for every spawned session to finish
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        tracing::debug!("All sessions drained");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("identity", &self.inner.identity)
            .field("storage_root", &self.inner.config.storage_root)
            .field("admission", &self.inner.admission.metrics())
            .finish()
    }
}
