//! TLS listener over TCP.

use crate::TransportConfig;
use crate::transport::{Connection, Incoming, Listener, TransportError, TransportResult};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

/// Bind a TCP listener with an explicit accept backlog
///
/// Must be called from within a Tokio runtime.
pub fn bind_tcp(addr: SocketAddr, backlog: u32) -> TransportResult<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;

    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket
        .listen(backlog)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|e| TransportError::BindFailed(e.to_string()))
}

/// TLS listener
///
/// `accept` returns as soon as the TCP connection is accepted; the handshake
/// happens in [`TlsIncoming::establish`], bounded by the handshake timeout.
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    nodelay: bool,
}

impl TlsListener {
    /// Bind to `addr` and serve TLS with `tls`
    pub fn bind(
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        let listener = bind_tcp(addr, config.backlog)?;
        tracing::debug!(
            "TLS listener bound to {} (backlog {})",
            listener.local_addr()?,
            config.backlog
        );
        Ok(Self::from_listener(listener, tls, config))
    }

    /// Wrap an already-bound TCP listener
    pub fn from_listener(
        listener: TcpListener,
        tls: Arc<rustls::ServerConfig>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            handshake_timeout: config.handshake_timeout,
            nodelay: config.nodelay,
        }
    }
}

#[async_trait]
impl Listener for TlsListener {
    type Incoming = TlsIncoming;

    async fn accept(&self) -> TransportResult<TlsIncoming> {
        let (tcp, peer) = self.listener.accept().await?;
        if self.nodelay {
            if let Err(e) = tcp.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }
        }

        Ok(TlsIncoming {
            tcp,
            peer,
            acceptor: self.acceptor.clone(),
            handshake_timeout: self.handshake_timeout,
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// Accepted TCP connection awaiting its TLS handshake
pub struct TlsIncoming {
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

#[async_trait]
impl Incoming for TlsIncoming {
    type Stream = TlsStream<TcpStream>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn establish(self) -> TransportResult<Connection<Self::Stream>> {
        let stream = tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(self.tcp))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(self.handshake_timeout))??;

        tracing::trace!("TLS handshake complete with {}", self.peer);

        Ok(Connection {
            stream,
            peer_addr: Some(self.peer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::TlsDialer;
    use crate::tls;
    use crate::transport::Dialer;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn tls_pair() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(ck.key_pair.serialize_der()));
        let server = tls::server_config(vec![ck.cert.der().clone()], key).unwrap();
        let client = tls::client_config(vec![ck.cert.der().clone()]).unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_bind_tcp_ephemeral_port() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_tcp_port_in_use() {
        let first = bind_tcp("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = first.local_addr().unwrap();

        // SO_REUSEADDR does not allow two active listeners on one port
        let second = bind_tcp(addr, 16);
        assert!(matches!(second, Err(TransportError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_tls_round_trip() {
        let (server_tls, client_tls) = tls_pair();
        let config = TransportConfig::default();
        let listener =
            TlsListener::bind("127.0.0.1:0".parse().unwrap(), server_tls, &config).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            assert!(incoming.peer_addr().is_some());
            let mut conn = incoming.establish().await.unwrap();
            let mut buf = [0u8; 5];
            conn.stream.read_exact(&mut buf).await.unwrap();
            conn.stream.write_all(&buf).await.unwrap();
            conn.stream.shutdown().await.unwrap();
        });

        let dialer = TlsDialer::new(addr.to_string(), "localhost", client_tls, &config).unwrap();
        let mut conn = dialer.dial().await.unwrap();
        assert_eq!(conn.peer_addr, Some(addr));

        conn.stream.write_all(b"hello").await.unwrap();
        let mut echoed = Vec::new();
        conn.stream.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (server_tls, _) = tls_pair();
        let config = TransportConfig {
            handshake_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let listener =
            TlsListener::bind("127.0.0.1:0".parse().unwrap(), server_tls, &config).unwrap();
        let addr = listener.local_addr().unwrap();

        // Plain TCP peer that never speaks TLS
        let _silent = TcpStream::connect(addr).await.unwrap();

        let incoming = listener.accept().await.unwrap();
        let result = incoming.establish().await;
        assert!(matches!(result, Err(TransportError::HandshakeTimeout(_))));
    }

    #[tokio::test]
    async fn test_untrusted_certificate_rejected() {
        let (server_tls, _) = tls_pair();
        let (_, other_client_tls) = tls_pair();
        let config = TransportConfig::default();
        let listener =
            TlsListener::bind("127.0.0.1:0".parse().unwrap(), server_tls, &config).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            incoming.establish().await
        });

        let dialer =
            TlsDialer::new(addr.to_string(), "localhost", other_client_tls, &config).unwrap();
        assert!(dialer.dial().await.is_err());
        assert!(server.await.unwrap().is_err());
    }
}
