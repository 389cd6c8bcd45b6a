//! TLS dialer over TCP.

use crate::TransportConfig;
use crate::tls;
use crate::transport::{Connection, Dialer, TransportError, TransportResult};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// Connects to one server and verifies it against a trusted root
#[derive(Clone)]
pub struct TlsDialer {
    addr: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    nodelay: bool,
}

impl TlsDialer {
    /// Create a dialer for `addr` (`host:port`)
    ///
    /// `server_name` is the name the server certificate must carry.
    pub fn new(
        addr: impl Into<String>,
        server_name: &str,
        tls: Arc<rustls::ClientConfig>,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        Ok(Self {
            addr: addr.into(),
            server_name: tls::server_name(server_name)?,
            connector: TlsConnector::from(tls),
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            nodelay: config.nodelay,
        })
    }

    /// Address this dialer connects to
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    type Stream = TlsStream<TcpStream>;

    async fn dial(&self) -> TransportResult<Connection<Self::Stream>> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "{}: connect timed out after {:?}",
                    self.addr, self.connect_timeout
                ))
            })?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {e}", self.addr)))?;

        if self.nodelay {
            let _ = tcp.set_nodelay(true);
        }
        let peer_addr = tcp.peer_addr().ok();

        let stream = tokio::time::timeout(
            self.handshake_timeout,
            self.connector.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| TransportError::HandshakeTimeout(self.handshake_timeout))??;

        tracing::debug!("Connected to {} over TLS", self.addr);

        Ok(Connection { stream, peer_addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_tls() -> Arc<rustls::ClientConfig> {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        tls::client_config(vec![ck.cert.der().clone()]).unwrap()
    }

    #[test]
    fn test_invalid_server_name() {
        let result = TlsDialer::new(
            "127.0.0.1:8080",
            "bad name",
            client_tls(),
            &TransportConfig::default(),
        );
        assert!(matches!(result, Err(TransportError::InvalidServerName(_))));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Grab a free port, then close it
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let dialer = TlsDialer::new(
            format!("127.0.0.1:{port}"),
            "localhost",
            client_tls(),
            &TransportConfig::default(),
        )
        .unwrap();
        assert_eq!(dialer.addr(), format!("127.0.0.1:{port}"));

        let result = dialer.dial().await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
