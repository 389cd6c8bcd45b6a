//! Transport trait abstraction.
//!
//! The session engine never touches sockets directly. A server drives a
//! [`Listener`], which yields [`Incoming`] connections whose handshake runs
//! inside the per-connection task; a client drives a [`Dialer`]. Both end
//! in a plain byte [`Stream`].

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS handshake did not complete in time
    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// TLS configuration or protocol error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or key material could not be loaded
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Server name is not a valid DNS name or IP address
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Whether the peer went away (reset, broken pipe, EOF)
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional byte stream carrying one session
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An established connection
#[derive(Debug)]
pub struct Connection<S> {
    /// The encrypted byte stream
    pub stream: S,
    /// Remote address, if the transport has one
    pub peer_addr: Option<SocketAddr>,
}

/// Server side: accepts connections.
///
/// `accept` must return promptly once a peer connects; any expensive
/// handshake belongs in [`Incoming::establish`], which runs in the task that
/// owns the connection.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Connection not yet handshaken
    type Incoming: Incoming;

    /// Wait for the next connection
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the listener can no longer yield
    /// connections; other errors are per-connection and the caller may keep
    /// accepting.
    async fn accept(&self) -> TransportResult<Self::Incoming>;

    /// Local address, if the transport has one
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// An accepted connection awaiting its handshake
#[async_trait]
pub trait Incoming: Send + 'static {
    /// Stream produced by the handshake
    type Stream: Stream;

    /// Remote address, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Complete the handshake
    async fn establish(self) -> TransportResult<Connection<Self::Stream>>;
}

/// Client side: opens connections to one server
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Stream produced by a successful dial
    type Stream: Stream;

    /// Connect and complete the handshake
    async fn dial(&self) -> TransportResult<Connection<Self::Stream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_disconnect() {
        assert!(TransportError::Closed.is_disconnect());
        assert!(TransportError::Io(io::ErrorKind::BrokenPipe.into()).is_disconnect());
        assert!(TransportError::Io(io::ErrorKind::UnexpectedEof.into()).is_disconnect());
        assert!(!TransportError::Io(io::ErrorKind::PermissionDenied.into()).is_disconnect());
        assert!(!TransportError::HandshakeTimeout(Duration::from_secs(1)).is_disconnect());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::BindFailed("address in use".into());
        assert_eq!(err.to_string(), "Failed to bind to address: address in use");

        let err = TransportError::InvalidServerName("not a name".into());
        assert_eq!(err.to_string(), "Invalid server name: not a name");
    }
}
