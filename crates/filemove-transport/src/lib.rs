//! # FileMove Transport
//!
//! Transport layer for the FileMove protocol.
//!
//! This crate provides:
//! - `Listener`/`Incoming`/`Dialer` traits that the session engine is written against
//! - TLS over TCP (rustls, ring provider) with handshake and connect timeouts
//! - TCP listeners with an explicit accept backlog
//! - An in-memory transport for tests and embedding

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dialer;
pub mod listener;
pub mod memory;
pub mod tls;
pub mod transport;

pub use dialer::TlsDialer;
pub use listener::{TlsIncoming, TlsListener, bind_tcp};
pub use transport::{
    Connection, Dialer, Incoming, Listener, Stream, TransportError, TransportResult,
};

use std::time::Duration;

/// Default TLS handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default accept backlog. Connections beyond the admission bound wait here.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Time allowed for the TLS handshake
    pub handshake_timeout: Duration,
    /// Time allowed for the TCP connect
    pub connect_timeout: Duration,
    /// Listen backlog
    pub backlog: u32,
    /// Disable Nagle's algorithm on accepted and dialed sockets
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backlog: DEFAULT_BACKLOG,
            nodelay: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.backlog, 128);
        assert!(config.nodelay);
    }
}
