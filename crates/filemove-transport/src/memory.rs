//! In-memory transport.
//!
//! A [`MemoryDialer`] hands one end of a `tokio::io::duplex` pipe to its
//! paired [`MemoryListener`] for every dial. There is no handshake. Used to
//! drive the session engine in tests without sockets or certificates.

use crate::transport::{Connection, Dialer, Incoming, Listener, TransportError, TransportResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};

/// Default pipe buffer size
pub const DEFAULT_PIPE_BUFFER: usize = 64 * 1024;

/// Create a connected listener/dialer pair
pub fn pair(pipe_buffer: usize) -> (MemoryListener, MemoryDialer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryListener { rx: Mutex::new(rx) },
        MemoryDialer { tx, pipe_buffer },
    )
}

/// Listener side of an in-memory transport
pub struct MemoryListener {
    rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

/// Dialer side of an in-memory transport
#[derive(Clone)]
pub struct MemoryDialer {
    tx: mpsc::UnboundedSender<DuplexStream>,
    pipe_buffer: usize,
}

/// Connection accepted by a [`MemoryListener`]
pub struct MemoryIncoming {
    stream: DuplexStream,
}

#[async_trait]
impl Listener for MemoryListener {
    type Incoming = MemoryIncoming;

    async fn accept(&self) -> TransportResult<MemoryIncoming> {
        let stream = self.rx.lock().await.recv().await.ok_or(TransportError::Closed)?;
        Ok(MemoryIncoming { stream })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[async_trait]
impl Incoming for MemoryIncoming {
    type Stream = DuplexStream;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn establish(self) -> TransportResult<Connection<DuplexStream>> {
        Ok(Connection {
            stream: self.stream,
            peer_addr: None,
        })
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Stream = DuplexStream;

    async fn dial(&self) -> TransportResult<Connection<DuplexStream>> {
        let (client, server) = tokio::io::duplex(self.pipe_buffer);
        self.tx.send(server).map_err(|_| TransportError::Closed)?;
        Ok(Connection {
            stream: client,
            peer_addr: None,
        })
    }
}
