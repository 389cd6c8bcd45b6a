//! Session: one connection carrying one transfer.
//!
//! A session owns its stream exclusively. The frame is read through the
//! same buffered reader as the byte stream that follows, so no stream bytes
//! are lost to read-ahead. Every network operation races the session's
//! cancellation token and deadline.
//!
//! The deadline measures inactivity: it moves forward each time a frame or
//! a chunk of the byte stream goes through, so a long transfer that keeps
//! making progress never times out while a stalled one does.

use crate::error::{FrameError, TransferError, TransferResult};
use crate::frame::{self, FrameFormat, ReadFrameError, Response};
use crate::identity::Username;
use crate::transfer::ProgressSink;
use filemove_transport::TransportError;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Time allowed for a graceful close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Byte counters of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes read from the peer (frames and stream)
    pub bytes_read: u64,
    /// Bytes written to the peer (frames and stream)
    pub bytes_written: u64,
}

/// One connection bound to a username
pub struct Session<S> {
    id: SessionId,
    username: Username,
    stream: BufReader<S>,
    peer_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    deadline: Deadline,
    stats: SessionStats,
}

/// Inactivity deadline, renewed on progress
#[derive(Debug, Clone, Copy, Default)]
struct Deadline {
    timeout: Option<Duration>,
    at: Option<Instant>,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            at: timeout.map(|t| Instant::now() + t),
        }
    }

    fn renew(&mut self) {
        self.at = self.timeout.map(|t| Instant::now() + t);
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established stream
    pub fn new(id: SessionId, username: Username, stream: S) -> Self {
        Self {
            id,
            username,
            stream: BufReader::new(stream),
            peer_addr: None,
            cancel: CancellationToken::new(),
            deadline: Deadline::default(),
            stats: SessionStats::default(),
        }
    }
}

impl<S> Session<S> {
    /// Record the peer address
    pub fn with_peer(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fail once `timeout` passes without progress (`None` disables it)
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = Deadline::new(timeout);
        self
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Authenticated username
    pub fn username(&self) -> &Username {
        &self.username
    }

    /// Peer address, if known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Byte counters so far
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Current deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.at
    }

    /// Cancellation token of this session
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Peer description for logs
    pub fn peer_label(&self) -> String {
        self.peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "<local>".to_string())
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read one frame and split it into fields
    pub async fn read_frame(
        &mut self,
        format: FrameFormat,
        limit: usize,
    ) -> TransferResult<Vec<String>> {
        let Self {
            stream,
            cancel,
            deadline,
            stats,
            ..
        } = self;

        let fields = guarded(cancel, deadline.at, async {
            frame::read_fields(stream, format, limit)
                .await
                .map_err(|e| match e {
                    ReadFrameError::Closed => TransferError::Transport(TransportError::Closed),
                    ReadFrameError::Io(e) => TransferError::net(e),
                    ReadFrameError::TooLong { limit, action } => {
                        TransferError::malformed(action, FrameError::TooLong { limit })
                    }
                    ReadFrameError::Frame(e) => TransferError::malformed(None, e),
                })
        })
        .await?;

        deadline.renew();
        stats.bytes_read += frame::wire_len(&fields, format) as u64;
        Ok(fields)
    }

    /// Send one frame
    pub async fn write_frame<T: AsRef<str>>(
        &mut self,
        fields: &[T],
        format: FrameFormat,
    ) -> TransferResult<()> {
        let bytes = frame::encode_fields(fields, format)
            .map_err(|e| TransferError::malformed(None, e))?;
        self.write_raw(&bytes).await
    }

    /// Send a response frame
    pub async fn write_response(
        &mut self,
        response: Response,
        format: FrameFormat,
    ) -> TransferResult<()> {
        self.write_frame(&response.to_fields(format), format).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> TransferResult<()> {
        let Self {
            stream,
            cancel,
            deadline,
            stats,
            ..
        } = self;

        guarded(cancel, deadline.at, async {
            let inner = stream.get_mut();
            inner.write_all(bytes).await.map_err(TransferError::net)?;
            inner.flush().await.map_err(TransferError::net)
        })
        .await?;

        deadline.renew();
        stats.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Copy exactly `size` bytes from the peer into `sink`
    ///
    /// EOF before `size` bytes fails with `IncompleteTransfer`. Errors
    /// writing to `sink` are storage errors.
    pub async fn receive_into<W>(
        &mut self,
        sink: &mut W,
        size: u64,
        chunk_size: usize,
        progress: &dyn ProgressSink,
    ) -> TransferResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let Self {
            stream,
            cancel,
            deadline,
            stats,
            ..
        } = self;

        let mut received = 0u64;
        let result = async {
            let mut buf = vec![0u8; chunk_size.max(1)];
            while received < size {
                let want = (size - received).min(buf.len() as u64) as usize;
                let chunk = &mut buf[..want];
                let n = guarded(cancel, deadline.at, async {
                    stream.read(chunk).await.map_err(TransferError::net)
                })
                .await?;
                if n == 0 {
                    return Err(TransferError::IncompleteTransfer {
                        expected: size,
                        received,
                    });
                }
                let chunk = &buf[..n];
                guarded(cancel, deadline.at, async {
                    sink.write_all(chunk).await.map_err(TransferError::storage)
                })
                .await?;
                received += n as u64;
                progress.advance(n as u64);
                deadline.renew();
            }
            guarded(cancel, deadline.at, async {
                sink.flush().await.map_err(TransferError::storage)
            })
            .await
        }
        .await;

        stats.bytes_read += received;
        result.map(|()| received)
    }

    /// Copy exactly `size` bytes from `source` to the peer
    ///
    /// A source shorter than `size` is a storage error: the peer expects
    /// exactly the declared number of bytes.
    pub async fn send_from<R>(
        &mut self,
        source: &mut R,
        size: u64,
        chunk_size: usize,
        progress: &dyn ProgressSink,
    ) -> TransferResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let Self {
            stream,
            cancel,
            deadline,
            stats,
            ..
        } = self;

        let mut sent = 0u64;
        let result = async {
            let out = stream.get_mut();
            let mut buf = vec![0u8; chunk_size.max(1)];
            while sent < size {
                let want = (size - sent).min(buf.len() as u64) as usize;
                let chunk = &mut buf[..want];
                let n = guarded(cancel, deadline.at, async {
                    source.read(chunk).await.map_err(TransferError::storage)
                })
                .await?;
                if n == 0 {
                    return Err(TransferError::storage(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("source ended after {sent} of {size} bytes"),
                    )));
                }
                let chunk = &buf[..n];
                guarded(cancel, deadline.at, async {
                    out.write_all(chunk).await.map_err(TransferError::net)
                })
                .await?;
                sent += n as u64;
                progress.advance(n as u64);
                deadline.renew();
            }
            guarded(cancel, deadline.at, async {
                out.flush().await.map_err(TransferError::net)
            })
            .await
        }
        .await;

        stats.bytes_written += sent;
        result.map(|()| sent)
    }

    /// Shut the stream down and return the final counters
    ///
    /// Consumes the session, so it is closed exactly once. Shutdown errors
    /// are logged and otherwise ignored; dropping the stream closes the
    /// connection regardless.
    pub async fn close(mut self) -> SessionStats {
        let shutdown = tokio::time::timeout(CLOSE_TIMEOUT, self.stream.get_mut().shutdown()).await;
        match shutdown {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::trace!("Session {} shutdown error: {}", self.id, e),
            Err(_) => tracing::trace!("Session {} shutdown timed out", self.id),
        }

        tracing::debug!(
            "Session {} closed ({} bytes in, {} bytes out)",
            self.id,
            self.stats.bytes_read,
            self.stats.bytes_written
        );
        self.stats
    }
}

/// Run `fut` unless the session is cancelled or its deadline passes first
async fn guarded<T, F>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> TransferResult<T>
where
    F: Future<Output = TransferResult<T>>,
{
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        _ = expiry => Err(TransferError::Timeout),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::NoProgress;
    use tokio::io::duplex;

    fn alice() -> Username {
        Username::new("alice").unwrap()
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(format!("{}", SessionId(7)), "#7");
    }

    #[tokio::test]
    async fn test_frame_then_stream() {
        let (client, server) = duplex(1024);
        let mut tx = Session::new(SessionId::next(), alice(), client);
        let mut rx = Session::new(SessionId::next(), alice(), server);

        tx.write_frame(&["alice", "Download", "a.txt"], FrameFormat::Delimited)
            .await
            .unwrap();
        let mut src: &[u8] = b"0123456789";
        tx.send_from(&mut src, 10, 4, &NoProgress).await.unwrap();

        let fields = rx.read_frame(FrameFormat::Delimited, 2048).await.unwrap();
        assert_eq!(fields, vec!["alice", "Download", "a.txt"]);

        let mut sink = Vec::new();
        let n = rx.receive_into(&mut sink, 10, 3, &NoProgress).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(sink, b"0123456789");
        assert_eq!(tx.stats().bytes_written, 21 + 10);
    }

    #[tokio::test]
    async fn test_short_stream_is_incomplete() {
        let (client, server) = duplex(1024);
        let mut tx = Session::new(SessionId::next(), alice(), client);
        let mut rx = Session::new(SessionId::next(), alice(), server);

        let mut src: &[u8] = b"0123456789";
        tx.send_from(&mut src, 10, 64, &NoProgress).await.unwrap();
        tx.close().await;

        let mut sink = Vec::new();
        let err = rx
            .receive_into(&mut sink, 17, 64, &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::IncompleteTransfer {
                expected: 17,
                received: 10
            }
        ));
    }

    #[tokio::test]
    async fn test_short_source_is_storage_error() {
        let (client, _server) = duplex(1024);
        let mut tx = Session::new(SessionId::next(), alice(), client);

        let mut src: &[u8] = b"abc";
        let err = tx.send_from(&mut src, 5, 64, &NoProgress).await.unwrap_err();
        assert!(matches!(err, TransferError::Storage(_)));
    }

    #[tokio::test]
    async fn test_read_frame_on_closed_stream() {
        let (client, server) = duplex(64);
        drop(client);
        let mut rx = Session::new(SessionId::next(), alice(), server);
        let err = rx.read_frame(FrameFormat::Delimited, 2048).await.unwrap_err();
        assert!(matches!(err, TransferError::Transport(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses() {
        let (_client, server) = duplex(64);
        let mut rx = Session::new(SessionId::next(), alice(), server)
            .with_timeout(Some(Duration::from_secs(30)));

        let err = rx.read_frame(FrameFormat::Delimited, 2048).await.unwrap_err();
        assert!(matches!(err, TransferError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_stream_outlives_timeout() {
        let (mut client, server) = duplex(64);
        let mut rx = Session::new(SessionId::next(), alice(), server)
            .with_timeout(Some(Duration::from_secs(30)));

        let writer = tokio::spawn(async move {
            for i in 0..10u8 {
                client.write_all(&[i; 10]).await.unwrap();
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });

        let started = Instant::now();
        let mut sink = Vec::new();
        let n = rx.receive_into(&mut sink, 100, 64, &NoProgress).await.unwrap();
        assert_eq!(n, 100);
        assert!(started.elapsed() > Duration::from_secs(30));
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_mid_stream_times_out() {
        let (mut client, server) = duplex(64);
        let mut rx = Session::new(SessionId::next(), alice(), server)
            .with_timeout(Some(Duration::from_secs(30)));

        let writer = tokio::spawn(async move {
            client.write_all(&[1; 10]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = client.write_all(&[2; 10]).await;
        });

        let mut sink = Vec::new();
        let err = rx
            .receive_into(&mut sink, 20, 64, &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout));
        assert_eq!(sink, [1; 10]);
        writer.abort();
    }

    #[tokio::test]
    async fn test_oversized_frame_keeps_action() {
        let (mut client, server) = duplex(8 * 1024);
        let mut rx = Session::new(SessionId::next(), alice(), server);

        let line = format!("alice|Upload|{}|17|00\n", "n".repeat(3000));
        client.write_all(line.as_bytes()).await.unwrap();

        let err = rx.read_frame(FrameFormat::Delimited, 2048).await.unwrap_err();
        assert_eq!(err.response(), Some(Response::InvalidUploadMetadata));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (_client, server) = duplex(64);
        let token = CancellationToken::new();
        let mut rx =
            Session::new(SessionId::next(), alice(), server).with_cancellation(token.clone());

        let reader = tokio::spawn(async move { rx.read_frame(FrameFormat::Delimited, 2048).await });
        tokio::task::yield_now().await;
        token.cancel();

        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
