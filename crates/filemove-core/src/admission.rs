//! Admission control for server-side sessions.
//!
//! A fixed pool of tokens bounds how many sessions run at once. The accept
//! loop takes a token before spawning a connection's task; when the pool is
//! exhausted it waits, and further connections queue in the listen backlog.
//!
//! Tokens are RAII guards. Dropping one returns its slot and removes the
//! session from the registry, whatever path the owning task exits by, so a
//! token is released exactly once. The registry also makes running sessions
//! cancellable: a stalled peer can be reaped with
//! [`AdmissionController::cancel_older_than`].

use crate::identity::Username;
use crate::session::SessionId;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

/// Admission errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The pool was closed for shutdown
    #[error("admission pool is closed")]
    Closed,
}

/// Snapshot of admission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionMetrics {
    /// Pool capacity
    pub capacity: usize,
    /// Tokens currently held
    pub active: usize,
    /// Tokens ever handed out
    pub admitted: u64,
    /// Tokens returned
    pub released: u64,
    /// Acquisitions that had to wait for a free slot
    pub waited: u64,
    /// Highest number of tokens held at once
    pub peak_active: usize,
}

/// A running session, as seen by the admission layer
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// Session identifier
    pub id: SessionId,
    /// Username the session runs as
    pub username: Username,
    /// Peer address, if known
    pub peer_addr: Option<SocketAddr>,
    /// When the token was handed out
    pub admitted_at: Instant,
    cancel: CancellationToken,
}

impl ActiveSession {
    /// Time since admission
    pub fn age(&self) -> Duration {
        self.admitted_at.elapsed()
    }
}

struct Inner {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    registry: DashMap<SessionId, ActiveSession>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    admitted: AtomicU64,
    released: AtomicU64,
    waited: AtomicU64,
    idle: Notify,
}

/// Bounded pool of session tokens
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    /// Create a pool of `capacity` tokens
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "admission capacity must be at least 1");
        Self {
            inner: Arc::new(Inner {
                capacity,
                semaphore: Arc::new(Semaphore::new(capacity)),
                registry: DashMap::new(),
                active: AtomicUsize::new(0),
                peak_active: AtomicUsize::new(0),
                admitted: AtomicU64::new(0),
                released: AtomicU64::new(0),
                waited: AtomicU64::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Take a token, waiting while the pool is exhausted
    pub async fn acquire(
        &self,
        username: &Username,
        peer_addr: Option<SocketAddr>,
    ) -> Result<AdmissionToken, AdmissionError> {
        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(AdmissionError::Closed),
            Err(TryAcquireError::NoPermits) => {
                self.inner.waited.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Admission pool exhausted ({} active), waiting for a free slot",
                    self.active_count()
                );
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| AdmissionError::Closed)?
            }
        };
        Ok(self.admit(permit, username, peer_addr))
    }

    /// Take a token if one is free right now
    pub fn try_acquire(
        &self,
        username: &Username,
        peer_addr: Option<SocketAddr>,
    ) -> Result<Option<AdmissionToken>, AdmissionError> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(Some(self.admit(permit, username, peer_addr))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(AdmissionError::Closed),
        }
    }

    fn admit(
        &self,
        permit: OwnedSemaphorePermit,
        username: &Username,
        peer_addr: Option<SocketAddr>,
    ) -> AdmissionToken {
        let id = SessionId::next();
        let cancel = CancellationToken::new();

        self.inner.registry.insert(
            id,
            ActiveSession {
                id,
                username: username.clone(),
                peer_addr,
                admitted_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );

        let active = self.inner.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak_active.fetch_max(active, Ordering::Relaxed);
        self.inner.admitted.fetch_add(1, Ordering::Relaxed);

        AdmissionToken {
            id,
            cancel,
            permit: Some(permit),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Tokens currently held
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Tokens free right now
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Running sessions
    pub fn sessions(&self) -> Vec<ActiveSession> {
        self.inner
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Cancel one session; returns false if it is not running
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.inner.registry.get(&id) {
            Some(entry) => {
                tracing::info!("Cancelling session {}", id);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running session; returns how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.inner.registry.iter() {
            entry.cancel.cancel();
            count += 1;
        }
        if count > 0 {
            tracing::info!("Cancelled {} running session(s)", count);
        }
        count
    }

    /// Cancel sessions admitted more than `age` ago
    pub fn cancel_older_than(&self, age: Duration) -> usize {
        let mut count = 0;
        for entry in self.inner.registry.iter() {
            if entry.age() > age && !entry.cancel.is_cancelled() {
                tracing::warn!(
                    "Reaping session {} for {} (running {:?})",
                    entry.id,
                    entry.username,
                    entry.age()
                );
                entry.cancel.cancel();
                count += 1;
            }
        }
        count
    }

    /// Wait until every token has been returned
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Close the pool: pending and future acquisitions fail with `Closed`
    ///
    /// Tokens already handed out stay valid.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    /// Whether the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    /// Counter snapshot
    pub fn metrics(&self) -> AdmissionMetrics {
        AdmissionMetrics {
            capacity: self.inner.capacity,
            active: self.active_count(),
            admitted: self.inner.admitted.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            waited: self.inner.waited.load(Ordering::Relaxed),
            peak_active: self.inner.peak_active.load(Ordering::Relaxed),
        }
    }
}

/// A held admission slot
///
/// Dropping the token releases the slot.
pub struct AdmissionToken {
    id: SessionId,
    cancel: CancellationToken,
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl AdmissionToken {
    /// Identifier of the session this token admits
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Token the admission layer cancels the session through
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        // Counters settle before the slot can be handed to a waiter
        self.inner.registry.remove(&self.id);
        let remaining = self.inner.active.fetch_sub(1, Ordering::AcqRel) - 1;
        self.inner.released.fetch_add(1, Ordering::Relaxed);
        drop(self.permit.take());
        tracing::debug!("Session {} released its admission token", self.id);

        if remaining == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for AdmissionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionToken")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Username {
        Username::new("alice").unwrap()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = AdmissionController::new(2);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire(&alice(), None).await.unwrap();
        let b = pool.acquire(&alice(), None).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire(&alice(), None).unwrap().is_none());

        drop(a);
        assert_eq!(pool.active_count(), 1);
        assert!(pool.try_acquire(&alice(), None).unwrap().is_some());

        drop(b);
        let m = pool.metrics();
        assert_eq!(m.admitted, 3);
        assert_eq!(m.released, 3);
        assert_eq!(m.active, 0);
        assert_eq!(m.peak_active, 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = AdmissionController::new(1);
        let held = pool.acquire(&alice(), None).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&alice(), None).await.map(|t| t.id()) })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(pool.metrics().waited, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_active_never_exceeds_capacity_under_contention() {
        let pool = AdmissionController::new(1);

        let mut workers = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            workers.push(tokio::spawn(async move {
                for _ in 0..2_000 {
                    let token = pool.acquire(&alice(), None).await.unwrap();
                    assert!(pool.active_count() <= 1);
                    drop(token);
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        let m = pool.metrics();
        assert_eq!(m.peak_active, 1);
        assert_eq!(m.active, 0);
        assert_eq!(m.admitted, 16_000);
        assert_eq!(m.released, 16_000);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let pool = AdmissionController::new(1);
        let _held = pool.acquire(&alice(), None).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&alice(), None).await.map(|t| t.id()) })
        };
        tokio::task::yield_now().await;

        pool.close();
        assert_eq!(waiter.await.unwrap(), Err(AdmissionError::Closed));
        assert!(pool.is_closed());
        assert!(matches!(
            pool.try_acquire(&alice(), None),
            Err(AdmissionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_cancel_reaches_token() {
        let pool = AdmissionController::new(4);
        let a = pool.acquire(&alice(), None).await.unwrap();
        let b = pool.acquire(&alice(), None).await.unwrap();

        assert!(pool.cancel(a.id()));
        assert!(a.cancellation().is_cancelled());
        assert!(!b.cancellation().is_cancelled());

        assert_eq!(pool.cancel_all(), 2);
        assert!(b.cancellation().is_cancelled());

        let gone = a.id();
        drop(a);
        assert!(!pool.cancel(gone));
        assert_eq!(pool.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_older_than() {
        let pool = AdmissionController::new(4);
        let old = pool.acquire(&alice(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let young = pool.acquire(&alice(), None).await.unwrap();

        assert_eq!(pool.cancel_older_than(Duration::from_millis(25)), 1);
        assert!(old.cancellation().is_cancelled());
        assert!(!young.cancellation().is_cancelled());

        // Already cancelled sessions are not counted again
        assert_eq!(pool.cancel_older_than(Duration::from_millis(25)), 0);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let pool = AdmissionController::new(2);
        pool.wait_idle().await;

        let token = pool.acquire(&alice(), None).await.unwrap();
        let idle = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!idle.is_finished());

        drop(token);
        idle.await.unwrap();
    }

    #[test]
    #[should_panic(expected = "admission capacity")]
    fn test_zero_capacity_panics() {
        let _ = AdmissionController::new(0);
    }
}
