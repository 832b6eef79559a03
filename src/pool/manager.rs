//! Bounded connection pool.
//!
//! Admission is a semaphore with `max_size` permits: a caller holding a
//! permit owns exactly one session slot. The idle set and the checked-out
//! counter live behind a single mutex; no other state is shared.
//!
//! ```text
//!   acquire ──► permit ──► idle.pop() ──► PooledConnection
//!                             │ empty
//!                             └─► Connector::connect()
//!
//!   release ──► ping (bounded) ──► healthy ? idle.push() : discard
//! ```

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::session::{Connector, DbSession, QueryCanceller};
use crate::types::{Error, PoolConfig, Result};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub checked_out: usize,
}

/// Outcome of [`ConnectionPool::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Idle sessions closed during shutdown.
    pub closed: usize,
    /// Sessions still checked out when the grace period ended.
    pub outstanding: usize,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Box<dyn DbSession>>,
    checked_out: usize,
    closed: bool,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closing: CancellationToken,
    returned: Notify,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Critical sections never panic while holding the guard, so a
        // poisoned lock still holds consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pop a reusable idle session and count it as checked out.
    fn check_out_idle(&self) -> Option<Box<dyn DbSession>> {
        let mut state = self.lock();
        while let Some(session) = state.idle.pop_front() {
            if session.is_closed() {
                tracing::debug!("discarding closed idle session");
                continue;
            }
            state.checked_out += 1;
            return Some(session);
        }
        None
    }

    /// Count a freshly connected session as checked out.
    fn check_out_new(&self, session: Box<dyn DbSession>) -> Result<Box<dyn DbSession>> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }
        state.checked_out += 1;
        Ok(session)
    }

    /// Return a session. Unhealthy sessions, and any session once the pool
    /// is closed, are dropped instead of pooled.
    fn check_in(&self, session: Box<dyn DbSession>, healthy: bool) {
        let discarded = {
            let mut state = self.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
            if healthy && !state.closed {
                state.idle.push_back(session);
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = discarded {
            tracing::debug!(healthy, "session discarded on release");
            drop(session);
        }
        self.returned.notify_waiters();
    }
}

/// Fixed-size pool of database sessions.
///
/// Cloning is cheap; all clones share the same sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool. No session is opened until the first acquisition.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                permits,
                state: Mutex::new(PoolState::default()),
                closing: CancellationToken::new(),
                returned: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a session.
    ///
    /// `acquire_timeout` bounds the whole call: waiting for a slot plus
    /// opening a new session when no idle one is available.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        if self.inner.closing.is_cancelled() {
            return Err(Error::PoolClosed);
        }

        let timeout = self.inner.config.acquire_timeout;
        let deadline = Instant::now() + timeout;
        let timed_out = |stage: &'static str| {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                max_size = self.inner.config.max_size,
                stage,
                "pool_acquire_timeout"
            );
            Error::PoolTimeout(timeout)
        };

        let permit = tokio::select! {
            _ = self.inner.closing.cancelled() => return Err(Error::PoolClosed),
            acquired = tokio::time::timeout_at(deadline, self.inner.permits.clone().acquire_owned()) => {
                match acquired {
                    Err(_elapsed) => return Err(timed_out("waiting for slot")),
                    Ok(Err(_closed)) => return Err(Error::PoolClosed),
                    Ok(Ok(permit)) => permit,
                }
            }
        };

        let session = match self.inner.check_out_idle() {
            Some(session) => session,
            None => {
                let session = tokio::select! {
                    _ = self.inner.closing.cancelled() => return Err(Error::PoolClosed),
                    connected = tokio::time::timeout_at(deadline, self.inner.connector.connect()) => {
                        match connected {
                            Err(_elapsed) => return Err(timed_out("connecting")),
                            Ok(session) => session?,
                        }
                    }
                };
                tracing::debug!("opened new database session");
                self.inner.check_out_new(session)?
            }
        };

        Ok(PooledConnection {
            session: Some(session),
            discard: false,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Return a session after checking its health.
    ///
    /// Consumes the handle, so a connection can be released only once. The
    /// check is bounded by `health_check_timeout`. If this future is dropped
    /// mid-check the session is discarded rather than pooled.
    pub async fn release(&self, mut conn: PooledConnection) {
        let healthy = match conn.session.as_deref() {
            None => return,
            Some(session) => !conn.discard && !session.is_closed(),
        };
        let healthy = healthy && self.health_check(&mut conn).await.is_ok();
        if let Some(session) = conn.session.take() {
            conn.pool.check_in(session, healthy);
        }
    }

    /// Ping a checked-out session under `health_check_timeout`.
    ///
    /// The connection stays marked for discard until the ping answers.
    async fn health_check(&self, conn: &mut PooledConnection) -> Result<()> {
        let limit = self.inner.config.health_check_timeout;
        let discard = std::mem::replace(&mut conn.discard, true);
        let outcome = match tokio::time::timeout(limit, conn.session().ping()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(Error::database(format!(
                "health check did not answer within {}ms",
                limit.as_millis()
            ))),
        };
        match &outcome {
            Ok(()) => conn.discard = discard,
            Err(e) => tracing::warn!(error = %e, "session failed health check, discarding"),
        }
        outcome
    }

    /// Open (or reuse) one session and ping it. Used at startup to fail
    /// fast when the database is unreachable.
    pub async fn warm_up(&self) -> Result<()> {
        let mut conn = self.acquire().await?;
        let checked = self.health_check(&mut conn).await;
        if let Some(session) = conn.session.take() {
            conn.pool.check_in(session, checked.is_ok());
        }
        checked
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            max_size: self.inner.config.max_size,
            idle: state.idle.len(),
            checked_out: state.checked_out,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    /// Stop handing out sessions, wait up to `grace` for checked-out ones to
    /// come back, then close every idle session.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.inner.closing.cancel();
        self.inner.lock().closed = true;
        self.inner.permits.close();

        let deadline = Instant::now() + grace;
        loop {
            let returned = self.inner.returned.notified();
            if self.inner.lock().checked_out == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, returned).await.is_err() {
                break;
            }
        }

        let (idle, outstanding) = {
            let mut state = self.inner.lock();
            let idle: Vec<Box<dyn DbSession>> = state.idle.drain(..).collect();
            (idle, state.checked_out)
        };
        let closed = idle.len();
        drop(idle);

        if outstanding > 0 {
            tracing::warn!(outstanding, "pool shutdown grace period elapsed with sessions checked out");
        }
        tracing::info!(closed, outstanding, "connection pool shut down");
        ShutdownReport {
            closed,
            outstanding,
        }
    }
}

/// A checked-out session.
///
/// Exclusively owned by one handler invocation. Dropping it returns the
/// session to the pool without a health check; prefer
/// [`ConnectionPool::release`] on the normal path.
pub struct PooledConnection {
    session: Option<Box<dyn DbSession>>,
    discard: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Borrow the underlying session.
    pub fn session(&mut self) -> &mut dyn DbSession {
        match self.session.as_deref_mut() {
            Some(session) => session,
            // Only `release` and `drop` take the session, and both consume self.
            None => unreachable!("pooled session accessed after release"),
        }
    }

    /// Do not return this session to the idle set (e.g. after a cancelled
    /// statement left it in an unknown state).
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn canceller(&self) -> Option<Arc<dyn QueryCanceller>> {
        self.session.as_ref().and_then(|s| s.canceller())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let healthy = !self.discard && !session.is_closed();
            self.pool.check_in(session, healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory::MemoryConnector;
    use crate::pool::session::MockConnector;

    fn config(max_size: usize, acquire_ms: u64) -> PoolConfig {
        PoolConfig {
            max_size,
            acquire_timeout: Duration::from_millis(acquire_ms),
            shutdown_grace: Duration::from_millis(100),
            ..PoolConfig::default()
        }
    }

    fn pool(connector: &MemoryConnector, max_size: usize) -> ConnectionPool {
        ConnectionPool::new(Arc::new(connector.clone()), config(max_size, 100))
    }

    #[tokio::test]
    async fn test_sessions_created_lazily() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, 3);
        assert_eq!(connector.stats().connects, 0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(connector.stats().connects, 1);
        assert_eq!(pool.status().checked_out, 1);

        pool.release(conn).await;
        assert_eq!(
            pool.status(),
            PoolStatus {
                max_size: 3,
                idle: 1,
                checked_out: 0
            }
        );
    }

    #[tokio::test]
    async fn test_idle_session_reused() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, 2);

        for _ in 0..5 {
            let conn = pool.acquire().await.unwrap();
            pool.release(conn).await;
        }
        assert_eq!(connector.stats().connects, 1);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_drop_returns_session() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, 1);

        {
            let _conn = pool.acquire().await.unwrap();
            assert_eq!(pool.status().checked_out, 1);
        }
        assert_eq!(pool.status().checked_out, 0);
        assert_eq!(pool.status().idle, 1);
        // Slot is free again.
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_broken_session_discarded_and_replaced() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, 1);

        let conn = pool.acquire().await.unwrap();
        connector.set_healthy(false);
        pool.release(conn).await;
        assert_eq!(pool.status().idle, 0);
        assert_eq!(connector.stats().closed, 1);

        connector.set_healthy(true);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(connector.stats().connects, 2);
        pool.release(conn).await;
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_discarded_connection_not_pooled() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, 1);

        let mut conn = pool.acquire().await.unwrap();
        conn.discard();
        drop(conn);
        assert_eq!(pool.status(), PoolStatus { max_size: 1, idle: 0, checked_out: 0 });
        assert_eq!(connector.stats().closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_after_configured_duration() {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(Arc::new(connector.clone()), config(1, 500));
        let held = pool.acquire().await.unwrap();

        let start = tokio::time::Instant::now();
        let err = pool.acquire().await.unwrap_err();
        let waited = start.elapsed();

        assert!(matches!(err, Error::PoolTimeout(_)));
        assert!(waited >= Duration::from_millis(500), "timed out early: {:?}", waited);
        pool.release(held).await;
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(Arc::new(connector.clone()), config(1, 2_000));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(held).await;
        waiter.await.unwrap().unwrap();
        assert_eq!(connector.stats().connects, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_frees_slot() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(2)
            .returning(|| Err(Error::database("connection refused")));
        let pool = ConnectionPool::new(Arc::new(connector), config(1, 100));

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        // The permit was returned, so the second attempt reaches the connector
        // instead of timing out.
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert_eq!(pool.status().checked_out, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_and_rejects_acquire() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        let report = pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report, ShutdownReport { closed: 2, outstanding: 0 });
        assert_eq!(connector.stats().closed, 2);
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_checked_out() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, 1);
        let conn = pool.acquire().await.unwrap();

        let releaser = {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                pool.release(conn).await;
            })
        };

        let report = pool.shutdown(Duration::from_secs(5)).await;
        releaser.await.unwrap();
        assert_eq!(report.outstanding, 0);
        // Returned after close, so it was closed rather than pooled.
        assert_eq!(pool.status().idle, 0);
        assert_eq!(connector.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_pending_acquire() {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(Arc::new(connector.clone()), config(1, 10_000));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown(Duration::from_millis(200)).await })
        };
        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
        drop(held);
        let report = shutdown.await.unwrap();
        assert_eq!(report.outstanding, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connect_bounded_by_acquire_timeout() {
        let connector = MemoryConnector::new();
        connector.set_connect_delay(Duration::from_secs(3600));
        let pool = ConnectionPool::new(Arc::new(connector.clone()), config(1, 500));

        let start = tokio::time::Instant::now();
        let err = pool.acquire().await.unwrap_err();
        let waited = start.elapsed();

        assert!(matches!(err, Error::PoolTimeout(_)));
        assert!(waited >= Duration::from_millis(500), "timed out early: {:?}", waited);
        assert!(waited < Duration::from_secs(1), "connect not bounded: {:?}", waited);
        // The slot came back with the abandoned attempt.
        assert_eq!(pool.status(), PoolStatus { max_size: 1, idle: 0, checked_out: 0 });
        connector.set_connect_delay(Duration::ZERO);
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_pending_connect() {
        let connector = MemoryConnector::new();
        connector.set_connect_delay(Duration::from_secs(3600));
        let pool = ConnectionPool::new(Arc::new(connector.clone()), config(1, 60_000));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = pool.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
        assert_eq!(report.outstanding, 0);
        assert_eq!(connector.stats().connects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_health_check_discards_session() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, 1);
        let conn = pool.acquire().await.unwrap();

        connector.set_ping_delay(Duration::from_secs(3600));
        let start = tokio::time::Instant::now();
        pool.release(conn).await;
        assert!(start.elapsed() < Duration::from_secs(3600));
        assert!(start.elapsed() >= PoolConfig::default().health_check_timeout);

        assert_eq!(pool.status(), PoolStatus { max_size: 1, idle: 0, checked_out: 0 });
        assert_eq!(connector.stats().closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_release_discards_session() {
        let connector = MemoryConnector::new();
        let pool = pool(&connector, 1);
        let conn = pool.acquire().await.unwrap();

        connector.set_ping_delay(Duration::from_secs(3600));
        let abandoned = tokio::time::timeout(Duration::from_millis(10), pool.release(conn)).await;
        assert!(abandoned.is_err());

        assert_eq!(pool.status(), PoolStatus { max_size: 1, idle: 0, checked_out: 0 });
        assert_eq!(connector.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_warm_up_fails_when_unreachable() {
        let connector = MemoryConnector::new();
        connector.set_fail_connect(true);
        let pool = pool(&connector, 1);
        assert!(matches!(pool.warm_up().await, Err(Error::Database(_))));

        connector.set_fail_connect(false);
        pool.warm_up().await.unwrap();
        assert_eq!(pool.status().idle, 1);
    }
}
