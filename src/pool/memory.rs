//! In-process session double.
//!
//! Answers queries from a caller-supplied responder instead of a database.
//! Used by the test suites and handy for exercising the protocol surface
//! without a running server.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::session::{Connector, DbSession, QueryCanceller, QueryOutput};
use crate::types::{Error, Result};

type Responder = dyn Fn(&str, &[String]) -> Result<QueryOutput> + Send + Sync;

/// Counters observed across every session the connector opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connects: usize,
    pub closed: usize,
    pub pings: usize,
    pub cancels: usize,
    pub queries: Vec<String>,
}

struct Shared {
    healthy: AtomicBool,
    fail_connect: AtomicBool,
    query_delay_ms: AtomicUsize,
    ping_delay_ms: AtomicUsize,
    connect_delay_ms: AtomicUsize,
    connects: AtomicUsize,
    closed: AtomicUsize,
    pings: AtomicUsize,
    cancels: AtomicUsize,
    queries: Mutex<Vec<String>>,
    responder: Mutex<Arc<Responder>>,
}

/// Connector producing [`MemorySession`]s. Clones share configuration and counters.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnector")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_response(_sql: &str, _params: &[String]) -> Result<QueryOutput> {
    Ok(QueryOutput::default())
}

impl MemoryConnector {
    /// Every query answers with zero columns and zero rows.
    pub fn new() -> Self {
        let responder: Arc<Responder> = Arc::new(empty_response);
        Self {
            shared: Arc::new(Shared {
                healthy: AtomicBool::new(true),
                fail_connect: AtomicBool::new(false),
                query_delay_ms: AtomicUsize::new(0),
                ping_delay_ms: AtomicUsize::new(0),
                connect_delay_ms: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                pings: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
                responder: Mutex::new(responder),
            }),
        }
    }

    /// Replace the query responder.
    pub fn on_query<F>(&self, responder: F)
    where
        F: Fn(&str, &[String]) -> Result<QueryOutput> + Send + Sync + 'static,
    {
        *lock(&self.shared.responder) = Arc::new(responder);
    }

    /// When false, health checks fail.
    pub fn set_healthy(&self, healthy: bool) {
        self.shared.healthy.store(healthy, Ordering::SeqCst);
    }

    /// When true, `connect` fails as if the server were unreachable.
    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every query before the responder runs.
    pub fn set_query_delay(&self, delay: Duration) {
        self.shared
            .query_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Delay applied to every health check.
    pub fn set_ping_delay(&self, delay: Duration) {
        self.shared
            .ping_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Delay before `connect` answers, as with an unresponsive host.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared
            .connect_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            connects: self.shared.connects.load(Ordering::SeqCst),
            closed: self.shared.closed.load(Ordering::SeqCst),
            pings: self.shared.pings.load(Ordering::SeqCst),
            cancels: self.shared.cancels.load(Ordering::SeqCst),
            queries: lock(&self.shared.queries).clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn sleep_ms(delay_ms: &AtomicUsize) {
    let delay = delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn DbSession>> {
        sleep_ms(&self.shared.connect_delay_ms).await;
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::database("connection refused"));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
        }))
    }
}

/// One fake session.
pub struct MemorySession {
    shared: Arc<Shared>,
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession").finish_non_exhaustive()
    }
}

#[async_trait]
impl DbSession for MemorySession {
    async fn query(&mut self, sql: &str, params: &[String]) -> Result<QueryOutput> {
        lock(&self.shared.queries).push(sql.to_string());
        sleep_ms(&self.shared.query_delay_ms).await;
        let responder = lock(&self.shared.responder).clone();
        responder(sql, params)
    }

    async fn ping(&mut self) -> Result<()> {
        self.shared.pings.fetch_add(1, Ordering::SeqCst);
        sleep_ms(&self.shared.ping_delay_ms).await;
        if self.shared.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::database("server closed the connection unexpectedly"))
        }
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn canceller(&self) -> Option<Arc<dyn QueryCanceller>> {
        Some(Arc::new(MemoryCanceller {
            shared: self.shared.clone(),
        }))
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemoryCanceller {
    shared: Arc<Shared>,
}

#[async_trait]
impl QueryCanceller for MemoryCanceller {
    async fn cancel(&self) {
        self.shared.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_responder_receives_params() {
        let connector = MemoryConnector::new();
        connector.on_query(|sql, params| {
            let mut out = QueryOutput::new(vec!["sql".to_string(), "p".to_string()]);
            let mut row = serde_json::Map::new();
            row.insert("sql".to_string(), json!(sql));
            row.insert("p".to_string(), json!(params.first()));
            out.rows.push(row);
            Ok(out)
        });

        let mut session = connector.connect().await.unwrap();
        let out = session.query("SELECT $1", &["x".to_string()]).await.unwrap();
        assert_eq!(out.row_count(), 1);
        assert_eq!(out.rows[0]["p"], json!("x"));
        assert_eq!(connector.stats().queries, vec!["SELECT $1".to_string()]);
    }

    #[tokio::test]
    async fn test_drop_counts_close() {
        let connector = MemoryConnector::new();
        let session = connector.connect().await.unwrap();
        drop(session);
        let stats = connector.stats();
        assert_eq!((stats.connects, stats.closed), (1, 1));
    }
}
