//! Database session seam.
//!
//! The pool is agnostic of the driver: it stores `Box<dyn DbSession>` values
//! produced by a [`Connector`]. The production implementation lives in
//! [`super::postgres`]; [`super::memory`] provides an in-process double.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::types::Result;

/// Rows returned by one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutput {
    /// Column names in result order.
    pub columns: Vec<String>,
    /// One JSON object per row, keyed by column name.
    pub rows: Vec<Map<String, Value>>,
}

impl QueryOutput {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// One open database session.
///
/// A session is owned by exactly one party at a time: the pool's idle set or
/// the handler holding the checked-out connection.
#[async_trait]
pub trait DbSession: Send {
    /// Run one statement with positional text parameters (`$1`, `$2`, ...).
    async fn query(&mut self, sql: &str, params: &[String]) -> Result<QueryOutput>;

    /// Health check used when the session is returned to the pool.
    async fn ping(&mut self) -> Result<()>;

    /// Whether the underlying connection is known to be gone.
    fn is_closed(&self) -> bool;

    /// Handle able to interrupt a statement running on this session.
    fn canceller(&self) -> Option<Arc<dyn QueryCanceller>>;
}

/// Out-of-band cancellation of a running statement.
#[async_trait]
pub trait QueryCanceller: Send + Sync {
    /// Best effort; failures are logged by the implementation.
    async fn cancel(&self);
}

/// Opens new sessions on demand.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn DbSession>>;
}
