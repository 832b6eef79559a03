//! Request dispatcher: runs one tool call on a pooled connection.
//!
//! Every request walks `Received → Validated → Executing → Completed | Failed`
//! and ends with exactly one [`ToolResult`]. The pool is the only admission
//! control: a request does not leave `Validated` until it holds a session.

mod redact;
mod types;

pub use redact::Redactor;
pub use types::{RequestState, ToolFailure, ToolRequest, ToolResponse, ToolResult};

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionPool;
use crate::tools::ToolRegistry;
use crate::types::{Error, RequestId, Result};

/// Tracks one request's state and logs each transition.
#[derive(Debug)]
struct Lifecycle<'a> {
    id: &'a RequestId,
    tool: &'a str,
    state: RequestState,
}

impl<'a> Lifecycle<'a> {
    fn new(id: &'a RequestId, tool: &'a str) -> Self {
        tracing::debug!(request_id = %id, tool, state = %RequestState::Received, "request_state");
        Self {
            id,
            tool,
            state: RequestState::Received,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(!self.state.is_terminal(), "request already finished");
        tracing::debug!(
            request_id = %self.id,
            tool = self.tool,
            from = %self.state,
            state = %next,
            "request_state"
        );
        self.state = next;
    }
}

/// Routes tool requests to handlers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    pool: ConnectionPool,
    redactor: Redactor,
    query_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Takes ownership of the registry; it cannot change afterwards.
    pub fn new(registry: ToolRegistry, pool: ConnectionPool) -> Self {
        Self {
            registry: Arc::new(registry),
            pool,
            redactor: Redactor::default(),
            query_timeout: None,
        }
    }

    /// Limit how long a handler may run once it holds a connection.
    pub fn with_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Strings masked out of every failure message.
    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.redactor = Redactor::new(secrets);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Dispatch without external cancellation.
    pub async fn dispatch(&self, request: ToolRequest) -> ToolResponse {
        self.dispatch_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Dispatch a request. `cancel` interrupts it cooperatively at either
    /// suspension point (waiting for a connection, running the handler).
    pub async fn dispatch_with_cancel(
        &self,
        request: ToolRequest,
        cancel: &CancellationToken,
    ) -> ToolResponse {
        let started = Instant::now();
        let mut lifecycle = Lifecycle::new(&request.id, &request.tool);

        let result = match self.run(&request, cancel, &mut lifecycle).await {
            Ok(payload) => {
                lifecycle.advance(RequestState::Completed);
                tracing::info!(
                    request_id = %request.id,
                    tool = %request.tool,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool_call_completed"
                );
                ToolResult::Success(payload)
            }
            Err(err) => {
                lifecycle.advance(RequestState::Failed);
                let mut failure = ToolFailure::from_error(&err);
                failure.message = self.redactor.redact(&failure.message);
                tracing::warn!(
                    request_id = %request.id,
                    tool = %request.tool,
                    kind = %failure.kind,
                    error = %failure.message,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool_call_failed"
                );
                ToolResult::Failure(failure)
            }
        };

        ToolResponse {
            id: request.id,
            result,
        }
    }

    async fn run(
        &self,
        request: &ToolRequest,
        cancel: &CancellationToken,
        lifecycle: &mut Lifecycle<'_>,
    ) -> Result<Value> {
        let definition = self.registry.resolve(&request.tool)?;
        let arguments: Map<String, Value> = definition.validate(&request.arguments)?;
        lifecycle.advance(RequestState::Validated);

        let mut conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::cancelled("request cancelled while waiting for a connection"));
            }
            acquired = self.pool.acquire() => acquired?,
        };
        lifecycle.advance(RequestState::Executing);

        let canceller = conn.canceller();
        let interrupted = {
            let call = definition.handler.invoke(conn.session(), &arguments);
            let deadline = async {
                match self.query_timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                result = call => Ok(result),
                _ = cancel.cancelled() => Err(Error::cancelled("request cancelled")),
                _ = deadline => Err(Error::cancelled(format!(
                    "query exceeded the {}ms timeout",
                    self.query_timeout.unwrap_or_default().as_millis()
                ))),
            }
        };

        match interrupted {
            Ok(result) => {
                // Dropping the release mid-check discards the session.
                tokio::select! {
                    biased;
                    _ = self.pool.release(conn) => {}
                    _ = cancel.cancelled() => {
                        tracing::debug!(request_id = %request.id, "release interrupted by cancellation");
                    }
                }
                result
            }
            Err(reason) => {
                // The statement may still be running server-side and the
                // session's protocol state is unknown: cancel it and drop
                // the session instead of pooling it.
                if let Some(canceller) = canceller {
                    tokio::spawn(async move { canceller.cancel().await });
                }
                conn.discard();
                drop(conn);
                Err(reason)
            }
        }
    }
}
