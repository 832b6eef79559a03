//! One MCP session over a byte stream: read frames → route → write responses.
//!
//! `tools/call` requests run as independent tasks; every other method is
//! answered inline. All outbound frames go through a single writer task so
//! concurrent responses never interleave on the wire.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::codec::{write_frame, FrameReader};
use super::protocol::{
    call_tool_result, initialize_result, tools_list_result, CallToolParams, CancelledParams,
    JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    JSONRPC_VERSION, METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::dispatch::{Dispatcher, ToolRequest};
use crate::types::{ChannelId, Error, RequestId, Result, TransportConfig};

/// Outbound frames buffered before tool tasks start waiting on the writer.
const OUTBOUND_QUEUE: usize = 64;

type InFlight = Arc<Mutex<HashMap<RequestId, CancellationToken>>>;

/// A spawned `tools/call`, tagged with its id so a panic can still be answered.
type ToolTask = BoxFuture<'static, (RequestId, std::result::Result<(), JoinError>)>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The most recent `capacity` request ids, oldest evicted first.
struct RecentIds {
    order: VecDeque<RequestId>,
    members: HashSet<RequestId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`. Returns false if it is already remembered.
    fn insert(&mut self, id: &RequestId) -> bool {
        if !self.members.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }
}

/// Per-run state shared by the read loop and the frame handlers.
struct Session {
    outbound: mpsc::Sender<Vec<u8>>,
    in_flight: InFlight,
    /// Recent `tools/call` ids, bounded by `request_id_window`.
    seen: RecentIds,
    /// Parent of every request token; cancelled when the channel closes.
    closing: CancellationToken,
    tasks: FuturesUnordered<ToolTask>,
}

/// MCP endpoint bound to one reader/writer pair.
#[derive(Debug)]
pub struct McpChannel {
    id: ChannelId,
    dispatcher: Arc<Dispatcher>,
    config: TransportConfig,
    idle_timeout: Option<Duration>,
}

impl McpChannel {
    pub fn new(dispatcher: Arc<Dispatcher>, config: TransportConfig) -> Self {
        Self {
            id: ChannelId::new(),
            dispatcher,
            config,
            idle_timeout: None,
        }
    }

    /// Close the channel after this long without inbound frames while no
    /// request is in flight.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Serve until EOF, a transport failure, idleness, or `shutdown`.
    ///
    /// In-flight requests are cancelled on the way out; each still gets its
    /// response written if the peer is listening.
    pub async fn run<R, W>(self, reader: R, writer: W, shutdown: CancellationToken) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let span = tracing::info_span!("channel", channel_id = %self.id);
        self.serve(reader, writer, shutdown).instrument(span).await
    }

    async fn serve<R, W>(self, reader: R, writer: W, shutdown: CancellationToken) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut frames = FrameReader::new(reader, self.config.max_frame_bytes);
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer_failed = CancellationToken::new();
        let writer_task = tokio::spawn(
            write_loop(writer, rx, self.config.write_timeout, writer_failed.clone())
                .in_current_span(),
        );

        let mut session = Session {
            outbound,
            in_flight: Arc::default(),
            seen: RecentIds::new(self.config.request_id_window),
            closing: CancellationToken::new(),
            tasks: FuturesUnordered::new(),
        };
        let mut last_activity = Instant::now();
        tracing::info!("channel_opened");

        let outcome = loop {
            let idle_deadline = match self.idle_timeout {
                Some(limit) if session.tasks.is_empty() => Some(last_activity + limit),
                _ => None,
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("channel closing for server shutdown");
                    break Ok(());
                }
                _ = writer_failed.cancelled() => {
                    break Err(Error::transport("outbound stream failed"));
                }
                Some((id, joined)) = session.tasks.next(), if !session.tasks.is_empty() => {
                    reap(&session.outbound, &session.in_flight, id, joined).await;
                    last_activity = Instant::now();
                }
                _ = idle(idle_deadline) => {
                    tracing::info!(
                        idle_ms = self.idle_timeout.unwrap_or_default().as_millis() as u64,
                        "channel idle, closing"
                    );
                    break Ok(());
                }
                frame = frames.next_frame() => match frame {
                    Ok(Some(bytes)) => {
                        last_activity = Instant::now();
                        self.handle_frame(&bytes, &mut session).await;
                    }
                    Ok(None) => {
                        tracing::debug!("channel input closed");
                        break Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "channel read failed");
                        if e.kind() == io::ErrorKind::InvalidData {
                            send(
                                &session.outbound,
                                &JsonRpcResponse::error(None, INVALID_REQUEST, e.to_string()),
                            )
                            .await;
                        }
                        break Err(Error::transport(e.to_string()));
                    }
                },
            }
        };

        let pending = lock(&session.in_flight).len();
        if pending > 0 {
            tracing::info!(pending, "cancelling in-flight requests");
        }
        session.closing.cancel();
        while let Some((id, joined)) = session.tasks.next().await {
            reap(&session.outbound, &session.in_flight, id, joined).await;
        }
        drop(session);

        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "channel writer stopped"),
            Err(e) => tracing::error!(error = %e, "channel writer task failed"),
        }
        tracing::info!("channel_closed");
        outcome
    }

    async fn handle_frame(&self, bytes: &[u8], session: &mut Session) {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                let response = JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {}", e));
                send(&session.outbound, &response).await;
                return;
            }
        };
        if !value.is_object() {
            let response =
                JsonRpcResponse::error(None, INVALID_REQUEST, "Request must be a JSON object");
            send(&session.outbound, &response).await;
            return;
        }

        let id = value
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                let response =
                    JsonRpcResponse::error(id, INVALID_REQUEST, format!("Invalid request: {}", e));
                send(&session.outbound, &response).await;
                return;
            }
        };
        if request.jsonrpc != JSONRPC_VERSION {
            if !request.is_notification() {
                let response = JsonRpcResponse::error(
                    request.id,
                    INVALID_REQUEST,
                    format!("Unsupported jsonrpc version: {}", request.jsonrpc),
                );
                send(&session.outbound, &response).await;
            }
            return;
        }

        tracing::debug!(method = %request.method, id = ?request.id, "rpc_received");
        match (request.method.as_str(), request.id) {
            ("notifications/cancelled", _) => cancel_request(request.params, session),
            (method, None) => tracing::debug!(method, "ignoring notification"),
            ("initialize", Some(id)) => {
                tracing::info!(client = %request.params["clientInfo"]["name"], "client_initialized");
                let response = JsonRpcResponse::success(id, initialize_result(&request.params));
                send(&session.outbound, &response).await;
            }
            ("ping", Some(id)) => {
                send(&session.outbound, &JsonRpcResponse::success(id, json!({}))).await;
            }
            ("tools/list", Some(id)) => {
                let result = tools_list_result(self.dispatcher.registry());
                send(&session.outbound, &JsonRpcResponse::success(id, result)).await;
            }
            ("tools/call", Some(id)) => self.start_tool_call(id, request.params, session).await,
            (method, Some(id)) => {
                let response = JsonRpcResponse::error(
                    Some(id),
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                );
                send(&session.outbound, &response).await;
            }
        }
    }

    async fn start_tool_call(&self, id: RequestId, params: Value, session: &mut Session) {
        let params: CallToolParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                let response =
                    JsonRpcResponse::error(Some(id), INVALID_PARAMS, format!("Invalid params: {}", e));
                send(&session.outbound, &response).await;
                return;
            }
        };

        let in_flight = lock(&session.in_flight).contains_key(&id);
        if in_flight || !session.seen.insert(&id) {
            let message = format!("Request id {} was already used on this channel", id);
            send(
                &session.outbound,
                &JsonRpcResponse::error(Some(id), INVALID_REQUEST, message),
            )
            .await;
            return;
        }

        let token = session.closing.child_token();
        lock(&session.in_flight).insert(id.clone(), token.clone());

        let request = ToolRequest {
            id: id.clone(),
            tool: params.name,
            arguments: params.arguments,
        };
        let dispatcher = self.dispatcher.clone();
        let outbound = session.outbound.clone();
        let in_flight = session.in_flight.clone();
        let task = tokio::spawn(
            async move {
                let response = dispatcher.dispatch_with_cancel(request, &token).await;
                lock(&in_flight).remove(&response.id);
                let reply =
                    JsonRpcResponse::success(response.id, call_tool_result(&response.result));
                send(&outbound, &reply).await;
            }
            .in_current_span(),
        );
        session
            .tasks
            .push(async move { (id, task.await) }.boxed());
    }
}

/// Settle a finished tool task. A task that panicked never wrote its
/// response, so answer it here.
async fn reap(
    outbound: &mpsc::Sender<Vec<u8>>,
    in_flight: &InFlight,
    id: RequestId,
    joined: std::result::Result<(), JoinError>,
) {
    let Err(e) = joined else {
        return;
    };
    tracing::error!(request_id = %id, error = %e, "tool task failed");
    lock(in_flight).remove(&id);
    let response = JsonRpcResponse::error(Some(id), INTERNAL_ERROR, "Internal error");
    send(outbound, &response).await;
}

fn cancel_request(params: Value, session: &Session) {
    let params: CancelledParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => {
            tracing::debug!(error = %e, "malformed cancellation notice");
            return;
        }
    };
    let token = lock(&session.in_flight).get(&params.request_id).cloned();
    match token {
        Some(token) => {
            tracing::info!(
                request_id = %params.request_id,
                reason = params.reason.as_deref().unwrap_or(""),
                "request_cancelled_by_client"
            );
            token.cancel();
        }
        None => tracing::debug!(request_id = %params.request_id, "cancellation for unknown request"),
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Queue one response for the writer. Dropped with a log line if the
/// writer is gone.
async fn send(outbound: &mpsc::Sender<Vec<u8>>, response: &JsonRpcResponse) {
    match serde_json::to_vec(response) {
        Ok(bytes) => {
            if outbound.send(bytes).await.is_err() {
                tracing::debug!(id = ?response.id, "writer closed, response dropped");
            }
        }
        Err(e) => tracing::error!(error = %e, "response encoding failed"),
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
    failed: CancellationToken,
) -> io::Result<()> {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = timed_write(&mut writer, &frame, timeout).await {
            failed.cancel();
            return Err(e);
        }
    }
    writer.shutdown().await
}

/// Write a frame, failing with `TimedOut` if the peer stops reading.
async fn timed_write<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    timeout: Duration,
) -> io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, payload))
        .await
        .map_err(|_| {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "write timeout, dropping channel");
            io::Error::new(io::ErrorKind::TimedOut, "write timeout")
        })?
}
