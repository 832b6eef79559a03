//! MCP server: stdio session or TCP accept loop.

use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::channel::McpChannel;
use crate::dispatch::Dispatcher;
use crate::types::{Error, Result, TransportConfig};

/// Protocol server wrapping the dispatcher.
#[derive(Debug)]
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
    config: TransportConfig,
    cancel: CancellationToken,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: TransportConfig) -> Self {
        Self {
            dispatcher,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Serve one session over the process's stdin/stdout.
    pub async fn serve_stdio(&self) -> Result<()> {
        tracing::info!("serving MCP over stdio");
        let channel = McpChannel::new(self.dispatcher.clone(), self.config.clone());
        channel
            .run(
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
                self.cancel.child_token(),
            )
            .await
    }

    /// Bind `listen_addr` and run the accept loop.
    pub async fn serve_tcp(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| Error::transport(format!("cannot bind {}: {}", self.config.listen_addr, e)))?;
        self.serve_listener(listener).await
    }

    /// Run the accept loop until [`McpServer::shutdown`], then wait for open
    /// channels to finish.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        let max_channels = self.config.max_channels;
        let channel_slots = Arc::new(Semaphore::new(max_channels));
        let mut channels = JoinSet::new();
        tracing::info!(
            addr = %listener.local_addr()?,
            max_channels,
            "MCP server listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("MCP server shutting down");
                    break;
                }
                Some(finished) = channels.join_next(), if !channels.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!(error = %e, "channel task failed");
                    }
                }
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            // Per-connection accept failures (e.g. reset before
                            // accept) must not stop the server.
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let permit = match channel_slots.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(%peer, max_channels, "connection rejected: at max_channels");
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!(
                        %peer,
                        active = max_channels - channel_slots.available_permits(),
                        "connection accepted"
                    );
                    let channel = McpChannel::new(self.dispatcher.clone(), self.config.clone())
                        .with_idle_timeout(Some(self.config.idle_timeout));
                    let shutdown = self.cancel.child_token();
                    channels.spawn(async move {
                        if let Err(e) = handle_connection(channel, stream, shutdown, permit).await {
                            tracing::warn!(%peer, error = %e, "channel closed with error");
                        }
                    });
                }
            }
        }

        while let Some(finished) = channels.join_next().await {
            if let Err(e) = finished {
                tracing::error!(error = %e, "channel task failed");
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn handle_connection(
    channel: McpChannel,
    stream: TcpStream,
    shutdown: CancellationToken,
    _permit: OwnedSemaphorePermit, // held for the channel's lifetime
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    channel.run(BufReader::new(reader), writer, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, MemoryConnector};
    use crate::tools::ToolRegistry;
    use crate::types::PoolConfig;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    fn server(max_channels: usize) -> Arc<McpServer> {
        let pool = ConnectionPool::new(Arc::new(MemoryConnector::new()), PoolConfig::default());
        let dispatcher = Arc::new(Dispatcher::new(ToolRegistry::with_builtin_tools().unwrap(), pool));
        let config = TransportConfig {
            max_channels,
            ..TransportConfig::default()
        };
        Arc::new(McpServer::new(dispatcher, config))
    }

    async fn ping(stream: TcpStream, id: i64) -> Value {
        let (reader, mut writer) = stream.into_split();
        let line = format!(r#"{{"jsonrpc":"2.0","id":{},"method":"ping"}}"#, id);
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let server = server(4);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_listener(listener).await })
        };

        // A channel that dies mid-frame does not affect others.
        let mut broken = TcpStream::connect(addr).await.unwrap();
        broken.write_all(b"{\"jsonrpc\":").await.unwrap();
        drop(broken);

        let a = ping(TcpStream::connect(addr).await.unwrap(), 1).await;
        let b = ping(TcpStream::connect(addr).await.unwrap(), 2).await;
        assert_eq!(a["id"], 1);
        assert_eq!(b["id"], 2);

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connections_beyond_limit_are_refused() {
        let server = server(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_listener(listener).await })
        };

        let (held_reader, mut held_writer) = TcpStream::connect(addr).await.unwrap().into_split();
        held_writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        let mut held_lines = BufReader::new(held_reader).lines();
        assert!(held_lines.next_line().await.unwrap().is_some());

        let (extra_reader, _extra_writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut extra_lines = BufReader::new(extra_reader).lines();
        let refused = tokio::time::timeout(Duration::from_secs(5), extra_lines.next_line())
            .await
            .unwrap();
        // Closed without a response (EOF or reset).
        assert!(!matches!(refused, Ok(Some(_))));

        server.shutdown();
        running.await.unwrap().unwrap();
    }
}
