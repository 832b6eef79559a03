//! Transport layer: newline-delimited JSON-RPC (MCP) over stdio or TCP.

pub mod channel;
pub mod codec;
pub mod protocol;
pub mod server;

pub use channel::McpChannel;
pub use codec::{write_frame, FrameReader};
pub use server::McpServer;
