//! Core types for the server.
//!
//! - **IDs**: correlation ids and channel ids
//! - **Errors**: application error types with thiserror derives and wire kinds
//! - **Config**: configuration structures for database, pool, and transport

mod config;
mod errors;
mod ids;

pub use config::{
    Config, DatabaseConfig, ObservabilityConfig, PoolConfig, TransportConfig, TransportMode,
    DEFAULT_CONNECTION_STRING,
};
pub use errors::{Error, ErrorKind, Result};
pub use ids::{ChannelId, RequestId};
