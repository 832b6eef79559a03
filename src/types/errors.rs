//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Every variant maps onto one wire-level
//! [`ErrorKind`], which is what MCP clients see in a failed tool result.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the server.
#[derive(Error, Debug)]
pub enum Error {
    /// No tool registered under the requested name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// A tool with this name is already registered.
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    /// Arguments do not satisfy the tool's declared schema.
    #[error("invalid argument '{field}': {message}")]
    InvalidArgument { field: String, message: String },

    /// No pooled connection became available in time.
    #[error("no database connection available within {}ms", .0.as_millis())]
    PoolTimeout(Duration),

    /// The pool is shutting down and no longer hands out connections.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The database rejected or failed the operation.
    #[error("database error: {0}")]
    Database(String),

    /// Malformed frame or broken channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// Request cancelled by the client, a timeout, or a closing channel.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Invalid startup configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire-level failure kind carried in `ToolResult.failure.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownToolError,
    DuplicateToolError,
    InvalidArgumentError,
    PoolTimeoutError,
    PoolClosedError,
    DatabaseError,
    TransportError,
    CancelledError,
    ConfigError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownToolError => "UnknownToolError",
            ErrorKind::DuplicateToolError => "DuplicateToolError",
            ErrorKind::InvalidArgumentError => "InvalidArgumentError",
            ErrorKind::PoolTimeoutError => "PoolTimeoutError",
            ErrorKind::PoolClosedError => "PoolClosedError",
            ErrorKind::DatabaseError => "DatabaseError",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::CancelledError => "CancelledError",
            ErrorKind::ConfigError => "ConfigError",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Map to the wire-level failure kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownTool(_) => ErrorKind::UnknownToolError,
            Error::DuplicateTool(_) => ErrorKind::DuplicateToolError,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgumentError,
            Error::PoolTimeout(_) => ErrorKind::PoolTimeoutError,
            Error::PoolClosed => ErrorKind::PoolClosedError,
            Error::Database(_) => ErrorKind::DatabaseError,
            Error::Transport(_) | Error::Io(_) => ErrorKind::TransportError,
            Error::Cancelled(_) => ErrorKind::CancelledError,
            Error::Config(_) => ErrorKind::ConfigError,
            Error::Internal(_) | Error::Serialization(_) => ErrorKind::InternalError,
        }
    }

    /// Offending field for argument errors.
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::InvalidArgument { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Message without the variant prefix, for failure descriptors.
    pub fn detail(&self) -> String {
        match self {
            Error::UnknownTool(name) => format!("Unknown tool: {}", name),
            Error::DuplicateTool(name) => format!("Tool already registered: {}", name),
            Error::InvalidArgument { message, .. } => message.clone(),
            Error::Database(msg)
            | Error::Transport(msg)
            | Error::Cancelled(msg)
            | Error::Config(msg)
            | Error::Internal(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn unknown_tool(name: impl Into<String>) -> Self {
        Self::UnknownTool(name.into())
    }

    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => Error::Database(format!("{} (SQLSTATE {})", db.message(), db.code().code())),
            None => Error::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::unknown_tool("x").kind(), ErrorKind::UnknownToolError);
        assert_eq!(
            Error::PoolTimeout(Duration::from_millis(5)).kind(),
            ErrorKind::PoolTimeoutError
        );
        assert_eq!(Error::PoolClosed.kind(), ErrorKind::PoolClosedError);
        assert_eq!(Error::database("boom").kind(), ErrorKind::DatabaseError);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(Error::from(io).kind(), ErrorKind::TransportError);
    }

    #[test]
    fn test_invalid_argument_carries_field() {
        let err = Error::invalid_argument("msg", "Missing required parameter: msg");
        assert_eq!(err.field(), Some("msg"));
        assert_eq!(err.detail(), "Missing required parameter: msg");
        assert_eq!(err.to_string(), "invalid argument 'msg': Missing required parameter: msg");
    }

    #[test]
    fn test_kind_serializes_as_name() {
        let json = serde_json::to_value(ErrorKind::PoolTimeoutError).unwrap();
        assert_eq!(json, "PoolTimeoutError");
        assert_eq!(ErrorKind::DatabaseError.to_string(), "DatabaseError");
    }
}
