//! # postgres-mcp-server - Model Context Protocol server for PostgreSQL
//!
//! Exposes a PostgreSQL database to MCP clients as a small set of tools:
//! - `pg_query`: run SQL, refusing obviously destructive statements unless asked
//! - `pg_schema_info`: column metadata for tables in `public`
//! - `pg_list_tables`: tables and views in a schema
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────────────────────────────────┐
//!  stdio / TCP  →  │ transport ──→ dispatch ──→ tools ──→ pool    │ → PostgreSQL
//!  (JSON-RPC)   ←  │  (channel)    (lifecycle)  (handlers) (sessions)
//!                  └──────────────────────────────────────────────┘
//! ```
//!
//! The connection pool is the only admission control: a tool request runs
//! only while it holds one of a fixed number of database sessions.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod dispatch;
pub mod pool;
pub mod tools;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
