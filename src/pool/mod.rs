//! Connection Manager: bounded pool of database sessions.
//!
//! - `session`: the `Connector` / `DbSession` seam the pool is built on
//! - `manager`: the pool itself (admission, health check, shutdown)
//! - `postgres`: production sessions over `tokio-postgres`
//! - `memory`: in-process sessions for tests and offline use

mod decode;
pub mod manager;
pub mod memory;
pub mod postgres;
pub mod session;

pub use manager::{ConnectionPool, PoolStatus, PooledConnection, ShutdownReport};
pub use memory::{MemoryConnector, MemoryStats};
pub use postgres::PgConnector;
pub use session::{Connector, DbSession, QueryCanceller, QueryOutput};
