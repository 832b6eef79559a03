//! Tool infrastructure: registry, schemas, built-in PostgreSQL tools.

pub mod builtin;
pub mod registry;

pub use registry::{Handler, ParamDef, ParamType, ToolDefinition, ToolHandler, ToolRegistry};
