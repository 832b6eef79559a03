//! Tool registry: typed parameter schemas, validation, handler lookup.
//!
//! Built once at startup, then moved behind an `Arc` and only read. Handlers
//! are a closed set of built-in variants plus an escape hatch for injected
//! implementations, so dispatch is a `match` rather than a string lookup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::builtin;
use crate::pool::DbSession;
use crate::types::{Error, Result};

// =============================================================================
// Parameter types
// =============================================================================

/// Parameter type for tool inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    StringList,
    Enum(Vec<String>),
    Optional(Box<ParamType>),
}

impl ParamType {
    /// Validate a JSON value against this parameter type.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        match self {
            ParamType::String => {
                if value.is_string() {
                    Ok(())
                } else {
                    Err(format!("expected string, got {}", value_type_name(value)))
                }
            }
            ParamType::Int => {
                if value.is_i64() || value.is_u64() {
                    Ok(())
                } else {
                    Err(format!("expected integer, got {}", value_type_name(value)))
                }
            }
            ParamType::Float => {
                if value.is_number() {
                    Ok(())
                } else {
                    Err(format!("expected number, got {}", value_type_name(value)))
                }
            }
            ParamType::Bool => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    Err(format!("expected boolean, got {}", value_type_name(value)))
                }
            }
            ParamType::StringList => {
                if let Some(arr) = value.as_array() {
                    for (i, item) in arr.iter().enumerate() {
                        if !item.is_string() {
                            return Err(format!(
                                "expected string at index {}, got {}",
                                i,
                                value_type_name(item)
                            ));
                        }
                    }
                    Ok(())
                } else {
                    Err(format!("expected array, got {}", value_type_name(value)))
                }
            }
            ParamType::Enum(variants) => {
                if let Some(s) = value.as_str() {
                    if variants.iter().any(|v| v == s) {
                        Ok(())
                    } else {
                        Err(format!(
                            "invalid enum value '{}', expected one of: {}",
                            s,
                            variants.join(", ")
                        ))
                    }
                } else {
                    Err(format!("expected string for enum, got {}", value_type_name(value)))
                }
            }
            ParamType::Optional(inner) => {
                if value.is_null() {
                    Ok(())
                } else {
                    inner.validate(value)
                }
            }
        }
    }

    /// JSON Schema fragment for MCP `inputSchema`.
    pub fn json_schema(&self) -> Value {
        match self {
            ParamType::String => json!({"type": "string"}),
            ParamType::Int => json!({"type": "integer"}),
            ParamType::Float => json!({"type": "number"}),
            ParamType::Bool => json!({"type": "boolean"}),
            ParamType::StringList => json!({"type": "array", "items": {"type": "string"}}),
            ParamType::Enum(variants) => json!({"type": "string", "enum": variants}),
            ParamType::Optional(inner) => inner.json_schema(),
        }
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Parameter definition
// =============================================================================

/// A single parameter definition for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamDef {
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            default: None,
        }
    }

    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        Self::required(name, ParamType::Optional(Box::new(param_type)), description)
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none() && !matches!(self.param_type, ParamType::Optional(_))
    }

    fn json_schema(&self) -> Value {
        let mut schema = self.param_type.json_schema();
        if let Some(obj) = schema.as_object_mut() {
            obj.insert("description".to_string(), json!(self.description));
            if let Some(default) = &self.default {
                obj.insert("default".to_string(), default.clone());
            }
        }
        schema
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// An injected tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run one logical operation on the borrowed session. `arguments` have
    /// already been validated and defaulted.
    async fn call(&self, session: &mut dyn DbSession, arguments: &Map<String, Value>)
        -> Result<Value>;
}

/// Handler capability of a tool.
#[derive(Clone)]
pub enum Handler {
    /// `pg_query`: run caller-supplied SQL.
    Query,
    /// `pg_schema_info`: column metadata of public tables.
    SchemaInfo,
    /// `pg_list_tables`: tables in one schema.
    ListTables,
    Custom(Arc<dyn ToolHandler>),
}

impl Handler {
    /// Run the handler with a checked-out session.
    pub async fn invoke(
        &self,
        session: &mut dyn DbSession,
        arguments: &Map<String, Value>,
    ) -> Result<Value> {
        match self {
            Handler::Query => builtin::pg_query(session, arguments).await,
            Handler::SchemaInfo => builtin::pg_schema_info(session, arguments).await,
            Handler::ListTables => builtin::pg_list_tables(session, arguments).await,
            Handler::Custom(handler) => handler.call(session, arguments).await,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Query => f.write_str("Query"),
            Handler::SchemaInfo => f.write_str("SchemaInfo"),
            Handler::ListTables => f.write_str("ListTables"),
            Handler::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Handler::Query, Handler::Query)
            | (Handler::SchemaInfo, Handler::SchemaInfo)
            | (Handler::ListTables, Handler::ListTables) => true,
            (Handler::Custom(a), Handler::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// =============================================================================
// Tool definition
// =============================================================================

/// Complete tool definition: metadata, input schema, handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParamDef>,
    pub handler: Handler,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, handler: Handler) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
            handler,
        }
    }

    pub fn param(mut self, param: ParamDef) -> Self {
        self.parameters.push(param);
        self
    }

    /// Validate arguments and fill declared defaults.
    ///
    /// Parameters are checked in declaration order, then unknown keys in
    /// sorted order; the first violation names its field.
    pub fn validate(&self, arguments: &Value) -> Result<Map<String, Value>> {
        let mut args = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(Error::invalid_argument(
                    "arguments",
                    format!("Arguments must be a JSON object, got {}", value_type_name(other)),
                ))
            }
        };

        for param in &self.parameters {
            match args.get(&param.name) {
                Some(value) => {
                    if let Err(e) = param.param_type.validate(value) {
                        return Err(Error::invalid_argument(
                            &param.name,
                            format!("Parameter '{}': {}", param.name, e),
                        ));
                    }
                }
                None if param.is_required() => {
                    return Err(Error::invalid_argument(
                        &param.name,
                        format!("Missing required parameter: {}", param.name),
                    ));
                }
                None => {}
            }
        }

        let mut unknown: Vec<&String> = args
            .keys()
            .filter(|key| !self.parameters.iter().any(|p| &p.name == *key))
            .collect();
        unknown.sort();
        if let Some(key) = unknown.first() {
            return Err(Error::invalid_argument(
                key.as_str(),
                format!("Unknown parameter: {}", key),
            ));
        }

        self.fill_defaults(&mut args);
        Ok(args)
    }

    /// Fill in default values for missing optional parameters.
    pub fn fill_defaults(&self, args: &mut Map<String, Value>) {
        for param in &self.parameters {
            if !args.contains_key(&param.name) {
                if let Some(default) = &param.default {
                    args.insert(param.name.clone(), default.clone());
                }
            }
        }
    }

    /// JSON Schema object describing the arguments.
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.json_schema()))
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.is_required())
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Entry for an MCP `tools/list` response.
    pub fn to_mcp(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema(),
        })
    }
}

// =============================================================================
// Tool registry
// =============================================================================

/// Name → definition map. Mutable only until it is handed to the dispatcher.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    entries: HashMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry preloaded with the PostgreSQL tools.
    pub fn with_builtin_tools() -> Result<Self> {
        let mut registry = Self::new();
        for definition in builtin::definitions() {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    /// Register a tool. Names are unique.
    pub fn register(&mut self, definition: ToolDefinition) -> Result<()> {
        if definition.name.is_empty() {
            return Err(Error::invalid_argument("name", "Tool name cannot be empty"));
        }
        if self.entries.contains_key(&definition.name) {
            return Err(Error::DuplicateTool(definition.name));
        }
        tracing::debug!(tool = %definition.name, "tool_registered");
        self.entries.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Result<&ToolDefinition> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::unknown_tool(name))
    }

    /// All definitions, sorted by name.
    pub fn list(&self) -> Vec<&ToolDefinition> {
        let mut entries: Vec<&ToolDefinition> = self.entries.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
