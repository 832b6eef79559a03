//! Request and result shapes handled by the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{Error, ErrorKind, RequestId};

/// A decoded tool invocation. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Correlation id, echoed in the response.
    pub id: RequestId,
    /// Registered tool name.
    pub tool: String,
    /// Parameter name → value. Absent arguments decode as `null`.
    #[serde(default)]
    pub arguments: Value,
}

impl ToolRequest {
    pub fn new(id: impl Into<RequestId>, tool: &str, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.to_string(),
            arguments,
        }
    }
}

/// Failure descriptor of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ToolFailure {
    pub fn from_error(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.detail(),
            field: err.field().map(str::to_string),
        }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Terminal outcome of one request: exactly one of payload or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResult {
    Success(Value),
    Failure(ToolFailure),
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success(_))
    }

    pub fn failure(&self) -> Option<&ToolFailure> {
        match self {
            ToolResult::Failure(failure) => Some(failure),
            ToolResult::Success(_) => None,
        }
    }
}

/// A result tagged with its request's correlation id.
///
/// Serializes as `{"id": …, "success": …}` or `{"id": …, "failure": {…}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: RequestId,
    #[serde(flatten)]
    pub result: ToolResult,
}

/// Per-request lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validated,
    Executing,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Validated => "validated",
            RequestState::Executing => "executing",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_success_response_shape() {
        let response = ToolResponse {
            id: RequestId::Number(1),
            result: ToolResult::Success(json!({"echoed": "hi"})),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"id": 1, "success": {"echoed": "hi"}})
        );
    }

    #[test]
    fn test_failure_response_shape() {
        let err = Error::invalid_argument("msg", "Missing required parameter: msg");
        let response = ToolResponse {
            id: RequestId::Number(3),
            result: ToolResult::Failure(ToolFailure::from_error(&err)),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "id": 3,
                "failure": {
                    "kind": "InvalidArgumentError",
                    "message": "Missing required parameter: msg",
                    "field": "msg",
                },
            })
        );
    }

    #[test]
    fn test_request_arguments_default_to_null() {
        let request: ToolRequest =
            serde_json::from_value(json!({"id": "a", "tool": "missing"})).unwrap();
        assert_eq!(request.arguments, Value::Null);
        assert_eq!(request.id, RequestId::String("a".to_string()));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(!RequestState::Executing.is_terminal());
    }
}
