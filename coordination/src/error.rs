//! Invocation error taxonomy.
//!
//! Every failure that crosses the orchestrator boundary is an
//! [`InvocationError`] carrying a numeric [`ErrorCode`], a message and an
//! optional JSON `data` payload. Codes follow the JSON-RPC layout: a
//! standard range plus a custom range for agent routing failures.
//!
//! | Code                 | Value  | Retried by `invoke_with_retry` |
//! |----------------------|--------|--------------------------------|
//! | ParseError           | -32700 | yes |
//! | InvalidRequest       | -32600 | yes |
//! | MethodNotFound       | -32601 | yes |
//! | InvalidParams        | -32602 | yes |
//! | InternalError        | -32603 | yes |
//! | AgentNotFound        | -32001 | no  |
//! | ToolNotFound         | -32002 | no  |
//! | CircularDependency   | -32003 | no  |
//! | Timeout              | -32004 | yes |
//! | RateLimitExceeded    | -32005 | no  |
//! | AgentBusy            | -32006 | yes |
//! | ValidationFailed     | -32007 | yes |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Numeric error code attached to every [`InvocationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    AgentNotFound,
    ToolNotFound,
    CircularDependency,
    Timeout,
    RateLimitExceeded,
    AgentBusy,
    ValidationFailed,
}

impl ErrorCode {
    /// Wire value of this code.
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::AgentNotFound => -32001,
            Self::ToolNotFound => -32002,
            Self::CircularDependency => -32003,
            Self::Timeout => -32004,
            Self::RateLimitExceeded => -32005,
            Self::AgentBusy => -32006,
            Self::ValidationFailed => -32007,
        }
    }

    /// Look up a code by its wire value.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::all().iter().copied().find(|c| c.code() == code)
    }

    /// All known codes.
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::ParseError,
            Self::InvalidRequest,
            Self::MethodNotFound,
            Self::InvalidParams,
            Self::InternalError,
            Self::AgentNotFound,
            Self::ToolNotFound,
            Self::CircularDependency,
            Self::Timeout,
            Self::RateLimitExceeded,
            Self::AgentBusy,
            Self::ValidationFailed,
        ]
    }

    /// Whether a caller may automatically retry a failure with this code.
    ///
    /// Routing failures (cycles, unknown agents or tools) and rate-limit
    /// rejections are deterministic for the same input and never retried.
    pub fn is_retriable(self) -> bool {
        !matches!(
            self,
            Self::CircularDependency
                | Self::AgentNotFound
                | Self::ToolNotFound
                | Self::RateLimitExceeded
        )
    }

    /// Whether this code belongs to the custom (agent routing) range.
    pub fn is_custom(self) -> bool {
        (-32099..=-32000).contains(&self.code())
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParseError => write!(f, "parse_error"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::MethodNotFound => write!(f, "method_not_found"),
            Self::InvalidParams => write!(f, "invalid_params"),
            Self::InternalError => write!(f, "internal_error"),
            Self::AgentNotFound => write!(f, "agent_not_found"),
            Self::ToolNotFound => write!(f, "tool_not_found"),
            Self::CircularDependency => write!(f, "circular_dependency"),
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimitExceeded => write!(f, "rate_limit_exceeded"),
            Self::AgentBusy => write!(f, "agent_busy"),
            Self::ValidationFailed => write!(f, "validation_failed"),
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::from_code(value).ok_or_else(|| format!("unknown error code {}", value))
    }
}

/// Typed error returned by the orchestrator and carried on `agent:response`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct InvocationError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InvocationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data (e.g. the offending call chain).
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn agent_not_found(agent_id: &str) -> Self {
        Self::new(
            ErrorCode::AgentNotFound,
            format!("agent '{}' is not registered", agent_id),
        )
    }

    pub fn tool_not_found(agent_id: &str, tool: &str) -> Self {
        Self::new(
            ErrorCode::ToolNotFound,
            format!("agent '{}' has no tool '{}'", agent_id, tool),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    /// Whether `invoke_with_retry` may retry this error.
    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }
}
