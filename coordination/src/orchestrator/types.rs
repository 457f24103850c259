//! Invocation parameters, contexts and results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent identifier.
pub type AgentId = String;

/// Correlation id of one `invoke()` call.
pub type RequestId = String;

/// Call chain handed down by a caller so nested invocations inherit it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallerContext {
    pub call_stack: Vec<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CallerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_call_stack(call_stack: Vec<AgentId>) -> Self {
        Self {
            call_stack,
            ..Self::default()
        }
    }

    pub fn with_canvas(mut self, canvas_id: impl Into<String>) -> Self {
        self.canvas_id = Some(canvas_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Arguments of [`Orchestrator::invoke`](super::Orchestrator::invoke).
#[derive(Debug, Clone)]
pub struct InvocationParams {
    pub from: AgentId,
    pub to: AgentId,
    pub tool: String,
    pub args: Value,
    pub context: Option<CallerContext>,
    /// Overrides the orchestrator's default timeout.
    pub timeout: Option<Duration>,
}

impl InvocationParams {
    pub fn new(from: impl Into<String>, to: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            tool: tool.into(),
            args: Value::Object(Default::default()),
            context: None,
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_context(mut self, context: CallerContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// State of one in-flight invocation, visible through
/// [`Orchestrator::active_invocations`](super::Orchestrator::active_invocations).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub request_id: RequestId,
    pub from: AgentId,
    pub to: AgentId,
    pub tool: String,
    /// Ordered, duplicate-free chain of agents, ending with `to`.
    pub call_stack: Vec<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl InvocationContext {
    /// Context handed to the callee so its own invocations extend this chain.
    pub fn caller_context(&self) -> CallerContext {
        CallerContext {
            call_stack: self.call_stack.clone(),
            canvas_id: self.canvas_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Metadata describing how a result was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub agent_id: AgentId,
    pub tool_name: String,
    pub duration_ms: u64,
    /// Producer's confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Successful outcome of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub success: bool,
    pub data: Value,
    pub metadata: ResultMetadata,
}

impl InvocationResult {
    /// Text content of the result: the data itself when it is a string,
    /// `data.content` when present, the JSON rendering otherwise.
    pub fn content(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => self.data.to_string(),
            },
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(data: Value) -> InvocationResult {
        InvocationResult {
            success: true,
            data,
            metadata: ResultMetadata {
                agent_id: "a".to_string(),
                tool_name: "t".to_string(),
                duration_ms: 3,
                confidence: 0.9,
                sources: vec![],
                reasoning: None,
            },
        }
    }

    #[test]
    fn test_caller_context_wire_shape() {
        let ctx = CallerContext::from_call_stack(vec!["a".into()]).with_canvas("c-1");
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["callStack"][0], "a");
        assert_eq!(json["canvasId"], "c-1");
        assert!(json.get("sessionId").is_none());

        let parsed: CallerContext = serde_json::from_value(json!({})).unwrap();
        assert!(parsed.call_stack.is_empty());
    }

    #[test]
    fn test_params_builder() {
        let params = InvocationParams::new("a", "b", "summarize")
            .with_args(json!({"text": "x"}))
            .with_timeout(Duration::from_secs(2));
        assert_eq!(params.to, "b");
        assert_eq!(params.args["text"], "x");
        assert_eq!(params.timeout, Some(Duration::from_secs(2)));
        assert!(params.context.is_none());
    }

    #[test]
    fn test_result_content_extraction() {
        assert_eq!(result(json!("plain")).content(), "plain");
        assert_eq!(result(json!({"content": "inner"})).content(), "inner");
        assert_eq!(result(json!({"other": 1})).content(), r#"{"other":1}"#);
        assert_eq!(result(json!(42)).content(), "42");
    }

    #[test]
    fn test_context_serializes_timeout_as_millis() {
        let ctx = InvocationContext {
            request_id: "r".into(),
            from: "a".into(),
            to: "b".into(),
            tool: "t".into(),
            call_stack: vec!["a".into(), "b".into()],
            canvas_id: None,
            session_id: Some("s".into()),
            start_time: Utc::now(),
            timeout: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["timeout"], 1500);
        assert_eq!(ctx.caller_context().session_id.as_deref(), Some("s"));
    }
}
