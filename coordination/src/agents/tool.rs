//! Tool handler trait and call/return types.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::InvocationError;
use crate::orchestrator::types::{AgentId, CallerContext, InvocationParams, RequestId};

/// One tool call delivered to a handler.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub request_id: RequestId,
    /// Agent executing the call.
    pub agent_id: AgentId,
    pub tool: String,
    /// Agent that asked for it.
    pub from: AgentId,
    pub args: Value,
    /// Call chain ending with `agent_id`; pass it on nested invocations.
    pub context: CallerContext,
    /// Cancelled when the caller abandons the request.
    pub cancel: CancellationToken,
}

impl ToolCall {
    /// Parameters for a nested call from this agent that extends the chain.
    pub fn nested(&self, to: impl Into<String>, tool: impl Into<String>) -> InvocationParams {
        InvocationParams::new(self.agent_id.clone(), to, tool).with_context(self.context.clone())
    }

    /// String argument by name.
    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }
}

/// What a handler returns on success.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub data: Value,
    pub confidence: f64,
    pub sources: Vec<String>,
    pub reasoning: Option<String>,
}

impl ToolOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            confidence: 1.0,
            sources: Vec::new(),
            reasoning: None,
        }
    }

    /// Output whose `data` is `{"content": text}`.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(serde_json::json!({ "content": content.into() }))
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// A tool an agent exposes on the bus.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, call: ToolCall) -> Result<ToolOutput, InvocationError>;
}

/// [`ToolHandler`] backed by an async closure.
pub struct FnTool<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput, InvocationError>> + Send + 'static,
{
    async fn call(&self, call: ToolCall) -> Result<ToolOutput, InvocationError> {
        (self.0)(call).await
    }
}

/// Wrap an async closure as a shared tool handler.
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput, InvocationError>> + Send + 'static,
{
    Arc::new(FnTool(f))
}
