//! Agent execution
//!
//! Agents are collections of named tools. An [`AgentHost`] announces them
//! on the bus and answers the orchestrator's `agent:invoke` events by
//! running the matching [`ToolHandler`].

pub mod host;
pub mod tool;

pub use host::{AgentHost, AgentSpec, DEFAULT_MAX_CONCURRENT};
pub use tool::{tool_fn, FnTool, ToolCall, ToolHandler, ToolOutput};
