//! In-process agent invocation mesh.
//!
//! This library provides:
//! - An event bus carrying every agent interaction as a typed event
//! - Hierarchical token-bucket rate limiting (agent, canvas, global)
//! - An orchestrator that routes tool calls between agents with cycle and
//!   depth checks, result caching, timeouts and retry
//! - An agent host that executes registered tools in response to bus
//!   invocations
//! - A debate orchestrator that runs multi-round structured debates with
//!   transactional persistence
//!
//! # Wiring
//!
//! ```text
//! EventBus ──┬── Orchestrator ── HierarchicalRateLimiter
//!            │        │
//!            │        └── DebateOrchestrator ── DebateStore
//!            │
//!            └── AgentHost ── ToolHandler (per agent, per tool)
//! ```
//!
//! Services are created by the caller and shared through `Arc`; nothing in
//! this crate is global.

#![allow(clippy::uninlined_format_args)]

pub mod agents;
pub mod config;
pub mod debate;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod rate_limit;

pub use agents::{tool_fn, AgentHost, AgentSpec, ToolCall, ToolHandler, ToolOutput};
pub use config::{ConfigError, EventsConfig, MeshConfig};
pub use debate::{
    DebateConfig, DebateError, DebateOrchestrator, DebateSession, DebateStore, DebateTranscript,
    MemoryDebateStore, Posture, SessionStatus,
};
pub use error::{ErrorCode, InvocationError};
pub use events::{AgentEvent, Event, EventBus, EventKind, SharedEventBus};
pub use orchestrator::{
    CallerContext, InvocationParams, InvocationResult, Orchestrator, OrchestratorConfig,
};
pub use rate_limit::{HierarchicalRateLimiter, RateLimitConfig, RateLimitRule};
