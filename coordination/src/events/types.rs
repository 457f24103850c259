//! Event types for agent invocation traffic
//!
//! Seven topics make up the stable contract seen by external subscribers.
//! Every event serialises as `{"type": "agent:<topic>", "payload": {..}, "timestamp": ..}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InvocationError;
use crate::orchestrator::types::{AgentId, CallerContext, InvocationResult, RequestId};

/// Topic discriminant, used for listener registration and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "agent:invoke")]
    Invoke,
    #[serde(rename = "agent:response")]
    Response,
    #[serde(rename = "agent:broadcast")]
    Broadcast,
    #[serde(rename = "agent:registered")]
    Registered,
    #[serde(rename = "agent:deregistered")]
    Deregistered,
    #[serde(rename = "agent:status")]
    Status,
    #[serde(rename = "agent:error")]
    Error,
}

impl EventKind {
    /// Wire name of the topic.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invoke => "agent:invoke",
            Self::Response => "agent:response",
            Self::Broadcast => "agent:broadcast",
            Self::Registered => "agent:registered",
            Self::Deregistered => "agent:deregistered",
            Self::Status => "agent:status",
            Self::Error => "agent:error",
        }
    }

    /// All seven topics in declaration order.
    pub fn all() -> &'static [EventKind] {
        &[
            Self::Invoke,
            Self::Response,
            Self::Broadcast,
            Self::Registered,
            Self::Deregistered,
            Self::Status,
            Self::Error,
        ]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of every topic, tagged by its wire name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentEvent {
    /// An orchestrator dispatched a tool call to an agent.
    #[serde(rename = "agent:invoke")]
    Invoke(InvokeRequest),

    /// An agent answered a dispatched tool call.
    #[serde(rename = "agent:response")]
    Response(InvokeResponse),

    /// Fire-and-forget message to every interested listener.
    #[serde(rename = "agent:broadcast")]
    Broadcast(BroadcastMessage),

    /// An agent came online with a set of tools.
    #[serde(rename = "agent:registered")]
    Registered(AgentRegistration),

    /// An agent went away.
    #[serde(rename = "agent:deregistered")]
    Deregistered(AgentDeregistration),

    /// Agent availability changed, or an in-flight call was cancelled.
    #[serde(rename = "agent:status")]
    Status(StatusUpdate),

    /// A dispatched invocation failed.
    #[serde(rename = "agent:error")]
    Error(ErrorReport),
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Invoke(_) => EventKind::Invoke,
            Self::Response(_) => EventKind::Response,
            Self::Broadcast(_) => EventKind::Broadcast,
            Self::Registered(_) => EventKind::Registered,
            Self::Deregistered(_) => EventKind::Deregistered,
            Self::Status(_) => EventKind::Status,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// Request id for invocation-scoped events.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Invoke(req) => Some(&req.request_id),
            Self::Response(resp) => Some(&resp.request_id),
            Self::Error(report) => Some(&report.request_id),
            Self::Status(update) => update.request_id.as_deref(),
            _ => None,
        }
    }

    /// Agent id the event is about, if any.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Invoke(req) => Some(&req.to),
            Self::Response(resp) => Some(&resp.agent_id),
            Self::Broadcast(msg) => Some(&msg.from),
            Self::Registered(reg) => Some(&reg.agent_id),
            Self::Deregistered(dereg) => Some(&dereg.agent_id),
            Self::Status(update) => Some(&update.agent_id),
            Self::Error(report) => Some(&report.to),
        }
    }
}

/// An emitted event. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct Event {
    #[serde(flatten)]
    pub event: AgentEvent,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event: AgentEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.event.request_id()
    }
}

/// Wire shape used to rebuild an [`Event`] from JSON.
#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    payload: Value,
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawEvent> for Event {
    type Error = serde_json::Error;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let event = serde_json::from_value(serde_json::json!({
            "type": raw.kind.as_str(),
            "payload": raw.payload,
        }))?;
        Ok(Self {
            event,
            timestamp: raw.timestamp,
        })
    }
}

/// `agent:invoke` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub request_id: RequestId,
    pub from: AgentId,
    pub to: AgentId,
    pub tool: String,
    pub args: Value,
    /// Call chain including `to`, for nested invocations by the callee.
    pub context: CallerContext,
    pub timeout_ms: u64,
}

/// `agent:response` payload. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<InvocationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InvocationError>,
}

impl InvokeResponse {
    pub fn success(request_id: &str, agent_id: &str, result: InvocationResult) -> Self {
        Self {
            request_id: request_id.to_string(),
            agent_id: agent_id.to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request_id: &str, agent_id: &str, error: InvocationError) -> Self {
        Self {
            request_id: request_id.to_string(),
            agent_id: agent_id.to_string(),
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into the orchestrator's outcome type.
    pub fn into_outcome(self) -> Result<InvocationResult, InvocationError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Err(InvocationError::internal(format!(
                "response {} carried neither result nor error",
                self.request_id
            ))),
        }
    }
}

/// `agent:broadcast` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub from: AgentId,
    pub topic: String,
    pub payload: Value,
}

/// `agent:registered` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub tools: Vec<String>,
}

/// `agent:deregistered` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDeregistration {
    pub agent_id: AgentId,
}

/// Agent availability as reported on `agent:status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Busy,
    /// The orchestrator abandoned the request; the callee should stop.
    Cancelled,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// `agent:status` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub agent_id: AgentId,
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub in_flight: usize,
}

/// `agent:error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub request_id: RequestId,
    pub from: AgentId,
    pub to: AgentId,
    pub tool: String,
    pub error: InvocationError,
}
