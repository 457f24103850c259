//! In-process agent executor.
//!
//! The host listens for `agent:invoke`, runs the matching tool handler on
//! the tokio runtime and answers with `agent:response`. An `agent:status`
//! event in state `cancelled` aborts the request it names; no response is
//! sent for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tool::{ToolCall, ToolHandler, ToolOutput};
use crate::error::{ErrorCode, InvocationError};
use crate::events::{
    AgentDeregistration, AgentEvent, AgentRegistration, AgentState, EventKind, InvokeRequest,
    InvokeResponse, ListenerId, SharedEventBus, StatusUpdate,
};
use crate::orchestrator::types::{AgentId, InvocationResult, RequestId, ResultMetadata};

/// Default number of concurrent calls per agent.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// An agent and its tools, ready to register.
pub struct AgentSpec {
    id: AgentId,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    max_concurrent: usize,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tools: HashMap::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn tool(mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.insert(name.into(), handler);
        self
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

struct HostedAgent {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    max_concurrent: usize,
    in_flight: HashMap<RequestId, CancellationToken>,
}

enum Admission {
    Rejected(InvocationError),
    Started {
        handler: Arc<dyn ToolHandler>,
        token: CancellationToken,
        became_busy: bool,
        in_flight: usize,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Executes tool calls for registered agents.
pub struct AgentHost {
    bus: SharedEventBus,
    runtime: Handle,
    agents: Mutex<HashMap<AgentId, HostedAgent>>,
    listeners: Vec<ListenerId>,
}

impl AgentHost {
    /// Attach a host to the bus, spawning handlers on `runtime`.
    pub fn new(bus: SharedEventBus, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<AgentHost>| {
            let on_invoke = weak.clone();
            let invoke_listener = bus.on(EventKind::Invoke, move |event| {
                if let (AgentEvent::Invoke(request), Some(host)) = (&event.event, on_invoke.upgrade())
                {
                    host.handle_invoke(request);
                }
            });

            let on_status = weak.clone();
            let status_listener = bus.on(EventKind::Status, move |event| {
                if let (AgentEvent::Status(update), Some(host)) = (&event.event, on_status.upgrade())
                {
                    if update.state == AgentState::Cancelled {
                        if let Some(request_id) = &update.request_id {
                            host.cancel(&update.agent_id, request_id);
                        }
                    }
                }
            });

            Self {
                bus,
                runtime,
                agents: Mutex::new(HashMap::new()),
                listeners: vec![invoke_listener, status_listener],
            }
        })
    }

    /// Attach a host using the current tokio runtime.
    ///
    /// Panics when called outside a runtime, like `tokio::spawn`.
    pub fn current(bus: SharedEventBus) -> Arc<Self> {
        Self::new(bus, Handle::current())
    }

    /// Register (or replace) an agent and announce it on `agent:registered`.
    pub fn register_agent(&self, spec: AgentSpec) {
        let mut tools: Vec<String> = spec.tools.keys().cloned().collect();
        tools.sort();
        let replaced = lock(&self.agents).insert(
            spec.id.clone(),
            HostedAgent {
                tools: spec.tools,
                max_concurrent: spec.max_concurrent,
                in_flight: HashMap::new(),
            },
        );
        if let Some(old) = replaced {
            old.in_flight.values().for_each(CancellationToken::cancel);
        }
        info!(agent_id = %spec.id, tools = ?tools, "Agent registered");
        self.bus.emit(AgentEvent::Registered(AgentRegistration {
            agent_id: spec.id,
            tools,
        }));
    }

    /// Remove an agent, cancelling its in-flight calls.
    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let Some(agent) = lock(&self.agents).remove(agent_id) else {
            return false;
        };
        agent.in_flight.values().for_each(CancellationToken::cancel);
        info!(agent_id, cancelled = agent.in_flight.len(), "Agent deregistered");
        self.bus.emit(AgentEvent::Deregistered(AgentDeregistration {
            agent_id: agent_id.to_string(),
        }));
        true
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        lock(&self.agents).contains_key(agent_id)
    }

    /// Registered agent ids, sorted.
    pub fn agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = lock(&self.agents).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Calls currently running for an agent.
    pub fn in_flight(&self, agent_id: &str) -> usize {
        lock(&self.agents)
            .get(agent_id)
            .map_or(0, |agent| agent.in_flight.len())
    }

    fn respond(&self, request: &InvokeRequest, outcome: Result<InvocationResult, InvocationError>) {
        let response = match outcome {
            Ok(result) => InvokeResponse::success(&request.request_id, &request.to, result),
            Err(error) => InvokeResponse::failure(&request.request_id, &request.to, error),
        };
        self.bus.emit(AgentEvent::Response(response));
    }

    fn status(&self, agent_id: &str, state: AgentState, in_flight: usize) {
        self.bus.emit(AgentEvent::Status(StatusUpdate {
            agent_id: agent_id.to_string(),
            state,
            request_id: None,
            in_flight,
        }));
    }

    fn admit(&self, request: &InvokeRequest) -> Option<Admission> {
        let mut agents = lock(&self.agents);
        let agent = agents.get_mut(&request.to)?;
        let Some(handler) = agent.tools.get(&request.tool).cloned() else {
            return Some(Admission::Rejected(InvocationError::tool_not_found(
                &request.to,
                &request.tool,
            )));
        };
        if agent.in_flight.len() >= agent.max_concurrent {
            return Some(Admission::Rejected(InvocationError::new(
                ErrorCode::AgentBusy,
                format!(
                    "agent '{}' is at its limit of {} concurrent calls",
                    request.to, agent.max_concurrent
                ),
            )));
        }
        let token = CancellationToken::new();
        agent
            .in_flight
            .insert(request.request_id.clone(), token.clone());
        Some(Admission::Started {
            handler,
            token,
            became_busy: agent.in_flight.len() == 1,
            in_flight: agent.in_flight.len(),
        })
    }

    fn handle_invoke(self: Arc<Self>, request: &InvokeRequest) {
        let admission = self.admit(request).unwrap_or_else(|| {
            Admission::Rejected(InvocationError::agent_not_found(&request.to))
        });

        let (handler, token, became_busy, in_flight) = match admission {
            Admission::Rejected(error) => {
                debug!(
                    request_id = %request.request_id,
                    to = %request.to,
                    code = %error.code,
                    "Invocation rejected by host"
                );
                self.respond(request, Err(error));
                return;
            }
            Admission::Started {
                handler,
                token,
                became_busy,
                in_flight,
            } => (handler, token, became_busy, in_flight),
        };

        if became_busy {
            self.status(&request.to, AgentState::Busy, in_flight);
        }

        let call = ToolCall {
            request_id: request.request_id.clone(),
            agent_id: request.to.clone(),
            tool: request.tool.clone(),
            from: request.from.clone(),
            args: request.args.clone(),
            context: request.context.clone(),
            cancel: token.clone(),
        };
        let request = request.clone();
        let host = Arc::downgrade(&self);
        self.runtime.spawn(async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                outcome = handler.call(call) => Some(outcome),
            };
            if let Some(host) = host.upgrade() {
                host.finish(&request, outcome, started);
            }
        });
    }

    fn finish(
        &self,
        request: &InvokeRequest,
        outcome: Option<Result<ToolOutput, InvocationError>>,
        started: Instant,
    ) {
        let remaining = {
            let mut agents = lock(&self.agents);
            agents.get_mut(&request.to).map(|agent| {
                agent.in_flight.remove(&request.request_id);
                agent.in_flight.len()
            })
        };

        match outcome {
            None => debug!(request_id = %request.request_id, to = %request.to, "Call cancelled"),
            Some(outcome) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let outcome = outcome.map(|output| InvocationResult {
                    success: true,
                    data: output.data,
                    metadata: ResultMetadata {
                        agent_id: request.to.clone(),
                        tool_name: request.tool.clone(),
                        duration_ms,
                        confidence: output.confidence,
                        sources: output.sources,
                        reasoning: output.reasoning,
                    },
                });
                if let Err(error) = &outcome {
                    warn!(
                        request_id = %request.request_id,
                        to = %request.to,
                        tool = %request.tool,
                        error = %error,
                        "Tool handler failed"
                    );
                }
                self.respond(request, outcome);
            }
        }

        if remaining == Some(0) {
            self.status(&request.to, AgentState::Idle, 0);
        }
    }

    /// Cancel one in-flight call. Returns false if it was not running.
    pub fn cancel(&self, agent_id: &str, request_id: &str) -> bool {
        let token = lock(&self.agents)
            .get(agent_id)
            .and_then(|agent| agent.in_flight.get(request_id).cloned());
        match token {
            Some(token) => {
                debug!(agent_id, request_id, "Cancelling call");
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl Drop for AgentHost {
    fn drop(&mut self) {
        for id in &self.listeners {
            self.bus.off(*id);
        }
        for agent in lock(&self.agents).values() {
            agent.in_flight.values().for_each(CancellationToken::cancel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tool::tool_fn;
    use crate::events::EventBus;
    use serde_json::json;
    use std::time::Duration;

    fn invoke(bus: &SharedEventBus, request_id: &str, to: &str, tool: &str) {
        bus.emit(AgentEvent::Invoke(InvokeRequest {
            request_id: request_id.to_string(),
            from: "caller".to_string(),
            to: to.to_string(),
            tool: tool.to_string(),
            args: json!({"q": "ping"}),
            context: Default::default(),
            timeout_ms: 1_000,
        }));
    }

    fn responses(bus: &SharedEventBus) -> Vec<InvokeResponse> {
        bus.history(usize::MAX)
            .into_iter()
            .filter_map(|event| match event.event {
                AgentEvent::Response(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    fn echo() -> Arc<dyn ToolHandler> {
        tool_fn(|call: ToolCall| async move { Ok(ToolOutput::new(call.args).with_confidence(0.5)) })
    }

    fn pending() -> Arc<dyn ToolHandler> {
        tool_fn(|_call: ToolCall| async move {
            std::future::pending::<()>().await;
            Ok(ToolOutput::new(json!(null)))
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_register_emits_sorted_tools() {
        let bus = EventBus::new().shared();
        let host = AgentHost::current(Arc::clone(&bus));
        host.register_agent(AgentSpec::new("b").tool("zeta", echo()).tool("alpha", echo()));

        let history = bus.history(1);
        match &history[0].event {
            AgentEvent::Registered(reg) => {
                assert_eq!(reg.agent_id, "b");
                assert_eq!(reg.tools, vec!["alpha", "zeta"]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(host.agents(), vec!["b"]);

        assert!(host.deregister_agent("b"));
        assert!(!host.deregister_agent("b"));
        assert_eq!(bus.event_count(EventKind::Deregistered), 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_and_tool() {
        let bus = EventBus::new().shared();
        let host = AgentHost::current(Arc::clone(&bus));
        host.register_agent(AgentSpec::new("b").tool("echo", echo()));

        invoke(&bus, "r1", "ghost", "echo");
        invoke(&bus, "r2", "b", "missing");

        let responses = responses(&bus);
        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses[0].error.as_ref().unwrap().code,
            ErrorCode::AgentNotFound
        );
        assert_eq!(
            responses[1].error.as_ref().unwrap().code,
            ErrorCode::ToolNotFound
        );
    }

    #[tokio::test]
    async fn test_runs_handler_and_reports_status() {
        let bus = EventBus::new().shared();
        let host = AgentHost::current(Arc::clone(&bus));
        host.register_agent(AgentSpec::new("b").tool("echo", echo()));

        invoke(&bus, "r1", "b", "echo");
        settle().await;

        let responses = responses(&bus);
        assert_eq!(responses.len(), 1);
        let result = responses[0].result.as_ref().unwrap();
        assert_eq!(result.data, json!({"q": "ping"}));
        assert_eq!(result.metadata.agent_id, "b");
        assert_eq!(result.metadata.tool_name, "echo");
        assert_eq!(result.metadata.confidence, 0.5);

        let states: Vec<AgentState> = bus
            .history(usize::MAX)
            .into_iter()
            .filter_map(|event| match event.event {
                AgentEvent::Status(update) => Some(update.state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![AgentState::Busy, AgentState::Idle]);
        assert_eq!(host.in_flight("b"), 0);
    }

    #[tokio::test]
    async fn test_busy_agent_rejects() {
        let bus = EventBus::new().shared();
        let host = AgentHost::current(Arc::clone(&bus));
        host.register_agent(AgentSpec::new("b").tool("wait", pending()).max_concurrent(1));

        invoke(&bus, "r1", "b", "wait");
        invoke(&bus, "r2", "b", "wait");

        let responses = responses(&bus);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].request_id, "r2");
        assert_eq!(responses[0].error.as_ref().unwrap().code, ErrorCode::AgentBusy);
        assert_eq!(host.in_flight("b"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_status_stops_call_without_response() {
        let bus = EventBus::new().shared();
        let host = AgentHost::current(Arc::clone(&bus));
        host.register_agent(AgentSpec::new("b").tool("wait", pending()));

        invoke(&bus, "r1", "b", "wait");
        settle().await;
        assert_eq!(host.in_flight("b"), 1);

        bus.emit(AgentEvent::Status(StatusUpdate {
            agent_id: "b".to_string(),
            state: AgentState::Cancelled,
            request_id: Some("r1".to_string()),
            in_flight: 0,
        }));
        tokio::time::timeout(Duration::from_secs(1), async {
            while host.in_flight("b") > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(responses(&bus).is_empty());
        assert!(!host.cancel("b", "r1"));
    }

    #[tokio::test]
    async fn test_handler_error_is_forwarded() {
        let bus = EventBus::new().shared();
        let host = AgentHost::current(Arc::clone(&bus));
        host.register_agent(AgentSpec::new("b").tool(
            "fail",
            tool_fn(|_call: ToolCall| async move {
                Err(InvocationError::validation("bad input"))
            }),
        ));

        invoke(&bus, "r1", "b", "fail");
        settle().await;

        let responses = responses(&bus);
        assert_eq!(responses.len(), 1);
        assert_eq!(
            responses[0].error.as_ref().unwrap().code,
            ErrorCode::ValidationFailed
        );
    }

    #[tokio::test]
    async fn test_drop_detaches_listeners() {
        let bus = EventBus::new().shared();
        let host = AgentHost::current(Arc::clone(&bus));
        assert_eq!(bus.listener_count(EventKind::Invoke), 1);
        drop(host);
        assert_eq!(bus.listener_count(EventKind::Invoke), 0);
    }
}
