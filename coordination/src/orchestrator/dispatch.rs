//! The invocation pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::{cache_key, CacheStats, ResultCache};
use super::retry::RetryPolicy;
use super::types::{
    AgentId, CallerContext, InvocationContext, InvocationParams, InvocationResult, RequestId,
};
use crate::error::{ErrorCode, InvocationError};
use crate::events::{
    AgentEvent, AgentState, BroadcastMessage, ErrorReport, Event, EventBus, EventKind,
    InvokeRequest, InvokeResponse, ListenerId, SharedEventBus, StatusUpdate,
};
use crate::rate_limit::{HierarchicalRateLimiter, RateLimitViolation};

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Longest allowed call chain, caller included.
    pub max_call_depth: usize,
    pub default_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl OrchestratorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 5,
            default_timeout_ms: 30_000,
            cache_ttl_secs: 300,
            cache_capacity: 100,
        }
    }
}

type ActiveMap = Mutex<HashMap<RequestId, InvocationContext>>;
type ResponseSlot = Arc<Mutex<Option<oneshot::Sender<InvokeResponse>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes an in-flight invocation from the active map when dropped.
struct ActiveGuard<'a> {
    active: &'a ActiveMap,
    request_id: RequestId,
}

impl<'a> ActiveGuard<'a> {
    fn register(active: &'a ActiveMap, context: InvocationContext) -> Self {
        let request_id = context.request_id.clone();
        lock(active).insert(request_id.clone(), context);
        Self { active, request_id }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        lock(self.active).remove(&self.request_id);
    }
}

/// Unregisters a bus listener when dropped.
struct ListenerGuard<'a> {
    bus: &'a EventBus,
    id: ListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.bus.off(self.id);
    }
}

/// Tells the callee to stop when a dispatched call ends without a
/// response: on timeout, and when the awaiting future is dropped (a failed
/// sibling in a join, an outer timeout).
struct PendingGuard<'a> {
    bus: &'a EventBus,
    slot: ResponseSlot,
    request_id: &'a str,
    to: &'a AgentId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // an empty slot means the response already arrived
        if lock(&self.slot).take().is_none() {
            return;
        }
        debug!(request_id = self.request_id, to = %self.to, "Cancelling unanswered invocation");
        self.bus.emit(AgentEvent::Status(StatusUpdate {
            agent_id: self.to.clone(),
            state: AgentState::Cancelled,
            request_id: Some(self.request_id.to_string()),
            in_flight: 0,
        }));
    }
}

fn rate_limit_error(to: &str, violation: RateLimitViolation) -> InvocationError {
    InvocationError::new(
        ErrorCode::RateLimitExceeded,
        format!("rate limit exceeded for {} scope calling '{}'", violation.scope, to),
    )
    .with_data(json!({
        "scope": violation.scope,
        "resetAt": violation.decision.reset_at,
        "retryAfterMs": violation.decision.retry_after.as_millis() as u64,
    }))
}

/// Routes tool calls between agents over the event bus.
///
/// Each `invoke` is validated locally (cycle, depth, rate limit), served
/// from the result cache when possible, and otherwise dispatched as an
/// `agent:invoke` event whose matching `agent:response` resolves the call.
pub struct Orchestrator {
    bus: SharedEventBus,
    limiter: Arc<HierarchicalRateLimiter>,
    cache: ResultCache,
    active: ActiveMap,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        bus: SharedEventBus,
        limiter: Arc<HierarchicalRateLimiter>,
        config: OrchestratorConfig,
    ) -> Self {
        let cache = ResultCache::new(config.cache_ttl(), config.cache_capacity);
        Self {
            bus,
            limiter,
            cache,
            active: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    /// Invoke `params.tool` on `params.to` and wait for its result.
    pub async fn invoke(&self, params: InvocationParams) -> Result<InvocationResult, InvocationError> {
        let InvocationParams {
            from,
            to,
            tool,
            args,
            context,
            timeout,
        } = params;
        let inherited = context.unwrap_or_default();
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());

        let mut call_stack = inherited.call_stack;
        if !call_stack.contains(&from) {
            call_stack.push(from.clone());
        }

        if call_stack.contains(&to) {
            let mut chain = call_stack;
            chain.push(to.clone());
            debug!(from = %from, to = %to, chain = ?chain, "Circular invocation rejected");
            return Err(InvocationError::new(
                ErrorCode::CircularDependency,
                format!("circular dependency: {}", chain.join(" -> ")),
            )
            .with_data(json!({ "chain": chain })));
        }
        call_stack.push(to.clone());

        if call_stack.len() > self.config.max_call_depth {
            debug!(
                from = %from,
                to = %to,
                depth = call_stack.len(),
                "Invocation exceeds max call depth"
            );
            return Err(InvocationError::new(
                ErrorCode::CircularDependency,
                format!(
                    "max call depth exceeded ({} > {})",
                    call_stack.len(),
                    self.config.max_call_depth
                ),
            )
            .with_data(json!({
                "chain": call_stack,
                "maxDepth": self.config.max_call_depth,
            })));
        }

        let canvas_id = inherited.canvas_id;
        self.limiter
            .check(&to, canvas_id.as_deref())
            .map_err(|v| rate_limit_error(&to, v))?;

        let key = cache_key(&to, &tool, &args);
        if let Some(hit) = self.cache.get(&key, Instant::now()) {
            debug!(from = %from, to = %to, tool = %tool, "Invocation served from cache");
            return Ok(hit);
        }

        self.limiter
            .consume(&to, canvas_id.as_deref())
            .map_err(|v| rate_limit_error(&to, v))?;

        let context = InvocationContext {
            request_id: Uuid::new_v4().to_string(),
            from: from.clone(),
            to: to.clone(),
            tool: tool.clone(),
            call_stack,
            canvas_id,
            session_id: inherited.session_id,
            start_time: Utc::now(),
            timeout,
        };
        let request_id = context.request_id.clone();
        let caller_context = context.caller_context();
        let _active = ActiveGuard::register(&self.active, context);

        let outcome = self
            .dispatch(&request_id, &from, &to, &tool, args, caller_context, timeout)
            .await;

        match &outcome {
            Ok(result) => {
                info!(
                    request_id = %request_id,
                    to = %to,
                    tool = %tool,
                    success = result.success,
                    duration_ms = result.metadata.duration_ms,
                    "Invocation resolved"
                );
                if result.success {
                    self.cache.insert(key, result.clone(), Instant::now());
                }
            }
            Err(error) => {
                warn!(
                    request_id = %request_id,
                    to = %to,
                    tool = %tool,
                    code = %error.code,
                    error = %error.message,
                    "Invocation failed"
                );
                self.bus.emit(AgentEvent::Error(ErrorReport {
                    request_id: request_id.clone(),
                    from,
                    to,
                    tool,
                    error: error.clone(),
                }));
            }
        }

        outcome
    }

    /// Emit `agent:invoke` and wait for the correlated response.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        request_id: &str,
        from: &AgentId,
        to: &AgentId,
        tool: &str,
        args: Value,
        context: CallerContext,
        timeout: Duration,
    ) -> Result<InvocationResult, InvocationError> {
        let (tx, rx) = oneshot::channel();
        let slot: ResponseSlot = Arc::new(Mutex::new(Some(tx)));

        let listener_slot = Arc::clone(&slot);
        let expected = request_id.to_string();
        let id = self.bus.on(EventKind::Response, move |event: &Event| {
            if let AgentEvent::Response(response) = &event.event {
                if response.request_id == expected {
                    // only the first matching response is delivered
                    if let Some(tx) = lock(&listener_slot).take() {
                        let _ = tx.send(response.clone());
                    }
                }
            }
        });
        let _listener = ListenerGuard { bus: &self.bus, id };
        let _pending = PendingGuard {
            bus: &self.bus,
            slot,
            request_id,
            to,
        };

        debug!(request_id, from = %from, to = %to, tool, "Dispatching invocation");
        self.bus.emit(AgentEvent::Invoke(InvokeRequest {
            request_id: request_id.to_string(),
            from: from.clone(),
            to: to.clone(),
            tool: tool.to_string(),
            args,
            context,
            timeout_ms: timeout.as_millis() as u64,
        }));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_outcome(),
            Ok(Err(_)) => Err(InvocationError::internal(format!(
                "response channel for {} closed",
                request_id
            ))),
            // `_pending` closes the slot and cancels the callee; a late
            // response is dropped silently
            Err(_) => Err(InvocationError::new(
                ErrorCode::Timeout,
                format!(
                    "'{}' did not answer {} within {}ms",
                    to,
                    tool,
                    timeout.as_millis()
                ),
            )
            .with_data(json!({ "timeoutMs": timeout.as_millis() as u64 }))),
        }
    }

    /// `invoke` with up to `max_retries` retries for retriable codes,
    /// backing off `min(1000 × 2^attempt, 10000)` ms between attempts.
    pub async fn invoke_with_retry(
        &self,
        params: InvocationParams,
        max_retries: u32,
    ) -> Result<InvocationResult, InvocationError> {
        let policy = RetryPolicy::new(max_retries);
        let mut attempt = 0;
        loop {
            match self.invoke(params.clone()).await {
                Ok(result) => return Ok(result),
                Err(error) if error.is_retriable() && policy.should_retry(attempt) => {
                    let delay = policy.backoff_duration(attempt);
                    info!(
                        to = %params.to,
                        tool = %params.tool,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        code = %error.code,
                        "Retrying invocation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Emit a fire-and-forget `agent:broadcast`.
    pub fn broadcast(&self, from: &str, topic: &str, payload: Value) -> Event {
        self.bus.emit(AgentEvent::Broadcast(BroadcastMessage {
            from: from.to_string(),
            topic: topic.to_string(),
            payload,
        }))
    }

    /// Snapshot of in-flight invocations.
    pub fn active_invocations(&self) -> Vec<InvocationContext> {
        let mut active: Vec<InvocationContext> = lock(&self.active).values().cloned().collect();
        active.sort_by_key(|ctx| ctx.start_time);
        active
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::ResultMetadata;
    use crate::rate_limit::{RateLimitConfig, RateLimitRule};

    fn orchestrator() -> (SharedEventBus, Orchestrator) {
        let bus = EventBus::new().shared();
        let orch = Orchestrator::new(
            Arc::clone(&bus),
            Arc::new(HierarchicalRateLimiter::default()),
            OrchestratorConfig::default(),
        );
        (bus, orch)
    }

    /// Answers every invoke synchronously with its args echoed back.
    fn echo_responder(bus: &SharedEventBus) {
        let responder = Arc::clone(bus);
        bus.on(EventKind::Invoke, move |event| {
            if let AgentEvent::Invoke(req) = &event.event {
                responder.emit(AgentEvent::Response(InvokeResponse::success(
                    &req.request_id,
                    &req.to,
                    InvocationResult {
                        success: true,
                        data: req.args.clone(),
                        metadata: ResultMetadata {
                            agent_id: req.to.clone(),
                            tool_name: req.tool.clone(),
                            duration_ms: 0,
                            confidence: 1.0,
                            sources: vec![],
                            reasoning: None,
                        },
                    },
                )));
            }
        });
    }

    #[tokio::test]
    async fn test_invoke_resolves_matching_response() {
        let (bus, orch) = orchestrator();
        echo_responder(&bus);

        let result = orch
            .invoke(InvocationParams::new("a", "b", "echo").with_args(json!({"n": 1})))
            .await
            .unwrap();

        assert_eq!(result.data, json!({"n": 1}));
        assert!(orch.active_invocations().is_empty());
        assert_eq!(bus.listener_count(EventKind::Response), 0);
        assert_eq!(bus.event_count(EventKind::Invoke), 1);
    }

    #[tokio::test]
    async fn test_invoke_carries_extended_call_stack() {
        let (bus, orch) = orchestrator();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.on(EventKind::Invoke, move |event| {
            if let AgentEvent::Invoke(req) = &event.event {
                s.lock().unwrap().push(req.context.call_stack.clone());
            }
        });
        echo_responder(&bus);

        orch.invoke(
            InvocationParams::new("b", "c", "t")
                .with_context(CallerContext::from_call_stack(vec!["a".into(), "b".into()])),
        )
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![vec!["a", "b", "c"]]);
    }

    #[tokio::test]
    async fn test_self_invocation_is_a_cycle() {
        let (bus, orch) = orchestrator();
        let err = orch
            .invoke(InvocationParams::new("a", "a", "t"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CircularDependency);
        assert_eq!(err.data.unwrap()["chain"], json!(["a", "a"]));
        assert_eq!(bus.stats().total_events, 0);
    }

    #[tokio::test]
    async fn test_error_response_emits_agent_error() {
        let (bus, orch) = orchestrator();
        let responder = Arc::clone(&bus);
        bus.on(EventKind::Invoke, move |event| {
            if let AgentEvent::Invoke(req) = &event.event {
                responder.emit(AgentEvent::Response(InvokeResponse::failure(
                    &req.request_id,
                    &req.to,
                    InvocationError::tool_not_found(&req.to, &req.tool),
                )));
            }
        });

        let err = orch
            .invoke(InvocationParams::new("a", "b", "missing"))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::ToolNotFound);
        assert_eq!(bus.event_count(EventKind::Error), 1);
        assert_eq!(orch.cache_stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_error_data() {
        let bus = EventBus::new().shared();
        let limiter = HierarchicalRateLimiter::new(RateLimitConfig {
            agent: RateLimitRule::new(1, 60_000),
            ..RateLimitConfig::default()
        });
        let orch = Orchestrator::new(
            Arc::clone(&bus),
            Arc::new(limiter),
            OrchestratorConfig::default(),
        );
        echo_responder(&bus);

        orch.invoke(InvocationParams::new("a", "b", "t").with_args(json!(1)))
            .await
            .unwrap();
        let err = orch
            .invoke(InvocationParams::new("a", "b", "t").with_args(json!(2)))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        let data = err.data.unwrap();
        assert_eq!(data["scope"], "agent");
        assert!(data.get("resetAt").is_some());
        assert_eq!(data["retryAfterMs"], 60_000);
        // local rejections stay off the bus
        assert_eq!(bus.event_count(EventKind::Error), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_with_retry_stops_on_non_retriable() {
        let (bus, orch) = orchestrator();
        let err = orch
            .invoke_with_retry(InvocationParams::new("a", "a", "t"), 3)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CircularDependency);
        assert_eq!(bus.event_count(EventKind::Invoke), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_with_retry_retries_internal_errors() {
        let (bus, orch) = orchestrator();
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let responder = Arc::clone(&bus);
        bus.on(EventKind::Invoke, move |event| {
            if let AgentEvent::Invoke(req) = &event.event {
                let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let response = if n < 2 {
                    InvokeResponse::failure(
                        &req.request_id,
                        &req.to,
                        InvocationError::internal("flaky"),
                    )
                } else {
                    InvokeResponse::success(
                        &req.request_id,
                        &req.to,
                        InvocationResult {
                            success: true,
                            data: json!("ok"),
                            metadata: ResultMetadata {
                                agent_id: req.to.clone(),
                                tool_name: req.tool.clone(),
                                duration_ms: 0,
                                confidence: 1.0,
                                sources: vec![],
                                reasoning: None,
                            },
                        },
                    )
                };
                responder.emit(AgentEvent::Response(response));
            }
        });

        let started = Instant::now();
        let result = orch
            .invoke_with_retry(InvocationParams::new("a", "b", "t"), 3)
            .await
            .unwrap();

        assert_eq!(result.data, json!("ok"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        // 1000ms + 2000ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(3_000));
        assert_eq!(bus.event_count(EventKind::Error), 2);
    }

    #[tokio::test]
    async fn test_unsuccessful_result_is_not_cached() {
        let (bus, orch) = orchestrator();
        let responder = Arc::clone(&bus);
        bus.on(EventKind::Invoke, move |event| {
            if let AgentEvent::Invoke(req) = &event.event {
                responder.emit(AgentEvent::Response(InvokeResponse::success(
                    &req.request_id,
                    &req.to,
                    InvocationResult {
                        success: false,
                        data: json!({"reason": "declined"}),
                        metadata: ResultMetadata {
                            agent_id: req.to.clone(),
                            tool_name: req.tool.clone(),
                            duration_ms: 0,
                            confidence: 0.0,
                            sources: vec![],
                            reasoning: None,
                        },
                    },
                )));
            }
        });

        let params = InvocationParams::new("a", "b", "t").with_args(json!({"q": 1}));
        let first = orch.invoke(params.clone()).await.unwrap();
        assert!(!first.success);
        assert_eq!(orch.cache_stats().entries, 0);

        orch.invoke(params).await.unwrap();
        assert_eq!(bus.event_count(EventKind::Invoke), 2);
        assert_eq!(orch.cache_stats().hits, 0);
    }

    #[tokio::test]
    async fn test_broadcast() {
        let (bus, orch) = orchestrator();
        let event = orch.broadcast("a", "news", json!({"k": "v"}));
        assert_eq!(event.kind(), EventKind::Broadcast);
        assert_eq!(bus.event_count(EventKind::Broadcast), 1);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let (bus, orch) = orchestrator();
        echo_responder(&bus);
        orch.invoke(InvocationParams::new("a", "b", "t")).await.unwrap();
        assert_eq!(orch.cache_stats().entries, 1);
        orch.clear_cache();
        assert_eq!(orch.cache_stats().entries, 0);
    }
}
