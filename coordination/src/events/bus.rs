//! Event bus for agent invocation traffic
//!
//! Listeners registered with [`EventBus::on`] run synchronously inside
//! [`EventBus::emit`], in registration order. A tokio broadcast channel
//! mirrors every event for asynchronous subscribers (e.g. a WebSocket
//! gateway) that must never slow the emitter down.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::{AgentEvent, Event, EventKind};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Default number of events retained in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Synchronous listener callback.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Handle returned by [`EventBus::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    kind: EventKind,
    listener: Listener,
}

/// Typed publish/subscribe hub with bounded history and per-topic counters.
pub struct EventBus {
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
    history: Mutex<VecDeque<Event>>,
    history_capacity: usize,
    counts: Mutex<HashMap<EventKind, u64>>,
    sender: broadcast::Sender<Event>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl EventBus {
    /// Create a bus retaining the default 1000 events.
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus with a custom history bound.
    pub fn with_history_capacity(history_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            history: Mutex::new(VecDeque::with_capacity(history_capacity.min(1024))),
            history_capacity,
            counts: Mutex::new(HashMap::new()),
            sender,
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Register a listener for one topic. There is no listener limit.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ListenerEntry {
                id,
                kind,
                listener: Arc::new(listener),
            });
        debug!(event_type = kind.as_str(), listener = id.0, "Listener registered");
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        before != listeners.len()
    }

    /// Number of listeners registered for a topic.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    /// Emit an event.
    ///
    /// Listeners for the event's topic run first, synchronously and in
    /// registration order; a panicking listener is logged and skipped.
    /// The event is then appended to history, counted, and mirrored to
    /// broadcast subscribers.
    pub fn emit(&self, event: AgentEvent) -> Event {
        let event = Event::new(event);
        let kind = event.kind();

        // Snapshot so listeners can call on/off/emit re-entrantly.
        let targets: Vec<(ListenerId, Listener)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| (entry.id, Arc::clone(&entry.listener)))
            .collect();

        for (id, listener) in &targets {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                warn!(
                    event_type = kind.as_str(),
                    listener = id.0,
                    error = %panic_message(payload.as_ref()),
                    "Event listener panicked"
                );
            }
        }

        {
            let mut history = lock(&self.history);
            history.push_back(event.clone());
            while history.len() > self.history_capacity {
                history.pop_front();
            }
        }
        *lock(&self.counts).entry(kind).or_insert(0) += 1;

        match self.sender.send(event.clone()) {
            Ok(receivers) => debug!(
                event_type = kind.as_str(),
                listeners = targets.len(),
                receivers,
                "Event emitted"
            ),
            Err(_) => debug!(
                event_type = kind.as_str(),
                listeners = targets.len(),
                "Event emitted (no receivers)"
            ),
        }

        event
    }

    /// The most recent `limit` events, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let history = lock(&self.history);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Drop all retained events. Counters are kept.
    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }

    /// Number of events ever emitted on a topic.
    pub fn event_count(&self, kind: EventKind) -> u64 {
        lock(&self.counts).get(&kind).copied().unwrap_or(0)
    }

    /// Aggregate counters for diagnostics.
    pub fn stats(&self) -> EventBusStats {
        let counts = lock(&self.counts);
        let by_type: HashMap<String, u64> = counts
            .iter()
            .map(|(kind, count)| (kind.as_str().to_string(), *count))
            .collect();
        EventBusStats {
            total_events: counts.values().sum(),
            by_type,
            history_len: lock(&self.history).len(),
            history_capacity: self.history_capacity,
            listeners: self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Subscribe to the asynchronous mirror of every event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Get the number of current broadcast subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Serialize)]
pub struct EventBusStats {
    pub total_events: u64,
    pub by_type: HashMap<String, u64>,
    pub history_len: usize,
    pub history_capacity: usize,
    pub listeners: usize,
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by agent ID
    pub agent_id: Option<String>,
    /// Filter by request ID
    pub request_id: Option<String>,
    /// Filter by topics
    pub kinds: Option<Vec<EventKind>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by agent ID
    pub fn agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    /// Filter by request ID
    pub fn request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    /// Filter by topics
    pub fn kinds(mut self, kinds: Vec<EventKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }

        if let Some(ref agent) = self.agent_id {
            if event.event.agent_id() != Some(agent.as_str()) {
                return false;
            }
        }

        if let Some(ref rid) = self.request_id {
            if event.request_id() != Some(rid.as_str()) {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: broadcast::Receiver<Event>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    /// Subscribe with a filter
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{AgentRegistration, BroadcastMessage, StatusUpdate, AgentState};

    fn broadcast(from: &str) -> AgentEvent {
        AgentEvent::Broadcast(BroadcastMessage {
            from: from.to_string(),
            topic: "note".to_string(),
            payload: serde_json::json!({}),
        })
    }

    fn registered(agent: &str) -> AgentEvent {
        AgentEvent::Registered(AgentRegistration {
            agent_id: agent.to_string(),
            tools: vec![],
        })
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = Arc::clone(&seen);
            bus.on(EventKind::Broadcast, move |_| seen.lock().unwrap().push(n));
        }
        bus.emit(broadcast("a"));

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_listener_only_sees_its_topic() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        bus.on(EventKind::Registered, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(broadcast("a"));
        bus.emit(registered("b"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicU64::new(0));

        bus.on(EventKind::Broadcast, |_| panic!("listener exploded"));
        let r = Arc::clone(&reached);
        bus.on(EventKind::Broadcast, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(broadcast("a"));

        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert_eq!(bus.event_count(EventKind::Broadcast), 1);
        assert_eq!(bus.history(10).len(), 1);
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        let id = bus.on(EventKind::Broadcast, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.listener_count(EventKind::Broadcast), 1);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(broadcast("a"));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(EventKind::Broadcast), 0);
    }

    #[test]
    fn test_history_is_bounded_and_ordered() {
        let bus = EventBus::with_history_capacity(3);
        for n in 0..5 {
            bus.emit(broadcast(&format!("agent-{}", n)));
        }

        let history = bus.history(10);
        let senders: Vec<&str> = history
            .iter()
            .filter_map(|e| e.event.agent_id())
            .collect();
        assert_eq!(senders, vec!["agent-2", "agent-3", "agent-4"]);

        let last_two = bus.history(2);
        assert_eq!(last_two[0].event.agent_id(), Some("agent-3"));
        assert_eq!(last_two[1].event.agent_id(), Some("agent-4"));
        assert_eq!(bus.event_count(EventKind::Broadcast), 5);
    }

    #[test]
    fn test_default_history_capacity() {
        let bus = EventBus::new();
        for _ in 0..(DEFAULT_HISTORY_CAPACITY + 5) {
            bus.emit(broadcast("a"));
        }
        assert_eq!(bus.history(usize::MAX).len(), DEFAULT_HISTORY_CAPACITY);
        assert_eq!(bus.stats().total_events, DEFAULT_HISTORY_CAPACITY as u64 + 5);
    }

    #[test]
    fn test_reentrant_emit_from_listener() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.on(EventKind::Registered, move |event| {
            if let Some(agent) = event.event.agent_id() {
                inner.emit(AgentEvent::Status(StatusUpdate {
                    agent_id: agent.to_string(),
                    state: AgentState::Idle,
                    request_id: None,
                    in_flight: 0,
                }));
            }
        });

        bus.emit(registered("analyst"));

        assert_eq!(bus.event_count(EventKind::Status), 1);
        assert_eq!(bus.event_count(EventKind::Registered), 1);
    }

    #[test]
    fn test_stats() {
        let bus = EventBus::new();
        bus.on(EventKind::Broadcast, |_| {});
        bus.emit(broadcast("a"));
        bus.emit(registered("b"));

        let stats = bus.stats();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.by_type.get("agent:broadcast"), Some(&1));
        assert_eq!(stats.listeners, 1);

        bus.clear_history();
        assert_eq!(bus.stats().history_len, 0);
        assert_eq!(bus.stats().total_events, 2);
    }

    #[tokio::test]
    async fn test_broadcast_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(registered("analyst"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Registered);
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::new()
            .agent("analyst")
            .kinds(vec![EventKind::Registered]);

        let matching = Event::new(registered("analyst"));
        let other_agent = Event::new(registered("critic"));
        let other_kind = Event::new(broadcast("analyst"));

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other_agent));
        assert!(!filter.matches(&other_kind));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = Arc::new(EventBus::new());
        let mut filtered = bus.subscribe_filtered(EventFilter::new().agent("target"));

        let publisher = Arc::clone(&bus);
        tokio::spawn(async move {
            publisher.emit(registered("other"));
            publisher.emit(registered("target"));
        });

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.event.agent_id(), Some("target"));
    }
}
