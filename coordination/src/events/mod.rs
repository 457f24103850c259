//! Event bus carrying agent invocation traffic
//!
//! Every interaction between the orchestrator and agents travels over the
//! bus as one of seven topics:
//!
//! | Topic | Emitted by | Meaning |
//! |-------|------------|---------|
//! | `agent:invoke` | Orchestrator | tool call dispatched to an agent |
//! | `agent:response` | Agent host | result or error for a request id |
//! | `agent:broadcast` | anyone | fire-and-forget message |
//! | `agent:registered` | Agent host | agent came online |
//! | `agent:deregistered` | Agent host | agent went away |
//! | `agent:status` | both | busy/idle, or cancellation of a request |
//! | `agent:error` | Orchestrator | dispatched invocation failed |
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐  emit   ┌──────────────┐  on(kind)  ┌──────────────┐
//! │ Orchestrator │────────▶│   EventBus   │───────────▶│  AgentHost   │
//! └──────▲───────┘         └──────┬───────┘            └──────┬───────┘
//!        │                        │ subscribe()               │
//!        │                        ▼                           │
//!        │                 ┌──────────────┐                   │
//!        │                 │   gateway    │                   │
//!        │                 └──────────────┘                   │
//!        └──────────────── agent:response ◀───────────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{
    EventBus, EventBusExt, EventBusStats, EventFilter, FilteredReceiver, Listener, ListenerId,
    SharedEventBus, DEFAULT_HISTORY_CAPACITY,
};
pub use types::{
    AgentDeregistration, AgentEvent, AgentRegistration, AgentState, BroadcastMessage, ErrorReport,
    Event, EventKind, InvokeRequest, InvokeResponse, StatusUpdate,
};
