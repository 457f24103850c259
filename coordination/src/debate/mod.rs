//! Multi-round structured debate between posture-holding agents.
//!
//! # Round protocol
//!
//! ```text
//! round 1        exposition          every posture states its position (sequential)
//! round 2..=4    cross-examination   round k targets postures[k-2]:
//!                                      others ask questions (concurrent)
//!                                      target answers once (batched)
//! ```
//!
//! Every session has exactly three postures, so a full run has four rounds.
//!
//! # Session lifecycle
//!
//! ```text
//! Initializing → Debating → Evaluating → Completed
//!       │            │           │
//!       └────────────┴───────────┴──→ Error
//! ```
//!
//! The run writes through one [`DebateTransaction`]; a failed run is rolled
//! back and the completed rounds are saved as a partial transcript.

pub mod orchestrator;
pub mod persistence;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod state;
pub mod types;

pub use orchestrator::{
    DebateConfig, DebateError, DebateOrchestrator, MAX_QUESTIONS_PER_EXAMINER,
    TOOL_ANSWER_QUESTIONS, TOOL_ASK_QUESTION, TOOL_EVALUATE_DEBATE, TOOL_PRESENT_POSITION,
};
pub use persistence::{
    DebateStore, DebateTransaction, IsolationLevel, MemoryDebateStore, SessionRecord, StoreError,
};
#[cfg(feature = "postgres")]
pub use postgres::PgDebateStore;
pub use state::{
    DebateSession, SessionStatus, StatusTransition, TransitionError, POSTURES_PER_DEBATE,
    ROUNDS_PER_DEBATE,
};
pub use types::{
    DebateExchange, DebateRound, DebateTranscript, ExchangeType, Posture, RoundType,
    TranscriptMetadata,
};
