//! Debate persistence: transactional store primitives.
//!
//! A debate run writes through one [`DebateTransaction`] obtained from
//! [`DebateStore::begin`]. Nothing becomes visible until `commit`; a
//! `rollback` (or a failed commit) leaves the store untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::state::SessionStatus;
use super::types::{DebateExchange, DebateRound, DebateTranscript};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Error during persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Source of transactions.
#[async_trait]
pub trait DebateStore: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel)
        -> Result<Box<dyn DebateTransaction>, StoreError>;
}

/// The five write primitives plus commit/rollback.
#[async_trait]
pub trait DebateTransaction: Send {
    /// Create the transcript header (postures and metadata; rounds are
    /// written separately).
    async fn create_transcript(&mut self, transcript: &DebateTranscript) -> Result<(), StoreError>;

    /// Create a round record without its exchanges.
    async fn create_round(&mut self, transcript_id: &str, round: &DebateRound)
        -> Result<(), StoreError>;

    async fn bulk_create_exchanges(
        &mut self,
        transcript_id: &str,
        round_number: u32,
        exchanges: &[DebateExchange],
    ) -> Result<(), StoreError>;

    async fn update_round_end_time(
        &mut self,
        transcript_id: &str,
        round_number: u32,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn update_session_status(
        &mut self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Committed session status as seen by the memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRecord {
    pub status: SessionStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    transcripts: HashMap<String, StoredTranscript>,
    sessions: HashMap<String, SessionRecord>,
    commits: u64,
    rollbacks: u64,
}

#[derive(Debug, Clone)]
struct StoredTranscript {
    header: DebateTranscript,
    rounds: BTreeMap<u32, DebateRound>,
}

#[derive(Debug, Clone)]
enum Op {
    CreateTranscript(DebateTranscript),
    CreateRound {
        transcript_id: String,
        round: DebateRound,
    },
    CreateExchanges {
        transcript_id: String,
        round_number: u32,
        exchanges: Vec<DebateExchange>,
    },
    EndRound {
        transcript_id: String,
        round_number: u32,
        end_time: DateTime<Utc>,
    },
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
}

impl MemoryState {
    fn round_mut(
        &mut self,
        transcript_id: &str,
        round_number: u32,
    ) -> Result<&mut DebateRound, StoreError> {
        self.transcripts
            .get_mut(transcript_id)
            .ok_or_else(|| StoreError::NotFound {
                what: format!("transcript {}", transcript_id),
            })?
            .rounds
            .get_mut(&round_number)
            .ok_or_else(|| StoreError::NotFound {
                what: format!("round {} of transcript {}", round_number, transcript_id),
            })
    }

    fn apply(&mut self, op: Op) -> Result<(), StoreError> {
        match op {
            Op::CreateTranscript(mut header) => {
                if self.transcripts.contains_key(&header.id) {
                    return Err(StoreError::Conflict(format!(
                        "transcript {} already exists",
                        header.id
                    )));
                }
                header.rounds.clear();
                self.transcripts.insert(
                    header.id.clone(),
                    StoredTranscript {
                        header,
                        rounds: BTreeMap::new(),
                    },
                );
            }
            Op::CreateRound {
                transcript_id,
                mut round,
            } => {
                let stored =
                    self.transcripts
                        .get_mut(&transcript_id)
                        .ok_or_else(|| StoreError::NotFound {
                            what: format!("transcript {}", transcript_id),
                        })?;
                if stored.rounds.contains_key(&round.round_number) {
                    return Err(StoreError::Conflict(format!(
                        "round {} of transcript {} already exists",
                        round.round_number, transcript_id
                    )));
                }
                round.exchanges.clear();
                stored.rounds.insert(round.round_number, round);
            }
            Op::CreateExchanges {
                transcript_id,
                round_number,
                exchanges,
            } => {
                self.round_mut(&transcript_id, round_number)?
                    .exchanges
                    .extend(exchanges);
            }
            Op::EndRound {
                transcript_id,
                round_number,
                end_time,
            } => {
                self.round_mut(&transcript_id, round_number)?.end_time = Some(end_time);
            }
            Op::SessionStatus { session_id, status } => {
                self.sessions.insert(
                    session_id,
                    SessionRecord {
                        status,
                        updated_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process store. Transactions buffer their writes and apply them
/// atomically on commit; commits are serialized, so every isolation level
/// behaves as serializable.
#[derive(Debug, Clone, Default)]
pub struct MemoryDebateStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDebateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed transcript with its rounds in order.
    pub fn transcript(&self, transcript_id: &str) -> Option<DebateTranscript> {
        lock(&self.state)
            .transcripts
            .get(transcript_id)
            .map(|stored| {
                let mut transcript = stored.header.clone();
                transcript.rounds = stored.rounds.values().cloned().collect();
                transcript
            })
    }

    /// Committed transcripts belonging to a session.
    pub fn transcripts_for_session(&self, session_id: &str) -> Vec<DebateTranscript> {
        let ids: Vec<String> = lock(&self.state)
            .transcripts
            .values()
            .filter(|stored| stored.header.session_id == session_id)
            .map(|stored| stored.header.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.transcript(id)).collect()
    }

    pub fn transcript_count(&self) -> usize {
        lock(&self.state).transcripts.len()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        lock(&self.state).sessions.get(session_id).copied()
    }

    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.session(session_id).map(|record| record.status)
    }

    pub fn commit_count(&self) -> u64 {
        lock(&self.state).commits
    }

    pub fn rollback_count(&self) -> u64 {
        lock(&self.state).rollbacks
    }
}

#[async_trait]
impl DebateStore for MemoryDebateStore {
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn DebateTransaction>, StoreError> {
        debug!(isolation = isolation.as_sql(), "Memory transaction started");
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            ops: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    ops: Vec<Op>,
}

#[async_trait]
impl DebateTransaction for MemoryTransaction {
    async fn create_transcript(&mut self, transcript: &DebateTranscript) -> Result<(), StoreError> {
        self.ops.push(Op::CreateTranscript(transcript.clone()));
        Ok(())
    }

    async fn create_round(
        &mut self,
        transcript_id: &str,
        round: &DebateRound,
    ) -> Result<(), StoreError> {
        self.ops.push(Op::CreateRound {
            transcript_id: transcript_id.to_string(),
            round: round.clone(),
        });
        Ok(())
    }

    async fn bulk_create_exchanges(
        &mut self,
        transcript_id: &str,
        round_number: u32,
        exchanges: &[DebateExchange],
    ) -> Result<(), StoreError> {
        self.ops.push(Op::CreateExchanges {
            transcript_id: transcript_id.to_string(),
            round_number,
            exchanges: exchanges.to_vec(),
        });
        Ok(())
    }

    async fn update_round_end_time(
        &mut self,
        transcript_id: &str,
        round_number: u32,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ops.push(Op::EndRound {
            transcript_id: transcript_id.to_string(),
            round_number,
            end_time,
        });
        Ok(())
    }

    async fn update_session_status(
        &mut self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        self.ops.push(Op::SessionStatus {
            session_id: session_id.to_string(),
            status,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { state, ops } = *self;
        let mut state = lock(&state);
        // apply to a copy so a failing op leaves the store untouched
        let mut staged = state.clone();
        let op_count = ops.len();
        for op in ops {
            if let Err(e) = staged.apply(op) {
                state.rollbacks += 1;
                return Err(e);
            }
        }
        staged.commits += 1;
        *state = staged;
        debug!(ops = op_count, "Memory transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        lock(&self.state).rollbacks += 1;
        debug!(ops = self.ops.len(), "Memory transaction rolled back");
        Ok(())
    }
}
