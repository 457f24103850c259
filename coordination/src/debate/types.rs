//! Debate data model: postures, exchanges, rounds and transcripts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestrator::types::AgentId;

/// A stance defended by one debater agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Posture {
    pub id: String,
    pub debater_id: AgentId,
    pub perspective: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub initial_position: String,
    #[serde(default)]
    pub guiding_questions: Vec<String>,
}

impl Posture {
    pub fn new(
        id: impl Into<String>,
        debater_id: impl Into<String>,
        perspective: impl Into<String>,
        initial_position: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            debater_id: debater_id.into(),
            perspective: perspective.into(),
            topics: Vec::new(),
            initial_position: initial_position.into(),
            guiding_questions: Vec::new(),
        }
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_guiding_questions(mut self, questions: Vec<String>) -> Self {
        self.guiding_questions = questions;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeType {
    Exposition,
    Question,
    Answer,
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exposition => write!(f, "exposition"),
            Self::Question => write!(f, "question"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

/// One statement in the debate. `from`/`to` are posture ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateExchange {
    pub id: String,
    pub from: String,
    /// Addressee; `None` for expositions and round answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "type")]
    pub exchange_type: ExchangeType,
    pub content: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl DebateExchange {
    pub fn new(
        from: impl Into<String>,
        to: Option<String>,
        exchange_type: ExchangeType,
        content: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to,
            exchange_type,
            content: content.into(),
            topics,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundType {
    Exposition,
    CrossExamination,
}

impl std::fmt::Display for RoundType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exposition => write!(f, "exposition"),
            Self::CrossExamination => write!(f, "cross_examination"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateRound {
    /// 1-indexed.
    pub round_number: u32,
    pub round_type: RoundType,
    /// Posture under examination; set for cross-examination rounds only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_posture: Option<String>,
    pub exchanges: Vec<DebateExchange>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl DebateRound {
    pub fn exposition() -> Self {
        Self {
            round_number: 1,
            round_type: RoundType::Exposition,
            target_posture: None,
            exchanges: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn cross_examination(round_number: u32, target_posture: impl Into<String>) -> Self {
        Self {
            round_number,
            round_type: RoundType::CrossExamination,
            target_posture: Some(target_posture.into()),
            exchanges: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn exchanges_of(&self, exchange_type: ExchangeType) -> impl Iterator<Item = &DebateExchange> {
        self.exchanges
            .iter()
            .filter(move |e| e.exchange_type == exchange_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMetadata {
    pub total_rounds: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub partial_debate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_round: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateTranscript {
    pub id: String,
    pub session_id: String,
    pub postures: Vec<Posture>,
    pub rounds: Vec<DebateRound>,
    pub metadata: TranscriptMetadata,
}

impl DebateTranscript {
    pub fn new(session_id: &str, postures: Vec<Posture>, total_rounds: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            postures,
            rounds: Vec::new(),
            metadata: TranscriptMetadata {
                total_rounds,
                started_at: Utc::now(),
                completed_at: None,
                partial_debate: false,
                failure_round: None,
                error_message: None,
            },
        }
    }

    /// Rounds that reached their end time.
    pub fn completed_rounds(&self) -> usize {
        self.rounds.iter().filter(|r| r.is_complete()).count()
    }

    pub fn exchange_count(&self) -> usize {
        self.rounds.iter().map(|r| r.exchanges.len()).sum()
    }

    /// Compact summary line.
    pub fn summary_line(&self) -> String {
        let status = if self.metadata.partial_debate {
            "PARTIAL"
        } else {
            "COMPLETE"
        };
        format!(
            "[{}] {}/{} rounds | {} exchanges | {} postures | session={}",
            status,
            self.completed_rounds(),
            self.metadata.total_rounds,
            self.exchange_count(),
            self.postures.len(),
            self.session_id
        )
    }
}
