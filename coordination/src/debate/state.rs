//! Debate session state machine: statuses, transitions, and history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{DebateTranscript, Posture};

/// Postures taking part in every debate.
pub const POSTURES_PER_DEBATE: usize = 3;

/// Rounds of a full run: one exposition round plus one cross-examination
/// round per posture.
pub const ROUNDS_PER_DEBATE: u32 = 1 + POSTURES_PER_DEBATE as u32;

/// Lifecycle status of a debate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session created, rounds not started.
    Initializing,
    /// Rounds are running.
    Debating,
    /// Rounds finished; the verdict is being produced.
    Evaluating,
    /// Verdict (if any) recorded.
    Completed,
    /// The run failed; a partial transcript may exist.
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(self) -> &'static [SessionStatus] {
        match self {
            Self::Initializing => &[Self::Debating, Self::Error],
            Self::Debating => &[Self::Evaluating, Self::Error],
            Self::Evaluating => &[Self::Completed, Self::Error],
            Self::Completed | Self::Error => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Debating => "debating",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "debating" => Ok(Self::Debating),
            "evaluating" => Ok(Self::Evaluating),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// A status transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} → {to}: {reason}")]
pub struct TransitionError {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub reason: String,
}

/// One debate: its postures, progress, and final artefacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateSession {
    pub id: String,
    pub topic: String,
    pub status: SessionStatus,
    /// Round currently running (0 before the first round starts).
    pub current_round: u32,
    pub postures: Vec<Posture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<DebateTranscript>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Value>,
    #[serde(default)]
    pub transitions: Vec<StatusTransition>,
    pub created_at: DateTime<Utc>,
}

impl DebateSession {
    pub fn new(id: &str, topic: &str, postures: Vec<Posture>) -> Self {
        Self {
            id: id.to_string(),
            topic: topic.to_string(),
            status: SessionStatus::Initializing,
            current_round: 0,
            postures,
            transcript: None,
            verdict: None,
            transitions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Move to `to`, recording why.
    pub fn transition(&mut self, to: SessionStatus, reason: &str) -> Result<(), TransitionError> {
        if !self.status.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.status,
                to,
                reason: format!(
                    "not a valid transition (allowed: {:?})",
                    self.status.valid_transitions()
                ),
            });
        }

        self.transitions.push(StatusTransition {
            from: self.status,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.status = to;
        Ok(())
    }

    /// Mark the session failed. A no-op once the session is terminal.
    pub fn fail(&mut self, reason: &str) {
        if !self.status.is_terminal() {
            // Error is reachable from every non-terminal status
            let _ = self.transition(SessionStatus::Error, reason);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Rounds a full run of this session needs.
    pub fn planned_rounds(&self) -> u32 {
        ROUNDS_PER_DEBATE
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] round {}/{} | {} postures | session={}",
            self.status,
            self.current_round,
            self.planned_rounds(),
            self.postures.len(),
            self.id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postures(n: usize) -> Vec<Posture> {
        (0..n)
            .map(|i| Posture::new(format!("p{}", i), format!("d{}", i), "view", "position"))
            .collect()
    }

    #[test]
    fn test_new_session() {
        let session = DebateSession::new("s-1", "tariffs", postures(3));
        assert_eq!(session.status, SessionStatus::Initializing);
        assert_eq!(session.current_round, 0);
        assert_eq!(session.planned_rounds(), 4);
        assert!(!session.is_complete());
    }

    #[test]
    fn test_happy_path() {
        let mut session = DebateSession::new("s-1", "t", postures(3));
        session
            .transition(SessionStatus::Debating, "rounds started")
            .unwrap();
        session
            .transition(SessionStatus::Evaluating, "rounds finished")
            .unwrap();
        session
            .transition(SessionStatus::Completed, "verdict recorded")
            .unwrap();

        assert!(session.is_complete());
        assert_eq!(session.transitions.len(), 3);
        assert_eq!(session.transitions[0].from, SessionStatus::Initializing);
        assert_eq!(session.transitions[2].to, SessionStatus::Completed);
    }

    #[test]
    fn test_cannot_skip_or_go_back() {
        let mut session = DebateSession::new("s-1", "t", postures(3));
        let err = session
            .transition(SessionStatus::Completed, "skip")
            .unwrap_err();
        assert_eq!(err.from, SessionStatus::Initializing);
        assert_eq!(err.to, SessionStatus::Completed);

        session.transition(SessionStatus::Debating, "go").unwrap();
        assert!(session
            .transition(SessionStatus::Initializing, "back")
            .is_err());
        assert_eq!(session.status, SessionStatus::Debating);
    }

    #[test]
    fn test_error_reachable_from_any_non_terminal() {
        for steps in 0..3 {
            let mut session = DebateSession::new("s", "t", postures(3));
            let path = [
                SessionStatus::Debating,
                SessionStatus::Evaluating,
                SessionStatus::Completed,
            ];
            for status in path.iter().take(steps) {
                session.transition(*status, "advance").unwrap();
            }
            session.fail("boom");
            assert_eq!(session.status, SessionStatus::Error);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut session = DebateSession::new("s", "t", postures(3));
        session.fail("boom");
        session.fail("again");
        assert_eq!(session.transitions.len(), 1);
        assert!(session.transition(SessionStatus::Debating, "retry").is_err());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SessionStatus::Initializing,
            SessionStatus::Debating,
            SessionStatus::Evaluating,
            SessionStatus::Completed,
            SessionStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
        assert_eq!(
            serde_json::to_value(SessionStatus::Evaluating).unwrap(),
            "evaluating"
        );
    }
}
