//! Debate orchestrator: drives exposition and cross-examination rounds.
//!
//! Ties together the session state machine, the agent orchestrator and a
//! transactional store to run a complete debate end-to-end. Every debater
//! call goes through [`Orchestrator::invoke`], so cycle checks, rate
//! limits and caching apply to debates like any other traffic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::persistence::{DebateStore, DebateTransaction, IsolationLevel, StoreError};
use super::state::{DebateSession, SessionStatus, TransitionError, POSTURES_PER_DEBATE};
use super::types::{DebateExchange, DebateRound, DebateTranscript, ExchangeType, Posture};
use crate::error::{ErrorCode, InvocationError};
use crate::orchestrator::{
    CallerContext, InvocationParams, InvocationResult, Orchestrator, RetryPolicy,
};

/// Tool a debater exposes to state its opening position.
pub const TOOL_PRESENT_POSITION: &str = "present_position";
/// Tool a debater exposes to question another posture.
pub const TOOL_ASK_QUESTION: &str = "ask_question";
/// Tool a debater exposes to answer the questions of one round.
pub const TOOL_ANSWER_QUESTIONS: &str = "answer_questions";
/// Tool a judge exposes to produce the verdict.
pub const TOOL_EVALUATE_DEBATE: &str = "evaluate_debate";

/// Most questions one examiner may ask per round.
pub const MAX_QUESTIONS_PER_EXAMINER: u32 = 2;

/// Configuration for the debate orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateConfig {
    /// Questions each examiner asks per cross-examination round (1 or 2).
    pub questions_per_examiner: u32,
    /// Retries per debater call on rate limiting or timeout.
    pub sub_invocation_retries: u32,
    /// Upper bound for the whole run, including evaluation.
    pub transaction_timeout_secs: u64,
    /// Timeout of each debater call.
    pub invocation_timeout_ms: u64,
    /// Caller id used for debater invocations.
    pub moderator_id: String,
    /// Agent asked for a verdict after the last round.
    pub judge_id: Option<String>,
    pub isolation: IsolationLevel,
}

impl DebateConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.sub_invocation_retries,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: u64::MAX,
        }
    }
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            questions_per_examiner: 1,
            sub_invocation_retries: 2,
            transaction_timeout_secs: 120,
            invocation_timeout_ms: 30_000,
            moderator_id: "moderator".to_string(),
            judge_id: None,
            isolation: IsolationLevel::Serializable,
        }
    }
}

/// Error from the debate orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum DebateError {
    #[error("invalid debate: {0}")]
    Validation(String),

    #[error("round {round}: {source}")]
    Invocation {
        round: u32,
        #[source]
        source: InvocationError,
    },

    #[error("debate timed out after {}s in round {round}", .after.as_secs())]
    Timeout { after: Duration, round: u32 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl DebateError {
    /// Error code reported to API callers.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::Invocation { source, .. } => source.code,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Store(_) | Self::Transition(_) => ErrorCode::InternalError,
        }
    }
}

/// Runs debate sessions.
pub struct DebateOrchestrator {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn DebateStore>,
    config: DebateConfig,
}

impl DebateOrchestrator {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn DebateStore>,
        config: DebateConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            config,
        }
    }

    pub fn config(&self) -> &DebateConfig {
        &self.config
    }

    fn validate(&self, session: &DebateSession) -> Result<(), DebateError> {
        if session.postures.len() != POSTURES_PER_DEBATE {
            return Err(DebateError::Validation(format!(
                "a debate needs exactly {} postures, got {}",
                POSTURES_PER_DEBATE,
                session.postures.len()
            )));
        }
        for (i, posture) in session.postures.iter().enumerate() {
            if session.postures[..i].iter().any(|p| p.id == posture.id) {
                return Err(DebateError::Validation(format!(
                    "duplicate posture id '{}'",
                    posture.id
                )));
            }
        }
        if !(1..=MAX_QUESTIONS_PER_EXAMINER).contains(&self.config.questions_per_examiner) {
            return Err(DebateError::Validation(format!(
                "questions_per_examiner must be between 1 and {}, got {}",
                MAX_QUESTIONS_PER_EXAMINER, self.config.questions_per_examiner
            )));
        }
        Ok(())
    }

    /// Run every round of `session` and return the final transcript.
    ///
    /// On failure the run is rolled back, a partial transcript holding the
    /// completed rounds is persisted in a fresh transaction, and the
    /// session ends in `error`.
    pub async fn run(&self, session: &mut DebateSession) -> Result<DebateTranscript, DebateError> {
        if let Err(e) = self.validate(session) {
            session.fail(&e.to_string());
            return Err(e);
        }
        session.transition(SessionStatus::Debating, "rounds started")?;

        let mut transcript = DebateTranscript::new(
            &session.id,
            session.postures.clone(),
            session.planned_rounds(),
        );
        info!(
            session_id = %session.id,
            postures = session.postures.len(),
            rounds = session.planned_rounds(),
            "Debate started"
        );

        let mut tx = match self.store.begin(self.config.isolation).await {
            Ok(tx) => tx,
            Err(e) => {
                let err = DebateError::Store(e);
                self.recover(session, &transcript, &err).await;
                return Err(err);
            }
        };

        let timeout = self.config.transaction_timeout();
        let outcome = match tokio::time::timeout(
            timeout,
            self.execute(session, &mut transcript, tx.as_mut()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(DebateError::Timeout {
                after: timeout,
                round: session.current_round,
            }),
        };

        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(session_id = %session.id, error = %e, "Rollback failed");
                }
                self.recover(session, &transcript, &err).await;
                return Err(err);
            }
        };

        if let Err(e) = tx.commit().await {
            let err = DebateError::Store(e);
            self.recover(session, &transcript, &err).await;
            return Err(err);
        }

        transcript.metadata.completed_at = Some(Utc::now());
        session.verdict = verdict;
        session.transcript = Some(transcript.clone());
        session.transition(SessionStatus::Completed, "transcript committed")?;
        info!(
            session_id = %session.id,
            rounds = transcript.rounds.len(),
            exchanges = transcript.exchange_count(),
            "Debate completed"
        );
        Ok(transcript)
    }

    /// All rounds plus evaluation, written through `tx`.
    async fn execute(
        &self,
        session: &mut DebateSession,
        transcript: &mut DebateTranscript,
        tx: &mut dyn DebateTransaction,
    ) -> Result<Option<Value>, DebateError> {
        tx.update_session_status(&session.id, SessionStatus::Debating)
            .await?;
        tx.create_transcript(transcript).await?;

        let postures = session.postures.clone();
        for round_number in 1..=session.planned_rounds() {
            session.current_round = round_number;
            let mut round = if round_number == 1 {
                DebateRound::exposition()
            } else {
                let target = &postures[(round_number - 2) as usize];
                DebateRound::cross_examination(round_number, target.id.clone())
            };
            info!(
                session_id = %session.id,
                round = round_number,
                round_type = %round.round_type,
                target = ?round.target_posture,
                "Debate round started"
            );
            tx.create_round(&transcript.id, &round).await?;

            let exchanges = if round_number == 1 {
                self.exposition_round(session, &postures).await?
            } else {
                let target = &postures[(round_number - 2) as usize];
                self.cross_examination_round(session, transcript, &postures, target, round_number)
                    .await?
            };
            tx.bulk_create_exchanges(&transcript.id, round_number, &exchanges)
                .await?;

            let end_time = Utc::now();
            tx.update_round_end_time(&transcript.id, round_number, end_time)
                .await?;
            round.exchanges = exchanges;
            round.end_time = Some(end_time);
            transcript.rounds.push(round);

            self.orchestrator.broadcast(
                &self.config.moderator_id,
                "debate.round_completed",
                json!({
                    "sessionId": session.id,
                    "roundNumber": round_number,
                    "exchanges": transcript.rounds.last().map_or(0, |r| r.exchanges.len()),
                }),
            );
            info!(session_id = %session.id, round = round_number, "Debate round completed");
        }

        session.transition(SessionStatus::Evaluating, "all rounds completed")?;
        let verdict = match &self.config.judge_id {
            Some(judge) => {
                let params = self
                    .params(session, judge, TOOL_EVALUATE_DEBATE)
                    .with_args(json!({
                        "sessionId": session.id,
                        "topic": session.topic,
                        "transcript": transcript,
                    }));
                let result = self.call(params, session.current_round).await?;
                Some(result.data)
            }
            None => None,
        };
        tx.update_session_status(&session.id, SessionStatus::Completed)
            .await?;
        Ok(verdict)
    }

    /// Round 1: each posture states its position, one after another.
    async fn exposition_round(
        &self,
        session: &DebateSession,
        postures: &[Posture],
    ) -> Result<Vec<DebateExchange>, DebateError> {
        let mut exchanges = Vec::with_capacity(postures.len());
        for posture in postures {
            let params = self
                .params(session, &posture.debater_id, TOOL_PRESENT_POSITION)
                .with_args(json!({
                    "sessionId": session.id,
                    "topic": session.topic,
                    "round": 1,
                    "posture": posture,
                }));
            let result = self.call(params, 1).await?;
            exchanges.push(DebateExchange::new(
                posture.id.clone(),
                None,
                ExchangeType::Exposition,
                result.content(),
                posture.topics.clone(),
            ));
        }
        Ok(exchanges)
    }

    /// Rounds 2..=4: every other posture questions `target`, then `target`
    /// answers all questions at once.
    async fn cross_examination_round(
        &self,
        session: &DebateSession,
        transcript: &DebateTranscript,
        postures: &[Posture],
        target: &Posture,
        round_number: u32,
    ) -> Result<Vec<DebateExchange>, DebateError> {
        let history = exchange_history(transcript);
        let mut asks = Vec::new();
        for examiner in postures.iter().filter(|p| p.id != target.id) {
            for index in 0..self.config.questions_per_examiner {
                let params = self
                    .params(session, &examiner.debater_id, TOOL_ASK_QUESTION)
                    .with_args(json!({
                        "sessionId": session.id,
                        "topic": session.topic,
                        "round": round_number,
                        "posture": examiner,
                        "target": target,
                        "questionIndex": index,
                        "history": history,
                    }));
                asks.push(async move {
                    let result = self.call(params, round_number).await?;
                    Ok::<_, DebateError>((examiner, result))
                });
            }
        }
        let answers = try_join_all(asks).await?;

        let mut exchanges: Vec<DebateExchange> = answers
            .into_iter()
            .map(|(examiner, result)| {
                DebateExchange::new(
                    examiner.id.clone(),
                    Some(target.id.clone()),
                    ExchangeType::Question,
                    result.content(),
                    target.topics.clone(),
                )
            })
            .collect();

        let questions: Vec<Value> = exchanges
            .iter()
            .map(|q| json!({ "from": q.from, "content": q.content }))
            .collect();
        let combined = exchanges
            .iter()
            .map(|q| format!("[{}] {}", q.from, q.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let params = self
            .params(session, &target.debater_id, TOOL_ANSWER_QUESTIONS)
            .with_args(json!({
                "sessionId": session.id,
                "topic": session.topic,
                "round": round_number,
                "posture": target,
                "questions": questions,
                "combined": combined,
            }));
        let answer = self.call(params, round_number).await?;
        exchanges.push(DebateExchange::new(
            target.id.clone(),
            None,
            ExchangeType::Answer,
            answer.content(),
            target.topics.clone(),
        ));
        Ok(exchanges)
    }

    fn params(&self, session: &DebateSession, to: &str, tool: &str) -> InvocationParams {
        InvocationParams::new(self.config.moderator_id.clone(), to, tool)
            .with_context(CallerContext::new().with_session(session.id.clone()))
            .with_timeout(self.config.invocation_timeout())
    }

    /// Invoke a debater, retrying rate limits with backoff and timeouts
    /// immediately.
    async fn call(
        &self,
        params: InvocationParams,
        round: u32,
    ) -> Result<InvocationResult, DebateError> {
        let policy = self.config.retry_policy();
        let mut attempt = 0;
        loop {
            let error = match self.orchestrator.invoke(params.clone()).await {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };
            let delay = match error.code {
                ErrorCode::RateLimitExceeded => policy.backoff_duration(attempt),
                ErrorCode::Timeout => Duration::ZERO,
                _ => return Err(DebateError::Invocation { round, source: error }),
            };
            if !policy.should_retry(attempt) {
                return Err(DebateError::Invocation { round, source: error });
            }
            warn!(
                to = %params.to,
                tool = %params.tool,
                round,
                attempt = attempt + 1,
                code = %error.code,
                delay_ms = delay.as_millis() as u64,
                "Retrying debater call"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    /// Fail the session and keep whatever rounds completed.
    async fn recover(
        &self,
        session: &mut DebateSession,
        transcript: &DebateTranscript,
        err: &DebateError,
    ) {
        let message = err.to_string();
        error!(
            session_id = %session.id,
            round = session.current_round,
            error = %message,
            "Debate failed"
        );

        let mut partial = transcript.clone();
        partial.rounds.retain(DebateRound::is_complete);
        partial.metadata.partial_debate = true;
        partial.metadata.failure_round = Some(session.current_round);
        partial.metadata.error_message = Some(message.clone());

        session.fail(&message);

        if let Err(e) = self.persist_failure(&session.id, &partial).await {
            error!(session_id = %session.id, error = %e, "Could not persist partial debate");
        }
        if !partial.rounds.is_empty() {
            session.transcript = Some(partial);
        }
    }

    /// Fresh transaction: the partial transcript (if any round completed)
    /// and the `error` status.
    async fn persist_failure(
        &self,
        session_id: &str,
        partial: &DebateTranscript,
    ) -> Result<(), StoreError> {
        let mut tx = self.store.begin(self.config.isolation).await?;
        match write_failure(tx.as_mut(), session_id, partial).await {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(session_id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn write_failure(
    tx: &mut dyn DebateTransaction,
    session_id: &str,
    partial: &DebateTranscript,
) -> Result<(), StoreError> {
    if !partial.rounds.is_empty() {
        tx.create_transcript(partial).await?;
        for round in &partial.rounds {
            tx.create_round(&partial.id, round).await?;
            tx.bulk_create_exchanges(&partial.id, round.round_number, &round.exchanges)
                .await?;
            if let Some(end_time) = round.end_time {
                tx.update_round_end_time(&partial.id, round.round_number, end_time)
                    .await?;
            }
        }
        info!(
            session_id,
            rounds = partial.rounds.len(),
            "Partial debate persisted"
        );
    }
    tx.update_session_status(session_id, SessionStatus::Error)
        .await
}

/// Exchanges of completed rounds, as handed to debaters for context.
fn exchange_history(transcript: &DebateTranscript) -> Vec<Value> {
    transcript
        .rounds
        .iter()
        .flat_map(|round| {
            round.exchanges.iter().map(move |e| {
                json!({
                    "round": round.round_number,
                    "from": e.from,
                    "to": e.to,
                    "type": e.exchange_type,
                    "content": e.content,
                })
            })
        })
        .collect()
}
