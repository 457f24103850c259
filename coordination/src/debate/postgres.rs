//! PostgreSQL debate store.
//!
//! Transactions are plain `BEGIN ... COMMIT` blocks on a single client;
//! the client is held for the whole transaction, so transactions on one
//! store run one after another.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use super::persistence::{DebateStore, DebateTransaction, IsolationLevel, StoreError};
use super::state::SessionStatus;
use super::types::{DebateExchange, DebateRound, DebateTranscript};

/// Tables used by [`PgDebateStore`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS debate_sessions (
    id          TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    updated_at  BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS debate_transcripts (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    postures    TEXT NOT NULL,
    metadata    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS debate_rounds (
    transcript_id   TEXT NOT NULL REFERENCES debate_transcripts(id),
    round_number    INTEGER NOT NULL,
    round_type      TEXT NOT NULL,
    target_posture  TEXT,
    start_time      BIGINT NOT NULL,
    end_time        BIGINT,
    PRIMARY KEY (transcript_id, round_number)
);
CREATE TABLE IF NOT EXISTS debate_exchanges (
    id              TEXT PRIMARY KEY,
    transcript_id   TEXT NOT NULL,
    round_number    INTEGER NOT NULL,
    seq             INTEGER NOT NULL,
    from_posture    TEXT NOT NULL,
    to_posture      TEXT,
    exchange_type   TEXT NOT NULL,
    content         TEXT NOT NULL,
    topics          TEXT NOT NULL,
    created_at      BIGINT NOT NULL,
    FOREIGN KEY (transcript_id, round_number)
        REFERENCES debate_rounds(transcript_id, round_number)
);
"#;

fn backend(e: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct PgDebateStore {
    client: Arc<Mutex<Client>>,
}

impl PgDebateStore {
    /// Connect and drive the connection on the current runtime.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await.map_err(backend)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Postgres connection closed");
            }
        });
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
        }
    }

    /// Create the debate tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        self.client
            .lock()
            .await
            .batch_execute(SCHEMA)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl DebateStore for PgDebateStore {
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn DebateTransaction>, StoreError> {
        let client = Arc::clone(&self.client).lock_owned().await;
        client
            .batch_execute(&format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql()))
            .await
            .map_err(backend)?;
        debug!(isolation = isolation.as_sql(), "Postgres transaction started");
        Ok(Box::new(PgTransaction { client }))
    }
}

struct PgTransaction {
    client: OwnedMutexGuard<Client>,
}

#[async_trait]
impl DebateTransaction for PgTransaction {
    async fn create_transcript(&mut self, transcript: &DebateTranscript) -> Result<(), StoreError> {
        let postures = serde_json::to_string(&transcript.postures)?;
        let metadata = serde_json::to_string(&transcript.metadata)?;
        self.client
            .execute(
                "INSERT INTO debate_transcripts (id, session_id, postures, metadata) \
                 VALUES ($1, $2, $3, $4)",
                &[&transcript.id, &transcript.session_id, &postures, &metadata],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn create_round(
        &mut self,
        transcript_id: &str,
        round: &DebateRound,
    ) -> Result<(), StoreError> {
        let round_number = round.round_number as i32;
        let round_type = round.round_type.to_string();
        let start = round.start_time.timestamp_millis();
        self.client
            .execute(
                "INSERT INTO debate_rounds \
                 (transcript_id, round_number, round_type, target_posture, start_time) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &transcript_id,
                    &round_number,
                    &round_type,
                    &round.target_posture,
                    &start,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn bulk_create_exchanges(
        &mut self,
        transcript_id: &str,
        round_number: u32,
        exchanges: &[DebateExchange],
    ) -> Result<(), StoreError> {
        let statement = self
            .client
            .prepare(
                "INSERT INTO debate_exchanges \
                 (id, transcript_id, round_number, seq, from_posture, to_posture, \
                  exchange_type, content, topics, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .await
            .map_err(backend)?;
        let round_number = round_number as i32;
        for (seq, exchange) in exchanges.iter().enumerate() {
            let seq = seq as i32;
            let exchange_type = exchange.exchange_type.to_string();
            let topics = serde_json::to_string(&exchange.topics)?;
            let created = exchange.timestamp.timestamp_millis();
            self.client
                .execute(
                    &statement,
                    &[
                        &exchange.id,
                        &transcript_id,
                        &round_number,
                        &seq,
                        &exchange.from,
                        &exchange.to,
                        &exchange_type,
                        &exchange.content,
                        &topics,
                        &created,
                    ],
                )
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn update_round_end_time(
        &mut self,
        transcript_id: &str,
        round_number: u32,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let round_number = round_number as i32;
        let end = end_time.timestamp_millis();
        let updated = self
            .client
            .execute(
                "UPDATE debate_rounds SET end_time = $3 \
                 WHERE transcript_id = $1 AND round_number = $2",
                &[&transcript_id, &round_number, &end],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                what: format!("round {} of transcript {}", round_number, transcript_id),
            });
        }
        Ok(())
    }

    async fn update_session_status(
        &mut self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let status = status.as_str();
        let now = Utc::now().timestamp_millis();
        self.client
            .execute(
                "INSERT INTO debate_sessions (id, status, updated_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, \
                 updated_at = EXCLUDED.updated_at",
                &[&session_id, &status, &now],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.client.batch_execute("COMMIT").await.map_err(backend)?;
        debug!("Postgres transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.client.batch_execute("ROLLBACK").await.map_err(backend)?;
        debug!("Postgres transaction rolled back");
        Ok(())
    }
}
