//! Postgres dead-letter destination for broker-backed queues
//!
//! A JetStream consumer has no dead-letter stream of its own; messages that
//! spend their delivery budget are copied here, terminated on the broker and
//! kept until an operator redrives them.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::queue::{DeadLetter, QueueMessage};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        source_queue     TEXT NOT NULL,
        message_id       UUID NOT NULL,
        subject          TEXT NOT NULL,
        body             BYTEA NOT NULL,
        receive_count    INTEGER NOT NULL,
        reason           TEXT NOT NULL,
        enqueued_at      TIMESTAMPTZ NOT NULL,
        dead_lettered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (source_queue, message_id)
    )
"#;

const CREATE_QUEUE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS dead_letters_source_queue_idx
        ON dead_letters (source_queue, dead_lettered_at)
"#;

#[derive(Debug, FromRow)]
struct DeadLetterRow {
    source_queue: String,
    message_id: Uuid,
    subject: String,
    body: Vec<u8>,
    receive_count: i32,
    reason: String,
    enqueued_at: DateTime<Utc>,
    dead_lettered_at: DateTime<Utc>,
}

impl From<DeadLetterRow> for StoredDeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        StoredDeadLetter {
            subject: row.subject,
            dead_letter: DeadLetter {
                source_queue: row.source_queue,
                message: QueueMessage {
                    message_id: row.message_id,
                    body: row.body,
                    receive_count: row.receive_count.max(0) as u32,
                    enqueued_at: row.enqueued_at,
                    lease_expires_at: None,
                    last_error: None,
                },
                reason: row.reason,
                dead_lettered_at: row.dead_lettered_at,
            },
        }
    }
}

/// A dead letter plus the broker subject it was originally published on
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDeadLetter {
    pub subject: String,
    pub dead_letter: DeadLetter,
}

#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the dead-letter table if absent
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_QUEUE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// Record a dead letter. Writing the same message twice keeps the latest reason.
    pub async fn insert(
        &self,
        source_queue: &str,
        subject: &str,
        message: &QueueMessage,
        reason: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (source_queue, message_id, subject, body, receive_count, reason, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_queue, message_id) DO UPDATE
                SET reason = EXCLUDED.reason,
                    receive_count = EXCLUDED.receive_count,
                    dead_lettered_at = NOW()
            "#,
        )
        .bind(source_queue)
        .bind(message.message_id)
        .bind(subject)
        .bind(&message.body)
        .bind(message.receive_count as i32)
        .bind(reason)
        .bind(message.enqueued_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Dead letters of one queue, oldest first
    pub async fn list(&self, source_queue: &str) -> Result<Vec<StoredDeadLetter>, sqlx::Error> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT source_queue, message_id, subject, body, receive_count, reason,
                   enqueued_at, dead_lettered_at
            FROM dead_letters
            WHERE source_queue = $1
            ORDER BY dead_lettered_at ASC
            "#,
        )
        .bind(source_queue)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredDeadLetter::from).collect())
    }

    pub async fn get(
        &self,
        source_queue: &str,
        message_id: Uuid,
    ) -> Result<Option<StoredDeadLetter>, sqlx::Error> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT source_queue, message_id, subject, body, receive_count, reason,
                   enqueued_at, dead_lettered_at
            FROM dead_letters
            WHERE source_queue = $1 AND message_id = $2
            "#,
        )
        .bind(source_queue)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StoredDeadLetter::from))
    }

    /// Returns whether a row was removed
    pub async fn delete(&self, source_queue: &str, message_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE source_queue = $1 AND message_id = $2")
            .bind(source_queue)
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self, source_queue: &str) -> Result<usize, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE source_queue = $1")
            .bind(source_queue)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as usize)
    }
}
