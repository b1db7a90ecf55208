use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio_stream::StreamExt;

use crate::store::{InsertMessages, MessageStore};
use crate::{DeliveryState, Message, MessageId, NewMessage};

/// Default number of identifiers bound into a single `ANY($n)` update.
pub const DEFAULT_ID_CHUNK_SIZE: usize = 1000;

/// Configuration of the Postgres store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct PgStoreConfig {
    /// Table holding the messages. Must be a plain SQL identifier.
    pub table: String,
    /// Upper bound on identifiers per identifier-set update statement.
    pub id_chunk_size: usize,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            table: "messages".to_string(),
            id_chunk_size: DEFAULT_ID_CHUNK_SIZE,
        }
    }
}

impl PgStoreConfig {
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_id_chunk_size(mut self, size: usize) -> Self {
        self.id_chunk_size = size.max(1);
        self
    }
}

/// SQLx-based Postgres message store.
///
/// Claims run as a single `UPDATE` over a `FOR UPDATE SKIP LOCKED`
/// sub-select, so concurrent claims from any number of workers or processes
/// lock disjoint rows.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    table: String,
    id_chunk_size: usize,
}

impl PgStore {
    /// Creates a store without touching the database.
    pub fn new_uninitialized(pool: PgPool, config: PgStoreConfig) -> Result<Self, Error> {
        validate_table_name(&config.table)?;
        Ok(Self {
            pool,
            table: config.table,
            id_chunk_size: config.id_chunk_size.max(1),
        })
    }

    /// Creates a store and ensures the message table exists.
    #[tracing::instrument(skip(pool))]
    pub async fn try_new(pool: PgPool, config: PgStoreConfig) -> Result<Self, Error> {
        let store = Self::new_uninitialized(pool, config)?;
        store.create_table().await?;
        Ok(store)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn create_table(&self) -> Result<(), Error> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                sender VARCHAR(255) NOT NULL,
                recipient VARCHAR(255) NOT NULL,
                subject VARCHAR(255),
                body TEXT,
                state SMALLINT NOT NULL DEFAULT 0
            )",
            self.table
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_state_id_idx ON {table} (state, id)",
            table = self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drops the message table.
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub async fn drop_table(&self) -> Result<(), Error> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops and recreates the message table.
    pub async fn reset(&self) -> Result<(), Error> {
        self.drop_table().await?;
        self.create_table().await
    }
}

#[async_trait]
impl InsertMessages for PgStore {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(table = %self.table))]
    async fn insert_messages(&self, msgs: Vec<NewMessage>) -> Result<Vec<MessageId>, Self::Error> {
        let query = format!(
            "INSERT INTO {} (sender, recipient, subject, body, state) VALUES ($1, $2, $3, $4, $5) RETURNING id",
            self.table
        );
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let id: i64 = sqlx::query_scalar(&query)
                .bind(msg.sender)
                .bind(msg.recipient)
                .bind(msg.subject)
                .bind(msg.body)
                .bind(DeliveryState::Pending.as_i16())
                .fetch_one(&mut *tx)
                .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }
}

#[async_trait]
impl MessageStore for PgStore {
    type Error = Error;

    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Message>, Self::Error> {
        let query = format!(
            "UPDATE {table} SET state = $1 WHERE id IN (
                SELECT id FROM {table} WHERE state = $2 ORDER BY id LIMIT $3 FOR UPDATE SKIP LOCKED
            ) RETURNING id, sender, recipient, subject, body",
            table = self.table
        );
        let mut rows = sqlx::query(&query)
            .bind(DeliveryState::Dispatched.as_i16())
            .bind(DeliveryState::Pending.as_i16())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let subject: Option<String> = row.try_get("subject")?;
            let body: Option<String> = row.try_get("body")?;
            out.push(Message::new(
                row.try_get::<i64, _>("id")?,
                row.try_get::<String, _>("sender")?,
                row.try_get::<String, _>("recipient")?,
                subject.unwrap_or_default(),
                body.unwrap_or_default(),
            ));
        }
        // RETURNING carries no ordering guarantee.
        out.sort_by_key(Message::id);
        Ok(out)
    }

    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn set_state_range(
        &self,
        low: MessageId,
        high: MessageId,
        state: DeliveryState,
    ) -> Result<u64, Self::Error> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET state = $1 WHERE id >= $2 AND id <= $3",
            self.table
        ))
        .bind(state.as_i16())
        .bind(low)
        .bind(high)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self, ids), fields(table = %self.table, count = ids.len()))]
    async fn set_state_ids(
        &self,
        ids: &[MessageId],
        state: DeliveryState,
    ) -> Result<u64, Self::Error> {
        let query = format!("UPDATE {} SET state = $1 WHERE id = ANY($2)", self.table);
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for chunk in ids.chunks(self.id_chunk_size) {
            let result = sqlx::query(&query)
                .bind(state.as_i16())
                .bind(chunk)
                .execute(&mut *tx)
                .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn count_not_dispatched(&self) -> Result<u64, Self::Error> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE state <> $1",
            self.table
        ))
        .bind(DeliveryState::Dispatched.as_i16())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn count_by_state(&self, state: DeliveryState) -> Result<u64, Self::Error> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE state = $1",
            self.table
        ))
        .bind(state.as_i16())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn requeue_failed(&self) -> Result<u64, Self::Error> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET state = $1 WHERE state = $2",
            self.table
        ))
        .bind(DeliveryState::Pending.as_i16())
        .bind(DeliveryState::Failed.as_i16())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn validate_table_name(table: &str) -> Result<(), Error> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && table.len() <= 63;
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_table_name(table))
    }
}

/// Postgres store errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgStoreErrorKind,
}

/// Kinds of Postgres store errors.
#[derive(Debug)]
pub enum PgStoreErrorKind {
    Database(sqlx::Error),
    InvalidTableName(String),
}

impl Error {
    fn invalid_table_name(table: &str) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStoreErrorKind::InvalidTableName(table.to_string()),
        }
    }

    pub fn kind(&self) -> &PgStoreErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgStoreErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            PgStoreErrorKind::InvalidTableName(table) => {
                writeln!(f, "Invalid table name: {:?}", table)
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgStoreErrorKind::Database(err) => Some(err),
            PgStoreErrorKind::InvalidTableName(_) => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStoreErrorKind::Database(err),
        }
    }
}
