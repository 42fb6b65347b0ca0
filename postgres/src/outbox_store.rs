//! `PostgreSQL` outbox store.
//!
//! Table layout:
//!
//! ```sql
//! outbox (
//!     id            bigserial primary key,
//!     endpoint_name text not null,
//!     message_type  text,
//!     headers       bytea,
//!     content       bytea,
//!     created_at    timestamptz not null default now()
//! )
//! ```
//!
//! Appends performed through [`OutboxStore::begin`] ride on a database
//! transaction, so rows become visible to the worker only when the caller
//! commits; `READ COMMITTED` (the `PostgreSQL` default) is all the worker
//! needs to never observe uncommitted appends.

use async_trait::async_trait;
use silverback_core::outbox::{
    NewOutboxRecord, OutboxError, OutboxRecord, OutboxStore, OutboxTransaction,
};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};

/// `PostgreSQL`-backed [`OutboxStore`].
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] when the connection fails.
    pub async fn connect(url: &str) -> Result<Self, OutboxError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;
        Ok(Self::from_pool(pool))
    }

    /// The underlying pool (for sharing with the lock and offset store).
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `outbox` table when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] when the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), OutboxError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS outbox (
                id            BIGSERIAL PRIMARY KEY,
                endpoint_name TEXT NOT NULL,
                message_type  TEXT,
                headers       BYTEA,
                content       BYTEA,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> OutboxRecord {
        OutboxRecord {
            id: row.get("id"),
            endpoint_name: row.get("endpoint_name"),
            message_type: row.get("message_type"),
            headers: row.get::<Option<Vec<u8>>, _>("headers").unwrap_or_default(),
            content: row.get("content"),
            created_at: row.get("created_at"),
        }
    }
}

const INSERT_ROW: &str = r"
    INSERT INTO outbox (endpoint_name, message_type, headers, content)
    VALUES ($1, $2, $3, $4)
";

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, record: NewOutboxRecord) -> Result<(), OutboxError> {
        sqlx::query(INSERT_ROW)
            .bind(&record.endpoint_name)
            .bind(&record.message_type)
            .bind(&record.headers)
            .bind(&record.content)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;
        Ok(Box::new(PostgresOutboxTransaction { tx }))
    }

    async fn fetch_batch(&self, limit: u32) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query(
            r"
            SELECT id, endpoint_name, message_type, headers, content, created_at
            FROM outbox
            ORDER BY id ASC
            LIMIT $1
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_record).collect())
    }

    async fn delete(&self, ids: &[i64]) -> Result<(), OutboxError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM outbox WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;
        tracing::debug!(rows = ids.len(), "outbox rows deleted after produce");
        Ok(())
    }
}

/// An open database transaction enlisting outbox appends.
pub struct PostgresOutboxTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OutboxTransaction for PostgresOutboxTransaction {
    async fn append(&mut self, record: NewOutboxRecord) -> Result<(), OutboxError> {
        sqlx::query(INSERT_ROW)
            .bind(&record.endpoint_name)
            .bind(&record.message_type)
            .bind(&record.headers)
            .bind(&record.content)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), OutboxError> {
        self.tx
            .commit()
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<(), OutboxError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))
    }
}
