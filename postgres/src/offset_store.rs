//! `PostgreSQL` stored-offset loader.
//!
//! Table layout:
//!
//! ```sql
//! kafka_offsets (
//!     group_id     text,
//!     topic        text,
//!     partition    int,
//!     offset_value bigint,
//!     primary key (group_id, topic, partition)
//! )
//! ```
//!
//! `offset_value` is the last *processed* offset; at startup a statically
//! assigned consumer seeks to `offset_value + 1`.

use async_trait::async_trait;
use silverback_core::envelope::{MessageId, TopicPartition};
use silverback_core::offset_store::{OffsetStore, OffsetStoreError};
use sqlx::postgres::PgPool;

/// `PostgreSQL`-backed [`OffsetStore`].
#[derive(Clone)]
pub struct PostgresOffsetStore {
    pool: PgPool,
}

impl PostgresOffsetStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `kafka_offsets` table when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`OffsetStoreError::Database`] when the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), OffsetStoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS kafka_offsets (
                group_id     TEXT NOT NULL,
                topic        TEXT NOT NULL,
                partition    INT NOT NULL,
                offset_value BIGINT NOT NULL,
                PRIMARY KEY (group_id, topic, partition)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OffsetStoreError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for PostgresOffsetStore {
    async fn load(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<Option<i64>, OffsetStoreError> {
        let offset: Option<i64> = sqlx::query_scalar(
            r"
            SELECT offset_value FROM kafka_offsets
            WHERE group_id = $1 AND topic = $2 AND partition = $3
            ",
        )
        .bind(group)
        .bind(&partition.topic)
        .bind(partition.partition)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OffsetStoreError::Database(e.to_string()))?;
        Ok(offset)
    }

    async fn store(&self, group: &str, id: &MessageId) -> Result<(), OffsetStoreError> {
        sqlx::query(
            r"
            INSERT INTO kafka_offsets (group_id, topic, partition, offset_value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (group_id, topic, partition) DO UPDATE
                SET offset_value = GREATEST(kafka_offsets.offset_value, EXCLUDED.offset_value)
            ",
        )
        .bind(group)
        .bind(&id.topic)
        .bind(id.partition)
        .bind(id.offset)
        .execute(&self.pool)
        .await
        .map_err(|e| OffsetStoreError::Database(e.to_string()))?;
        Ok(())
    }
}
