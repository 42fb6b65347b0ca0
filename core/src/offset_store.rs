//! Stored-offset loader for static partition assignment.
//!
//! When a consumer uses static assignment instead of consumer-group
//! subscription, the broker does not track its progress. An [`OffsetStore`]
//! persists the last processed offset per `(group, topic, partition)`; at
//! startup the consumer seeks to `stored + 1`, or to the configured default
//! when nothing is stored.
//!
//! The `PostgreSQL` implementation lives in `silverback-postgres`
//! (`kafka_offsets` table); an in-memory one lives in `silverback-testing`.

use crate::envelope::{MessageId, TopicPartition};
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by offset stores.
#[derive(Error, Debug, Clone)]
pub enum OffsetStoreError {
    /// Database connection or query failed.
    #[error("offset store database error: {0}")]
    Database(String),
}

/// Durable storage for the last processed offset per partition.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// The last stored offset for `(group, partition)`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`OffsetStoreError::Database`] when the query fails.
    async fn load(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<Option<i64>, OffsetStoreError>;

    /// Record `id.offset` as processed for `(group, id.topic_partition())`.
    ///
    /// # Errors
    ///
    /// Returns [`OffsetStoreError::Database`] when the upsert fails.
    async fn store(&self, group: &str, id: &MessageId) -> Result<(), OffsetStoreError>;
}
