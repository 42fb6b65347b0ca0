//! Transactional outbox and distributed lock abstractions.
//!
//! The outbox is a durable table of pending outbound envelopes. The produce
//! strategy appends rows (inside the caller's database transaction when one
//! is enlisted) and the outbox worker relays them to the broker with
//! at-least-once semantics, deleting rows only after a successful produce.
//!
//! Implementations:
//!
//! - `PostgresOutboxStore` / `PostgresAdvisoryLock` / `PostgresLeaseLock`
//!   (in `silverback-postgres`): production
//! - `InMemoryOutboxStore` / `InMemoryLock` (in `silverback-testing`):
//!   fast, deterministic tests
//!
//! # At-least-once contract
//!
//! Rows appended inside a transaction become visible to the worker only
//! after commit; a rollback discards them. A row is deleted only after the
//! matching producer acknowledged the envelope, so a crash between produce
//! and delete results in a duplicate, never a loss.

use crate::headers::HeaderMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by outbox stores.
#[derive(Error, Debug, Clone)]
pub enum OutboxError {
    /// Database connection or query failed.
    #[error("outbox database error: {0}")]
    Database(String),

    /// Failed to serialize or deserialize a stored envelope.
    #[error("outbox serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by distributed locks.
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// The lock backend failed.
    #[error("distributed lock error: {0}")]
    Backend(String),
}

/// A stored outbox row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Monotonically increasing row identifier (insertion order).
    pub id: i64,
    /// Name of the endpoint the envelope was produced to.
    pub endpoint_name: String,
    /// Type name of the stored message, when known.
    pub message_type: Option<String>,
    /// Serialized headers ([`HeaderMap::to_bytes`]).
    pub headers: Vec<u8>,
    /// Payload bytes; `None` for tombstones.
    pub content: Option<Vec<u8>>,
    /// When the row was appended.
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Decode the stored headers.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Serialization`] for corrupt header bytes.
    pub fn decode_headers(&self) -> Result<HeaderMap, OutboxError> {
        HeaderMap::from_bytes(&self.headers).map_err(OutboxError::Serialization)
    }
}

/// An outbox row to append.
#[derive(Clone, Debug)]
pub struct NewOutboxRecord {
    /// Name of the endpoint the envelope targets.
    pub endpoint_name: String,
    /// Type name of the message, when known.
    pub message_type: Option<String>,
    /// Serialized headers. The record's partitioning key, when present,
    /// rides along as the `x-record-key` header.
    pub headers: Vec<u8>,
    /// Payload bytes; `None` for tombstones.
    pub content: Option<Vec<u8>>,
}

/// An open outbox transaction, enlisting appends with the caller's unit of
/// work.
///
/// Dropping the transaction without committing rolls it back.
#[async_trait]
pub trait OutboxTransaction: Send {
    /// Append a row inside this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] when the insert fails.
    async fn append(&mut self, record: NewOutboxRecord) -> Result<(), OutboxError>;

    /// Commit: appended rows become visible to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] when the commit fails; the rows are
    /// then discarded.
    async fn commit(self: Box<Self>) -> Result<(), OutboxError>;

    /// Roll back: appended rows are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] when the rollback itself fails.
    async fn rollback(self: Box<Self>) -> Result<(), OutboxError>;
}

/// Durable storage for pending outbound envelopes.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a row outside any caller transaction (auto-committed).
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] when the insert fails.
    async fn append(&self, record: NewOutboxRecord) -> Result<(), OutboxError>;

    /// Open a transaction to enlist appends with the caller's unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] when the transaction cannot start.
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError>;

    /// Read up to `limit` of the oldest committed rows, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] when the query fails.
    async fn fetch_batch(&self, limit: u32) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Delete rows by id (after a successful produce).
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] when the delete fails; the worker
    /// will re-produce the rows on the next tick.
    async fn delete(&self, ids: &[i64]) -> Result<(), OutboxError>;
}

/// A distributed lock keyed by name, coordinating outbox workers.
///
/// [`try_acquire`](DistributedLock::try_acquire) is non-blocking: a worker
/// that does not get the lock skips its tick and tries again on the next
/// one. Implementations must tolerate crashed holders (advisory locks die
/// with the session; leases expire).
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock `name` on behalf of `holder`.
    ///
    /// Returns `true` when the lock is held by `holder` after the call
    /// (acquiring is idempotent for the same holder).
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] when the backend fails.
    async fn try_acquire(&self, name: &str, holder: &str) -> Result<bool, LockError>;

    /// Release the lock `name` if held by `holder`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] when the backend fails.
    async fn release(&self, name: &str, holder: &str) -> Result<(), LockError>;
}
