//! Broker client abstractions.
//!
//! The integration core never talks to a broker SDK directly: producers go
//! through [`ProducerClient`] and consumers through [`ConsumerClient`]. The
//! Kafka implementations live in the `silverback-kafka` crate; deterministic
//! in-memory implementations live in `silverback-testing`.
//!
//! # Delivery semantics
//!
//! - Producer clients maintain FIFO send order per endpoint and resolve each
//!   send with the broker-assigned [`MessageId`] once acknowledged.
//! - Consumer clients expose a blocking, cancellation-aware fetch that
//!   interleaves messages with partition assignment changes, so the consume
//!   loop observes rebalances in-band and can abort affected sequences
//!   before touching the next message.
//! - Offsets are committed manually: [`ConsumerClient::store_offset`] records
//!   and [`ConsumerClient::commit`] flushes, mirroring the at-least-once
//!   discipline of the consume loop.

use crate::envelope::{InboundEnvelope, MessageId, TopicPartition};
use crate::headers::HeaderMap;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors raised by broker clients.
///
/// The split between [`Transient`](ClientError::Transient) and
/// [`Fatal`](ClientError::Fatal) drives auto-recovery: transient fetch
/// errors are retried with backoff when recovery is enabled, fatal errors
/// stop the consumer.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Failed to establish the broker session.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The operation requires a connected client.
    #[error("client is not connected")]
    NotConnected,

    /// A recoverable broker error (connection lost, request timeout).
    #[error("transient broker error: {0}")]
    Transient(String),

    /// An unrecoverable broker error (authentication, unknown topic under
    /// strict mode).
    #[error("fatal broker error: {0}")]
    Fatal(String),

    /// A publish was not acknowledged.
    #[error("produce to '{topic}' failed: {reason}")]
    Produce {
        /// The destination topic.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// An offset commit was rejected by the broker.
    #[error("offset commit failed: {0}")]
    Commit(String),

    /// The client does not support the requested operation
    /// (e.g. transactions on a non-transactional producer).
    #[error("unsupported client operation: {0}")]
    Unsupported(&'static str),
}

impl ClientError {
    /// `true` for errors auto-recovery may retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ConnectionFailed(_))
    }
}

/// A record handed to a producer client for publishing.
#[derive(Clone, Debug)]
pub struct ProducerRecord {
    /// Destination topic.
    pub topic: String,
    /// Optional partitioning key.
    pub key: Option<String>,
    /// Headers to write on the wire.
    pub headers: HeaderMap,
    /// Payload bytes; `None` produces a tombstone record.
    pub payload: Option<Vec<u8>>,
}

/// Producer side of a broker client.
///
/// Implementations own an internal send queue with one drain task and must
/// preserve FIFO order per `(topic, key)`. [`flush`](ProducerClient::flush)
/// drains the queue; [`disconnect`](ProducerClient::disconnect) flushes and
/// releases the underlying handle.
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// Publish one record and wait for the broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Produce`] when the broker rejects the record
    /// and [`ClientError::NotConnected`] after disconnect.
    async fn send(&self, record: ProducerRecord) -> Result<MessageId, ClientError>;

    /// Wait until every queued record has been acknowledged.
    ///
    /// # Errors
    ///
    /// Returns the first queue error encountered while draining.
    async fn flush(&self) -> Result<(), ClientError>;

    /// Flush outstanding sends and release the broker handle.
    ///
    /// # Errors
    ///
    /// Returns the flush error, if any; the handle is released regardless.
    async fn disconnect(&self) -> Result<(), ClientError>;
}

/// Producer client with broker transaction support (Kafka transactions).
///
/// Records sent between [`begin`](TransactionalProducerClient::begin) and
/// [`commit`](TransactionalProducerClient::commit) become visible to
/// read-committed consumers atomically; an
/// [`abort`](TransactionalProducerClient::abort) discards them.
#[async_trait]
pub trait TransactionalProducerClient: ProducerClient {
    /// Begin a broker transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Fatal`] when the transactional session cannot
    /// be established.
    async fn begin(&self) -> Result<(), ClientError>;

    /// Commit the current broker transaction.
    ///
    /// # Errors
    ///
    /// Returns the broker error; the transaction may be retried or aborted.
    async fn commit(&self) -> Result<(), ClientError>;

    /// Abort the current broker transaction.
    ///
    /// # Errors
    ///
    /// Returns the broker error encountered while aborting.
    async fn abort(&self) -> Result<(), ClientError>;
}

/// Consumer client connection states.
///
/// ```text
/// Initializing → Initialized → Disconnecting → Disconnected
///        ↑            │
///        └─ Reconnecting (auto-recovery)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientStatus {
    /// Session being established.
    Initializing,
    /// Connected and fetching.
    Initialized,
    /// Auto-recovery reconnect in progress.
    Reconnecting,
    /// Orderly shutdown in progress.
    Disconnecting,
    /// No broker session.
    Disconnected,
}

/// One item observed by the consume loop.
#[derive(Debug)]
pub enum ClientEvent {
    /// A fetched message.
    Message(InboundEnvelope),
    /// Partitions assigned to this consumer (initially or after rebalance).
    PartitionsAssigned(Vec<TopicPartition>),
    /// Partitions taken away from this consumer by a rebalance.
    PartitionsRevoked(Vec<TopicPartition>),
}

/// Consumer side of a broker client.
///
/// A single long-running consume loop calls
/// [`fetch`](ConsumerClient::fetch); all other operations may be invoked
/// from the consumer's control plane.
#[async_trait]
pub trait ConsumerClient: Send + Sync {
    /// Establish the broker session and subscribe or assign partitions.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionFailed`] when the session cannot be
    /// established.
    async fn connect(&self) -> Result<(), ClientError>;

    /// Blocking fetch of the next event. Returns when a message arrives, a
    /// rebalance is observed, or `cancel` fires (in which case the
    /// implementation returns [`ClientError::NotConnected`] after an
    /// orderly wind-down of the in-flight fetch).
    ///
    /// # Errors
    ///
    /// [`ClientError::Transient`] for recoverable fetch errors,
    /// [`ClientError::Fatal`] for unrecoverable ones.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<ClientEvent, ClientError>;

    /// Record an offset for a later [`commit`](ConsumerClient::commit).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when no session exists.
    fn store_offset(&self, id: &MessageId) -> Result<(), ClientError>;

    /// Flush stored offsets to the broker. Per-partition results are
    /// reported through [`ConsumerCallbacks::on_offsets_committed`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Commit`] when the broker rejects the commit;
    /// the callback still fires with the error code first.
    async fn commit(&self) -> Result<(), ClientError>;

    /// Pause fetching from the given partitions.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when no session exists.
    async fn pause(&self, partitions: &[TopicPartition]) -> Result<(), ClientError>;

    /// Resume fetching from the given partitions.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when no session exists.
    async fn resume(&self, partitions: &[TopicPartition]) -> Result<(), ClientError>;

    /// Reposition the fetcher so the next fetched offset for the partition
    /// is `id.offset`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when no session exists.
    async fn seek(&self, id: &MessageId) -> Result<(), ClientError>;

    /// Close the session. When auto-commit is disabled a final
    /// [`commit`](ConsumerClient::commit) is performed first.
    ///
    /// # Errors
    ///
    /// Returns the final-commit or close error; the session is released
    /// regardless.
    async fn disconnect(&self) -> Result<(), ClientError>;

    /// Current connection state.
    fn status(&self) -> ClientStatus;
}

/// Observable consumer-side notifications.
///
/// All methods have empty default implementations; implement only what you
/// subscribe to. Callbacks are invoked inline from the consumer's tasks and
/// must not block.
pub trait ConsumerCallbacks: Send + Sync {
    /// The broker session was established.
    fn on_connected(&self) {}

    /// The broker session ended.
    fn on_disconnected(&self) {}

    /// A commit completed; one result per partition.
    fn on_offsets_committed(&self, results: &[(TopicPartition, Result<i64, ClientError>)]) {
        let _ = results;
    }

    /// A sequence was aborted before completion.
    fn on_sequence_aborted(&self, sequence_id: &str, reason: &crate::error::SequenceAbortReason) {
        let _ = (sequence_id, reason);
    }

    /// The consumer stopped with a terminal error.
    fn on_consumer_stopped(&self, error: &crate::error::ConsumeError) {
        let _ = error;
    }
}

/// No-op callbacks, the default when none are registered.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCallbacks;

impl ConsumerCallbacks for NoCallbacks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ClientError::Transient("timeout".to_string()).is_transient());
        assert!(ClientError::ConnectionFailed("refused".to_string()).is_transient());
        assert!(!ClientError::Fatal("auth".to_string()).is_transient());
        assert!(!ClientError::NotConnected.is_transient());
    }

    #[test]
    fn client_error_display() {
        let error = ClientError::Produce {
            topic: "orders".to_string(),
            reason: "queue full".to_string(),
        };
        assert_eq!(format!("{error}"), "produce to 'orders' failed: queue full");
    }
}
