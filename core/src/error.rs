//! Cross-cutting error taxonomy for the producer and consumer pipelines.
//!
//! Module-local errors (serializer, client, outbox, offset store, routing)
//! live next to their modules; this module holds the errors that flow
//! *through* the pipelines and the classification the error-policy engine
//! and auto-recovery operate on.

use crate::client::ClientError;
use crate::headers::HeaderValueError;
use crate::outbox::OutboxError;
use crate::registry::RoutingError;
use crate::serializer::SerializerError;
use std::fmt;
use thiserror::Error;

/// The producer pipeline stage an error originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerStage {
    /// Payload serialization.
    Serialize,
    /// Outbound validation.
    Validate,
    /// Header enrichment.
    Enrich,
    /// Payload encryption.
    Encrypt,
    /// Payload chunking.
    Chunk,
    /// Produce strategy invocation.
    Produce,
    /// A custom behavior plugged into the chain.
    Custom,
}

impl fmt::Display for ProducerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Serialize => "serialize",
            Self::Validate => "validate",
            Self::Enrich => "enrich",
            Self::Encrypt => "encrypt",
            Self::Chunk => "chunk",
            Self::Produce => "produce",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Errors surfaced to the caller of a produce operation.
#[derive(Error, Debug)]
pub enum ProduceError {
    /// No producer matched the published message.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Serialization failed.
    #[error(transparent)]
    Serialization(#[from] SerializerError),

    /// The message violated its constraints under `Throw` validation.
    #[error("message validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Payload encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The broker client rejected the record.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The outbox store rejected the append.
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// A custom pipeline behavior failed.
    #[error("producer behavior failed: {0}")]
    Behavior(String),
}

impl ProduceError {
    /// The pipeline stage this error originated from.
    #[must_use]
    pub const fn stage(&self) -> ProducerStage {
        match self {
            Self::Routing(_) => ProducerStage::Produce,
            Self::Serialization(_) => ProducerStage::Serialize,
            Self::Validation(_) => ProducerStage::Validate,
            Self::Encryption(_) => ProducerStage::Encrypt,
            Self::Client(_) | Self::Outbox(_) => ProducerStage::Produce,
            Self::Behavior(_) => ProducerStage::Custom,
        }
    }
}

/// Why a sequence was aborted before completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SequenceAbortReason {
    /// No new envelope arrived within the sequence timeout.
    Timeout,
    /// A new sequence started while this one was incomplete.
    Interrupted,
    /// The consumer disconnected or stopped.
    Disconnect,
    /// The partition was revoked by a rebalance.
    Rebalance,
    /// The chunk headers were inconsistent (e.g. `x-last-chunk` before the
    /// declared `x-chunks-count` was reached).
    ProtocolViolation,
}

impl fmt::Display for SequenceAbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
            Self::Disconnect => "disconnect",
            Self::Rebalance => "rebalance",
            Self::ProtocolViolation => "protocol violation",
        };
        f.write_str(name)
    }
}

/// Error returned by a subscriber invocation.
#[derive(Error, Debug, Clone)]
#[error("subscriber failed: {message}")]
pub struct SubscriberError {
    /// What went wrong, for logs and the move-policy failure header.
    pub message: String,
}

impl SubscriberError {
    /// Create a subscriber error from any displayable cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The kind of a [`ConsumeError`], used by error-policy predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsumeErrorKind {
    /// Payload decryption failed.
    Decryption,
    /// No key matched the `x-encryption-key-id` header.
    DecryptionKeyNotFound,
    /// Payload deserialization failed.
    Deserialization,
    /// Inbound validation failed under `Throw` mode.
    Validation,
    /// Malformed wire headers.
    Header,
    /// A subscriber returned an error.
    Subscriber,
    /// The sequence was aborted.
    SequenceAborted,
    /// A broker client error.
    Client,
    /// An unrecoverable pipeline error.
    Fatal,
}

/// Errors raised while processing an inbound envelope or sequence.
#[derive(Error, Debug, Clone)]
pub enum ConsumeError {
    /// Payload decryption failed with the resolved key.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The `x-encryption-key-id` header named an unknown key.
    #[error("decryption key '{0}' not found")]
    DecryptionKeyNotFound(String),

    /// The payload could not be deserialized.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The message violated its constraints under `Throw` validation.
    #[error("message validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A wire header was malformed.
    #[error(transparent)]
    Header(#[from] HeaderValueError),

    /// A subscriber invocation failed.
    #[error(transparent)]
    Subscriber(#[from] SubscriberError),

    /// The sequence this envelope belonged to was aborted.
    #[error("sequence aborted: {0}")]
    SequenceAborted(SequenceAbortReason),

    /// A broker client error interrupted processing.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Unrecoverable pipeline error; aborts the channel and stops the
    /// consumer regardless of error policy.
    #[error("fatal pipeline error: {0}")]
    Fatal(String),
}

impl ConsumeError {
    /// Classify this error for policy predicates.
    #[must_use]
    pub const fn kind(&self) -> ConsumeErrorKind {
        match self {
            Self::Decryption(_) => ConsumeErrorKind::Decryption,
            Self::DecryptionKeyNotFound(_) => ConsumeErrorKind::DecryptionKeyNotFound,
            Self::Deserialization(_) => ConsumeErrorKind::Deserialization,
            Self::Validation(_) => ConsumeErrorKind::Validation,
            Self::Header(_) => ConsumeErrorKind::Header,
            Self::Subscriber(_) => ConsumeErrorKind::Subscriber,
            Self::SequenceAborted(_) => ConsumeErrorKind::SequenceAborted,
            Self::Client(_) => ConsumeErrorKind::Client,
            Self::Fatal(_) => ConsumeErrorKind::Fatal,
        }
    }

    /// `true` for errors the error policy must not handle: they abort the
    /// channel and stop the consumer.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Client(ClientError::Fatal(_)))
    }
}

/// Configuration errors, fatal at startup.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// A required setting is missing.
    #[error("missing configuration: {0}")]
    Missing(&'static str),

    /// A setting has an invalid value.
    #[error("invalid configuration for {field}: {reason}")]
    Invalid {
        /// The offending setting.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_error_stage_annotation() {
        let error = ProduceError::Validation(vec!["total must be positive".to_string()]);
        assert_eq!(error.stage(), ProducerStage::Validate);

        let error = ProduceError::Encryption("bad key".to_string());
        assert_eq!(error.stage(), ProducerStage::Encrypt);

        let error = ProduceError::Client(ClientError::NotConnected);
        assert_eq!(error.stage(), ProducerStage::Produce);
    }

    #[test]
    fn consume_error_classification() {
        let error = ConsumeError::DecryptionKeyNotFound("k9".to_string());
        assert_eq!(error.kind(), ConsumeErrorKind::DecryptionKeyNotFound);
        assert!(!error.is_fatal());

        assert!(ConsumeError::Fatal("poisoned".to_string()).is_fatal());
        assert!(ConsumeError::Client(ClientError::Fatal("auth".to_string())).is_fatal());
        assert!(!ConsumeError::Client(ClientError::Transient("t".to_string())).is_fatal());
    }

    #[test]
    fn validation_error_joins_constraints() {
        let error = ConsumeError::Validation(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(format!("{error}"), "message validation failed: a; b");
    }
}
