//! Broker-neutral envelope model.
//!
//! Envelopes are the records that move through the producer and consumer
//! pipelines: an [`OutboundEnvelope`] from the moment a message is routed
//! until the broker acknowledges it (or the outbox stores it), an
//! [`InboundEnvelope`] from broker fetch until the consumer pipeline turns
//! it into a [`DeliveredMessage`] for subscribers.

use crate::endpoint::EndpointConfiguration;
use crate::error::ConsumeError;
use crate::headers::{HeaderMap, names};
use crate::message::Message;
use crate::serializer::{Serializer, SerializerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A `(topic, partition)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition number.
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic/partition pair.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// The broker identity of a single message: topic, partition, and offset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    /// Topic name.
    pub topic: String,
    /// Partition number.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

impl MessageId {
    /// Create a new broker message identity.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// The `(topic, partition)` this identity belongs to.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A raw message as fetched from the broker, before any pipeline stage ran.
#[derive(Clone, Debug)]
pub struct InboundEnvelope {
    /// Broker identity of this record.
    pub id: MessageId,
    /// Record key, when the broker carries one.
    pub key: Option<String>,
    /// Wire headers.
    pub headers: HeaderMap,
    /// Raw payload bytes; `None` for tombstone records.
    pub payload: Option<Vec<u8>>,
}

/// The payload of an outbound envelope as it moves through the pipeline.
pub enum OutboundPayload {
    /// Not serialized yet; the serialize stage resolves it.
    Pending(SerializeFn),
    /// Serialized (or published as raw bytes, which the serializer passes
    /// through untouched).
    Raw(Vec<u8>),
    /// Null payload under a declared type.
    Tombstone,
}

impl fmt::Debug for OutboundPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("Pending(..)"),
            Self::Raw(bytes) => write!(f, "Raw({} bytes)", bytes.len()),
            Self::Tombstone => f.write_str("Tombstone"),
        }
    }
}

/// Deferred serialization of a typed message.
pub type SerializeFn = Box<dyn FnOnce(Serializer) -> Result<Vec<u8>, SerializerError> + Send>;

/// An outbound record travelling through the producer pipeline.
///
/// Created by the routing engine, one per matched producer; destroyed once
/// the broker acknowledged it or the outbox stored it.
#[derive(Debug)]
pub struct OutboundEnvelope {
    /// Mutable header collection; stages append to it.
    pub headers: HeaderMap,
    /// Type name of the carried message, written to `x-message-type` by the
    /// serialize stage.
    pub message_type: String,
    /// Optional partitioning key.
    pub key: Option<String>,
    /// Payload in its current pipeline state.
    pub payload: OutboundPayload,
    /// The resolved producer endpoint.
    pub endpoint: Arc<EndpointConfiguration>,
    /// Result of the message's self-validation, evaluated at routing time
    /// and consumed by the validate stage.
    pub validation: Result<(), Vec<String>>,
}

impl OutboundEnvelope {
    /// Build an envelope around a typed message.
    ///
    /// Serialization is deferred to the serialize stage; the message is held
    /// behind an `Arc` so routing to several producers shares one copy.
    #[must_use]
    pub fn for_message<M: Message>(
        message: &Arc<M>,
        endpoint: Arc<EndpointConfiguration>,
        key: Option<String>,
        extra_headers: HeaderMap,
    ) -> Self {
        let validation = message.validate();
        let owned = Arc::clone(message);
        Self {
            headers: extra_headers,
            message_type: M::message_type().to_string(),
            key,
            payload: OutboundPayload::Pending(Box::new(move |serializer| {
                serializer.serialize(&*owned)
            })),
            endpoint,
            validation,
        }
    }

    /// Build an envelope around pre-serialized bytes.
    ///
    /// The serializer passes raw payloads through untouched.
    #[must_use]
    pub fn for_raw(
        payload: Vec<u8>,
        message_type: impl Into<String>,
        endpoint: Arc<EndpointConfiguration>,
        key: Option<String>,
        extra_headers: HeaderMap,
    ) -> Self {
        Self {
            headers: extra_headers,
            message_type: message_type.into(),
            key,
            payload: OutboundPayload::Raw(payload),
            endpoint,
            validation: Ok(()),
        }
    }

    /// Build a tombstone envelope (null payload, declared type).
    #[must_use]
    pub fn tombstone(
        message_type: impl Into<String>,
        endpoint: Arc<EndpointConfiguration>,
        key: String,
    ) -> Self {
        Self {
            headers: HeaderMap::new(),
            message_type: message_type.into(),
            key: Some(key),
            payload: OutboundPayload::Tombstone,
            endpoint,
            validation: Ok(()),
        }
    }

    /// Serialized payload bytes, when the serialize stage already ran.
    #[must_use]
    pub fn raw_payload(&self) -> Option<&[u8]> {
        match &self.payload {
            OutboundPayload::Raw(bytes) => Some(bytes),
            OutboundPayload::Pending(_) | OutboundPayload::Tombstone => None,
        }
    }
}

/// A fully processed inbound message, ready for subscriber dispatch.
///
/// The payload is decrypted and reassembled; `id` is the broker identity of
/// the *last* raw envelope that composed it (for chunked messages, the
/// terminal fragment).
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    /// Broker identity of the last composing raw envelope.
    pub id: MessageId,
    /// Record key, when present.
    pub key: Option<String>,
    /// Headers of the (first) raw envelope.
    pub headers: HeaderMap,
    /// Decrypted, reassembled payload; `None` for tombstones.
    pub payload: Option<Vec<u8>>,
    /// Resolved message type name: the `x-message-type` header, or the
    /// endpoint's declared type when the header is absent.
    pub message_type: String,
    /// The consumer endpoint this message arrived on.
    pub endpoint: Arc<EndpointConfiguration>,
}

impl DeliveredMessage {
    /// `true` when this is a tombstone (null payload).
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// Decode the payload as `M` using the endpoint's serializer.
    ///
    /// Decoding is strict about the type: when the resolved type name does
    /// not match `M::message_type()`, this fails without attempting to
    /// parse.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Deserialization`] on type mismatch, missing
    /// payload, or undecodable bytes.
    pub fn decode<M: Message>(&self) -> Result<M, ConsumeError> {
        if self.message_type != M::message_type() {
            return Err(ConsumeError::Deserialization(format!(
                "payload is '{}', not '{}'",
                self.message_type,
                M::message_type()
            )));
        }
        let payload = self.payload.as_deref().ok_or_else(|| {
            ConsumeError::Deserialization("tombstone has no payload".to_string())
        })?;
        self.endpoint
            .serializer()
            .deserialize(payload)
            .map_err(|e| ConsumeError::Deserialization(e.to_string()))
    }

    /// The sequence identifier of this message: the `x-message-id` header
    /// when present, otherwise the broker identity rendered as a string.
    #[must_use]
    pub fn sequence_id(&self) -> String {
        self.headers
            .get(names::MESSAGE_ID)
            .map_or_else(|| self.id.to_string(), ToString::to_string)
    }
}
