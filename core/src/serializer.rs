//! Payload serializers.
//!
//! Serializers are a flat variant enumeration rather than a trait object:
//! the set of wire formats is small and closed, and a plain enum keeps the
//! producer and consumer pipelines free of virtual dispatch.
//!
//! The contract for every variant:
//!
//! - already-raw payloads (published as bytes) pass through untouched;
//! - `serialize` + `deserialize` round-trip any [`Message`];
//! - `validate` checks that a payload is structurally decodable without
//!   knowing the target type, so the consumer pipeline can fail early with a
//!   deserialization error.

use crate::message::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by payload serialization.
#[derive(Error, Debug, Clone)]
pub enum SerializerError {
    /// Failed to serialize a message to bytes.
    #[error("failed to serialize message: {0}")]
    Serialization(String),

    /// Failed to deserialize bytes into the requested type.
    #[error("failed to deserialize payload: {0}")]
    Deserialization(String),
}

/// The wire format of an endpoint's payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Serializer {
    /// UTF-8 JSON via `serde_json`. The default, readable on the wire.
    #[default]
    Json,

    /// Compact binary via `bincode`. Smaller and faster, opaque on the wire.
    Bincode,
}

impl Serializer {
    /// Serialize `message` to payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Serialization`] when the message cannot be
    /// encoded, which is rare for serde-derived types.
    pub fn serialize<M: Message>(self, message: &M) -> Result<Vec<u8>, SerializerError> {
        match self {
            Self::Json => serde_json::to_vec(message)
                .map_err(|e| SerializerError::Serialization(e.to_string())),
            Self::Bincode => bincode::serialize(message)
                .map_err(|e| SerializerError::Serialization(e.to_string())),
        }
    }

    /// Deserialize payload bytes into `M`.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Deserialization`] when the bytes do not
    /// decode as `M`.
    pub fn deserialize<M: Message>(self, payload: &[u8]) -> Result<M, SerializerError> {
        match self {
            Self::Json => serde_json::from_slice(payload)
                .map_err(|e| SerializerError::Deserialization(e.to_string())),
            Self::Bincode => bincode::deserialize(payload)
                .map_err(|e| SerializerError::Deserialization(e.to_string())),
        }
    }

    /// Check that `payload` is structurally decodable in this format.
    ///
    /// For JSON this parses the document; for bincode any byte string is
    /// potentially valid, so the check always passes.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Deserialization`] for undecodable payloads.
    pub fn validate(self, payload: &[u8]) -> Result<(), SerializerError> {
        match self {
            Self::Json => serde_json::from_slice::<serde::de::IgnoredAny>(payload)
                .map(|_| ())
                .map_err(|e| SerializerError::Deserialization(e.to_string())),
            Self::Bincode => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
    }

    impl Message for Ping {
        fn message_type() -> &'static str {
            "Ping.v1"
        }
    }

    #[test]
    fn json_roundtrip() {
        let message = Ping { seq: 7 };
        let bytes = Serializer::Json.serialize(&message).unwrap();
        let decoded: Ping = Serializer::Json.deserialize(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn bincode_roundtrip() {
        let message = Ping { seq: 7 };
        let bytes = Serializer::Bincode.serialize(&message).unwrap();
        let decoded: Ping = Serializer::Bincode.deserialize(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn json_validate_rejects_garbage() {
        assert!(Serializer::Json.validate(b"{\"seq\":1}").is_ok());
        assert!(Serializer::Json.validate(b"not json").is_err());
    }

    #[test]
    fn bincode_validate_accepts_anything() {
        assert!(Serializer::Bincode.validate(&[0xff, 0x00]).is_ok());
    }
}
