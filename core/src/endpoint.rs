//! Endpoint configuration.
//!
//! An endpoint associates a logical destination or source (topic name) with
//! everything the pipelines need to know about it: message type, serializer,
//! chunking, encryption, produce strategy, validation mode, batching and
//! streaming settings, sequence timeout, and error policy.
//!
//! Configurations are immutable after the initial bind: the builder consumes
//! itself and registries store the result behind an `Arc`.
//!
//! # Example
//!
//! ```
//! use silverback_core::endpoint::{EndpointConfiguration, ProduceStrategyKind, ValidationMode};
//! use silverback_core::message::Message;
//! # use serde::{Serialize, Deserialize};
//! # #[derive(Clone, Debug, Serialize, Deserialize)]
//! # struct OrderPlaced;
//! # impl Message for OrderPlaced {
//! #     fn message_type() -> &'static str { "OrderPlaced.v1" }
//! # }
//!
//! let endpoint = EndpointConfiguration::builder("orders")
//!     .message_type::<OrderPlaced>()
//!     .friendly_name("orders-out")
//!     .chunking(10, true)
//!     .strategy(ProduceStrategyKind::Direct)
//!     .validation(ValidationMode::Throw)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(endpoint.name(), "orders");
//! ```

use crate::error::ConfigError;
use crate::headers::HeaderMap;
use crate::message::Message;
use crate::policy::ErrorPolicy;
use crate::serializer::Serializer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How producing actually happens for an endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProduceStrategyKind {
    /// Synchronous send to the broker client's queue.
    #[default]
    Direct,
    /// Append to the transactional outbox; a worker relays later.
    Outbox,
}

/// Outbound and inbound validation behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// No validation.
    #[default]
    None,
    /// Log a warning for invalid messages, deliver anyway.
    Warn,
    /// Reject invalid messages with a validation error.
    Throw,
}

/// Payload chunking settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSettings {
    /// Maximum fragment size in bytes.
    pub size: usize,
    /// Write `x-chunks-count` on every fragment rather than only on the
    /// terminal one.
    pub always_add_headers: bool,
}

/// Consumer-side batch accumulation settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Number of envelopes delivered per subscriber invocation.
    pub size: usize,
    /// Deliver a partial batch after this long without new envelopes.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

/// One symmetric key in a keyring.
#[derive(Clone)]
pub struct EncryptionKey {
    /// Key identifier written to / matched against `x-encryption-key-id`.
    pub id: String,
    /// 32-byte AES-256 key material.
    pub key: Vec<u8>,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("EncryptionKey").field("id", &self.id).finish()
    }
}

/// Endpoint encryption settings: a keyring plus the active key.
///
/// Producing always uses the active key; consuming resolves the key named by
/// `x-encryption-key-id`, falling back to the active key when the header is
/// absent.
#[derive(Clone, Debug)]
pub struct EncryptionSettings {
    /// All known keys (rotation set).
    pub keys: Vec<EncryptionKey>,
    /// Identifier of the key used for producing. When the keyring holds more
    /// than one key, this identifier is written to `x-encryption-key-id`.
    pub active_key_id: String,
}

impl EncryptionSettings {
    /// Look up a key by identifier.
    #[must_use]
    pub fn key(&self, id: &str) -> Option<&EncryptionKey> {
        self.keys.iter().find(|k| k.id == id)
    }

    /// The key used for producing and as the consume-side default.
    #[must_use]
    pub fn active_key(&self) -> Option<&EncryptionKey> {
        self.key(&self.active_key_id)
    }
}

/// Inbound structural validator: headers plus reassembled payload.
pub type InboundValidator =
    Arc<dyn Fn(&HeaderMap, &[u8]) -> Result<(), Vec<String>> + Send + Sync>;

/// Immutable configuration of one endpoint.
#[derive(Clone)]
pub struct EndpointConfiguration {
    name: String,
    friendly_name: Option<String>,
    message_type: String,
    serializer: Serializer,
    strategy: ProduceStrategyKind,
    chunk: Option<ChunkSettings>,
    encryption: Option<EncryptionSettings>,
    validation: ValidationMode,
    inbound_validator: Option<InboundValidator>,
    routable: bool,
    static_headers: Vec<(String, String)>,
    batch: Option<BatchSettings>,
    streaming: bool,
    sequence_timeout: Duration,
    error_policy: ErrorPolicy,
}

impl std::fmt::Debug for EndpointConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfiguration")
            .field("name", &self.name)
            .field("friendly_name", &self.friendly_name)
            .field("message_type", &self.message_type)
            .field("serializer", &self.serializer)
            .field("strategy", &self.strategy)
            .field("chunk", &self.chunk)
            .field("encrypted", &self.encryption.is_some())
            .field("validation", &self.validation)
            .field("routable", &self.routable)
            .field("batch", &self.batch)
            .field("streaming", &self.streaming)
            .field("sequence_timeout", &self.sequence_timeout)
            .finish()
    }
}

impl EndpointConfiguration {
    /// Start building a configuration for the endpoint named `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> EndpointConfigurationBuilder {
        EndpointConfigurationBuilder {
            name: name.into(),
            friendly_name: None,
            message_type: None,
            serializer: Serializer::default(),
            strategy: ProduceStrategyKind::default(),
            chunk: None,
            encryption: None,
            validation: ValidationMode::default(),
            inbound_validator: None,
            routable: true,
            static_headers: Vec::new(),
            batch: None,
            streaming: false,
            sequence_timeout: Duration::from_secs(30),
            error_policy: ErrorPolicy::stop(),
        }
    }

    /// The endpoint (topic) name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The optional friendly name used for by-name lookup.
    #[must_use]
    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly_name.as_deref()
    }

    /// The message type this endpoint is bound to.
    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The payload serializer.
    #[must_use]
    pub const fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// The produce strategy.
    #[must_use]
    pub const fn strategy(&self) -> ProduceStrategyKind {
        self.strategy
    }

    /// Chunking settings, when chunking is enabled.
    #[must_use]
    pub const fn chunk(&self) -> Option<&ChunkSettings> {
        self.chunk.as_ref()
    }

    /// Encryption settings, when encryption is enabled.
    #[must_use]
    pub const fn encryption(&self) -> Option<&EncryptionSettings> {
        self.encryption.as_ref()
    }

    /// The validation mode.
    #[must_use]
    pub const fn validation(&self) -> ValidationMode {
        self.validation
    }

    /// Custom inbound validator, when configured.
    #[must_use]
    pub const fn inbound_validator(&self) -> Option<&InboundValidator> {
        self.inbound_validator.as_ref()
    }

    /// Whether by-type routing may select this endpoint.
    #[must_use]
    pub const fn is_routable(&self) -> bool {
        self.routable
    }

    /// Headers added to every outbound envelope by the enrich stage.
    #[must_use]
    pub fn static_headers(&self) -> &[(String, String)] {
        &self.static_headers
    }

    /// Batch settings, when batch consumption is enabled.
    #[must_use]
    pub const fn batch(&self) -> Option<&BatchSettings> {
        self.batch.as_ref()
    }

    /// Whether envelopes are delivered as an open-ended stream.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Idle timeout after which an incomplete sequence is aborted.
    #[must_use]
    pub const fn sequence_timeout(&self) -> Duration {
        self.sequence_timeout
    }

    /// The error policy for failures on this endpoint.
    #[must_use]
    pub const fn error_policy(&self) -> &ErrorPolicy {
        &self.error_policy
    }
}

/// Builder for [`EndpointConfiguration`]. Consumed by `build`.
pub struct EndpointConfigurationBuilder {
    name: String,
    friendly_name: Option<String>,
    message_type: Option<String>,
    serializer: Serializer,
    strategy: ProduceStrategyKind,
    chunk: Option<ChunkSettings>,
    encryption: Option<EncryptionSettings>,
    validation: ValidationMode,
    inbound_validator: Option<InboundValidator>,
    routable: bool,
    static_headers: Vec<(String, String)>,
    batch: Option<BatchSettings>,
    streaming: bool,
    sequence_timeout: Duration,
    error_policy: ErrorPolicy,
}

impl EndpointConfigurationBuilder {
    /// Bind the endpoint to message type `M`.
    #[must_use]
    pub fn message_type<M: Message>(mut self) -> Self {
        self.message_type = Some(M::message_type().to_string());
        self
    }

    /// Bind the endpoint to a message type by name (for payloads only known
    /// at runtime, e.g. the outbox relay).
    #[must_use]
    pub fn message_type_name(mut self, name: impl Into<String>) -> Self {
        self.message_type = Some(name.into());
        self
    }

    /// Set the friendly name used for by-name lookup.
    #[must_use]
    pub fn friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = Some(name.into());
        self
    }

    /// Set the payload serializer.
    #[must_use]
    pub const fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Set the produce strategy.
    #[must_use]
    pub const fn strategy(mut self, strategy: ProduceStrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enable chunking with the given fragment size.
    #[must_use]
    pub const fn chunking(mut self, size: usize, always_add_headers: bool) -> Self {
        self.chunk = Some(ChunkSettings {
            size,
            always_add_headers,
        });
        self
    }

    /// Enable encryption with the given keyring and active key.
    #[must_use]
    pub fn encryption(mut self, keys: Vec<EncryptionKey>, active_key_id: impl Into<String>) -> Self {
        self.encryption = Some(EncryptionSettings {
            keys,
            active_key_id: active_key_id.into(),
        });
        self
    }

    /// Set the validation mode.
    #[must_use]
    pub const fn validation(mut self, mode: ValidationMode) -> Self {
        self.validation = mode;
        self
    }

    /// Set a custom inbound validator.
    #[must_use]
    pub fn inbound_validator(mut self, validator: InboundValidator) -> Self {
        self.inbound_validator = Some(validator);
        self
    }

    /// Exclude this endpoint from by-type routing (it stays reachable by
    /// name).
    #[must_use]
    pub const fn not_routable(mut self) -> Self {
        self.routable = false;
        self
    }

    /// Add a header to every outbound envelope.
    #[must_use]
    pub fn static_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_headers.push((name.into(), value.into()));
        self
    }

    /// Enable batch consumption.
    #[must_use]
    pub const fn batch(mut self, size: usize, timeout: Duration) -> Self {
        self.batch = Some(BatchSettings { size, timeout });
        self
    }

    /// Deliver envelopes as an open-ended stream.
    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Set the sequence idle timeout.
    #[must_use]
    pub const fn sequence_timeout(mut self, timeout: Duration) -> Self {
        self.sequence_timeout = timeout;
        self
    }

    /// Set the error policy.
    #[must_use]
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the endpoint name is empty, no message
    /// type is bound, the chunk size or batch size is zero, a friendly name
    /// is empty, batching and streaming are combined, or the encryption
    /// settings are inconsistent (non-32-byte key, unknown active key).
    pub fn build(self) -> Result<EndpointConfiguration, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Missing("endpoint name"));
        }
        let message_type = self.message_type.ok_or(ConfigError::Missing("message_type"))?;
        if let Some(friendly) = &self.friendly_name {
            if friendly.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "friendly_name",
                    reason: "must not be empty when set".to_string(),
                });
            }
        }
        if let Some(chunk) = &self.chunk {
            if chunk.size == 0 {
                return Err(ConfigError::Invalid {
                    field: "chunk.size",
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if let Some(batch) = &self.batch {
            if batch.size == 0 {
                return Err(ConfigError::Invalid {
                    field: "batch.size",
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.batch.is_some() && self.streaming {
            return Err(ConfigError::Invalid {
                field: "batch",
                reason: "batching and streaming are mutually exclusive".to_string(),
            });
        }
        if let Some(encryption) = &self.encryption {
            if encryption.keys.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "encryption.keys",
                    reason: "at least one key is required".to_string(),
                });
            }
            for key in &encryption.keys {
                if key.key.len() != 32 {
                    return Err(ConfigError::Invalid {
                        field: "encryption.keys",
                        reason: format!(
                            "key '{}' is {} bytes, AES-256 requires 32",
                            key.id,
                            key.key.len()
                        ),
                    });
                }
            }
            if encryption.active_key().is_none() {
                return Err(ConfigError::Invalid {
                    field: "encryption.active_key_id",
                    reason: format!("'{}' is not in the keyring", encryption.active_key_id),
                });
            }
        }

        Ok(EndpointConfiguration {
            name: self.name,
            friendly_name: self.friendly_name,
            message_type,
            serializer: self.serializer,
            strategy: self.strategy,
            chunk: self.chunk,
            encryption: self.encryption,
            validation: self.validation,
            inbound_validator: self.inbound_validator,
            routable: self.routable,
            static_headers: self.static_headers,
            batch: self.batch,
            streaming: self.streaming,
            sequence_timeout: self.sequence_timeout,
            error_policy: self.error_policy,
        })
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
    struct Ping;

    impl Message for Ping {
        fn message_type() -> &'static str {
            "Ping.v1"
        }
    }

    #[test]
    fn builder_defaults() {
        let endpoint = EndpointConfiguration::builder("pings")
            .message_type::<Ping>()
            .build()
            .unwrap();

        assert_eq!(endpoint.name(), "pings");
        assert_eq!(endpoint.message_type(), "Ping.v1");
        assert_eq!(endpoint.strategy(), ProduceStrategyKind::Direct);
        assert_eq!(endpoint.validation(), ValidationMode::None);
        assert!(endpoint.is_routable());
        assert!(endpoint.chunk().is_none());
        assert_eq!(endpoint.sequence_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn missing_message_type_is_rejected() {
        let result = EndpointConfiguration::builder("pings").build();
        assert!(matches!(result, Err(ConfigError::Missing("message_type"))));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let result = EndpointConfiguration::builder("pings")
            .message_type::<Ping>()
            .chunking(0, false)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn batching_and_streaming_are_exclusive() {
        let result = EndpointConfiguration::builder("pings")
            .message_type::<Ping>()
            .batch(10, Duration::from_secs(1))
            .streaming()
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn encryption_keys_must_be_32_bytes() {
        let result = EndpointConfiguration::builder("pings")
            .message_type::<Ping>()
            .encryption(
                vec![EncryptionKey {
                    id: "k1".to_string(),
                    key: vec![0u8; 16],
                }],
                "k1",
            )
            .build();
        assert!(result.is_err());

        let result = EndpointConfiguration::builder("pings")
            .message_type::<Ping>()
            .encryption(
                vec![EncryptionKey {
                    id: "k1".to_string(),
                    key: vec![0u8; 32],
                }],
                "k2",
            )
            .build();
        assert!(result.is_err());
    }
}
