//! The ordered producer behavior chain.
//!
//! The chain is a flat list of tagged stages (serialize, validate, enrich,
//! encrypt, chunk) executed in sort-key order over a mutable
//! [`ProduceContext`], short-circuiting on the first error. Custom behaviors
//! plug in as boxed handlers with an integer sort key and are merged into
//! the order. The produce step itself is the strategy invocation and runs
//! after the chain (see [`Producer`](super::Producer)).
//!
//! For outbox endpoints the chain is split: everything up to and including
//! encryption runs when the row is appended (so rows hold the serialized,
//! sealed payload), while chunking runs when the worker relays the row to
//! the broker.

use crate::encryption;
use crate::producer::chunk;
use async_trait::async_trait;
use silverback_core::endpoint::{EndpointConfiguration, ValidationMode};
use silverback_core::envelope::{MessageId, OutboundEnvelope, OutboundPayload, SerializeFn};
use silverback_core::error::ProduceError;
use silverback_core::client::ProducerRecord;
use silverback_core::headers::{HeaderMap, names};
use std::sync::Arc;

/// Sort key of the serialize stage.
pub const SORT_SERIALIZE: i32 = 100;
/// Sort key of the validate stage.
pub const SORT_VALIDATE: i32 = 200;
/// Sort key of the enrich stage.
pub const SORT_ENRICH: i32 = 300;
/// Sort key of the encrypt stage. Also the last stage that runs before an
/// outbox append; later stages run at relay time.
pub const SORT_ENCRYPT: i32 = 400;
/// Sort key of the chunk stage.
pub const SORT_CHUNK: i32 = 500;

/// The context a produce operation threads through the chain.
pub struct ProduceContext {
    /// The resolved producer endpoint.
    pub endpoint: Arc<EndpointConfiguration>,
    /// Mutable header collection.
    pub headers: HeaderMap,
    /// Type name of the carried message.
    pub message_type: String,
    /// Optional partitioning key.
    pub key: Option<String>,
    /// Payload bytes once serialized; `None` before serialization or for
    /// tombstones.
    pub payload: Option<Vec<u8>>,
    /// Records produced by the chunk stage (one when chunking did not
    /// apply).
    pub records: Vec<ProducerRecord>,
    /// Broker identities assigned so far.
    pub produced: Vec<MessageId>,
    pending: Option<SerializeFn>,
    tombstone: bool,
    validation: Result<(), Vec<String>>,
}

impl ProduceContext {
    /// Build a context from a routed envelope.
    #[must_use]
    pub fn new(envelope: OutboundEnvelope) -> Self {
        let (payload, pending, tombstone) = match envelope.payload {
            OutboundPayload::Raw(bytes) => (Some(bytes), None, false),
            OutboundPayload::Pending(serialize) => (None, Some(serialize), false),
            OutboundPayload::Tombstone => (None, None, true),
        };
        Self {
            endpoint: envelope.endpoint,
            headers: envelope.headers,
            message_type: envelope.message_type,
            key: envelope.key,
            payload,
            records: Vec::new(),
            produced: Vec::new(),
            pending,
            tombstone,
            validation: envelope.validation,
        }
    }

    /// `true` for tombstone (null-payload) produces.
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.tombstone
    }
}

/// A custom producer behavior merged into the chain by sort key.
#[async_trait]
pub trait ProducerBehavior: Send + Sync {
    /// Position in the chain relative to the built-in stage keys
    /// ([`SORT_SERIALIZE`] .. [`SORT_CHUNK`]).
    fn sort_key(&self) -> i32;

    /// Transform the context.
    ///
    /// # Errors
    ///
    /// Returning an error short-circuits the chain; the produce call fails
    /// with the stage annotated.
    async fn handle(&self, ctx: &mut ProduceContext) -> Result<(), ProduceError>;
}

enum Stage {
    Serialize,
    Validate,
    Enrich,
    Encrypt,
    Chunk,
    Custom(Arc<dyn ProducerBehavior>),
}

impl Stage {
    fn sort_key(&self) -> i32 {
        match self {
            Self::Serialize => SORT_SERIALIZE,
            Self::Validate => SORT_VALIDATE,
            Self::Enrich => SORT_ENRICH,
            Self::Encrypt => SORT_ENCRYPT,
            Self::Chunk => SORT_CHUNK,
            Self::Custom(custom) => custom.sort_key(),
        }
    }
}

/// The assembled chain for one producer.
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Build the chain, merging `custom` behaviors into the built-in stages
    /// by sort key (stable for equal keys: built-ins first).
    #[must_use]
    pub fn new(custom: &[Arc<dyn ProducerBehavior>]) -> Self {
        let mut stages = vec![
            Stage::Serialize,
            Stage::Validate,
            Stage::Enrich,
            Stage::Encrypt,
            Stage::Chunk,
        ];
        stages.extend(custom.iter().map(|c| Stage::Custom(Arc::clone(c))));
        stages.sort_by_key(Stage::sort_key);
        Self { stages }
    }

    /// Run every stage whose sort key is at most `up_to`, skipping stages
    /// at or below `after`.
    ///
    /// # Errors
    ///
    /// Propagates the first stage error; later stages do not run.
    pub async fn run(
        &self,
        ctx: &mut ProduceContext,
        after: i32,
        up_to: i32,
    ) -> Result<(), ProduceError> {
        for stage in &self.stages {
            let key = stage.sort_key();
            if key <= after || key > up_to {
                continue;
            }
            match stage {
                Stage::Serialize => serialize(ctx)?,
                Stage::Validate => validate(ctx)?,
                Stage::Enrich => enrich(ctx),
                Stage::Encrypt => encrypt(ctx)?,
                Stage::Chunk => chunk_stage(ctx),
                Stage::Custom(custom) => custom.handle(ctx).await?,
            }
        }
        Ok(())
    }
}

fn serialize(ctx: &mut ProduceContext) -> Result<(), ProduceError> {
    if let Some(serialize) = ctx.pending.take() {
        ctx.payload = Some(serialize(ctx.endpoint.serializer())?);
    }
    // Raw payloads pass through untouched; the type header is written in
    // every case, tombstones included.
    ctx.headers.set(names::MESSAGE_TYPE, ctx.message_type.clone());
    Ok(())
}

fn validate(ctx: &mut ProduceContext) -> Result<(), ProduceError> {
    let Err(violations) = &ctx.validation else {
        return Ok(());
    };
    match ctx.endpoint.validation() {
        ValidationMode::None => Ok(()),
        ValidationMode::Warn => {
            tracing::warn!(
                endpoint = ctx.endpoint.name(),
                message_type = %ctx.message_type,
                violations = ?violations,
                "producing message that failed validation"
            );
            Ok(())
        }
        ValidationMode::Throw => Err(ProduceError::Validation(violations.clone())),
    }
}

fn enrich(ctx: &mut ProduceContext) {
    for (name, value) in ctx.endpoint.static_headers() {
        ctx.headers.set(name.clone(), value.clone());
    }
}

fn encrypt(ctx: &mut ProduceContext) -> Result<(), ProduceError> {
    let Some(settings) = ctx.endpoint.encryption() else {
        return Ok(());
    };
    let Some(plaintext) = ctx.payload.take() else {
        // Tombstones carry no payload to seal.
        return Ok(());
    };
    let (sealed, key_id) =
        encryption::encrypt(settings, &plaintext).map_err(ProduceError::Encryption)?;
    ctx.payload = Some(sealed);
    if let Some(key_id) = key_id {
        ctx.headers.set(names::ENCRYPTION_KEY_ID, key_id);
    }
    Ok(())
}

fn chunk_stage(ctx: &mut ProduceContext) {
    ctx.records = chunk::split(
        ctx.endpoint.name(),
        ctx.key.as_deref(),
        &ctx.headers,
        ctx.payload.take(),
        ctx.endpoint.chunk(),
    );
}
