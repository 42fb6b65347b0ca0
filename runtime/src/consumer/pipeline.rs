//! The per-unit half of the consumer pipeline: decrypt, deserialize,
//! validate, dispatch.
//!
//! Reassembly (the sequence store) runs first because chunking is the
//! outermost wire transformation: fragments of an encrypted message are
//! ciphertext slices, so the payload is decrypted only once the group is
//! whole. The stages here operate on a *unit*: one raw envelope, or one
//! completed chunk group.

use silverback_core::endpoint::{EndpointConfiguration, ValidationMode};
use silverback_core::envelope::{DeliveredMessage, InboundEnvelope};
use silverback_core::error::ConsumeError;
use silverback_core::headers::names;
use silverback_core::subscriber::{Delivery, SubscriberRegistry};
use std::sync::Arc;

use crate::encryption;

/// Run decrypt → deserialize → validate over one unit and build the
/// delivered message.
///
/// `payload` is the reassembled payload for chunk groups, or the single raw
/// envelope's payload; `None` marks a tombstone.
///
/// # Errors
///
/// - [`ConsumeError::DecryptionKeyNotFound`] / [`ConsumeError::Decryption`]
/// - [`ConsumeError::Deserialization`] for structurally invalid payloads
/// - [`ConsumeError::Validation`] under `Throw` validation
pub(crate) fn finish_unit(
    endpoint: &Arc<EndpointConfiguration>,
    raws: &[InboundEnvelope],
    payload: Option<Vec<u8>>,
) -> Result<DeliveredMessage, ConsumeError> {
    let first = raws.first().ok_or_else(|| {
        ConsumeError::Fatal("processing unit without raw envelopes".to_string())
    })?;
    let last = raws.last().unwrap_or(first);
    let headers = first.headers.clone();

    // Decrypt.
    let payload = match (endpoint.encryption(), payload) {
        (Some(settings), Some(sealed)) => {
            Some(encryption::decrypt(settings, &headers, &sealed)?)
        }
        (None, payload) => {
            if let Some(key_id) = headers.get(names::ENCRYPTION_KEY_ID) {
                // The producer sealed this payload but no keyring is
                // configured on the consuming endpoint.
                return Err(ConsumeError::DecryptionKeyNotFound(key_id.to_string()));
            }
            payload
        }
        (Some(_), None) => None,
    };

    // Deserialize: strictly the declared header type, falling back to the
    // endpoint's bound type. Structural decodability is checked here so the
    // error policy sees deserialization failures before dispatch.
    let message_type = headers
        .get(names::MESSAGE_TYPE)
        .unwrap_or_else(|| endpoint.message_type())
        .to_string();
    if let Some(payload) = &payload {
        endpoint
            .serializer()
            .validate(payload)
            .map_err(|e| ConsumeError::Deserialization(e.to_string()))?;
    }

    // Validate.
    if let Some(validator) = endpoint.inbound_validator() {
        if let Err(violations) = validator(&headers, payload.as_deref().unwrap_or_default()) {
            match endpoint.validation() {
                ValidationMode::None => {}
                ValidationMode::Warn => {
                    tracing::warn!(
                        endpoint = endpoint.name(),
                        id = %last.id,
                        violations = ?violations,
                        "consuming message that failed validation"
                    );
                }
                ValidationMode::Throw => return Err(ConsumeError::Validation(violations)),
            }
        }
    }

    Ok(DeliveredMessage {
        id: last.id.clone(),
        key: first.key.clone(),
        headers,
        payload,
        message_type,
        endpoint: Arc::clone(endpoint),
    })
}

/// Invoke every subscriber registered for the delivery's message type.
///
/// Exclusive subscribers run one at a time in registration order, then the
/// remaining subscribers run concurrently. The first error wins.
///
/// # Errors
///
/// Returns [`ConsumeError::Subscriber`] with the first failure.
pub(crate) async fn dispatch(
    subscribers: &SubscriberRegistry,
    message_type: &str,
    make_delivery: impl Fn() -> Delivery,
) -> Result<(), ConsumeError> {
    let handlers = subscribers.handlers_for(message_type);
    if handlers.is_empty() {
        tracing::trace!(message_type, "no subscribers registered");
        return Ok(());
    }

    for registration in handlers.iter().filter(|r| r.exclusive) {
        registration.subscriber.handle(make_delivery()).await?;
    }

    let concurrent: Vec<_> = handlers
        .iter()
        .filter(|r| !r.exclusive)
        .map(|r| r.subscriber.handle(make_delivery()))
        .collect();
    for result in futures::future::join_all(concurrent).await {
        result?;
    }
    Ok(())
}
