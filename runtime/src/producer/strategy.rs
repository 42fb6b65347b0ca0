//! Produce strategies: direct send and outbox append.
//!
//! The direct strategy pushes records onto the broker client's FIFO send
//! queue and resolves with the broker-assigned identities. For chunk groups
//! the first fragment is awaited before the rest are released, so its offset
//! can be stamped onto the later fragments as `x-first-chunk-offset`.
//!
//! The outbox strategy turns the prepared context into one durable row; the
//! outbox worker relays it later through the same direct path.

use crate::producer::pipeline::ProduceContext;
use silverback_core::client::{ProducerClient, ProducerRecord};
use silverback_core::envelope::MessageId;
use silverback_core::error::ProduceError;
use silverback_core::headers::names;
use silverback_core::outbox::NewOutboxRecord;

/// Send the chain's records to the broker in order.
///
/// # Errors
///
/// Returns the client error of the first failed send; later fragments are
/// not sent.
pub(crate) async fn send_records(
    client: &dyn ProducerClient,
    mut records: Vec<ProducerRecord>,
) -> Result<Vec<MessageId>, ProduceError> {
    let mut produced = Vec::with_capacity(records.len());
    if records.len() > 1 {
        // Chunk group: the first fragment's offset becomes the reassembly
        // hint on every later fragment.
        let first = records.remove(0);
        let first_id = client.send(first).await?;
        let first_offset = first_id.offset;
        produced.push(first_id);
        for mut record in records {
            record.headers.set_i64(names::FIRST_CHUNK_OFFSET, first_offset);
            produced.push(client.send(record).await?);
        }
    } else {
        for record in records {
            produced.push(client.send(record).await?);
        }
    }
    Ok(produced)
}

/// Turn a prepared context (serialized, validated, enriched, sealed) into an
/// outbox row.
pub(crate) fn to_outbox_record(ctx: &ProduceContext) -> Result<NewOutboxRecord, ProduceError> {
    let mut headers = ctx.headers.clone();
    if let Some(key) = &ctx.key {
        headers.set(names::RECORD_KEY, key.clone());
    }
    let headers = headers
        .to_bytes()
        .map_err(silverback_core::outbox::OutboxError::Serialization)?;
    Ok(NewOutboxRecord {
        endpoint_name: ctx.endpoint.name().to_string(),
        message_type: Some(ctx.message_type.clone()),
        headers,
        content: ctx.payload.clone(),
    })
}
