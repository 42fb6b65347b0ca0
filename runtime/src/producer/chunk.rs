//! Payload chunking.
//!
//! When an endpoint configures a chunk size `S` and the serialized payload
//! is longer than `S`, the payload is split into `⌈L/S⌉` fragments. Every
//! fragment carries the shared `x-message-id` and its `x-chunk-index`; the
//! terminal fragment carries `x-last-chunk: true`, and `x-chunks-count` is
//! written either on every fragment (`always_add_headers`) or only on the
//! terminal one. All fragments share the record key so brokers that
//! partition by key keep the group together.

use silverback_core::client::ProducerRecord;
use silverback_core::endpoint::ChunkSettings;
use silverback_core::headers::{HeaderMap, names};
use uuid::Uuid;

/// Split an outbound record into chunk fragments.
///
/// Returns a single unmodified record when chunking does not apply (payload
/// within the size limit, or a tombstone).
#[must_use]
pub fn split(
    topic: &str,
    key: Option<&str>,
    headers: &HeaderMap,
    payload: Option<Vec<u8>>,
    settings: Option<&ChunkSettings>,
) -> Vec<ProducerRecord> {
    let Some(settings) = settings else {
        return vec![ProducerRecord {
            topic: topic.to_string(),
            key: key.map(ToString::to_string),
            headers: headers.clone(),
            payload,
        }];
    };
    let Some(payload) = payload else {
        return vec![ProducerRecord {
            topic: topic.to_string(),
            key: key.map(ToString::to_string),
            headers: headers.clone(),
            payload: None,
        }];
    };

    if payload.len() <= settings.size {
        return vec![ProducerRecord {
            topic: topic.to_string(),
            key: key.map(ToString::to_string),
            headers: headers.clone(),
            payload: Some(payload),
        }];
    }

    let count = payload.len().div_ceil(settings.size);
    let message_id = Uuid::new_v4().to_string();

    payload
        .chunks(settings.size)
        .enumerate()
        .map(|(index, fragment)| {
            let mut fragment_headers = headers.clone();
            fragment_headers.set(names::MESSAGE_ID, message_id.clone());
            #[allow(clippy::cast_possible_truncation)]
            fragment_headers.set_u32(names::CHUNK_INDEX, index as u32);
            let last = index == count - 1;
            if last {
                fragment_headers.set_flag(names::LAST_CHUNK, true);
            }
            if settings.always_add_headers || last {
                #[allow(clippy::cast_possible_truncation)]
                fragment_headers.set_u32(names::CHUNKS_COUNT, count as u32);
            }
            ProducerRecord {
                topic: topic.to_string(),
                key: key.map(ToString::to_string),
                headers: fragment_headers,
                payload: Some(fragment.to_vec()),
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn settings(size: usize, always: bool) -> ChunkSettings {
        ChunkSettings {
            size,
            always_add_headers: always,
        }
    }

    #[test]
    fn payload_within_limit_is_untouched() {
        let records = split("t", None, &HeaderMap::new(), Some(vec![0u8; 10]), Some(&settings(10, true)));
        assert_eq!(records.len(), 1);
        assert!(!records[0].headers.contains(names::CHUNK_INDEX));
    }

    #[test]
    fn forty_bytes_at_ten_gives_four_fragments() {
        let payload: Vec<u8> = (0u8..40).collect();
        let records = split(
            "t",
            Some("key-1"),
            &HeaderMap::new(),
            Some(payload.clone()),
            Some(&settings(10, false)),
        );

        assert_eq!(records.len(), 4);
        for (index, record) in records.iter().enumerate() {
            assert!(record.payload.as_ref().unwrap().len() <= 10);
            assert_eq!(record.key.as_deref(), Some("key-1"));
            assert_eq!(
                record.headers.get_u32(names::CHUNK_INDEX).unwrap(),
                Some(u32::try_from(index).unwrap())
            );
        }

        // Same message id on every fragment.
        let id = records[0].headers.get(names::MESSAGE_ID).unwrap();
        assert!(records
            .iter()
            .all(|r| r.headers.get(names::MESSAGE_ID) == Some(id)));

        // Count only on the terminal fragment, which also carries the flag.
        assert!(!records[0].headers.contains(names::CHUNKS_COUNT));
        assert_eq!(records[3].headers.get_u32(names::CHUNKS_COUNT).unwrap(), Some(4));
        assert!(records[3].headers.get_flag(names::LAST_CHUNK));
        assert!(!records[2].headers.get_flag(names::LAST_CHUNK));

        // Reassembling in index order restores the payload.
        let reassembled: Vec<u8> = records
            .iter()
            .flat_map(|r| r.payload.clone().unwrap())
            .collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn always_add_headers_writes_count_everywhere() {
        let records = split(
            "t",
            None,
            &HeaderMap::new(),
            Some(vec![0u8; 25]),
            Some(&settings(10, true)),
        );
        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.headers.get_u32(names::CHUNKS_COUNT).unwrap(), Some(3));
        }
    }

    #[test]
    fn tombstone_is_never_chunked() {
        let records = split("t", Some("k"), &HeaderMap::new(), None, Some(&settings(1, true)));
        assert_eq!(records.len(), 1);
        assert!(records[0].payload.is_none());
    }
}
