//! End-to-end produce → broker → consume tests over the in-memory broker.
//!
//! These cover the delivery guarantees of the integration core: chunk
//! round-trips, duplicate-chunk idempotence, missing-first-chunk discards,
//! sequence timeouts, encryption key rotation, per-partition ordering,
//! batch and stream delivery, rebalance safety, and the error policies.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // test code

use serde::{Deserialize, Serialize};
use silverback_core::client::{
    ClientStatus, ConsumerCallbacks, ConsumerClient, ProducerClient, ProducerRecord,
};
use silverback_core::endpoint::{EncryptionKey, EndpointConfiguration};
use silverback_core::envelope::TopicPartition;
use silverback_core::error::{ConsumeError, SequenceAbortReason};
use silverback_core::headers::{HeaderMap, names};
use silverback_core::message::Message;
use silverback_core::policy::ErrorPolicy;
use silverback_core::subscriber::SubscriberRegistry;
use silverback_runtime::{Consumer, ConsumerStatus, Producer, Publisher};
use silverback_testing::{CapturingSubscriber, FailingSubscriber, InMemoryBroker};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ContentEvent {
    content: String,
}

impl Message for ContentEvent {
    fn message_type() -> &'static str {
        "ContentEvent.v1"
    }
}

#[derive(Default)]
struct RecordingCallbacks {
    aborted: Mutex<Vec<(String, SequenceAbortReason)>>,
    committed: Mutex<Vec<(TopicPartition, i64)>>,
    stopped: Mutex<Option<String>>,
}

impl ConsumerCallbacks for RecordingCallbacks {
    fn on_offsets_committed(
        &self,
        results: &[(TopicPartition, Result<i64, silverback_core::client::ClientError>)],
    ) {
        let mut committed = self.committed.lock().unwrap();
        for (tp, result) in results {
            if let Ok(offset) = result {
                committed.push((tp.clone(), *offset));
            }
        }
    }

    fn on_sequence_aborted(&self, sequence_id: &str, reason: &SequenceAbortReason) {
        self.aborted
            .lock()
            .unwrap()
            .push((sequence_id.to_string(), reason.clone()));
    }

    fn on_consumer_stopped(&self, error: &ConsumeError) {
        *self.stopped.lock().unwrap() = Some(error.to_string());
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn content_endpoint(topic: &str) -> silverback_core::endpoint::EndpointConfigurationBuilder {
    EndpointConfiguration::builder(topic).message_type::<ContentEvent>()
}

async fn publisher_for(
    broker: &InMemoryBroker,
    endpoint: EndpointConfiguration,
) -> Arc<Publisher> {
    let publisher = Arc::new(Publisher::new());
    let producer = Producer::new(Arc::new(endpoint), broker.producer(), None).unwrap();
    publisher.register(Arc::new(producer)).await.unwrap();
    publisher
}

fn subscribers_with(capture: &Arc<CapturingSubscriber>) -> Arc<SubscriberRegistry> {
    let mut registry = SubscriberRegistry::new();
    registry.subscribe(ContentEvent::message_type(), Arc::clone(capture) as _);
    Arc::new(registry)
}

/// Chunk fragment record built by hand, for fault-injection tests.
fn chunk_record(
    topic: &str,
    message_id: &str,
    index: u32,
    count: Option<u32>,
    last: bool,
    payload: &[u8],
) -> ProducerRecord {
    let mut headers = HeaderMap::new();
    headers.set(names::MESSAGE_TYPE, ContentEvent::message_type());
    headers.set(names::MESSAGE_ID, message_id);
    headers.set_u32(names::CHUNK_INDEX, index);
    if let Some(count) = count {
        headers.set_u32(names::CHUNKS_COUNT, count);
    }
    if last {
        headers.set_flag(names::LAST_CHUNK, true);
    }
    ProducerRecord {
        topic: topic.to_string(),
        key: None,
        headers,
        payload: Some(payload.to_vec()),
    }
}

// ---------------------------------------------------------------------------
// S1: chunked produce/consume round-trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chunked_messages_roundtrip_with_reassembly_hints() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);

    let publisher =
        publisher_for(&broker, content_endpoint("content").chunking(10, false).build().unwrap())
            .await;

    // Each message serializes to exactly 40 bytes -> 4 fragments of 10.
    let mut originals = Vec::new();
    for i in 0..5 {
        let event = ContentEvent {
            content: format!("Long message {i:013}"),
        };
        assert_eq!(serde_json::to_vec(&event).unwrap().len(), 40);
        originals.push(serde_json::to_vec(&event).unwrap());
        publisher.publish(event).await.unwrap();
    }

    // 5 messages x 4 fragments, all within the chunk size.
    let records = broker.records("content", 0);
    assert_eq!(records.len(), 20);
    for group in records.chunks(4) {
        let first_offset = group[0].offset;
        assert!(group.iter().all(|r| r.payload.as_ref().unwrap().len() <= 10));
        for fragment in &group[1..] {
            assert_eq!(
                fragment.headers.get_i64(names::FIRST_CHUNK_OFFSET).unwrap(),
                Some(first_offset)
            );
        }
        assert!(group[3].headers.get_flag(names::LAST_CHUNK));
        assert!(!group[2].headers.get_flag(names::LAST_CHUNK));
    }

    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("s1-group", &["content"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(
            content_endpoint("content").chunking(10, false).build().unwrap(),
        ))
        .subscribers(subscribers_with(&capture))
        .group_id("s1-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    wait_for(|| capture.received().len() == 5, "five delivered messages").await;
    consumer.stop().await;

    let delivered = capture.received();
    for (message, original) in delivered.iter().zip(&originals) {
        assert_eq!(message.payload.as_deref(), Some(original.as_slice()));
        assert_eq!(message.decode::<ContentEvent>().unwrap().content.len(), 26);
    }
    assert_eq!(
        broker.committed("s1-group", &TopicPartition::new("content", 0)),
        Some(20)
    );
}

// ---------------------------------------------------------------------------
// S2: duplicate chunks are idempotent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_chunks_are_dropped_silently() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    let producer = broker.producer();

    // "Message 1" / "Message 2" as JSON strings, three chunks each; the
    // middle chunk of message 1 and the first chunk of message 2 arrive
    // several times. 10 raw records in total.
    let injected = [
        chunk_record("content", "m1", 0, None, false, b"\"Mes"),
        chunk_record("content", "m1", 1, None, false, b"sage"),
        chunk_record("content", "m1", 1, None, false, b"sage"),
        chunk_record("content", "m1", 1, None, false, b"sage"),
        chunk_record("content", "m1", 2, None, true, b" 1\""),
        chunk_record("content", "m2", 0, None, false, b"\"Mes"),
        chunk_record("content", "m2", 0, None, false, b"\"Mes"),
        chunk_record("content", "m2", 0, None, false, b"\"Mes"),
        chunk_record("content", "m2", 1, None, false, b"sage"),
        chunk_record("content", "m2", 2, None, true, b" 2\""),
    ];
    for record in injected {
        producer.send(record).await.unwrap();
    }

    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("s2-group", &["content"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(content_endpoint("content").build().unwrap()))
        .subscribers(subscribers_with(&capture))
        .group_id("s2-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    wait_for(|| capture.received().len() == 2, "two delivered messages").await;
    consumer.stop().await;

    assert_eq!(capture.payloads(), vec!["\"Message 1\"", "\"Message 2\""]);
    assert_eq!(
        broker.committed("s2-group", &TopicPartition::new("content", 0)),
        Some(10)
    );
}

// ---------------------------------------------------------------------------
// Missing first chunk discards the sequence, later traffic continues
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_first_chunk_discards_without_wedging_the_partition() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    let producer = broker.producer();

    // Fragment 0 never arrives.
    producer
        .send(chunk_record("content", "lost", 1, Some(3), false, b"sage"))
        .await
        .unwrap();
    producer
        .send(chunk_record("content", "lost", 2, Some(3), true, b" 1\""))
        .await
        .unwrap();
    // A healthy, unchunked message follows.
    let mut headers = HeaderMap::new();
    headers.set(names::MESSAGE_TYPE, ContentEvent::message_type());
    producer
        .send(ProducerRecord {
            topic: "content".to_string(),
            key: None,
            headers,
            payload: Some(br#"{"content":"intact"}"#.to_vec()),
        })
        .await
        .unwrap();

    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("orphan-group", &["content"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(content_endpoint("content").build().unwrap()))
        .subscribers(subscribers_with(&capture))
        .group_id("orphan-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    wait_for(|| capture.received().len() == 1, "the intact message").await;
    consumer.stop().await;

    assert_eq!(
        capture.received()[0].decode::<ContentEvent>().unwrap(),
        ContentEvent {
            content: "intact".to_string()
        }
    );
    // The orphans advanced offsets; everything is committed.
    assert_eq!(
        broker.committed("orphan-group", &TopicPartition::new("content", 0)),
        Some(3)
    );
}

// ---------------------------------------------------------------------------
// Sequence timeout aborts without committing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequence_timeout_aborts_and_commits_nothing() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    broker
        .producer()
        .send(chunk_record("content", "m1", 0, Some(2), false, b"\"ha"))
        .await
        .unwrap();

    let callbacks = Arc::new(RecordingCallbacks::default());
    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("timeout-group", &["content"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(
            content_endpoint("content")
                .sequence_timeout(Duration::from_millis(100))
                .build()
                .unwrap(),
        ))
        .subscribers(subscribers_with(&capture))
        .callbacks(Arc::clone(&callbacks) as _)
        .group_id("timeout-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    wait_for(
        || {
            callbacks
                .aborted
                .lock()
                .unwrap()
                .iter()
                .any(|(_, reason)| *reason == SequenceAbortReason::Timeout)
        },
        "timeout abort",
    )
    .await;
    consumer.stop().await;

    assert!(capture.received().is_empty());
    assert_eq!(
        broker.committed("timeout-group", &TopicPartition::new("content", 0)),
        None
    );
}

// ---------------------------------------------------------------------------
// S3: encryption key rotation
// ---------------------------------------------------------------------------

fn keyring() -> Vec<EncryptionKey> {
    vec![
        EncryptionKey {
            id: "k1".to_string(),
            key: vec![0x11; 32],
        },
        EncryptionKey {
            id: "k2".to_string(),
            key: vec![0x22; 32],
        },
    ]
}

#[tokio::test]
async fn rotated_keys_decrypt_via_the_key_id_header() {
    let broker = InMemoryBroker::new();
    broker.create_topic("secure", 1);

    // One message sealed with each key.
    for (index, active) in ["k1", "k2"].iter().enumerate() {
        let endpoint = EndpointConfiguration::builder("secure")
            .message_type::<ContentEvent>()
            .encryption(keyring(), *active)
            .build()
            .unwrap();
        let publisher = publisher_for(&broker, endpoint).await;
        publisher
            .publish(ContentEvent {
                content: format!("secret {index}"),
            })
            .await
            .unwrap();
    }

    // Ciphertext on the wire, key ids in the headers.
    let records = broker.records("secure", 0);
    assert_eq!(records[0].headers.get(names::ENCRYPTION_KEY_ID), Some("k1"));
    assert_eq!(records[1].headers.get(names::ENCRYPTION_KEY_ID), Some("k2"));
    for record in &records {
        let payload = record.payload.as_ref().unwrap();
        assert!(!payload.windows(6).any(|w| w == b"secret"));
    }

    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("secure-group", &["secure"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(
            EndpointConfiguration::builder("secure")
                .message_type::<ContentEvent>()
                .encryption(keyring(), "k1")
                .build()
                .unwrap(),
        ))
        .subscribers(subscribers_with(&capture))
        .group_id("secure-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    wait_for(|| capture.received().len() == 2, "two decrypted messages").await;
    consumer.stop().await;

    let contents: Vec<String> = capture
        .received()
        .iter()
        .map(|m| m.decode::<ContentEvent>().unwrap().content)
        .collect();
    assert_eq!(contents, vec!["secret 0", "secret 1"]);
}

#[tokio::test]
async fn unknown_key_id_stops_the_consumer_without_commit() {
    let broker = InMemoryBroker::new();
    broker.create_topic("secure", 1);

    let producer_endpoint = EndpointConfiguration::builder("secure")
        .message_type::<ContentEvent>()
        .encryption(
            vec![
                EncryptionKey {
                    id: "k9".to_string(),
                    key: vec![0x99; 32],
                },
                EncryptionKey {
                    id: "k8".to_string(),
                    key: vec![0x88; 32],
                },
            ],
            "k9",
        )
        .build()
        .unwrap();
    publisher_for(&broker, producer_endpoint)
        .await
        .publish(ContentEvent {
            content: "locked away".to_string(),
        })
        .await
        .unwrap();

    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("lost-key-group", &["secure"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(
            EndpointConfiguration::builder("secure")
                .message_type::<ContentEvent>()
                .encryption(keyring(), "k1")
                .build()
                .unwrap(),
        ))
        .subscribers(subscribers_with(&capture))
        .group_id("lost-key-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    wait_for(
        || consumer.status() == ConsumerStatus::Stopped,
        "consumer stop",
    )
    .await;

    assert!(matches!(
        consumer.last_error(),
        Some(ConsumeError::DecryptionKeyNotFound(id)) if id == "k9"
    ));
    assert!(capture.received().is_empty());
    assert_eq!(
        broker.committed("lost-key-group", &TopicPartition::new("secure", 0)),
        None
    );
}

// ---------------------------------------------------------------------------
// Per-partition ordering (property 3)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn partition_order_is_preserved_to_dispatch() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    let publisher = publisher_for(&broker, content_endpoint("content").build().unwrap()).await;

    for i in 0..10 {
        publisher
            .publish(ContentEvent {
                content: format!("ordered {i}"),
            })
            .await
            .unwrap();
    }

    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("order-group", &["content"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(content_endpoint("content").build().unwrap()))
        .subscribers(subscribers_with(&capture))
        .group_id("order-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    wait_for(|| capture.received().len() == 10, "ten messages").await;
    consumer.stop().await;

    let offsets: Vec<i64> = capture.received().iter().map(|m| m.id.offset).collect();
    assert_eq!(offsets, (0..10).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// Batch and stream delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batches_deliver_by_size_and_partial_by_timeout() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    let publisher = publisher_for(&broker, content_endpoint("content").build().unwrap()).await;

    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("batch-group", &["content"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(
            content_endpoint("content")
                .batch(3, Duration::from_millis(200))
                .build()
                .unwrap(),
        ))
        .subscribers(subscribers_with(&capture))
        .group_id("batch-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    for i in 0..3 {
        publisher
            .publish(ContentEvent {
                content: format!("batched {i}"),
            })
            .await
            .unwrap();
    }
    // One full batch, one invocation.
    wait_for(|| capture.received().len() == 3, "full batch").await;
    assert_eq!(capture.invocations(), 1);

    // Two more run out the batch timeout as a partial batch.
    for i in 3..5 {
        publisher
            .publish(ContentEvent {
                content: format!("batched {i}"),
            })
            .await
            .unwrap();
    }
    wait_for(|| capture.received().len() == 5, "partial batch").await;
    assert_eq!(capture.invocations(), 2);

    consumer.stop().await;
    assert_eq!(
        broker.committed("batch-group", &TopicPartition::new("content", 0)),
        Some(5)
    );
}

#[tokio::test]
async fn streaming_endpoint_feeds_one_open_stream() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    let publisher = publisher_for(&broker, content_endpoint("content").build().unwrap()).await;

    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("stream-group", &["content"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(content_endpoint("content").streaming().build().unwrap()))
        .subscribers(subscribers_with(&capture))
        .group_id("stream-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    for i in 0..4 {
        publisher
            .publish(ContentEvent {
                content: format!("streamed {i}"),
            })
            .await
            .unwrap();
    }

    wait_for(|| capture.received().len() == 4, "four streamed messages").await;
    // The whole stream is one subscriber invocation.
    assert_eq!(capture.invocations(), 1);
    consumer.stop().await;

    assert_eq!(
        broker.committed("stream-group", &TopicPartition::new("content", 0)),
        Some(4)
    );
}

// ---------------------------------------------------------------------------
// Error policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_then_skip_is_bounded_and_commits() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    publisher_for(&broker, content_endpoint("content").build().unwrap())
        .await
        .publish(ContentEvent {
            content: "doomed".to_string(),
        })
        .await
        .unwrap();

    let failing = Arc::new(FailingSubscriber::always());
    let mut registry = SubscriberRegistry::new();
    registry.subscribe(ContentEvent::message_type(), Arc::clone(&failing) as _);

    let client = broker.consumer("skip-group", &["content"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(
            content_endpoint("content")
                .error_policy(
                    ErrorPolicy::retry(3)
                        .with_initial_delay(Duration::from_millis(1))
                        .with_max_delay(Duration::from_millis(5))
                        .then_skip(),
                )
                .build()
                .unwrap(),
        ))
        .subscribers(Arc::new(registry))
        .group_id("skip-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    // Initial attempt + 3 retries, then the skip commits the offset.
    wait_for(
        || broker.committed("skip-group", &TopicPartition::new("content", 0)) == Some(1),
        "offset committed after skip",
    )
    .await;
    assert_eq!(failing.invocations(), 4);
    assert_eq!(consumer.status(), ConsumerStatus::Running);
    consumer.stop().await;
}

#[tokio::test]
async fn retry_exhaustion_stops_the_consumer() {
    // S6: Retry(10) with a subscriber that always throws.
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    publisher_for(&broker, content_endpoint("content").build().unwrap())
        .await
        .publish(ContentEvent {
            content: "poison".to_string(),
        })
        .await
        .unwrap();

    let failing = Arc::new(FailingSubscriber::always());
    let mut registry = SubscriberRegistry::new();
    registry.subscribe(ContentEvent::message_type(), Arc::clone(&failing) as _);

    let callbacks = Arc::new(RecordingCallbacks::default());
    let client = broker.consumer("stop-group", &["content"]);
    let consumer = Consumer::builder(Arc::clone(&client) as _)
        .endpoint(Arc::new(
            content_endpoint("content")
                .error_policy(
                    ErrorPolicy::retry(10)
                        .with_initial_delay(Duration::from_millis(1))
                        .with_max_delay(Duration::from_millis(2)),
                )
                .build()
                .unwrap(),
        ))
        .subscribers(Arc::new(registry))
        .callbacks(Arc::clone(&callbacks) as _)
        .group_id("stop-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    wait_for(
        || consumer.status() == ConsumerStatus::Stopped,
        "consumer stop",
    )
    .await;

    assert_eq!(failing.invocations(), 11);
    assert_eq!(
        broker.committed("stop-group", &TopicPartition::new("content", 0)),
        None
    );
    assert!(matches!(
        consumer.last_error(),
        Some(ConsumeError::Subscriber(_))
    ));
    assert!(callbacks.stopped.lock().unwrap().is_some());
    assert_eq!(client.status(), ClientStatus::Disconnected);
}

#[tokio::test]
async fn move_policy_routes_to_dead_letter_and_commits() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    broker.create_topic("content-dlq", 1);

    let publisher = Arc::new(Publisher::new());
    let source = Producer::new(
        Arc::new(content_endpoint("content").build().unwrap()),
        broker.producer(),
        None,
    )
    .unwrap();
    let dead_letter = Producer::new(
        Arc::new(
            EndpointConfiguration::builder("content-dlq")
                .message_type::<ContentEvent>()
                .friendly_name("dead-letters")
                .not_routable()
                .build()
                .unwrap(),
        ),
        broker.producer(),
        None,
    )
    .unwrap();
    publisher.register(Arc::new(source)).await.unwrap();
    publisher.register(Arc::new(dead_letter)).await.unwrap();

    publisher
        .publish(ContentEvent {
            content: "unprocessable".to_string(),
        })
        .await
        .unwrap();

    let failing = Arc::new(FailingSubscriber::always());
    let mut registry = SubscriberRegistry::new();
    registry.subscribe(ContentEvent::message_type(), Arc::clone(&failing) as _);

    let client = broker.consumer("move-group", &["content"]);
    let consumer = Consumer::builder(client)
        .endpoint(Arc::new(
            content_endpoint("content")
                .error_policy(ErrorPolicy::move_to("dead-letters"))
                .build()
                .unwrap(),
        ))
        .subscribers(Arc::new(registry))
        .publisher(Arc::clone(&publisher))
        .group_id("move-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    wait_for(
        || broker.records("content-dlq", 0).len() == 1,
        "dead-lettered record",
    )
    .await;
    wait_for(
        || broker.committed("move-group", &TopicPartition::new("content", 0)) == Some(1),
        "source offset committed",
    )
    .await;
    consumer.stop().await;

    let moved = &broker.records("content-dlq", 0)[0];
    assert_eq!(moved.headers.get(names::SOURCE_ENDPOINT), Some("content"));
    assert!(moved.headers.get(names::FAILURE_REASON).is_some());
    assert_eq!(
        moved.payload.as_deref(),
        Some(br#"{"content":"unprocessable"}"#.as_slice())
    );
}

// ---------------------------------------------------------------------------
// Rebalance safety (property 9)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn revocation_aborts_in_flight_sequences_and_reassignment_resumes() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    let producer = broker.producer();

    // Only the first half of a chunk group is available.
    producer
        .send(chunk_record("content", "m1", 0, Some(2), false, b"\"sp"))
        .await
        .unwrap();

    let callbacks = Arc::new(RecordingCallbacks::default());
    let capture = Arc::new(CapturingSubscriber::new());
    let client = broker.consumer("rebalance-group", &["content"]);
    let consumer = Consumer::builder(Arc::clone(&client) as _)
        .endpoint(Arc::new(content_endpoint("content").build().unwrap()))
        .subscribers(subscribers_with(&capture))
        .callbacks(Arc::clone(&callbacks) as _)
        .group_id("rebalance-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    // Let the first fragment arrive, then revoke the partition mid-sequence.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let partition = TopicPartition::new("content", 0);
    client.revoke_partitions(std::slice::from_ref(&partition));

    wait_for(
        || {
            callbacks
                .aborted
                .lock()
                .unwrap()
                .iter()
                .any(|(_, reason)| *reason == SequenceAbortReason::Rebalance)
        },
        "rebalance abort",
    )
    .await;
    assert_eq!(broker.committed("rebalance-group", &partition), None);

    // Reassign: processing resumes from the last committed offset, the
    // group is refetched whole once the second fragment exists.
    producer
        .send(chunk_record("content", "m1", 1, Some(2), true, b"lit\""))
        .await
        .unwrap();
    client.assign_partitions(std::slice::from_ref(&partition));

    wait_for(|| capture.received().len() == 1, "reassembled after rebalance").await;
    consumer.stop().await;

    assert_eq!(capture.payloads(), vec!["\"split\""]);
    assert_eq!(broker.committed("rebalance-group", &partition), Some(2));
}

// ---------------------------------------------------------------------------
// Kafka-style transactions (S5 over the in-memory broker)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transactional_produce_is_invisible_until_commit() {
    use silverback_core::client::TransactionalProducerClient;

    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);

    let client = broker.producer();
    let publisher = Arc::new(Publisher::new());
    let producer = Producer::new(
        Arc::new(content_endpoint("content").build().unwrap()),
        Arc::clone(&client) as _,
        None,
    )
    .unwrap();
    publisher.register(Arc::new(producer)).await.unwrap();

    let capture = Arc::new(CapturingSubscriber::new());
    let consumer = Consumer::builder(broker.consumer("tx-group", &["content"]))
        .endpoint(Arc::new(content_endpoint("content").build().unwrap()))
        .subscribers(subscribers_with(&capture))
        .group_id("tx-group")
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    client.begin().await.unwrap();
    for i in 0..3 {
        publisher
            .publish(ContentEvent {
                content: format!("tx {i}"),
            })
            .await
            .unwrap();
    }

    // Not committed: the consumer sees nothing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(capture.received().is_empty());

    TransactionalProducerClient::commit(client.as_ref()).await.unwrap();
    wait_for(|| capture.received().len() == 3, "committed records").await;
    consumer.stop().await;
}
