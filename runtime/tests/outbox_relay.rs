//! Transactional-outbox tests: enlisted appends, at-least-once relay,
//! FIFO with prefix deletion on partial failure, and lock coordination.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // test code

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use silverback_core::client::{ClientError, ProducerClient, ProducerRecord};
use silverback_core::endpoint::{EndpointConfiguration, ProduceStrategyKind};
use silverback_core::envelope::MessageId;
use silverback_core::headers::names;
use silverback_core::message::Message;
use silverback_core::outbox::{DistributedLock, OutboxStore};
use silverback_runtime::{OutboxWorker, OutboxWorkerOptions, Producer, Publisher};
use silverback_testing::{InMemoryBroker, InMemoryLock, InMemoryOutboxStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ContentEvent {
    content: String,
}

impl Message for ContentEvent {
    fn message_type() -> &'static str {
        "ContentEvent.v1"
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

fn outbox_endpoint(topic: &str) -> EndpointConfiguration {
    EndpointConfiguration::builder(topic)
        .message_type::<ContentEvent>()
        .strategy(ProduceStrategyKind::Outbox)
        .build()
        .unwrap()
}

struct Fixture {
    store: InMemoryOutboxStore,
    publisher: Arc<Publisher>,
    lock: InMemoryLock,
}

async fn fixture(broker: InMemoryBroker, client: Arc<dyn ProducerClient>) -> Fixture {
    broker.create_topic("content", 1);
    let store = InMemoryOutboxStore::new();

    let publisher = Arc::new(Publisher::new());
    let producer = Producer::new(
        Arc::new(outbox_endpoint("content")),
        client,
        Some(Arc::new(store.clone()) as Arc<dyn OutboxStore>),
    )
    .unwrap();
    publisher.register(Arc::new(producer)).await.unwrap();

    Fixture {
        store,
        publisher,
        lock: InMemoryLock::new(),
    }
}

fn spawn_worker(
    fixture: &Fixture,
    options: OutboxWorkerOptions,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let worker = OutboxWorker::new(
        Arc::new(fixture.store.clone()),
        Arc::clone(&fixture.publisher),
        Arc::new(fixture.lock.clone()),
        options,
    );
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        let _ = worker.run(worker_cancel).await;
    });
    (cancel, handle)
}

fn fast_worker_options() -> OutboxWorkerOptions {
    OutboxWorkerOptions {
        interval: Duration::from_millis(20),
        ..OutboxWorkerOptions::default()
    }
}

// ---------------------------------------------------------------------------
// S4: transactional visibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rolled_back_appends_are_never_relayed_committed_ones_in_order() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(broker.clone(), broker.producer()).await;

    let (cancel, handle) = spawn_worker(&fixture, fast_worker_options());

    // Three appends inside a rolled-back transaction: nothing relays.
    let mut tx = fixture.store.begin().await.unwrap();
    for i in 0..3 {
        fixture
            .publisher
            .publish_enlisted(
                tx.as_mut(),
                ContentEvent {
                    content: format!("discarded {i}"),
                },
            )
            .await
            .unwrap();
    }
    tx.rollback().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(broker.records("content", 0).is_empty());
    assert!(fixture.store.is_empty());

    // Three appends inside a committed transaction: exactly those three,
    // in insertion order.
    let mut tx = fixture.store.begin().await.unwrap();
    for i in 0..3 {
        fixture
            .publisher
            .publish_enlisted(
                tx.as_mut(),
                ContentEvent {
                    content: format!("kept {i}"),
                },
            )
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();

    wait_for(|| broker.records("content", 0).len() == 3, "three relayed records").await;
    cancel.cancel();
    handle.await.unwrap();

    let payloads: Vec<String> = broker
        .records("content", 0)
        .iter()
        .map(|r| String::from_utf8_lossy(r.payload.as_deref().unwrap()).into_owned())
        .collect();
    assert_eq!(
        payloads,
        vec![
            r#"{"content":"kept 0"}"#,
            r#"{"content":"kept 1"}"#,
            r#"{"content":"kept 2"}"#
        ]
    );
    assert!(fixture.store.is_empty());
}

// ---------------------------------------------------------------------------
// Partial failure: only the produced prefix is deleted
// ---------------------------------------------------------------------------

struct FlakyProducerClient {
    inner: Arc<dyn ProducerClient>,
    healed: AtomicBool,
}

impl FlakyProducerClient {
    fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProducerClient for FlakyProducerClient {
    async fn send(&self, record: ProducerRecord) -> Result<MessageId, ClientError> {
        let poisoned = record
            .payload
            .as_deref()
            .is_some_and(|p| p.windows(6).any(|w| w == b"poison"));
        if poisoned && !self.healed.load(Ordering::SeqCst) {
            return Err(ClientError::Produce {
                topic: record.topic,
                reason: "injected failure".to_string(),
            });
        }
        self.inner.send(record).await
    }

    async fn flush(&self) -> Result<(), ClientError> {
        self.inner.flush().await
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.inner.disconnect().await
    }
}

#[tokio::test]
async fn failed_row_is_retained_with_everything_behind_it() {
    let broker = InMemoryBroker::new();
    let flaky = Arc::new(FlakyProducerClient {
        inner: broker.producer(),
        healed: AtomicBool::new(false),
    });
    let fixture = fixture(broker.clone(), Arc::clone(&flaky) as _).await;

    for content in ["first", "poison", "last"] {
        fixture
            .publisher
            .publish(ContentEvent {
                content: content.to_string(),
            })
            .await
            .unwrap();
    }
    assert_eq!(fixture.store.len(), 3);

    let (cancel, handle) = spawn_worker(&fixture, fast_worker_options());

    // The prefix goes out, the failed row and its successors stay.
    wait_for(|| broker.records("content", 0).len() == 1, "prefix relayed").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.records("content", 0).len(), 1);
    assert_eq!(fixture.store.len(), 2);

    // Once the broker recovers, the retained rows follow in order.
    flaky.heal();
    wait_for(|| broker.records("content", 0).len() == 3, "remaining rows relayed").await;
    cancel.cancel();
    handle.await.unwrap();

    let payloads: Vec<String> = broker
        .records("content", 0)
        .iter()
        .map(|r| String::from_utf8_lossy(r.payload.as_deref().unwrap()).into_owned())
        .collect();
    assert_eq!(
        payloads,
        vec![
            r#"{"content":"first"}"#,
            r#"{"content":"poison"}"#,
            r#"{"content":"last"}"#
        ]
    );
    assert!(fixture.store.is_empty());
}

// ---------------------------------------------------------------------------
// Chunked outbox rows are fragmented at relay time
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chunked_outbox_endpoint_fragments_on_relay() {
    let broker = InMemoryBroker::new();
    broker.create_topic("content", 1);
    let store = InMemoryOutboxStore::new();

    let endpoint = EndpointConfiguration::builder("content")
        .message_type::<ContentEvent>()
        .strategy(ProduceStrategyKind::Outbox)
        .chunking(10, true)
        .build()
        .unwrap();
    let publisher = Arc::new(Publisher::new());
    let producer = Producer::new(
        Arc::new(endpoint),
        broker.producer(),
        Some(Arc::new(store.clone()) as _),
    )
    .unwrap();
    publisher.register(Arc::new(producer)).await.unwrap();

    publisher
        .publish(ContentEvent {
            content: "long enough to need several fragments".to_string(),
        })
        .await
        .unwrap();

    // One row in the outbox, not pre-fragmented.
    assert_eq!(store.len(), 1);

    let fixture = Fixture {
        store: store.clone(),
        publisher,
        lock: InMemoryLock::new(),
    };
    let (cancel, handle) = spawn_worker(&fixture, fast_worker_options());

    wait_for(|| broker.records("content", 0).len() > 1, "fragments on the broker").await;
    cancel.cancel();
    handle.await.unwrap();

    let records = broker.records("content", 0);
    assert!(records[0].headers.contains(names::CHUNK_INDEX));
    assert!(records.last().unwrap().headers.get_flag(names::LAST_CHUNK));
}

// ---------------------------------------------------------------------------
// Distributed lock keeps foreign-held outboxes untouched
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_yields_while_the_lock_is_held_elsewhere() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(broker.clone(), broker.producer()).await;

    fixture
        .publisher
        .publish(ContentEvent {
            content: "waiting".to_string(),
        })
        .await
        .unwrap();

    // Another holder owns the lock.
    assert!(fixture.lock.try_acquire("outbox", "foreign").await.unwrap());

    let (cancel, handle) = spawn_worker(&fixture, fast_worker_options());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(broker.records("content", 0).is_empty());
    assert_eq!(fixture.store.len(), 1);

    // Releasing the foreign hold lets the next tick drain the outbox.
    fixture.lock.release("outbox", "foreign").await.unwrap();
    wait_for(|| broker.records("content", 0).len() == 1, "row relayed after release").await;
    cancel.cancel();
    handle.await.unwrap();
}
