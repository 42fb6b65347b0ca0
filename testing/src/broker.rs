//! An in-memory broker with partitions, consumer groups, and committed
//! offsets.
//!
//! The broker implements the core client traits deterministically and
//! without I/O, which is what the runtime's end-to-end tests (and any
//! application test suite) run against. Test-only controls let a test
//! inject rebalances and break fetching on demand.
//!
//! Semantics mirror the Kafka model the core is written against:
//!
//! - per-partition append logs with 0-based offsets;
//! - committed offsets are *next-to-read*, kept per consumer group;
//! - a transactional producer stages records until `commit`, and a
//!   consumer never observes staged records.

use async_trait::async_trait;
use silverback_core::client::{
    ClientError, ClientEvent, ClientStatus, ConsumerClient, ProducerClient, ProducerRecord,
    TransactionalProducerClient,
};
use silverback_core::envelope::{InboundEnvelope, MessageId, TopicPartition};
use silverback_core::headers::HeaderMap;
use silverback_core::offset_store::OffsetStore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A record stored in a partition log.
#[derive(Clone, Debug)]
pub struct StoredRecord {
    /// Offset within the partition.
    pub offset: i64,
    /// Record key.
    pub key: Option<String>,
    /// Wire headers.
    pub headers: HeaderMap,
    /// Payload bytes; `None` for tombstones.
    pub payload: Option<Vec<u8>>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: HashMap<String, HashMap<TopicPartition, i64>>,
}

impl BrokerState {
    fn partition_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    fn append(&mut self, record: ProducerRecord) -> Result<MessageId, ClientError> {
        let partitions = self.partition_count(&record.topic);
        if partitions == 0 {
            return Err(ClientError::Produce {
                topic: record.topic,
                reason: "unknown topic".to_string(),
            });
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let partition = record.key.as_ref().map_or(0, |key| {
            (key.bytes().map(u64::from).sum::<u64>() % partitions as u64) as i32
        });
        #[allow(clippy::unwrap_used)]
        let log = self
            .topics
            .get_mut(&record.topic)
            .and_then(|p| p.get_mut(usize::try_from(partition).unwrap_or_default()))
            .ok_or_else(|| ClientError::Produce {
                topic: record.topic.clone(),
                reason: format!("unknown partition {partition}"),
            })?;
        #[allow(clippy::cast_possible_wrap)]
        let offset = log.len() as i64;
        log.push(StoredRecord {
            offset,
            key: record.key,
            headers: record.headers,
            payload: record.payload,
        });
        Ok(MessageId::new(record.topic, partition, offset))
    }
}

/// The shared in-memory broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    wakeup: Arc<Notify>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic with the given partition count. Re-creating an
    /// existing topic is a no-op.
    pub fn create_topic(&self, name: impl Into<String>, partitions: usize) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state
            .topics
            .entry(name.into())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    /// A producer for this broker.
    #[must_use]
    pub fn producer(&self) -> Arc<InMemoryProducerClient> {
        Arc::new(InMemoryProducerClient {
            broker: self.clone(),
            state: Mutex::new(ProducerState::default()),
        })
    }

    /// A consumer in `group`, assigned every partition of `topics` on
    /// connect.
    #[must_use]
    pub fn consumer(&self, group: impl Into<String>, topics: &[&str]) -> Arc<InMemoryConsumerClient> {
        Arc::new(InMemoryConsumerClient {
            broker: self.clone(),
            group: group.into(),
            topics: topics.iter().map(ToString::to_string).collect(),
            offset_store: None,
            state: Mutex::new(ConsumerState::default()),
        })
    }

    /// Like [`consumer`](Self::consumer), but seeding start positions from
    /// a stored-offset loader: `stored + 1` when an offset is found, the
    /// group's committed offset otherwise.
    #[must_use]
    pub fn consumer_with_offset_store(
        &self,
        group: impl Into<String>,
        topics: &[&str],
        offset_store: Arc<dyn OffsetStore>,
    ) -> Arc<InMemoryConsumerClient> {
        Arc::new(InMemoryConsumerClient {
            broker: self.clone(),
            group: group.into(),
            topics: topics.iter().map(ToString::to_string).collect(),
            offset_store: Some(offset_store),
            state: Mutex::new(ConsumerState::default()),
        })
    }

    /// All records currently in a partition log.
    #[must_use]
    pub fn records(&self, topic: &str, partition: i32) -> Vec<StoredRecord> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .and_then(|p| p.get(usize::try_from(partition).unwrap_or_default()))
            .cloned()
            .unwrap_or_default()
    }

    /// The committed (next-to-read) offset of a group on a partition.
    #[must_use]
    pub fn committed(&self, group: &str, partition: &TopicPartition) -> Option<i64> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state.committed.get(group).and_then(|g| g.get(partition)).copied()
    }
}

#[derive(Default)]
struct ProducerState {
    disconnected: bool,
    in_transaction: bool,
    staged: Vec<ProducerRecord>,
}

/// In-memory [`ProducerClient`] (and transactional variant).
pub struct InMemoryProducerClient {
    broker: InMemoryBroker,
    state: Mutex<ProducerState>,
}

#[async_trait]
impl ProducerClient for InMemoryProducerClient {
    async fn send(&self, record: ProducerRecord) -> Result<MessageId, ClientError> {
        {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            if state.disconnected {
                return Err(ClientError::NotConnected);
            }
            if state.in_transaction {
                // Staged records get their identity at commit time; hand
                // back a placeholder the strategy can live with.
                let topic = record.topic.clone();
                state.staged.push(record);
                return Ok(MessageId::new(topic, 0, -1));
            }
        }
        #[allow(clippy::unwrap_used)]
        let id = self.broker.state.lock().unwrap().append(record)?;
        self.broker.wakeup.notify_waiters();
        Ok(id)
    }

    async fn flush(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.disconnected = true;
        Ok(())
    }
}

#[async_trait]
impl TransactionalProducerClient for InMemoryProducerClient {
    async fn begin(&self) -> Result<(), ClientError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(ClientError::NotConnected);
        }
        state.in_transaction = true;
        Ok(())
    }

    async fn commit(&self) -> Result<(), ClientError> {
        let staged = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            state.in_transaction = false;
            std::mem::take(&mut state.staged)
        };
        {
            #[allow(clippy::unwrap_used)]
            let mut broker = self.broker.state.lock().unwrap();
            for record in staged {
                broker.append(record)?;
            }
        }
        self.broker.wakeup.notify_waiters();
        Ok(())
    }

    async fn abort(&self) -> Result<(), ClientError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.in_transaction = false;
        state.staged.clear();
        Ok(())
    }
}

#[derive(Default)]
struct ConsumerState {
    status: Option<ClientStatus>,
    assignments: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    stored: HashMap<TopicPartition, i64>,
    paused: HashSet<TopicPartition>,
    events: VecDeque<ClientEvent>,
    next_poll_index: usize,
    broken: Option<ClientError>,
}

/// In-memory [`ConsumerClient`] with test-only rebalance controls.
pub struct InMemoryConsumerClient {
    broker: InMemoryBroker,
    group: String,
    topics: Vec<String>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    state: Mutex<ConsumerState>,
}

impl InMemoryConsumerClient {
    /// Queue a partition revocation, as a group rebalance would.
    pub fn revoke_partitions(&self, partitions: &[TopicPartition]) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state
            .assignments
            .retain(|tp| !partitions.contains(tp));
        for tp in partitions {
            state.positions.remove(tp);
            state.stored.remove(tp);
        }
        state
            .events
            .push_back(ClientEvent::PartitionsRevoked(partitions.to_vec()));
        drop(state);
        self.broker.wakeup.notify_waiters();
    }

    /// Queue a partition assignment, resuming from the group's committed
    /// offset.
    pub fn assign_partitions(&self, partitions: &[TopicPartition]) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        for tp in partitions {
            if !state.assignments.contains(tp) {
                let committed = self
                    .broker
                    .committed(&self.group, tp)
                    .unwrap_or_default();
                state.positions.insert(tp.clone(), committed);
                state.assignments.push(tp.clone());
            }
        }
        state
            .events
            .push_back(ClientEvent::PartitionsAssigned(partitions.to_vec()));
        drop(state);
        self.broker.wakeup.notify_waiters();
    }

    /// Make the next fetch fail with `error` (test control).
    pub fn break_fetch(&self, error: ClientError) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.broken = Some(error);
        drop(state);
        self.broker.wakeup.notify_waiters();
    }

    fn try_next(&self) -> Result<Option<ClientEvent>, ClientError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        if state.status != Some(ClientStatus::Initialized) {
            return Err(ClientError::NotConnected);
        }
        if let Some(error) = state.broken.take() {
            return Err(error);
        }
        if let Some(event) = state.events.pop_front() {
            return Ok(Some(event));
        }

        let assignments = state.assignments.clone();
        if assignments.is_empty() {
            return Ok(None);
        }
        #[allow(clippy::unwrap_used)]
        let broker = self.broker.state.lock().unwrap();
        for step in 0..assignments.len() {
            let index = (state.next_poll_index + step) % assignments.len();
            let tp = &assignments[index];
            if state.paused.contains(tp) {
                continue;
            }
            let position = state.positions.get(tp).copied().unwrap_or_default();
            let record = broker
                .topics
                .get(&tp.topic)
                .and_then(|p| p.get(usize::try_from(tp.partition).unwrap_or_default()))
                .and_then(|log| log.get(usize::try_from(position).unwrap_or_default()))
                .cloned();
            if let Some(record) = record {
                state.positions.insert(tp.clone(), position + 1);
                state.next_poll_index = (index + 1) % assignments.len();
                return Ok(Some(ClientEvent::Message(InboundEnvelope {
                    id: MessageId::new(tp.topic.clone(), tp.partition, record.offset),
                    key: record.key,
                    headers: record.headers,
                    payload: record.payload,
                })));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ConsumerClient for InMemoryConsumerClient {
    async fn connect(&self) -> Result<(), ClientError> {
        let assignments: Vec<TopicPartition> = {
            #[allow(clippy::unwrap_used)]
            let broker = self.broker.state.lock().unwrap();
            self.topics
                .iter()
                .flat_map(|topic| {
                    let partitions = broker.partition_count(topic);
                    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                    (0..partitions as i32).map(move |p| TopicPartition::new(topic.clone(), p))
                })
                .collect()
        };
        if assignments.is_empty() {
            return Err(ClientError::ConnectionFailed(format!(
                "no partitions for topics {:?}",
                self.topics
            )));
        }

        // Seed positions: stored offset + 1 when the loader knows one,
        // otherwise the group's committed offset (default 0).
        let mut positions = HashMap::new();
        for tp in &assignments {
            let stored = match &self.offset_store {
                Some(store) => store
                    .load(&self.group, tp)
                    .await
                    .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?,
                None => None,
            };
            let position = match stored {
                Some(offset) => offset + 1,
                None => self.broker.committed(&self.group, tp).unwrap_or_default(),
            };
            positions.insert(tp.clone(), position);
        }

        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.status = Some(ClientStatus::Initialized);
        state.positions = positions;
        state.assignments = assignments.clone();
        state.events.push_back(ClientEvent::PartitionsAssigned(assignments));
        Ok(())
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<ClientEvent, ClientError> {
        loop {
            let wakeup = self.broker.wakeup.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable();

            if let Some(event) = self.try_next()? {
                return Ok(event);
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(ClientError::NotConnected),
                () = &mut wakeup => {}
            }
        }
    }

    fn store_offset(&self, id: &MessageId) -> Result<(), ClientError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        if state.status != Some(ClientStatus::Initialized) {
            return Err(ClientError::NotConnected);
        }
        let tp = id.topic_partition();
        let stored = state.stored.entry(tp).or_insert(id.offset);
        *stored = (*stored).max(id.offset);
        Ok(())
    }

    async fn commit(&self) -> Result<(), ClientError> {
        let stored: Vec<(TopicPartition, i64)> = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            if state.status != Some(ClientStatus::Initialized)
                && state.status != Some(ClientStatus::Disconnecting)
            {
                return Err(ClientError::NotConnected);
            }
            state.stored.drain().collect()
        };
        #[allow(clippy::unwrap_used)]
        let mut broker = self.broker.state.lock().unwrap();
        let group = broker.committed.entry(self.group.clone()).or_default();
        for (tp, offset) in stored {
            // Committed offsets are next-to-read.
            let next = offset + 1;
            let entry = group.entry(tp).or_insert(next);
            *entry = (*entry).max(next);
        }
        Ok(())
    }

    async fn pause(&self, partitions: &[TopicPartition]) -> Result<(), ClientError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    async fn resume(&self, partitions: &[TopicPartition]) -> Result<(), ClientError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        for tp in partitions {
            state.paused.remove(tp);
        }
        drop(state);
        self.broker.wakeup.notify_waiters();
        Ok(())
    }

    async fn seek(&self, id: &MessageId) -> Result<(), ClientError> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        if state.status != Some(ClientStatus::Initialized) {
            return Err(ClientError::NotConnected);
        }
        state.positions.insert(id.topic_partition(), id.offset);
        drop(state);
        self.broker.wakeup.notify_waiters();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            state.status = Some(ClientStatus::Disconnecting);
        }
        // The runtime performs its final commit before disconnecting; any
        // offsets still stored here are flushed as a safety net.
        let _ = self.commit().await;
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.status = Some(ClientStatus::Disconnected);
        Ok(())
    }

    #[allow(clippy::unwrap_used)]
    fn status(&self) -> ClientStatus {
        self.state
            .lock()
            .unwrap()
            .status
            .unwrap_or(ClientStatus::Initializing)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn record(topic: &str, key: Option<&str>, payload: &[u8]) -> ProducerRecord {
        ProducerRecord {
            topic: topic.to_string(),
            key: key.map(ToString::to_string),
            headers: HeaderMap::new(),
            payload: Some(payload.to_vec()),
        }
    }

    #[tokio::test]
    async fn produce_assigns_sequential_offsets() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 1);
        let producer = broker.producer();

        let a = producer.send(record("t", None, b"a")).await.unwrap();
        let b = producer.send(record("t", None, b"b")).await.unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 1);
        assert_eq!(broker.records("t", 0).len(), 2);
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 4);
        let producer = broker.producer();

        let first = producer.send(record("t", Some("k"), b"a")).await.unwrap();
        let second = producer.send(record("t", Some("k"), b"b")).await.unwrap();
        assert_eq!(first.partition, second.partition);
    }

    #[tokio::test]
    async fn consumer_fetches_in_order_and_commits() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 1);
        let producer = broker.producer();
        producer.send(record("t", None, b"a")).await.unwrap();
        producer.send(record("t", None, b"b")).await.unwrap();

        let consumer = broker.consumer("g", &["t"]);
        consumer.connect().await.unwrap();
        let cancel = CancellationToken::new();

        // First event is the assignment.
        assert!(matches!(
            consumer.fetch(&cancel).await.unwrap(),
            ClientEvent::PartitionsAssigned(_)
        ));
        let ClientEvent::Message(first) = consumer.fetch(&cancel).await.unwrap() else {
            panic!("expected message");
        };
        assert_eq!(first.id.offset, 0);

        consumer.store_offset(&first.id).unwrap();
        consumer.commit().await.unwrap();
        assert_eq!(broker.committed("g", &TopicPartition::new("t", 0)), Some(1));
    }

    #[tokio::test]
    async fn transactional_records_invisible_until_commit() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 1);
        let producer = broker.producer();

        TransactionalProducerClient::begin(producer.as_ref())
            .await
            .unwrap();
        ProducerClient::send(producer.as_ref(), record("t", None, b"a"))
            .await
            .unwrap();
        assert!(broker.records("t", 0).is_empty());

        TransactionalProducerClient::commit(producer.as_ref())
            .await
            .unwrap();
        assert_eq!(broker.records("t", 0).len(), 1);
    }

    #[tokio::test]
    async fn paused_partitions_are_not_fetched_until_resumed() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 1);
        broker.producer().send(record("t", None, b"a")).await.unwrap();

        let consumer = broker.consumer("g", &["t"]);
        consumer.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let _ = consumer.fetch(&cancel).await.unwrap(); // assignment event

        let tp = TopicPartition::new("t", 0);
        consumer.pause(std::slice::from_ref(&tp)).await.unwrap();
        let paused_fetch = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            consumer.fetch(&cancel),
        )
        .await;
        assert!(paused_fetch.is_err(), "paused partition must not deliver");

        consumer.resume(std::slice::from_ref(&tp)).await.unwrap();
        assert!(matches!(
            consumer.fetch(&cancel).await.unwrap(),
            ClientEvent::Message(_)
        ));
    }

    #[tokio::test]
    async fn stored_offset_loader_seeds_the_start_position() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 1);
        let producer = broker.producer();
        for payload in [b"a", b"b", b"c"] {
            producer.send(record("t", None, payload)).await.unwrap();
        }

        let store = crate::outbox::InMemoryOffsetStore::new();
        store.preload("g", TopicPartition::new("t", 0), 1);

        let consumer = broker.consumer_with_offset_store("g", &["t"], Arc::new(store));
        consumer.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let _ = consumer.fetch(&cancel).await.unwrap(); // assignment event

        // Offset 1 was the last processed one: fetching resumes at 2.
        let ClientEvent::Message(message) = consumer.fetch(&cancel).await.unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.id.offset, 2);
    }

    #[tokio::test]
    async fn cancelled_fetch_returns_not_connected() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 1);
        let consumer = broker.consumer("g", &["t"]);
        consumer.connect().await.unwrap();
        let cancel = CancellationToken::new();

        // Drain the assignment event, then cancel mid-wait.
        let _ = consumer.fetch(&cancel).await.unwrap();
        cancel.cancel();
        assert!(matches!(
            consumer.fetch(&cancel).await,
            Err(ClientError::NotConnected)
        ));
    }
}
