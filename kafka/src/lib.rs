//! Kafka broker clients for Silverback, built on rdkafka.
//!
//! This crate implements the `silverback-core` client traits against
//! Kafka-compatible brokers (Apache Kafka, Redpanda, MSK, …):
//!
//! - [`KafkaProducerClient`]: a `FutureProducer` wrapper preserving FIFO
//!   send order per `(topic, key)` and resolving each send with the broker
//!   identity; an optional transactional mode backs the Kafka-transactions
//!   produce path
//! - [`KafkaConsumerClient`]: a `StreamConsumer` wrapper with manual
//!   commits, pause/resume/seek, group subscription or static assignment
//!   seeded from a stored-offset loader, and rebalance events surfaced
//!   in-band through `fetch`
//!
//! # Delivery semantics
//!
//! At-least-once with manual commits: the runtime stores offsets only after
//! subscriber dispatch succeeded and commits at its configured cadence. A
//! crash before commit redelivers; subscribers must be idempotent.
//!
//! # Example
//!
//! ```no_run
//! use silverback_kafka::{KafkaConsumerClient, KafkaProducerClient};
//!
//! # fn example() -> Result<(), silverback_core::client::ClientError> {
//! let producer = KafkaProducerClient::builder()
//!     .brokers("localhost:9092")
//!     .acks("all")
//!     .build()?;
//!
//! let consumer = KafkaConsumerClient::builder()
//!     .brokers("localhost:9092")
//!     .group_id("orders-processor")
//!     .topics(["orders"])
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::types::RDKafkaErrorCode;
use silverback_core::client::{
    ClientError, ClientEvent, ClientStatus, ConsumerClient, ProducerClient, ProducerRecord,
    TransactionalProducerClient,
};
use silverback_core::envelope::{InboundEnvelope, MessageId, TopicPartition};
use silverback_core::headers::HeaderMap;
use silverback_core::offset_store::OffsetStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Classify an rdkafka error into the core taxonomy.
fn classify(error: &KafkaError) -> ClientError {
    let fatal = matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
                | RDKafkaErrorCode::UnsupportedVersion
                | RDKafkaErrorCode::Fatal
        )
    );
    if fatal {
        ClientError::Fatal(error.to_string())
    } else {
        ClientError::Transient(error.to_string())
    }
}

fn to_owned_headers(headers: &HeaderMap) -> OwnedHeaders {
    let mut owned = OwnedHeaders::new();
    for (name, value) in headers.iter() {
        owned = owned.insert(Header {
            key: name,
            value: Some(value.as_bytes()),
        });
    }
    owned
}

fn from_message_headers(message: &impl Message) -> HeaderMap {
    let mut map = HeaderMap::new();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            map.append(header.key.to_string(), value);
        }
    }
    map
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Builder for [`KafkaProducerClient`].
#[derive(Default)]
pub struct KafkaProducerClientBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    transactional_id: Option<String>,
    extra: Vec<(String, String)>,
}

impl KafkaProducerClientBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"`, or `"all"` (default
    /// `"all"`; idempotence requires it).
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Compression codec (`"none"`, `"lz4"`, `"zstd"`, …).
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Per-send delivery timeout (default 5 s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable Kafka transactions with the given `transactional.id`.
    #[must_use]
    pub fn transactional_id(mut self, id: impl Into<String>) -> Self {
        self.transactional_id = Some(id.into());
        self
    }

    /// Set an arbitrary librdkafka property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionFailed`] when brokers are missing
    /// or the underlying producer cannot be created.
    pub fn build(self) -> Result<KafkaProducerClient, ClientError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ClientError::ConnectionFailed("brokers not configured".to_string()))?;

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .set("acks", self.acks.as_deref().unwrap_or("all"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );
        if let Some(id) = &self.transactional_id {
            config.set("transactional.id", id);
        }
        for (key, value) in &self.extra {
            config.set(key, value);
        }

        let producer: FutureProducer = config
            .create()
            .map_err(|e| ClientError::ConnectionFailed(format!("failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            transactional = self.transactional_id.is_some(),
            "Kafka producer client created"
        );

        Ok(KafkaProducerClient {
            producer,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            transactional: self.transactional_id.is_some(),
            transactions_initialized: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        })
    }
}

/// rdkafka-backed [`ProducerClient`].
///
/// librdkafka maintains the send queue and, with idempotence enabled,
/// preserves per-partition order across retries; awaiting each delivery
/// keeps the FIFO contract visible to the runtime.
pub struct KafkaProducerClient {
    producer: FutureProducer,
    timeout: Duration,
    transactional: bool,
    transactions_initialized: AtomicBool,
    disconnected: AtomicBool,
}

impl KafkaProducerClient {
    /// Start building a producer client.
    #[must_use]
    pub fn builder() -> KafkaProducerClientBuilder {
        KafkaProducerClientBuilder::default()
    }

    async fn blocking<F>(&self, operation: F) -> Result<(), ClientError>
    where
        F: FnOnce(FutureProducer) -> KafkaResult<()> + Send + 'static,
    {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || operation(producer))
            .await
            .map_err(|e| ClientError::Fatal(format!("producer task panicked: {e}")))?
            .map_err(|e| classify(&e))
    }
}

#[async_trait]
impl ProducerClient for KafkaProducerClient {
    async fn send(&self, record: ProducerRecord) -> Result<MessageId, ClientError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }

        let headers = to_owned_headers(&record.headers);
        let mut future_record: FutureRecord<'_, String, Vec<u8>> =
            FutureRecord::to(&record.topic).headers(headers);
        if let Some(key) = &record.key {
            future_record = future_record.key(key);
        }
        if let Some(payload) = &record.payload {
            future_record = future_record.payload(payload);
        }

        match self.producer.send(future_record, self.timeout).await {
            Ok((partition, offset)) => {
                tracing::trace!(topic = %record.topic, partition, offset, "record produced");
                Ok(MessageId::new(record.topic, partition, offset))
            }
            Err((error, _message)) => Err(ClientError::Produce {
                topic: record.topic,
                reason: error.to_string(),
            }),
        }
    }

    async fn flush(&self) -> Result<(), ClientError> {
        let timeout = self.timeout;
        self.blocking(move |producer| producer.flush(timeout)).await
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let result = self.flush().await;
        self.disconnected.store(true, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl TransactionalProducerClient for KafkaProducerClient {
    async fn begin(&self) -> Result<(), ClientError> {
        if !self.transactional {
            return Err(ClientError::Unsupported(
                "producer has no transactional.id configured",
            ));
        }
        if !self.transactions_initialized.swap(true, Ordering::SeqCst) {
            let timeout = self.timeout;
            self.blocking(move |producer| producer.init_transactions(timeout))
                .await?;
        }
        self.blocking(|producer| producer.begin_transaction()).await
    }

    async fn commit(&self) -> Result<(), ClientError> {
        let timeout = self.timeout;
        self.blocking(move |producer| producer.commit_transaction(timeout))
            .await
    }

    async fn abort(&self) -> Result<(), ClientError> {
        let timeout = self.timeout;
        self.blocking(move |producer| producer.abort_transaction(timeout))
            .await
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Rebalance events observed by the librdkafka callbacks, drained by
/// `fetch` so the consume loop sees them in-band.
#[derive(Default)]
struct RebalanceQueue {
    events: Mutex<VecDeque<ClientEvent>>,
}

impl RebalanceQueue {
    fn push(&self, event: ClientEvent) {
        #[allow(clippy::unwrap_used)]
        self.events.lock().unwrap().push_back(event);
    }

    #[allow(clippy::unwrap_used)]
    fn pop(&self) -> Option<ClientEvent> {
        self.events.lock().unwrap().pop_front()
    }
}

fn tpl_to_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

struct SilverbackConsumerContext {
    rebalances: Arc<RebalanceQueue>,
}

impl ClientContext for SilverbackConsumerContext {}

impl ConsumerContext for SilverbackConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = tpl_to_partitions(tpl);
            tracing::info!(?partitions, "partitions being revoked");
            self.rebalances
                .push(ClientEvent::PartitionsRevoked(partitions));
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = tpl_to_partitions(tpl);
                tracing::info!(?partitions, "partitions assigned");
                self.rebalances
                    .push(ClientEvent::PartitionsAssigned(partitions));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(error) => {
                tracing::error!(error = %error, "rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => tracing::debug!(count = offsets.count(), "offsets committed"),
            Err(error) => tracing::warn!(error = %error, "offset commit failed"),
        }
    }
}

/// Where a statically assigned partition starts when the stored-offset
/// loader knows nothing about it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DefaultStartOffset {
    /// Start from the beginning of the partition.
    Beginning,
    /// Start from the end (only new records).
    #[default]
    End,
}

/// Builder for [`KafkaConsumerClient`].
#[derive(Default)]
pub struct KafkaConsumerClientBuilder {
    brokers: Option<String>,
    group_id: Option<String>,
    topics: Vec<String>,
    assignments: Vec<TopicPartition>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    default_start: DefaultStartOffset,
    enable_auto_commit: bool,
    auto_offset_reset: Option<String>,
    extra: Vec<(String, String)>,
}

impl KafkaConsumerClientBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Consumer group id.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Subscribe to these topics (group-managed assignment).
    #[must_use]
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Statically assign these partitions instead of subscribing. Start
    /// positions come from the stored-offset loader when one is set.
    #[must_use]
    pub fn assignments(mut self, partitions: Vec<TopicPartition>) -> Self {
        self.assignments = partitions;
        self
    }

    /// Seed static-assignment positions from this store (`stored + 1`).
    #[must_use]
    pub fn offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.offset_store = Some(store);
        self
    }

    /// Start position when the loader knows nothing (static assignment).
    #[must_use]
    pub const fn default_start(mut self, start: DefaultStartOffset) -> Self {
        self.default_start = start;
        self
    }

    /// Let the broker client auto-commit instead of the runtime's manual
    /// commit discipline.
    #[must_use]
    pub const fn enable_auto_commit(mut self) -> Self {
        self.enable_auto_commit = true;
        self
    }

    /// Where new consumer groups start reading (`"earliest"`/`"latest"`,
    /// default `"earliest"`).
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set an arbitrary librdkafka property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// Build the client. The broker session is established by
    /// [`ConsumerClient::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionFailed`] on missing brokers/group
    /// or when neither topics nor assignments are configured.
    pub fn build(self) -> Result<KafkaConsumerClient, ClientError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ClientError::ConnectionFailed("brokers not configured".to_string()))?;
        let group_id = self
            .group_id
            .ok_or_else(|| ClientError::ConnectionFailed("group.id not configured".to_string()))?;
        if self.topics.is_empty() && self.assignments.is_empty() {
            return Err(ClientError::ConnectionFailed(
                "neither topics nor assignments configured".to_string(),
            ));
        }

        Ok(KafkaConsumerClient {
            brokers,
            group_id,
            topics: self.topics,
            assignments: self.assignments,
            offset_store: self.offset_store,
            default_start: self.default_start,
            enable_auto_commit: self.enable_auto_commit,
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            extra: self.extra,
            rebalances: Arc::new(RebalanceQueue::default()),
            consumer: Mutex::new(None),
            status: Mutex::new(ClientStatus::Initializing),
        })
    }
}

/// rdkafka-backed [`ConsumerClient`].
pub struct KafkaConsumerClient {
    brokers: String,
    group_id: String,
    topics: Vec<String>,
    assignments: Vec<TopicPartition>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    default_start: DefaultStartOffset,
    enable_auto_commit: bool,
    auto_offset_reset: String,
    extra: Vec<(String, String)>,
    rebalances: Arc<RebalanceQueue>,
    consumer: Mutex<Option<Arc<StreamConsumer<SilverbackConsumerContext>>>>,
    status: Mutex<ClientStatus>,
}

impl KafkaConsumerClient {
    /// Start building a consumer client.
    #[must_use]
    pub fn builder() -> KafkaConsumerClientBuilder {
        KafkaConsumerClientBuilder::default()
    }

    fn set_status(&self, status: ClientStatus) {
        #[allow(clippy::unwrap_used)]
        {
            *self.status.lock().unwrap() = status;
        }
    }

    #[allow(clippy::unwrap_used)]
    fn current(&self) -> Result<Arc<StreamConsumer<SilverbackConsumerContext>>, ClientError> {
        self.consumer
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    async fn static_assignment(&self) -> Result<TopicPartitionList, ClientError> {
        let mut tpl = TopicPartitionList::new();
        for tp in &self.assignments {
            let stored = match &self.offset_store {
                Some(store) => store
                    .load(&self.group_id, tp)
                    .await
                    .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?,
                None => None,
            };
            let offset = match (stored, self.default_start) {
                (Some(processed), _) => Offset::Offset(processed + 1),
                (None, DefaultStartOffset::Beginning) => Offset::Beginning,
                (None, DefaultStartOffset::End) => Offset::End,
            };
            tpl.add_partition_offset(&tp.topic, tp.partition, offset)
                .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        }
        Ok(tpl)
    }
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    async fn connect(&self) -> Result<(), ClientError> {
        {
            #[allow(clippy::unwrap_used)]
            let consumer = self.consumer.lock().unwrap();
            if consumer.is_some() {
                // Reconnect after a transient failure: librdkafka already
                // retries internally, a live handle is kept as-is.
                self.set_status(ClientStatus::Initialized);
                return Ok(());
            }
        }
        self.set_status(ClientStatus::Initializing);

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set(
                "enable.auto.commit",
                if self.enable_auto_commit { "true" } else { "false" },
            )
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false");
        for (key, value) in &self.extra {
            config.set(key, value);
        }

        let context = SilverbackConsumerContext {
            rebalances: Arc::clone(&self.rebalances),
        };
        let consumer: StreamConsumer<SilverbackConsumerContext> = config
            .create_with_context(context)
            .map_err(|e| ClientError::ConnectionFailed(format!("failed to create consumer: {e}")))?;

        if self.assignments.is_empty() {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topics)
                .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        } else {
            let tpl = self.static_assignment().await?;
            consumer
                .assign(&tpl)
                .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
            self.rebalances
                .push(ClientEvent::PartitionsAssigned(self.assignments.clone()));
        }

        #[allow(clippy::unwrap_used)]
        {
            *self.consumer.lock().unwrap() = Some(Arc::new(consumer));
        }
        self.set_status(ClientStatus::Initialized);
        tracing::info!(
            group = %self.group_id,
            topics = ?self.topics,
            static_assignments = self.assignments.len(),
            "Kafka consumer connected"
        );
        Ok(())
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<ClientEvent, ClientError> {
        let consumer = self.current()?;
        if let Some(event) = self.rebalances.pop() {
            return Ok(event);
        }
        tokio::select! {
            () = cancel.cancelled() => Err(ClientError::NotConnected),
            received = consumer.recv() => {
                let message = received.map_err(|e| classify(&e))?;
                let envelope = InboundEnvelope {
                    id: MessageId::new(message.topic(), message.partition(), message.offset()),
                    key: message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned()),
                    headers: from_message_headers(&message),
                    payload: message.payload().map(<[u8]>::to_vec),
                };
                // Callbacks may have queued a rebalance while we waited;
                // deliver it before the message to keep revocations ahead
                // of post-revocation fetches.
                if let Some(event) = self.rebalances.pop() {
                    self.rebalances.push(ClientEvent::Message(envelope));
                    return Ok(event);
                }
                Ok(ClientEvent::Message(envelope))
            }
        }
    }

    fn store_offset(&self, id: &MessageId) -> Result<(), ClientError> {
        let consumer = self.current()?;
        // Committed offsets are next-to-read.
        consumer
            .store_offset(&id.topic, id.partition, id.offset + 1)
            .map_err(|e| classify(&e))
    }

    async fn commit(&self) -> Result<(), ClientError> {
        let consumer = self.current()?;
        tokio::task::spawn_blocking(move || {
            consumer.commit_consumer_state(CommitMode::Sync)
        })
        .await
        .map_err(|e| ClientError::Fatal(format!("commit task panicked: {e}")))?
        .map_err(|e| ClientError::Commit(e.to_string()))
    }

    async fn pause(&self, partitions: &[TopicPartition]) -> Result<(), ClientError> {
        let consumer = self.current()?;
        let mut tpl = TopicPartitionList::new();
        for tp in partitions {
            tpl.add_partition(&tp.topic, tp.partition);
        }
        consumer.pause(&tpl).map_err(|e| classify(&e))
    }

    async fn resume(&self, partitions: &[TopicPartition]) -> Result<(), ClientError> {
        let consumer = self.current()?;
        let mut tpl = TopicPartitionList::new();
        for tp in partitions {
            tpl.add_partition(&tp.topic, tp.partition);
        }
        consumer.resume(&tpl).map_err(|e| classify(&e))
    }

    async fn seek(&self, id: &MessageId) -> Result<(), ClientError> {
        let consumer = self.current()?;
        consumer
            .seek(
                &id.topic,
                id.partition,
                Offset::Offset(id.offset),
                Duration::from_secs(5),
            )
            .map_err(|e| classify(&e))
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.set_status(ClientStatus::Disconnecting);
        #[allow(clippy::unwrap_used)]
        let consumer = self.consumer.lock().unwrap().take();
        let result = match consumer {
            Some(consumer) if !self.enable_auto_commit => {
                // One final commit of whatever offsets are stored.
                tokio::task::spawn_blocking(move || {
                    consumer.commit_consumer_state(CommitMode::Sync)
                })
                .await
                .map_err(|e| ClientError::Fatal(format!("commit task panicked: {e}")))?
                .or_else(|e| {
                    // Nothing stored is not an error on shutdown.
                    if e.rdkafka_error_code() == Some(RDKafkaErrorCode::NoOffset) {
                        Ok(())
                    } else {
                        Err(ClientError::Commit(e.to_string()))
                    }
                })
            }
            _ => Ok(()),
        };
        self.set_status(ClientStatus::Disconnected);
        tracing::info!(group = %self.group_id, "Kafka consumer disconnected");
        result
    }

    #[allow(clippy::unwrap_used)]
    fn status(&self) -> ClientStatus {
        *self.status.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_are_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaProducerClient>();
        assert_sync::<KafkaProducerClient>();
        assert_send::<KafkaConsumerClient>();
        assert_sync::<KafkaConsumerClient>();
    }

    #[test]
    fn producer_builder_requires_brokers() {
        assert!(matches!(
            KafkaProducerClient::builder().build(),
            Err(ClientError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn consumer_builder_requires_a_source() {
        let result = KafkaConsumerClient::builder()
            .brokers("localhost:9092")
            .group_id("g")
            .build();
        assert!(matches!(result, Err(ClientError::ConnectionFailed(_))));

        assert!(
            KafkaConsumerClient::builder()
                .brokers("localhost:9092")
                .group_id("g")
                .topics(["orders"])
                .build()
                .is_ok()
        );
    }

    #[test]
    fn error_classification() {
        let transient = KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure);
        assert!(classify(&transient).is_transient());

        let fatal = KafkaError::MessageConsumption(RDKafkaErrorCode::SaslAuthenticationFailed);
        assert!(matches!(classify(&fatal), ClientError::Fatal(_)));
    }

    #[test]
    fn header_conversion_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.set("x-message-type", "OrderPlaced.v1");
        headers.append("x-tag", "a");
        headers.append("x-tag", "b");

        let owned = to_owned_headers(&headers);
        assert_eq!(owned.count(), 3);
    }
}
