//! Per-partition channels and their reader tasks.
//!
//! A single consume loop writes every fetched envelope into the bounded
//! channel of its partition (or into one shared channel in
//! process-all-partitions-together mode). Each channel has one reader task
//! that owns the partition's sequence state and drives the unit pipeline:
//! reassemble, decrypt, deserialize, validate, form batches or streams,
//! dispatch, and hand offsets to the tracker.
//!
//! The channel bound is the consumer's back-pressure: when a reader falls
//! behind, the fetch loop blocks on the channel write, keeping in-flight
//! envelopes close to the broker for rebalance safety.

use crate::consumer::offsets::OffsetTracker;
use crate::consumer::pipeline::{dispatch, finish_unit};
use crate::consumer::sequence::{AbortedSequence, PushOutcome, SequenceStore};
use crate::consumer::ConsumerOptions;
use crate::producer::Publisher;
use silverback_core::client::{ConsumerCallbacks, ConsumerClient, ProducerRecord};
use silverback_core::endpoint::EndpointConfiguration;
use silverback_core::envelope::{DeliveredMessage, InboundEnvelope, MessageId, TopicPartition};
use silverback_core::error::{ConsumeError, SequenceAbortReason};
use silverback_core::headers::names;
use silverback_core::offset_store::OffsetStore;
use silverback_core::policy::PolicyAction;
use silverback_core::subscriber::{Delivery, DeliveryStream, SubscriberRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One item flowing through a channel.
pub(crate) enum ReaderItem {
    /// A fetched raw envelope.
    Envelope(InboundEnvelope),
    /// In-band revocation marker (process-all-partitions-together mode).
    Revoke(Vec<TopicPartition>),
}

/// Terminal-error slot readers use to stop the whole consumer.
#[derive(Default)]
pub(crate) struct FatalSignal {
    notify: Notify,
    slot: std::sync::Mutex<Option<ConsumeError>>,
}

impl FatalSignal {
    pub(crate) fn signal(&self, error: ConsumeError) {
        #[allow(clippy::unwrap_used)]
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.notify.notify_waiters();
    }

    #[allow(clippy::unwrap_used)]
    pub(crate) fn take(&self) -> Option<ConsumeError> {
        self.slot.lock().unwrap().take()
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// State shared by the consume loop and every reader task.
pub(crate) struct ReaderShared {
    pub endpoints: HashMap<String, Arc<EndpointConfiguration>>,
    pub subscribers: Arc<SubscriberRegistry>,
    pub tracker: Arc<OffsetTracker>,
    pub client: Arc<dyn ConsumerClient>,
    pub callbacks: Arc<dyn ConsumerCallbacks>,
    pub publisher: Option<Arc<Publisher>>,
    pub offset_store: Option<Arc<dyn OffsetStore>>,
    pub group_id: String,
    pub options: ConsumerOptions,
    pub fatal: FatalSignal,
    commit_lock: Mutex<()>,
}

impl ReaderShared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        endpoints: HashMap<String, Arc<EndpointConfiguration>>,
        subscribers: Arc<SubscriberRegistry>,
        tracker: Arc<OffsetTracker>,
        client: Arc<dyn ConsumerClient>,
        callbacks: Arc<dyn ConsumerCallbacks>,
        publisher: Option<Arc<Publisher>>,
        offset_store: Option<Arc<dyn OffsetStore>>,
        group_id: String,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            endpoints,
            subscribers,
            tracker,
            client,
            callbacks,
            publisher,
            offset_store,
            group_id,
            options,
            fatal: FatalSignal::default(),
            commit_lock: Mutex::new(()),
        }
    }

    /// Flush the tracker's committable offsets to the broker.
    ///
    /// Serialized behind a mutex; safe to call from any reader and from the
    /// commit ticker.
    pub(crate) async fn commit(&self) -> Result<(), ConsumeError> {
        let _guard = self.commit_lock.lock().await;
        let batch = self.tracker.pending_commits();
        if batch.is_empty() {
            return Ok(());
        }
        for id in &batch {
            self.client.store_offset(id)?;
        }
        match self.client.commit().await {
            Ok(()) => {
                self.tracker.confirm(&batch);
                let results: Vec<_> = batch
                    .iter()
                    .map(|id| (id.topic_partition(), Ok(id.offset)))
                    .collect();
                self.callbacks.on_offsets_committed(&results);
                if let Some(store) = &self.offset_store {
                    for id in &batch {
                        if let Err(error) = store.store(&self.group_id, id).await {
                            tracing::warn!(id = %id, error = %error, "failed to persist stored offset");
                        }
                    }
                }
                Ok(())
            }
            Err(error) => {
                let results: Vec<_> = batch
                    .iter()
                    .map(|id| (id.topic_partition(), Err(error.clone())))
                    .collect();
                self.callbacks.on_offsets_committed(&results);
                Err(ConsumeError::Client(error))
            }
        }
    }
}

struct Channel {
    sender: mpsc::Sender<ReaderItem>,
    cancel: CancellationToken,
    revoked: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Owns the per-partition channels and reader tasks.
pub(crate) struct ChannelsManager {
    shared: Arc<ReaderShared>,
    cancel: CancellationToken,
    channels: HashMap<Option<TopicPartition>, Channel>,
}

impl ChannelsManager {
    pub(crate) fn new(shared: Arc<ReaderShared>, cancel: CancellationToken) -> Self {
        Self {
            shared,
            cancel,
            channels: HashMap::new(),
        }
    }

    /// Route one fetched envelope to its channel, creating the channel and
    /// reader lazily. Blocks when the channel is full (back-pressure).
    pub(crate) async fn dispatch(&mut self, envelope: InboundEnvelope) -> Result<(), ConsumeError> {
        self.shared.tracker.observe(&envelope.id);
        let key = if self.shared.options.process_all_partitions_together {
            None
        } else {
            Some(envelope.id.topic_partition())
        };
        let channel = self.channels.entry(key).or_insert_with(|| {
            spawn_channel(Arc::clone(&self.shared), self.cancel.child_token())
        });
        if channel.sender.send(ReaderItem::Envelope(envelope)).await.is_err() {
            // The reader aborted; its error (if any) is in the fatal slot.
            return Err(self
                .shared
                .fatal
                .take()
                .unwrap_or_else(|| ConsumeError::Fatal("channel reader stopped".to_string())));
        }
        Ok(())
    }

    /// Handle a partition revocation: abort the affected readers (or inject
    /// an in-band marker in single-channel mode) and forget tracker state.
    pub(crate) async fn revoke(&mut self, partitions: &[TopicPartition]) {
        if self.shared.options.process_all_partitions_together {
            if let Some(channel) = self.channels.get(&None) {
                let _ = channel
                    .sender
                    .send(ReaderItem::Revoke(partitions.to_vec()))
                    .await;
            }
        } else {
            for partition in partitions {
                if let Some(channel) = self.channels.remove(&Some(partition.clone())) {
                    channel.revoked.store(true, Ordering::SeqCst);
                    channel.cancel.cancel();
                    let _ = channel.task.await;
                }
            }
        }
        for partition in partitions {
            self.shared.tracker.drop_partition(partition);
        }
    }

    /// Complete all channels: close the senders and wait for each reader to
    /// finish or abort its current unit of work.
    pub(crate) async fn shutdown(&mut self) {
        let channels: Vec<_> = self.channels.drain().collect();
        for (_, channel) in channels {
            drop(channel.sender);
            let _ = channel.task.await;
        }
    }
}

fn spawn_channel(shared: Arc<ReaderShared>, cancel: CancellationToken) -> Channel {
    let (sender, receiver) = mpsc::channel(shared.options.channel_capacity.max(1));
    let revoked = Arc::new(AtomicBool::new(false));
    let reader = Reader {
        shared,
        cancel: cancel.clone(),
        revoked: Arc::clone(&revoked),
        sequences: SequenceStore::new(),
        batch: None,
        stream: None,
    };
    let task = tokio::spawn(reader.run(receiver));
    Channel {
        sender,
        cancel,
        revoked,
        task,
    }
}

struct BatchBuffer {
    endpoint: Arc<EndpointConfiguration>,
    units: Vec<Vec<InboundEnvelope>>,
    delivered: Vec<DeliveredMessage>,
    deadline: Instant,
}

struct StreamState {
    endpoint: Arc<EndpointConfiguration>,
    sender: mpsc::Sender<DeliveredMessage>,
    task: JoinHandle<Result<(), silverback_core::error::SubscriberError>>,
}

struct Reader {
    shared: Arc<ReaderShared>,
    cancel: CancellationToken,
    revoked: Arc<AtomicBool>,
    sequences: SequenceStore,
    batch: Option<BatchBuffer>,
    stream: Option<StreamState>,
}

impl Reader {
    async fn run(mut self, mut receiver: mpsc::Receiver<ReaderItem>) {
        loop {
            let deadline = match (self.sequences.deadline(), self.batch.as_ref().map(|b| b.deadline)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let idle = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let reason = self.abort_reason();
                    self.abort_all(reason).await;
                    return;
                }
                item = receiver.recv() => match item {
                    None => {
                        self.abort_all(SequenceAbortReason::Disconnect).await;
                        return;
                    }
                    Some(ReaderItem::Revoke(partitions)) => {
                        self.handle_inband_revoke(&partitions);
                        Ok(())
                    }
                    Some(ReaderItem::Envelope(envelope)) => self.process(envelope).await,
                },
                () = idle => self.handle_deadline().await,
            };

            if let Err(error) = step {
                if self.cancel.is_cancelled() {
                    let reason = self.abort_reason();
                    self.abort_all(reason).await;
                    return;
                }
                tracing::error!(error = %error, "channel reader aborting");
                self.abort_all(SequenceAbortReason::Disconnect).await;
                self.shared.fatal.signal(error);
                return;
            }
        }
    }

    fn abort_reason(&self) -> SequenceAbortReason {
        if self.revoked.load(Ordering::SeqCst) {
            SequenceAbortReason::Rebalance
        } else {
            SequenceAbortReason::Disconnect
        }
    }

    async fn process(&mut self, envelope: InboundEnvelope) -> Result<(), ConsumeError> {
        let Some(endpoint) = self.shared.endpoints.get(&envelope.id.topic).cloned() else {
            tracing::warn!(topic = %envelope.id.topic, "no endpoint configured; skipping envelope");
            self.mark_processed(&[envelope.id]).await;
            return Ok(());
        };

        let (interrupted, outcome) =
            self.sequences.push(envelope, endpoint.sequence_timeout())?;
        if let Some(aborted) = interrupted {
            self.report_abort(&aborted);
        }

        match outcome {
            PushOutcome::Buffered => Ok(()),
            PushOutcome::DroppedDuplicate(id) => {
                tracing::debug!(id = %id, "dropped duplicate chunk");
                self.mark_processed(&[id]).await;
                Ok(())
            }
            PushOutcome::DroppedMissingFirst(id) => {
                tracing::warn!(id = %id, "dropped chunk without a first fragment");
                self.mark_processed(&[id]).await;
                Ok(())
            }
            PushOutcome::ProtocolViolation(aborted) => {
                self.report_abort(&aborted);
                Ok(())
            }
            PushOutcome::Passthrough(raw) => self.handle_unit(endpoint, vec![raw]).await,
            PushOutcome::Completed(completed) => {
                self.handle_unit(endpoint, completed.raws).await
            }
        }
    }

    async fn handle_unit(
        &mut self,
        endpoint: Arc<EndpointConfiguration>,
        raws: Vec<InboundEnvelope>,
    ) -> Result<(), ConsumeError> {
        if let Some(settings) = endpoint.batch() {
            let buffer = self.batch.get_or_insert_with(|| BatchBuffer {
                endpoint: Arc::clone(&endpoint),
                units: Vec::new(),
                delivered: Vec::new(),
                deadline: Instant::now() + settings.timeout,
            });
            match finish_unit(&endpoint, &raws, unit_payload(&raws)) {
                Ok(delivered) => {
                    buffer.units.push(raws);
                    buffer.delivered.push(delivered);
                    if buffer.delivered.len() >= settings.size {
                        return self.flush_batch().await;
                    }
                    Ok(())
                }
                Err(error) => {
                    // A failing envelope fails the whole accumulating batch.
                    buffer.units.push(raws);
                    buffer.delivered.clear();
                    let buffer = self.batch.take().ok_or_else(|| {
                        ConsumeError::Fatal("batch buffer vanished".to_string())
                    })?;
                    self.run_batch_with_policy(buffer, Some(error)).await
                }
            }
        } else if endpoint.is_streaming() {
            self.handle_stream_unit(endpoint, raws).await
        } else {
            self.run_single_with_policy(endpoint, raws).await
        }
    }

    async fn handle_deadline(&mut self) -> Result<(), ConsumeError> {
        let now = Instant::now();
        if let Some(aborted) = self.sequences.check_timeout(now) {
            self.report_abort(&aborted);
        }
        if self.batch.as_ref().is_some_and(|b| now >= b.deadline) {
            return self.flush_batch().await;
        }
        Ok(())
    }

    async fn flush_batch(&mut self) -> Result<(), ConsumeError> {
        if let Some(buffer) = self.batch.take() {
            if !buffer.units.is_empty() {
                return self.run_batch_with_policy(buffer, None).await;
            }
        }
        Ok(())
    }

    /// Process one single-envelope (or chunk-group) unit under the
    /// endpoint's error policy.
    async fn run_single_with_policy(
        &mut self,
        endpoint: Arc<EndpointConfiguration>,
        mut raws: Vec<InboundEnvelope>,
    ) -> Result<(), ConsumeError> {
        let mut attempts = base_attempts(&raws);
        loop {
            let result = async {
                let delivered = finish_unit(&endpoint, &raws, unit_payload(&raws))?;
                let message_type = delivered.message_type.clone();
                dispatch(&self.shared.subscribers, &message_type, || {
                    Delivery::Single(delivered.clone())
                })
                .await
            }
            .await;
            match result {
                Ok(()) => {
                    let ids: Vec<_> = raws.iter().map(|r| r.id.clone()).collect();
                    self.mark_processed(&ids).await;
                    return Ok(());
                }
                Err(error) => {
                    match self
                        .apply_policy(&endpoint, &mut raws, &mut attempts, error)
                        .await?
                    {
                        PolicyOutcome::RetryNow => {}
                        PolicyOutcome::Settled => return Ok(()),
                    }
                }
            }
        }
    }

    /// Process an accumulated batch under the endpoint's error policy.
    ///
    /// `initial_error` is set when the batch is flushed because one of its
    /// envelopes failed the unit pipeline while accumulating.
    async fn run_batch_with_policy(
        &mut self,
        buffer: BatchBuffer,
        initial_error: Option<ConsumeError>,
    ) -> Result<(), ConsumeError> {
        let endpoint = buffer.endpoint;
        let mut units = buffer.units;
        let mut attempts = units.iter().map(|u| base_attempts(u)).max().unwrap_or(0);
        let mut pending_error = initial_error;

        loop {
            let error = match pending_error.take() {
                Some(error) => error,
                None => {
                    let result = async {
                        let mut delivered = Vec::with_capacity(units.len());
                        for raws in &units {
                            delivered.push(finish_unit(&endpoint, raws, unit_payload(raws))?);
                        }
                        dispatch(&self.shared.subscribers, endpoint.message_type(), || {
                            Delivery::Batch(delivered.clone())
                        })
                        .await
                    }
                    .await;
                    match result {
                        Ok(()) => {
                            let ids: Vec<_> = units
                                .iter()
                                .flat_map(|u| u.iter().map(|r| r.id.clone()))
                                .collect();
                            self.mark_processed(&ids).await;
                            return Ok(());
                        }
                        Err(error) => error,
                    }
                }
            };

            let mut flat: Vec<InboundEnvelope> = units.into_iter().flatten().collect();
            match self
                .apply_policy(&endpoint, &mut flat, &mut attempts, error)
                .await?
            {
                PolicyOutcome::RetryNow => {
                    // A retry re-opens a fresh sequence over the same raw
                    // envelope range.
                    units = regroup_units(flat);
                }
                PolicyOutcome::Settled => return Ok(()),
            }
        }
    }

    async fn handle_stream_unit(
        &mut self,
        endpoint: Arc<EndpointConfiguration>,
        mut raws: Vec<InboundEnvelope>,
    ) -> Result<(), ConsumeError> {
        let mut attempts = base_attempts(&raws);
        loop {
            let attempt: Result<(), ConsumeError> = async {
                let delivered = finish_unit(&endpoint, &raws, unit_payload(&raws))?;
                self.push_to_stream(&endpoint, delivered).await
            }
            .await;
            match attempt {
                Ok(()) => {
                    let ids: Vec<_> = raws.iter().map(|r| r.id.clone()).collect();
                    self.mark_processed(&ids).await;
                    return Ok(());
                }
                Err(error) => {
                    match self
                        .apply_policy(&endpoint, &mut raws, &mut attempts, error)
                        .await?
                    {
                        PolicyOutcome::RetryNow => {}
                        PolicyOutcome::Settled => return Ok(()),
                    }
                }
            }
        }
    }

    /// Hand one message to the open stream, opening it on first use and
    /// reopening it when the previous subscriber invocation completed.
    async fn push_to_stream(
        &mut self,
        endpoint: &Arc<EndpointConfiguration>,
        delivered: DeliveredMessage,
    ) -> Result<(), ConsumeError> {
        for _ in 0..2 {
            if self.stream.is_none() {
                self.stream = Some(self.open_stream(endpoint)?);
            }
            let Some(stream) = &self.stream else {
                continue;
            };
            match stream.sender.send(delivered.clone()).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    // The subscriber stopped pulling: either it returned (we
                    // reopen) or it failed (the error routes through the
                    // policy).
                    let state = self.stream.take().ok_or_else(|| {
                        ConsumeError::Fatal("stream state vanished".to_string())
                    })?;
                    match state.task.await {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => return Err(ConsumeError::Subscriber(error)),
                        Err(join_error) => {
                            return Err(ConsumeError::Fatal(format!(
                                "stream subscriber panicked: {join_error}"
                            )));
                        }
                    }
                }
            }
        }
        Err(ConsumeError::Subscriber(
            silverback_core::error::SubscriberError::new("stream subscriber keeps closing"),
        ))
    }

    fn open_stream(
        &self,
        endpoint: &Arc<EndpointConfiguration>,
    ) -> Result<StreamState, ConsumeError> {
        let handlers = self.shared.subscribers.handlers_for(endpoint.message_type());
        let Some(registration) = handlers.first() else {
            return Err(ConsumeError::Fatal(format!(
                "streaming endpoint '{}' has no subscriber",
                endpoint.name()
            )));
        };
        let capacity = self.shared.options.channel_capacity.max(1);
        let (sender, stream) = DeliveryStream::channel(capacity);
        let subscriber = Arc::clone(&registration.subscriber);
        let task = tokio::spawn(async move { subscriber.handle(Delivery::Stream(stream)).await });
        tracing::debug!(endpoint = endpoint.name(), "opened delivery stream");
        Ok(StreamState {
            endpoint: Arc::clone(endpoint),
            sender,
            task,
        })
    }

    /// Select and apply a policy step for a failed unit.
    async fn apply_policy(
        &mut self,
        endpoint: &Arc<EndpointConfiguration>,
        raws: &mut [InboundEnvelope],
        attempts: &mut u32,
        error: ConsumeError,
    ) -> Result<PolicyOutcome, ConsumeError> {
        if error.is_fatal() {
            return Err(error);
        }
        *attempts += 1;
        for raw in raws.iter_mut() {
            raw.headers.set_u32(names::FAILED_ATTEMPTS, *attempts);
        }

        let headers = raws
            .first()
            .map(|r| r.headers.clone())
            .unwrap_or_default();
        let Some(step) = endpoint.error_policy().select(&headers, &error, *attempts) else {
            return Err(error);
        };

        match step.action() {
            PolicyAction::Retry { .. } => {
                let backoff = step.backoff_for_attempt(*attempts);
                tracing::warn!(
                    endpoint = endpoint.name(),
                    attempts = *attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %error,
                    "retrying failed unit"
                );
                tokio::select! {
                    () = self.cancel.cancelled() => Err(error),
                    () = tokio::time::sleep(backoff) => Ok(PolicyOutcome::RetryNow),
                }
            }
            PolicyAction::Skip => {
                tracing::warn!(
                    endpoint = endpoint.name(),
                    attempts = *attempts,
                    error = %error,
                    "skipping failed unit"
                );
                let ids: Vec<_> = raws.iter().map(|r| r.id.clone()).collect();
                self.mark_processed(&ids).await;
                Ok(PolicyOutcome::Settled)
            }
            PolicyAction::Move { target, transform } => {
                self.move_unit(endpoint, raws, &error, target, transform.as_ref())
                    .await?;
                let ids: Vec<_> = raws.iter().map(|r| r.id.clone()).collect();
                self.mark_processed(&ids).await;
                Ok(PolicyOutcome::Settled)
            }
            PolicyAction::Stop => Err(error),
        }
    }

    /// Produce the unit's raw envelopes to the move target.
    async fn move_unit(
        &self,
        endpoint: &Arc<EndpointConfiguration>,
        raws: &[InboundEnvelope],
        error: &ConsumeError,
        target: &str,
        transform: Option<&silverback_core::policy::MoveTransform>,
    ) -> Result<(), ConsumeError> {
        let publisher = self.shared.publisher.as_ref().ok_or_else(|| {
            ConsumeError::Fatal("move policy requires a publisher".to_string())
        })?;
        let producer = publisher.find(target).await.map_err(|routing| {
            ConsumeError::Fatal(format!("move target unavailable: {routing}"))
        })?;

        for raw in raws {
            let mut headers = raw.headers.clone();
            headers.set(names::SOURCE_ENDPOINT, endpoint.name());
            headers.set(names::FAILURE_REASON, error.to_string());
            let mut payload = raw.payload.clone();
            if let Some(transform) = transform {
                transform(&mut headers, &mut payload);
            }
            producer
                .send_raw(ProducerRecord {
                    topic: producer.endpoint().name().to_string(),
                    key: raw.key.clone(),
                    headers,
                    payload,
                })
                .await
                .map_err(|produce| {
                    ConsumeError::Fatal(format!("move to '{target}' failed: {produce}"))
                })?;
        }
        tracing::info!(
            endpoint = endpoint.name(),
            target,
            envelopes = raws.len(),
            "moved failed unit"
        );
        Ok(())
    }

    async fn mark_processed(&self, ids: &[MessageId]) {
        for id in ids {
            self.shared.tracker.mark_processed(id);
        }
        let options = &self.shared.options;
        if !options.enable_auto_commit
            && self.shared.tracker.should_commit(options.commit_offset_each)
        {
            if let Err(error) = self.shared.commit().await {
                // Leave the offsets uncommitted; the next cadence retries.
                tracing::warn!(error = %error, "offset commit failed");
            }
        }
    }

    fn handle_inband_revoke(&mut self, partitions: &[TopicPartition]) {
        let affected = |id: &MessageId| partitions.iter().any(|p| *p == id.topic_partition());

        if let Some(partition) = self.sequences.partition() {
            if partitions.contains(&partition) {
                if let Some(aborted) = self.sequences.abort_active(SequenceAbortReason::Rebalance)
                {
                    self.report_abort(&aborted);
                }
            }
        }
        if self
            .batch
            .as_ref()
            .is_some_and(|b| b.units.iter().flatten().any(|r| affected(&r.id)))
        {
            self.batch = None;
            self.shared
                .callbacks
                .on_sequence_aborted("batch", &SequenceAbortReason::Rebalance);
        }
    }

    async fn abort_all(&mut self, reason: SequenceAbortReason) {
        if let Some(aborted) = self.sequences.abort_active(reason.clone()) {
            self.report_abort(&aborted);
        }
        if self.batch.take().is_some_and(|b| !b.units.is_empty()) {
            self.shared.callbacks.on_sequence_aborted("batch", &reason);
        }
        if let Some(stream) = self.stream.take() {
            tracing::debug!(endpoint = stream.endpoint.name(), "closing delivery stream");
            drop(stream.sender);
            let _ = stream.task.await;
            self.shared
                .callbacks
                .on_sequence_aborted("stream", &reason);
        }
    }

    fn report_abort(&self, aborted: &AbortedSequence) {
        tracing::warn!(
            sequence = %aborted.key,
            reason = %aborted.reason,
            collected = aborted.collected,
            "sequence aborted"
        );
        self.shared
            .callbacks
            .on_sequence_aborted(&aborted.key, &aborted.reason);
    }
}

enum PolicyOutcome {
    RetryNow,
    Settled,
}

fn unit_payload(raws: &[InboundEnvelope]) -> Option<Vec<u8>> {
    match raws {
        [single] => single.payload.clone(),
        many => Some(
            many.iter()
                .flat_map(|raw| raw.payload.as_deref().unwrap_or_default())
                .copied()
                .collect(),
        ),
    }
}

fn base_attempts(raws: &[InboundEnvelope]) -> u32 {
    raws.iter()
        .filter_map(|raw| raw.headers.get_u32(names::FAILED_ATTEMPTS).ok().flatten())
        .max()
        .unwrap_or(0)
}

/// Regroup a flattened batch back into chunk-group units by `x-message-id`.
fn regroup_units(raws: Vec<InboundEnvelope>) -> Vec<Vec<InboundEnvelope>> {
    let mut units: Vec<Vec<InboundEnvelope>> = Vec::new();
    for raw in raws {
        let group_id = raw
            .headers
            .contains(names::CHUNK_INDEX)
            .then(|| raw.headers.get(names::MESSAGE_ID).map(ToString::to_string))
            .flatten();
        match (units.last_mut(), &group_id) {
            (Some(last), Some(id))
                if last
                    .first()
                    .and_then(|r| r.headers.get(names::MESSAGE_ID))
                    == Some(id.as_str()) =>
            {
                last.push(raw);
            }
            _ => units.push(vec![raw]),
        }
    }
    units
}
