//! Producers, routing, and the publish surface.
//!
//! A [`Producer`] binds one endpoint configuration to a broker client (and,
//! for outbox endpoints, an outbox store) and runs the behavior chain. The
//! [`Publisher`] is the in-process publish surface: it routes each message
//! to every matching producer and dispatches one envelope per producer.
//!
//! # Example
//!
//! ```ignore
//! let publisher = Publisher::new();
//! publisher.register(Arc::new(Producer::new(endpoint, client, None)?)).await?;
//!
//! publisher.publish(OrderPlaced { order_id, total_cents }).await?;
//! publisher.publish_tombstone::<OrderPlaced>("order-42").await?;
//! ```

pub mod chunk;
pub mod pipeline;
mod strategy;

use pipeline::{Pipeline, ProduceContext, ProducerBehavior, SORT_CHUNK, SORT_ENCRYPT};
use silverback_core::client::{ProducerClient, ProducerRecord};
use silverback_core::endpoint::{EndpointConfiguration, ProduceStrategyKind};
use silverback_core::envelope::{MessageId, OutboundEnvelope};
use silverback_core::error::{ConfigError, ProduceError};
use silverback_core::headers::{HeaderMap, names};
use silverback_core::message::{Message, Tombstone, WithHeaders};
use silverback_core::outbox::{OutboxRecord, OutboxStore, OutboxTransaction};
use silverback_core::registry::{EndpointRegistry, RoutingError};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A producer bound to one endpoint.
pub struct Producer {
    endpoint: Arc<EndpointConfiguration>,
    client: Arc<dyn ProducerClient>,
    outbox: Option<Arc<dyn OutboxStore>>,
    pipeline: Pipeline,
}

impl Producer {
    /// Create a producer for `endpoint`.
    ///
    /// The broker client is always required: outbox endpoints use it when
    /// the worker relays their rows.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when the endpoint uses the outbox
    /// strategy but no outbox store is given.
    pub fn new(
        endpoint: Arc<EndpointConfiguration>,
        client: Arc<dyn ProducerClient>,
        outbox: Option<Arc<dyn OutboxStore>>,
    ) -> Result<Self, ConfigError> {
        Self::with_behaviors(endpoint, client, outbox, Vec::new())
    }

    /// Create a producer with custom behaviors merged into the chain.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when the endpoint uses the outbox
    /// strategy but no outbox store is given.
    pub fn with_behaviors(
        endpoint: Arc<EndpointConfiguration>,
        client: Arc<dyn ProducerClient>,
        outbox: Option<Arc<dyn OutboxStore>>,
        behaviors: Vec<Arc<dyn ProducerBehavior>>,
    ) -> Result<Self, ConfigError> {
        if endpoint.strategy() == ProduceStrategyKind::Outbox && outbox.is_none() {
            return Err(ConfigError::Missing("outbox store"));
        }
        Ok(Self {
            endpoint,
            client,
            outbox,
            pipeline: Pipeline::new(&behaviors),
        })
    }

    /// The endpoint this producer is bound to.
    #[must_use]
    pub fn endpoint(&self) -> &Arc<EndpointConfiguration> {
        &self.endpoint
    }

    /// Run the chain and produce `envelope` according to the endpoint's
    /// strategy.
    ///
    /// Returns the broker identities of the produced records; empty for
    /// outbox endpoints, where the worker produces later.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError`] with the failing stage annotated.
    pub async fn produce(&self, envelope: OutboundEnvelope) -> Result<Vec<MessageId>, ProduceError> {
        let mut ctx = ProduceContext::new(envelope);
        self.pipeline.run(&mut ctx, 0, SORT_ENCRYPT).await?;

        match self.endpoint.strategy() {
            ProduceStrategyKind::Direct => {
                self.pipeline.run(&mut ctx, SORT_ENCRYPT, SORT_CHUNK).await?;
                let produced =
                    strategy::send_records(self.client.as_ref(), std::mem::take(&mut ctx.records))
                        .await?;
                tracing::debug!(
                    endpoint = self.endpoint.name(),
                    message_type = %ctx.message_type,
                    records = produced.len(),
                    "produced directly"
                );
                Ok(produced)
            }
            ProduceStrategyKind::Outbox => {
                let record = strategy::to_outbox_record(&ctx)?;
                self.outbox_store()?.append(record).await?;
                tracing::debug!(
                    endpoint = self.endpoint.name(),
                    message_type = %ctx.message_type,
                    "appended to outbox"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Run the chain and append the envelope to `tx`, enlisting the append
    /// with the caller's transaction. The row becomes visible to the outbox
    /// worker only when the caller commits.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError`] with the failing stage annotated.
    pub async fn produce_enlisted(
        &self,
        tx: &mut dyn OutboxTransaction,
        envelope: OutboundEnvelope,
    ) -> Result<(), ProduceError> {
        let mut ctx = ProduceContext::new(envelope);
        self.pipeline.run(&mut ctx, 0, SORT_ENCRYPT).await?;
        let record = strategy::to_outbox_record(&ctx)?;
        tx.append(record).await?;
        Ok(())
    }

    /// Relay a stored outbox row: run the remaining chain stages (chunking)
    /// and send directly to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError`] when the row is corrupt or the broker
    /// rejects a record; the worker retains the row and retries.
    pub async fn relay_stored(&self, row: &OutboxRecord) -> Result<Vec<MessageId>, ProduceError> {
        let mut headers = row
            .decode_headers()
            .map_err(ProduceError::Outbox)?;
        let key = headers.get(names::RECORD_KEY).map(ToString::to_string);
        headers.remove(names::RECORD_KEY);

        let envelope = match &row.content {
            Some(content) => OutboundEnvelope::for_raw(
                content.clone(),
                row.message_type.clone().unwrap_or_default(),
                Arc::clone(&self.endpoint),
                key,
                headers,
            ),
            None => {
                let mut envelope = OutboundEnvelope::tombstone(
                    row.message_type.clone().unwrap_or_default(),
                    Arc::clone(&self.endpoint),
                    key.unwrap_or_default(),
                );
                envelope.headers = headers;
                envelope
            }
        };

        let mut ctx = ProduceContext::new(envelope);
        self.pipeline.run(&mut ctx, SORT_ENCRYPT, SORT_CHUNK).await?;
        strategy::send_records(self.client.as_ref(), std::mem::take(&mut ctx.records)).await
    }

    /// Send one already-built record straight to the broker, bypassing the
    /// chain. Used by the move error policy.
    ///
    /// # Errors
    ///
    /// Returns the client error when the broker rejects the record.
    pub async fn send_raw(&self, record: ProducerRecord) -> Result<MessageId, ProduceError> {
        Ok(self.client.send(record).await?)
    }

    fn outbox_store(&self) -> Result<&Arc<dyn OutboxStore>, ProduceError> {
        self.outbox.as_ref().ok_or_else(|| {
            ProduceError::Outbox(silverback_core::outbox::OutboxError::Database(
                "endpoint has no outbox store".to_string(),
            ))
        })
    }
}

/// The in-process publish surface: routes messages to producers.
///
/// Tombstones and header-wrapped messages route as their inner type.
/// Producers flagged non-routable are skipped by type routing but stay
/// reachable by endpoint or friendly name.
#[derive(Default)]
pub struct Publisher {
    registry: RwLock<EndpointRegistry<Arc<Producer>>>,
}

impl Publisher {
    /// Create an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::DuplicateEndpoint`] or
    /// [`RoutingError::DuplicateFriendlyName`] on name collisions.
    pub async fn register(&self, producer: Arc<Producer>) -> Result<(), RoutingError> {
        let config = Arc::clone(producer.endpoint());
        self.registry.write().await.register(config, producer)
    }

    /// Look up a producer by endpoint or friendly name.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ProducerNotFound`] when nothing matches.
    pub async fn find(&self, name: &str) -> Result<Arc<Producer>, RoutingError> {
        self.registry.read().await.find_by_name(name).map(|(_, p)| p)
    }

    /// Publish a message to every matching producer.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NoRoute`] (as a [`ProduceError`]) when no
    /// routable producer is bound to the message type, or the first
    /// pipeline error encountered.
    pub async fn publish<M: Message>(&self, message: M) -> Result<Vec<MessageId>, ProduceError> {
        self.publish_with_headers(message, HeaderMap::new()).await
    }

    /// Publish a message with extra outbound headers.
    ///
    /// # Errors
    ///
    /// As [`publish`](Self::publish).
    pub async fn publish_with_headers<M: Message>(
        &self,
        message: M,
        headers: HeaderMap,
    ) -> Result<Vec<MessageId>, ProduceError> {
        let message = Arc::new(message);
        let targets = self.routes_for(M::message_type()).await?;
        let mut produced = Vec::new();
        for producer in targets {
            let envelope = OutboundEnvelope::for_message(
                &message,
                Arc::clone(producer.endpoint()),
                None,
                headers.clone(),
            );
            produced.extend(producer.produce(envelope).await?);
        }
        Ok(produced)
    }

    /// Publish a header-wrapped message; routes as the inner type.
    ///
    /// # Errors
    ///
    /// As [`publish`](Self::publish).
    pub async fn publish_wrapped<M: Message>(
        &self,
        wrapped: WithHeaders<M>,
    ) -> Result<Vec<MessageId>, ProduceError> {
        let (message, headers) = wrapped.into_parts();
        self.publish_with_headers(message, headers).await
    }

    /// Publish a tombstone; routes as the inner type.
    ///
    /// # Errors
    ///
    /// As [`publish`](Self::publish).
    pub async fn publish_tombstone<M: Message>(
        &self,
        tombstone: Tombstone<M>,
    ) -> Result<Vec<MessageId>, ProduceError> {
        let targets = self.routes_for(M::message_type()).await?;
        let mut produced = Vec::new();
        for producer in targets {
            let envelope = OutboundEnvelope::tombstone(
                M::message_type(),
                Arc::clone(producer.endpoint()),
                tombstone.key().to_string(),
            );
            produced.extend(producer.produce(envelope).await?);
        }
        Ok(produced)
    }

    /// Publish a message to one producer selected by endpoint or friendly
    /// name, regardless of its routing flag.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ProducerNotFound`] (as a [`ProduceError`])
    /// when nothing matches, or the pipeline error.
    pub async fn publish_to<M: Message>(
        &self,
        name: &str,
        message: M,
    ) -> Result<Vec<MessageId>, ProduceError> {
        let producer = self.find(name).await.map_err(ProduceError::Routing)?;
        let envelope = OutboundEnvelope::for_message(
            &Arc::new(message),
            Arc::clone(producer.endpoint()),
            None,
            HeaderMap::new(),
        );
        producer.produce(envelope).await
    }

    /// Publish a message inside the caller's outbox transaction. Routed
    /// like [`publish`](Self::publish); every matched producer appends to
    /// `tx`.
    ///
    /// # Errors
    ///
    /// As [`publish`](Self::publish).
    pub async fn publish_enlisted<M: Message>(
        &self,
        tx: &mut dyn OutboxTransaction,
        message: M,
    ) -> Result<(), ProduceError> {
        let message = Arc::new(message);
        let targets = self.routes_for(M::message_type()).await?;
        for producer in targets {
            let envelope = OutboundEnvelope::for_message(
                &message,
                Arc::clone(producer.endpoint()),
                None,
                HeaderMap::new(),
            );
            producer.produce_enlisted(tx, envelope).await?;
        }
        Ok(())
    }

    async fn routes_for(&self, message_type: &str) -> Result<Vec<Arc<Producer>>, ProduceError> {
        let targets: Vec<_> = self
            .registry
            .read()
            .await
            .routable_for_type(message_type)
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        if targets.is_empty() {
            return Err(ProduceError::Routing(RoutingError::NoRoute(
                message_type.to_string(),
            )));
        }
        Ok(targets)
    }
}
