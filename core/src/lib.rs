//! # Silverback Core
//!
//! Core traits and types for the Silverback broker-integration framework.
//!
//! Silverback bridges an in-process publish/subscribe surface with external
//! message brokers. This crate holds the broker-neutral model the pipelines
//! operate on; the pipelines themselves live in `silverback-runtime`, the
//! Kafka client in `silverback-kafka`, the durable stores in
//! `silverback-postgres`, and deterministic test doubles in
//! `silverback-testing`.
//!
//! ## Core concepts
//!
//! - **Envelope**: the record carrying a message plus metadata through the
//!   producer and consumer pipelines ([`envelope`])
//! - **Endpoint**: a logical destination or source plus its immutable
//!   configuration ([`endpoint`])
//! - **Registry**: resolves messages to producers by type, endpoint name, or
//!   friendly name ([`registry`])
//! - **Subscribers**: an explicit registry mapping message types to handlers
//!   ([`subscriber`])
//! - **Clients**: the broker abstraction producers and consumers talk to
//!   ([`client`])
//! - **Outbox / offsets / locks**: durable-store traits backing the
//!   transactional outbox and static assignment ([`outbox`],
//!   [`offset_store`])
//! - **Error policies**: declarative retry/skip/move/stop rules ([`policy`])
//!
//! ## Delivery semantics
//!
//! The core guarantees at-least-once delivery with strict per-partition
//! ordering: within a partition, envelopes flow from fetch through
//! subscriber dispatch to offset commit in arrival order, and an offset is
//! committed only after every envelope at or below it has been fully
//! processed. Across partitions there is no ordering promise.

pub mod client;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod headers;
pub mod message;
pub mod offset_store;
pub mod outbox;
pub mod policy;
pub mod registry;
pub mod serializer;
pub mod subscriber;

pub use client::{ClientError, ClientStatus, ConsumerCallbacks, ConsumerClient, ProducerClient};
pub use endpoint::{EndpointConfiguration, ProduceStrategyKind, ValidationMode};
pub use envelope::{DeliveredMessage, InboundEnvelope, MessageId, OutboundEnvelope, TopicPartition};
pub use error::{ConsumeError, ProduceError, SequenceAbortReason, SubscriberError};
pub use headers::HeaderMap;
pub use message::Message;
pub use policy::ErrorPolicy;
pub use serializer::Serializer;
pub use subscriber::{Delivery, Subscriber, SubscriberRegistry};
