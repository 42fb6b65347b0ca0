//! # Silverback Runtime
//!
//! The execution half of the Silverback broker-integration framework: the
//! producer pipeline with its direct and outbox strategies, the consumer
//! with per-partition channels and sequence reassembly, offset tracking and
//! commit discipline, the declarative error-policy engine, and the
//! transactional outbox worker.
//!
//! ## Producing
//!
//! ```ignore
//! let publisher = Publisher::new();
//! publisher.register(Arc::new(Producer::new(endpoint, client, None)?)).await?;
//! publisher.publish(OrderPlaced { .. }).await?;
//! ```
//!
//! ## Consuming
//!
//! ```ignore
//! let consumer = Consumer::builder(client)
//!     .endpoint(endpoint)
//!     .subscribers(subscribers)
//!     .options(ConsumerOptions::default())
//!     .build()?;
//! consumer.start().await?;
//! ```
//!
//! ## Relaying the outbox
//!
//! ```ignore
//! let worker = OutboxWorker::new(store, publisher, lock, OutboxWorkerOptions::default());
//! worker.run(cancel).await?;
//! ```

pub mod consumer;
pub mod encryption;
pub mod outbox_worker;
pub mod producer;

pub use consumer::{Consumer, ConsumerBuilder, ConsumerOptions, ConsumerStatus};
pub use outbox_worker::{OutboxWorker, OutboxWorkerOptions};
pub use producer::pipeline::{ProduceContext, ProducerBehavior};
pub use producer::{Producer, Publisher};
