//! # Silverback Testing
//!
//! Deterministic test doubles for the Silverback broker-integration
//! framework:
//!
//! - [`InMemoryBroker`] with partition logs, consumer groups, committed
//!   offsets, transactional producing, and test-only rebalance injection
//! - [`InMemoryOutboxStore`] with real transaction visibility, plus
//!   [`InMemoryLock`] and [`InMemoryOffsetStore`]
//! - [`CapturingSubscriber`] / [`FailingSubscriber`] for dispatch
//!   assertions
//!
//! Everything implements the `silverback-core` traits, so a whole
//! produce → broker → consume round-trip runs in-process with no external
//! services.
//!
//! ## Example
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! broker.create_topic("orders", 1);
//!
//! let producer_client = broker.producer();
//! let consumer_client = broker.consumer("test-group", &["orders"]);
//! // wire them into a Publisher / Consumer from silverback-runtime
//! ```

pub mod broker;
pub mod outbox;
pub mod subscribers;

pub use broker::{InMemoryBroker, InMemoryConsumerClient, InMemoryProducerClient, StoredRecord};
pub use outbox::{InMemoryLock, InMemoryOffsetStore, InMemoryOutboxStore};
pub use subscribers::{CapturingSubscriber, FailingSubscriber};
