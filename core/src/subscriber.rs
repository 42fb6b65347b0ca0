//! Subscriber registry and delivery types.
//!
//! Instead of scanning user types for handler methods at runtime, the core
//! keeps an explicit registry mapping message type names to handlers.
//! Exclusivity is per-handler metadata: exclusive subscribers run one at a
//! time in registration order, everything else runs concurrently.
//!
//! # Example
//!
//! ```
//! use silverback_core::subscriber::{Delivery, Subscriber, SubscriberRegistry};
//! use silverback_core::error::SubscriberError;
//! use async_trait::async_trait;
//!
//! struct AuditLog;
//!
//! #[async_trait]
//! impl Subscriber for AuditLog {
//!     async fn handle(&self, delivery: Delivery) -> Result<(), SubscriberError> {
//!         if let Delivery::Single(message) = delivery {
//!             println!("audited {}", message.id);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = SubscriberRegistry::new();
//! registry.subscribe("OrderPlaced.v1", std::sync::Arc::new(AuditLog));
//! assert_eq!(registry.handlers_for("OrderPlaced.v1").len(), 1);
//! ```

use crate::envelope::DeliveredMessage;
use crate::error::SubscriberError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An open-ended stream of delivered messages.
///
/// Handed to a subscriber once per stream sequence; items arrive for as long
/// as the partition stays assigned. The stream ends (`next` returns `None`)
/// when the sequence completes or aborts.
#[derive(Debug)]
pub struct DeliveryStream {
    receiver: mpsc::Receiver<DeliveredMessage>,
}

impl DeliveryStream {
    /// Create a stream and its feeding half.
    ///
    /// `capacity` bounds how far the reader may run ahead of the subscriber.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<DeliveredMessage>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self { receiver })
    }

    /// Receive the next message, or `None` when the stream ended.
    pub async fn next(&mut self) -> Option<DeliveredMessage> {
        self.receiver.recv().await
    }
}

/// What a subscriber invocation receives.
#[derive(Debug)]
pub enum Delivery {
    /// One message.
    Single(DeliveredMessage),
    /// A batch accumulated by the endpoint's batch settings.
    Batch(Vec<DeliveredMessage>),
    /// An open-ended stream for the lifetime of the partition assignment.
    Stream(DeliveryStream),
}

/// A message handler.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriberError`] to route the envelope (or the whole
    /// sequence) through the endpoint's error policy.
    async fn handle(&self, delivery: Delivery) -> Result<(), SubscriberError>;
}

/// A registered handler plus its dispatch metadata.
#[derive(Clone)]
pub struct Registration {
    /// The handler.
    pub subscriber: Arc<dyn Subscriber>,
    /// Exclusive handlers run sequentially, in registration order, before
    /// the concurrent group.
    pub exclusive: bool,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

/// Maps message type names to the handlers subscribed to them.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    by_type: HashMap<String, Vec<Registration>>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to a message type.
    pub fn subscribe(&mut self, message_type: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
        self.by_type
            .entry(message_type.into())
            .or_default()
            .push(Registration {
                subscriber,
                exclusive: false,
            });
    }

    /// Subscribe an exclusive handler to a message type.
    pub fn subscribe_exclusive(
        &mut self,
        message_type: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
    ) {
        self.by_type
            .entry(message_type.into())
            .or_default()
            .push(Registration {
                subscriber,
                exclusive: true,
            });
    }

    /// Handlers registered for `message_type`, in registration order.
    #[must_use]
    pub fn handlers_for(&self, message_type: &str) -> &[Registration] {
        self.by_type
            .get(message_type)
            .map_or(&[], Vec::as_slice)
    }

    /// `true` when no handler is registered for `message_type`.
    #[must_use]
    pub fn is_unhandled(&self, message_type: &str) -> bool {
        self.handlers_for(message_type).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl Subscriber for Nop {
        async fn handle(&self, _delivery: Delivery) -> Result<(), SubscriberError> {
            Ok(())
        }
    }

    #[test]
    fn handlers_keep_registration_order_and_metadata() {
        let mut registry = SubscriberRegistry::new();
        registry.subscribe("Ping.v1", Arc::new(Nop));
        registry.subscribe_exclusive("Ping.v1", Arc::new(Nop));
        registry.subscribe("Ping.v1", Arc::new(Nop));

        let handlers = registry.handlers_for("Ping.v1");
        assert_eq!(handlers.len(), 3);
        assert!(!handlers[0].exclusive);
        assert!(handlers[1].exclusive);
        assert!(!handlers[2].exclusive);

        assert!(registry.is_unhandled("Pong.v1"));
    }

    #[tokio::test]
    async fn delivery_stream_ends_when_sender_drops() {
        let (sender, mut stream) = DeliveryStream::channel(4);
        drop(sender);
        assert!(stream.next().await.is_none());
    }
}
