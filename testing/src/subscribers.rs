//! Test subscribers: counting, capturing, failing.

use async_trait::async_trait;
use silverback_core::envelope::DeliveredMessage;
use silverback_core::error::SubscriberError;
use silverback_core::subscriber::{Delivery, Subscriber};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Records every delivered message and counts invocations.
///
/// Stream deliveries are drained to completion, so the subscriber also
/// works for streaming endpoints.
#[derive(Debug, Default)]
pub struct CapturingSubscriber {
    invocations: AtomicUsize,
    received: Mutex<Vec<DeliveredMessage>>,
}

impl CapturingSubscriber {
    /// Create an empty capturing subscriber.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `handle` was invoked.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Snapshot of every message received so far.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn received(&self) -> Vec<DeliveredMessage> {
        self.received.lock().unwrap().clone()
    }

    /// Payloads of every received message, lossily decoded as UTF-8.
    #[must_use]
    pub fn payloads(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|m| String::from_utf8_lossy(m.payload.as_deref().unwrap_or_default()).into_owned())
            .collect()
    }

    fn push(&self, message: DeliveredMessage) {
        #[allow(clippy::unwrap_used)]
        self.received.lock().unwrap().push(message);
    }
}

#[async_trait]
impl Subscriber for CapturingSubscriber {
    async fn handle(&self, delivery: Delivery) -> Result<(), SubscriberError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match delivery {
            Delivery::Single(message) => self.push(message),
            Delivery::Batch(messages) => {
                for message in messages {
                    self.push(message);
                }
            }
            Delivery::Stream(mut stream) => {
                while let Some(message) = stream.next().await {
                    self.push(message);
                }
            }
        }
        Ok(())
    }
}

/// Fails a configurable number of leading invocations, then succeeds (and
/// captures) like [`CapturingSubscriber`].
///
/// `fail_first(usize::MAX)` (or [`FailingSubscriber::always`]) never
/// succeeds.
#[derive(Debug)]
pub struct FailingSubscriber {
    fail_first: usize,
    invocations: AtomicUsize,
    received: Mutex<Vec<DeliveredMessage>>,
}

impl FailingSubscriber {
    /// Fail the first `n` invocations.
    #[must_use]
    pub const fn fail_first(n: usize) -> Self {
        Self {
            fail_first: n,
            invocations: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Fail every invocation.
    #[must_use]
    pub const fn always() -> Self {
        Self::fail_first(usize::MAX)
    }

    /// How many times `handle` was invoked.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Messages received by successful invocations.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn received(&self) -> Vec<DeliveredMessage> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Subscriber for FailingSubscriber {
    async fn handle(&self, delivery: Delivery) -> Result<(), SubscriberError> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst);
        if invocation < self.fail_first {
            return Err(SubscriberError::new(format!(
                "induced failure on invocation {invocation}"
            )));
        }
        match delivery {
            Delivery::Single(message) => {
                #[allow(clippy::unwrap_used)]
                self.received.lock().unwrap().push(message);
            }
            Delivery::Batch(messages) => {
                #[allow(clippy::unwrap_used)]
                self.received.lock().unwrap().extend(messages);
            }
            Delivery::Stream(mut stream) => {
                while let Some(message) = stream.next().await {
                    #[allow(clippy::unwrap_used)]
                    self.received.lock().unwrap().push(message);
                }
            }
        }
        Ok(())
    }
}
