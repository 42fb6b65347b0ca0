//! The consumer: consume-loop lifecycle, channels, pipelines, offsets.
//!
//! A [`Consumer`] owns one broker client and runs a single long-running
//! fetch task. Every fetched envelope is written into the bounded channel of
//! its partition; per-channel reader tasks drive the processing pipeline and
//! hand offsets to the tracker, which commits at the configured cadence.
//!
//! ```text
//!            ┌────────────┐   bounded channel   ┌──────────────┐
//! fetch ───▶ │  consume   │ ──────────────────▶ │ reader p0    │──▶ subscribers
//!            │   loop     │ ──────────────────▶ │ reader p1    │──▶ subscribers
//!            └────────────┘                     └──────────────┘
//!                                                     │
//!                                               offset tracker ──▶ commit
//! ```
//!
//! # Lifecycle
//!
//! [`start`](Consumer::start) is idempotent; when a previous stop is still
//! winding down it waits for the wind-down to finish first.
//! [`stop`](Consumer::stop) cancels the fetch, drains every reader until its
//! current unit of work completes or aborts, attempts a final commit (unless
//! auto-commit is enabled), and disconnects the client. A fatal pipeline
//! error aborts the channel, stops the consumer the same way, and leaves the
//! error readable through [`last_error`](Consumer::last_error).

pub(crate) mod channels;
pub mod offsets;
pub(crate) mod pipeline;
pub mod sequence;

use crate::consumer::channels::{ChannelsManager, ReaderShared};
use crate::consumer::offsets::OffsetTracker;
use crate::producer::Publisher;
use silverback_core::client::{ClientEvent, ConsumerCallbacks, ConsumerClient, NoCallbacks};
use silverback_core::endpoint::EndpointConfiguration;
use silverback_core::error::{ConfigError, ConsumeError};
use silverback_core::offset_store::OffsetStore;
use silverback_core::subscriber::SubscriberRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consumer tuning knobs.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Commit once per this many processed envelopes.
    pub commit_offset_each: usize,
    /// Additional time-based commit tick.
    pub commit_interval: Option<Duration>,
    /// Leave committing to the broker client; the tracker never commits.
    pub enable_auto_commit: bool,
    /// Bound of each per-partition channel (back-pressure). Small values
    /// keep in-flight envelopes close to the broker for rebalance safety.
    pub channel_capacity: usize,
    /// Collapse all partitions into a single channel, trading throughput
    /// for total per-consumer ordering.
    pub process_all_partitions_together: bool,
    /// Reconnect with backoff on transient fetch errors instead of
    /// stopping.
    pub enable_auto_recovery: bool,
    /// First reconnect delay.
    pub recovery_initial_delay: Duration,
    /// Reconnect delay cap.
    pub recovery_max_delay: Duration,
    /// Reconnect attempts before giving up.
    pub max_recovery_attempts: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            commit_offset_each: 1,
            commit_interval: None,
            enable_auto_commit: false,
            channel_capacity: 2,
            process_all_partitions_together: false,
            enable_auto_recovery: false,
            recovery_initial_delay: Duration::from_millis(500),
            recovery_max_delay: Duration::from_secs(30),
            max_recovery_attempts: 10,
        }
    }
}

/// Consumer lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// Never started (or never restarted after a stop).
    Idle,
    /// Fetch loop running.
    Running,
    /// Stop requested; wind-down in progress.
    Stopping,
    /// Fully stopped. A triggering error, if any, is in
    /// [`Consumer::last_error`].
    Stopped,
}

struct Inner {
    client: Arc<dyn ConsumerClient>,
    endpoints: HashMap<String, Arc<EndpointConfiguration>>,
    subscribers: Arc<SubscriberRegistry>,
    publisher: Option<Arc<Publisher>>,
    callbacks: Arc<dyn ConsumerCallbacks>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    group_id: String,
    options: ConsumerOptions,
    status: watch::Sender<ConsumerStatus>,
    last_error: std::sync::Mutex<Option<ConsumeError>>,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    fetch: Option<JoinHandle<()>>,
}

/// A broker consumer with per-partition concurrent processing.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    /// Start building a consumer around `client`.
    #[must_use]
    pub fn builder(client: Arc<dyn ConsumerClient>) -> ConsumerBuilder {
        ConsumerBuilder {
            client,
            endpoints: HashMap::new(),
            subscribers: None,
            publisher: None,
            callbacks: None,
            offset_store: None,
            group_id: String::new(),
            options: ConsumerOptions::default(),
        }
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ConsumerStatus {
        *self.inner.status.borrow()
    }

    /// The error that stopped the consumer, if it stopped on one.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn last_error(&self) -> Option<ConsumeError> {
        self.inner.last_error.lock().unwrap().clone()
    }

    /// Connect the client and start the consume loop.
    ///
    /// Idempotent: starting a running consumer is a no-op. When a previous
    /// stop is still winding down, this waits for it to finish first.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Client`] when the broker session cannot be
    /// established.
    pub async fn start(&self) -> Result<(), ConsumeError> {
        loop {
            match self.status() {
                ConsumerStatus::Running => return Ok(()),
                ConsumerStatus::Stopping => {
                    let mut rx = self.inner.status.subscribe();
                    let _ = rx.wait_for(|s| *s != ConsumerStatus::Stopping).await;
                }
                ConsumerStatus::Idle | ConsumerStatus::Stopped => break,
            }
        }

        let mut control = self.inner.control.lock().await;
        if self.status() == ConsumerStatus::Running {
            return Ok(());
        }

        self.inner.client.connect().await?;
        self.inner.callbacks.on_connected();

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let loop_cancel = cancel.clone();
        control.cancel = Some(cancel);
        control.fetch = Some(tokio::spawn(async move {
            fetch_loop(inner, loop_cancel).await;
        }));
        let _ = self.inner.status.send(ConsumerStatus::Running);
        tracing::info!(group = %self.inner.group_id, "consumer started");
        Ok(())
    }

    /// Stop the consumer and wait for the wind-down to complete.
    pub async fn stop(&self) {
        let fetch = {
            let mut control = self.inner.control.lock().await;
            if let Some(cancel) = control.cancel.take() {
                let _ = self.inner.status.send(ConsumerStatus::Stopping);
                cancel.cancel();
            }
            control.fetch.take()
        };
        if let Some(fetch) = fetch {
            let _ = fetch.await;
        }
        let mut rx = self.inner.status.subscribe();
        let _ = rx
            .wait_for(|s| matches!(s, ConsumerStatus::Stopped | ConsumerStatus::Idle))
            .await;
    }
}

/// Builder for [`Consumer`].
pub struct ConsumerBuilder {
    client: Arc<dyn ConsumerClient>,
    endpoints: HashMap<String, Arc<EndpointConfiguration>>,
    subscribers: Option<Arc<SubscriberRegistry>>,
    publisher: Option<Arc<Publisher>>,
    callbacks: Option<Arc<dyn ConsumerCallbacks>>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    group_id: String,
    options: ConsumerOptions,
}

impl ConsumerBuilder {
    /// Bind a consumer endpoint (keyed by its topic name).
    #[must_use]
    pub fn endpoint(mut self, endpoint: Arc<EndpointConfiguration>) -> Self {
        self.endpoints.insert(endpoint.name().to_string(), endpoint);
        self
    }

    /// Set the subscriber registry.
    #[must_use]
    pub fn subscribers(mut self, subscribers: Arc<SubscriberRegistry>) -> Self {
        self.subscribers = Some(subscribers);
        self
    }

    /// Give the consumer a publisher, enabling move error policies.
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Register lifecycle callbacks.
    #[must_use]
    pub fn callbacks(mut self, callbacks: Arc<dyn ConsumerCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Persist committed offsets to an external store (static assignment).
    #[must_use]
    pub fn offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.offset_store = Some(store);
        self
    }

    /// Set the consumer group id (used for logs and the offset store).
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// Set the tuning options.
    #[must_use]
    pub fn options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when no endpoint is bound.
    pub fn build(self) -> Result<Consumer, ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::Missing("consumer endpoints"));
        }
        let (status, _) = watch::channel(ConsumerStatus::Idle);
        Ok(Consumer {
            inner: Arc::new(Inner {
                client: self.client,
                endpoints: self.endpoints,
                subscribers: self
                    .subscribers
                    .unwrap_or_else(|| Arc::new(SubscriberRegistry::new())),
                publisher: self.publisher,
                callbacks: self.callbacks.unwrap_or_else(|| Arc::new(NoCallbacks)),
                offset_store: self.offset_store,
                group_id: self.group_id,
                options: self.options,
                status,
                last_error: std::sync::Mutex::new(None),
                control: Mutex::new(Control::default()),
            }),
        })
    }
}

async fn fetch_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let shared = Arc::new(ReaderShared::new(
        inner.endpoints.clone(),
        Arc::clone(&inner.subscribers),
        Arc::new(OffsetTracker::new()),
        Arc::clone(&inner.client),
        Arc::clone(&inner.callbacks),
        inner.publisher.clone(),
        inner.offset_store.clone(),
        inner.group_id.clone(),
        inner.options.clone(),
    ));
    let mut manager = ChannelsManager::new(Arc::clone(&shared), cancel.clone());
    let mut commit_ticker = inner.options.commit_interval.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    let error = loop {
        // A reader may have died while we were busy elsewhere; its error
        // must not wait for the next notification.
        if let Some(error) = shared.fatal.take() {
            break Some(error);
        }
        let commit_tick = async {
            match &mut commit_ticker {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => break None,
            () = shared.fatal.notified() => break shared.fatal.take(),
            () = commit_tick => {
                if !inner.options.enable_auto_commit {
                    if let Err(error) = shared.commit().await {
                        tracing::warn!(error = %error, "scheduled commit failed");
                    }
                }
            }
            fetched = inner.client.fetch(&cancel) => match fetched {
                Ok(ClientEvent::Message(envelope)) => {
                    if let Err(error) = manager.dispatch(envelope).await {
                        break Some(error);
                    }
                }
                Ok(ClientEvent::PartitionsAssigned(partitions)) => {
                    tracing::info!(?partitions, "partitions assigned");
                }
                Ok(ClientEvent::PartitionsRevoked(partitions)) => {
                    tracing::info!(?partitions, "partitions revoked");
                    manager.revoke(&partitions).await;
                }
                Err(_) if cancel.is_cancelled() => break None,
                Err(error) if error.is_transient() && inner.options.enable_auto_recovery => {
                    if !recover(&inner, &cancel).await {
                        break Some(ConsumeError::Client(error));
                    }
                }
                Err(error) => break Some(ConsumeError::Client(error)),
            }
        }
    };

    // Wind-down: drain readers, final commit, disconnect.
    let _ = inner.status.send(ConsumerStatus::Stopping);
    manager.shutdown().await;
    if !inner.options.enable_auto_commit {
        if let Err(commit_error) = shared.commit().await {
            tracing::warn!(error = %commit_error, "final commit failed");
        }
    }
    if let Err(disconnect_error) = inner.client.disconnect().await {
        tracing::warn!(error = %disconnect_error, "client disconnect failed");
    }
    inner.callbacks.on_disconnected();

    if let Some(error) = error {
        tracing::error!(error = %error, "consumer stopped on error");
        #[allow(clippy::unwrap_used)]
        {
            *inner.last_error.lock().unwrap() = Some(error.clone());
        }
        inner.callbacks.on_consumer_stopped(&error);
    } else {
        tracing::info!("consumer stopped");
    }
    let _ = inner.status.send(ConsumerStatus::Stopped);
}

/// Reconnect with bounded exponential backoff. Returns `false` when the
/// attempts are exhausted or the stop was requested.
async fn recover(inner: &Arc<Inner>, cancel: &CancellationToken) -> bool {
    let options = &inner.options;
    let mut delay = options.recovery_initial_delay;
    for attempt in 1..=options.max_recovery_attempts {
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }
        match inner.client.connect().await {
            Ok(()) => {
                tracing::info!(attempt, "reconnected after transient fetch error");
                return true;
            }
            Err(error) => {
                tracing::warn!(attempt, error = %error, "reconnect attempt failed");
                delay = (delay * 2).min(options.recovery_max_delay);
            }
        }
    }
    false
}
