//! The transactional outbox worker.
//!
//! On a fixed cadence the worker tries to take the outbox's distributed
//! lock; a worker that does not get it yields until the next tick, so any
//! number of replicas can run safely. The holder reads the oldest committed
//! rows, relays each through the matching producer's direct path, and
//! deletes only the successfully produced prefix: a failed row is retained
//! (with everything after it) and retried on the next tick, preserving
//! insertion order per endpoint.

use crate::producer::Publisher;
use silverback_core::outbox::{DistributedLock, OutboxError, OutboxStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outbox worker tuning knobs.
#[derive(Clone, Debug)]
pub struct OutboxWorkerOptions {
    /// Tick cadence. Sensible values are 50 to 500 milliseconds.
    pub interval: Duration,
    /// Maximum rows relayed per tick.
    pub batch_size: u32,
    /// Lock name; workers sharing an outbox must share it.
    pub outbox_name: String,
    /// Consecutive failed ticks before the worker gives up as fatal.
    pub max_consecutive_failures: u32,
}

impl Default for OutboxWorkerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            batch_size: 100,
            outbox_name: "outbox".to_string(),
            max_consecutive_failures: 10,
        }
    }
}

/// At-least-once relay of stored outbox rows.
pub struct OutboxWorker {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<Publisher>,
    lock: Arc<dyn DistributedLock>,
    options: OutboxWorkerOptions,
    holder: String,
}

impl OutboxWorker {
    /// Create a worker over `store`, relaying through `publisher`'s
    /// producers under `lock`.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<Publisher>,
        lock: Arc<dyn DistributedLock>,
        options: OutboxWorkerOptions,
    ) -> Self {
        Self {
            store,
            publisher,
            lock,
            options,
            holder: format!("outbox-worker-{}", Uuid::new_v4()),
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Produce failures are retried tick after tick and never end the
    /// worker; persistent store or lock failures do.
    ///
    /// # Errors
    ///
    /// Returns the last [`OutboxError`] once
    /// [`max_consecutive_failures`](OutboxWorkerOptions::max_consecutive_failures)
    /// ticks failed in a row.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OutboxError> {
        tracing::info!(
            outbox = %self.options.outbox_name,
            holder = %self.holder,
            interval_ms = self.options.interval.as_millis(),
            batch_size = self.options.batch_size,
            "outbox worker started"
        );
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.options.interval,
            self.options.interval,
        );
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.release_quietly().await;
                    tracing::info!(outbox = %self.options.outbox_name, "outbox worker stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(relayed) => {
                    consecutive_failures = 0;
                    if relayed > 0 {
                        tracing::debug!(relayed, "outbox tick relayed rows");
                    }
                }
                Err(error) => {
                    consecutive_failures += 1;
                    tracing::error!(
                        error = %error,
                        consecutive_failures,
                        "outbox tick failed"
                    );
                    if consecutive_failures >= self.options.max_consecutive_failures {
                        self.release_quietly().await;
                        return Err(error);
                    }
                }
            }
        }
    }

    /// One tick: acquire the lock, relay a batch, release.
    async fn tick(&self) -> Result<usize, OutboxError> {
        let acquired = self
            .lock
            .try_acquire(&self.options.outbox_name, &self.holder)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;
        if !acquired {
            tracing::trace!(outbox = %self.options.outbox_name, "lock held elsewhere, yielding");
            return Ok(0);
        }

        let result = self.relay_batch().await;
        self.release_quietly().await;
        result
    }

    async fn relay_batch(&self) -> Result<usize, OutboxError> {
        let rows = self.store.fetch_batch(self.options.batch_size).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut produced_ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let producer = match self.publisher.find(&row.endpoint_name).await {
                Ok(producer) => producer,
                Err(error) => {
                    // A row for an unregistered endpoint blocks the queue;
                    // surface loudly and retry next tick.
                    tracing::error!(
                        row = row.id,
                        endpoint = %row.endpoint_name,
                        error = %error,
                        "no producer for outbox row"
                    );
                    break;
                }
            };
            match producer.relay_stored(row).await {
                Ok(_) => produced_ids.push(row.id),
                Err(error) => {
                    tracing::warn!(
                        row = row.id,
                        endpoint = %row.endpoint_name,
                        error = %error,
                        "outbox relay failed; row retained"
                    );
                    break;
                }
            }
        }

        if !produced_ids.is_empty() {
            self.store.delete(&produced_ids).await?;
        }
        Ok(produced_ids.len())
    }

    async fn release_quietly(&self) {
        if let Err(error) = self
            .lock
            .release(&self.options.outbox_name, &self.holder)
            .await
        {
            tracing::warn!(error = %error, "failed to release outbox lock");
        }
    }
}
