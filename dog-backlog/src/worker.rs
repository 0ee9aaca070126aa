//! Pull → process → ack / dead-letter → pull, replenishing on empty pulls.
//!
//! ```text
//! PULLING ──messages──▶ PROCESSING ──▶ (ack | dead-letter) ──▶ PULLING
//!    │
//!    └──empty──▶ REPLENISHING ──▶ PULLING            (or exit once the
//!                                                     empty counter hits
//!                                                     max_empty_attempts)
//! ```
//!
//! Shutdown is honoured only at `PULLING`. Items claimed but not yet
//! processed when a worker stops are recovered by claim expiry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::BacklogStore;
use crate::clock::Clock;
use crate::config::{CoordConfig, SourceConfig};
use crate::observability::ObservabilityLayer;
use crate::processor::{BatchOutcome, ItemProcessor, WorkItem};
use crate::queue::WorkQueue;
use crate::replenisher::JobReplenisher;
use crate::retry::{retry_transient, LinearBackoff, RetryPolicy};
use crate::types::{CoordCtx, OwnerId, QueueMessage};
use crate::{CoordError, CoordResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Pulling,
    Processing,
    Replenishing,
    Stopped,
}

/// Loop tuning, taken from [`CoordConfig`] by default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub max_empty_attempts: u32,
    pub empty_backoff: LinearBackoff,
    pub replenish_attempts: u32,
}

impl WorkerSettings {
    pub fn from_config(config: &CoordConfig) -> Self {
        Self {
            batch_size: config.worker_batch_size,
            max_empty_attempts: config.worker_max_empty_attempts,
            empty_backoff: config.worker_empty_backoff,
            replenish_attempts: config.replenish_max_attempts,
        }
    }
}

/// Counts for one processed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub processed: u64,
    /// Redeliveries of already completed keys, acked without processing
    pub skipped: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
    pub dead_letter_publish_failures: u64,
    pub ack_failures: u64,
    pub completion_failures: u64,
}

/// Totals reported when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub batches: u64,
    pub processed: u64,
    pub skipped: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
    pub dead_letter_publish_failures: u64,
    pub ack_failures: u64,
    pub completion_failures: u64,
    pub empty_pulls: u64,
    pub replenishments: u64,
}

impl RunSummary {
    fn absorb(&mut self, batch: &BatchCounts) {
        self.batches += 1;
        self.processed += batch.processed;
        self.skipped += batch.skipped;
        self.succeeded += batch.succeeded;
        self.dead_lettered += batch.dead_lettered;
        self.dead_letter_publish_failures += batch.dead_letter_publish_failures;
        self.ack_failures += batch.ack_failures;
        self.completion_failures += batch.completion_failures;
    }
}

/// Handle for managing a spawned worker
pub struct WorkerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<CoordResult<RunSummary>>,
    state: Arc<RwLock<WorkerState>>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Request a stop at the next `PULLING` boundary and wait for the summary
    pub async fn shutdown(self) -> CoordResult<RunSummary> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| CoordError::Internal(format!("Worker join error: {}", e)))?
    }

    /// Wait for the worker to exit on its own
    pub async fn wait(&mut self) -> CoordResult<RunSummary> {
        (&mut self.join_handle)
            .await
            .map_err(|e| CoordError::Internal(format!("Worker join error: {}", e)))?
    }
}

pub struct WorkerLoop {
    source: SourceConfig,
    owner: OwnerId,
    queue: WorkQueue,
    replenisher: JobReplenisher,
    backlog: Arc<dyn BacklogStore>,
    processor: Arc<dyn ItemProcessor>,
    clock: Arc<dyn Clock>,
    observability: Arc<ObservabilityLayer>,
    retry: RetryPolicy,
    settings: WorkerSettings,
    state: Arc<RwLock<WorkerState>>,
    shutdown_rx: Option<oneshot::Receiver<()>>,
    stop_requested: bool,
}

impl WorkerLoop {
    pub fn new(ctx: &CoordCtx, source: SourceConfig, processor: Arc<dyn ItemProcessor>) -> Self {
        Self::with_owner(ctx, source, processor, OwnerId::generate("worker"))
    }

    /// Worker whose claims, locks and enqueue-log entries carry `owner`
    pub fn with_owner(
        ctx: &CoordCtx,
        source: SourceConfig,
        processor: Arc<dyn ItemProcessor>,
        owner: OwnerId,
    ) -> Self {
        Self {
            queue: WorkQueue::new(ctx, &source),
            replenisher: JobReplenisher::with_owner(ctx, source.clone(), owner.clone()),
            backlog: ctx.stores.backlog.clone(),
            processor,
            clock: ctx.clock.clone(),
            observability: ctx.observability.clone(),
            retry: ctx.config.store_retry,
            settings: WorkerSettings::from_config(ctx.config()),
            state: Arc::new(RwLock::new(WorkerState::Pulling)),
            shutdown_rx: None,
            stop_requested: false,
            owner,
            source,
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Run on a background task
    pub fn spawn(mut self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_rx = Some(shutdown_rx);
        let state = self.state.clone();
        let join_handle = tokio::spawn(self.run());

        WorkerHandle {
            shutdown_tx,
            join_handle,
            state,
        }
    }

    /// Drive the loop until the empty-pull budget is spent or a stop is requested
    #[instrument(skip(self), fields(source = %self.source.name, owner = %self.owner))]
    pub async fn run(mut self) -> CoordResult<RunSummary> {
        let mut summary = RunSummary::default();
        let mut empty_attempts: u32 = 0;
        info!(batch_size = self.settings.batch_size, "worker started");

        loop {
            self.set_state(WorkerState::Pulling);
            if self.shutdown_requested() {
                info!("shutdown requested");
                break;
            }

            let messages = match self.queue.pull_batch(self.settings.batch_size).await {
                Ok(messages) => messages,
                Err(err) => {
                    warn!("pull failed, treating as empty: {}", err);
                    Vec::new()
                }
            };

            if !messages.is_empty() {
                empty_attempts = 0;
                self.set_state(WorkerState::Processing);
                let counts = self.process_messages(messages).await;
                info!(
                    processed = counts.processed,
                    skipped = counts.skipped,
                    succeeded = counts.succeeded,
                    dead_lettered = counts.dead_lettered,
                    "batch finished"
                );
                summary.absorb(&counts);
                continue;
            }

            empty_attempts += 1;
            summary.empty_pulls += 1;
            self.set_state(WorkerState::Replenishing);
            if self.replenisher.retry_with_backoff(self.settings.replenish_attempts).await {
                summary.replenishments += 1;
                empty_attempts = 0;
                continue;
            }

            if empty_attempts >= self.settings.max_empty_attempts {
                info!(empty_attempts, "no work left, exiting");
                break;
            }

            let delay = self.settings.empty_backoff.delay(empty_attempts);
            debug!(empty_attempts, delay_ms = delay.as_millis() as u64, "queue empty, backing off");
            self.pause(delay).await;
        }

        self.set_state(WorkerState::Stopped);
        info!(
            batches = summary.batches,
            processed = summary.processed,
            skipped = summary.skipped,
            succeeded = summary.succeeded,
            dead_lettered = summary.dead_lettered,
            dead_letter_publish_failures = summary.dead_letter_publish_failures,
            replenishments = summary.replenishments,
            "worker stopped"
        );
        Ok(summary)
    }

    async fn process_messages(&self, messages: Vec<QueueMessage>) -> BatchCounts {
        let mut counts = BatchCounts {
            processed: messages.len() as u64,
            ..BatchCounts::default()
        };

        let mut batch: Vec<(WorkItem, QueueMessage)> = Vec::with_capacity(messages.len());
        for message in messages {
            match self.queue.decode(&message) {
                Ok(payload) => batch.push((
                    WorkItem {
                        source: payload.source,
                        key: payload.key,
                        partition: payload.partition,
                        message_id: message.message_id.clone(),
                    },
                    message,
                )),
                Err(err) => {
                    let reason = format!("undecodable payload: {err}");
                    self.dead_letter(&message, &reason, &mut counts).await;
                }
            }
        }
        self.skip_completed(&mut batch, &mut counts).await;
        if batch.is_empty() {
            return counts;
        }

        let items: Vec<WorkItem> = batch.iter().map(|(item, _)| item.clone()).collect();
        match self.processor.process_batch(&items).await {
            Ok(outcome) => self.apply_outcome(&batch, &outcome, &mut counts).await,
            Err(err) => {
                warn!(items = batch.len(), "batch failed before item outcomes were known: {}", err);
                let reason = format!("batch failed before item outcomes were known: {}", err.message());
                for (_, message) in &batch {
                    self.dead_letter(message, &reason, &mut counts).await;
                }
            }
        }
        counts
    }

    /// Ack and drop messages whose key is already completed
    async fn skip_completed(&self, batch: &mut Vec<(WorkItem, QueueMessage)>, counts: &mut BatchCounts) {
        if batch.is_empty() {
            return;
        }
        let name = self.source.name.as_str();
        let keys: Vec<String> = batch.iter().map(|(item, _)| item.key.clone()).collect();
        let completed = match retry_transient(&self.retry, "worker.completed_keys", || {
            self.backlog.completed_keys(name, &keys)
        })
        .await
        {
            Ok(completed) => completed,
            Err(err) => {
                warn!("completion lookup failed, processing the whole batch: {}", err);
                return;
            }
        };
        if completed.is_empty() {
            return;
        }

        let mut remaining = Vec::with_capacity(batch.len());
        for (item, message) in batch.drain(..) {
            if !completed.contains(&item.key) {
                remaining.push((item, message));
                continue;
            }
            debug!(key = %item.key, "already completed, acking redelivery");
            if !self.queue.ack(&message.ack_handle).await {
                counts.ack_failures += 1;
            }
            counts.skipped += 1;
            counts.processed -= 1;
        }
        *batch = remaining;
    }

    async fn apply_outcome(&self, batch: &[(WorkItem, QueueMessage)], outcome: &BatchOutcome, counts: &mut BatchCounts) {
        for (item, message) in batch {
            match outcome.get(&item.key) {
                Some(Ok(())) => self.complete(item, message, counts).await,
                Some(Err(err)) => self.dead_letter(message, err.message(), counts).await,
                None => self.dead_letter(message, "no outcome reported", counts).await,
            }
        }
    }

    async fn complete(&self, item: &WorkItem, message: &QueueMessage, counts: &mut BatchCounts) {
        let now = self.clock.now();
        if let Err(err) = retry_transient(&self.retry, "worker.mark_completed", || {
            self.backlog.mark_completed(&item.source, &item.key, now)
        })
        .await
        {
            // The item becomes claimable again after the claim TTL
            warn!(key = %item.key, "completion marker not written: {}", err);
            counts.completion_failures += 1;
        }

        if !self.queue.ack(&message.ack_handle).await {
            counts.ack_failures += 1;
        }
        counts.succeeded += 1;
        self.observability.record_completed(&item.source, &item.key, now);
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str, counts: &mut BatchCounts) {
        let outcome = self.queue.dead_letter(message, reason).await;
        counts.dead_lettered += 1;
        if !outcome.published {
            counts.dead_letter_publish_failures += 1;
        }
        if !outcome.acked {
            counts.ack_failures += 1;
        }
    }

    fn set_state(&self, state: WorkerState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = ?*current, to = ?state, "worker state");
            *current = state;
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        if let Some(rx) = self.shutdown_rx.as_mut() {
            match rx.try_recv() {
                Ok(()) | Err(TryRecvError::Closed) => {
                    self.shutdown_rx = None;
                    self.stop_requested = true;
                }
                Err(TryRecvError::Empty) => {}
            }
        }
        self.stop_requested
    }

    /// Sleep, waking early if a stop is requested
    async fn pause(&mut self, delay: Duration) {
        let interrupted = match self.shutdown_rx.as_mut() {
            Some(rx) => tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = rx => true,
            },
            None => {
                tokio::time::sleep(delay).await;
                false
            }
        };
        if interrupted {
            self.shutdown_rx = None;
            self.stop_requested = true;
        }
    }
}
