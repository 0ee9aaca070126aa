//! Backlog replenishment guarded by a per-source lease lock.
//!
//! The queueable estimate subtracts recent enqueues and recent completions
//! from the claimable count. Enqueue events, completion markers and the
//! backlog snapshot become visible at different times; without the
//! subtraction a replenisher would keep re-enqueueing work that is already
//! in flight.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::backend::BacklogStore;
use crate::claim::ClaimProtocol;
use crate::clock::{chrono_duration, Clock};
use crate::config::SourceConfig;
use crate::lock::LeaseLock;
use crate::observability::ObservabilityLayer;
use crate::queue::WorkQueue;
use crate::retry::{retry_transient, ExponentialBackoff, RetryPolicy};
use crate::types::{ClaimFilter, CoordCtx, EnqueueLogEntry, OwnerId, WorkPayload};
use crate::CoordResult;

/// Outcome of one replenishment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplenishOutcome {
    /// Keys published to the work topic
    Enqueued(usize),
    /// Another replenisher holds the source lock
    LockUnavailable,
    /// The estimate found nothing worth enqueueing
    NothingQueueable,
    /// Candidates were estimated but none survived claiming and dedup
    NothingClaimed,
}

impl ReplenishOutcome {
    /// True only when new work reached the queue
    pub fn replenished(&self) -> bool {
        matches!(self, Self::Enqueued(n) if *n > 0)
    }
}

pub struct JobReplenisher {
    source: SourceConfig,
    backlog: Arc<dyn BacklogStore>,
    clock: Arc<dyn Clock>,
    observability: Arc<ObservabilityLayer>,
    lock: LeaseLock,
    claims: ClaimProtocol,
    queue: WorkQueue,
    owner: OwnerId,
    retry: RetryPolicy,
    lock_ttl: Duration,
    claim_ttl: Duration,
    dedup_window: Duration,
    log_retention: Duration,
    batch_size: usize,
    backoff: ExponentialBackoff,
}

impl JobReplenisher {
    pub fn new(ctx: &CoordCtx, source: SourceConfig) -> Self {
        Self::with_owner(ctx, source, OwnerId::generate("replenisher"))
    }

    pub fn with_owner(ctx: &CoordCtx, source: SourceConfig, owner: OwnerId) -> Self {
        let config = ctx.config();
        Self {
            backlog: ctx.stores.backlog.clone(),
            clock: ctx.clock.clone(),
            observability: ctx.observability.clone(),
            lock: LeaseLock::new(ctx, owner.clone()),
            claims: ClaimProtocol::new(ctx, source.name.clone()),
            queue: WorkQueue::new(ctx, &source),
            owner,
            retry: config.store_retry,
            lock_ttl: config.lock_ttl,
            claim_ttl: config.claim_ttl,
            dedup_window: config.dedup_window,
            log_retention: config.enqueue_log_retention,
            batch_size: config.replenish_batch_size,
            backoff: config.replenish_backoff,
            source,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    /// `claimable - enqueued(window) - completed(window)`, clamped at zero
    pub async fn estimate_queueable(&self) -> CoordResult<u64> {
        let name = self.source.name.as_str();
        let now = self.clock.now();
        let window_start = now - chrono_duration(self.dedup_window);
        let filter = ClaimFilter {
            partitions: self.source.partitions.clone(),
            stale_before: now - chrono_duration(self.claim_ttl),
            enqueued_since: window_start,
        };

        let claimable = retry_transient(&self.retry, "replenish.count_claimable", || {
            self.backlog.count_claimable(name, &filter)
        })
        .await?;
        let enqueued = retry_transient(&self.retry, "replenish.count_enqueued", || {
            self.backlog.count_enqueued_since(name, window_start)
        })
        .await?;
        let completed = retry_transient(&self.retry, "replenish.count_completed", || {
            self.backlog.count_completed_since(name, window_start)
        })
        .await?;

        let queueable = claimable.saturating_sub(enqueued).saturating_sub(completed);
        debug!(source = name, claimable, enqueued, completed, queueable, "estimated queueable work");
        Ok(queueable)
    }

    /// Enqueue up to `batch_size` new keys if this process can take the source lock.
    ///
    /// The lock is released before returning on every path that acquired it.
    #[instrument(skip(self), fields(source = %self.source.name))]
    pub async fn replenish_if_needed(&self, batch_size: usize) -> CoordResult<ReplenishOutcome> {
        let lock_name = self.source.lock_name();
        match self.lock.acquire(&lock_name, self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                info!("another replenisher is active");
                return Ok(ReplenishOutcome::LockUnavailable);
            }
            Err(err) => {
                // The insert may have landed before the confirming read failed
                if let Err(release_err) = self.lock.release(&lock_name, &self.owner).await {
                    warn!(lock = %lock_name, "lock release after failed acquire failed, it will expire: {}", release_err);
                }
                return Err(err);
            }
        }

        let result = self.replenish_locked(batch_size).await;

        if let Err(err) = self.lock.release(&lock_name, &self.owner).await {
            warn!(lock = %lock_name, "lock release failed, it will expire: {}", err);
        }
        result
    }

    async fn replenish_locked(&self, batch_size: usize) -> CoordResult<ReplenishOutcome> {
        let name = self.source.name.as_str();
        let now = self.clock.now();

        let retention_cutoff = now - chrono_duration(self.log_retention);
        match self.backlog.purge_enqueue_log(Some(name), retention_cutoff).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "purged old enqueue-log entries"),
            Err(err) => warn!("enqueue-log purge failed: {}", err),
        }

        let queueable = self.estimate_queueable().await?;
        if queueable == 0 {
            info!("nothing queueable");
            return Ok(ReplenishOutcome::NothingQueueable);
        }

        let limit = batch_size.min(usize::try_from(queueable).unwrap_or(usize::MAX));
        let batch = self
            .claims
            .claim_batch_in(&self.source.partitions, limit, &self.owner)
            .await?;
        if batch.is_empty() {
            return Ok(ReplenishOutcome::NothingClaimed);
        }

        let keys = batch.keys();
        let since = now - chrono_duration(self.dedup_window);
        let recent = retry_transient(&self.retry, "replenish.recently_enqueued", || {
            self.backlog.recently_enqueued(name, &keys, since)
        })
        .await?;

        let mut entries = Vec::new();
        for item in batch.won.iter().filter(|item| !recent.contains(&item.key)) {
            let payload = WorkPayload {
                source: name.to_string(),
                key: item.key.clone(),
                partition: item.partition.clone(),
                enqueued_at: batch.stamp,
            };
            match self.queue.publish(&payload).await {
                Ok(_) => entries.push(EnqueueLogEntry {
                    key: item.key.clone(),
                    source: name.to_string(),
                    enqueued_at: self.clock.now(),
                    owner: self.owner.clone(),
                }),
                // The claim keeps the key out of other batches until it expires
                Err(err) => warn!(key = %item.key, "publish failed, key left to claim expiry: {}", err),
            }
        }

        if entries.is_empty() {
            return Ok(ReplenishOutcome::NothingClaimed);
        }

        if let Err(err) = retry_transient(&self.retry, "replenish.record_enqueued", || {
            self.backlog.record_enqueued(&entries)
        })
        .await
        {
            warn!("enqueue log write failed, recent-enqueue dedup is weakened: {}", err);
        }

        let skipped = batch.won.len() - entries.len();
        info!(enqueued = entries.len(), skipped, "replenished queue");
        self.observability
            .record_enqueued(name, entries.len() as u64, self.clock.now());
        Ok(ReplenishOutcome::Enqueued(entries.len()))
    }

    /// Replenish with exponential backoff between attempts; never fails.
    ///
    /// Returns false once `max_attempts` are spent, meaning "no new work right now".
    pub async fn retry_with_backoff(&self, max_attempts: u32) -> bool {
        for attempt in 0..max_attempts {
            match self.replenish_if_needed(self.batch_size).await {
                Ok(outcome) if outcome.replenished() => return true,
                Ok(outcome) => debug!(attempt = attempt + 1, ?outcome, "replenishment produced no work"),
                Err(err) => warn!(attempt = attempt + 1, "replenishment failed: {}", err),
            }

            if attempt + 1 < max_attempts {
                tokio::time::sleep(self.backoff.delay(attempt)).await;
            }
        }

        info!(source = %self.source.name, max_attempts, "no new work after all attempts");
        false
    }
}
