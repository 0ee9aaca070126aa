//! Race-tolerant batch claiming.
//!
//! A claim is a conditional bulk update that stamps `(owner, stamp)` onto up
//! to `batch_size` claimable rows, followed by a fixed sleep and a verifying
//! read that keeps only the rows still carrying this call's marker. A
//! concurrent claimant that overwrote some rows during the sleep wins them;
//! the rows are ceded silently and cost only a retry.
//!
//! This is last-writer-wins, not linearizable: a competing update landing
//! after the verifying read can still take a row this call believes it won.
//! The safety interval makes that window small; it does not close it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::backend::BacklogStore;
use crate::clock::{chrono_duration, Clock};
use crate::observability::ObservabilityLayer;
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{BacklogItem, ClaimFilter, ClaimMarker, CoordCtx, OwnerId};
use crate::CoordResult;

/// Result of one claim call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedBatch {
    /// Timestamp written into every matched row
    pub stamp: DateTime<Utc>,
    /// Rows the conditional update touched
    pub matched: u64,
    /// Rows still carrying this call's marker after the safety interval
    pub won: Vec<BacklogItem>,
}

impl ClaimedBatch {
    fn empty(stamp: DateTime<Utc>) -> Self {
        Self {
            stamp,
            matched: 0,
            won: Vec::new(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.won.iter().map(|item| item.key.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.won.is_empty()
    }

    /// Matched rows lost to a concurrent claimant
    pub fn ceded(&self) -> u64 {
        self.matched.saturating_sub(self.won.len() as u64)
    }
}

/// Batch claims over one source's backlog
pub struct ClaimProtocol {
    store: Arc<dyn BacklogStore>,
    clock: Arc<dyn Clock>,
    observability: Arc<ObservabilityLayer>,
    retry: RetryPolicy,
    source: String,
    claim_ttl: Duration,
    safety_interval: Duration,
    dedup_window: Duration,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl ClaimProtocol {
    pub fn new(ctx: &CoordCtx, source: impl Into<String>) -> Self {
        let config = ctx.config();
        Self {
            store: ctx.stores.backlog.clone(),
            clock: ctx.clock.clone(),
            observability: ctx.observability.clone(),
            retry: config.store_retry,
            source: source.into(),
            claim_ttl: config.claim_ttl,
            safety_interval: config.claim_safety_interval,
            dedup_window: config.dedup_window,
            last_stamp: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Claim up to `batch_size` rows of one partition for `owner`
    pub async fn claim_batch(&self, partition: &str, batch_size: usize, owner: &OwnerId) -> CoordResult<ClaimedBatch> {
        self.claim_batch_in(&[partition.to_string()], batch_size, owner).await
    }

    /// Claim up to `batch_size` rows across `partitions` (all partitions when empty)
    #[instrument(skip(self, partitions), fields(source = %self.source, owner = %owner))]
    pub async fn claim_batch_in(
        &self,
        partitions: &[String],
        batch_size: usize,
        owner: &OwnerId,
    ) -> CoordResult<ClaimedBatch> {
        let stamp = self.next_stamp();
        if batch_size == 0 {
            return Ok(ClaimedBatch::empty(stamp));
        }

        let now = self.clock.now();
        let filter = ClaimFilter {
            partitions: partitions.to_vec(),
            stale_before: now - chrono_duration(self.claim_ttl),
            enqueued_since: now - chrono_duration(self.dedup_window),
        };
        let marker = ClaimMarker {
            owner: owner.clone(),
            stamp,
        };

        let matched = retry_transient(&self.retry, "claim.mark", || {
            self.store.mark_claims(&self.source, &filter, &marker, batch_size)
        })
        .await?;

        if matched == 0 {
            debug!("no claimable rows");
            self.observability.record_claim(&self.source, owner, 0, 0, now);
            return Ok(ClaimedBatch::empty(stamp));
        }

        // Let a near-simultaneous competing update land before verifying
        tokio::time::sleep(self.safety_interval).await;

        let won = retry_transient(&self.retry, "claim.verify", || self.store.claimed_by(&self.source, &marker)).await?;

        let batch = ClaimedBatch { stamp, matched, won };
        info!(
            matched = batch.matched,
            won = batch.won.len(),
            ceded = batch.ceded(),
            "claim verified"
        );
        self.observability
            .record_claim(&self.source, owner, batch.matched, batch.won.len() as u64, self.clock.now());
        Ok(batch)
    }

    /// Strictly increasing per instance so two calls never share a marker
    fn next_stamp(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut last = self.last_stamp.lock();
        let stamp = match *last {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::config::CoordConfig;

    fn protocol(backend: &MemoryBackend, clock: Arc<ManualClock>) -> ClaimProtocol {
        let ctx = CoordCtx::new(backend.stores(), CoordConfig::default()).with_clock(clock);
        ClaimProtocol::new(&ctx, "zillow")
    }

    #[test]
    fn test_stamps_are_unique_under_a_frozen_clock() {
        let backend = MemoryBackend::new();
        let claims = protocol(&backend, Arc::new(ManualClock::new(Utc::now())));

        let first = claims.next_stamp();
        let second = claims.next_stamp();
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_partition_returns_without_sleeping() {
        let backend = MemoryBackend::new();
        let claims = protocol(&backend, Arc::new(ManualClock::new(Utc::now())));

        let started = tokio::time::Instant::now();
        let batch = claims.claim_batch("UT", 50, &OwnerId::from("w1")).await.unwrap();

        assert!(batch.is_empty());
        assert_eq!(batch.matched, 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_rows_are_not_claimed() {
        let backend = MemoryBackend::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let claims = protocol(&backend, clock.clone());

        let mut done = BacklogItem::new("zillow", "done", "UT");
        done.completion_marker = Some(clock.now());
        backend
            .backlog
            .insert_items(&[done, BacklogItem::new("zillow", "open", "UT")])
            .await
            .unwrap();

        let batch = claims.claim_batch("UT", 50, &OwnerId::from("w1")).await.unwrap();
        assert_eq!(batch.keys(), vec!["open".to_string()]);
    }
}
