#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::types::{
    AckHandle, Attributes, BacklogItem, ClaimFilter, ClaimMarker, EnqueueLogEntry, FailureLogEntry, FailureReason,
    Lock, MessageId, OwnerId, QueueMessage, SourceStats,
};
use crate::CoordResult;

/// Storage primitives for lease locks
///
/// No operation here is a compare-and-set across rows; [`crate::LeaseLock`]
/// composes them into a best-effort lock.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Delete rows for `name` whose `expires_at` is before `now`
    async fn delete_expired(&self, name: &str, now: DateTime<Utc>) -> CoordResult<u64>;

    /// Insert `lock` only if no row for its name is still valid at `now`
    async fn insert_if_vacant(&self, lock: &Lock, now: DateTime<Utc>) -> CoordResult<bool>;

    /// Valid rows for `name`, earliest `acquired_at` first
    async fn valid_locks(&self, name: &str, now: DateTime<Utc>) -> CoordResult<Vec<Lock>>;

    /// Delete the row for `name` iff held by `holder`
    async fn delete_held(&self, name: &str, holder: &OwnerId) -> CoordResult<bool>;

    /// Every valid row across all names
    async fn active_locks(&self, now: DateTime<Utc>) -> CoordResult<Vec<Lock>>;

    /// Delete expired rows across all names
    async fn purge_expired(&self, now: DateTime<Utc>) -> CoordResult<u64>;
}

/// Storage primitives for the backlog table, the enqueue log and the failure log
#[async_trait]
pub trait BacklogStore: Send + Sync {
    /// Ingestion: insert new rows, ignoring keys that already exist
    async fn insert_items(&self, items: &[BacklogItem]) -> CoordResult<u64>;

    async fn get_item(&self, source: &str, key: &str) -> CoordResult<Option<BacklogItem>>;

    /// Conditional bulk update: stamp `marker` onto up to `limit` claimable rows
    /// chosen in random order. Returns the affected-row count.
    async fn mark_claims(
        &self,
        source: &str,
        filter: &ClaimFilter,
        marker: &ClaimMarker,
        limit: usize,
    ) -> CoordResult<u64>;

    /// Uncompleted rows whose claim marker still equals `marker`
    async fn claimed_by(&self, source: &str, marker: &ClaimMarker) -> CoordResult<Vec<BacklogItem>>;

    /// Uncompleted rows with no live claim, ignoring the enqueue log
    async fn count_claimable(&self, source: &str, filter: &ClaimFilter) -> CoordResult<u64>;

    async fn count_completed_since(&self, source: &str, since: DateTime<Utc>) -> CoordResult<u64>;

    /// Subset of `keys` whose `completion_marker` is set
    async fn completed_keys(&self, source: &str, keys: &[String]) -> CoordResult<HashSet<String>>;

    /// Set `completion_marker` if it is not already set
    async fn mark_completed(&self, source: &str, key: &str, at: DateTime<Utc>) -> CoordResult<bool>;

    /// Clear claim markers stamped at or before `stale_before` on uncompleted rows
    async fn release_stale_claims(&self, source: Option<&str>, stale_before: DateTime<Utc>) -> CoordResult<u64>;

    /// Clear claim markers stamped at or after `since` on uncompleted rows
    async fn release_claims_since(&self, source: Option<&str>, since: DateTime<Utc>) -> CoordResult<u64>;

    async fn record_enqueued(&self, entries: &[EnqueueLogEntry]) -> CoordResult<()>;

    /// Subset of `keys` with an enqueue-log entry at or after `since`
    async fn recently_enqueued(
        &self,
        source: &str,
        keys: &[String],
        since: DateTime<Utc>,
    ) -> CoordResult<HashSet<String>>;

    /// Distinct keys enqueued at or after `since`
    async fn count_enqueued_since(&self, source: &str, since: DateTime<Utc>) -> CoordResult<u64>;

    /// Delete enqueue-log entries older than `before`
    async fn purge_enqueue_log(&self, source: Option<&str>, before: DateTime<Utc>) -> CoordResult<u64>;

    /// Delete enqueue-log entries at or after `since`
    async fn delete_enqueue_log_since(&self, source: Option<&str>, since: DateTime<Utc>) -> CoordResult<u64>;

    async fn record_failure(&self, entry: &FailureLogEntry) -> CoordResult<()>;

    /// Up to `limit` distinct reasons recorded at or after `since`, most frequent first
    async fn failure_reasons_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> CoordResult<Vec<FailureReason>>;

    /// Delete failure-log entries older than `before`
    async fn purge_failure_log(&self, source: Option<&str>, before: DateTime<Utc>) -> CoordResult<u64>;

    /// Counts for `source`; `top_failure_reasons` is left empty
    async fn source_stats(
        &self,
        source: &str,
        window_start: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> CoordResult<SourceStats>;

    /// Distinct sources present in the backlog
    async fn known_sources(&self) -> CoordResult<Vec<String>>;
}

/// At-least-once message channel with visibility deadlines
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Up to `max` deliverable messages; each stays invisible until `visible_until`
    async fn pull(
        &self,
        topic: &str,
        max: usize,
        now: DateTime<Utc>,
        visible_until: DateTime<Utc>,
    ) -> CoordResult<Vec<QueueMessage>>;

    /// Delete the delivery behind `handle`; unknown or stale handles are a no-op
    async fn ack(&self, topic: &str, handle: &AckHandle) -> CoordResult<()>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: Attributes,
        now: DateTime<Utc>,
    ) -> CoordResult<MessageId>;
}

/// The three shared stores, injected together
#[derive(Clone)]
pub struct Stores {
    pub locks: Arc<dyn LockStore>,
    pub backlog: Arc<dyn BacklogStore>,
    pub queue: Arc<dyn QueueProvider>,
}

impl Stores {
    pub fn new(
        locks: Arc<dyn LockStore>,
        backlog: Arc<dyn BacklogStore>,
        queue: Arc<dyn QueueProvider>,
    ) -> Self {
        Self { locks, backlog, queue }
    }
}
