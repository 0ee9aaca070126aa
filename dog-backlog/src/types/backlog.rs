use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, OwnerId};

/// One candidate unit of work in the backlog
///
/// `completion_marker` is terminal: once set it is never cleared. A claim is
/// only honoured while `now - claim_timestamp < claim_ttl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogItem {
    pub source: String,
    pub key: String,
    pub partition: String,
    pub completion_marker: Option<DateTime<Utc>>,
    pub claim_owner: Option<OwnerId>,
    pub claim_timestamp: Option<DateTime<Utc>>,
}

impl BacklogItem {
    /// A fresh, unclaimed and uncompleted item as an ingestion collaborator appends it
    pub fn new(source: impl Into<String>, key: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            key: key.into(),
            partition: partition.into(),
            completion_marker: None,
            claim_owner: None,
            claim_timestamp: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion_marker.is_some()
    }

    /// Unclaimed, or claimed at or before `stale_before`
    pub fn claim_expired(&self, stale_before: DateTime<Utc>) -> bool {
        match (&self.claim_owner, self.claim_timestamp) {
            (None, _) | (_, None) => true,
            (Some(_), Some(stamp)) => stamp <= stale_before,
        }
    }

    pub fn is_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        !self.is_completed() && self.claim_expired(stale_before)
    }

    pub fn is_held_by(&self, marker: &ClaimMarker) -> bool {
        self.claim_owner.as_ref() == Some(&marker.owner) && self.claim_timestamp == Some(marker.stamp)
    }
}

/// (owner, timestamp) pair written by one claim call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMarker {
    pub owner: OwnerId,
    pub stamp: DateTime<Utc>,
}

/// Predicate for the conditional bulk claim update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Restrict to these partitions; empty means every partition of the source
    pub partitions: Vec<String>,
    /// Claims stamped at or before this instant are treated as abandoned
    pub stale_before: DateTime<Utc>,
    /// Keys with an enqueue-log entry at or after this instant are skipped
    pub enqueued_since: DateTime<Utc>,
}

impl ClaimFilter {
    pub fn matches_partition(&self, partition: &str) -> bool {
        self.partitions.is_empty() || self.partitions.iter().any(|p| p == partition)
    }
}

/// Record of one key having been published to the work queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueLogEntry {
    pub key: String,
    pub source: String,
    pub enqueued_at: DateTime<Utc>,
    pub owner: OwnerId,
}

/// Record of one message having been dead-lettered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureLogEntry {
    pub source: String,
    /// Absent when the payload could not be decoded
    pub key: Option<String>,
    pub message_id: MessageId,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// A dead-letter reason and how often it occurred
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub reason: String,
    pub count: u64,
}

/// Backlog counts for one source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source: String,
    pub total: u64,
    pub completed: u64,
    pub pending: u64,
    /// Pending items holding a claim younger than the claim TTL
    pub claimed: u64,
    pub enqueued_in_window: u64,
    pub completed_in_window: u64,
    pub dead_lettered_in_window: u64,
    /// Most frequent dead-letter reasons in the window, most frequent first
    #[serde(default)]
    pub top_failure_reasons: Vec<FailureReason>,
}

impl SourceStats {
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.completed as f64 / self.total as f64) * 100.0
        }
    }

    /// Average per hour over a window of `hours`
    pub fn hourly_rate(count: u64, hours: u64) -> f64 {
        if hours == 0 {
            0.0
        } else {
            count as f64 / hours as f64
        }
    }
}
