use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, OwnerId};

/// Structured coordination events broadcast by the observability layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordEvent {
    LockAcquired {
        name: String,
        holder: OwnerId,
        at: DateTime<Utc>,
    },

    /// Another holder's valid lock was in place
    LockContended {
        name: String,
        holder: OwnerId,
        at: DateTime<Utc>,
    },

    LockReleased {
        name: String,
        holder: OwnerId,
        at: DateTime<Utc>,
    },

    /// A claim call finished verification
    BatchClaimed {
        source: String,
        owner: OwnerId,
        matched: u64,
        won: u64,
        at: DateTime<Utc>,
    },

    Enqueued {
        source: String,
        count: u64,
        at: DateTime<Utc>,
    },

    ItemCompleted {
        source: String,
        key: String,
        at: DateTime<Utc>,
    },

    DeadLettered {
        source: String,
        message_id: MessageId,
        reason: String,
        published: bool,
        at: DateTime<Utc>,
    },
}

impl CoordEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::LockAcquired { .. } => "lock_acquired",
            Self::LockContended { .. } => "lock_contended",
            Self::LockReleased { .. } => "lock_released",
            Self::BatchClaimed { .. } => "batch_claimed",
            Self::Enqueued { .. } => "enqueued",
            Self::ItemCompleted { .. } => "item_completed",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::LockAcquired { at, .. }
            | Self::LockContended { at, .. }
            | Self::LockReleased { at, .. }
            | Self::BatchClaimed { at, .. }
            | Self::Enqueued { at, .. }
            | Self::ItemCompleted { at, .. }
            | Self::DeadLettered { at, .. } => at,
        }
    }
}
