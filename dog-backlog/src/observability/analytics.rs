use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

use super::LiveMetrics;
use crate::types::{CoordEvent, MessageId, OwnerId};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Event broadcaster plus live counters, shared by every component of a process
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<CoordEvent>,
    metrics: Arc<LiveMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(10000);

        Self {
            event_broadcaster,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    fn emit(&self, event: CoordEvent) {
        debug!(event = event.event_name(), "coordination event");
        let _ = self.event_broadcaster.send(event);
    }

    pub fn record_lock(&self, name: &str, holder: &OwnerId, acquired: bool, at: DateTime<Utc>) {
        self.metrics.record_lock(acquired);
        let (name, holder) = (name.to_string(), holder.clone());
        self.emit(if acquired {
            CoordEvent::LockAcquired { name, holder, at }
        } else {
            CoordEvent::LockContended { name, holder, at }
        });
    }

    pub fn record_lock_released(&self, name: &str, holder: &OwnerId, at: DateTime<Utc>) {
        self.emit(CoordEvent::LockReleased {
            name: name.to_string(),
            holder: holder.clone(),
            at,
        });
    }

    pub fn record_claim(&self, source: &str, owner: &OwnerId, matched: u64, won: u64, at: DateTime<Utc>) {
        self.metrics.record_claim(matched, won);
        self.emit(CoordEvent::BatchClaimed {
            source: source.to_string(),
            owner: owner.clone(),
            matched,
            won,
            at,
        });
    }

    pub fn record_enqueued(&self, source: &str, count: u64, at: DateTime<Utc>) {
        self.metrics.record_replenishment(count);
        self.emit(CoordEvent::Enqueued {
            source: source.to_string(),
            count,
            at,
        });
    }

    pub fn record_pulled(&self, count: usize) {
        self.metrics.record_pulled(count as u64);
    }

    pub fn record_completed(&self, source: &str, key: &str, at: DateTime<Utc>) {
        self.metrics.record_succeeded();
        self.emit(CoordEvent::ItemCompleted {
            source: source.to_string(),
            key: key.to_string(),
            at,
        });
    }

    pub fn record_dead_lettered(
        &self,
        source: &str,
        message_id: &MessageId,
        reason: &str,
        published: bool,
        at: DateTime<Utc>,
    ) {
        self.metrics.record_dead_lettered(published);
        self.emit(CoordEvent::DeadLettered {
            source: source.to_string(),
            message_id: message_id.clone(),
            reason: reason.to_string(),
            published,
            at,
        });
    }

    pub fn record_ack_failure(&self) {
        self.metrics.record_ack_failure();
    }

    /// Subscribe to events emitted from now on; lagged events are skipped
    pub fn event_stream(&self) -> BoxStream<CoordEvent> {
        let stream = BroadcastStream::new(self.event_broadcaster.subscribe()).filter_map(|result| result.ok());
        Box::pin(stream)
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}
