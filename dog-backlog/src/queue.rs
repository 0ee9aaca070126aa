//! Work topic of one source, with dead-letter routing.
//!
//! `dead_letter` publishes a [`DeadLetterRecord`] and then acks the original
//! whether or not the publish succeeded. A failed publish therefore drops
//! the message; it is logged at `warn`, counted in the metrics and reported
//! in [`DeadLetterOutcome`] so callers can surface it. Every dead-lettered
//! message is also written to the failure log that backs `stats`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{BacklogStore, QueueProvider};
use crate::clock::{chrono_duration, Clock};
use crate::codec::json::JsonCodec;
use crate::codec::PayloadCodec;
use crate::config::SourceConfig;
use crate::observability::ObservabilityLayer;
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{
    AckHandle, Attributes, CoordCtx, DeadLetterRecord, FailureLogEntry, MessageId, QueueMessage, WorkPayload,
    CODEC_ATTRIBUTE, SOURCE_ATTRIBUTE,
};
use crate::CoordResult;

/// Messages pulled per round by [`WorkQueue::drain`]
const DRAIN_BATCH: usize = 100;

/// What happened to a dead-lettered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterOutcome {
    /// The record reached the dead-letter topic
    pub published: bool,
    /// The original delivery was acked
    pub acked: bool,
}

pub struct WorkQueue {
    provider: Arc<dyn QueueProvider>,
    backlog: Arc<dyn BacklogStore>,
    clock: Arc<dyn Clock>,
    observability: Arc<ObservabilityLayer>,
    codec: Arc<dyn PayloadCodec>,
    retry: RetryPolicy,
    source: String,
    topic: String,
    dead_letter_topic: Option<String>,
    ack_deadline: Duration,
}

impl WorkQueue {
    pub fn new(ctx: &CoordCtx, source: &SourceConfig) -> Self {
        Self {
            provider: ctx.stores.queue.clone(),
            backlog: ctx.stores.backlog.clone(),
            clock: ctx.clock.clone(),
            observability: ctx.observability.clone(),
            codec: Arc::new(JsonCodec),
            retry: ctx.config.store_retry,
            source: source.name.clone(),
            topic: source.topic.clone(),
            dead_letter_topic: source.dead_letter_topic.clone(),
            ack_deadline: ctx.config.ack_deadline,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whatever is deliverable right now, possibly nothing
    pub async fn pull_batch(&self, max_messages: usize) -> CoordResult<Vec<QueueMessage>> {
        let now = self.clock.now();
        let visible_until = now + chrono_duration(self.ack_deadline);
        let messages = retry_transient(&self.retry, "queue.pull", || {
            self.provider.pull(&self.topic, max_messages, now, visible_until)
        })
        .await?;

        debug!(topic = %self.topic, pulled = messages.len(), "pulled messages");
        self.observability.record_pulled(messages.len());
        Ok(messages)
    }

    /// Idempotent; failures are logged and reported as `false`
    pub async fn ack(&self, handle: &AckHandle) -> bool {
        match retry_transient(&self.retry, "queue.ack", || self.provider.ack(&self.topic, handle)).await {
            Ok(()) => true,
            Err(err) => {
                warn!(topic = %self.topic, %handle, "ack failed: {}", err);
                self.observability.record_ack_failure();
                false
            }
        }
    }

    /// Publish a dead-letter record for `message`, then ack it regardless
    pub async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> DeadLetterOutcome {
        let failed_at = self.clock.now();
        let published = match &self.dead_letter_topic {
            Some(dlq) => match self.publish_dead_letter(dlq, message, reason, failed_at).await {
                Ok(id) => {
                    info!(message_id = %message.message_id, dead_letter_id = %id, reason, "message dead-lettered");
                    true
                }
                Err(err) => {
                    warn!(
                        message_id = %message.message_id,
                        reason,
                        "dead-letter publish failed, message will be dropped: {}",
                        err
                    );
                    false
                }
            },
            None => {
                warn!(message_id = %message.message_id, reason, "no dead-letter topic configured, dropping message");
                false
            }
        };

        let acked = self.ack(&message.ack_handle).await;
        self.record_failure(message, reason, failed_at).await;
        self.observability
            .record_dead_lettered(&self.source, &message.message_id, reason, published, failed_at);
        DeadLetterOutcome { published, acked }
    }

    async fn record_failure(&self, message: &QueueMessage, reason: &str, failed_at: chrono::DateTime<chrono::Utc>) {
        let entry = FailureLogEntry {
            source: self.source.clone(),
            key: self.codec.decode_payload(&message.payload).ok().map(|payload| payload.key),
            message_id: message.message_id.clone(),
            reason: reason.to_string(),
            failed_at,
        };
        if let Err(err) = retry_transient(&self.retry, "queue.record_failure", || self.backlog.record_failure(&entry)).await
        {
            warn!(message_id = %message.message_id, "failure log write failed: {}", err);
        }
    }

    async fn publish_dead_letter(
        &self,
        topic: &str,
        message: &QueueMessage,
        reason: &str,
        failed_at: chrono::DateTime<chrono::Utc>,
    ) -> CoordResult<MessageId> {
        let record = DeadLetterRecord::from_message(message, reason, failed_at);
        let payload = self.codec.encode_dead_letter(&record)?;
        let attributes = message.attributes.clone();

        retry_transient(&self.retry, "queue.publish_dead_letter", || {
            self.provider.publish(topic, payload.clone(), attributes.clone(), failed_at)
        })
        .await
    }

    /// Pull and ack until nothing is deliverable; returns the number acked
    pub async fn drain(&self) -> CoordResult<usize> {
        let mut drained = 0;
        loop {
            let messages = self.pull_batch(DRAIN_BATCH).await?;
            if messages.is_empty() {
                break;
            }
            for message in &messages {
                if self.ack(&message.ack_handle).await {
                    drained += 1;
                }
            }
        }
        info!(topic = %self.topic, drained, "queue drained");
        Ok(drained)
    }

    /// Encode and publish one work payload
    pub async fn publish(&self, payload: &WorkPayload) -> CoordResult<MessageId> {
        let bytes = self.codec.encode_payload(payload)?;
        let mut attributes = Attributes::new();
        attributes.insert(SOURCE_ATTRIBUTE.to_string(), payload.source.clone());
        attributes.insert(CODEC_ATTRIBUTE.to_string(), self.codec.codec_id().to_string());

        let now = self.clock.now();
        retry_transient(&self.retry, "queue.publish", || {
            self.provider.publish(&self.topic, bytes.clone(), attributes.clone(), now)
        })
        .await
    }

    pub fn decode(&self, message: &QueueMessage) -> CoordResult<WorkPayload> {
        self.codec.decode_payload(&message.payload)
    }
}
