use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{AckHandle, MessageId};

/// String attributes carried alongside a message payload
pub type Attributes = HashMap<String, String>;

/// Attribute naming the backlog source a message belongs to
pub const SOURCE_ATTRIBUTE: &str = "source";

/// Attribute naming the codec a payload was encoded with
pub const CODEC_ATTRIBUTE: &str = "codec";

/// One delivery of a message pulled from the queue provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub attributes: Attributes,
    pub publish_time: DateTime<Utc>,
    pub ack_handle: AckHandle,
    /// The provider redelivers the message if it is not acked by this instant
    pub deadline: DateTime<Utc>,
}

/// Payload the replenisher publishes for each backlog key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPayload {
    pub source: String,
    pub key: String,
    pub partition: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Immutable record published to the dead-letter topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_data: String,
    pub original_attributes: Attributes,
    pub original_message_id: MessageId,
    pub original_publish_time: DateTime<Utc>,
    pub error_reason: String,
    pub failed_at: DateTime<Utc>,
    pub dlq_source: String,
}

impl DeadLetterRecord {
    pub const PROCESSING_ERROR: &'static str = "processing_error";

    /// Capture everything about `message` plus the failure reason
    pub fn from_message(message: &QueueMessage, reason: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            original_data: String::from_utf8_lossy(&message.payload).into_owned(),
            original_attributes: message.attributes.clone(),
            original_message_id: message.message_id.clone(),
            original_publish_time: message.publish_time,
            error_reason: reason.into(),
            failed_at,
            dlq_source: Self::PROCESSING_ERROR.to_string(),
        }
    }
}
