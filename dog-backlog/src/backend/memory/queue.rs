use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::Faults;
use crate::backend::QueueProvider;
use crate::types::{AckHandle, Attributes, MessageId, QueueMessage};
use crate::{CoordError, CoordResult};

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    payload: Vec<u8>,
    attributes: Attributes,
    publish_time: DateTime<Utc>,
    /// Current delivery: handle and the instant it becomes redeliverable
    delivery: Option<(AckHandle, DateTime<Utc>)>,
}

impl StoredMessage {
    fn deliverable(&self, now: DateTime<Utc>) -> bool {
        self.delivery.as_ref().map_or(true, |(_, deadline)| *deadline <= now)
    }
}

/// A message as held by the provider, for inspection in tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub attributes: Attributes,
    pub publish_time: DateTime<Utc>,
    pub delivered: bool,
}

/// Topic-keyed message lists with per-delivery ack handles
#[derive(Debug, Default)]
pub struct MemoryQueue {
    topics: RwLock<HashMap<String, Vec<StoredMessage>>>,
    unavailable: RwLock<HashSet<String>>,
    faults: Faults,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueProvider for MemoryQueue {
    async fn pull(
        &self,
        topic: &str,
        max: usize,
        now: DateTime<Utc>,
        visible_until: DateTime<Utc>,
    ) -> CoordResult<Vec<QueueMessage>> {
        self.faults.check("pull")?;
        let mut topics = self.topics.write();
        let Some(messages) = topics.get_mut(topic) else {
            return Ok(Vec::new());
        };

        let mut pulled = Vec::new();
        for stored in messages.iter_mut().filter(|m| m.deliverable(now)).take(max) {
            let handle = AckHandle::new();
            stored.delivery = Some((handle.clone(), visible_until));
            pulled.push(QueueMessage {
                message_id: stored.message_id.clone(),
                payload: stored.payload.clone(),
                attributes: stored.attributes.clone(),
                publish_time: stored.publish_time,
                ack_handle: handle,
                deadline: visible_until,
            });
        }
        Ok(pulled)
    }

    async fn ack(&self, topic: &str, handle: &AckHandle) -> CoordResult<()> {
        self.faults.check("ack")?;
        if let Some(messages) = self.topics.write().get_mut(topic) {
            messages.retain(|m| m.delivery.as_ref().map_or(true, |(h, _)| h != handle));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: Attributes,
        now: DateTime<Utc>,
    ) -> CoordResult<MessageId> {
        self.faults.check("publish")?;
        if self.unavailable.read().contains(topic) {
            return Err(CoordError::Provider(format!("topic {topic} is unavailable")));
        }

        let message_id = MessageId::new();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(StoredMessage {
                message_id: message_id.clone(),
                payload,
                attributes,
                publish_time: now,
                delivery: None,
            });
        Ok(message_id)
    }
}

/// Test helpers for deterministic testing
impl MemoryQueue {
    /// Fail the next `count` calls with a transient error
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// Make every publish to `topic` fail until restored
    pub fn make_unavailable(&self, topic: &str) {
        self.unavailable.write().insert(topic.to_string());
    }

    pub fn restore(&self, topic: &str) {
        self.unavailable.write().remove(topic);
    }

    /// Force every in-flight delivery on `topic` past its deadline
    pub fn expire_deliveries(&self, topic: &str) {
        if let Some(messages) = self.topics.write().get_mut(topic) {
            for message in messages.iter_mut() {
                if let Some((_, deadline)) = message.delivery.as_mut() {
                    *deadline = DateTime::<Utc>::MIN_UTC;
                }
            }
        }
    }

    /// Messages on `topic` that have not been acked, in publish order
    pub fn messages(&self, topic: &str) -> Vec<PublishedMessage> {
        self.topics
            .read()
            .get(topic)
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| PublishedMessage {
                        message_id: m.message_id.clone(),
                        payload: m.payload.clone(),
                        attributes: m.attributes.clone(),
                        publish_time: m.publish_time,
                        delivered: m.delivery.is_some(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn depth(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }
}
