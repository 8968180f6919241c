use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message as handed to `produce`. The body is any serializable value; the
/// queue never inspects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message<T = serde_json::Value> {
    pub topic: String,
    pub body: T,
    /// Minimum time before delivery, in milliseconds. `None` or `0` delivers
    /// immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl<T> Message<T> {
    pub fn new(topic: impl Into<String>, body: T) -> Self {
        Self {
            topic: topic.into(),
            body,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The effective delay, or `None` when the message is due immediately.
    pub fn due_in(&self) -> Option<Duration> {
        match self.delay {
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
            _ => None,
        }
    }
}

/// A message together with the identifier assigned at produce time.
///
/// This is the shape stored under a payload key and pushed onto a topic's
/// delivery list. The identifier is the only link between a timer key's
/// expiration and the stored payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentifiedMessage<T = serde_json::Value> {
    pub id: Uuid,
    pub topic: String,
    pub body: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

/// Generate a new UUIDv4 message ID.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

impl<T> IdentifiedMessage<T> {
    pub fn from_message(id: Uuid, message: Message<T>) -> Self {
        Self {
            id,
            topic: message.topic,
            body: message.body,
            delay: message.delay,
        }
    }

    /// Drop the delay: delivered messages only carry id, topic and body.
    pub fn into_delivered(self) -> Self {
        Self {
            delay: None,
            ..self
        }
    }
}

impl IdentifiedMessage<serde_json::Value> {
    /// Convert the opaque JSON body into an application type.
    pub fn body_as<B: DeserializeOwned>(&self) -> Result<B, serde_json::Error> {
        B::deserialize(&self.body)
    }
}
