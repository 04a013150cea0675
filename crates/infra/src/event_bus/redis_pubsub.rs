//! Redis pub/sub-backed bus for job status updates (optional).
//!
//! Every event goes to the channel `{prefix}:{image_id}`, so a gateway can
//! follow one image with SUBSCRIBE or all of them with PSUBSCRIBE
//! `{prefix}:*`.
//!
//! Note: Redis pub/sub is not durable (messages are dropped while nobody is
//! subscribed). That matches the contract of job updates: the image record
//! is the source of truth and events are only hints.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use thiserror::Error;
use tracing::{debug, warn};

use roomstage_core::ImageId;
use roomstage_events::{EventBus, JobUpdateEvent, Subscription};

/// Default channel prefix
const DEFAULT_PREFIX: &str = "roomstage:jobs";

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus for [`JobUpdateEvent`]s.
#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    prefix: String,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        })
    }

    pub fn channel(&self, image_id: &ImageId) -> String {
        format!("{}:{}", self.prefix, image_id)
    }

    /// Subscription limited to one image.
    pub fn subscribe_image(&self, image_id: &ImageId) -> Subscription<JobUpdateEvent> {
        self.listen(Topic::Channel(self.channel(image_id)))
    }

    fn listen(&self, topic: Topic) -> Subscription<JobUpdateEvent> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "redis pub/sub connection failed; subscription closed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            let subscribed = match &topic {
                Topic::Channel(channel) => pubsub.subscribe(channel),
                Topic::Pattern(pattern) => pubsub.psubscribe(pattern),
            };
            if let Err(e) = subscribed {
                warn!(error = %e, "redis subscribe failed; subscription closed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let event: JobUpdateEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(channel = %msg.get_channel_name(), error = %e, "ignoring undecodable job update");
                        continue;
                    }
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

enum Topic {
    Channel(String),
    Pattern(String),
}

impl EventBus<JobUpdateEvent> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: JobUpdateEvent) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(self.channel(&message.image_id), payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    /// Subscription to every image's updates.
    fn subscribe(&self) -> Subscription<JobUpdateEvent> {
        self.listen(Topic::Pattern(format!("{}:*", self.prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_is_keyed_by_image() {
        let bus = RedisPubSubEventBus::new("redis://localhost:6379", None).unwrap();
        let id = ImageId::new("img-1").unwrap();
        assert_eq!(bus.channel(&id), "roomstage:jobs:img-1");
    }
}
