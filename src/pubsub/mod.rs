//! Topic-based publish/subscribe used to trigger re-renders across connections.
//!
//! Delivery is best-effort and at-most-once per current subscriber. One
//! subscriber sees a topic's broadcasts in broadcast order; nothing is replayed.

mod redis_pubsub;

pub use redis_pubsub::RedisPubSub;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::PubSubError;

pub type SubscriptionId = Uuid;

/// Invoked once per broadcast on the subscribed topic. Must not block.
pub type Callback = Arc<dyn Fn(Value) + Send + Sync>;

/// Three-operation contract every backend satisfies.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, topic: &str, callback: Callback) -> Result<SubscriptionId, PubSubError>;

    /// Returns how many subscribers the message was handed to (as reported by the backend).
    async fn broadcast(&self, topic: &str, data: Value) -> Result<u64, PubSubError>;

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), PubSubError>;
}

/// Process-local pub/sub: topic -> ordered subscriber list.
#[derive(Clone, Default)]
pub struct InMemoryPubSub {
    topics: Arc<RwLock<HashMap<String, Vec<(SubscriptionId, Callback)>>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().await.get(topic).map_or(0, Vec::len)
    }

    /// Hand `data` to every current subscriber of `topic`, in subscription order.
    pub(crate) async fn deliver(&self, topic: &str, data: Value) -> u64 {
        let topics = self.topics.read().await;
        let Some(subscribers) = topics.get(topic) else {
            return 0;
        };
        for (_, callback) in subscribers {
            callback(data.clone());
        }
        subscribers.len() as u64
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    #[instrument(skip(self, callback))]
    async fn subscribe(&self, topic: &str, callback: Callback) -> Result<SubscriptionId, PubSubError> {
        let id = Uuid::new_v4();
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push((id, callback));
        debug!(topic = %topic, subscription = %id, "subscribed");
        Ok(id)
    }

    #[instrument(skip(self, data))]
    async fn broadcast(&self, topic: &str, data: Value) -> Result<u64, PubSubError> {
        let count = self.deliver(topic, data).await;
        debug!(topic = %topic, count, "broadcast");
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), PubSubError> {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
        debug!(topic = %topic, subscription = %id, "unsubscribed");
        Ok(())
    }
}
