//! Redis-backed pub/sub: publish through Redis, one Redis subscription per
//! topic, fan-out to local subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{Callback, InMemoryPubSub, PubSub, SubscriptionId};
use crate::error::PubSubError;

const TOPIC_PREFIX: &str = "liveview:topic:";

fn topic_key(topic: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, topic)
}

type Listeners = Arc<Mutex<HashMap<String, Listener>>>;

/// Task forwarding one topic's Redis messages to the local subscribers.
struct Listener {
    id: Uuid,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct RedisPubSub {
    client: Arc<redis::Client>,
    local: InMemoryPubSub,
    /// topic -> listener. Locked across every subscriber count change so the
    /// listener's lifetime always matches the local subscriber set.
    listeners: Listeners,
}

impl RedisPubSub {
    pub fn new(redis_url: &str) -> Result<Self, PubSubError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            local: InMemoryPubSub::new(),
            listeners: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn listen(&self, topic: &str) -> Result<Listener, PubSubError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(topic_key(topic)).await?;
        info!(topic = %topic, "subscribed to redis topic");

        let id = Uuid::new_v4();
        let local = self.local.clone();
        let listeners = self.listeners.clone();
        let topic = topic.to_string();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload = match msg.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "unreadable redis payload");
                        continue;
                    }
                };
                match serde_json::from_str::<Value>(&payload) {
                    Ok(data) => {
                        local.deliver(&topic, data).await;
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "redis payload is not json"),
                }
            }
            warn!(topic = %topic, "redis listener ended");
            forget_listener(&mut *listeners.lock().await, &topic, id);
        });
        Ok(Listener { id, task })
    }
}

/// Drop the map entry for `topic` only if it still belongs to listener `id`;
/// a newer listener may already have taken its place.
fn forget_listener(listeners: &mut HashMap<String, Listener>, topic: &str, id: Uuid) -> bool {
    if listeners.get(topic).is_some_and(|listener| listener.id == id) {
        listeners.remove(topic);
        return true;
    }
    false
}

#[async_trait]
impl PubSub for RedisPubSub {
    #[instrument(skip(self, callback))]
    async fn subscribe(&self, topic: &str, callback: Callback) -> Result<SubscriptionId, PubSubError> {
        let mut listeners = self.listeners.lock().await;
        let running = listeners
            .get(topic)
            .is_some_and(|listener| !listener.task.is_finished());
        if !running {
            let listener = self.listen(topic).await?;
            listeners.insert(topic.to_string(), listener);
        }
        self.local.subscribe(topic, callback).await
    }

    #[instrument(skip(self, data))]
    async fn broadcast(&self, topic: &str, data: Value) -> Result<u64, PubSubError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(&data)?;
        let count: u64 = conn.publish(topic_key(topic), payload).await?;
        debug!(topic = %topic, count, "published");
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), PubSubError> {
        let mut listeners = self.listeners.lock().await;
        self.local.unsubscribe(topic, id).await?;
        if self.local.subscriber_count(topic).await == 0 {
            if let Some(listener) = listeners.remove(topic) {
                listener.task.abort();
                debug!(topic = %topic, "redis listener stopped");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn idle_listener() -> Listener {
        Listener {
            id: Uuid::new_v4(),
            task: tokio::spawn(std::future::pending::<()>()),
        }
    }

    #[tokio::test]
    async fn ended_listener_only_forgets_itself() {
        let mut listeners = HashMap::new();
        let stale = Uuid::new_v4();
        let current = idle_listener();
        let current_id = current.id;
        listeners.insert("room".to_string(), current);

        assert!(!forget_listener(&mut listeners, "room", stale));
        assert!(listeners.contains_key("room"));
        assert!(forget_listener(&mut listeners, "room", current_id));
        assert!(listeners.is_empty());
    }

    #[tokio::test]
    async fn resubscribe_during_unsubscribe_keeps_listener() {
        let redis_url = match std::env::var("TEST_REDIS_URL") {
            Ok(u) => u,
            Err(_) => {
                eprintln!("Skip redis test: set TEST_REDIS_URL");
                return;
            }
        };
        let pubsub = RedisPubSub::new(&redis_url).unwrap();
        let topic = format!("test-{}", Uuid::new_v4());
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let first = pubsub.subscribe(&topic, Arc::new(|_: Value| {})).await.unwrap();
        let sink = seen.clone();
        let (left, second) = tokio::join!(
            pubsub.unsubscribe(&topic, first),
            pubsub.subscribe(&topic, Arc::new(move |data: Value| sink.lock().unwrap().push(data))),
        );
        left.unwrap();
        let second = second.unwrap();

        pubsub.broadcast(&topic, json!("still here")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), vec![json!("still here")]);

        pubsub.unsubscribe(&topic, second).await.unwrap();
        assert!(pubsub.listeners.lock().await.is_empty());
    }
}
