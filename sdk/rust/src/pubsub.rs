//! In-process publish/subscribe for subscription resolvers.
//!
//! ```ignore
//! let pubsub = PubSub::new();
//! let events = pubsub.clone();
//! let schema = SchemaBuilder::new()
//!     // ...
//!     .subscription_fn("messageAdded", move |_, _| {
//!         let events = events.clone();
//!         async move { Ok(events.stream("messages").await) }
//!     });
//! pubsub.publish("messages", json!({"text": "hi"})).await;
//! ```

use futures_util::stream;
use futures_util::StreamExt;
use gqlmux_runtime::EventStream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;

/// A publish/subscribe hub keyed by topic.
#[derive(Debug, Clone)]
pub struct PubSub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Value>>>>,
    capacity: usize,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Events buffered per subscriber before it starts missing some.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Publishes an event. Returns how many subscribers received it.
    pub async fn publish(&self, topic: impl AsRef<str>, event: Value) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(topic.as_ref())
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0)
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> broadcast::Receiver<Value> {
        let topic = topic.into();
        let mut channels = self.channels.write().await;
        match channels.get(&topic) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                channels.insert(topic, sender);
                receiver
            }
        }
    }

    /// Events published to `topic` from now on, as a subscription source.
    /// Dropping the stream unsubscribes. Slow consumers skip missed events.
    pub async fn stream(&self, topic: impl Into<String>) -> EventStream {
        let topic = topic.into();
        let receiver = self.subscribe(topic.clone()).await;
        stream::unfold((receiver, topic), |(mut receiver, topic)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((Ok(event), (receiver, topic))),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%topic, skipped, "subscriber lagged behind");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub async fn topic_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn has_subscribers(&self, topic: &str) -> bool {
        let channels = self.channels.read().await;
        channels
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() > 0)
    }

    /// Drops topics nobody listens to.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}
