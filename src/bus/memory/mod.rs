//! In-memory transport backed by tokio broadcast channels.
//!
//! One `MemoryHub` stands in for the broker: it keeps a broadcast sender
//! per topic, mirroring how the broker adapters fan out per top-level
//! channel segment. Transports publish into and subscribe from the hub,
//! so multiple endpoints in one process exercise the same addressing and
//! filtering paths as the real brokers, without external infrastructure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BusError, Consumer, MessageHandler, Producer, Result};
use crate::channel::{self, Selector};
use crate::message::{Message, ATTR_SENDER};

const TOPIC_CAPACITY: usize = 256;

/// Process-wide message hub shared by all in-memory transports.
pub struct MemoryHub {
    topics: std::sync::RwLock<HashMap<String, broadcast::Sender<Message>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: std::sync::RwLock::new(HashMap::new()),
        })
    }

    /// Get or create the broadcast sender for a topic.
    fn sender(&self, topic: &str) -> broadcast::Sender<Message> {
        {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = topics.get(topic) {
                return tx.clone();
            }
        }
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

struct ChannelSub {
    task: JoinHandle<()>,
}

impl Drop for ChannelSub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// In-memory transport bound to one endpoint (or producer) id.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    id: String,
    subscriptions: tokio::sync::Mutex<HashMap<String, ChannelSub>>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>, id: &str) -> Self {
        Self {
            hub,
            id: id.to_string(),
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Producer for MemoryTransport {
    async fn publish(&self, channel: &str, mut message: Message) -> Result<()> {
        if !channel::is_valid(channel) {
            return Err(BusError::InvalidChannel(channel.to_string()));
        }
        message.kind = channel.to_string();
        // Dispatchers stamp the originating endpoint; only fill in the
        // transport id when nobody did.
        message
            .metadata
            .entry(ATTR_SENDER.to_string())
            .or_insert_with(|| self.id.clone());

        let topic = channel::topic_of(channel);
        // A send error only means no live subscribers for the topic.
        let _ = self.hub.sender(topic).send(message);
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryTransport {
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if !channel::is_valid(channel) {
            return Err(BusError::InvalidChannel(channel.to_string()));
        }
        let mut subs = self.subscriptions.lock().await;
        if subs.contains_key(channel) {
            return Ok(());
        }

        let topic = channel::topic_of(channel);
        let mut rx = self.hub.sender(topic).subscribe();
        let selector = Selector::new(channel, &self.id);
        let endpoint_id = self.id.clone();
        let sub_channel = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if selector.matches(&message) {
                            handler.on_message(message);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            endpoint_id = %endpoint_id,
                            channel = %sub_channel,
                            skipped = n,
                            "In-memory subscriber lagged, messages dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!(endpoint_id = %self.id, channel = %channel, "Subscribed in-memory channel");
        subs.insert(channel.to_string(), ChannelSub { task });
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut subs = self.subscriptions.lock().await;
        if subs.remove(channel).is_some() {
            debug!(endpoint_id = %self.id, channel = %channel, "Unsubscribed in-memory channel");
        }
        Ok(())
    }
}
