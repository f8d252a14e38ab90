//! NATS transport adapter.
//!
//! The NATS subject space is flat per topic: messages publish to the
//! channel's top-level segment, and one subscription per topic fans in
//! all traffic for that topic. Per-channel routing and recipient
//! addressing are applied with the channel selector on the subscribe
//! side, so many channels under one topic share a single NATS
//! subscription.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BusError, Consumer, MessageHandler, NatsBusConfig, Producer, Result};
use crate::channel::{self, Selector};
use crate::message::{Message, ATTR_RECIPIENTS, ATTR_SENDER};

struct ChannelSub {
    selector: Selector,
    handler: Arc<dyn MessageHandler>,
}

struct TopicSub {
    channels: Arc<std::sync::RwLock<HashMap<String, ChannelSub>>>,
    task: JoinHandle<()>,
}

/// NATS transport bound to one endpoint (or producer) id.
pub struct NatsTransport {
    client: async_nats::Client,
    id: String,
    topics: tokio::sync::Mutex<HashMap<String, TopicSub>>,
}

impl NatsTransport {
    pub async fn connect(config: NatsBusConfig, id: &str) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!(url = %config.url, id = %id, "Connected to NATS");

        Ok(Self {
            client,
            id: id.to_string(),
            topics: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Wire attributes carried as NATS headers alongside the JSON body.
    fn headers(message: &Message) -> async_nats::HeaderMap {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("type", message.kind.as_str());
        if let Some(sender) = message.sender() {
            headers.insert(ATTR_SENDER, sender);
        }
        if let Some(recipients) = message.recipients() {
            headers.insert(ATTR_RECIPIENTS, recipients);
        }
        headers
    }
}

#[async_trait]
impl Producer for NatsTransport {
    async fn publish(&self, channel: &str, mut message: Message) -> Result<()> {
        if !channel::is_valid(channel) {
            return Err(BusError::InvalidChannel(channel.to_string()));
        }
        message.kind = channel.to_string();
        message
            .metadata
            .entry(ATTR_SENDER.to_string())
            .or_insert_with(|| self.id.clone());

        let topic = channel::topic_of(channel).to_string();
        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish_with_headers(topic.clone(), Self::headers(&message), payload.into())
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Publish(format!("Failed to flush: {}", e)))?;

        debug!(topic = %topic, channel = %channel, "Published message");
        Ok(())
    }
}

#[async_trait]
impl Consumer for NatsTransport {
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if !channel::is_valid(channel) {
            return Err(BusError::InvalidChannel(channel.to_string()));
        }
        let topic = channel::topic_of(channel).to_string();
        let mut topics = self.topics.lock().await;

        let sub = ChannelSub {
            selector: Selector::new(channel, self.id.as_str()),
            handler,
        };

        // Channels under an already subscribed topic piggyback on the
        // existing NATS subscription.
        if let Some(topic_sub) = topics.get(&topic) {
            topic_sub
                .channels
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .entry(channel.to_string())
                .or_insert(sub);
            return Ok(());
        }

        let mut subscriber = self
            .client
            .subscribe(topic.clone())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe: {}", e)))?;

        let channels: Arc<std::sync::RwLock<HashMap<String, ChannelSub>>> =
            Arc::new(std::sync::RwLock::new(HashMap::from([(
                channel.to_string(),
                sub,
            )])));
        let fanout = channels.clone();
        let task_topic = topic.clone();

        let task = tokio::spawn(async move {
            while let Some(nats_message) = subscriber.next().await {
                let message = match serde_json::from_slice::<Message>(&nats_message.payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(
                            topic = %task_topic,
                            error = %e,
                            "Failed to decode message, delivering as raw"
                        );
                        Message::raw(
                            task_topic.clone(),
                            serde_json::Value::String(
                                String::from_utf8_lossy(&nats_message.payload).into_owned(),
                            ),
                        )
                    }
                };

                let targets: Vec<Arc<dyn MessageHandler>> = {
                    let channels = fanout.read().unwrap_or_else(|e| e.into_inner());
                    channels
                        .values()
                        .filter(|sub| sub.selector.matches(&message))
                        .map(|sub| sub.handler.clone())
                        .collect()
                };
                for handler in targets {
                    handler.on_message(message.clone());
                }
            }
        });

        info!(topic = %topic, channel = %channel, "Subscribed NATS topic");
        topics.insert(topic, TopicSub { channels, task });
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let topic = channel::topic_of(channel);
        let mut topics = self.topics.lock().await;
        let Some(topic_sub) = topics.get(topic) else {
            return Ok(());
        };

        let empty = {
            let mut channels = topic_sub
                .channels
                .write()
                .unwrap_or_else(|e| e.into_inner());
            channels.remove(channel);
            channels.is_empty()
        };

        // The topic subscription stays alive while other channels use it.
        if empty {
            if let Some(topic_sub) = topics.remove(topic) {
                topic_sub.task.abort();
            }
            debug!(topic = %topic, "Closed NATS topic subscription");
        }
        debug!(channel = %channel, "Unsubscribed NATS channel");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Recipient;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Collector {
        received: Mutex<Vec<Message>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
            })
        }
    }

    impl MessageHandler for Collector {
        fn on_message(&self, message: Message) {
            self.received.lock().unwrap().push(message);
        }
    }

    // Integration tests require a running NATS server:
    //   docker run -d -p 4222:4222 nats:latest

    #[tokio::test]
    #[ignore = "Requires NATS"]
    async fn test_nats_round_trip() {
        let config = NatsBusConfig::default();
        let producer = NatsTransport::connect(config.clone(), "producer-1")
            .await
            .unwrap();
        let consumer = NatsTransport::connect(config, "ep-1").await.unwrap();

        let collector = Collector::new();
        consumer
            .subscribe("itest.nats", collector.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        producer
            .publish(
                "itest.nats.sub",
                Message::event("itest.nats.sub", serde_json::json!({"n": 1})),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let received = collector.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, "itest.nats.sub");
        assert_eq!(received[0].sender(), Some("producer-1"));
    }

    #[tokio::test]
    #[ignore = "Requires NATS"]
    async fn test_nats_shared_topic_fanout() {
        let config = NatsBusConfig::default();
        let producer = NatsTransport::connect(config.clone(), "producer-1")
            .await
            .unwrap();
        let consumer = NatsTransport::connect(config, "ep-1").await.unwrap();

        // Two channels under the same topic share one subscription,
        // but each only sees its own traffic.
        let chat = Collector::new();
        let jobs = Collector::new();
        consumer.subscribe("itest2.chat", chat.clone()).await.unwrap();
        consumer.subscribe("itest2.jobs", jobs.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        producer
            .publish("itest2.chat", Message::event("itest2.chat", serde_json::json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(chat.received.lock().unwrap().len(), 1);
        assert!(jobs.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "Requires NATS"]
    async fn test_nats_recipient_filtering() {
        let config = NatsBusConfig::default();
        let producer = NatsTransport::connect(config.clone(), "producer-1")
            .await
            .unwrap();
        let consumer = NatsTransport::connect(config, "ep-b").await.unwrap();

        let collector = Collector::new();
        consumer
            .subscribe("itest3.addressed", collector.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut addressed = Message::event("itest3.addressed", serde_json::json!({}));
        addressed.address(&[Recipient::session("ep-a")]);
        producer.publish("itest3.addressed", addressed).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(collector.received.lock().unwrap().is_empty());
    }
}
