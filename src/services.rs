//! Producer and consumer bookkeeping above the transport layer.
//!
//! `ProducerService` fans one publish out to every active producer, so a
//! process can feed several brokers at once and pause one without
//! dropping it. `ConsumerService` tracks one consumer per endpoint and
//! routes subscription changes to the right one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::bus::{BusError, Consumer, MessageHandler, Producer, Result};
use crate::message::Message;

struct ProducerEntry {
    producer: Arc<dyn Producer>,
    active: bool,
}

/// Registry of outbound transports.
#[derive(Default)]
pub struct ProducerService {
    producers: RwLock<HashMap<String, ProducerEntry>>,
}

impl ProducerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer under an id, active immediately.
    pub fn register(&self, producer_id: &str, producer: Arc<dyn Producer>) {
        self.producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                producer_id.to_string(),
                ProducerEntry {
                    producer,
                    active: true,
                },
            );
        debug!(producer_id = %producer_id, "Producer registered");
    }

    pub fn unregister(&self, producer_id: &str) {
        self.producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(producer_id);
    }

    /// Pause or resume a producer without dropping its connection.
    /// Returns false when the id is unknown.
    pub fn set_active(&self, producer_id: &str, active: bool) -> bool {
        let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
        match producers.get_mut(producer_id) {
            Some(entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, producer_id: &str) -> bool {
        self.producers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(producer_id)
            .map(|entry| entry.active)
            .unwrap_or(false)
    }

    /// Publish through every active producer.
    ///
    /// All producers are attempted; if any fail, the last error is
    /// returned after the rest have had their chance.
    pub async fn publish(&self, channel: &str, message: Message) -> Result<()> {
        let active: Vec<(String, Arc<dyn Producer>)> = {
            let producers = self.producers.read().unwrap_or_else(|e| e.into_inner());
            producers
                .iter()
                .filter(|(_, entry)| entry.active)
                .map(|(id, entry)| (id.clone(), entry.producer.clone()))
                .collect()
        };

        if active.is_empty() {
            warn!(channel = %channel, "No active producers, event not published");
            return Ok(());
        }

        let mut last_error = None;
        for (producer_id, producer) in active {
            if let Err(e) = producer.publish(channel, message.clone()).await {
                warn!(
                    producer_id = %producer_id,
                    channel = %channel,
                    error = %e,
                    "Producer failed to publish"
                );
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Registry of inbound transports, one per endpoint.
#[derive(Default)]
pub struct ConsumerService {
    consumers: RwLock<HashMap<String, Arc<dyn Consumer>>>,
}

impl ConsumerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint_id: &str, consumer: Arc<dyn Consumer>) {
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint_id.to_string(), consumer);
        debug!(endpoint_id = %endpoint_id, "Consumer registered");
    }

    pub fn unregister(&self, endpoint_id: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(endpoint_id)
    }

    fn get(&self, endpoint_id: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint_id)
            .cloned()
    }

    /// Open a channel subscription on the endpoint's consumer.
    pub async fn subscribe(
        &self,
        endpoint_id: &str,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let consumer = self.get(endpoint_id).ok_or_else(|| {
            BusError::Subscribe(format!("No consumer registered for endpoint '{}'", endpoint_id))
        })?;
        consumer.subscribe(channel, handler).await
    }

    /// Close a channel subscription. A missing consumer is not an
    /// error; teardown races are expected.
    pub async fn unsubscribe(&self, endpoint_id: &str, channel: &str) -> Result<()> {
        match self.get(endpoint_id) {
            Some(consumer) => consumer.unsubscribe(channel).await,
            None => {
                debug!(endpoint_id = %endpoint_id, channel = %channel, "Consumer already gone");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockTransport;

    #[tokio::test]
    async fn test_publish_fans_to_active_producers() {
        let service = ProducerService::new();
        let first = MockTransport::new("p-1");
        let second = MockTransport::new("p-2");
        service.register("p-1", first.clone());
        service.register("p-2", second.clone());

        service
            .publish("app", Message::event("app", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(first.published_count(), 1);
        assert_eq!(second.published_count(), 1);
    }

    #[tokio::test]
    async fn test_inactive_producer_is_skipped() {
        let service = ProducerService::new();
        let producer = MockTransport::new("p-1");
        service.register("p-1", producer.clone());
        assert!(service.set_active("p-1", false));
        assert!(!service.is_active("p-1"));

        service
            .publish("app", Message::event("app", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(producer.published_count(), 0);

        assert!(service.set_active("p-1", true));
        service
            .publish("app", Message::event("app", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(producer.published_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_producers() {
        let service = ProducerService::new();
        let failing = MockTransport::new("p-1");
        failing.set_fail_on_publish(true);
        let healthy = MockTransport::new("p-2");
        service.register("p-1", failing);
        service.register("p-2", healthy.clone());

        let result = service
            .publish("app", Message::event("app", serde_json::json!({})))
            .await;

        assert!(result.is_err());
        assert_eq!(healthy.published_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_producer_toggle() {
        let service = ProducerService::new();
        assert!(!service.set_active("nope", true));
    }

    #[tokio::test]
    async fn test_consumer_routing_by_endpoint() {
        let service = ConsumerService::new();
        let consumer = MockTransport::new("ep-1");
        service.register("ep-1", consumer.clone());

        struct Nop;
        impl MessageHandler for Nop {
            fn on_message(&self, _message: Message) {}
        }

        service
            .subscribe("ep-1", "app", Arc::new(Nop))
            .await
            .unwrap();
        assert_eq!(consumer.subscribed_channels(), vec!["app"]);

        service.unsubscribe("ep-1", "app").await.unwrap();
        assert!(consumer.subscribed_channels().is_empty());

        let missing = service.subscribe("ep-2", "app", Arc::new(Nop)).await;
        assert!(matches!(missing, Err(BusError::Subscribe(_))));
        // Unsubscribe tolerates a missing consumer.
        service.unsubscribe("ep-2", "app").await.unwrap();
    }
}
