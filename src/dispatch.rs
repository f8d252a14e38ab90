//! Cross-endpoint event dispatch.
//!
//! The `GlobalEventDispatcher` trait is the seam between an endpoint's
//! local event manager and the rest of the world. Two implementations:
//! `InProcessDispatcher` walks the endpoint registry directly, and
//! `BrokerDispatcher` routes through a transport so endpoints in other
//! processes take part too.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::{BusError, MessageHandler, Result};
use crate::channel;
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::message::{Message, Recipient, ATTR_SENDER};
use crate::services::{ConsumerService, ProducerService};

/// Routes events and subscription state changes beyond one endpoint.
#[async_trait]
pub trait GlobalEventDispatcher: Send + Sync {
    /// Deliver an event fired by `origin` to every other endpoint the
    /// recipients allow. An empty recipient list broadcasts.
    async fn fire_remote_event(
        &self,
        origin: &str,
        event: Message,
        recipients: &[Recipient],
    ) -> Result<()>;

    /// Track that `origin` gained (`active`) or lost its last listener
    /// on a channel, so broker-side resources follow the demand.
    async fn subscribe_remote_event(
        &self,
        origin: &str,
        event_channel: &str,
        active: bool,
    ) -> Result<()>;
}

/// True when an event is for this endpoint: unaddressed events go to
/// everyone, addressed events only to the listed endpoints.
fn addressed_to(event: &Message, endpoint_id: &str) -> bool {
    match event.recipients() {
        None => true,
        Some(encoded) if encoded.is_empty() => true,
        Some(encoded) => channel::recipients_contain(encoded, endpoint_id),
    }
}

// ============================================================================
// In-process dispatch
// ============================================================================

/// Dispatcher for a single-process deployment: events cross endpoints
/// through the registry, no broker involved.
pub struct InProcessDispatcher {
    endpoints: Arc<EndpointRegistry>,
}

impl InProcessDispatcher {
    pub fn new(endpoints: Arc<EndpointRegistry>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl GlobalEventDispatcher for InProcessDispatcher {
    async fn fire_remote_event(
        &self,
        origin: &str,
        mut event: Message,
        _recipients: &[Recipient],
    ) -> Result<()> {
        event
            .metadata
            .insert(ATTR_SENDER.to_string(), origin.to_string());

        for endpoint in self.endpoints.snapshot() {
            // The origin already delivered to itself.
            if endpoint.id() == origin || !addressed_to(&event, endpoint.id()) {
                continue;
            }
            let events = endpoint.events().clone();
            let delivery = event.clone();
            if let Err(e) = endpoint.post(move || events.deliver(&delivery)) {
                warn!(
                    endpoint_id = %endpoint.id(),
                    channel = %event.kind,
                    error = %e,
                    "Skipping closed endpoint"
                );
            }
        }
        Ok(())
    }

    async fn subscribe_remote_event(
        &self,
        origin: &str,
        event_channel: &str,
        active: bool,
    ) -> Result<()> {
        // Nothing to provision without a broker.
        debug!(
            endpoint_id = %origin,
            channel = %event_channel,
            active = active,
            "Subscription state changed"
        );
        Ok(())
    }
}

// ============================================================================
// Broker dispatch
// ============================================================================

/// Feeds broker messages back into an endpoint's mailbox.
struct Reinjector {
    endpoint: Weak<Endpoint>,
}

impl MessageHandler for Reinjector {
    fn on_message(&self, message: Message) {
        let Some(endpoint) = self.endpoint.upgrade() else {
            return;
        };
        // The broker echoes our own publishes back to us.
        if message.sender() == Some(endpoint.id()) {
            return;
        }
        let events = endpoint.events().clone();
        if let Err(e) = endpoint.post(move || events.deliver(&message)) {
            warn!(endpoint_id = %endpoint.id(), error = %e, "Dropping message for closed endpoint");
        }
    }
}

/// Dispatcher for multi-process deployments: publishes go out through
/// the producer service, and per-endpoint consumers reinject inbound
/// traffic into the owning endpoint's mailbox.
pub struct BrokerDispatcher {
    endpoints: Arc<EndpointRegistry>,
    producers: Arc<ProducerService>,
    consumers: Arc<ConsumerService>,
}

impl BrokerDispatcher {
    pub fn new(
        endpoints: Arc<EndpointRegistry>,
        producers: Arc<ProducerService>,
        consumers: Arc<ConsumerService>,
    ) -> Self {
        Self {
            endpoints,
            producers,
            consumers,
        }
    }
}

#[async_trait]
impl GlobalEventDispatcher for BrokerDispatcher {
    async fn fire_remote_event(
        &self,
        origin: &str,
        mut event: Message,
        _recipients: &[Recipient],
    ) -> Result<()> {
        event
            .metadata
            .insert(ATTR_SENDER.to_string(), origin.to_string());
        let event_channel = event.kind.clone();
        self.producers.publish(&event_channel, event).await
    }

    async fn subscribe_remote_event(
        &self,
        origin: &str,
        event_channel: &str,
        active: bool,
    ) -> Result<()> {
        if active {
            let endpoint = self.endpoints.get(origin).ok_or_else(|| {
                BusError::Subscribe(format!("Endpoint '{}' is not registered", origin))
            })?;
            let handler = Arc::new(Reinjector {
                endpoint: Arc::downgrade(&endpoint),
            });
            self.consumers.subscribe(origin, event_channel, handler).await
        } else {
            self.consumers.unsubscribe(origin, event_channel).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::EventListener;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &Message) -> Result<()> {
            self.seen.lock().unwrap().push(event.kind.clone());
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_in_process_broadcast_skips_origin() {
        let registry = Arc::new(EndpointRegistry::new());
        let ep_a = Endpoint::new("ep-a");
        let ep_b = Endpoint::new("ep-b");
        registry.register(ep_a.clone());
        registry.register(ep_b.clone());

        let on_a = Recorder::new();
        let on_b = Recorder::new();
        ep_a.events().subscribe("app", on_a.clone()).await.unwrap();
        ep_b.events().subscribe("app", on_b.clone()).await.unwrap();

        let dispatcher = InProcessDispatcher::new(registry);
        dispatcher
            .fire_remote_event("ep-a", Message::event("app", serde_json::json!({})), &[])
            .await
            .unwrap();
        settle().await;

        assert!(on_a.seen().is_empty());
        assert_eq!(on_b.seen(), vec!["app"]);
    }

    #[tokio::test]
    async fn test_in_process_honors_recipients() {
        let registry = Arc::new(EndpointRegistry::new());
        let ep_b = Endpoint::new("ep-b");
        let ep_c = Endpoint::new("ep-c");
        registry.register(ep_b.clone());
        registry.register(ep_c.clone());

        let on_b = Recorder::new();
        let on_c = Recorder::new();
        ep_b.events().subscribe("app", on_b.clone()).await.unwrap();
        ep_c.events().subscribe("app", on_c.clone()).await.unwrap();

        let mut event = Message::event("app", serde_json::json!({}));
        event.address(&[Recipient::session("ep-b")]);

        let dispatcher = InProcessDispatcher::new(registry);
        dispatcher
            .fire_remote_event("ep-a", event, &[Recipient::session("ep-b")])
            .await
            .unwrap();
        settle().await;

        assert_eq!(on_b.seen(), vec!["app"]);
        assert!(on_c.seen().is_empty());
    }

    #[tokio::test]
    async fn test_in_process_skips_closed_endpoints() {
        let registry = Arc::new(EndpointRegistry::new());
        let ep_b = Endpoint::new("ep-b");
        registry.register(ep_b.clone());
        ep_b.shutdown().await;

        let dispatcher = InProcessDispatcher::new(registry);
        // Must not error even though the only target is closed.
        dispatcher
            .fire_remote_event("ep-a", Message::event("app", serde_json::json!({})), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reinjector_skips_own_sender() {
        let endpoint = Endpoint::new("ep-a");
        let listener = Recorder::new();
        endpoint
            .events()
            .subscribe("app", listener.clone())
            .await
            .unwrap();

        let reinjector = Reinjector {
            endpoint: Arc::downgrade(&endpoint),
        };

        let mut own = Message::event("app", serde_json::json!({}));
        own.metadata
            .insert(ATTR_SENDER.to_string(), "ep-a".to_string());
        reinjector.on_message(own);

        let mut other = Message::event("app", serde_json::json!({}));
        other
            .metadata
            .insert(ATTR_SENDER.to_string(), "ep-b".to_string());
        reinjector.on_message(other);
        settle().await;

        assert_eq!(listener.seen(), vec!["app"]);
    }
}
