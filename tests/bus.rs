//! End-to-end tests over the in-memory transport.
//!
//! Exercise the full path: endpoint registration, listener subscription,
//! dispatcher fan-out through the transport, recipient addressing, and
//! invocation queues fed from the bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use deskbus::invoke::{request_message, InvocationRequest, InvocationTarget};
use deskbus::{BusContext, EventListener, Message, MessagingConfig, Recipient, Result};

struct Recorder {
    seen: Mutex<Vec<Message>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn kinds(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.kind.clone())
            .collect()
    }
}

impl EventListener for Recorder {
    fn on_event(&self, event: &Message) -> Result<()> {
        self.seen.lock().unwrap().push(event.clone());
        Ok(())
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn memory_context() -> BusContext {
    BusContext::with_messaging(&MessagingConfig::default())
        .await
        .expect("memory backend")
}

#[tokio::test]
async fn event_crosses_endpoints_through_transport() {
    let context = memory_context().await;
    let ep_a = context.create_endpoint("ep-a").await.unwrap();
    let ep_b = context.create_endpoint("ep-b").await.unwrap();

    let on_a = Recorder::new();
    let on_b = Recorder::new();
    ep_a.events().subscribe("doc", on_a.clone()).await.unwrap();
    ep_b.events().subscribe("doc", on_b.clone()).await.unwrap();
    settle().await;

    ep_a.events()
        .fire_remote_event(
            Message::event("doc.saved", serde_json::json!({"path": "/tmp/x"})),
            &[],
        )
        .await
        .unwrap();
    settle().await;

    // The origin sees it once (local delivery), the peer once (transport).
    assert_eq!(on_a.kinds(), vec!["doc.saved"]);
    assert_eq!(on_b.kinds(), vec!["doc.saved"]);
    let received = on_b.seen.lock().unwrap();
    assert_eq!(received[0].sender(), Some("ep-a"));
    assert_eq!(received[0].payload["path"], "/tmp/x");
}

#[tokio::test]
async fn addressed_event_reaches_only_named_endpoints() {
    let context = memory_context().await;
    let ep_a = context.create_endpoint("ep-a").await.unwrap();
    let ep_b = context.create_endpoint("ep-b").await.unwrap();
    let ep_c = context.create_endpoint("ep-c").await.unwrap();

    let on_b = Recorder::new();
    let on_c = Recorder::new();
    ep_b.events().subscribe("chat", on_b.clone()).await.unwrap();
    ep_c.events().subscribe("chat", on_c.clone()).await.unwrap();
    settle().await;

    ep_a.events()
        .fire_remote_event(
            Message::event("chat", serde_json::json!({"text": "hi"})),
            &[Recipient::session("ep-b")],
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(on_b.kinds(), vec!["chat"]);
    assert!(on_c.kinds().is_empty());
}

#[tokio::test]
async fn unsubscribe_stops_cross_endpoint_delivery() {
    let context = memory_context().await;
    let ep_a = context.create_endpoint("ep-a").await.unwrap();
    let ep_b = context.create_endpoint("ep-b").await.unwrap();

    let on_b = Recorder::new();
    ep_b.events().subscribe("jobs", on_b.clone()).await.unwrap();
    settle().await;

    ep_a.events()
        .fire_remote_event(Message::event("jobs", serde_json::json!({"n": 1})), &[])
        .await
        .unwrap();
    settle().await;

    let listener: Arc<dyn EventListener> = on_b.clone();
    ep_b.events().unsubscribe("jobs", &listener).await.unwrap();
    settle().await;

    ep_a.events()
        .fire_remote_event(Message::event("jobs", serde_json::json!({"n": 2})), &[])
        .await
        .unwrap();
    settle().await;

    assert_eq!(on_b.kinds().len(), 1);
}

#[tokio::test]
async fn invocation_request_travels_over_the_bus() {
    let context = memory_context().await;
    let ep_a = context.create_endpoint("ep-a").await.unwrap();
    let ep_b = context.create_endpoint("ep-b").await.unwrap();

    struct Spy {
        calls: Mutex<Vec<InvocationRequest>>,
    }
    impl InvocationTarget for Spy {
        fn invoke(&self, request: InvocationRequest) {
            self.calls.lock().unwrap().push(request);
        }
    }

    let target = Arc::new(Spy {
        calls: Mutex::new(Vec::new()),
    });
    context
        .open_queue("render", &ep_a, target.clone(), Box::new(|| {}))
        .await
        .unwrap();
    settle().await;

    ep_b.events()
        .fire_remote_event(
            request_message("render", "refresh", vec![serde_json::json!(42)]),
            &[],
        )
        .await
        .unwrap();
    settle().await;

    let calls = target.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, "refresh");
    assert_eq!(calls[0].args, vec![serde_json::json!(42)]);
}

#[tokio::test]
async fn destroyed_endpoint_no_longer_receives() {
    let context = memory_context().await;
    let ep_a = context.create_endpoint("ep-a").await.unwrap();
    let ep_b = context.create_endpoint("ep-b").await.unwrap();

    let on_b = Recorder::new();
    ep_b.events().subscribe("app", on_b.clone()).await.unwrap();
    settle().await;

    context.destroy_endpoint("ep-b").await;
    settle().await;

    ep_a.events()
        .fire_remote_event(Message::event("app", serde_json::json!({})), &[])
        .await
        .unwrap();
    settle().await;

    assert!(on_b.kinds().is_empty());
    assert!(!ep_b.is_alive());
}
