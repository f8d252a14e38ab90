//! Invocation request queues.
//!
//! A UI session exposes callable surfaces to remote peers as named
//! queues. Requests arrive over the bus on the `invoke` channel, are
//! matched to a queue by name, and run on the owner endpoint's mailbox.
//! Queues carry a keep-alive clock; one that goes quiet past its
//! timeout is considered dead and reaped. Closing is one-way and fires
//! the close callback exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::{BusError, Result};
use crate::endpoint::Endpoint;
use crate::manager::EventListener;
use crate::message::Message;

/// Channel carrying invocation requests.
pub const INVOKE_CHANNEL: &str = "invoke";

/// Bus channel for one named queue.
pub fn queue_channel(name: &str) -> String {
    format!("{}.{}", INVOKE_CHANNEL, name)
}

/// One method call requested by a remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Build the message a caller fires on a queue's request channel to
/// invoke `method` on the queue's target.
pub fn request_message(queue_name: &str, method: &str, args: Vec<serde_json::Value>) -> Message {
    let payload = serde_json::json!({
        "method": method,
        "args": args,
    });
    Message::event(queue_channel(queue_name), payload)
}

/// Receiver side of a queue: gets every request sent to it.
pub trait InvocationTarget: Send + Sync {
    fn invoke(&self, request: InvocationRequest);
}

type CloseCallback = Box<dyn FnOnce() + Send>;

/// A named invocation queue owned by one endpoint.
///
/// The owner is held weakly; a queue never keeps a torn-down endpoint
/// alive.
pub struct InvocationQueue {
    name: String,
    owner_id: String,
    owner: Weak<Endpoint>,
    target: Arc<dyn InvocationTarget>,
    keep_alive_timeout: Duration,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
}

impl InvocationQueue {
    fn new(
        name: &str,
        owner: &Arc<Endpoint>,
        target: Arc<dyn InvocationTarget>,
        on_close: CloseCallback,
        keep_alive_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            owner_id: owner.id().to_string(),
            owner: Arc::downgrade(owner),
            target,
            keep_alive_timeout,
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(Some(on_close)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner_id
    }

    /// Reset the keep-alive clock.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn expired(&self) -> bool {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
            > self.keep_alive_timeout
    }

    /// A queue is alive until closed or its keep-alive lapses.
    ///
    /// Observing an expired queue closes it, so the close callback fires
    /// before the first not-alive answer.
    pub fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if self.expired() {
            self.close();
            return false;
        }
        true
    }

    /// Post a request onto the owner's mailbox, fire-and-forget. The
    /// target always runs in the owner's execution context, never on
    /// the caller's thread. Requests arriving after close, or once the
    /// owner endpoint is gone, are dropped.
    pub fn send_request(&self, request: InvocationRequest) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(queue = %self.name, method = %request.method, "Dropping request for closed queue");
            return;
        }
        self.touch();
        let Some(owner) = self.owner.upgrade() else {
            debug!(queue = %self.name, method = %request.method, "Owner endpoint gone, dropping request");
            return;
        };
        let target = self.target.clone();
        if let Err(e) = owner.post(move || target.invoke(request)) {
            debug!(queue = %self.name, error = %e, "Owner mailbox closed, dropping request");
        }
    }

    /// Close the queue. The close callback fires exactly once, no
    /// matter how many times or from how many threads this is called.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = self
            .on_close
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(callback) = callback {
            callback();
        }
        info!(queue = %self.name, owner = %self.owner_id, "Invocation queue closed");
    }
}

/// Bus listener feeding one queue from its `invoke.{name}` channel.
///
/// Holds the queue weakly so a reaped queue is not kept alive by its
/// subscription.
pub struct RequestListener {
    queue: Weak<InvocationQueue>,
}

impl RequestListener {
    pub fn new(queue: &Arc<InvocationQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::downgrade(queue),
        })
    }
}

impl EventListener for RequestListener {
    fn on_event(&self, event: &Message) -> Result<()> {
        let Some(queue) = self.queue.upgrade() else {
            return Ok(());
        };
        let request: InvocationRequest = serde_json::from_value(event.payload.clone())?;
        queue.send_request(request);
        Ok(())
    }
}

/// Process-wide registry of open invocation queues, keyed by name.
#[derive(Default)]
pub struct InvocationQueueRegistry {
    queues: RwLock<HashMap<String, Arc<InvocationQueue>>>,
}

impl InvocationQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a queue. Names are unique across the process.
    pub fn open(
        &self,
        name: &str,
        owner: &Arc<Endpoint>,
        target: Arc<dyn InvocationTarget>,
        on_close: CloseCallback,
        keep_alive_timeout: Duration,
    ) -> Result<Arc<InvocationQueue>> {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if queues.contains_key(name) {
            return Err(BusError::DuplicateQueue(name.to_string()));
        }
        let queue = InvocationQueue::new(name, owner, target, on_close, keep_alive_timeout);
        queues.insert(name.to_string(), queue.clone());
        info!(queue = %name, owner = %owner.id(), "Invocation queue opened");
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> Option<Arc<InvocationQueue>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Close and drop one queue by name.
    pub fn close(&self, name: &str) {
        let queue = self
            .queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if let Some(queue) = queue {
            queue.close();
        }
    }

    /// Close every queue owned by an endpoint. Called when the endpoint
    /// goes away.
    pub fn close_owned(&self, endpoint_id: &str) {
        let owned: Vec<Arc<InvocationQueue>> = {
            let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
            let names: Vec<String> = queues
                .values()
                .filter(|q| q.owner() == endpoint_id)
                .map(|q| q.name().to_string())
                .collect();
            names.iter().filter_map(|n| queues.remove(n)).collect()
        };
        for queue in owned {
            queue.close();
        }
    }

    /// Close queues whose keep-alive clock has lapsed.
    pub fn reap_expired(&self) {
        let dead: Vec<Arc<InvocationQueue>> = {
            let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
            let names: Vec<String> = queues
                .values()
                .filter(|q| q.expired())
                .map(|q| q.name().to_string())
                .collect();
            names.iter().filter_map(|n| queues.remove(n)).collect()
        };
        for queue in dead {
            warn!(queue = %queue.name(), "Keep-alive lapsed, closing queue");
            queue.close();
        }
    }

    pub fn len(&self) -> usize {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
