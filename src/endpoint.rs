//! Session endpoints and the process-wide endpoint registry.
//!
//! An endpoint models one connected UI session. Every piece of work that
//! touches an endpoint's listeners goes through its mailbox, a single
//! queue drained by one task, so listener code never sees concurrent
//! calls. Closing the endpoint closes the mailbox; late posts fail with
//! `EndpointClosed` and an endpoint never comes back to life.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, Result};
use crate::manager::LocalEventManager;

type Task = Box<dyn FnOnce() + Send>;

/// One connected session endpoint.
pub struct Endpoint {
    id: String,
    events: Arc<LocalEventManager>,
    tasks: Mutex<Option<mpsc::UnboundedSender<Task>>>,
}

impl Endpoint {
    /// Create an endpoint and start its mailbox.
    pub fn new(id: &str) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let mailbox_id = id.to_string();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            debug!(endpoint_id = %mailbox_id, "Endpoint mailbox drained");
        });

        Arc::new(Self {
            id: id.to_string(),
            events: Arc::new(LocalEventManager::new(id)),
            tasks: Mutex::new(Some(tx)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// This endpoint's event manager.
    pub fn events(&self) -> &Arc<LocalEventManager> {
        &self.events
    }

    /// Queue work onto the endpoint's mailbox.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        let guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(BusError::EndpointClosed(self.id.clone()));
        };
        tx.send(Box::new(task))
            .map_err(|_| BusError::EndpointClosed(self.id.clone()))
    }

    pub fn is_alive(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Close the mailbox and drop every subscription.
    ///
    /// Already queued tasks still run; new posts fail. Shutdown is
    /// permanent.
    pub async fn shutdown(&self) {
        let closed = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if !closed {
            return;
        }
        if let Err(e) = self.events.clear().await {
            error!(endpoint_id = %self.id, error = %e, "Failed to clear subscriptions");
        }
        info!(endpoint_id = %self.id, "Endpoint shut down");
    }
}

/// Process-wide registry of live endpoints.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under its id.
    ///
    /// Re-registering an id replaces the previous endpoint; the replaced
    /// instance is returned so the caller can shut it down.
    pub fn register(&self, endpoint: Arc<Endpoint>) -> Option<Arc<Endpoint>> {
        let replaced = self
            .endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.id().to_string(), endpoint.clone());
        if replaced.is_some() {
            warn!(endpoint_id = %endpoint.id(), "Endpoint re-registered, replacing previous instance");
        }
        replaced
    }

    pub fn remove(&self, endpoint_id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(endpoint_id)
    }

    pub fn get(&self, endpoint_id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint_id)
            .cloned()
    }

    /// All registered endpoints at this instant.
    pub fn snapshot(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
