//! Per-endpoint event subscriptions and delivery.
//!
//! Each endpoint owns one `LocalEventManager`. Listeners subscribe to
//! hierarchical channels; local events deliver synchronously on the
//! caller, remote events additionally cross the global dispatcher to
//! other endpoints. The manager tracks which channels have at least one
//! listener and keeps the dispatcher's remote subscriptions in step.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, warn};

use crate::bus::{BusError, Result};
use crate::channel;
use crate::dispatch::GlobalEventDispatcher;
use crate::message::{Message, Recipient};

/// Callback invoked for every event matching a subscribed channel.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Message) -> Result<()>;
}

/// Subscription registry and delivery engine for one endpoint.
pub struct LocalEventManager {
    endpoint_id: String,
    subscriptions: RwLock<HashMap<String, Vec<Arc<dyn EventListener>>>>,
    dispatcher: RwLock<Option<Arc<dyn GlobalEventDispatcher>>>,
}

impl LocalEventManager {
    pub fn new(endpoint_id: &str) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            subscriptions: RwLock::new(HashMap::new()),
            dispatcher: RwLock::new(None),
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Attach the dispatcher used for cross-endpoint traffic.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn GlobalEventDispatcher>) {
        *self
            .dispatcher
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(dispatcher);
    }

    fn dispatcher(&self) -> Option<Arc<dyn GlobalEventDispatcher>> {
        self.dispatcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register a listener for a channel.
    ///
    /// The same listener instance subscribes at most once per channel.
    /// The first listener on a channel activates the remote subscription.
    pub async fn subscribe(
        &self,
        event_channel: &str,
        listener: Arc<dyn EventListener>,
    ) -> Result<()> {
        if !channel::is_valid(event_channel) {
            return Err(BusError::InvalidChannel(event_channel.to_string()));
        }

        let first = {
            let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
            let listeners = subs.entry(event_channel.to_string()).or_default();
            if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                return Ok(());
            }
            listeners.push(listener);
            listeners.len() == 1
        };

        if first {
            debug!(
                endpoint_id = %self.endpoint_id,
                channel = %event_channel,
                "First listener, activating remote subscription"
            );
            if let Some(dispatcher) = self.dispatcher() {
                dispatcher
                    .subscribe_remote_event(&self.endpoint_id, event_channel, true)
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove a listener from a channel.
    ///
    /// Removing the last listener deactivates the remote subscription.
    pub async fn unsubscribe(
        &self,
        event_channel: &str,
        listener: &Arc<dyn EventListener>,
    ) -> Result<()> {
        let last = {
            let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
            let Some(listeners) = subs.get_mut(event_channel) else {
                return Ok(());
            };
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
            if listeners.is_empty() {
                subs.remove(event_channel);
                true
            } else {
                false
            }
        };

        if last {
            debug!(
                endpoint_id = %self.endpoint_id,
                channel = %event_channel,
                "Last listener removed, deactivating remote subscription"
            );
            if let Some(dispatcher) = self.dispatcher() {
                dispatcher
                    .subscribe_remote_event(&self.endpoint_id, event_channel, false)
                    .await?;
            }
        }
        Ok(())
    }

    /// Channels that currently have at least one listener, sorted.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        channels.sort();
        channels
    }

    /// Deliver an event to every listener whose channel matches.
    ///
    /// A failing listener is logged and skipped; it never blocks the
    /// others.
    pub fn deliver(&self, event: &Message) {
        let targets: Vec<Arc<dyn EventListener>> = {
            let subs = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|(subscribed, _)| channel::channel_matches(&event.kind, subscribed))
                .flat_map(|(_, listeners)| listeners.iter().cloned())
                .collect()
        };
        for listener in targets {
            if let Err(e) = listener.on_event(event) {
                error!(
                    endpoint_id = %self.endpoint_id,
                    channel = %event.kind,
                    error = %e,
                    "Event listener failed"
                );
            }
        }
    }

    /// Fire an event visible only to this endpoint's listeners.
    pub fn fire_local_event(&self, event: Message) {
        self.deliver(&event);
    }

    /// Fire an event to this endpoint and, through the dispatcher, to
    /// every other endpoint the recipients allow.
    ///
    /// An empty recipient list broadcasts to all endpoints.
    pub async fn fire_remote_event(
        &self,
        mut event: Message,
        recipients: &[Recipient],
    ) -> Result<()> {
        event.address(recipients);
        self.deliver(&event);

        match self.dispatcher() {
            Some(dispatcher) => {
                dispatcher
                    .fire_remote_event(&self.endpoint_id, event, recipients)
                    .await
            }
            None => {
                warn!(
                    endpoint_id = %self.endpoint_id,
                    channel = %event.kind,
                    "No dispatcher attached, remote event stays local"
                );
                Ok(())
            }
        }
    }

    /// Drop every subscription, deactivating all remote subscriptions.
    pub async fn clear(&self) -> Result<()> {
        let channels: Vec<String> = {
            let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
            subs.drain().map(|(c, _)| c).collect()
        };
        if let Some(dispatcher) = self.dispatcher() {
            for event_channel in &channels {
                if let Err(e) = dispatcher
                    .subscribe_remote_event(&self.endpoint_id, event_channel, false)
                    .await
                {
                    error!(
                        endpoint_id = %self.endpoint_id,
                        channel = %event_channel,
                        error = %e,
                        "Failed to deactivate remote subscription"
                    );
                }
            }
        }
        Ok(())
    }
}
