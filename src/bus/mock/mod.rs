//! Mock transport for unit testing.
//!
//! Records every publish and subscription instead of talking to a broker,
//! and lets tests push inbound messages through the same selector
//! filtering the real adapters apply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{BusError, Consumer, MessageHandler, Producer, Result};
use crate::channel::{self, Selector};
use crate::message::{Message, ATTR_SENDER};

/// Recording transport double.
pub struct MockTransport {
    id: String,
    published: RwLock<Vec<(String, Message)>>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    subscribe_count: AtomicUsize,
    fail_on_publish: AtomicBool,
}

impl MockTransport {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            published: RwLock::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            subscribe_count: AtomicUsize::new(0),
            fail_on_publish: AtomicBool::new(false),
        })
    }

    /// Make subsequent publishes fail.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// All (channel, message) pairs recorded by `publish`.
    pub fn published(&self) -> Vec<(String, Message)> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn published_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Channels with a live subscription, sorted.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        channels.sort();
        channels
    }

    /// Number of subscriptions that actually opened (re-subscribes excluded).
    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    /// Simulate an inbound broker message, applying the same per-channel
    /// selector filtering the real adapters do.
    pub fn deliver(&self, message: &Message) {
        let handlers: Vec<(String, Arc<dyn MessageHandler>)> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(c, h)| (c.clone(), h.clone()))
            .collect();
        for (subscribed, handler) in handlers {
            if Selector::new(subscribed.as_str(), self.id.as_str()).matches(message) {
                handler.on_message(message.clone());
            }
        }
    }
}

#[async_trait]
impl Producer for MockTransport {
    async fn publish(&self, channel: &str, mut message: Message) -> Result<()> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("mock publish failure".to_string()));
        }
        if !channel::is_valid(channel) {
            return Err(BusError::InvalidChannel(channel.to_string()));
        }
        message.kind = channel.to_string();
        message
            .metadata
            .entry(ATTR_SENDER.to_string())
            .or_insert_with(|| self.id.clone());
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel.to_string(), message));
        Ok(())
    }
}

#[async_trait]
impl Consumer for MockTransport {
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if !channel::is_valid(channel) {
            return Err(BusError::InvalidChannel(channel.to_string()));
        }
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(channel) {
            return Ok(());
        }
        handlers.insert(channel.to_string(), handler);
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel);
        Ok(())
    }
}
