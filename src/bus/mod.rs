//! Broker transport adapters for cross-process event delivery.
//!
//! This module contains:
//! - `Producer`/`Consumer` traits: the transport capability contract
//! - `MessageHandler` trait: callback for inbound messages
//! - Transport configuration types and the backend factory
//! - Implementations: AMQP (RabbitMQ), NATS, in-memory, mock

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::message::Message;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "memory")]
pub mod memory;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
#[cfg(feature = "memory")]
pub use memory::{MemoryHub, MemoryTransport};
pub use mock::MockTransport;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Invalid channel name: '{0}'")]
    InvalidChannel(String),

    #[error("Endpoint '{0}' is closed")]
    EndpointClosed(String),

    #[error("Invocation queue '{0}' is already registered")]
    DuplicateQueue(String),

    #[error("Listener failed: {0}")]
    Listener(String),

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Publishing capability of a transport adapter.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publish a message on a channel.
    ///
    /// The adapter sets the message's `type` to the channel name and adds
    /// the `sender` wire attribute before the hop.
    async fn publish(&self, channel: &str, message: Message) -> Result<()>;
}

/// Callback for messages received from a transport.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: Message);
}

/// Consuming capability of a transport adapter.
///
/// A consumer instance is bound to one local endpoint id; its
/// subscriptions are filtered so only messages addressed to that endpoint
/// (or to all endpoints) reach the handler.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Open a subscription for a channel. Subscribing an already
    /// subscribed channel is a no-op.
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Tear down the subscription for a channel and the broker-side
    /// resources it created. Shared topic-level resources used by other
    /// channels are left untouched.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-memory transport (single process, no external broker).
    #[default]
    Memory,
    /// AMQP/RabbitMQ messaging (exchange/binding style).
    Amqp,
    /// NATS messaging (topic/queue style).
    Nats,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpBusConfig,
    /// NATS-specific configuration.
    pub nats: NatsBusConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpBusConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Name of the shared topic exchange all channels bind to.
    pub exchange: String,
}

impl Default for AmqpBusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "deskbus.events".to_string(),
        }
    }
}

/// NATS-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsBusConfig {
    /// NATS connection URL.
    pub url: String,
}

impl Default for NatsBusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Transport backend selected by configuration.
///
/// Producers are process-wide; consumers are created per endpoint because
/// every subscription is scoped by the local endpoint id.
pub enum TransportBackend {
    #[cfg(feature = "memory")]
    Memory(Arc<memory::MemoryHub>),
    #[cfg(feature = "amqp")]
    Amqp(AmqpBusConfig),
    #[cfg(feature = "nats")]
    Nats(NatsBusConfig),
}

impl TransportBackend {
    /// Select the backend for a messaging configuration.
    ///
    /// Fails when the corresponding cargo feature is disabled.
    pub fn from_config(
        config: &MessagingConfig,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        match config.messaging_type {
            MessagingType::Memory => {
                #[cfg(feature = "memory")]
                {
                    info!(messaging_type = "memory", "Transport backend selected");
                    Ok(Self::Memory(MemoryHub::new()))
                }
                #[cfg(not(feature = "memory"))]
                {
                    Err("In-memory transport requires the 'memory' feature".into())
                }
            }
            MessagingType::Amqp => {
                #[cfg(feature = "amqp")]
                {
                    info!(
                        messaging_type = "amqp",
                        url = %config.amqp.url,
                        "Transport backend selected"
                    );
                    Ok(Self::Amqp(config.amqp.clone()))
                }
                #[cfg(not(feature = "amqp"))]
                {
                    Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .into())
                }
            }
            MessagingType::Nats => {
                #[cfg(feature = "nats")]
                {
                    info!(
                        messaging_type = "nats",
                        url = %config.nats.url,
                        "Transport backend selected"
                    );
                    Ok(Self::Nats(config.nats.clone()))
                }
                #[cfg(not(feature = "nats"))]
                {
                    Err("NATS support requires the 'nats' feature. Rebuild with --features nats"
                        .into())
                }
            }
        }
    }

    /// Create the process-wide producer for this backend.
    pub async fn producer(&self, producer_id: &str) -> Result<Arc<dyn Producer>> {
        match self {
            #[cfg(feature = "memory")]
            Self::Memory(hub) => Ok(Arc::new(MemoryTransport::new(hub.clone(), producer_id))),
            #[cfg(feature = "amqp")]
            Self::Amqp(config) => Ok(Arc::new(
                AmqpTransport::connect(config.clone(), producer_id).await?,
            )),
            #[cfg(feature = "nats")]
            Self::Nats(config) => Ok(Arc::new(
                NatsTransport::connect(config.clone(), producer_id).await?,
            )),
        }
    }

    /// Create a consumer bound to one endpoint id.
    pub async fn consumer(&self, endpoint_id: &str) -> Result<Arc<dyn Consumer>> {
        match self {
            #[cfg(feature = "memory")]
            Self::Memory(hub) => Ok(Arc::new(MemoryTransport::new(hub.clone(), endpoint_id))),
            #[cfg(feature = "amqp")]
            Self::Amqp(config) => Ok(Arc::new(
                AmqpTransport::connect(config.clone(), endpoint_id).await?,
            )),
            #[cfg(feature = "nats")]
            Self::Nats(config) => Ok(Arc::new(
                NatsTransport::connect(config.clone(), endpoint_id).await?,
            )),
        }
    }
}
