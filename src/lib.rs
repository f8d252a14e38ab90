//! Deskbus - session-scoped publish/subscribe event bus.
//!
//! Connected UI sessions register as endpoints, subscribe listeners to
//! hierarchical event channels, and exchange events in-process or across
//! processes through a pluggable broker transport (AMQP, NATS, or an
//! in-memory hub). Named invocation queues let remote peers call into a
//! session over the same bus.

pub mod bootstrap;
pub mod bus;
pub mod channel;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod endpoint;
pub mod invoke;
pub mod manager;
pub mod message;
pub mod services;

pub use bus::{
    BusError, Consumer, MessageHandler, MessagingConfig, MessagingType, Producer, Result,
    TransportBackend,
};
pub use config::Config;
pub use context::BusContext;
pub use dispatch::GlobalEventDispatcher;
pub use endpoint::{Endpoint, EndpointRegistry};
pub use invoke::{InvocationQueue, InvocationRequest, InvocationTarget};
pub use manager::{EventListener, LocalEventManager};
pub use message::{Message, Recipient, RecipientType};
