//! Process-wide bus context.
//!
//! `BusContext` wires the registries, services, and dispatcher together
//! and owns endpoint lifecycle: creating an endpoint provisions its
//! consumer, destroying one tears down its queues, subscriptions, and
//! mailbox in that order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::{BusError, MessagingConfig, Result, TransportBackend};
use crate::config::Config;
use crate::dispatch::{BrokerDispatcher, GlobalEventDispatcher, InProcessDispatcher};
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::invoke::{
    queue_channel, InvocationQueue, InvocationQueueRegistry, InvocationTarget, RequestListener,
};
use crate::manager::EventListener;
use crate::services::{ConsumerService, ProducerService};

/// Id the process-wide producer registers under.
pub const DEFAULT_PRODUCER: &str = "default";

/// Everything a process needs to run session endpoints on the bus.
pub struct BusContext {
    endpoints: Arc<EndpointRegistry>,
    producers: Arc<ProducerService>,
    consumers: Arc<ConsumerService>,
    invocations: Arc<InvocationQueueRegistry>,
    dispatcher: Arc<dyn GlobalEventDispatcher>,
    backend: Option<TransportBackend>,
    keep_alive_timeout: Duration,
}

impl BusContext {
    /// Context without a broker: events cross endpoints in-process only.
    pub fn in_process() -> Self {
        let endpoints = Arc::new(EndpointRegistry::new());
        let dispatcher = Arc::new(InProcessDispatcher::new(endpoints.clone()));
        Self {
            endpoints,
            producers: Arc::new(ProducerService::new()),
            consumers: Arc::new(ConsumerService::new()),
            invocations: Arc::new(InvocationQueueRegistry::new()),
            dispatcher,
            backend: None,
            keep_alive_timeout: Duration::from_secs(60),
        }
    }

    /// Context routed through the configured broker transport.
    pub async fn with_messaging(config: &MessagingConfig) -> Result<Self> {
        let backend = TransportBackend::from_config(config)
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let endpoints = Arc::new(EndpointRegistry::new());
        let producers = Arc::new(ProducerService::new());
        let consumers = Arc::new(ConsumerService::new());

        let producer = backend.producer(DEFAULT_PRODUCER).await?;
        producers.register(DEFAULT_PRODUCER, producer);

        let dispatcher = Arc::new(BrokerDispatcher::new(
            endpoints.clone(),
            producers.clone(),
            consumers.clone(),
        ));

        Ok(Self {
            endpoints,
            producers,
            consumers,
            invocations: Arc::new(InvocationQueueRegistry::new()),
            dispatcher,
            backend: Some(backend),
            keep_alive_timeout: Duration::from_secs(60),
        })
    }

    /// Context from full application configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut context = Self::with_messaging(&config.messaging).await?;
        context.keep_alive_timeout = config.invoke.keep_alive_timeout();
        Ok(context)
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn producers(&self) -> &Arc<ProducerService> {
        &self.producers
    }

    pub fn invocations(&self) -> &Arc<InvocationQueueRegistry> {
        &self.invocations
    }

    /// Create and register an endpoint.
    ///
    /// In broker mode the endpoint gets its own consumer connection. An
    /// endpoint already registered under the id is shut down and
    /// replaced.
    pub async fn create_endpoint(&self, endpoint_id: &str) -> Result<Arc<Endpoint>> {
        let endpoint = Endpoint::new(endpoint_id);
        endpoint.events().set_dispatcher(self.dispatcher.clone());

        if let Some(backend) = &self.backend {
            let consumer = backend.consumer(endpoint_id).await?;
            self.consumers.register(endpoint_id, consumer);
        }

        if let Some(replaced) = self.endpoints.register(endpoint.clone()) {
            replaced.shutdown().await;
        }
        info!(endpoint_id = %endpoint_id, "Endpoint created");
        Ok(endpoint)
    }

    /// Destroy an endpoint: close its invocation queues, drop its
    /// subscriptions, close its mailbox, and release its consumer.
    pub async fn destroy_endpoint(&self, endpoint_id: &str) {
        self.invocations.close_owned(endpoint_id);
        if let Some(endpoint) = self.endpoints.remove(endpoint_id) {
            endpoint.shutdown().await;
        }
        self.consumers.unregister(endpoint_id);
        info!(endpoint_id = %endpoint_id, "Endpoint destroyed");
    }

    /// Open an invocation queue owned by an endpoint and subscribe it
    /// to its request channel.
    ///
    /// Closing the queue, through the registry or by keep-alive expiry,
    /// drops the request listener from the owner's manager so the
    /// channel subscription does not outlive the queue.
    pub async fn open_queue(
        &self,
        name: &str,
        owner: &Arc<Endpoint>,
        target: Arc<dyn InvocationTarget>,
        on_close: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<InvocationQueue>> {
        let request_channel = queue_channel(name);
        let listener_slot: Arc<Mutex<Option<Arc<dyn EventListener>>>> =
            Arc::new(Mutex::new(None));

        // close() is synchronous and may run on any thread, so the
        // unsubscribe hops back onto the runtime.
        let events = owner.events().clone();
        let unsub_channel = request_channel.clone();
        let slot = listener_slot.clone();
        let handle = tokio::runtime::Handle::current();
        let close_hook: Box<dyn FnOnce() + Send> = Box::new(move || {
            let listener = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(listener) = listener {
                handle.spawn(async move {
                    if let Err(e) = events.unsubscribe(&unsub_channel, &listener).await {
                        warn!(
                            channel = %unsub_channel,
                            error = %e,
                            "Failed to drop request listener for closed queue"
                        );
                    }
                });
            }
            on_close();
        });

        let queue = self
            .invocations
            .open(name, owner, target, close_hook, self.keep_alive_timeout)?;

        let listener: Arc<dyn EventListener> = RequestListener::new(&queue);
        *listener_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener.clone());
        owner.events().subscribe(&request_channel, listener).await?;
        Ok(queue)
    }

    /// Close invocation queues whose keep-alive lapsed.
    pub fn reap_queues(&self) {
        self.invocations.reap_expired();
    }
}
