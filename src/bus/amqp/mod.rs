//! AMQP (RabbitMQ) transport adapter.
//!
//! All channels publish to one shared topic exchange with the channel
//! name as the routing key. Each subscription declares an exclusive
//! per-endpoint queue named `{endpoint_id}.{channel}` bound with the
//! pattern `{channel}.#`, so hierarchical sub-channels route broker-side.
//! Recipient addressing cannot be expressed as a routing key, so the
//! consume loop applies the channel selector before handing messages on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{AmqpBusConfig, BusError, Consumer, MessageHandler, Producer, Result};
use crate::channel::{self, Selector};
use crate::message::{Message, ATTR_RECIPIENTS, ATTR_SENDER};

struct Subscription {
    queue: String,
    task: JoinHandle<()>,
}

/// AMQP transport bound to one endpoint (or producer) id.
pub struct AmqpTransport {
    pool: Pool,
    config: AmqpBusConfig,
    id: String,
    /// Dedicated channel for declares and consumes; publishes use the pool.
    decl_channel: Channel,
    subscriptions: tokio::sync::Mutex<HashMap<String, Subscription>>,
}

impl AmqpTransport {
    /// Connect and declare the shared topic exchange.
    pub async fn connect(config: AmqpBusConfig, id: &str) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let decl_channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        decl_channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

        info!(
            exchange = %config.exchange,
            url = %config.url,
            id = %id,
            "Connected to AMQP"
        );

        Ok(Self {
            pool,
            config,
            id: id.to_string(),
            decl_channel,
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Get a fresh channel from the pooled connection.
    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    fn queue_name(&self, channel: &str) -> String {
        format!("{}.{}", self.id, channel)
    }

    /// Wire attributes carried as AMQP headers alongside the JSON body.
    fn headers(message: &Message) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert("type".into(), AMQPValue::LongString(message.kind.clone().into()));
        if let Some(sender) = message.sender() {
            headers.insert(ATTR_SENDER.into(), AMQPValue::LongString(sender.into()));
        }
        if let Some(recipients) = message.recipients() {
            headers.insert(
                ATTR_RECIPIENTS.into(),
                AMQPValue::LongString(recipients.into()),
            );
        }
        headers
    }
}

#[async_trait]
impl Producer for AmqpTransport {
    async fn publish(&self, channel: &str, mut message: Message) -> Result<()> {
        if !channel::is_valid(channel) {
            return Err(BusError::InvalidChannel(channel.to_string()));
        }
        message.kind = channel.to_string();
        message
            .metadata
            .entry(ATTR_SENDER.to_string())
            .or_insert_with(|| self.id.clone());

        let payload = serde_json::to_vec(&message)?;
        let amqp_channel = self.get_channel().await?;

        amqp_channel
            .basic_publish(
                &self.config.exchange,
                channel,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_headers(Self::headers(&message)),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(
            exchange = %self.config.exchange,
            channel = %channel,
            "Published message"
        );

        Ok(())
    }
}

#[async_trait]
impl Consumer for AmqpTransport {
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if !channel::is_valid(channel) {
            return Err(BusError::InvalidChannel(channel.to_string()));
        }
        let mut subs = self.subscriptions.lock().await;
        if subs.contains_key(channel) {
            return Ok(());
        }

        let queue = self.queue_name(channel);

        // Exclusive queues disappear with the connection, so endpoint
        // teardown never leaves broker garbage behind.
        self.decl_channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        // "#" matches zero or more trailing segments, so the channel
        // itself and all sub-channels route through one binding.
        let routing_key = format!("{}.#", channel);
        self.decl_channel
            .queue_bind(
                &queue,
                &self.config.exchange,
                &routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = %queue,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );

        let mut consumer = self
            .decl_channel
            .basic_consume(
                &queue,
                &format!("{}-consumer", self.id),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let selector = Selector::new(channel, self.id.as_str());
        let sub_channel = channel.to_string();

        let task = tokio::spawn(async move {
            use futures::StreamExt;

            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let message = match serde_json::from_slice::<Message>(&delivery.data) {
                            Ok(message) => message,
                            Err(e) => {
                                // Undecodable payloads still reach the
                                // handler, wrapped as a raw message.
                                warn!(
                                    channel = %sub_channel,
                                    error = %e,
                                    "Failed to decode message, delivering as raw"
                                );
                                Message::raw(
                                    sub_channel.clone(),
                                    serde_json::Value::String(
                                        String::from_utf8_lossy(&delivery.data).into_owned(),
                                    ),
                                )
                            }
                        };

                        if selector.matches(&message) {
                            handler.on_message(message);
                        }

                        if let Err(e) = delivery.ack(Default::default()).await {
                            error!(error = %e, "Failed to ack message");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Consumer error");
                    }
                }
            }
        });

        subs.insert(
            channel.to_string(),
            Subscription {
                queue,
                task,
            },
        );
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut subs = self.subscriptions.lock().await;
        let Some(sub) = subs.remove(channel) else {
            return Ok(());
        };
        sub.task.abort();

        if let Err(e) = self
            .decl_channel
            .queue_delete(&sub.queue, QueueDeleteOptions::default())
            .await
        {
            warn!(queue = %sub.queue, error = %e, "Failed to delete queue");
        }
        debug!(queue = %sub.queue, channel = %channel, "Unsubscribed AMQP channel");
        Ok(())
    }
}
