// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the broker traits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection,
};
use tracing::{debug, warn};

use super::broker::{Broker, BrokerChannel, BrokerConnection};
use super::channel_manager::ChannelConfig;
use super::errors::{RabbitMQError, Result};
use super::tokio_exec::connection_properties;
use super::types::{
    Acknowledger, ConsumerEvent, Delivery, Envelope, EventSender, QueueDescriptor, Role,
    Subscription,
};

const BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REPLY_SUCCESS: u16 = 200;

type Watchers = Arc<Mutex<Vec<EventSender>>>;

fn notify(watchers: &Watchers, event: impl Fn() -> ConsumerEvent) {
    let mut watchers = watchers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    watchers.retain(|watcher| watcher.send(event()).is_ok());
}

fn add_watcher(watchers: &Watchers, events: EventSender) {
    watchers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(events);
}

/// Dials RabbitMQ over AMQP 0-9-1.
#[derive(Debug, Clone, Default)]
pub struct LapinBroker;

#[async_trait]
impl Broker for LapinBroker {
    type Connection = LapinConnection;

    async fn dial(&self, uri: &str, role: Role) -> Result<LapinConnection> {
        let connection = Connection::connect(uri, connection_properties(role))
            .await
            .map_err(|e| RabbitMQError::connection(role, e))?;

        let watchers: Watchers = Arc::default();
        let on_error = watchers.clone();
        connection.on_error(move |err| {
            warn!(%role, "Connection error: {}", err);
            notify(&on_error, || ConsumerEvent::ConnectionClosed(err.to_string()));
        });

        Ok(LapinConnection {
            inner: Arc::new(connection),
            role,
            watchers,
        })
    }
}

#[derive(Clone)]
pub struct LapinConnection {
    inner: Arc<Connection>,
    role: Role,
    watchers: Watchers,
}

impl LapinConnection {
    /// lapin has no callback for `connection.blocked`, so poll the status flag.
    fn spawn_blocked_watch(&self, events: EventSender) {
        let connection = self.inner.clone();
        let role = self.role;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BLOCKED_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if events.is_closed() || !connection.status().connected() {
                    break;
                }
                if connection.status().blocked() {
                    debug!(%role, "Connection reported blocked");
                    let _ = events.send(ConsumerEvent::ConnectionBlocked(
                        "broker resource alarm".to_string(),
                    ));
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn open_channel(&self, config: &ChannelConfig) -> Result<LapinChannel> {
        let role = self.role;
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::channel(role, e))?;

        if config.prefetch_count > 0 {
            channel
                .basic_qos(config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| RabbitMQError::channel(role, format!("failed to set QoS: {}", e)))?;
        }
        if config.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RabbitMQError::channel(role, format!("failed to enable confirms: {}", e))
                })?;
        }

        let watchers: Watchers = Arc::default();
        let on_error = watchers.clone();
        channel.on_error(move |err| {
            warn!(%role, "Channel error: {}", err);
            notify(&on_error, || ConsumerEvent::ChannelClosed(err.to_string()));
        });

        Ok(LapinChannel {
            inner: channel,
            role,
            watchers,
        })
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn watch(&self, events: EventSender) {
        add_watcher(&self.watchers, events.clone());
        self.spawn_blocked_watch(events);
    }

    async fn close(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(err) = self.inner.close(REPLY_SUCCESS, "Normal shutdown").await {
            debug!(role = %self.role, "Error closing connection: {}", err);
        }
    }
}

#[derive(Clone)]
pub struct LapinChannel {
    inner: Channel,
    role: Role,
    watchers: Watchers,
}

fn forward_deliveries(mut consumer: lapin::Consumer, events: EventSender) {
    tokio::spawn(async move {
        while let Some(item) = consumer.next().await {
            let event = match item {
                Ok(delivery) => ConsumerEvent::Delivery(Delivery::new(
                    delivery.data,
                    delivery.redelivered,
                    Box::new(LapinAcker(delivery.acker)),
                )),
                Err(err) => {
                    let _ = events.send(ConsumerEvent::ChannelClosed(err.to_string()));
                    return;
                }
            };
            if events.send(event).is_err() {
                return;
            }
        }
        let _ = events.send(ConsumerEvent::ChannelClosed(
            "consumer stream ended".to_string(),
        ));
    });
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            QueueDescriptor::QUEUE_MODE_ARG.into(),
            AMQPValue::LongString(queue.mode.clone().into()),
        );

        self.inner
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: queue.nowait,
                },
                arguments,
            )
            .await
            .map_err(|e| RabbitMQError::declare(&queue.name, e))?;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<()> {
        let properties = BasicProperties::default()
            .with_message_id(envelope.message_id.clone().into())
            .with_delivery_mode(envelope.delivery_mode)
            .with_content_type(envelope.content_type.clone().into());

        let confirm = self
            .inner
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if confirm.is_nack() {
            return Err(RabbitMQError::PublishNacked(envelope.message_id.clone()));
        }
        Ok(())
    }

    async fn consume(&self, subscription: &Subscription, events: EventSender) -> Result<()> {
        let consumer = self
            .inner
            .basic_consume(
                &subscription.queue,
                &subscription.consumer_tag,
                BasicConsumeOptions {
                    no_local: subscription.no_local,
                    no_ack: subscription.no_ack,
                    exclusive: subscription.exclusive,
                    nowait: subscription.nowait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        forward_deliveries(consumer, events);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn watch(&self, events: EventSender) {
        add_watcher(&self.watchers, events);
    }

    async fn close(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(err) = self.inner.close(REPLY_SUCCESS, "Normal shutdown").await {
            debug!(role = %self.role, "Error closing channel: {}", err);
        }
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn reject(&self) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}
