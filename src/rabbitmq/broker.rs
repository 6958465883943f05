// src/rabbitmq/broker.rs
// Seam between the retry logic and the AMQP library.

use async_trait::async_trait;

use super::channel_manager::ChannelConfig;
use super::errors::Result;
use super::types::{Envelope, EventSender, QueueDescriptor, Role, Subscription};

/// Opens connections to a broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn dial(&self, uri: &str, role: Role) -> Result<Self::Connection>;
}

#[async_trait]
pub trait BrokerConnection: Clone + Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self, config: &ChannelConfig) -> Result<Self::Channel>;

    fn is_open(&self) -> bool;

    /// Report `ConnectionClosed` and `ConnectionBlocked` on `events`.
    fn watch(&self, events: EventSender);

    async fn close(&self);
}

#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    /// Idempotent for identical arguments.
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()>;

    /// Publish to the default exchange. Returns once the broker has accepted the envelope.
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<()>;

    /// Start a subscription; deliveries arrive on `events`.
    async fn consume(&self, subscription: &Subscription, events: EventSender) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Report `ChannelClosed` on `events`.
    fn watch(&self, events: EventSender);

    async fn close(&self);
}

pub type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;
