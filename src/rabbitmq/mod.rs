// src/rabbitmq/mod.rs
// Connection, channel, consume and publish plumbing for RabbitMQ

pub mod errors;
pub mod types;
pub mod credentials;
pub mod backoff;
pub mod broker;
pub mod connection;
pub mod channel_manager;
pub mod consumer;
pub mod publisher;

// lapin glue
mod amqp_client;
mod tokio_exec;

#[cfg(test)]
pub(crate) mod memory;

pub use amqp_client::{LapinBroker, LapinChannel, LapinConnection};
pub use backoff::ReconnectPolicy;
pub use broker::{Broker, BrokerChannel, BrokerConnection};
pub use channel_manager::{ChannelConfig, ChannelLease, ChannelManager};
pub use connection::ConnectionManager;
pub use consumer::{
    Consumer, ConsumerStats, HandlerError, HandlerResult, MessageHandler, OnHandlerError,
};
pub use credentials::Credentials;
pub use errors::{RabbitMQError, Result};
pub use publisher::{PublishReceipt, Publisher};
pub use types::{ConsumerEvent, Delivery, Envelope, QueueDescriptor, Role, Subscription};
