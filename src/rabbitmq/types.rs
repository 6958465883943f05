// src/rabbitmq/types.rs

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::errors::Result;

/// Which side of the client a connection or channel belongs to.
///
/// Each role owns its own socket, so a stalled consumer never blocks publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Send,
    Receive,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Send => "send",
            Role::Receive => "receive",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Role::Send => 0,
            Role::Receive => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments every queue is asserted with before a consume or publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub nowait: bool,
    /// Value of the `x-queue-mode` argument
    pub mode: String,
}

impl QueueDescriptor {
    pub const QUEUE_MODE_ARG: &'static str = "x-queue-mode";

    pub fn lazy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            nowait: false,
            mode: "lazy".to_string(),
        }
    }
}

/// Delivery mode 2 asks the broker to write the message to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: String,
    pub delivery_mode: u8,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Envelope {
    /// Wrap a payload with a fresh message id, persistent and plain text.
    pub fn text(body: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            delivery_mode: PERSISTENT_DELIVERY_MODE,
            content_type: "text/plain".to_string(),
            body,
        }
    }
}

/// Parameters of one `basic.consume` session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub queue: String,
    pub consumer_tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub nowait: bool,
}

impl Subscription {
    pub fn manual_ack(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            consumer_tag: format!("consumer-{}", Uuid::new_v4()),
            no_ack: false,
            exclusive: false,
            no_local: false,
            nowait: false,
        }
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self) -> Result<()>;
}

/// An inbound message. Settling consumes it, so it resolves at most once.
pub struct Delivery {
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack_requeue(self) -> Result<()> {
        self.acker.nack(true).await
    }

    pub async fn reject(self) -> Result<()> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Everything the consumer loop waits on, merged into one ordered stream.
#[derive(Debug)]
pub enum ConsumerEvent {
    Delivery(Delivery),
    ConnectionClosed(String),
    ConnectionBlocked(String),
    ChannelClosed(String),
    Cancelled,
}

pub type EventSender = mpsc::UnboundedSender<ConsumerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ConsumerEvent>;
