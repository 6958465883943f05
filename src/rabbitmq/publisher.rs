use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::backoff::{pause, Backoff, ReconnectPolicy};
use super::broker::{Broker, BrokerChannel};
use super::channel_manager::ChannelManager;
use super::errors::{RabbitMQError, Result};
use super::types::{Envelope, QueueDescriptor, Role};

/// Outcome of a successful [`Publisher::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Id stamped on the message; the same for every attempt.
    pub message_id: String,
    pub attempts: u32,
}

pub struct Publisher<B: Broker> {
    channels: Arc<ChannelManager<B>>,
    policy: ReconnectPolicy,
}

impl<B: Broker> Publisher<B> {
    pub fn new(channels: Arc<ChannelManager<B>>, policy: ReconnectPolicy) -> Self {
        Self { channels, policy }
    }

    /// Publish `body` to `queue` through the default exchange, retrying until
    /// the broker confirms it.
    ///
    /// A failed attempt invalidates the send channel and connection it used,
    /// unless a concurrent publish has already replaced them, then waits out
    /// the backoff. Gives up only when cancelled or when the policy caps the
    /// number of attempts.
    pub async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<PublishReceipt> {
        let descriptor = QueueDescriptor::lazy(queue);
        let message_id = Uuid::new_v4().to_string();
        let mut backoff = Backoff::new(self.policy.clone());
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RabbitMQError::Cancelled);
            }
            attempts += 1;

            match self.attempt(&descriptor, &message_id, body, cancel).await {
                Ok(()) => {
                    debug!(queue, message_id = %message_id, attempts, "Message published");
                    return Ok(PublishReceipt {
                        message_id,
                        attempts,
                    });
                }
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    if let Some(max) = self.policy.max_publish_attempts {
                        if attempts >= max {
                            error!(queue, attempts, "Giving up on publish: {}", err);
                            return Err(RabbitMQError::RetriesExhausted {
                                attempts,
                                last_error: err.to_string(),
                            });
                        }
                    }
                    let delay = backoff.next_delay();
                    error!(
                        queue,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Could not publish message, retrying: {}", err
                    );
                    if !pause(delay, cancel).await {
                        return Err(RabbitMQError::Cancelled);
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        descriptor: &QueueDescriptor,
        message_id: &str,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        // A capped publish must count failed dials as attempts.
        let lease = if self.policy.max_publish_attempts.is_some() {
            self.channels.try_acquire(Role::Send, cancel).await?
        } else {
            self.channels.acquire(Role::Send, cancel).await?
        };

        let envelope = Envelope {
            message_id: message_id.to_string(),
            ..Envelope::text(body.to_vec())
        };
        let result = match lease.channel.declare_queue(descriptor).await {
            Ok(()) => lease.channel.publish(&descriptor.name, &envelope).await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            info!(
                queue = %descriptor.name,
                channel = lease.generation(),
                "Dropping send channel after failed publish"
            );
            self.channels.invalidate(Role::Send, &lease).await;
        }
        result
    }
}
