use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{pause, Backoff, ReconnectPolicy};
use super::broker::{Broker, BrokerChannel, BrokerConnection};
use super::channel_manager::{ChannelLease, ChannelManager};
use super::errors::{RabbitMQError, Result};
use super::types::{ConsumerEvent, Delivery, EventReceiver, QueueDescriptor, Role, Subscription};

/// Why a handler could not process a message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Processing failed but may succeed later; the message is requeued.
    #[error("handler failed: {0}")]
    Retry(anyhow::Error),

    /// The message can never be processed (e.g. malformed); it is dropped.
    #[error("message rejected: {0}")]
    Reject(anyhow::Error),
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::Retry(error)
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Business logic invoked for every delivered message body.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, body: &[u8]) -> HandlerResult {
        (self)(body.to_vec()).await
    }
}

/// What to do with a delivery whose handler returned [`HandlerError::Retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnHandlerError {
    /// Negatively acknowledge with requeue so the broker redelivers it.
    #[default]
    Requeue,
    /// Acknowledge anyway. Drops the message; only for legacy parity.
    Acknowledge,
}

/// Counters for one `consume` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Subscription cycles started (1 + reconnects)
    pub cycles: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
}

enum CycleEnd {
    Cancelled,
    Interrupted(String),
}

pub struct Consumer<B: Broker> {
    channels: Arc<ChannelManager<B>>,
    policy: ReconnectPolicy,
    on_handler_error: OnHandlerError,
}

impl<B: Broker> Consumer<B> {
    pub fn new(
        channels: Arc<ChannelManager<B>>,
        policy: ReconnectPolicy,
        on_handler_error: OnHandlerError,
    ) -> Self {
        Self {
            channels,
            policy,
            on_handler_error,
        }
    }

    /// Consume `queue` until `cancel` fires, reconnecting after any failure.
    ///
    /// Each cycle leases the shared receive channel, declares the queue,
    /// subscribes and dispatches deliveries one at a time in broker order.
    /// A close or blocked notification ends the cycle; the next one first
    /// invalidates the channel and connection the failed cycle ran on, unless
    /// a consumer of another queue has already replaced them.
    pub async fn run<H: MessageHandler>(
        &self,
        queue: &str,
        handler: &H,
        cancel: &CancellationToken,
    ) -> Result<ConsumerStats> {
        let descriptor = QueueDescriptor::lazy(queue);
        let mut stats = ConsumerStats::default();
        let mut backoff = Backoff::new(self.policy.clone());
        let mut leased: Option<ChannelLease<B>> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(failed) = leased.take() {
                self.channels.invalidate(Role::Receive, &failed).await;
            }
            stats.cycles += 1;

            match self
                .cycle(&descriptor, handler, cancel, &mut leased, &mut stats, &mut backoff)
                .await
            {
                Ok(CycleEnd::Cancelled) | Err(RabbitMQError::Cancelled) => break,
                Err(err) if err.is_terminal() => return Err(err),
                Ok(CycleEnd::Interrupted(reason)) => {
                    warn!(
                        queue,
                        cycles = stats.cycles,
                        delivered = stats.delivered,
                        "Consumer interrupted ({}), reconnecting", reason
                    );
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    error!(
                        queue,
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Consume cycle failed, trying to reconnect: {}", err
                    );
                    if !pause(delay, cancel).await {
                        break;
                    }
                }
            }
        }

        info!(
            queue,
            cycles = stats.cycles,
            delivered = stats.delivered,
            acked = stats.acked,
            requeued = stats.requeued,
            rejected = stats.rejected,
            "Consumer stopped"
        );
        Ok(stats)
    }

    async fn cycle<H: MessageHandler>(
        &self,
        descriptor: &QueueDescriptor,
        handler: &H,
        cancel: &CancellationToken,
        leased: &mut Option<ChannelLease<B>>,
        stats: &mut ConsumerStats,
        backoff: &mut Backoff,
    ) -> Result<CycleEnd> {
        let lease = self.channels.acquire(Role::Receive, cancel).await?;
        let channel = lease.channel.clone();
        info!(
            queue = %descriptor.name,
            channel = lease.generation(),
            "Connected to consume"
        );
        let connection = lease.connection.clone();
        *leased = Some(lease);

        channel.declare_queue(descriptor).await?;

        let (events, mut rx) = mpsc::unbounded_channel();
        connection.watch(events.clone());
        channel.watch(events.clone());

        let subscription = Subscription::manual_ack(&descriptor.name);
        channel.consume(&subscription, events).await?;
        backoff.reset();
        info!(
            queue = %descriptor.name,
            consumer_tag = %subscription.consumer_tag,
            "Started consuming"
        );

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => ConsumerEvent::Cancelled,
                event = rx.recv() => event.unwrap_or_else(|| {
                    ConsumerEvent::ChannelClosed("event stream ended".to_string())
                }),
            };

            match event {
                ConsumerEvent::Delivery(delivery) => {
                    if let Err(err) = self.dispatch(delivery, handler, stats).await {
                        Self::requeue_pending(&mut rx).await;
                        return Ok(CycleEnd::Interrupted(err.to_string()));
                    }
                }
                ConsumerEvent::ConnectionClosed(reason) => {
                    warn!(queue = %descriptor.name, "Connection closed: {}", reason);
                    return Ok(CycleEnd::Interrupted(format!("connection closed: {}", reason)));
                }
                ConsumerEvent::ConnectionBlocked(reason) => {
                    warn!(queue = %descriptor.name, "Connection blocked: {}", reason);
                    Self::requeue_pending(&mut rx).await;
                    return Ok(CycleEnd::Interrupted(format!("connection blocked: {}", reason)));
                }
                ConsumerEvent::ChannelClosed(reason) => {
                    warn!(queue = %descriptor.name, "Channel closed: {}", reason);
                    return Ok(CycleEnd::Interrupted(format!("channel closed: {}", reason)));
                }
                ConsumerEvent::Cancelled => {
                    if let Err(err) = channel.cancel(&subscription.consumer_tag).await {
                        debug!("Failed to cancel subscription: {}", err);
                    }
                    Self::requeue_pending(&mut rx).await;
                    return Ok(CycleEnd::Cancelled);
                }
            }
        }
    }

    /// Run the handler and settle the delivery according to its outcome.
    async fn dispatch<H: MessageHandler>(
        &self,
        delivery: Delivery,
        handler: &H,
        stats: &mut ConsumerStats,
    ) -> Result<()> {
        stats.delivered += 1;

        match handler.handle(&delivery.body).await {
            Ok(()) => {
                delivery.ack().await?;
                stats.acked += 1;
            }
            Err(HandlerError::Reject(err)) => {
                warn!("Rejecting message: {}", err);
                delivery.reject().await?;
                stats.rejected += 1;
            }
            Err(HandlerError::Retry(err)) => match self.on_handler_error {
                OnHandlerError::Requeue => {
                    warn!("Error processing message, requeueing: {}", err);
                    delivery.nack_requeue().await?;
                    stats.requeued += 1;
                }
                OnHandlerError::Acknowledge => {
                    warn!("Error processing message, acknowledging anyway: {}", err);
                    delivery.ack().await?;
                    stats.acked += 1;
                }
            },
        }
        Ok(())
    }

    /// Hand back deliveries that arrived but were never dispatched.
    async fn requeue_pending(rx: &mut EventReceiver) {
        rx.close();
        while let Ok(event) = rx.try_recv() {
            if let ConsumerEvent::Delivery(delivery) = event {
                if let Err(err) = delivery.nack_requeue().await {
                    debug!("Could not requeue undispatched message: {}", err);
                }
            }
        }
    }
}
