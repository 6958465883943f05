// src/rabbitmq_client.rs
// The handle the application uses: one consume loop per queue plus publishes,
// all sharing the per-role connections.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::rabbitmq::{
    Broker, ChannelManager, Consumer, ConsumerStats, Credentials, LapinBroker, MessageHandler,
    OnHandlerError, PublishReceipt, Publisher, RabbitMQError, ReconnectPolicy, Result,
};

/// Tuning knobs for [`RabbitClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub reconnect: ReconnectPolicy,
    pub prefetch_count: u16,
    pub on_handler_error: OnHandlerError,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            prefetch_count: 10,
            on_handler_error: OnHandlerError::Requeue,
        }
    }
}

struct Inner<B: Broker> {
    channels: Arc<ChannelManager<B>>,
    consumer: Consumer<B>,
    publisher: Publisher<B>,
    shutdown: CancellationToken,
}

pub struct RabbitClient<B: Broker = LapinBroker> {
    inner: Arc<Inner<B>>,
}

impl<B: Broker> Clone for RabbitClient<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RabbitClient<LapinBroker> {
    /// Build a client for a real broker. Nothing is dialed until first use.
    pub fn new(credentials: Credentials, settings: ClientSettings) -> Result<Self> {
        Self::with_broker(LapinBroker, credentials, settings)
    }
}

impl<B: Broker> RabbitClient<B> {
    pub fn with_broker(broker: B, credentials: Credentials, settings: ClientSettings) -> Result<Self> {
        credentials.validate()?;
        info!(
            uri = %credentials.redacted_uri(),
            prefetch = settings.prefetch_count,
            "Creating RabbitMQ client"
        );

        let channels = Arc::new(ChannelManager::new(
            Arc::new(broker),
            credentials,
            settings.reconnect.clone(),
            settings.prefetch_count,
        ));
        let consumer = Consumer::new(
            channels.clone(),
            settings.reconnect.clone(),
            settings.on_handler_error,
        );
        let publisher = Publisher::new(channels.clone(), settings.reconnect);

        Ok(Self {
            inner: Arc::new(Inner {
                channels,
                consumer,
                publisher,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Consume `queue` until [`RabbitClient::shutdown`] is called.
    pub async fn consume<H: MessageHandler>(&self, queue: &str, handler: &H) -> Result<ConsumerStats> {
        self.ensure_running()?;
        let token = self.inner.shutdown.child_token();
        self.inner.consumer.run(queue, handler, &token).await
    }

    /// Like [`RabbitClient::consume`], but also stops when `cancel` fires.
    pub async fn consume_until<H: MessageHandler>(
        &self,
        queue: &str,
        handler: &H,
        cancel: &CancellationToken,
    ) -> Result<ConsumerStats> {
        self.ensure_running()?;
        let token = self.inner.shutdown.child_token();
        let run = self.inner.consumer.run(queue, handler, &token);
        tokio::pin!(run);

        tokio::select! {
            stats = &mut run => stats,
            _ = cancel.cancelled() => {
                token.cancel();
                run.await
            }
        }
    }

    /// Publish `body` to `queue`, blocking until the broker confirms it.
    pub async fn publish(&self, queue: &str, body: &[u8]) -> Result<PublishReceipt> {
        self.ensure_running()?;
        let token = self.inner.shutdown.child_token();
        self.inner.publisher.publish(queue, body, &token).await
    }

    /// Stop every running consume and publish, then close both roles.
    pub async fn shutdown(&self) {
        info!("Shutting down RabbitMQ client");
        self.inner.shutdown.cancel();
        self.inner.channels.close().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(RabbitMQError::Cancelled);
        }
        Ok(())
    }
}
