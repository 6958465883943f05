// src/notifier.rs
// Turns queue deliveries into events and hands them to a notifier.

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::message::Event;
use crate::rabbitmq::{HandlerError, HandlerResult, MessageHandler};

/// Delivers one event to its recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> anyhow::Result<()>;
}

/// Writes events to the log instead of a chat.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &Event) -> anyhow::Result<()> {
        info!(
            recipient = event.recipient,
            kind = ?event.kind(),
            attachments = event.attaches.len(),
            "{}", event.text
        );
        Ok(())
    }
}

/// Consumer handler that decodes each body and queues it for dispatch.
pub struct EventForwarder {
    tx: mpsc::Sender<Event>,
}

impl EventForwarder {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl MessageHandler for EventForwarder {
    async fn handle(&self, body: &[u8]) -> HandlerResult {
        let event = Event::from_slice(body)
            .map_err(|e| HandlerError::Reject(anyhow!("invalid event payload: {}", e)))?;

        self.tx
            .send(event)
            .await
            .map_err(|_| HandlerError::Retry(anyhow!("event dispatcher is not running")))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Drain `events` into `notifier` until every sender is dropped.
pub async fn dispatch_events<N: Notifier>(
    mut events: mpsc::Receiver<Event>,
    notifier: &N,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    while let Some(event) = events.recv().await {
        if !event.has_recipient() {
            debug!("Skipping event without recipient");
            stats.skipped += 1;
            continue;
        }
        match notifier.notify(&event).await {
            Ok(()) => stats.sent += 1,
            Err(err) => {
                error!(recipient = event.recipient, "Failed to send event: {:#}", err);
                stats.failed += 1;
            }
        }
    }

    stats
}
