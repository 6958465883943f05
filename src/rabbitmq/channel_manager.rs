use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::backoff::{pause, Backoff, ReconnectPolicy};
use super::broker::{Broker, BrokerChannel, BrokerConnection, ChannelOf};
use super::connection::ConnectionManager;
use super::credentials::Credentials;
use super::errors::{RabbitMQError, Result};
use super::types::Role;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,
}

impl ChannelConfig {
    /// Publishing channels wait for broker confirms and never prefetch.
    pub fn for_send() -> Self {
        Self {
            prefetch_count: 0,
            confirm_mode: true,
        }
    }

    pub fn for_receive(prefetch_count: u16) -> Self {
        Self {
            prefetch_count,
            confirm_mode: false,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::for_receive(10)
    }
}

/// A channel handed out by [`ChannelManager`], together with the connection
/// it runs on. Pass it back to [`ChannelManager::invalidate`] once it fails.
pub struct ChannelLease<B: Broker> {
    pub channel: ChannelOf<B>,
    pub connection: B::Connection,
    generation: u64,
    connection_generation: u64,
}

impl<B: Broker> Clone for ChannelLease<B> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            connection: self.connection.clone(),
            generation: self.generation,
            connection_generation: self.connection_generation,
        }
    }
}

impl<B: Broker> ChannelLease<B> {
    /// Increases with every channel the manager opens for the role.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct ChannelSlot<B: Broker> {
    current: Option<ChannelLease<B>>,
    opened: u64,
    backoff: Backoff,
}

/// Owns at most one channel per role, each on top of that role's connection.
pub struct ChannelManager<B: Broker> {
    connections: ConnectionManager<B>,
    slots: [Mutex<ChannelSlot<B>>; 2],
    configs: [ChannelConfig; 2],
}

impl<B: Broker> ChannelManager<B> {
    pub fn new(
        broker: Arc<B>,
        credentials: Credentials,
        policy: ReconnectPolicy,
        prefetch_count: u16,
    ) -> Self {
        debug!(
            prefetch = prefetch_count,
            "Creating channel manager"
        );
        let slot = || {
            Mutex::new(ChannelSlot {
                current: None,
                opened: 0,
                backoff: Backoff::new(policy.clone()),
            })
        };

        Self {
            connections: ConnectionManager::new(broker, credentials, policy.clone()),
            slots: [slot(), slot()],
            configs: [
                ChannelConfig::for_send(),
                ChannelConfig::for_receive(prefetch_count),
            ],
        }
    }

    pub fn config(&self, role: Role) -> &ChannelConfig {
        &self.configs[role.index()]
    }

    /// Return the role's channel, opening one if needed.
    ///
    /// `recreate` drops both the cached channel and its connection. A missing,
    /// dead or replaced connection also drops the channel, since a channel
    /// cannot outlive it. The connection is retried until it succeeds; a
    /// failed channel open pauses with backoff and returns the error.
    pub async fn channel(
        &self,
        role: Role,
        recreate: bool,
        cancel: &CancellationToken,
    ) -> Result<ChannelOf<B>> {
        let lease = self.open(role, recreate, cancel, true).await?;
        Ok(lease.channel)
    }

    /// Lease the role's channel in a single attempt. A failed dial is
    /// returned (after its backoff pause) instead of retried.
    pub async fn try_acquire(
        &self,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<ChannelLease<B>> {
        self.open(role, false, cancel, false).await
    }

    /// Lease the role's channel, retrying until it is open or `cancel` fires.
    pub async fn acquire(
        &self,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<ChannelLease<B>> {
        loop {
            match self.open(role, false, cancel, true).await {
                Ok(lease) => return Ok(lease),
                Err(RabbitMQError::Cancelled) => return Err(RabbitMQError::Cancelled),
                Err(err) => debug!(%role, "Channel not ready, retrying: {}", err),
            }
        }
    }

    async fn open(
        &self,
        role: Role,
        recreate: bool,
        cancel: &CancellationToken,
        retry_connect: bool,
    ) -> Result<ChannelLease<B>> {
        let mut slot = self.slots[role.index()].lock().await;

        if recreate {
            Self::discard(role, slot.current.take());
        }
        let established = self.connections.generation(role).await;
        if let Some(lease) = slot.current.as_ref().filter(|lease| {
            Some(lease.connection_generation) == established && lease.channel.is_open()
        }) {
            return Ok(lease.clone());
        }
        Self::discard(role, slot.current.take());

        let (connection, connection_generation) = loop {
            if cancel.is_cancelled() {
                return Err(RabbitMQError::Cancelled);
            }
            match self.connections.checkout(role, recreate, cancel).await {
                Ok(checked_out) => break checked_out,
                Err(RabbitMQError::Cancelled) => return Err(RabbitMQError::Cancelled),
                Err(err) if !retry_connect => return Err(err),
                Err(err) => debug!(%role, "Connection attempt failed, retrying: {}", err),
            }
        };

        match connection.open_channel(self.config(role)).await {
            Ok(channel) => {
                slot.opened += 1;
                info!(%role, generation = slot.opened, "Channel created and configured successfully");
                slot.backoff.reset();
                let lease = ChannelLease {
                    channel,
                    connection,
                    generation: slot.opened,
                    connection_generation,
                };
                slot.current = Some(lease.clone());
                Ok(lease)
            }
            Err(err) => {
                let delay = slot.backoff.next_delay();
                error!(
                    %role,
                    attempt = slot.backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "Could not create channel: {}", err
                );
                if !pause(delay, cancel).await {
                    return Err(RabbitMQError::Cancelled);
                }
                Err(err)
            }
        }
    }

    /// Check if the role's channel is in a healthy state
    pub async fn is_healthy(&self, role: Role) -> bool {
        let slot = self.slots[role.index()].lock().await;
        slot.current.as_ref().map_or(false, |lease| lease.channel.is_open())
            && self.connections.is_established(role).await
    }

    /// Drop a failed lease's channel and connection so the next caller gets
    /// fresh ones. Handles another caller has already replaced are kept.
    pub async fn invalidate(&self, role: Role, failed: &ChannelLease<B>) {
        let mut slot = self.slots[role.index()].lock().await;
        if let Some(current) = slot.current.as_ref() {
            if current.generation != failed.generation {
                debug!(
                    %role,
                    failed = failed.generation,
                    current = current.generation,
                    "Channel already replaced"
                );
                return;
            }
        }
        Self::discard(role, slot.current.take());
        self.connections
            .invalidate(role, failed.connection_generation)
            .await;
    }

    pub async fn close(&self) {
        for role in [Role::Send, Role::Receive] {
            let lease = self.slots[role.index()].lock().await.current.take();
            if let Some(lease) = lease {
                lease.channel.close().await;
            }
        }
        self.connections.close().await;
    }

    fn discard(role: Role, lease: Option<ChannelLease<B>>) {
        if let Some(lease) = lease {
            debug!(%role, generation = lease.generation, "Discarding channel");
            tokio::spawn(async move { lease.channel.close().await });
        }
    }
}
