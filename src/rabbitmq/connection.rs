use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::backoff::{pause, Backoff, ReconnectPolicy};
use super::broker::{Broker, BrokerConnection};
use super::credentials::Credentials;
use super::errors::{RabbitMQError, Result};
use super::types::Role;

struct ConnectionSlot<C> {
    connection: Option<C>,
    /// Bumped on every successful dial; identifies the cached connection.
    generation: u64,
    backoff: Backoff,
}

/// Owns at most one connection per role and rebuilds it on demand.
pub struct ConnectionManager<B: Broker> {
    broker: Arc<B>,
    credentials: Credentials,
    slots: [Mutex<ConnectionSlot<B::Connection>>; 2],
}

impl<B: Broker> ConnectionManager<B> {
    pub fn new(broker: Arc<B>, credentials: Credentials, policy: ReconnectPolicy) -> Self {
        let slot = || {
            Mutex::new(ConnectionSlot {
                connection: None,
                generation: 0,
                backoff: Backoff::new(policy.clone()),
            })
        };
        ConnectionManager {
            broker,
            credentials,
            slots: [slot(), slot()],
        }
    }

    /// Return the role's connection, dialing a new one if the slot is empty,
    /// dead, or `force_reconnect` is set.
    ///
    /// A failed dial waits out the role's backoff before returning the error,
    /// so callers can loop on this without spinning against a down broker.
    pub async fn connect(
        &self,
        role: Role,
        force_reconnect: bool,
        cancel: &CancellationToken,
    ) -> Result<B::Connection> {
        let (conn, _) = self.checkout(role, force_reconnect, cancel).await?;
        Ok(conn)
    }

    /// [`ConnectionManager::connect`], also returning the generation of the
    /// connection handed out.
    pub(crate) async fn checkout(
        &self,
        role: Role,
        force_reconnect: bool,
        cancel: &CancellationToken,
    ) -> Result<(B::Connection, u64)> {
        let mut slot = self.slots[role.index()].lock().await;

        if force_reconnect {
            Self::discard(role, slot.connection.take());
        }

        if let Some(conn) = slot.connection.as_ref().filter(|conn| conn.is_open()) {
            return Ok((conn.clone(), slot.generation));
        }
        if slot.connection.is_some() {
            debug!(%role, "Cached connection is no longer open");
            Self::discard(role, slot.connection.take());
        }

        let uri = self.credentials.uri();
        info!(%role, uri = %self.credentials.redacted_uri(), "Connecting to RabbitMQ");

        match self.broker.dial(&uri, role).await {
            Ok(conn) => {
                slot.generation += 1;
                info!(%role, generation = slot.generation, "Successfully connected to RabbitMQ");
                slot.backoff.reset();
                slot.connection = Some(conn.clone());
                Ok((conn, slot.generation))
            }
            Err(err) => {
                let delay = slot.backoff.next_delay();
                error!(
                    %role,
                    attempt = slot.backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "Could not create a connection: {}", err
                );
                // Hold the slot while waiting so concurrent callers share the pause.
                if !pause(delay, cancel).await {
                    return Err(RabbitMQError::Cancelled);
                }
                Err(err)
            }
        }
    }

    /// True when the role has a cached connection that is still open.
    pub async fn is_established(&self, role: Role) -> bool {
        let slot = self.slots[role.index()].lock().await;
        slot.connection.as_ref().map_or(false, |conn| conn.is_open())
    }

    /// Generation of the role's connection, if one is cached and open.
    pub(crate) async fn generation(&self, role: Role) -> Option<u64> {
        let slot = self.slots[role.index()].lock().await;
        slot.connection
            .as_ref()
            .filter(|conn| conn.is_open())
            .map(|_| slot.generation)
    }

    /// Drop the role's connection if it is still `generation`; the next
    /// `connect` dials again. A connection that was already replaced is kept.
    pub async fn invalidate(&self, role: Role, generation: u64) {
        let mut slot = self.slots[role.index()].lock().await;
        if slot.generation != generation {
            debug!(%role, generation, current = slot.generation, "Connection already replaced");
            return;
        }
        Self::discard(role, slot.connection.take());
    }

    pub async fn close(&self) {
        for role in [Role::Send, Role::Receive] {
            let conn = self.slots[role.index()].lock().await.connection.take();
            if let Some(conn) = conn {
                info!(%role, "Closing RabbitMQ connection gracefully");
                conn.close().await;
            }
        }
    }

    fn discard(role: Role, conn: Option<B::Connection>) {
        if let Some(conn) = conn {
            debug!(%role, "Discarding connection");
            tokio::spawn(async move { conn.close().await });
        }
    }
}
