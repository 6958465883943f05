// src/rabbitmq/credentials.rs

use std::fmt;

use super::errors::{RabbitMQError, Result};

/// Connection parameters for the broker. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
    host: String,
    port: u16,
}

impl Credentials {
    pub fn new(username: &str, password: &str, host: &str, port: u16) -> Self {
        Self {
            username: username.trim().to_string(),
            password: password.trim().to_string(),
            host: host.trim().to_string(),
            port,
        }
    }

    pub fn anonymous(host: &str, port: u16) -> Self {
        Self::new("", "", host, port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(RabbitMQError::Config("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(RabbitMQError::Config("port cannot be 0".to_string()));
        }
        Ok(())
    }

    /// AMQP URI for the default vhost. An empty username means anonymous.
    pub fn uri(&self) -> String {
        if self.username.is_empty() {
            format!("amqp://{}:{}/", self.host, self.port)
        } else {
            format!(
                "amqp://{}:{}@{}:{}/",
                self.username, self.password, self.host, self.port
            )
        }
    }

    /// Same as [`Credentials::uri`] with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        if self.username.is_empty() {
            self.uri()
        } else {
            format!("amqp://{}:***@{}:{}/", self.username, self.host, self.port)
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}
