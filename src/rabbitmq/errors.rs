// src/rabbitmq/errors.rs

use thiserror::Error;

use super::types::Role;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Invalid RabbitMQ configuration: {0}")]
    Config(String),

    #[error("RabbitMQ connection error ({role}): {reason}")]
    ConnectionError { role: Role, reason: String },

    #[error("RabbitMQ channel error ({role}): {reason}")]
    ChannelError { role: Role, reason: String },

    #[error("Failed to declare queue '{queue}': {reason}")]
    DeclareError { queue: String, reason: String },

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Broker rejected published message {0}")]
    PublishNacked(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl RabbitMQError {
    pub(crate) fn connection(role: Role, reason: impl ToString) -> Self {
        RabbitMQError::ConnectionError {
            role,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn channel(role: Role, reason: impl ToString) -> Self {
        RabbitMQError::ChannelError {
            role,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn declare(queue: &str, reason: impl ToString) -> Self {
        RabbitMQError::DeclareError {
            queue: queue.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying can never help (bad settings, shutdown).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RabbitMQError::Config(_)
                | RabbitMQError::Cancelled
                | RabbitMQError::RetriesExhausted { .. }
        )
    }
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;
