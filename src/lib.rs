pub mod config;
pub mod env;
pub mod message;
pub mod notifier;
pub mod rabbitmq;
pub mod rabbitmq_client;

pub use rabbitmq_client::{ClientSettings, RabbitClient};
