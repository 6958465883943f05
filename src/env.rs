// src/env.rs
// Environment overrides on top of the config file. A `.env` file is honored.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;

use crate::config::AppConfig;

pub const RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USERNAME: &str = "RABBITMQ_USERNAME";
pub const RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";
pub const EVENTS_QUEUE: &str = "EVENTS_QUEUE";

pub fn apply_overrides(config: &mut AppConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides_from(config, |key| env::var(key).ok())
}

/// Apply overrides using `lookup` in place of the process environment.
pub fn apply_overrides_from<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let rabbit = &mut config.rabbitmq;

    if let Some(host) = lookup(RABBITMQ_HOST) {
        rabbit.host = host;
    }
    if let Some(port) = lookup(RABBITMQ_PORT) {
        rabbit.port = port
            .trim()
            .parse()
            .with_context(|| format!("{} must be a port number, got '{}'", RABBITMQ_PORT, port))?;
    }
    if let Some(username) = lookup(RABBITMQ_USERNAME) {
        rabbit.username = username;
    }
    if let Some(password) = lookup(RABBITMQ_PASSWORD) {
        rabbit.password = password;
    }
    if let Some(prefetch) = lookup(RABBITMQ_PREFETCH_COUNT) {
        rabbit.prefetch_count = prefetch.trim().parse().with_context(|| {
            format!("{} must be a number, got '{}'", RABBITMQ_PREFETCH_COUNT, prefetch)
        })?;
    }
    if let Some(queue) = lookup(EVENTS_QUEUE) {
        config.events.queue = queue;
    }
    Ok(())
}
