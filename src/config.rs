// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::env;
use crate::rabbitmq::{Credentials, OnHandlerError, ReconnectPolicy};
use crate::rabbitmq_client::ClientSettings;

const HOME_CONFIG_FILE: &str = ".it-notifier.json";

// Configuration structures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub rabbitmq: RabbitConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RabbitConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default)]
    pub on_handler_error: OnHandlerError,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub max_publish_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Events buffered between the consumer and the notifier
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_prefetch_count() -> u16 { 10 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.15 }
fn default_queue() -> String { "events".to_string() }
fn default_buffer() -> usize { 64 }

impl Default for RabbitConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            prefetch_count: default_prefetch_count(),
            on_handler_error: OnHandlerError::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_publish_attempts: None,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            buffer: default_buffer(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
            max_publish_attempts: self.max_publish_attempts,
        }
    }
}

impl AppConfig {
    pub fn credentials(&self) -> Credentials {
        let rabbit = &self.rabbitmq;
        Credentials::new(&rabbit.username, &rabbit.password, &rabbit.host, rabbit.port)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            reconnect: self.rabbitmq.reconnect.policy(),
            prefetch_count: self.rabbitmq.prefetch_count,
            on_handler_error: self.rabbitmq.on_handler_error,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.credentials()
            .validate()
            .context("Configuration error in [rabbitmq]")?;
        if self.events.queue.trim().is_empty() {
            return Err(anyhow!("Configuration error: events.queue cannot be empty"));
        }
        if self.events.buffer == 0 {
            return Err(anyhow!("Configuration error: events.buffer must be positive"));
        }
        let reconnect = &self.rabbitmq.reconnect;
        if reconnect.multiplier < 1.0 || !(0.0..1.0).contains(&reconnect.jitter) {
            return Err(anyhow!(
                "Configuration error: reconnect.multiplier must be >= 1 and reconnect.jitter in [0, 1)"
            ));
        }
        Ok(())
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Option<PathBuf> {
    let locations = [
        ("Current directory", Path::new("config.json")),
        ("Configs directory", Path::new("configs/config.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(HOME_CONFIG_FILE);
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn read_config_file(path: &Path) -> Result<AppConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    serde_json::from_str(&config_content)
        .with_context(|| format!("Config file {} contains invalid JSON", path.display()))
}

/// Load settings from `path` (or the first file found), then apply
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path.map(Path::to_path_buf).or_else(find_config_file) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            read_config_file(&path)?
        }
        None => {
            info!("No configuration file found, using defaults");
            AppConfig::default()
        }
    };

    env::apply_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}
