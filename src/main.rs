//! it-notifier: relays events from RabbitMQ to their recipients.
//!
//! - `it-notifier run` consumes the events queue until Ctrl-C
//! - `it-notifier publish --recipient <id> <text>` sends one event

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info};

use it_notifier::config::{load_config, AppConfig};
use it_notifier::message::Event;
use it_notifier::notifier::{dispatch_events, EventForwarder, LogNotifier};
use it_notifier::RabbitClient;

#[derive(Parser)]
#[command(name = "it-notifier", version, about, long_about = None)]
struct Cli {
    /// Path to a JSON config file (default: config.json, configs/config.json, ~/.it-notifier.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the events queue and deliver each event
    Run,

    /// Publish a text event
    Publish {
        /// Chat id of the recipient
        #[arg(short, long)]
        recipient: i64,

        /// Queue to publish to (defaults to the configured events queue)
        #[arg(short, long)]
        queue: Option<String>,

        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    let client = RabbitClient::new(config.credentials(), config.client_settings())
        .context("Failed to create RabbitMQ client")?;

    let ctrl_c = {
        let client = client.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
                client.shutdown().await;
            }
        })
    };

    let result = match cli.command {
        Commands::Run => run(&client, &config).await,
        Commands::Publish {
            recipient,
            queue,
            text,
        } => {
            let queue = queue.unwrap_or_else(|| config.events.queue.clone());
            publish(&client, &queue, Event::text(recipient, &text)).await
        }
    };

    ctrl_c.abort();
    client.shutdown().await;
    result
}

async fn run(client: &RabbitClient, config: &AppConfig) -> Result<()> {
    let (tx, rx) = mpsc::channel(config.events.buffer);
    let dispatcher = tokio::spawn(async move { dispatch_events(rx, &LogNotifier).await });

    let forwarder = EventForwarder::new(tx);
    let stats = client.consume(&config.events.queue, &forwarder).await;
    drop(forwarder);

    let dispatched = dispatcher.await.context("Event dispatcher panicked")?;
    info!(
        sent = dispatched.sent,
        skipped = dispatched.skipped,
        failed = dispatched.failed,
        "Event dispatcher stopped"
    );

    let stats = stats.context("Consumer failed")?;
    info!(
        cycles = stats.cycles,
        acked = stats.acked,
        requeued = stats.requeued,
        rejected = stats.rejected,
        "Consumer finished"
    );
    Ok(())
}

async fn publish(client: &RabbitClient, queue: &str, event: Event) -> Result<()> {
    let body = event.to_vec().context("Failed to encode event")?;
    match client.publish(queue, &body).await {
        Ok(receipt) => {
            info!(
                queue,
                message_id = %receipt.message_id,
                attempts = receipt.attempts,
                "Event published"
            );
            Ok(())
        }
        Err(err) => {
            error!(queue, "Event was not published: {}", err);
            Err(err.into())
        }
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
