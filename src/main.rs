//! relaybus command line client

use clap::{Parser, Subcommand};
use relaybus::observability::init_default_logging;
use relaybus::{BusClient, BusConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info};

/// Publish, request and consume messages on a relaybus broker
#[derive(Parser)]
#[command(name = "relaybus")]
#[command(about = "Pub/sub client with request/reply and queue groups")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Request timeout in milliseconds
    #[arg(long, value_name = "MS", global = true)]
    timeout_ms: Option<u64>,

    /// Group used for queue workers
    #[arg(short, long, global = true)]
    group: Option<String>,

    /// Broker URL, overrides the configuration file
    #[arg(long, env = "RELAYBUS_BROKER_URL", global = true)]
    broker_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message
    Publish { subject: String, message: String },
    /// Send a request and print the reply
    Request { subject: String, message: String },
    /// Print every message on a subject
    Subscribe { subject: String },
    /// Print messages taken as a queue worker
    Process { subject: String },
    /// Answer requests by echoing them back
    Listen { subject: String },
    /// Print the next message on a subject and exit
    Once { subject: String },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Config { show } => handle_config_command(&config, show),
        command => run_command(config, command).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<BusConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            BusConfig::load_from_file(path)?
        }
        None => {
            let default_path = Path::new("relaybus.toml");
            if default_path.exists() {
                info!("Loading configuration from: {}", default_path.display());
                BusConfig::load_from_file(default_path)?
            } else {
                BusConfig::default()
            }
        }
    };

    if let Some(group) = &cli.group {
        config = config.with_group(group.clone());
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(url) = &cli.broker_url {
        config = config.with_broker_url(url.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Message arguments are JSON; anything else is sent as a JSON string
fn parse_message(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_command(
    config: BusConfig,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = BusClient::connect(config).await?;
    run_with_client(&client, command).await
}

/// Run `command` and close the client whatever the outcome
async fn run_with_client(
    client: &BusClient,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = execute(client, command).await;
    let closed = client.close().await;
    result?;
    closed?;
    Ok(())
}

async fn execute(client: &BusClient, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    client.connected().await?;

    match command {
        Commands::Publish { subject, message } => {
            client.publish(&subject, &parse_message(&message)).await?;
            Ok(())
        }
        Commands::Request { subject, message } => {
            let reply: Value = client.request(&subject, &parse_message(&message)).await?;
            println!("{reply}");
            Ok(())
        }
        Commands::Subscribe { subject } => {
            client
                .subscribe(&subject, |message, reply_to, subject| match reply_to {
                    Some(reply_to) => println!("[{subject}] {message} (reply to {reply_to})"),
                    None => println!("[{subject}] {message}"),
                })
                .await?;
            wait_for_shutdown().await
        }
        Commands::Process { subject } => {
            client
                .process(&subject, |message, subject| println!("[{subject}] {message}"))
                .await?;
            wait_for_shutdown().await
        }
        Commands::Listen { subject } => {
            client
                .listen(&subject, |message| async move { Ok(message) })
                .await?;
            info!("Answering requests on {}", subject);
            wait_for_shutdown().await
        }
        Commands::Once { subject } => {
            let (tx, rx) = oneshot::channel();
            client
                .subscribe_once(&subject, move |message, subject| {
                    let _ = tx.send((subject, message));
                })
                .await?;
            tokio::select! {
                received = rx => {
                    if let Ok((subject, message)) = received {
                        println!("[{subject}] {message}");
                    }
                    Ok(())
                }
                result = wait_for_shutdown() => result,
            }
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn handle_config_command(config: &BusConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
    Ok(())
}
