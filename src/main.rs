//! mqtt-playground - command line entry point

use clap::{Parser, Subcommand, ValueEnum};
use mqtt_playground::config::{ConfigError, PlaygroundConfig};
use mqtt_playground::console::{random_message, ConsoleSession, InboundMessage};
use mqtt_playground::observability::init_default_logging;
use mqtt_playground::pubsub::{ConnectionState, PubSubAdapter};
use mqtt_playground::transport::{qos_from_level, MqttTransport, PublishOptions};
use mqtt_playground::{AdapterError, AdapterResult};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Locations searched for a configuration file when `--config` is not given
const CONFIG_SEARCH_PATHS: [&str; 2] = ["playground.toml", "config/playground.toml"];

/// How often `watch` checks that the connection is still alive
const CONNECTION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Connect to an MQTT broker, watch topics and publish messages
#[derive(Parser)]
#[command(name = "mqtt-playground")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to topics and print messages until Ctrl-C
    Watch {
        /// Broker URL, overrides the configuration
        #[arg(short, long, env = "MQTT_BROKER_URL")]
        broker: Option<String>,
        /// Topic to subscribe to (repeatable); defaults to the configured topic
        #[arg(short, long = "topic", value_name = "TOPIC")]
        topics: Vec<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },
    /// Publish one message and exit
    Publish {
        #[arg(short, long, env = "MQTT_BROKER_URL")]
        broker: Option<String>,
        /// Topic to publish to; defaults to the configured topic
        #[arg(short, long)]
        topic: Option<String>,
        #[arg(short, long, conflicts_with = "random", required_unless_present = "random")]
        message: Option<String>,
        /// Publish ten random alphanumeric characters
        #[arg(long)]
        random: bool,
        /// QoS level (0, 1 or 2); defaults to the configured level
        #[arg(short, long)]
        qos: Option<u8>,
        #[arg(long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(long)]
        show: bool,
    },
}

/// How `watch` prints messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Pretty,
    Compact,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch {
            broker,
            topics,
            format,
        } => run_watch(&config, broker, topics, format).await,
        Commands::Publish {
            broker,
            topic,
            message,
            random,
            qos,
            retain,
        } => {
            let payload = if random {
                random_message()
            } else {
                message.unwrap_or_default()
            };
            run_publish(&config, broker, topic, payload, qos, retain).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

/// Explicit path first, then the search paths, then defaults
fn load_configuration(config_path: Option<&Path>) -> Result<PlaygroundConfig, ConfigError> {
    let path = config_path.map(Path::to_path_buf).or_else(|| {
        CONFIG_SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    });

    match &path {
        Some(path) => info!("Loading configuration from: {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    PlaygroundConfig::load_or_default(path.as_deref())
}

async fn run_watch(
    config: &PlaygroundConfig,
    broker: Option<String>,
    topics: Vec<String>,
    format: OutputFormat,
) -> AdapterResult<()> {
    let broker = broker.unwrap_or_else(|| config.mqtt.broker_url.clone());
    let topics = if topics.is_empty() {
        vec![config.console.default_topic.clone()]
    } else {
        topics
    };

    let adapter = Arc::new(PubSubAdapter::with_subscribe_qos(
        Arc::new(MqttTransport::new()),
        config.qos()?,
    ));
    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
    let mut session = ConsoleSession::new(adapter)
        .with_history_limit(config.console.history_limit)
        .with_feed(feed_tx);

    if !session
        .open(&broker, topics.first().map(String::as_str), config.connect_options()?)
        .await
    {
        return Err(session
            .last_error()
            .await
            .unwrap_or_else(|| AdapterError::connection(format!("could not connect to {broker}"))));
    }

    for topic in topics.iter().skip(1) {
        if !session.subscribe(topic).await {
            warn!(topic = %topic, "Subscribe failed");
        }
    }

    info!(topics = ?session.subscribed_topics(), "Watching, press Ctrl-C to stop");

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut connection_check = tokio::time::interval(CONNECTION_CHECK_INTERVAL);
    let mut last_state = session.connection_state().await;
    let mut lost = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            Some(message) = feed_rx.recv() => {
                match format_message(&message, format) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("Could not format message: {}", e),
                }
            }
            _ = connection_check.tick() => {
                let state = session.connection_state().await;
                if state != last_state {
                    match &state {
                        ConnectionState::Connected => info!("Connection restored"),
                        other => warn!(state = %other, "Connection lost, waiting for reconnect"),
                    }
                    last_state = state;
                }

                if session.connection_info().await.is_none() {
                    lost = Some(last_state.clone());
                    break;
                }
            }
        }
    }

    let received = session.messages().len();
    session.close().await;
    info!(received, "Watch finished");

    match lost {
        Some(state) => Err(AdapterError::connection(format!(
            "connection to {broker} closed ({state})"
        ))),
        None => Ok(()),
    }
}

async fn run_publish(
    config: &PlaygroundConfig,
    broker: Option<String>,
    topic: Option<String>,
    payload: String,
    qos: Option<u8>,
    retain: bool,
) -> AdapterResult<()> {
    let broker = broker.unwrap_or_else(|| config.mqtt.broker_url.clone());
    let topic = topic.unwrap_or_else(|| config.console.default_topic.clone());
    let qos = match qos {
        Some(level) => qos_from_level(level).map_err(|e| AdapterError::config(e.to_string()))?,
        None => config.qos()?,
    };

    let adapter = PubSubAdapter::new(Arc::new(MqttTransport::new()));
    adapter.connect(&broker, config.connect_options()?).await?;

    let result = adapter
        .publish_with(&topic, &payload, PublishOptions { qos, retain })
        .await;
    adapter.close().await;
    result?;

    info!(topic = %topic, bytes = payload.len(), "Message published");
    Ok(())
}

fn handle_config_command(config: &PlaygroundConfig, show: bool) -> AdapterResult<()> {
    config.validate()?;
    if show {
        println!("{}", config.to_toml()?);
    }

    info!("Configuration validation complete");
    Ok(())
}

fn format_message(
    message: &InboundMessage,
    format: OutputFormat,
) -> Result<String, serde_json::Error> {
    Ok(match format {
        OutputFormat::Pretty => format!(
            "[{}] {}: {}",
            message.received_at.format("%H:%M:%S%.3f"),
            message.topic,
            message.payload
        ),
        OutputFormat::Compact => format!("{} {}", message.topic, message.payload),
        OutputFormat::Json => serde_json::to_string(message)?,
    })
}
