//! Operator CLI for the AMQP transport
//!
//! Loads a transport config, connects to one of its brokers and runs a single
//! publish, stats or consume command.

use amqp_transport::config::TransportConfig;
use amqp_transport::observability::init_default_logging;
use amqp_transport::transport::amqp::{
    AmqpTransport, DeliveryInfo, DnsResolver, ExchangeType, LapinConnector, PublishOptions,
    QueueOptions, SubscribeOptions,
};
use amqp_transport::transport_span;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, Instrument};

/// Resilient AMQP transport client
#[derive(Parser)]
#[command(name = "amqp-transport")]
#[command(about = "Publish, consume and inspect queues on a monitoring event bus")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "AMQP_TRANSPORT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Publish one message to a pipe
    Publish {
        /// Exchange type: direct, fanout or topic
        #[arg(long = "type", default_value = "direct", value_parser = parse_exchange_type)]
        exchange_type: ExchangeType,
        #[arg(long, default_value = "")]
        routing_key: String,
        pipe: String,
        message: String,
    },
    /// Print message and consumer counts of a funnel
    Stats { funnel: String },
    /// Consume from a funnel bound to a pipe until Ctrl-C
    Consume {
        #[arg(long = "type", default_value = "direct", value_parser = parse_exchange_type)]
        exchange_type: ExchangeType,
        pipe: String,
        funnel: String,
    },
}

fn parse_exchange_type(s: &str) -> Result<ExchangeType, String> {
    ExchangeType::parse(s).ok_or_else(|| format!("unknown exchange type: {s}"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Publish {
            exchange_type,
            routing_key,
            pipe,
            message,
        } => {
            let span = transport_span!(command = "publish", pipe = %pipe);
            publish(&config, exchange_type, &pipe, &routing_key, &message)
                .instrument(span)
                .await
        }
        Commands::Stats { funnel } => {
            let span = transport_span!(command = "stats", funnel = %funnel);
            stats(&config, &funnel).instrument(span).await
        }
        Commands::Consume {
            exchange_type,
            pipe,
            funnel,
        } => {
            let span = transport_span!(command = "consume", pipe = %pipe, funnel = %funnel);
            consume(&config, exchange_type, &pipe, &funnel)
                .instrument(span)
                .await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<TransportConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(TransportConfig::load_from_file(path)?);
    }

    for path_str in ["transport.toml", "config/transport.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(TransportConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using a local broker with default options");
    Ok(TransportConfig::default())
}

fn handle_config_command(
    config: &TransportConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!(
        brokers = config.rabbitmq.as_slice().len(),
        "Configuration validation complete"
    );
    Ok(())
}

/// Connect and wait for both connections, bounded by the connect timeout
async fn connect(config: &TransportConfig) -> Result<AmqpTransport, Box<dyn std::error::Error>> {
    let policy = config.reconnect_policy();
    let timeout = policy.connect_timeout;
    let transport =
        AmqpTransport::with_policy(Arc::new(LapinConnector::new()), Arc::new(DnsResolver), policy)?;

    transport.on_error(|e| error!(error = %e.to_error_info().message, "Transport error"));
    transport.on_before_reconnect(|| info!("Broker connection lost, reconnecting"));
    transport.on_after_reconnect(|| info!("Broker connection restored"));

    transport.connect(config.brokers());
    tokio::time::timeout(timeout, transport.ready())
        .await
        .map_err(|_| format!("no broker connection within {}s", timeout.as_secs()))??;

    Ok(transport)
}

async fn publish(
    config: &TransportConfig,
    exchange_type: ExchangeType,
    pipe: &str,
    routing_key: &str,
    message: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = connect(config).await?;
    let options = PublishOptions {
        routing_key: routing_key.to_string(),
        content_type: Some("application/json".to_string()),
        ..Default::default()
    };

    let info = transport
        .publish(exchange_type, pipe, message.as_bytes(), &options)
        .await?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    transport.close();
    Ok(())
}

async fn stats(config: &TransportConfig, funnel: &str) -> Result<(), Box<dyn std::error::Error>> {
    let transport = connect(config).await?;
    let stats = transport.stats(funnel, &QueueOptions::default()).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    transport.close();
    Ok(())
}

async fn consume(
    config: &TransportConfig,
    exchange_type: ExchangeType,
    pipe: &str,
    funnel: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = connect(config).await?;
    info!("Consuming, press Ctrl-C to stop");

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Unable to listen for Ctrl-C");
        }
        info!("Received Ctrl-C, shutting down");
    };

    consume_until(&transport, exchange_type, pipe, funnel, ctrl_c, |info, payload| {
        let line = serde_json::json!({
            "info": info,
            "payload": String::from_utf8_lossy(payload),
        });
        println!("{line}");
    })
    .await;

    transport.unsubscribe().await;
    transport.close();
    Ok(())
}

/// Consume `funnel` until `shutdown` resolves, acknowledging every delivery
///
/// Subscriptions die with their connection, so the funnel is subscribed
/// again after each reconnect.
async fn consume_until<F>(
    transport: &AmqpTransport,
    exchange_type: ExchangeType,
    pipe: &str,
    funnel: &str,
    shutdown: F,
    mut on_delivery: impl FnMut(&DeliveryInfo, &[u8]),
) where
    F: Future<Output = ()>,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<(DeliveryInfo, Vec<u8>)>();
    let handler = Arc::new(tx);
    let options = SubscribeOptions::default();

    let reconnected = Arc::new(Notify::new());
    let signal = Arc::clone(&reconnected);
    transport.on_after_reconnect(move || {
        info!("Broker connection restored");
        signal.notify_one();
    });

    transport
        .subscribe(exchange_type, pipe, funnel, &options, handler.clone())
        .await;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = reconnected.notified() => {
                info!(funnel = %funnel, "Resubscribing after reconnect");
                transport
                    .subscribe(exchange_type, pipe, funnel, &options, handler.clone())
                    .await;
            }
            Some((info, payload)) = rx.recv() => {
                on_delivery(&info, &payload);
                transport.acknowledge(&info).await;
            }
        }
    }
}
