//! PerchMQ - lightweight fixed-frame publish/subscribe broker
//!
//! Usage:
//!   perchmq [OPTIONS] [PORT]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:42069)
//!   --max-connections <N>  Maximum live connections (default: 128)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use perchmq::broker::Broker;
use perchmq::config::Config;
use perchmq::logging::{self, LogLevel};
use perchmq::signal::shutdown_signal;

/// PerchMQ - lightweight publish/subscribe broker
#[derive(Parser, Debug)]
#[command(name = "perchmq")]
#[command(author = "PerchMQ Contributors")]
#[command(version)]
#[command(about = "Lightweight fixed-frame publish/subscribe broker")]
struct Args {
    /// Port to listen on (overrides the port of the bind address)
    port: Option<u16>,

    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum live connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file if given, otherwise defaults plus PERCHMQ__* overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config; config was validated so the level parses
    let log_level = args
        .log_level
        .or_else(|| file_config.log.level.parse().ok())
        .unwrap_or(LogLevel::Info);
    logging::init(log_level)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let mut broker_config = file_config.broker_config();
    if let Some(bind) = args.bind {
        broker_config.bind_addr = bind;
    }
    if let Some(port) = args.port {
        broker_config.bind_addr.set_port(port);
    }
    if let Some(max) = args.max_connections {
        if max == 0 {
            eprintln!("--max-connections must be at least 1");
            std::process::exit(1);
        }
        broker_config.max_connections = max;
    }

    info!("Starting PerchMQ broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Max connections: {}", broker_config.max_connections);
    info!(
        "  Handshake budget: {:?} connect, {:?} disconnect",
        broker_config.connect_policy.budget(),
        broker_config.disconnect_policy.budget()
    );
    if broker_config.prune_empty_topics {
        info!("  Empty topic pruning: enabled");
    }

    let broker = Arc::new(Broker::new(broker_config));

    let listener = match broker.bind() {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", broker.config().bind_addr, e);
            std::process::exit(1);
        }
    };

    let signal_broker = broker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_broker.shutdown();
    });

    broker.serve(listener).await?;
    Ok(())
}
