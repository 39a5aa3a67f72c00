//! Interactive PerchMQ client
//!
//! Usage:
//!   perchmq-client [OPTIONS] <HOST> <PORT>
//!
//! Reads one command per line from stdin:
//!   PUB <topic> <message>      publish
//!   PUBRET <topic> <message>   publish and retain
//!   SUB <topic-pattern>        subscribe (`+` and `#` wildcards)
//!   UNSUB <topic-pattern>      unsubscribe
//!   LIST                       list subscribed topics
//!   DISCONNECT                 close the session and exit

use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};

use perchmq::client::{Client, ClientOptions, Command, CommandError, Delivery};
use perchmq::logging::{self, LogLevel};
use perchmq::session::RetryPolicy;
use perchmq::signal::shutdown_signal;

/// PerchMQ interactive client
#[derive(Parser, Debug)]
#[command(name = "perchmq-client")]
#[command(author = "PerchMQ Contributors")]
#[command(version)]
#[command(about = "Interactive client for a PerchMQ broker")]
struct Args {
    /// Broker host name or address
    host: String,

    /// Broker port
    port: u16,

    /// Handshake retries for CONN and DISC
    #[arg(long, default_value_t = 10)]
    retries: u32,

    /// Wait per handshake try in milliseconds
    #[arg(long, default_value_t = 100)]
    retry_interval_ms: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(args.log_level)?;

    let policy = RetryPolicy::new(args.retries, Duration::from_millis(args.retry_interval_ms));
    let options = ClientOptions {
        connect: policy,
        disconnect: policy,
        ..ClientOptions::default()
    };

    let (mut client, mut deliveries) =
        match Client::connect_with((args.host.as_str(), args.port), options).await {
            Ok(connected) => connected,
            Err(e) => {
                eprintln!("Failed to connect to {}:{}: {}", args.host, args.port, e);
                std::process::exit(1);
            }
        };
    info!("Connected to {}", client.peer_addr());
    println!("Connected to {}:{}", args.host, args.port);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                match delivery {
                    Some(delivery) => print_delivery(delivery),
                    None => {
                        println!("Disconnected by broker");
                        break;
                    }
                }
            }

            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("stdin closed");
                        stdin_open = false;
                        continue;
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        stdin_open = false;
                        continue;
                    }
                };

                let command = match Command::parse(&line) {
                    Ok(command) => command,
                    Err(CommandError::Empty) => continue,
                    Err(e) => {
                        eprintln!("{}", e);
                        continue;
                    }
                };

                let leaving = command == Command::Disconnect;
                if let Err(e) = client.execute(command).await {
                    eprintln!("{}", e);
                }
                if leaving {
                    break;
                }
            }

            _ = &mut signal => {
                info!("Shutdown signal received");
                if let Err(e) = client.disconnect().await {
                    eprintln!("{}", e);
                }
                break;
            }
        }
    }

    Ok(())
}

fn print_delivery(delivery: Delivery) {
    match delivery {
        Delivery::Message {
            topic,
            message,
            retained: true,
        } => println!("[{}] (retained) {}", topic, message),
        Delivery::Message { topic, message, .. } => println!("[{}] {}", topic, message),
        Delivery::Subscriptions(topics) if topics.is_empty() => println!("No subscriptions"),
        Delivery::Subscriptions(topics) => println!("Subscribed: {}", topics.join(", ")),
        Delivery::Notice(text) => println!("{}", text.trim_end()),
    }
}
