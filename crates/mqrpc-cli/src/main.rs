//! mqrpc CLI - demo service and line-oriented caller.
//!
//! Hosts the demo methods on an in-process broker and forwards JSON call lines
//! read from stdin through a caller node, printing one result line per call.

mod methods;
mod session;

use anyhow::Result;
use clap::Parser;
use mqrpc::{MemoryBroker, RpcNode, Settings};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_EXCHANGE: &str = "demo";

#[derive(Parser, Debug)]
#[command(name = "mqrpc-cli")]
#[command(about = "JSON-RPC over a message broker: demo service and caller")]
struct Args {
    /// Service exchange name [env: MQRPC_EXCHANGE, default: demo]
    #[arg(short, long)]
    exchange: Option<String>,

    /// Broker address [env: MQRPC_BROKER_URL]
    #[arg(long)]
    broker_url: Option<String>,

    /// Give up on a call after this many milliseconds (0 = wait forever)
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; stdout carries call results
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // Flags win over the environment
    let mut settings = Settings::from_env(DEFAULT_EXCHANGE);
    if let Some(exchange) = args.exchange {
        settings = settings.with_exchange(exchange);
    }
    if let Some(url) = args.broker_url {
        settings = settings.with_broker_url(url);
    }
    info!("Starting mqrpc demo on exchange {}", settings.exchange);
    let broker = Arc::new(MemoryBroker::new());

    let service = RpcNode::new(settings.clone(), broker.clone());
    methods::register_all(&service).await;
    service.start_listener().await?;

    let client = RpcNode::new(settings, broker);
    client.start_caller().await?;

    let timeout = (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms));
    let mut session = session::CallSession::new(&client, timeout);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("End of input");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                // Intentional stdout: one result line per call line
                println!("{}", session.run_line(&line).await);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                break;
            }
        }
    }

    client.shutdown().await?;
    service.shutdown().await?;
    Ok(())
}
