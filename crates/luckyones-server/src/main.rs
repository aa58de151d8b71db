//! LuckyOnes relay binary.
//!
//! # Usage
//!
//! ```bash
//! luckyones-server --bind 0.0.0.0:6660
//!
//! # Sweep expired threads every 250ms
//! luckyones-server --bind 127.0.0.1:6660 --tick-interval-ms 250
//! ```

use std::time::Duration;

use clap::Parser;
use luckyones_server::{RelayConfig, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// LuckyOnes relay server
#[derive(Parser, Debug)]
#[command(name = "luckyones-server")]
#[command(about = "Ephemeral end-to-end encrypted messaging relay")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:6660")]
    bind: String,

    /// Deadline sweep interval in milliseconds
    #[arg(long, default_value = "1000")]
    tick_interval_ms: u64,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("LuckyOnes relay starting");
    tracing::info!("Binding to {}", args.bind);

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        tick_interval: Duration::from_millis(args.tick_interval_ms),
        relay: RelayConfig { max_connections: args.max_connections, ..Default::default() },
    };

    let server = Server::bind(config).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
