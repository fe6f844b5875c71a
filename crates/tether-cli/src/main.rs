//! # Tether CLI
//!
//! Connects to a channel server, joins the configured topics and logs
//! everything that arrives.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tether
//!
//! # Run with a config file
//! tether /path/to/tether.toml
//!
//! # Run with environment variables
//! TETHER_ENDPOINT=wss://example.com/socket TETHER_TRANSPORT=longpoll tether
//! ```

mod config;
mod metrics;
mod session;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info,tether_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Connecting to {} over {}", config.endpoint, config.transport);

    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)?;
        metrics::init_metrics();
    }

    session::run(config).await?;

    Ok(())
}
