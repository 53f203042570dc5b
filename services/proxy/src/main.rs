//! rotor proxy
//!
//! Forward HTTP/HTTPS proxy rotating IPv6 egress addresses.
//!
//! This service:
//! - Accepts proxy connections on one listener
//! - Optionally requires Basic proxy credentials
//! - Tunnels CONNECT requests and forwards plain HTTP requests
//! - Binds every IPv6 outbound connection to a random address in the block

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rotor_proxy::config::{Args, Config};
use rotor_proxy::{host, Dispatcher, Listener, ListenerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e);
        }
    };

    info!("Starting rotor proxy");
    info!(
        cidr = %config.block,
        listen_addr = %config.listen_addr,
        auth_enabled = config.credentials.is_some(),
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    host::prepare(&config);

    let dispatcher = Dispatcher::new(config.block, config.credentials.clone())
        .context("failed to build proxy dispatcher")?;

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;

    let listener = match Listener::bind(listener_config, Arc::new(dispatcher)).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(
                bind_addr = %config.listen_addr,
                error = %e,
                "Failed to bind listener"
            );
            return Err(e.into());
        }
    };

    listener.run().await?;
    Ok(())
}
