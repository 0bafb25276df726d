//! tapwire
//!
//! Intercepting proxy with TLS termination, route-based forwarding and
//! traffic capture.
//!
//! This binary:
//! - Loads configuration from a TOML file and the environment
//! - Binds the proxy listener
//! - Logs every captured unit until interrupted

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tapwire_proxy::{ProxyBuilder, ProxyConfig};

/// tapwire - intercepting proxy.
#[derive(Debug, Parser)]
#[command(name = "tapwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "TAPWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the configuration).
    #[arg(long, env = "TAPWIRE_PORT")]
    port: Option<u16>,

    /// Address to bind (overrides the configuration).
    #[arg(long, env = "TAPWIRE_BIND_ADDRESS")]
    bind: Option<IpAddr>,

    /// Write the interception CA certificate to this path after startup.
    #[arg(long)]
    export_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ProxyConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ProxyConfig::default(),
    };
    config
        .apply_env(|key| std::env::var(key).ok())
        .context("invalid environment configuration")?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }

    // Prefer RUST_LOG, fall back to the configured level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tapwire");
    info!(
        bind_address = %config.bind_address,
        port = config.port,
        routes = config.routes.len(),
        modifiers = config.modifiers.len(),
        tls_termination = config.activate_tls_termination,
        "Configuration loaded"
    );

    let proxy = ProxyBuilder::new(config)
        .start()
        .await
        .context("failed to start proxy")?;
    info!(bind_addr = %proxy.local_addr(), "Listening");

    if let Some(path) = &cli.export_ca {
        std::fs::write(path, proxy.ca_certificate_pem())
            .with_context(|| format!("failed to write CA certificate to {}", path.display()))?;
        info!(path = %path.display(), "CA certificate exported");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    proxy.shutdown().await;
    Ok(())
}
