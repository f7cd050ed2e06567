//! pulsemon Agent Daemon
//!
//! Accepts metrics from co-located processes over a local HTTP listener
//! and maintains an outbound reverse tunnel so the collection broker can
//! query the agent through NATs and firewalls.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pm_agent::Agent;
use pm_core::{config, Config};

#[derive(Parser)]
#[command(name = "pm-agent")]
#[command(about = "pulsemon host metrics agent")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address for the local metrics endpoint (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Check bundle ID (overrides config)
    #[arg(long)]
    check_bundle_cid: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("pulsemon agent starting...");

    // process-wide TLS provider, used by both the API client and the tunnel
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                Config::default()
            })
        } else {
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    // Apply command-line overrides
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(cid) = args.check_bundle_cid {
        config.reverse.check_bundle_cid = cid;
    }

    Agent::new(config).run().await
}
