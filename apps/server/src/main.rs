//! Castellan Server - headless control-plane daemon.
//!
//! Binds the core library to a host: CLI arguments, YAML configuration,
//! logging, mDNS advertisement, and signal-driven graceful shutdown.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use castellan_core::{
    bootstrap_backends, start_server, utils, AppState, MdnsAdvertiser, ServerDescription,
};
use clap::Parser;
use tokio::signal;

/// Castellan Server - uniform HTTP control plane for Linux session subsystems.
#[derive(Parser, Debug)]
#[command(name = "castellan-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, env = "CASTELLAN_LOG_LEVEL")]
    log_level: Option<log::LevelFilter>,

    /// API port (overrides config file).
    #[arg(short = 'p', long, env = "CASTELLAN_PORT")]
    port: Option<u16>,

    /// Interface to bind, or "all" (overrides config file).
    #[arg(short, long, env = "CASTELLAN_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration and apply CLI overrides.
    let mut config = config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    // CLI wins over the config file's logLevel.
    let level = args.log_level.unwrap_or_else(|| {
        config
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    });
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    log::info!("Castellan Server v{}", env!("CARGO_PKG_VERSION"));

    let addr = utils::resolve_bind_addr(&config.bind, config.api.port).map_err(|e| anyhow!(e))?;
    log::info!("Configuration: bind={} ({addr})", config.bind);

    let backends = bootstrap_backends(&config)
        .await
        .context("Failed to bootstrap backends")?;
    log::info!("Backends bootstrapped successfully");

    // Best-effort service advertisement; kept alive for its Drop impl,
    // which unregisters on shutdown.
    let _mdns = if config.zeroconf.enabled {
        match MdnsAdvertiser::new(&config.zeroconf, utils::advertise_ip(&addr), config.api.port) {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                log::warn!("mDNS advertisement unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    let server_handle = if config.api.enabled {
        let state = AppState::new(&backends, ServerDescription::detect());
        let cors_origins = config.cors.origins.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_server(state, addr, &cors_origins).await {
                log::error!("Server error: {}", e);
            }
        }))
    } else {
        log::warn!("API disabled; running the event pipeline without HTTP");
        None
    };

    // Wait for shutdown signal
    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    // Cancels the root token: watchers stop, streams say goodbye, and the
    // HTTP server begins its graceful drain.
    backends.shutdown();

    if let Some(handle) = server_handle {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(_) => {}
            Err(_) => log::warn!("Server did not drain within 5s; giving up on open connections"),
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
