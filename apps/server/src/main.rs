//! Tandem Server - headless home-audio server.
//!
//! Runs the device-control and HTTP reactors on their own threads and waits
//! for Ctrl+C / SIGTERM. If either reactor exits on its own, the other is
//! stopped too.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tandem_core::{bootstrap, WakeMode};
use tokio::signal;

use crate::config::ServerConfig;

/// How often the main task checks whether a reactor thread has exited.
const REACTOR_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Tandem Server - synchronized playback for network audio players.
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TANDEM_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// HTTP port (overrides config file).
    #[arg(short = 'p', long, env = "TANDEM_HTTP_PORT")]
    http_port: Option<u16>,

    /// Device-control port (overrides config file).
    #[arg(short = 's', long, env = "TANDEM_SLIM_PORT")]
    slim_port: Option<u16>,

    /// Cross-thread wake mechanism: waker or loopback.
    #[arg(short = 'w', long, env = "TANDEM_WAKE_MODE")]
    wake_mode: Option<WakeMode>,

    /// Data directory for playlists and player settings.
    #[arg(short = 'd', long, env = "TANDEM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory with the web UI.
    #[arg(long, env = "TANDEM_HTML_ROOT")]
    html_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Tandem Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(port) = args.slim_port {
        config.slim_port = port;
    }
    if let Some(mode) = args.wake_mode {
        config.wake_mode = mode;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }
    if let Some(html_root) = args.html_root {
        config.html_root = html_root;
    }

    log::info!(
        "Configuration: http_port={}, slim_port={}, wake_mode={}",
        config.http_port,
        config.slim_port,
        config.wake_mode
    );
    match &config.data_dir {
        Some(dir) => log::info!("Using data directory: {}", dir.display()),
        None => log::info!("No data directory configured - playlists will not persist"),
    }

    let core_config = config.to_core_config();
    let servers = bootstrap(&core_config)
        .context("Failed to bootstrap services")?
        .spawn()
        .context("Failed to start reactor threads")?;

    log::info!(
        "Serving HTTP on {} and devices on {}",
        servers.http_addr(),
        servers.slim_addr()
    );

    let mut check = tokio::time::interval(REACTOR_CHECK_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Shutdown signal received, cleaning up...");
                break;
            }
            _ = check.tick() => {
                if servers.any_finished() {
                    log::error!("A reactor stopped unexpectedly, shutting down");
                    break;
                }
            }
        }
    }

    // Joining the reactor threads blocks, so keep it off the async workers.
    tokio::task::spawn_blocking(move || servers.shutdown())
        .await
        .context("Shutdown task failed")?;

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
