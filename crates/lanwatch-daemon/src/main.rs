//! LAN Watch Daemon - Main entry point
//!
//! Scans the local network on a schedule and serves the Telegram bot.

use anyhow::Result;
use clap::Parser;
use lanwatch_daemon::{config, state};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "lanwatch")]
#[command(about = "Network presence scanner with a Telegram front end")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "lanwatch.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single scan, print what answered and exit
    #[arg(long)]
    scan_once: bool,

    /// Write a default configuration file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("LAN Watch v{}", env!("CARGO_PKG_VERSION"));

    if args.init_config {
        if args.config.exists() {
            anyhow::bail!("{} already exists", args.config.display());
        }
        config::save_default_config(&args.config)?;
        println!("Wrote default configuration to {}", args.config.display());
        return Ok(());
    }

    // Load configuration
    let config = config::load_config(&args.config)?;

    info!(
        interval_secs = config.daemon.scan_interval_secs,
        data_dir = %config.daemon.data_dir.display(),
        "Configuration loaded"
    );

    let state = state::AppState::new(config)?;

    if args.scan_once {
        info!(backend = state.backend.name(), "Running single scan");
        let detections = state.scan_once().await?;
        println!("Found {} devices:", detections.len());
        for (detection, name) in detections {
            match name {
                Some(name) => println!(
                    "  - {} at {} ({})",
                    detection.hardware_id, detection.network_address, name
                ),
                None => println!(
                    "  - {} at {}",
                    detection.hardware_id, detection.network_address
                ),
            }
        }
    } else {
        state.run().await?;
    }

    Ok(())
}
