//! SAN Volume Driver
//!
//! Command line front end for the volume driver core: loads a backend
//! configuration, builds the driver and runs one-shot maintenance commands
//! against the array.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use san_volume_driver::{BackendFactory, DriverConfig, VolumeDriverRef};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SAN Volume Driver - block storage driver core for LeftHand and Datera arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend configuration file (YAML)
    #[arg(long, env = "SAN_DRIVER_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the backend and verify the configuration
    Check,

    /// Print backend capacity statistics as JSON
    Stats {
        /// Query the array instead of returning cached values
        #[arg(long)]
        refresh: bool,
    },

    /// List the configured replication targets
    Targets,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting SAN volume driver");
    info!("  Version: {}", san_volume_driver::VERSION);
    info!("  Config: {}", args.config.display());

    let config = DriverConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if let Err(e) = run(&args.command, config).await {
        error!("Command failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(command: &Command, config: DriverConfig) -> anyhow::Result<()> {
    match command {
        Command::Targets => {
            let targets = replication_target_ids(&config);
            println!("{}", serde_json::to_string_pretty(&targets)?);
        }
        Command::Check => {
            let driver = setup(config).await?;
            driver
                .check_for_setup_error()
                .await
                .context("checking backend setup")?;
            info!("Backend {} is ready", driver.backend_name());
            println!("{}", serde_json::to_string_pretty(&driver.capabilities())?);
        }
        Command::Stats { refresh } => {
            let driver = setup(config).await?;
            let stats = driver
                .get_volume_stats(*refresh)
                .await
                .context("fetching volume stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

/// Build the configured driver and connect it to the array
async fn setup(config: DriverConfig) -> anyhow::Result<VolumeDriverRef> {
    let driver = BackendFactory::create(config).context("creating driver")?;
    driver.do_setup().await.context("connecting to backend")?;
    Ok(driver)
}

fn replication_target_ids(config: &DriverConfig) -> Vec<String> {
    match config {
        DriverConfig::Lefthand(config) => config
            .replication_targets
            .iter()
            .map(|t| t.target_device_id.clone())
            .collect(),
        DriverConfig::Datera(_) => Vec::new(),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so command output stays machine readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
