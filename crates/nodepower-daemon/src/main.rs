//! Node Power Exec Daemon
//!
//! Polls one power sensor at a fixed interval and writes metric lines to
//! stdout for the metrics agent's execd input.

mod config;
mod poller;
mod sensors;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use nodepower_core::FileCounterStore;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use poller::Poller;
use sensors::{SensorKind, SensorSource};

#[derive(Parser)]
#[command(name = "nodepower-execd")]
#[command(about = "Poll a node power sensor and print metric lines")]
#[command(version)]
struct Args {
    /// Poll interval in seconds
    #[arg(value_parser = parse_interval)]
    interval: Duration,

    /// Sensor to poll
    #[arg(value_enum)]
    sensor: SensorKind,

    /// PDU number (1 or 2), required for pdu_sensor
    #[arg(value_parser = clap::value_parser!(u8).range(1..=2))]
    pdu_number: Option<u8>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host name to report (default: short system host name)
    #[arg(long)]
    hostname: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_interval(s: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("invalid interval: {}", s))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| format!("interval must be a non-negative number of seconds: {}", s))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.sensor == SensorKind::Pdu && args.pdu_number.is_none() {
        Args::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "pdu_sensor requires a PDU number",
            )
            .exit();
    }

    // Setup logging; stdout carries metric lines
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive("info".parse()?)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = match &args.config {
        Some(path) => {
            let config = Config::load(path).context("Failed to load configuration")?;
            info!("Loaded configuration from: {}", path.display());
            config
        }
        None => Config::default(),
    };

    let hostname = args
        .hostname
        .clone()
        .or_else(|| config.hostname.clone())
        .unwrap_or_else(sensors::system::short_hostname);

    let sensor = SensorSource::new(args.sensor, args.pdu_number, &hostname, &config)
        .context("Failed to set up sensor")?;
    let state_file = config.state_file_path()?;
    let store = FileCounterStore::new(&state_file);

    info!(
        "Polling {} every {:?} as {} (counter state: {})",
        args.sensor,
        args.interval,
        hostname,
        state_file.display()
    );

    // Setup Unix signal handlers
    let shutdown = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
            }
        }
        signal_token.cancel();
    });

    let mut poller = Poller::new(
        sensor,
        Box::new(store),
        &hostname,
        args.interval,
        std::io::stdout(),
    );
    poller.run(shutdown).await;

    Ok(())
}
