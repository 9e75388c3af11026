//! Energy Reporter
//!
//! Computes per-node energy from power samples recorded in InfluxDB, for an
//! explicit time window or for the window and nodes of a Slurm job.

mod nodes;
mod report;
mod timespec;

use anyhow::{Context, Result};
use clap::Parser;
use nodepower_client::{
    InfluxClient, InfluxConfig, JobLookup, JobScheduler, JobWindow, SampleQuery, SampleSource,
    SlurmClient,
};
use nodepower_core::{
    EnergyIntegrator, HostEnergy, IntegrationOptions, NegativeIntervalPolicy, PowerSample,
    SampleOrder,
};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status for an unknown job (sysexits `EX_USAGE`).
const EX_USAGE: u8 = 64;
/// Exit status for a job that has not finished (sysexits `EX_TEMPFAIL`).
const EX_TEMPFAIL: u8 = 75;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum CliNegativeIntervals {
    /// Add negative contributions as they are
    #[default]
    Accumulate,
    /// Treat negative intervals as zero
    Clamp,
    /// Fail on a negative interval
    Reject,
}

impl From<CliNegativeIntervals> for NegativeIntervalPolicy {
    fn from(policy: CliNegativeIntervals) -> Self {
        match policy {
            CliNegativeIntervals::Accumulate => NegativeIntervalPolicy::Accumulate,
            CliNegativeIntervals::Clamp => NegativeIntervalPolicy::Clamp,
            CliNegativeIntervals::Reject => NegativeIntervalPolicy::Reject,
        }
    }
}

#[derive(Parser)]
#[command(name = "energy-reporter")]
#[command(about = "Report the energy used by cluster nodes in a time window")]
#[command(version)]
struct Cli {
    /// Nodes to report (default: every node with samples)
    nodes: Vec<String>,

    /// Window start: ISO-8601, epoch seconds or "now"
    #[arg(long, required_unless_present = "job", conflicts_with = "job")]
    start: Option<String>,

    /// Window end: ISO-8601, epoch seconds or "now"
    #[arg(long, default_value = "now", conflicts_with = "job")]
    end: String,

    /// Take window and nodes from a finished Slurm job
    #[arg(long)]
    job: Option<String>,

    /// File with additional nodes, one per line
    #[arg(long)]
    nodes_file: Option<PathBuf>,

    /// Only print the energy totals
    #[arg(long)]
    energy_only: bool,

    /// InfluxDB URL
    #[arg(long, env = "INFLUX_URL")]
    url: String,

    /// InfluxDB API token
    #[arg(long, env = "INFLUX_TOKEN", hide_env_values = true)]
    token: String,

    /// InfluxDB organization
    #[arg(long, env = "INFLUX_ORG", default_value = "HLRS")]
    org: String,

    /// InfluxDB bucket
    #[arg(long, env = "INFLUX_BUCKET", default_value = "training")]
    bucket: String,

    /// Measurement holding the power samples
    #[arg(long, default_value = "ipmi_sensor")]
    measurement: String,

    /// Sensor name within the measurement
    #[arg(long, default_value = "ps2_input_power")]
    sensor: String,

    /// Integrate samples in the order they were received
    #[arg(long)]
    arrival_order: bool,

    /// Handling of samples that go back in time
    #[arg(long, default_value = "accumulate", value_enum)]
    negative_intervals: CliNegativeIntervals,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn integration_options(&self) -> IntegrationOptions {
        IntegrationOptions {
            order: if self.arrival_order {
                SampleOrder::Arrival
            } else {
                SampleOrder::Chronological
            },
            negative_intervals: self.negative_intervals.into(),
        }
    }

    fn influx_config(&self) -> InfluxConfig {
        InfluxConfig {
            url: self.url.clone(),
            token: self.token.clone(),
            org: self.org.clone(),
            bucket: self.bucket.clone(),
        }
    }
}

/// Resolves a job to its window, or to the exit status to stop with.
async fn resolve_job<S: JobScheduler>(
    scheduler: &S,
    job: &str,
) -> std::result::Result<JobWindow, u8> {
    match scheduler.lookup(job).await {
        Ok(Some(JobLookup::Window(window))) => Ok(window),
        Ok(Some(JobLookup::Incomplete)) => {
            eprintln!("Job {} has not finished yet", job);
            Err(EX_TEMPFAIL)
        }
        Ok(None) => {
            eprintln!("Could not load info for job with ID {}", job);
            Err(EX_USAGE)
        }
        Err(e) => {
            warn!("Job lookup failed: {:#}", e);
            eprintln!("Could not load info for job with ID {}", job);
            Err(EX_USAGE)
        }
    }
}

/// Integrates the requested hosts, or every host when none are requested.
///
/// Returns the hosts to report together with their results.
fn integrate_hosts(
    samples: Vec<PowerSample>,
    requested: Vec<String>,
    options: IntegrationOptions,
) -> Result<(Vec<String>, BTreeMap<String, HostEnergy>)> {
    debug!(
        "Integrating in {} order, {} negative intervals",
        options.order, options.negative_intervals
    );

    let mut integrator = EnergyIntegrator::new(options);
    if requested.is_empty() {
        integrator.extend(samples);
    } else {
        integrator.extend(samples.into_iter().filter(|s| requested.contains(&s.host)));
    }
    let results = integrator.finish()?;

    let hosts = if requested.is_empty() {
        results.keys().cloned().collect()
    } else {
        requested
    };
    Ok((hosts, results))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging; stdout carries the report
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut stdout = io::stdout().lock();

    let file_nodes = match &cli.nodes_file {
        Some(path) => nodes::load_node_file(path)?,
        None => Vec::new(),
    };

    let (start, end, requested) = match &cli.job {
        Some(job) => {
            let window = match resolve_job(&SlurmClient::default(), job).await {
                Ok(window) => window,
                Err(status) => return Ok(ExitCode::from(status)),
            };
            report::write_job_window(&mut stdout, &window)?;
            let requested = nodes::merge([
                window.nodes.as_slice(),
                cli.nodes.as_slice(),
                file_nodes.as_slice(),
            ]);
            (window.start, window.end, requested)
        }
        None => {
            // clap enforces --start without --job
            let start = cli.start.as_deref().unwrap_or("now");
            let start = timespec::parse_time(start).context("Invalid --start")?;
            let end = timespec::parse_time(&cli.end).context("Invalid --end")?;
            let requested = nodes::merge([cli.nodes.as_slice(), file_nodes.as_slice()]);
            (start, end, requested)
        }
    };

    info!("Reporting energy from {} to {}", start, end);

    let client = InfluxClient::new(&cli.influx_config())?;
    let query = SampleQuery {
        measurement: cli.measurement.clone(),
        sensor: cli.sensor.clone(),
        start,
        end,
    };
    let samples = client
        .fetch_samples(&query)
        .await
        .context("Failed to query power samples")?;
    debug!("Fetched {} samples", samples.len());

    let (hosts, results) = integrate_hosts(samples, requested, cli.integration_options())
        .context("Failed to integrate power samples")?;

    report::write_report(&mut stdout, &hosts, &results, cli.energy_only)?;

    Ok(ExitCode::SUCCESS)
}
