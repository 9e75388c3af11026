//! Job time windows and node lists from Slurm accounting.

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDateTime, TimeZone};
use std::future::Future;
use tokio::process::Command;
use tracing::{debug, warn};

const SLURM_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Time window and nodes of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWindow {
    /// Start time, epoch seconds.
    pub start: i64,
    /// End time, epoch seconds.
    pub end: i64,
    pub nodes: Vec<String>,
}

/// Outcome of a job lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLookup {
    /// The job has a start time, an end time and at least one node.
    Window(JobWindow),
    /// The job exists but has not started or not finished yet.
    Incomplete,
}

/// One `sacct` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Compressed node list, e.g. `n[012001-012004]`.
    pub node_list: String,
}

/// Source of job information.
pub trait JobScheduler {
    /// Looks up `job_id`. Returns `Ok(None)` for an unknown job.
    fn lookup(&self, job_id: &str) -> impl Future<Output = Result<Option<JobLookup>>> + Send;
}

/// Job lookup through the Slurm command line tools.
#[derive(Debug, Clone)]
pub struct SlurmClient {
    sacct: String,
    scontrol: String,
}

impl Default for SlurmClient {
    fn default() -> Self {
        Self {
            sacct: "sacct".to_string(),
            scontrol: "scontrol".to_string(),
        }
    }
}

impl SlurmClient {
    /// Uses the given `sacct` and `scontrol` executables.
    pub fn with_commands(sacct: impl Into<String>, scontrol: impl Into<String>) -> Self {
        Self {
            sacct: sacct.into(),
            scontrol: scontrol.into(),
        }
    }

    async fn accounting(&self, job_id: &str) -> Result<String> {
        let output = Command::new(&self.sacct)
            .args([
                "-j",
                job_id,
                "--format=JobIDRaw,Start,End,NodeList",
                "--parsable2",
                "--noheader",
            ])
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.sacct))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.sacct,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Expands a compressed node list. Failures yield an empty list.
    async fn expand_nodes(&self, node_list: &str) -> Vec<String> {
        let output = Command::new(&self.scontrol)
            .args(["show", "hostnames", node_list])
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                parse_hostnames(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                warn!(
                    "{} could not expand {:?}: {}",
                    self.scontrol,
                    node_list,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to run {}: {}", self.scontrol, e);
                Vec::new()
            }
        }
    }
}

impl JobScheduler for SlurmClient {
    async fn lookup(&self, job_id: &str) -> Result<Option<JobLookup>> {
        let accounting = self.accounting(job_id).await?;
        let Some(record) = find_job(&accounting, job_id)? else {
            return Ok(None);
        };
        debug!("Job {}: {:?}", job_id, record);

        let nodes = if record.node_list.is_empty() || record.node_list == "None assigned" {
            Vec::new()
        } else {
            self.expand_nodes(&record.node_list).await
        };

        Ok(Some(window(&record, nodes)))
    }
}

/// Combines a record with its expanded nodes.
pub fn window(record: &JobRecord, nodes: Vec<String>) -> JobLookup {
    match (record.start, record.end) {
        (Some(start), Some(end)) if !nodes.is_empty() => {
            JobLookup::Window(JobWindow { start, end, nodes })
        }
        _ => JobLookup::Incomplete,
    }
}

/// Finds the row of `job_id` in `sacct --parsable2` output.
///
/// Job steps (`1234.batch`, `1234.0`) are skipped.
pub fn find_job(output: &str, job_id: &str) -> Result<Option<JobRecord>> {
    for line in output.lines() {
        let mut columns = line.trim_end().split('|');
        if columns.next() != Some(job_id) {
            continue;
        }

        let start = columns.next().unwrap_or("");
        let end = columns.next().unwrap_or("");
        let node_list = columns.next().unwrap_or("").trim().to_string();

        return Ok(Some(JobRecord {
            start: parse_slurm_time(start)?,
            end: parse_slurm_time(end)?,
            node_list,
        }));
    }
    Ok(None)
}

/// Converts a local Slurm timestamp to epoch seconds.
///
/// `Unknown`, `N/A`, `None` and empty values mean the time is not set.
pub fn parse_slurm_time(value: &str) -> Result<Option<i64>> {
    let value = value.trim();
    if matches!(value, "" | "Unknown" | "N/A" | "None") {
        return Ok(None);
    }

    let naive = NaiveDateTime::parse_from_str(value, SLURM_TIME_FORMAT)
        .with_context(|| format!("Invalid Slurm time: {}", value))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .with_context(|| format!("Slurm time does not exist locally: {}", value))?;
    Ok(Some(local.timestamp()))
}

fn parse_hostnames(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}
