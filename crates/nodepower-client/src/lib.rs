//! Client library for the collaborators of the energy reporter.
//!
//! - [`influx`]: power samples from the InfluxDB v2 query API.
//! - [`slurm`]: job time windows and node lists from the Slurm accounting tools.

pub mod influx;
pub mod slurm;

pub use influx::{InfluxClient, InfluxConfig, SampleQuery, SampleSource};
pub use slurm::{JobLookup, JobScheduler, JobWindow, SlurmClient};
