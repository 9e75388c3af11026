//! Power sensors module.
//!
//! Provides the sources polled by the daemon: the BMC power supply readings
//! via IPMI, RAPL energy counters from powercap, and the outlet loads of
//! networked PDUs.

mod ipmi;
mod pdu;
mod rapl;
pub mod system;

pub use ipmi::IpmiSensor;
pub use pdu::PduSensor;
pub use rapl::RaplSensor;

use crate::config::Config;
use nodepower_core::CounterSnapshot;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for sensor reads.
pub type Result<T> = std::result::Result<T, SensorError>;

/// Errors raised by a single sensor read.
#[derive(Error, Debug)]
pub enum SensorError {
    /// No command configured.
    #[error("sensor command is empty")]
    EmptyCommand,

    /// The command could not be started.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command exited unsuccessfully.
    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// The sensor table did not contain the expected power rows.
    #[error("expected {expected} input power rows, found {found}")]
    UnexpectedRowCount { expected: usize, found: usize },

    /// A power row could not be parsed.
    #[error("malformed sensor row: {0:?}")]
    MalformedRow(String),

    /// A counter file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A counter file did not hold a number.
    #[error("invalid value in {path}: {value:?}")]
    InvalidValue { path: PathBuf, value: String },

    /// HTTP request failed.
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request returned an error status.
    #[error("unexpected status {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// PDU status document could not be decoded.
    #[error("invalid PDU document: {0}")]
    Document(#[from] serde_json::Error),
}

/// Sensor kinds selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SensorKind {
    /// Power supply input power via ipmi-sensors
    #[value(name = "ipmi_sensor")]
    Ipmi,
    /// Outlet loads of a networked PDU
    #[value(name = "pdu_sensor")]
    Pdu,
    /// RAPL energy counters converted to power
    #[value(name = "rapl_counter")]
    Rapl,
}

impl SensorKind {
    /// Returns the measurement name used in metric lines.
    pub fn measurement(&self) -> &'static str {
        match self {
            SensorKind::Ipmi => "ipmi_sensor",
            SensorKind::Pdu => "pdu_sensor",
            SensorKind::Rapl => "rapl_counter",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.measurement())
    }
}

/// Values produced by one sensor read.
#[derive(Debug, Clone, PartialEq)]
pub enum Readings {
    /// Fields for the local host.
    Gauges(Vec<(String, f64)>),
    /// Raw energy counters; fields are named `<prefix>_<domain>_derived_power`.
    Counters {
        prefix: &'static str,
        snapshot: CounterSnapshot,
    },
    /// Fields for other hosts, one metric line each.
    HostGauges(Vec<(String, Vec<(String, f64)>)>),
}

/// Trait for all sensors.
pub trait Sensor: Send {
    /// Returns the measurement name.
    fn name(&self) -> &str;

    /// Reads the current values.
    fn read(&mut self) -> impl Future<Output = Result<Readings>> + Send;
}

/// The sensor selected for this daemon instance.
pub enum SensorSource {
    Ipmi(IpmiSensor),
    Rapl(RaplSensor),
    Pdu(PduSensor),
}

impl SensorSource {
    /// Builds the sensor for `kind`.
    ///
    /// `pdu_number` is required for [`SensorKind::Pdu`].
    pub fn new(
        kind: SensorKind,
        pdu_number: Option<u8>,
        hostname: &str,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let source = match kind {
            SensorKind::Ipmi => SensorSource::Ipmi(IpmiSensor::new(config.ipmi.command_line())),
            SensorKind::Rapl => SensorSource::Rapl(RaplSensor::new(&config.rapl.base_path)),
            SensorKind::Pdu => {
                let number = pdu_number.ok_or_else(|| anyhow::anyhow!("PDU number is required"))?;
                SensorSource::Pdu(PduSensor::from_config(&config.pdu, number, hostname)?)
            }
        };
        Ok(source)
    }
}

impl Sensor for SensorSource {
    fn name(&self) -> &str {
        match self {
            SensorSource::Ipmi(s) => s.name(),
            SensorSource::Rapl(s) => s.name(),
            SensorSource::Pdu(s) => s.name(),
        }
    }

    async fn read(&mut self) -> Result<Readings> {
        match self {
            SensorSource::Ipmi(s) => s.read().await,
            SensorSource::Rapl(s) => s.read().await,
            SensorSource::Pdu(s) => s.read().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn test_kind_names() {
        assert_eq!(
            SensorKind::from_str("ipmi_sensor", false).unwrap(),
            SensorKind::Ipmi
        );
        assert_eq!(
            SensorKind::from_str("pdu_sensor", false).unwrap(),
            SensorKind::Pdu
        );
        assert_eq!(
            SensorKind::from_str("rapl_counter", false).unwrap(),
            SensorKind::Rapl
        );
        assert!(SensorKind::from_str("gpu_sensor", false).is_err());
        assert_eq!(SensorKind::Rapl.to_string(), "rapl_counter");
    }

    #[test]
    fn test_source_selection() {
        let config = Config::default();
        let ipmi = SensorSource::new(SensorKind::Ipmi, None, "n012001", &config).unwrap();
        assert_eq!(ipmi.name(), "ipmi_sensor");
        let rapl = SensorSource::new(SensorKind::Rapl, None, "n012001", &config).unwrap();
        assert_eq!(rapl.name(), "rapl_counter");
        assert!(SensorSource::new(SensorKind::Pdu, None, "windhpc00", &config).is_err());
        let pdu = SensorSource::new(SensorKind::Pdu, Some(2), "n012001", &config).unwrap();
        assert_eq!(pdu.name(), "pdu_sensor");
    }
}
