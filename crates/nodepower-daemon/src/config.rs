//! Configuration management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Arguments appended to the IPMI command when `ipmi.extra_args` is set.
pub const IPMI_EXTRA_ARGS: [&str; 3] = ["-t", "Other_Units_Based_Sensor", "--quiet-cache"];

/// Name of the counter state file placed next to the executable.
const STATE_FILE_NAME: &str = "rapl_values.json";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Counter state file (default: next to the executable)
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Host name reported in metric lines (default: short system host name)
    #[serde(default)]
    pub hostname: Option<String>,

    /// IPMI configuration
    #[serde(default)]
    pub ipmi: IpmiConfig,

    /// RAPL configuration
    #[serde(default)]
    pub rapl: RaplConfig,

    /// PDU configuration
    #[serde(default)]
    pub pdu: PduConfig,
}

/// IPMI sensor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpmiConfig {
    /// Command and arguments that print the sensor table
    #[serde(default = "default_ipmi_command")]
    pub command: Vec<String>,

    /// Restrict the query to unit-based sensors and use the SDR cache quietly
    #[serde(default)]
    pub extra_args: bool,
}

impl Default for IpmiConfig {
    fn default() -> Self {
        Self {
            command: default_ipmi_command(),
            extra_args: false,
        }
    }
}

impl IpmiConfig {
    /// Returns the full command line to run.
    pub fn command_line(&self) -> Vec<String> {
        let mut command = self.command.clone();
        if self.extra_args {
            command.extend(IPMI_EXTRA_ARGS.iter().map(|s| s.to_string()));
        }
        command
    }
}

/// RAPL powercap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaplConfig {
    /// Domain path prefix; domains are `<base_path>:<n>` and `<base_path>:<n>:0`
    #[serde(default = "default_rapl_base_path")]
    pub base_path: PathBuf,
}

impl Default for RaplConfig {
    fn default() -> Self {
        Self {
            base_path: default_rapl_base_path(),
        }
    }
}

/// Power distribution unit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PduConfig {
    /// Hosts that poll the PDUs on behalf of the nodes behind them
    #[serde(default = "default_pdu_hosts")]
    pub hosts: Vec<String>,

    /// PDU addresses; PDU number 1 is the first entry
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Request timeout in seconds (default: none)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for PduConfig {
    fn default() -> Self {
        Self {
            hosts: default_pdu_hosts(),
            addresses: Vec::new(),
            timeout_secs: None,
        }
    }
}

impl PduConfig {
    /// Returns the address of PDU `number` (1-based).
    pub fn address(&self, number: u8) -> Option<&str> {
        let index = usize::from(number).checked_sub(1)?;
        self.addresses.get(index).map(String::as_str)
    }
}

// Default value functions
fn default_ipmi_command() -> Vec<String> {
    vec![
        "/usr/bin/sudo".to_string(),
        "/usr/sbin/ipmi-sensors".to_string(),
    ]
}

fn default_rapl_base_path() -> PathBuf {
    PathBuf::from("/sys/class/powercap/intel-rapl")
}

fn default_pdu_hosts() -> Vec<String> {
    vec!["windhpc00".to_string()]
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read configuration file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse configuration")?;
        Ok(config)
    }

    /// Returns the counter state file path.
    pub fn state_file_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.state_file {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe().context("Failed to locate executable")?;
        let dir = exe.parent().unwrap_or_else(|| Path::new("."));
        Ok(dir.join(STATE_FILE_NAME))
    }
}
