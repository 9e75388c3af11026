//! RAPL energy counters from the powercap sysfs tree.
//!
//! Layout: `<base>:<n>` is package domain `n` and `<base>:<n>:0` its first
//! sub-domain (DRAM on server parts). Each domain directory holds `name`,
//! `energy_uj` and `max_energy_range_uj`. See
//! https://www.kernel.org/doc/Documentation/power/powercap/powercap.txt

use super::{Readings, Result, Sensor, SensorError};
use nodepower_core::{CounterReading, CounterSnapshot};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Field name prefix for derived RAPL power.
const FIELD_PREFIX: &str = "rapl";

/// RAPL counter sensor.
pub struct RaplSensor {
    base: PathBuf,
}

impl RaplSensor {
    /// Creates a sensor for the domains below `base`.
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    fn domain_path(&self, suffix: &str) -> PathBuf {
        let mut path = OsString::from(self.base.as_os_str());
        path.push(suffix);
        PathBuf::from(path)
    }

    /// Reads every domain, stopping at the first missing package index.
    ///
    /// Sub-domains are keyed `<package>_<sub>`; a package without a
    /// sub-domain directory contributes only itself.
    pub fn read_snapshot(&self, timestamp: f64) -> Result<CounterSnapshot> {
        let mut snapshot = CounterSnapshot::new(timestamp);

        for index in 0.. {
            let package = self.domain_path(&format!(":{}", index));
            if !package.is_dir() {
                break;
            }
            let (name, reading) = read_domain(&package)?;

            let sub = self.domain_path(&format!(":{}:0", index));
            if sub.is_dir() {
                let (sub_name, sub_reading) = read_domain(&sub)?;
                snapshot.insert(format!("{}_{}", name, sub_name), sub_reading);
            }
            snapshot.insert(name, reading);
        }

        Ok(snapshot)
    }
}

fn read_string(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| SensorError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn read_u64(path: &Path) -> Result<u64> {
    let value = read_string(path)?;
    value.parse().map_err(|_| SensorError::InvalidValue {
        path: path.to_path_buf(),
        value,
    })
}

fn read_domain(dir: &Path) -> Result<(String, CounterReading)> {
    let name = read_string(&dir.join("name"))?;
    let energy_uj = read_u64(&dir.join("energy_uj"))?;
    let max_energy_range_uj = read_u64(&dir.join("max_energy_range_uj"))?;
    Ok((name, CounterReading::new(energy_uj, max_energy_range_uj)))
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

impl Sensor for RaplSensor {
    fn name(&self) -> &str {
        "rapl_counter"
    }

    async fn read(&mut self) -> Result<Readings> {
        let snapshot = self.read_snapshot(now_secs())?;
        Ok(Readings::Counters {
            prefix: FIELD_PREFIX,
            snapshot,
        })
    }
}
