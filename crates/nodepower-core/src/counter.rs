//! Energy counter differencing and counter state persistence.
//!
//! Hardware energy counters (RAPL domains) count microjoules and wrap at a
//! per-domain maximum. Average power over a poll interval is recovered from
//! two readings with modulo arithmetic, so a single wrap between readings
//! still yields the true forward delta.

use crate::{Error, Result, MICROJOULES_PER_JOULE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// One reading of a wrapping energy counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterReading {
    /// Current counter value in microjoules.
    pub energy_uj: u64,
    /// Value at which the counter wraps back to zero.
    pub max_energy_range_uj: u64,
}

impl CounterReading {
    /// Creates a new counter reading.
    pub fn new(energy_uj: u64, max_energy_range_uj: u64) -> Self {
        Self {
            energy_uj,
            max_energy_range_uj,
        }
    }
}

/// All counter readings taken at one instant, keyed by domain name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Wall-clock time of the readings in seconds since the epoch.
    pub timestamp: f64,
    /// Readings by domain name.
    #[serde(default)]
    pub values: BTreeMap<String, CounterReading>,
}

impl CounterSnapshot {
    /// Creates an empty snapshot taken at `timestamp`.
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            values: BTreeMap::new(),
        }
    }

    /// Adds or replaces the reading for a domain.
    pub fn insert(&mut self, domain: impl Into<String>, reading: CounterReading) {
        self.values.insert(domain.into(), reading);
    }

    /// Returns true if the snapshot holds no domains.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Computes average power in watts between two readings of the same domain.
///
/// Returns `0.0` when there is no previous reading, when `dt_secs` is not a
/// positive finite number, or when the wrap range is zero. The metric line
/// format has no representation for NaN, so undefined power becomes zero.
/// The wrap range of `current` is used even if it differs from `previous`.
pub fn derive_power(
    previous: Option<&CounterReading>,
    current: &CounterReading,
    dt_secs: f64,
) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    if !dt_secs.is_finite() || dt_secs <= 0.0 || current.max_energy_range_uj == 0 {
        return 0.0;
    }

    let range = i128::from(current.max_energy_range_uj);
    let raw_delta = i128::from(current.energy_uj) - i128::from(previous.energy_uj);
    let delta_uj = (raw_delta + range).rem_euclid(range);

    let watts = (delta_uj as f64 / dt_secs) / MICROJOULES_PER_JOULE;
    if watts.is_finite() {
        watts
    } else {
        0.0
    }
}

/// Derives power for every domain of `current`, in domain-name order.
///
/// Domains absent from `previous` (or all domains, when there is no previous
/// snapshot) report `0.0`.
pub fn derive_powers(
    previous: Option<&CounterSnapshot>,
    current: &CounterSnapshot,
) -> Vec<(String, f64)> {
    let dt = previous.map_or(f64::NAN, |p| current.timestamp - p.timestamp);

    current
        .values
        .iter()
        .map(|(domain, reading)| {
            let last = previous.and_then(|p| p.values.get(domain));
            (domain.clone(), derive_power(last, reading, dt))
        })
        .collect()
}

/// Storage for the counter snapshot carried between poll cycles.
pub trait CounterStore: Send {
    /// Loads the last saved snapshot, `None` if nothing has been saved yet.
    fn load(&mut self) -> Result<Option<CounterSnapshot>>;

    /// Replaces the saved snapshot.
    fn save(&mut self, snapshot: &CounterSnapshot) -> Result<()>;
}

/// In-memory counter store.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    snapshot: Option<CounterSnapshot>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn load(&mut self) -> Result<Option<CounterSnapshot>> {
        Ok(self.snapshot.clone())
    }

    fn save(&mut self, snapshot: &CounterSnapshot) -> Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }
}

/// Counter store backed by a JSON file.
///
/// The file is overwritten in place on every save. Only one process may use
/// a given file at a time; nothing here locks it.
#[derive(Debug, Clone)]
pub struct FileCounterStore {
    path: PathBuf,
}

impl FileCounterStore {
    /// Creates a store for the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CounterStore for FileCounterStore {
    fn load(&mut self) -> Result<Option<CounterSnapshot>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No counter state at {}", self.path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(Error::StateIo {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| Error::CorruptState {
                path: self.path.clone(),
                source,
            })
    }

    fn save(&mut self, snapshot: &CounterSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| Error::StateIo {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot)?;
        fs::write(&self.path, content).map_err(|source| Error::StateIo {
            path: self.path.clone(),
            source,
        })
    }
}
