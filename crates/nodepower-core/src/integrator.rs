//! Power-to-energy integration.
//!
//! Samples of one host are integrated as a Riemann sum. The first interval is
//! deferred: it is only known once the second sample arrives, and it is added
//! with the power of the first sample when the host's samples are exhausted.
//! Every later sample contributes `power * (t - t_previous)`.
//!
//! The accumulator integrates in the order samples are pushed. With
//! [`SampleOrder::Chronological`] (the default) [`EnergyIntegrator`] sorts each
//! host's samples by timestamp first, which is the order the accumulator
//! expects.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// A power sample for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerSample {
    /// Seconds since the epoch.
    pub timestamp: i64,
    /// Power in watts.
    pub power_watts: i64,
    /// Host the sample belongs to.
    pub host: String,
}

impl PowerSample {
    /// Creates a new power sample.
    pub fn new(timestamp: i64, power_watts: i64, host: impl Into<String>) -> Self {
        Self {
            timestamp,
            power_watts,
            host: host.into(),
        }
    }
}

/// Order in which a host's samples are integrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleOrder {
    /// Stable sort by timestamp before integrating.
    #[default]
    Chronological,
    /// Integrate in the order samples were received.
    Arrival,
}

impl fmt::Display for SampleOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleOrder::Chronological => write!(f, "chronological"),
            SampleOrder::Arrival => write!(f, "arrival"),
        }
    }
}

/// What to do with an interval whose end lies before its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegativeIntervalPolicy {
    /// Add the negative contribution, lowering the total.
    #[default]
    Accumulate,
    /// Treat the interval as zero length.
    Clamp,
    /// Fail the integration with
    /// [`Error::NonMonotonicTimestamp`]. This aborts the whole
    /// [`EnergyIntegrator::finish`], so callers that only need some hosts
    /// should only push those hosts' samples.
    Reject,
}

impl fmt::Display for NegativeIntervalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegativeIntervalPolicy::Accumulate => write!(f, "accumulate"),
            NegativeIntervalPolicy::Clamp => write!(f, "clamp"),
            NegativeIntervalPolicy::Reject => write!(f, "reject"),
        }
    }
}

/// Integration settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntegrationOptions {
    pub order: SampleOrder,
    pub negative_intervals: NegativeIntervalPolicy,
}

/// Running energy total for one host.
#[derive(Debug, Clone)]
pub struct EnergyAccumulator {
    host: String,
    policy: NegativeIntervalPolicy,
    energy_joules: i64,
    first_seen: Option<(i64, i64)>,
    pending_boundary_time: Option<i64>,
    last_time: Option<i64>,
}

impl EnergyAccumulator {
    /// Creates an accumulator for `host`.
    pub fn new(host: impl Into<String>, policy: NegativeIntervalPolicy) -> Self {
        Self {
            host: host.into(),
            policy,
            energy_joules: 0,
            first_seen: None,
            pending_boundary_time: None,
            last_time: None,
        }
    }

    /// Adds one sample.
    pub fn push(&mut self, timestamp: i64, power_watts: i64) -> Result<()> {
        match (self.first_seen, self.pending_boundary_time, self.last_time) {
            (None, _, _) => {
                self.first_seen = Some((timestamp, power_watts));
            }
            (Some((first_time, _)), None, _) => {
                self.duration(first_time, timestamp)?;
                self.pending_boundary_time = Some(timestamp);
            }
            (Some(_), Some(_), Some(last_time)) => {
                let dt = self.duration(last_time, timestamp)?;
                self.energy_joules = self
                    .energy_joules
                    .saturating_add(power_watts.saturating_mul(dt));
            }
            // last_time is always set once a sample has been pushed
            (Some(_), Some(_), None) => {}
        }
        self.last_time = Some(timestamp);
        Ok(())
    }

    /// Adds the deferred first interval and returns the total in joules.
    pub fn finalize(mut self) -> Result<i64> {
        if let (Some((first_time, first_power)), Some(boundary)) =
            (self.first_seen, self.pending_boundary_time)
        {
            let dt = self.duration(first_time, boundary)?;
            self.energy_joules = self
                .energy_joules
                .saturating_add(first_power.saturating_mul(dt));
        }
        Ok(self.energy_joules)
    }

    fn duration(&self, from: i64, to: i64) -> Result<i64> {
        let dt = to.saturating_sub(from);
        if dt >= 0 {
            return Ok(dt);
        }
        match self.policy {
            NegativeIntervalPolicy::Accumulate => Ok(dt),
            NegativeIntervalPolicy::Clamp => Ok(0),
            NegativeIntervalPolicy::Reject => Err(Error::NonMonotonicTimestamp {
                host: self.host.clone(),
                previous: from,
                current: to,
            }),
        }
    }
}

/// Energy total of one host together with the samples it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnergy {
    pub host: String,
    /// Samples in integration order.
    pub samples: Vec<PowerSample>,
    pub energy_joules: i64,
}

impl HostEnergy {
    /// A host without samples.
    pub fn empty(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            samples: Vec::new(),
            energy_joules: 0,
        }
    }
}

/// Groups samples by host and integrates each host.
#[derive(Debug, Default)]
pub struct EnergyIntegrator {
    options: IntegrationOptions,
    hosts: BTreeMap<String, Vec<PowerSample>>,
}

impl EnergyIntegrator {
    /// Creates an integrator with the given options.
    pub fn new(options: IntegrationOptions) -> Self {
        Self {
            options,
            hosts: BTreeMap::new(),
        }
    }

    /// Adds one sample.
    pub fn push(&mut self, sample: PowerSample) {
        self.hosts
            .entry(sample.host.clone())
            .or_default()
            .push(sample);
    }

    /// Adds many samples.
    pub fn extend<I: IntoIterator<Item = PowerSample>>(&mut self, samples: I) {
        for sample in samples {
            self.push(sample);
        }
    }

    /// Integrates every host seen so far.
    pub fn finish(self) -> Result<BTreeMap<String, HostEnergy>> {
        let options = self.options;
        self.hosts
            .into_iter()
            .map(|(host, mut samples)| {
                if options.order == SampleOrder::Chronological {
                    samples.sort_by_key(|s| s.timestamp);
                }

                let mut acc = EnergyAccumulator::new(host.clone(), options.negative_intervals);
                for sample in &samples {
                    acc.push(sample.timestamp, sample.power_watts)?;
                }
                let energy_joules = acc.finalize()?;

                Ok((
                    host.clone(),
                    HostEnergy {
                        host,
                        samples,
                        energy_joules,
                    },
                ))
            })
            .collect()
    }
}

/// Integrates `samples` and returns the energy in joules per host.
pub fn integrate<I>(samples: I, options: IntegrationOptions) -> Result<BTreeMap<String, i64>>
where
    I: IntoIterator<Item = PowerSample>,
{
    let mut integrator = EnergyIntegrator::new(options);
    integrator.extend(samples);
    Ok(integrator
        .finish()?
        .into_iter()
        .map(|(host, energy)| (host, energy.energy_joules))
        .collect())
}
