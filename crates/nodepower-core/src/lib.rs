//! Node Power Core Library
//!
//! Numeric and temporal building blocks shared by the node power tools:
//! energy counter differencing, power-to-energy integration and the
//! metric line format consumed by the metrics agent.

pub mod counter;
pub mod error;
pub mod integrator;
pub mod metric;

pub use counter::{
    derive_power, derive_powers, CounterReading, CounterSnapshot, CounterStore,
    FileCounterStore, MemoryCounterStore,
};
pub use error::{Error, Result};
pub use integrator::{
    integrate, EnergyAccumulator, EnergyIntegrator, HostEnergy, IntegrationOptions,
    NegativeIntervalPolicy, PowerSample, SampleOrder,
};
pub use metric::MetricLine;

/// Microjoules per joule.
pub const MICROJOULES_PER_JOULE: f64 = 1_000_000.0;
