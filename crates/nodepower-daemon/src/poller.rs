//! Fixed-cadence sensor polling.
//!
//! Each cycle reads the sensor, converts the readings to metric lines and
//! writes them out, then sleeps for whatever is left of the interval. The
//! interval is measured from the start of the cycle. A failed cycle writes
//! nothing and the loop carries on. Cancellation is only observed between
//! cycles.

use crate::sensors::{Readings, Sensor};
use anyhow::{Context, Result};
use nodepower_core::{derive_powers, CounterSnapshot, CounterStore, MetricLine};
use std::io::Write;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How often repeated failures are summarized.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Logs the first failure of a streak, then at most one summary per minute.
struct ErrorLog {
    in_streak: bool,
    suppressed: u32,
    last_error_log: Instant,
}

impl ErrorLog {
    fn new() -> Self {
        Self {
            in_streak: false,
            suppressed: 0,
            last_error_log: Instant::now(),
        }
    }

    /// Records a failure; returns whether it was logged.
    fn record(&mut self, sensor: &str, e: &anyhow::Error) -> bool {
        if !self.in_streak {
            error!("Error for sensor \"{}\": {:#}", sensor, e);
            self.in_streak = true;
            self.suppressed = 0;
            self.last_error_log = Instant::now();
            return true;
        }

        self.suppressed += 1;
        let elapsed = self.last_error_log.elapsed();
        if elapsed < ERROR_LOG_INTERVAL {
            return false;
        }

        error!(
            "Error for sensor \"{}\" (repeated {} times in {:?}): {:#}",
            sensor, self.suppressed, elapsed, e
        );
        self.suppressed = 0;
        self.last_error_log = Instant::now();
        true
    }

    fn reset(&mut self) {
        self.in_streak = false;
        self.suppressed = 0;
    }
}

/// Drives one sensor at a fixed interval.
pub struct Poller<S, W> {
    sensor: S,
    store: Box<dyn CounterStore>,
    hostname: String,
    interval: Duration,
    out: W,
}

impl<S: Sensor, W: Write> Poller<S, W> {
    /// Creates a poller writing metric lines to `out`.
    pub fn new(
        sensor: S,
        store: Box<dyn CounterStore>,
        hostname: &str,
        interval: Duration,
        out: W,
    ) -> Self {
        Self {
            sensor,
            store,
            hostname: hostname.to_string(),
            interval,
            out,
        }
    }

    /// Polls until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut errors = ErrorLog::new();

        while !shutdown.is_cancelled() {
            let start = Instant::now();

            match self.poll_once().await {
                Ok(count) => {
                    debug!("Wrote {} metric lines", count);
                    errors.reset();
                }
                Err(e) => {
                    errors.record(self.sensor.name(), &e);
                }
            }

            let remaining = self.interval.saturating_sub(start.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    /// Runs one cycle and returns the number of lines written.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let readings = self
            .sensor
            .read()
            .await
            .context("reading sensor")?;

        let (lines, pending) = self.to_lines(readings);
        let count = self.emit(&lines)?;

        if let Some(snapshot) = pending {
            if let Err(e) = self.store.save(&snapshot) {
                warn!("Failed to save counter state: {}", e);
            }
        }
        Ok(count)
    }

    /// Converts readings to metric lines.
    ///
    /// Counter readings also return the snapshot to persist once the line has
    /// been written.
    fn to_lines(&mut self, readings: Readings) -> (Vec<MetricLine>, Option<CounterSnapshot>) {
        let measurement = self.sensor.name().to_string();

        match readings {
            Readings::Gauges(fields) => {
                let line = fields.into_iter().fold(
                    MetricLine::new(measurement).tag("host", self.hostname.as_str()),
                    |line, (key, value)| line.field(key, value),
                );
                (vec![line], None)
            }
            Readings::Counters { prefix, snapshot } => {
                let previous = match self.store.load() {
                    Ok(previous) => previous,
                    Err(e) => {
                        warn!("Ignoring previous counter state: {}", e);
                        None
                    }
                };

                let mut line = MetricLine::new(measurement).tag("host", self.hostname.as_str());
                for (domain, watts) in derive_powers(previous.as_ref(), &snapshot) {
                    line.push_field(format!("{}_{}_derived_power", prefix, domain), watts);
                }
                (vec![line], Some(snapshot))
            }
            Readings::HostGauges(hosts) => {
                let lines = hosts
                    .into_iter()
                    .map(|(host, fields)| {
                        fields.into_iter().fold(
                            MetricLine::new(measurement.as_str()).tag("host", host),
                            |line, (key, value)| line.field(key, value),
                        )
                    })
                    .collect();
                (lines, None)
            }
        }
    }

    fn emit(&mut self, lines: &[MetricLine]) -> Result<usize> {
        let mut count = 0;
        for line in lines {
            if line.is_empty() {
                debug!("Skipping {} line without fields", line.measurement());
                continue;
            }
            writeln!(self.out, "{}", line).context("writing metric line")?;
            self.out.flush().context("flushing metric line")?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{Result as SensorResult, SensorError};
    use nodepower_core::{CounterReading, FileCounterStore, MemoryCounterStore};
    use std::collections::VecDeque;

    /// Sensor replaying scripted reads; cancels `done` once the script runs out.
    struct ScriptedSensor {
        name: &'static str,
        script: VecDeque<SensorResult<Readings>>,
        done: CancellationToken,
        reads: usize,
        /// Time each read takes.
        delay: Duration,
        started: Vec<Instant>,
    }

    impl ScriptedSensor {
        fn new(name: &'static str, script: Vec<SensorResult<Readings>>) -> Self {
            Self {
                name,
                script: script.into(),
                done: CancellationToken::new(),
                reads: 0,
                delay: Duration::ZERO,
                started: Vec::new(),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl Sensor for ScriptedSensor {
        fn name(&self) -> &str {
            self.name
        }

        async fn read(&mut self) -> SensorResult<Readings> {
            self.reads += 1;
            self.started.push(Instant::now());
            let next = self
                .script
                .pop_front()
                .unwrap_or(Ok(Readings::Gauges(Vec::new())));
            if self.script.is_empty() {
                self.done.cancel();
            }
            tokio::time::sleep(self.delay).await;
            next
        }
    }

    fn counters(timestamp: f64, energy_uj: u64) -> Readings {
        let mut snapshot = CounterSnapshot::new(timestamp);
        snapshot.insert("package-0", CounterReading::new(energy_uj, 1_000_000_000));
        Readings::Counters {
            prefix: "rapl",
            snapshot,
        }
    }

    fn output(poller: Poller<ScriptedSensor, Vec<u8>>) -> String {
        String::from_utf8(poller.out).unwrap()
    }

    #[tokio::test]
    async fn test_gauges_line() {
        let sensor = ScriptedSensor::new(
            "ipmi_sensor",
            vec![Ok(Readings::Gauges(vec![
                ("ps1_input_power".to_string(), 120.0),
                ("ps2_input_power".to_string(), 118.0),
            ]))],
        );
        let mut poller = Poller::new(
            sensor,
            Box::new(MemoryCounterStore::new()),
            "n012001",
            Duration::from_secs(1),
            Vec::new(),
        );

        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert_eq!(
            output(poller),
            "ipmi_sensor,host=n012001 ps1_input_power=120,ps2_input_power=118\n"
        );
    }

    #[tokio::test]
    async fn test_counter_lines() {
        let sensor = ScriptedSensor::new(
            "rapl_counter",
            vec![
                Ok(counters(1000.0, 999_000_000)),
                // wraps: 999_000_000 -> 19_000_000 is 20 J over 2 s
                Ok(counters(1002.0, 19_000_000)),
            ],
        );
        let mut poller = Poller::new(
            sensor,
            Box::new(MemoryCounterStore::new()),
            "n012001",
            Duration::from_secs(1),
            Vec::new(),
        );

        poller.poll_once().await.unwrap();
        poller.poll_once().await.unwrap();
        assert_eq!(
            output(poller),
            "rapl_counter,host=n012001 rapl_package-0_derived_power=0\n\
             rapl_counter,host=n012001 rapl_package-0_derived_power=10\n"
        );
    }

    #[tokio::test]
    async fn test_counter_state_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rapl_values.json");
        std::fs::write(&path, "not json").unwrap();

        let sensor = ScriptedSensor::new("rapl_counter", vec![Ok(counters(1000.0, 5))]);
        let mut poller = Poller::new(
            sensor,
            Box::new(FileCounterStore::new(&path)),
            "n012001",
            Duration::from_secs(1),
            Vec::new(),
        );

        // corrupt state counts as no previous reading
        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert!(output(poller).ends_with("rapl_package-0_derived_power=0\n"));

        let saved = FileCounterStore::new(&path).load().unwrap().unwrap();
        assert_eq!(saved.timestamp, 1000.0);
        assert_eq!(saved.values["package-0"].energy_uj, 5);
    }

    #[tokio::test]
    async fn test_host_gauges_lines() {
        let sensor = ScriptedSensor::new(
            "pdu_sensor",
            vec![Ok(Readings::HostGauges(vec![
                (
                    "windhpc01".to_string(),
                    vec![("pdu_1_output_power".to_string(), 212.0)],
                ),
                (
                    "windhpc02".to_string(),
                    vec![("pdu_1_output_power".to_string(), 198.5)],
                ),
            ]))],
        );
        let mut poller = Poller::new(
            sensor,
            Box::new(MemoryCounterStore::new()),
            "windhpc00",
            Duration::from_secs(1),
            Vec::new(),
        );

        assert_eq!(poller.poll_once().await.unwrap(), 2);
        assert_eq!(
            output(poller),
            "pdu_sensor,host=windhpc01 pdu_1_output_power=212\n\
             pdu_sensor,host=windhpc02 pdu_1_output_power=198.5\n"
        );
    }

    #[tokio::test]
    async fn test_empty_readings_write_nothing() {
        let sensor = ScriptedSensor::new("pdu_sensor", vec![Ok(Readings::HostGauges(Vec::new()))]);
        let mut poller = Poller::new(
            sensor,
            Box::new(MemoryCounterStore::new()),
            "n012001",
            Duration::from_secs(1),
            Vec::new(),
        );
        assert_eq!(poller.poll_once().await.unwrap(), 0);
        assert!(output(poller).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_failed_cycles() {
        let sensor = ScriptedSensor::new(
            "ipmi_sensor",
            vec![
                Err(SensorError::UnexpectedRowCount {
                    expected: 2,
                    found: 1,
                }),
                Err(SensorError::EmptyCommand),
                Ok(Readings::Gauges(vec![("ps1_input_power".to_string(), 100.0)])),
            ],
        );
        let shutdown = sensor.done.clone();
        let mut poller = Poller::new(
            sensor,
            Box::new(MemoryCounterStore::new()),
            "n012001",
            Duration::from_secs(5),
            Vec::new(),
        );

        let start = Instant::now();
        poller.run(shutdown).await;

        // two full intervals slept, cancelled right after the third cycle
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(poller.sensor.reads, 3);
        assert_eq!(
            output(poller),
            "ipmi_sensor,host=n012001 ps1_input_power=100\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_cancelled_before_start() {
        let sensor = ScriptedSensor::new("ipmi_sensor", Vec::new());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut poller = Poller::new(
            sensor,
            Box::new(MemoryCounterStore::new()),
            "n012001",
            Duration::from_secs(5),
            Vec::new(),
        );

        poller.run(shutdown).await;
        assert_eq!(poller.sensor.reads, 0);
    }

    fn gauges(value: f64) -> SensorResult<Readings> {
        Ok(Readings::Gauges(vec![("ps1_input_power".to_string(), value)]))
    }

    fn offsets(sensor: &ScriptedSensor, origin: Instant) -> Vec<Duration> {
        sensor.started.iter().map(|t| *t - origin).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_time_is_absorbed_into_interval() {
        let sensor = ScriptedSensor::new(
            "ipmi_sensor",
            vec![gauges(1.0), gauges(2.0), gauges(3.0)],
        )
        .with_delay(Duration::from_secs(2));
        let shutdown = sensor.done.clone();
        let mut poller = Poller::new(
            sensor,
            Box::new(MemoryCounterStore::new()),
            "n012001",
            Duration::from_secs(5),
            Vec::new(),
        );

        let origin = Instant::now();
        poller.run(shutdown).await;

        assert_eq!(
            offsets(&poller.sensor, origin),
            vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(10)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_read_starts_next_cycle_immediately() {
        let sensor = ScriptedSensor::new(
            "ipmi_sensor",
            vec![gauges(1.0), gauges(2.0), gauges(3.0)],
        )
        .with_delay(Duration::from_secs(7));
        let shutdown = sensor.done.clone();
        let mut poller = Poller::new(
            sensor,
            Box::new(MemoryCounterStore::new()),
            "n012001",
            Duration::from_secs(5),
            Vec::new(),
        );

        let origin = Instant::now();
        poller.run(shutdown).await;

        assert_eq!(
            offsets(&poller.sensor, origin),
            vec![
                Duration::ZERO,
                Duration::from_secs(7),
                Duration::from_secs(14)
            ]
        );
        assert_eq!(origin.elapsed(), Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_log_suppresses_repeats() {
        let mut errors = ErrorLog::new();
        let e = anyhow::anyhow!("ipmi-sensors exited with 1");

        let logged = (0..10).filter(|_| errors.record("ipmi_sensor", &e)).count();
        assert_eq!(logged, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!errors.record("ipmi_sensor", &e));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(errors.record("ipmi_sensor", &e));
        assert!(!errors.record("ipmi_sensor", &e));

        errors.reset();
        assert!(errors.record("ipmi_sensor", &e));
        assert!(!errors.record("ipmi_sensor", &e));
    }
}
