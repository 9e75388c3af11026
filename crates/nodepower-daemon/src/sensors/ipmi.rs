//! Power supply input power via IPMI.

use super::{Readings, Result, Sensor, SensorError};
use tokio::process::Command;
use tracing::debug;

/// Number of power supplies every node reports.
const EXPECTED_SUPPLIES: usize = 2;

/// Reads the BMC sensor table with `ipmi-sensors`.
///
/// The command usually needs root, so the default configuration runs it
/// through sudo.
pub struct IpmiSensor {
    command: Vec<String>,
}

impl IpmiSensor {
    /// Creates a sensor running `command` (program followed by arguments).
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    async fn run(&self) -> Result<String> {
        let (program, args) = self.command.split_first().ok_or(SensorError::EmptyCommand)?;
        let command = self.command.join(" ");
        debug!("Running {}", command);

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| SensorError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SensorError::CommandFailed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Extracts the input power rows from `ipmi-sensors` output.
///
/// Table format: `ID | Name | Type | Reading | Units | Event`. Rows whose
/// lowercased text contains "input power" are kept; the field name is the
/// lowercased sensor name with spaces replaced by underscores. Anything other
/// than exactly two rows is an error.
pub fn parse_input_power(output: &str) -> Result<Vec<(String, f64)>> {
    let rows: Vec<String> = output
        .lines()
        .map(str::to_lowercase)
        .filter(|line| line.contains("input power"))
        .collect();

    if rows.len() != EXPECTED_SUPPLIES {
        return Err(SensorError::UnexpectedRowCount {
            expected: EXPECTED_SUPPLIES,
            found: rows.len(),
        });
    }

    rows.iter()
        .map(|row| {
            let columns: Vec<&str> = row.split('|').collect();
            if columns.len() < 4 {
                return Err(SensorError::MalformedRow(row.clone()));
            }
            let name = columns[1].trim().replace(' ', "_");
            let value: f64 = columns[3]
                .trim()
                .parse()
                .map_err(|_| SensorError::MalformedRow(row.clone()))?;
            Ok((name, value))
        })
        .collect()
}

impl Sensor for IpmiSensor {
    fn name(&self) -> &str {
        "ipmi_sensor"
    }

    async fn read(&mut self) -> Result<Readings> {
        let output = self.run().await?;
        parse_input_power(&output).map(Readings::Gauges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR_TABLE: &str = "\
ID  | Name            | Type                     | Reading    | Units | Event
4   | Inlet Temp      | Temperature              | 24.00      | C     | 'OK'
25  | PS1 Input Power | Power Supply             | 120.00     | W     | 'OK'
26  | PS2 Input Power | Power Supply             | 118.00     | W     | 'OK'
27  | PS1 Current 1   | Current                  | 0.60       | A     | 'OK'
";

    #[test]
    fn test_parse_two_supplies() {
        let rows = parse_input_power(SENSOR_TABLE).unwrap();
        assert_eq!(
            rows,
            vec![
                ("ps1_input_power".to_string(), 120.0),
                ("ps2_input_power".to_string(), 118.0)
            ]
        );
    }

    #[test]
    fn test_parse_requires_two_rows() {
        let one_row: String = SENSOR_TABLE
            .lines()
            .filter(|l| !l.contains("PS2"))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(matches!(
            parse_input_power(&one_row),
            Err(SensorError::UnexpectedRowCount {
                expected: 2,
                found: 1
            })
        ));
        assert!(matches!(
            parse_input_power(""),
            Err(SensorError::UnexpectedRowCount { found: 0, .. })
        ));
    }

    #[test]
    fn test_parse_unavailable_reading() {
        let table = "\
25  | PS1 Input Power | Power Supply | N/A    | W | 'OK'
26  | PS2 Input Power | Power Supply | 118.00 | W | 'OK'
";
        assert!(matches!(
            parse_input_power(table),
            Err(SensorError::MalformedRow(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let mut sensor = IpmiSensor::new(Vec::new());
        assert!(matches!(sensor.read().await, Err(SensorError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let mut sensor = IpmiSensor::new(vec!["/nonexistent/ipmi-sensors".to_string()]);
        assert!(matches!(sensor.read().await, Err(SensorError::Spawn { .. })));
    }
}
