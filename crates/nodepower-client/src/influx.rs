//! Power samples from the InfluxDB v2 query API.

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use nodepower_core::PowerSample;
use serde_json::json;
use std::future::Future;
use tracing::debug;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Connection settings for the InfluxDB server.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://influx.example.org:8086`.
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// Selects the samples of one power sensor in a time window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleQuery {
    pub measurement: String,
    /// Value of the `name` tag.
    pub sensor: String,
    /// Window start, epoch seconds.
    pub start: i64,
    /// Window end, epoch seconds.
    pub end: i64,
}

impl SampleQuery {
    /// Builds the Flux query for `bucket`.
    ///
    /// Timestamps are converted to integer nanoseconds in the result so they
    /// can be parsed without date handling.
    pub fn to_flux(&self, bucket: &str) -> String {
        format!(
            "from(bucket:\"{}\")\n  \
             |> range(start: {}, stop: {})\n  \
             |> filter(fn: (r) => r[\"_measurement\"] == \"{}\")\n  \
             |> filter(fn: (r) => r[\"name\"] == \"{}\")\n  \
             |> map(fn: (r) => ({{ r with _time: int(v: r._time)}}))",
            flux_escape(bucket),
            self.start,
            self.end,
            flux_escape(&self.measurement),
            flux_escape(&self.sensor),
        )
    }
}

fn flux_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Source of power samples.
pub trait SampleSource {
    /// Returns all samples matching `query`, in response order.
    fn fetch_samples(
        &self,
        query: &SampleQuery,
    ) -> impl Future<Output = Result<Vec<PowerSample>>> + Send;
}

/// InfluxDB v2 HTTP client.
pub struct InfluxClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxClient {
    /// Creates a client for the given server.
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint: format!("{}/api/v2/query", config.url.trim_end_matches('/')),
            token: config.token.clone(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
        })
    }
}

impl SampleSource for InfluxClient {
    async fn fetch_samples(&self, query: &SampleQuery) -> Result<Vec<PowerSample>> {
        let flux = query.to_flux(&self.bucket);
        debug!("Querying {}:\n{}", self.endpoint, flux);

        let body = json!({
            "query": flux,
            "type": "flux",
            "dialect": {
                "header": true,
                "annotations": [],
                "delimiter": ",",
            },
        });

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("org", self.org.as_str())])
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/csv")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to send query to {}", self.endpoint))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read query response")?;

        if !status.is_success() {
            bail!("Query failed with status {}: {}", status, text.trim());
        }

        let samples = parse_csv(&text)?;
        debug!("Received {} samples", samples.len());
        Ok(samples)
    }
}

/// Parses an annotation-free CSV query response into samples.
///
/// The response may contain several tables separated by blank lines, each
/// starting with its own header row. Rows are read from the `_time`,
/// `_value` and `host` columns; fractional power values are truncated.
pub fn parse_csv(body: &str) -> Result<Vec<PowerSample>> {
    let mut samples = Vec::new();
    let mut columns: Option<Columns> = None;

    for (index, line) in body.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            columns = None;
            continue;
        }

        let fields = split_row(line);
        let cols = match &columns {
            Some(cols) => cols,
            None => {
                columns = Some(Columns::from_header(&fields)?);
                continue;
            }
        };

        let row = index + 1;
        match cols {
            Columns::Error { message } => {
                let message = fields.get(*message).map(String::as_str).unwrap_or("");
                bail!("Query returned an error: {}", message);
            }
            Columns::Samples { time, value, host } => {
                let field = |i: usize| fields.get(i).map(String::as_str).unwrap_or("");
                let timestamp = parse_time(field(*time))
                    .with_context(|| format!("Invalid _time in row {}", row))?;
                let power: f64 = field(*value)
                    .parse()
                    .with_context(|| format!("Invalid _value in row {}", row))?;
                samples.push(PowerSample::new(timestamp, power.trunc() as i64, field(*host)));
            }
        }
    }

    Ok(samples)
}

enum Columns {
    Samples { time: usize, value: usize, host: usize },
    Error { message: usize },
}

impl Columns {
    fn from_header(header: &[String]) -> Result<Self> {
        let find = |name: &str| header.iter().position(|h| h == name);

        if let Some(message) = find("error") {
            return Ok(Columns::Error { message });
        }

        match (find("_time"), find("_value"), find("host")) {
            (Some(time), Some(value), Some(host)) => Ok(Columns::Samples { time, value, host }),
            _ => bail!(
                "Query result is missing _time, _value or host column: {}",
                header.join(",")
            ),
        }
    }
}

/// Parses `_time` as integer nanoseconds, or RFC 3339 when the query did
/// not convert it. Returns epoch seconds.
fn parse_time(s: &str) -> Result<i64> {
    if let Ok(nanos) = s.parse::<i64>() {
        return Ok(nanos / NANOS_PER_SECOND);
    }
    let time = DateTime::parse_from_rfc3339(s)?;
    Ok(time.timestamp())
}

/// Splits one CSV row, honoring double-quoted fields.
fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = "\
,result,table,_start,_stop,_time,_value,_field,_measurement,host,name\r
,_result,0,2024-05-01T00:00:00Z,2024-05-01T01:00:00Z,1714521600000000000,250.7,value,ipmi_sensor,n012001,ps2_input_power\r
,_result,0,2024-05-01T00:00:00Z,2024-05-01T01:00:00Z,1714521610000000000,260,value,ipmi_sensor,n012001,ps2_input_power\r
\r
,result,table,_start,_stop,_time,_value,_field,_measurement,host,name\r
,_result,1,2024-05-01T00:00:00Z,2024-05-01T01:00:00Z,1714521605000000000,300,value,ipmi_sensor,n012002,ps2_input_power\r
\r
";

    #[test]
    fn test_parse_csv_multiple_tables() {
        let samples = parse_csv(RESPONSE).unwrap();
        assert_eq!(
            samples,
            vec![
                PowerSample::new(1714521600, 250, "n012001"),
                PowerSample::new(1714521610, 260, "n012001"),
                PowerSample::new(1714521605, 300, "n012002"),
            ]
        );
    }

    #[test]
    fn test_parse_csv_empty() {
        assert!(parse_csv("").unwrap().is_empty());
        assert!(parse_csv("\r\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_csv_rfc3339_time() {
        let body = "_time,_value,host\n2024-05-01T00:00:10Z,99.9,n1\n";
        assert_eq!(
            parse_csv(body).unwrap(),
            vec![PowerSample::new(1714521610, 99, "n1")]
        );
    }

    #[test]
    fn test_parse_csv_quoted_fields() {
        let body = "_time,_value,host,note\n10000000000,5,\"n1\",\"a, \"\"b\"\"\"\n";
        assert_eq!(parse_csv(body).unwrap(), vec![PowerSample::new(10, 5, "n1")]);
    }

    #[test]
    fn test_parse_csv_errors() {
        let missing = "_time,_value\n1,2\n";
        assert!(parse_csv(missing).is_err());

        let bad_value = "_time,_value,host\n1000000000,hot,n1\n";
        let err = parse_csv(bad_value).unwrap_err();
        assert!(err.to_string().contains("row 2"));

        let server = "error,reference\ncompilation failed,897\n";
        let err = parse_csv(server).unwrap_err();
        assert!(err.to_string().contains("compilation failed"));
    }

    #[test]
    fn test_flux_query() {
        let query = SampleQuery {
            measurement: "ipmi_sensor".to_string(),
            sensor: "ps2_input_power".to_string(),
            start: 1714521600,
            end: 1714525200,
        };
        let flux = query.to_flux("training");
        assert!(flux.starts_with("from(bucket:\"training\")"));
        assert!(flux.contains("range(start: 1714521600, stop: 1714525200)"));
        assert!(flux.contains("r[\"_measurement\"] == \"ipmi_sensor\""));
        assert!(flux.contains("r[\"name\"] == \"ps2_input_power\""));
        assert!(flux.ends_with("({ r with _time: int(v: r._time)}))"));
    }

    #[test]
    fn test_flux_escape() {
        assert_eq!(flux_escape("a\"b"), "a\\\"b");
        assert_eq!(flux_escape("plain"), "plain");
    }

    #[test]
    fn test_client_endpoint() {
        let client = InfluxClient::new(&InfluxConfig {
            url: "http://localhost:8086/".to_string(),
            token: "secret".to_string(),
            org: "HLRS".to_string(),
            bucket: "training".to_string(),
        })
        .unwrap();
        assert_eq!(client.endpoint, "http://localhost:8086/api/v2/query");
    }
}
