//! Outlet loads of a NETIO PowerPDU over its JSON API.

use super::{Readings, Result, Sensor, SensorError};
use crate::config::PduConfig;
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// PDU status document (`/netio.json`).
#[derive(Debug, Deserialize)]
struct NetioDocument {
    #[serde(rename = "Outputs")]
    outputs: Vec<NetioOutput>,
}

#[derive(Debug, Deserialize)]
struct NetioOutput {
    #[serde(rename = "ID")]
    id: u32,
    #[serde(rename = "Load")]
    load: f64,
}

/// PDU sensor.
///
/// Each outlet powers one node. The node name is derived from the polling
/// host's name by replacing its last character with the outlet ID, so
/// `windhpc00` reports outlet 3 as `windhpc03`.
pub struct PduSensor {
    /// Client and status URL; `None` when this host does not poll PDUs.
    endpoint: Option<(reqwest::Client, String)>,
    number: u8,
    hostname: String,
}

impl PduSensor {
    /// Creates a sensor for PDU `number` (1-based).
    ///
    /// Only hosts listed in `cfg.hosts` need an address for the PDU; on any
    /// other host the sensor reads nothing.
    pub fn from_config(cfg: &PduConfig, number: u8, hostname: &str) -> anyhow::Result<Self> {
        let endpoint = if cfg.hosts.iter().any(|h| h == hostname) {
            let address = cfg
                .address(number)
                .with_context(|| format!("No address configured for PDU {}", number))?;

            let mut builder = reqwest::Client::builder();
            if let Some(secs) = cfg.timeout_secs {
                builder = builder.timeout(Duration::from_secs(secs));
            }
            let http = builder.build().context("building HTTP client")?;
            Some((http, format!("http://{}/netio.json", address)))
        } else {
            None
        };

        Ok(Self {
            endpoint,
            number,
            hostname: hostname.to_string(),
        })
    }
}

async fn fetch(http: &reqwest::Client, url: &str) -> Result<String> {
    let response = http
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|source| SensorError::Http {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(SensorError::Status {
            url: url.to_string(),
            status,
        });
    }

    response.text().await.map_err(|source| SensorError::Http {
        url: url.to_string(),
        source,
    })
}

/// Derives the node name for an outlet from the polling host's name.
pub fn derive_host(base: &str, output_id: u32) -> String {
    let mut chars = base.chars();
    chars.next_back();
    format!("{}{}", chars.as_str(), output_id)
}

/// Parses a status document into per-node fields.
pub fn parse_outputs(
    document: &str,
    pdu_number: u8,
    hostname: &str,
) -> Result<Vec<(String, Vec<(String, f64)>)>> {
    let doc: NetioDocument = serde_json::from_str(document)?;
    let field = format!("pdu_{}_output_power", pdu_number);

    Ok(doc
        .outputs
        .into_iter()
        .map(|output| {
            (
                derive_host(hostname, output.id),
                vec![(field.clone(), output.load)],
            )
        })
        .collect())
}

impl Sensor for PduSensor {
    fn name(&self) -> &str {
        "pdu_sensor"
    }

    async fn read(&mut self) -> Result<Readings> {
        let Some((http, url)) = &self.endpoint else {
            debug!("{} does not poll PDUs", self.hostname);
            return Ok(Readings::HostGauges(Vec::new()));
        };

        let document = fetch(http, url).await?;
        parse_outputs(&document, self.number, &self.hostname).map(Readings::HostGauges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "Agent": {"Model": "4KS", "DeviceName": "pdu-a"},
        "Outputs": [
            {"ID": 1, "Name": "out1", "State": 1, "Load": 212, "Energy": 1000},
            {"ID": 2, "Name": "out2", "State": 1, "Load": 198.5, "Energy": 900},
            {"ID": 3, "Name": "out3", "State": 0, "Load": 0, "Energy": 0}
        ]
    }"#;

    fn pdu_config() -> PduConfig {
        PduConfig {
            hosts: vec!["windhpc00".to_string()],
            addresses: vec!["10.0.0.21".to_string(), "10.0.0.22".to_string()],
            timeout_secs: None,
        }
    }

    #[test]
    fn test_derive_host() {
        assert_eq!(derive_host("windhpc00", 3), "windhpc03");
        assert_eq!(derive_host("windhpc00", 12), "windhpc012");
        assert_eq!(derive_host("", 1), "1");
    }

    #[test]
    fn test_parse_outputs() {
        let hosts = parse_outputs(DOCUMENT, 2, "windhpc00").unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].0, "windhpc01");
        assert_eq!(
            hosts[1].1,
            vec![("pdu_2_output_power".to_string(), 198.5)]
        );
        assert_eq!(hosts[2].1[0].1, 0.0);
    }

    #[test]
    fn test_parse_invalid_document() {
        assert!(matches!(
            parse_outputs("{\"Agent\": {}}", 1, "windhpc00"),
            Err(SensorError::Document(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let sensor = PduSensor::from_config(&pdu_config(), 2, "windhpc00").unwrap();
        let (_, url) = sensor.endpoint.as_ref().unwrap();
        assert_eq!(url, "http://10.0.0.22/netio.json");
        assert_eq!(sensor.number, 2);

        let other = PduSensor::from_config(&pdu_config(), 1, "n012001").unwrap();
        assert!(other.endpoint.is_none());

        assert!(PduSensor::from_config(&pdu_config(), 3, "windhpc00").is_err());
    }

    #[tokio::test]
    async fn test_compute_node_needs_no_address() {
        for number in [1, 2] {
            let mut sensor =
                PduSensor::from_config(&PduConfig::default(), number, "n012001").unwrap();
            assert_eq!(sensor.read().await.unwrap(), Readings::HostGauges(Vec::new()));
        }

        // the polling host itself still needs one
        assert!(PduSensor::from_config(&PduConfig::default(), 1, "windhpc00").is_err());
    }

    #[tokio::test]
    async fn test_disabled_host_reads_nothing() {
        let mut sensor = PduSensor::from_config(&pdu_config(), 1, "n012001").unwrap();
        assert_eq!(sensor.read().await.unwrap(), Readings::HostGauges(Vec::new()));
    }
}
