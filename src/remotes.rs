//! Destination configuration: the remotes.json file and the CLI fallback.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scion::addr::ScionAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScionDestination {
    /// `ISD-AS,host` form.
    pub address: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub scion_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpDestination {
    pub address: String,
    #[serde(default)]
    pub name: String,
}

/// The remotes.json schema. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Remotes {
    #[serde(default)]
    pub scion_destinations: Vec<ScionDestination>,
    #[serde(default)]
    pub ip_destinations: Vec<IpDestination>,
}

impl Remotes {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open remotes file {}", path.display()))?;
        let remotes = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse remotes file {}", path.display()))?;
        Ok(remotes)
    }

    /// Destinations given on the command line as one space-separated
    /// argument of SCION addresses. Used when no remotes file is present.
    pub fn from_cli_list(list: &str) -> Self {
        Self {
            scion_destinations: list
                .split_whitespace()
                .map(|address| ScionDestination {
                    address: address.to_string(),
                    ip_address: String::new(),
                    name: String::new(),
                    scion_version: String::new(),
                })
                .collect(),
            ip_destinations: Vec::new(),
        }
    }

    /// Parse the SCION destinations; any malformed address is fatal.
    pub fn parse_scion(&self) -> Result<Vec<(ScionAddr, Option<String>)>> {
        self.scion_destinations
            .iter()
            .map(|d| {
                let addr: ScionAddr = d
                    .address
                    .parse()
                    .with_context(|| format!("invalid SCION destination {:?}", d.address))?;
                let name = (!d.name.is_empty()).then(|| d.name.clone());
                Ok((addr, name))
            })
            .collect()
    }

    /// Parse the IP destinations; the original address string stays the
    /// row key.
    pub fn parse_ip(&self) -> Result<Vec<(IpAddr, String)>> {
        self.ip_destinations
            .iter()
            .map(|d| {
                let addr: IpAddr = d
                    .address
                    .parse()
                    .with_context(|| format!("invalid IP destination {:?}", d.address))?;
                Ok((addr, d.address.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_the_documented_schema() {
        let json = r#"{
            "scion_destinations": [
                {
                    "address": "71-559,192.0.2.7",
                    "ip_address": "192.0.2.7",
                    "name": "example",
                    "scion_version": "v0.10"
                }
            ],
            "ip_destinations": [
                { "address": "198.51.100.9", "name": "plain" }
            ],
            "future_field": true
        }"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let remotes = Remotes::load(file.path()).unwrap();
        let scion = remotes.parse_scion().unwrap();
        assert_eq!(scion.len(), 1);
        assert_eq!(scion[0].0.to_string(), "71-559,192.0.2.7");
        assert_eq!(scion[0].1.as_deref(), Some("example"));

        let ip = remotes.parse_ip().unwrap();
        assert_eq!(ip[0].1, "198.51.100.9");
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{}").unwrap();
        let remotes = Remotes::load(file.path()).unwrap();
        assert!(remotes.scion_destinations.is_empty());
        assert!(remotes.ip_destinations.is_empty());
    }

    #[test]
    fn cli_list_splits_on_whitespace() {
        let remotes = Remotes::from_cli_list("71-559,192.0.2.7 64-2:0:9,192.0.2.8");
        assert_eq!(remotes.scion_destinations.len(), 2);
        let parsed = remotes.parse_scion().unwrap();
        assert_eq!(parsed[1].0.to_string(), "64-2:0:9,192.0.2.8");
        assert_eq!(parsed[0].1, None);
    }

    #[test]
    fn malformed_addresses_are_fatal() {
        let remotes = Remotes::from_cli_list("definitely-not-scion");
        assert!(remotes.parse_scion().is_err());
    }
}
