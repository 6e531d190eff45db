//! Exporter configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for an exporter process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Primary listen address (`unix://...`, `tcp://host:port`, `host:port`)
    pub endpoint: String,

    /// Extra `host:port` TLS listeners provisioned at startup
    pub alternative_endpoints: Vec<String>,

    /// Timeout used when mounting external subtrees
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Top-level drivers, exported as children of an implicit composite root
    pub export: BTreeMap<String, DriverInstanceConfig>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: format!(
                "unix://{}",
                super::default_runtime_dir().join("exporter.sock").display()
            ),
            alternative_endpoints: vec![],
            connect_timeout: Duration::from_secs(10),
            export: BTreeMap::new(),
        }
    }
}

/// One node of the driver configuration tree
///
/// Variants are tried in declaration order, so a table with `type` is always
/// a base driver even if it also lists children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DriverInstanceConfig {
    /// `{ type, config, children }`
    Base(BaseInstanceConfig),
    /// `{ ref }`
    Proxy(ProxyInstanceConfig),
    /// `{ target }`
    External(ExternalInstanceConfig),
    /// `{ children }`
    Composite(CompositeInstanceConfig),
}

/// A concrete driver type with its settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseInstanceConfig {
    /// Fully qualified driver type name
    #[serde(rename = "type")]
    pub type_name: String,

    /// Driver specific settings
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,

    /// Nested drivers
    #[serde(default)]
    pub children: BTreeMap<String, DriverInstanceConfig>,
}

/// Alias of another node of the same tree, by dotted path from the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyInstanceConfig {
    #[serde(rename = "ref")]
    pub reference: String,
}

/// Mount point for another exporter's whole tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalInstanceConfig {
    /// Endpoint of the other exporter
    pub target: String,
}

/// Grouping node with no behavior of its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositeInstanceConfig {
    pub children: BTreeMap<String, DriverInstanceConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
endpoint = "tcp://127.0.0.1:9000"
alternative_endpoints = ["127.0.0.1:0"]

[export.power]
type = "hwl_exporter.drivers.power.MockPower"

[export.dut]
ref = "power"

[export.lab]
target = "unix:///run/hwlink/other.sock"

[export.bench.children.net]
type = "hwl_exporter.drivers.network.TcpNetwork"
config = { host = "127.0.0.1", port = 2222 }
"#;

    #[test]
    fn test_parse_all_node_shapes() {
        let config: ExporterConfig = toml::from_str(SAMPLE).unwrap();

        assert_eq!(config.endpoint, "tcp://127.0.0.1:9000");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(matches!(
            config.export.get("power"),
            Some(DriverInstanceConfig::Base(base))
                if base.type_name == "hwl_exporter.drivers.power.MockPower"
        ));
        assert!(matches!(
            config.export.get("dut"),
            Some(DriverInstanceConfig::Proxy(p)) if p.reference == "power"
        ));
        assert!(matches!(
            config.export.get("lab"),
            Some(DriverInstanceConfig::External(e)) if e.target.starts_with("unix://")
        ));

        let Some(DriverInstanceConfig::Composite(bench)) = config.export.get("bench") else {
            panic!("bench should be a composite");
        };
        let Some(DriverInstanceConfig::Base(net)) = bench.children.get("net") else {
            panic!("net should be a base driver");
        };
        assert_eq!(net.config.get("port"), Some(&serde_json::json!(2222)));
    }

    #[test]
    fn test_unknown_shape_rejected() {
        let result: Result<ExporterConfig, _> = toml::from_str(
            r#"
[export.bad]
bogus = 1
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_default_endpoint_is_unix() {
        let config = ExporterConfig::default();
        assert!(config.endpoint.starts_with("unix://"));
        assert!(config.endpoint.ends_with("exporter.sock"));
    }
}
