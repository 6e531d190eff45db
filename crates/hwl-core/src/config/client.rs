//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::backoff::BackoffConfig;
use super::serde_utils::duration_secs;

/// Modules whose client types resolve without further configuration
pub const DEFAULT_ALLOW: &str = "hwl_client.*";

/// Configuration for a client connecting to an exporter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Exporter endpoint
    pub endpoint: String,

    /// Client type resolution policy
    pub drivers: DriverPolicyConfig,

    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Upper bound on any single remote call
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,

    /// Prefer the exporter's alternative TLS endpoints when offered
    pub use_alternative_endpoints: bool,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: format!(
                "unix://{}",
                super::default_runtime_dir().join("exporter.sock").display()
            ),
            drivers: DriverPolicyConfig::default(),
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(300),
            use_alternative_endpoints: false,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Allow-list for dynamically resolved client types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverPolicyConfig {
    /// Module names or `*` globs whose types may be loaded
    pub allow: Vec<String>,

    /// Skip the allow-list entirely
    #[serde(rename = "unsafe")]
    pub unsafe_: bool,
}

impl Default for DriverPolicyConfig {
    fn default() -> Self {
        Self {
            allow: vec![DEFAULT_ALLOW.to_string()],
            unsafe_: false,
        }
    }
}
