//! Configuration management for hwlink

mod backoff;
mod client;
mod exporter;
pub mod serde_utils;

pub use backoff::BackoffConfig;
pub use client::{ClientConfig, DriverPolicyConfig, DEFAULT_ALLOW};
pub use exporter::{
    BaseInstanceConfig, CompositeInstanceConfig, DriverInstanceConfig, ExporterConfig,
    ExternalInstanceConfig, ProxyInstanceConfig,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hwlink")
}

/// Default exporter configuration file
pub fn default_exporter_config_path() -> PathBuf {
    default_config_dir().join("exporter.toml")
}

/// Directory for runtime sockets
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hwlink")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<ClientConfig, _> = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_exporter_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exporter.toml");
        std::fs::write(
            &path,
            "endpoint = \"tcp://127.0.0.1:9000\"\n\n[export.power]\ntype = \"hwl_exporter.drivers.power.MockPower\"\n",
        )
        .unwrap();

        let loaded: ExporterConfig = load_config(&path).unwrap();
        assert_eq!(loaded.endpoint, "tcp://127.0.0.1:9000");
        assert!(matches!(
            loaded.export.get("power"),
            Some(DriverInstanceConfig::Base(_))
        ));
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exporter.toml");
        std::fs::write(&path, "endpoint = [").unwrap();

        let result: Result<ExporterConfig, _> = load_config(&path);
        assert!(result.is_err());
    }
}
