//! Engine configuration.
//!
//! Every field has a default, so an empty YAML file (or none at all) is a valid config.

use crate::instance::InstanceOptions;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where the environment is persisted.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Tracing filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_state_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mocknoa")
        .join("environment.json")
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    3000
}

fn default_log_filter() -> String {
    "mocknoa_engine=info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            bind_host: default_bind_host(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            log_filter: default_log_filter(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.shutdown_timeout_ms == 0 {
            anyhow::bail!("shutdown_timeout_ms must be greater than zero");
        }
        if self.bind_host.parse::<IpAddr>().is_err() {
            anyhow::bail!(
                "Invalid bind_host '{}': expected an IP address such as 127.0.0.1",
                self.bind_host
            );
        }
        Ok(())
    }

    /// Options for the instance manager.
    ///
    /// Falls back to the defaults for a host that does not parse; `validate` reports it.
    pub fn instance_options(&self) -> InstanceOptions {
        let defaults = InstanceOptions::default();
        InstanceOptions {
            bind_host: self.bind_host.parse().unwrap_or(defaults.bind_host),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::Ipv4Addr;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: EngineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.state_file.ends_with("mocknoa/environment.json"));
        assert_eq!(config.log_filter, "mocknoa_engine=info");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mocknoa.yaml");
        fs::write(
            &path,
            "state_file: /tmp/env.json\nbind_host: 0.0.0.0\nshutdown_timeout_ms: 500\n",
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.state_file, PathBuf::from("/tmp/env.json"));

        let options = config.instance_options();
        assert_eq!(options.bind_host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(options.shutdown_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = EngineConfig {
            shutdown_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            bind_host: "localhost:80".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("localhost:80"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(EngineConfig::from_file("/nonexistent/mocknoa.yaml").is_err());
    }
}
