//! Runtime Configuration Module
//!
//! Typed settings for the worker pool and the network execution pool.
//! Settings come either from the flat key/value string handed to the module
//! manager, or from a TOML file with `FABRIC_` environment overrides.

use crate::defaults::{keys, network, runtime};
use crate::kv::{optional_value_or, parse_key_values, value_or};
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Worker pool settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads, each owning a subset of modules
    pub worker_num: usize,

    /// Machine identifier carried in the top byte of every module id
    pub machine_id: u8,

    /// Tick period of the worker loop when idle (milliseconds)
    pub update_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_num: runtime::WORKER_NUM,
            machine_id: runtime::MACHINE_ID,
            update_interval_ms: runtime::UPDATE_INTERVAL_MS,
        }
    }
}

impl RuntimeConfig {
    /// Build from a flat `key:value;...` string.
    ///
    /// Missing or malformed `worker_num` and `machine_id` are logged and
    /// replaced by their defaults; this never fails.
    pub fn from_kv_str(input: &str) -> Self {
        let pairs = parse_key_values(input);

        let mut worker_num = value_or(&pairs, keys::WORKER_NUM, runtime::WORKER_NUM);
        if worker_num == 0 || worker_num > runtime::MAX_WORKER_NUM {
            warn!(
                "config [{}] = {} out of range 1..={}, will initialize {} = {}",
                keys::WORKER_NUM,
                worker_num,
                runtime::MAX_WORKER_NUM,
                keys::WORKER_NUM,
                runtime::WORKER_NUM
            );
            worker_num = runtime::WORKER_NUM;
        }

        let machine_id = value_or(&pairs, keys::MACHINE_ID, runtime::MACHINE_ID);
        let update_interval_ms =
            optional_value_or(&pairs, keys::UPDATE_INTERVAL, runtime::UPDATE_INTERVAL_MS);

        let config = Self {
            worker_num,
            machine_id,
            update_interval_ms,
        };
        debug!(?config, "Parsed runtime configuration");
        config
    }

    /// Render back into the flat string form.
    pub fn to_kv_string(&self) -> String {
        format!(
            "{}:{};{}:{};{}:{}",
            keys::WORKER_NUM,
            self.worker_num,
            keys::MACHINE_ID,
            self.machine_id,
            keys::UPDATE_INTERVAL,
            self.update_interval_ms
        )
    }
}

/// I/O execution pool settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Number of I/O execution contexts (one thread each)
    pub thread_num: usize,

    /// Idle session timeout in milliseconds, 0 disables it
    pub timeout_ms: u64,

    /// Largest accepted frame
    pub max_message_size: usize,

    /// Optional listen endpoint for services
    pub listen_host: Option<String>,
    pub listen_port: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            thread_num: network::THREAD_NUM,
            timeout_ms: network::SESSION_TIMEOUT_MS,
            max_message_size: network::MAX_MESSAGE_SIZE,
            listen_host: None,
            listen_port: None,
        }
    }
}

impl NetworkConfig {
    /// Build from a flat `key:value;...` string (`net_thread_num`, `timeout`).
    pub fn from_kv_str(input: &str) -> Self {
        let pairs = parse_key_values(input);
        let mut thread_num = optional_value_or(&pairs, keys::NET_THREAD_NUM, network::THREAD_NUM);
        if thread_num == 0 || thread_num > 256 {
            warn!(
                "config [{}] = {} out of range, will initialize {} = {}",
                keys::NET_THREAD_NUM,
                thread_num,
                keys::NET_THREAD_NUM,
                network::THREAD_NUM
            );
            thread_num = network::THREAD_NUM;
        }

        Self {
            thread_num,
            timeout_ms: optional_value_or(&pairs, keys::TIMEOUT, network::SESSION_TIMEOUT_MS),
            ..Default::default()
        }
    }
}

/// Complete file-based configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct FabricConfig {
    pub runtime: RuntimeConfig,
    pub network: NetworkConfig,
}

impl FabricConfig {
    /// Load configuration from a TOML file with environment overrides.
    ///
    /// Environment variables use the `FABRIC_` prefix and `__` between
    /// sections, e.g. `FABRIC_RUNTIME__WORKER_NUM=8`.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading fabric config: {:?}", path);

        let builder = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix("FABRIC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build().context("Failed to build configuration")?;

        let mut loaded: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        loaded.sanitize();
        Ok(loaded)
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let mut loaded: Self = toml::from_str(input).context("Failed to parse TOML configuration")?;
        loaded.sanitize();
        Ok(loaded)
    }

    fn sanitize(&mut self) {
        if self.runtime.worker_num == 0 || self.runtime.worker_num > runtime::MAX_WORKER_NUM {
            warn!(
                worker_num = self.runtime.worker_num,
                "Invalid worker_num in config file, using {}",
                runtime::WORKER_NUM
            );
            self.runtime.worker_num = runtime::WORKER_NUM;
        }
        if self.network.thread_num == 0 {
            warn!("Invalid network thread_num 0 in config file, using {}", network::THREAD_NUM);
            self.network.thread_num = network::THREAD_NUM;
        }
    }
}

/// Convenience function to load configuration, falling back to defaults when
/// no path is given
pub fn load_config(path: Option<&Path>) -> Result<FabricConfig> {
    match path {
        Some(p) => FabricConfig::load(p),
        None => {
            info!("No config file given, using defaults");
            Ok(FabricConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test_log::test]
    fn test_missing_keys_use_defaults() {
        let config = RuntimeConfig::from_kv_str("");
        assert_eq!(config.worker_num, 1);
        assert_eq!(config.machine_id, 1);
        assert_eq!(config.update_interval_ms, runtime::UPDATE_INTERVAL_MS);
    }

    #[test]
    fn test_recognized_keys() {
        let config = RuntimeConfig::from_kv_str("worker_num:4;machine_id:9;update_interval:5;foo:bar");
        assert_eq!(config.worker_num, 4);
        assert_eq!(config.machine_id, 9);
        assert_eq!(config.update_interval_ms, 5);
    }

    #[test]
    fn test_worker_num_out_of_range() {
        assert_eq!(RuntimeConfig::from_kv_str("worker_num:0").worker_num, 1);
        assert_eq!(RuntimeConfig::from_kv_str("worker_num:300").worker_num, 1);
        assert_eq!(RuntimeConfig::from_kv_str("worker_num:256").worker_num, 256);
    }

    #[test]
    fn test_machine_id_must_fit_a_byte() {
        assert_eq!(RuntimeConfig::from_kv_str("machine_id:999").machine_id, 1);
    }

    #[test]
    fn test_kv_string_round_trip() {
        let config = RuntimeConfig {
            worker_num: 3,
            machine_id: 2,
            update_interval_ms: 20,
        };
        assert_eq!(RuntimeConfig::from_kv_str(&config.to_kv_string()), config);
    }

    #[test]
    fn test_network_kv() {
        let config = NetworkConfig::from_kv_str("net_thread_num:3;timeout:5000");
        assert_eq!(config.thread_num, 3);
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.max_message_size, network::MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("fabric.toml");

        let config_content = r#"
[runtime]
worker_num = 6
machine_id = 3

[network]
thread_num = 2
timeout_ms = 30000
listen_host = "127.0.0.1"
listen_port = "9100"
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = FabricConfig::load(&config_path).unwrap();
        assert_eq!(config.runtime.worker_num, 6);
        assert_eq!(config.runtime.machine_id, 3);
        assert_eq!(config.runtime.update_interval_ms, runtime::UPDATE_INTERVAL_MS);
        assert_eq!(config.network.thread_num, 2);
        assert_eq!(config.network.timeout_ms, 30000);
        assert_eq!(config.network.listen_host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_toml_sanitizes_zero_workers() {
        let config = FabricConfig::from_toml_str("[runtime]\nworker_num = 0\n").unwrap();
        assert_eq!(config.runtime.worker_num, 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(FabricConfig::load(&dir.path().join("absent.toml")).is_err());
    }
}
