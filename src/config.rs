//! Agent-wide configuration, loaded once at startup from a JSON file.
//!
//! Generalizes the teacher's `Config::from_env` into a JSON-file-backed
//! tree: a malformed config file aborts startup rather than silently
//! falling back to defaults, since host paths and storage/network drivers
//! are not safe to guess.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

const DEFAULT_CONFIG_PATH: &str = "/etc/fc-hostd/config.json";
const CONFIG_PATH_ENV: &str = "FC_HOSTD_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    pub defaults: Defaults,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    pub host: HostDefaults,
    pub storage: StorageDefaults,
    pub net: NetDefaults,
    #[serde(default)]
    pub console: Option<ConsoleDefaults>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDefaults {
    pub firecracker_bin: String,
    pub conf_dir: PathBuf,
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    pub payload_dir: PathBuf,
    pub image_dir: PathBuf,
    pub kernel_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDefaults {
    #[serde(default = "default_storage_driver")]
    pub driver: String,
    #[serde(default)]
    pub volume_dir: Option<PathBuf>,
    #[serde(default)]
    pub volume_group: Option<String>,
    #[serde(default)]
    pub thinpool: Option<String>,
}

fn default_storage_driver() -> String {
    "file".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetDefaults {
    #[serde(default = "default_net_driver")]
    pub driver: String,
    pub host_bridge: String,
    #[serde(default)]
    pub uplink: Option<String>,
}

fn default_net_driver() -> String {
    "linux-bridge-vlan".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleDefaults {
    pub xvfb_bin: String,
    pub vnc_bin: String,
    pub terminal_bin: String,
    pub bind_host: String,
    pub port_min: u16,
    pub port_max: u16,
    #[serde(default = "default_display_geometry")]
    pub geometry: String,
}

fn default_display_geometry() -> String {
    "1024x768x16".to_string()
}

impl Config {
    /// Load configuration from the path named by `FC_HOSTD_CONFIG`, or the
    /// fixed default path if unset.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Internal(format!("reading config {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| {
            AgentError::InvalidArgument(format!("malformed config {}: {e}", path.display()))
        })?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> &'static str {
        r#"{
            "bind_port": 9090,
            "defaults": {
                "host": {
                    "firecracker_bin": "/usr/bin/firecracker",
                    "conf_dir": "/tmp/conf",
                    "run_dir": "/tmp/run",
                    "log_dir": "/tmp/log",
                    "payload_dir": "/tmp/payload",
                    "image_dir": "/tmp/image",
                    "kernel_dir": "/tmp/kernel"
                },
                "storage": { "driver": "file" },
                "net": { "driver": "linux-bridge-vlan", "host_bridge": "br0" }
            }
        }"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = serde_json::from_str(sample()).unwrap();
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.bind_port, 9090);
        assert_eq!(config.defaults.storage.driver, "file");
        assert!(config.defaults.console.is_none());
    }

    #[test]
    fn malformed_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
