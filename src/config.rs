//! Node configuration
//!
//! Defaults, then the first config file found, then environment overrides.
//! File: `$ANOGRAM_CONFIG`, `~/.config/anogram/config.toml` or
//! `/etc/anogram/config.toml`.
//! Env overrides: ANOGRAM_DEVICE_ID, ANOGRAM_DEVICE_NAME,
//! ANOGRAM_AUTO_CONNECT, ANOGRAM_AUTO_SCAN.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::bluetooth::protocol::{ADVERTISE_NAME, CONNECTION_TIMEOUT, MAX_RELAY_HOPS};
use crate::bluetooth::scanner::ScanFilterMode;
use crate::message::pending::DEFAULT_PENDING_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidOverride { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    /// Sender id stamped on originated messages (default: 8 random hex chars).
    #[serde(default = "generate_device_id")]
    pub device_id: String,
    /// Display name; also the advertised local name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Reported by the peer-info characteristic.
    #[serde(default = "default_device_model")]
    pub device_model: String,
    #[serde(default = "default_max_relay_hops")]
    pub max_relay_hops: u32,
    /// Dial timeout in milliseconds, 0 disables it.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Stop scanning after this long; unset scans until told to stop.
    #[serde(default)]
    pub scan_duration_ms: Option<u64>,
    /// Start scanning once the node is up.
    #[serde(default = "default_true")]
    pub auto_scan: bool,
    /// Dial every newly discovered peer.
    #[serde(default)]
    pub auto_connect: bool,
    /// Drop relayed copies of message ids already handled.
    #[serde(default)]
    pub suppress_duplicates: bool,
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    #[serde(default)]
    pub scan_filter: ScanFilterMode,
}

/// Random 8 hex character node id
pub fn generate_device_id() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

fn default_device_name() -> String {
    ADVERTISE_NAME.to_string()
}

fn default_device_model() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn default_max_relay_hops() -> u32 {
    MAX_RELAY_HOPS
}

fn default_connection_timeout_ms() -> u64 {
    CONNECTION_TIMEOUT.as_millis() as u64
}

fn default_true() -> bool {
    true
}

fn default_pending_capacity() -> usize {
    DEFAULT_PENDING_CAPACITY
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            device_id: generate_device_id(),
            device_name: default_device_name(),
            device_model: default_device_model(),
            max_relay_hops: default_max_relay_hops(),
            connection_timeout_ms: default_connection_timeout_ms(),
            scan_duration_ms: None,
            auto_scan: true,
            auto_connect: false,
            suppress_duplicates: false,
            pending_capacity: default_pending_capacity(),
            scan_filter: ScanFilterMode::default(),
        }
    }
}

impl MeshConfig {
    /// Load config: merge default, then config file (if present), then env vars.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(id) = lookup("ANOGRAM_DEVICE_ID").filter(|s| !s.is_empty()) {
            self.device_id = id;
        }
        if let Some(name) = lookup("ANOGRAM_DEVICE_NAME").filter(|s| !s.is_empty()) {
            self.device_name = name;
        }
        if let Some(value) = lookup("ANOGRAM_AUTO_CONNECT") {
            self.auto_connect = parse_flag("ANOGRAM_AUTO_CONNECT", value)?;
        }
        if let Some(value) = lookup("ANOGRAM_AUTO_SCAN") {
            self.auto_scan = parse_flag("ANOGRAM_AUTO_SCAN", value)?;
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_ms > 0).then(|| Duration::from_millis(self.connection_timeout_ms))
    }

    pub fn scan_duration(&self) -> Option<Duration> {
        self.scan_duration_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOverride { key, value }),
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(explicit) = std::env::var_os("ANOGRAM_CONFIG") {
        out.push(PathBuf::from(explicit));
    }
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/anogram/config.toml"));
    }
    out.push(PathBuf::from("/etc/anogram/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.device_id.len(), 8);
        assert!(config.device_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(config.device_name, "AnoGram");
        assert_eq!(config.max_relay_hops, 7);
        assert_eq!(config.connection_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.scan_duration(), None);
        assert!(config.auto_scan);
        assert!(!config.auto_connect);
        assert!(!config.suppress_duplicates);
        assert_eq!(config.pending_capacity, 1000);
        assert_eq!(config.scan_filter, ScanFilterMode::Name);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: MeshConfig = toml::from_str(
            r#"
            device_id = "a1b2c3d4"
            connection_timeout_ms = 0
            scan_duration_ms = 10000
            scan_filter = "service"
            "#,
        )
        .unwrap();

        assert_eq!(config.device_id, "a1b2c3d4");
        assert_eq!(config.device_name, "AnoGram");
        assert_eq!(config.connection_timeout(), None);
        assert_eq!(config.scan_duration(), Some(Duration::from_secs(10)));
        assert_eq!(config.scan_filter, ScanFilterMode::Service);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<MeshConfig>("hop_limit = 3").is_err());
    }

    #[test]
    fn overrides_apply_on_top() {
        let env: HashMap<&str, &str> = [
            ("ANOGRAM_DEVICE_NAME", "AnoGram Bob"),
            ("ANOGRAM_AUTO_CONNECT", "yes"),
            ("ANOGRAM_AUTO_SCAN", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = MeshConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.device_name, "AnoGram Bob");
        assert!(config.auto_connect);
        assert!(!config.auto_scan);
    }

    #[test]
    fn bad_flag_is_an_error() {
        let mut config = MeshConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "ANOGRAM_AUTO_SCAN").then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidOverride { key: "ANOGRAM_AUTO_SCAN", .. })));
    }
}
