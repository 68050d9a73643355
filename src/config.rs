//! Configuration. Loaded from TOML via the `config` crate into a single
//! `Config` covering the mobile node's MQTT/storage/battery/queue settings.

use std::path::Path;

use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Battery-derived tuning thresholds feeding the lifecycle adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryConfig {
    #[serde(default = "default_low_threshold")]
    pub low_threshold: u8,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u8,
    #[serde(default = "default_true")]
    pub adaptive_keep_alive: bool,
    #[serde(default = "default_true")]
    pub adaptive_sync: bool,
    #[serde(default = "default_true")]
    pub throttle: bool,
    #[serde(default = "default_true")]
    pub reduce_background: bool,
}

fn default_low_threshold() -> u8 {
    20
}
fn default_critical_threshold() -> u8 {
    10
}
fn default_true() -> bool {
    true
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            low_threshold: default_low_threshold(),
            critical_threshold: default_critical_threshold(),
            adaptive_keep_alive: true,
            adaptive_sync: true,
            throttle: true,
            reduce_background: true,
        }
    }
}

/// Offline queue sizing and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueConfig {
    #[serde(default = "default_max_operations")]
    pub max_operations: usize,
    #[serde(default = "default_max_age_seconds")]
    pub max_age_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_operations() -> usize {
    1_000
}
fn default_max_age_seconds() -> u64 {
    24 * 60 * 60
}
fn default_batch_size() -> usize {
    10
}
fn default_max_retries() -> u32 {
    5
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_age_seconds: default_max_age_seconds(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
        }
    }
}

/// Top-level node configuration: an immutable record recognized at startup
///. Password-without-TLS triggers `on_security_warning` rather
/// than failing outright, so deployments can opt in deliberately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_use_tls: bool,

    pub client_id: String,
    pub node_id: String,
    pub topic_prefix: String,

    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_seconds")]
    pub keep_alive_seconds: u32,
    #[serde(default = "default_connection_timeout_seconds")]
    pub connection_timeout_seconds: u32,

    #[serde(default)]
    pub persistence_enabled: bool,
    #[serde(default)]
    pub storage_path: Option<String>,

    /// When `true`, a write while disconnected fails with
    /// `ErrorKind::Disconnected` instead of being queued.
    #[serde(default)]
    pub require_connected: bool,

    #[serde(default)]
    pub battery_config: BatteryConfig,
    #[serde(default)]
    pub offline_queue: OfflineQueueConfig,
}

fn default_keep_alive_seconds() -> u32 {
    60
}
fn default_connection_timeout_seconds() -> u32 {
    30
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder()
            .add_source(File::from(path))
            .build()
            .map_err(|e| Error::validation(format!("failed to load config: {e}")))?;
        settings
            .try_deserialize()
            .map_err(|e| Error::validation(format!("invalid config: {e}")))
    }

    /// Raises a security warning through the given handler iff a password
    /// is configured without TLS.
    pub fn check_security(&self, on_warning: impl FnOnce(&str)) {
        if self.password.is_some() && !self.mqtt_use_tls {
            on_warning("password configured without mqtt_use_tls: credentials will be sent in cleartext");
        }
    }

    pub fn default_for_node(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_use_tls: false,
            client_id: node_id.clone(),
            node_id,
            topic_prefix: "merklekv".to_string(),
            username: None,
            password: None,
            keep_alive_seconds: default_keep_alive_seconds(),
            connection_timeout_seconds: default_connection_timeout_seconds(),
            persistence_enabled: false,
            storage_path: None,
            require_connected: false,
            battery_config: BatteryConfig::default(),
            offline_queue: OfflineQueueConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_minimal_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file.as_file_mut(),
            r#"
mqtt_host = "broker.local"
mqtt_port = 1883
client_id = "node-a"
node_id = "node-a"
topic_prefix = "fleet1"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.keep_alive_seconds, 60);
        assert_eq!(config.battery_config.low_threshold, 20);
        assert_eq!(config.offline_queue.max_operations, 1_000);
    }

    #[test]
    fn security_warning_fires_on_password_without_tls() {
        let mut config = Config::default_for_node("node-a");
        config.password = Some("secret".into());
        let mut warned = false;
        config.check_security(|_| warned = true);
        assert!(warned);
    }

    #[test]
    fn no_security_warning_when_tls_enabled() {
        let mut config = Config::default_for_node("node-a");
        config.password = Some("secret".into());
        config.mqtt_use_tls = true;
        let mut warned = false;
        config.check_security(|_| warned = true);
        assert!(!warned);
    }
}
