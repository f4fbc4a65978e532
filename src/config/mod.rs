//! Netmount configuration
//!
//! TOML file plus environment overrides, with defaults for every timing value.
//!
//! ```toml
//! [node]
//! name = "node-a"
//!
//! [timing]
//! actor_response_wait_ms = 5000
//! write_tx_idle_timeout_ms = 0
//!
//! [[devices]]
//! name = "r1"
//! host = "10.0.0.1"
//! port = 830
//! user_capabilities = ["urn:ietf:params:netconf:capability:candidate:1.0"]
//! ```

pub mod error;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

pub use error::ConfigError;
use error::ParseTomlSnafu;
use error::ReadFileSnafu;

use crate::constants::DEFAULT_ACTOR_RESPONSE_WAIT_MS;
use crate::constants::DEFAULT_DISCOVERY_BACKOFF_MS;
use crate::constants::DEFAULT_MAX_QUEUED_WRITES;
use crate::constants::DEFAULT_WRITE_TX_IDLE_TIMEOUT_MS;
use crate::types::DeviceId;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_FILE_ENV: &str = "NETMOUNT_CONFIG";

/// Configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "./netmount.toml";

/// Default values for configuration
mod defaults {
    pub fn node_name() -> String {
        "netmount".to_string()
    }
    pub fn actor_response_wait_ms() -> u64 {
        super::DEFAULT_ACTOR_RESPONSE_WAIT_MS
    }
    pub fn write_tx_idle_timeout_ms() -> u64 {
        super::DEFAULT_WRITE_TX_IDLE_TIMEOUT_MS
    }
    pub fn discovery_backoff_ms() -> u64 {
        super::DEFAULT_DISCOVERY_BACKOFF_MS
    }
    pub fn max_queued_writes() -> usize {
        super::DEFAULT_MAX_QUEUED_WRITES
    }
    pub fn lock_datastore() -> bool {
        true
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetmountConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Identity of this cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Prefix of every actor address hosted on this node.
    #[serde(default = "defaults::node_name")]
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: defaults::node_name(),
        }
    }
}

/// Timeouts and bounds shared by master and slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Budget for one slave request, discovery included.
    #[serde(default = "defaults::actor_response_wait_ms")]
    pub actor_response_wait_ms: u64,
    /// Idle time after which the master cancels the current transaction (0 = never).
    #[serde(default = "defaults::write_tx_idle_timeout_ms")]
    pub write_tx_idle_timeout_ms: u64,
    #[serde(default = "defaults::discovery_backoff_ms")]
    pub discovery_backoff_ms: u64,
    /// Write requests allowed to wait behind the current transaction.
    #[serde(default = "defaults::max_queued_writes")]
    pub max_queued_writes: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            actor_response_wait_ms: defaults::actor_response_wait_ms(),
            write_tx_idle_timeout_ms: defaults::write_tx_idle_timeout_ms(),
            discovery_backoff_ms: defaults::discovery_backoff_ms(),
            max_queued_writes: defaults::max_queued_writes(),
        }
    }
}

impl TimingConfig {
    pub fn actor_response_wait(&self) -> Duration {
        Duration::from_millis(self.actor_response_wait_ms)
    }

    pub fn discovery_backoff(&self) -> Duration {
        Duration::from_millis(self.discovery_backoff_ms)
    }

    pub fn write_tx_idle_timeout(&self) -> Option<Duration> {
        (self.write_tx_idle_timeout_ms > 0).then(|| Duration::from_millis(self.write_tx_idle_timeout_ms))
    }
}

/// One managed device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Lock datastores around transactions.
    #[serde(default = "defaults::lock_datastore")]
    pub lock_datastore: bool,
    /// Extra capability URIs, tagged as user-defined.
    #[serde(default)]
    pub user_capabilities: Vec<String>,
    /// Replace the advertised module capabilities with `user_capabilities`.
    #[serde(default)]
    pub override_capabilities: bool,
}

impl DeviceConfig {
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.name.clone(), format!("{}:{}", self.host, self.port))
    }
}

impl NetmountConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&contents).context(ParseTomlSnafu { path })
    }

    /// Load configuration with layered approach:
    /// 1. Start with defaults
    /// 2. Load from TOML file if it exists
    /// 3. Override with environment variables
    ///
    /// Configuration precedence (highest to lowest):
    /// - Environment variables (`NETMOUNT_*`)
    /// - Config file specified by `NETMOUNT_CONFIG`
    /// - ./netmount.toml
    /// - Hardcoded defaults
    pub fn load_with_layers() -> Result<Self, ConfigError> {
        let mut config = Self::load_toml_with_fallbacks()?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn load_toml_with_fallbacks() -> Result<Self, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_FILE_ENV) {
            let path = Path::new(&config_path);
            if path.exists() {
                tracing::info!("Loading configuration from {}: {}", CONFIG_FILE_ENV, config_path);
                return Self::from_toml_file(path);
            }
            tracing::warn!("{} specified but not found: {}", CONFIG_FILE_ENV, config_path);
        }

        let local_config = Path::new(DEFAULT_CONFIG_FILE);
        if local_config.exists() {
            tracing::info!("Loading configuration from: {}", DEFAULT_CONFIG_FILE);
            return Self::from_toml_file(local_config);
        }

        tracing::info!("No configuration file found, using hardcoded defaults");
        Ok(Self::default())
    }

    /// Apply environment variable overrides to existing configuration
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from any key lookup; `apply_env_overrides` uses the
    /// process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! apply_override {
            ($section:ident . $field:ident, $env:literal) => {
                if let Some(raw) = lookup($env) {
                    self.$section.$field = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                        key: $env.to_string(),
                        value: raw.clone(),
                        reason: format!("{e}"),
                    })?;
                }
            };
        }

        if let Some(name) = lookup("NETMOUNT_NODE_NAME") {
            self.node.name = name;
        }
        apply_override!(timing.actor_response_wait_ms, "NETMOUNT_ACTOR_RESPONSE_WAIT_MS");
        apply_override!(timing.write_tx_idle_timeout_ms, "NETMOUNT_WRITE_TX_IDLE_TIMEOUT_MS");
        apply_override!(timing.discovery_backoff_ms, "NETMOUNT_DISCOVERY_BACKOFF_MS");
        apply_override!(timing.max_queued_writes, "NETMOUNT_MAX_QUEUED_WRITES");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.trim().is_empty() {
            return Err(invalid("node.name", &self.node.name, "must not be empty"));
        }
        if self.timing.actor_response_wait_ms == 0 {
            return Err(invalid("timing.actor_response_wait_ms", "0", "must be positive"));
        }
        if self.timing.discovery_backoff_ms >= self.timing.actor_response_wait_ms {
            return Err(invalid(
                "timing.discovery_backoff_ms",
                &self.timing.discovery_backoff_ms.to_string(),
                "must be shorter than actor_response_wait_ms",
            ));
        }
        if self.timing.max_queued_writes == 0 {
            return Err(invalid("timing.max_queued_writes", "0", "must be positive"));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(invalid("devices.name", &device.name, "must not be empty"));
            }
            if device.port == 0 {
                return Err(invalid("devices.port", "0", "must be a valid port"));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(invalid("devices.name", &device.name, "duplicate device name"));
            }
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetmountConfig::default();
        assert_eq!(config.timing.actor_response_wait_ms, 5_000);
        assert_eq!(config.timing.write_tx_idle_timeout(), None);
        assert_eq!(config.timing.max_queued_writes, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
[node]
name = "node-a"

[timing]
write_tx_idle_timeout_ms = 30000

[[devices]]
name = "r1"
host = "10.0.0.1"
port = 830
lock_datastore = false
user_capabilities = ["urn:ietf:params:netconf:capability:candidate:1.0"]
"#
        )
        .expect("write");

        let config = NetmountConfig::from_toml_file(file.path()).expect("load");
        assert_eq!(config.node.name, "node-a");
        assert_eq!(config.timing.actor_response_wait_ms, 5_000);
        assert_eq!(config.timing.write_tx_idle_timeout(), Some(Duration::from_secs(30)));

        let device = config.device("r1").expect("device");
        assert!(!device.lock_datastore);
        assert!(!device.override_capabilities);
        assert_eq!(device.device_id(), DeviceId::new("r1", "10.0.0.1:830"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[timing\nbroken").expect("write");
        let err = NetmountConfig::from_toml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
    }

    #[test]
    fn test_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("NETMOUNT_NODE_NAME", "node-b"),
            ("NETMOUNT_ACTOR_RESPONSE_WAIT_MS", "750"),
        ]);
        let mut config = NetmountConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string())).expect("overrides");
        assert_eq!(config.node.name, "node-b");
        assert_eq!(config.timing.actor_response_wait(), Duration::from_millis(750));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = NetmountConfig::default();
        let err = config
            .apply_overrides(|key| (key == "NETMOUNT_MAX_QUEUED_WRITES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "NETMOUNT_MAX_QUEUED_WRITES"));
    }

    #[test]
    fn test_duplicate_devices_rejected() {
        let device = DeviceConfig {
            name: "r1".into(),
            host: "10.0.0.1".into(),
            port: 830,
            lock_datastore: true,
            user_capabilities: vec![],
            override_capabilities: false,
        };
        let config = NetmountConfig {
            devices: vec![device.clone(), device],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
