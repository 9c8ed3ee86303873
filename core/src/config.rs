// Node configuration
//
// JSON file with one section per component; every field has a default so a
// partial file (or none at all) is enough.

use crate::transport::Protocol;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid timeout {name}: must be > 0")]
    InvalidTimeout { name: &'static str },

    #[error("Invalid sending speed limit: must be > 0")]
    InvalidSpeedLimit,

    #[error("Invalid proxy limit {name}: must be > 0")]
    InvalidProxyLimit { name: &'static str },

    #[error("Protocol priority lists {0} twice")]
    DuplicatePriority(Protocol),

    #[error("No data directory available on this platform")]
    NoDataDir,
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// How long an outbound packet waits for its response.
    pub response_timeout_secs: u64,
    /// How long an inbound transfer may stay in progress.
    pub receive_timeout_secs: u64,
    /// Bytes per second assumed when sizing send timeouts of large packets.
    pub sending_speed_limit: u64,
    /// Installed protocols never chosen for sending.
    pub send_disabled: Vec<Protocol>,
    pub priority: Vec<Protocol>,
    pub unhandled_history: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: 30,
            receive_timeout_secs: 300,
            sending_speed_limit: 128 * 1024,
            send_disabled: Vec::new(),
            priority: Protocol::PRIORITY.to_vec(),
            unhandled_history: 100,
        }
    }
}

impl GatewayConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportsConfig {
    /// TCP bind address; `None` disables the TCP driver.
    pub tcp_bind: Option<String>,
    pub tcp_advertise: Option<String>,
    pub tcp_connect_timeout_secs: u64,
    /// Host name on an in-process memory network.
    pub memory_host: Option<String>,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            tcp_bind: Some("0.0.0.0:7771".to_string()),
            tcp_advertise: None,
            tcp_connect_timeout_secs: 10,
            memory_host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub router_enabled: bool,
    pub receiver_enabled: bool,
    pub max_routes: usize,
    /// Relayed inner packet ids remembered for dedup.
    pub dedup_window: usize,
    pub dedup_max_age_secs: u64,
    /// Packets held while no route is active.
    pub pending_limit: usize,
    /// Routers tried before asking the directory for a random peer.
    pub preferred_routers: Vec<String>,
    /// Added to the response timeout of relayed packets.
    pub relay_extra_timeout_secs: u64,
    pub service_retries: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            router_enabled: false,
            receiver_enabled: false,
            max_routes: 20,
            dedup_window: 1_000,
            dedup_max_age_secs: 600,
            pending_limit: 100,
            preferred_routers: Vec::new(),
            relay_extra_timeout_secs: 10,
            service_retries: 3,
        }
    }
}

impl ProxyConfig {
    pub fn dedup_max_age(&self) -> Duration {
        Duration::from_secs(self.dedup_max_age_secs)
    }

    pub fn relay_extra_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_extra_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `<platform data dir>/courier`.
    pub data_dir: Option<PathBuf>,
    /// Keep everything in memory (tests, throwaway nodes).
    pub in_memory: bool,
}

impl StorageConfig {
    pub fn resolve_data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("courier"))
                .ok_or(ConfigError::NoDataDir),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    pub level: String,
    pub json: bool,
    /// Directory for daily rolling log files.
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_dir: None,
        }
    }
}

// ============================================================================
// NODE CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub gateway: GatewayConfig,
    pub transports: TransportsConfig,
    pub proxy: ProxyConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl CourierConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.response_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout {
                name: "gateway.response_timeout_secs",
            });
        }
        if self.gateway.receive_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout {
                name: "gateway.receive_timeout_secs",
            });
        }
        if self.gateway.sending_speed_limit == 0 {
            return Err(ConfigError::InvalidSpeedLimit);
        }
        for (i, proto) in self.gateway.priority.iter().enumerate() {
            if self.gateway.priority[..i].contains(proto) {
                return Err(ConfigError::DuplicatePriority(*proto));
            }
        }
        if self.proxy.max_routes == 0 {
            return Err(ConfigError::InvalidProxyLimit { name: "proxy.max_routes" });
        }
        if self.proxy.pending_limit == 0 {
            return Err(ConfigError::InvalidProxyLimit {
                name: "proxy.pending_limit",
            });
        }
        if self.proxy.dedup_window == 0 {
            return Err(ConfigError::InvalidProxyLimit {
                name: "proxy.dedup_window",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CourierConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.response_timeout(), Duration::from_secs(30));
        assert_eq!(config.proxy.max_routes, 20);
        assert_eq!(config.proxy.pending_limit, 100);
        assert_eq!(config.gateway.priority, Protocol::PRIORITY.to_vec());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CourierConfig::from_json(
            r#"{"gateway": {"send_disabled": ["udp"]}, "proxy": {"max_routes": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.gateway.send_disabled, vec![Protocol::Udp]);
        assert_eq!(config.gateway.unhandled_history, 100);
        assert_eq!(config.proxy.max_routes, 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = CourierConfig::default();
        config.gateway.response_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout { .. })));

        let mut config = CourierConfig::default();
        config.gateway.priority = vec![Protocol::Tcp, Protocol::Tcp];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePriority(Protocol::Tcp))
        ));

        assert!(matches!(
            CourierConfig::from_json(r#"{"proxy": {"max_routes": 0}}"#),
            Err(ConfigError::InvalidProxyLimit { .. })
        ));
        assert!(matches!(
            CourierConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.json");
        std::fs::write(&path, r#"{"logging": {"json": true}}"#).unwrap();
        assert!(CourierConfig::load_from_file(&path).unwrap().logging.json);
        assert!(matches!(
            CourierConfig::load_from_file(dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let storage = StorageConfig {
            data_dir: Some(PathBuf::from("/tmp/courier-test")),
            in_memory: false,
        };
        assert_eq!(storage.resolve_data_dir().unwrap(), PathBuf::from("/tmp/courier-test"));
    }
}
