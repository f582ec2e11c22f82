//! Configuration for the hmdfs daemon
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - Linux: ~/.config/hmdfsd/config.toml
//! (the daemon normally runs on one OS; other paths follow the platform
//! convention of the `directories` crate)

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default user the daemon mounts for
    pub user: UserConfig,
    /// Link/session settings
    pub network: NetworkConfig,
    /// Kernel control-channel settings
    pub kernel: KernelConfig,
    /// Trust classification settings
    pub trust: TrustConfig,
    /// Statically known peers (standalone deployments without a live
    /// platform device manager)
    pub peers: Vec<PeerEntry>,
}

/// User settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub id: i32,
    pub account: String,
    /// cid announced as the local device; empty means "use the hostname"
    pub local_cid: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            id: 100,
            account: "account".into(),
            local_cid: String::new(),
        }
    }
}

/// Link/session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port the LAN link provider listens on for inbound sessions
    pub listen_port: u16,
    /// Connect timeout for outbound session attempts (seconds)
    pub connect_timeout_secs: u64,
    /// Settle delay before an outbound open (works around the platform's
    /// offline/on-session-opened ordering)
    pub open_session_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 5202,
            connect_timeout_secs: 10,
            open_session_delay_ms: 100,
        }
    }
}

/// Kernel control-channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Poll tick on the control file (milliseconds)
    pub poll_timeout_ms: i32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: crate::POLL_TIMEOUT_MS,
        }
    }
}

/// Trust classification configuration.
///
/// The legacy behavior takes the accountless decision from a system
/// parameter; the group-type path inspects the peer's trust groups instead.
/// Both are kept selectable until the platform settles on one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// When true, classify peers by their trust-group types
    pub classify_by_group_type: bool,
    /// Accountless flag used when classification is parameter-driven
    pub accountless_parameter: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            classify_by_group_type: false,
            accountless_parameter: false,
        }
    }
}

/// One statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerEntry {
    /// Network/connection id
    pub cid: String,
    /// Stable physical-device id
    pub device_id: String,
    /// Address for the LAN link provider
    pub address: String,
    /// Network-type bitmask as the platform would report it
    pub network_type: u32,
    /// Profile os_type
    pub os_type: i32,
    /// Device security level (1..=4)
    pub devsl: i32,
}

impl Default for PeerEntry {
    fn default() -> Self {
        Self {
            cid: String::new(),
            device_id: String::new(),
            address: String::new(),
            network_type: crate::types::NETWORK_TYPE_WIFI_BIT,
            os_type: crate::types::SUPPORTED_OS_TYPE,
            devsl: 4,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "hmdfs", "hmdfsd")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let mut config = Self::default();
        config.peers.push(PeerEntry {
            cid: "peer-cid".into(),
            device_id: "peer-udid".into(),
            address: "192.168.1.20:5202".into(),
            ..Default::default()
        });
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
