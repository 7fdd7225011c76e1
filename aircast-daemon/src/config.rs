//! Daemon configuration
//!
//! TOML configuration for the Miracast source daemon. A default file is
//! written on first run.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use aircast_p2p::NetworkManagerConfig;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Network configuration
    pub network: NetworkConfig,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Name announced to sinks
    pub name: String,

    /// Bring the service up as soon as the daemon starts
    #[serde(default = "default_true")]
    pub enable_on_start: bool,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// P2P network interface the supplicant is bound to
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Path of the wpa_supplicant binary
    #[serde(default = "default_supplicant_binary")]
    pub supplicant_binary: PathBuf,
}

fn default_interface() -> String {
    // Available on most Android-derived platforms.
    "p2p0".to_string()
}

fn default_supplicant_binary() -> PathBuf {
    PathBuf::from("/sbin/wpa_supplicant")
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            supplicant_binary: default_supplicant_binary(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Aircast".to_string()),
                enable_on_start: true,
            },
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("aircast")
            .join("daemon.toml")
    }

    /// Load configuration from file, creating the default if not found
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            let contents = fs::read_to_string(&path).context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Derive the P2P engine configuration
    pub fn network_manager_config(&self) -> NetworkManagerConfig {
        let mut config = NetworkManagerConfig::for_interface(&self.network.interface);
        config.supplicant.binary = self.network.supplicant_binary.clone();
        config
    }
}
