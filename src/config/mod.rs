//! Configuration module
//!
//! Handles loading and saving PeerLink configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::messaging::DEFAULT_MAX_PACKET_SIZE;
use crate::protocol::DEFAULT_PORT;
use crate::transport::TransportConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// UDP backend and tick loop settings
    #[serde(default)]
    pub network: NetworkConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this host
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface to bind to (default: all)
    pub bind_address: Option<IpAddr>,
    /// UDP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest payload the unordered tiers accept
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Interval between transport polls in ms
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_tick_interval() -> u64 {
    50
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: default_port(),
            max_packet_size: default_max_packet_size(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl NetworkConfig {
    /// Socket address to bind, using `port` in place of the configured one
    pub fn bind_addr(&self, port: u16) -> SocketAddr {
        let ip = self.bind_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("peerlink/config.toml")),
            Some(PathBuf::from("./peerlink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let mut config = Config {
        general: GeneralConfig {
            name: "game-host".to_string(),
            verbose: false,
        },
        ..Default::default()
    };
    let target = SocketAddr::from(([192, 168, 1, 20], DEFAULT_PORT));
    config.transport.target_address = Some(target.into());

    Ok(toml::to_string_pretty(&config)?)
}
