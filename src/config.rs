//! Configuration handling for vpnd
//!
//! Lookup order: `--config`, `./vpnd.toml`, `~/.vpnd/config.toml`, then
//! built-in defaults.

use crate::firewall::BackendKind;
use crate::net::{RelayEndpoint, SecuritySettings, TransportProtocol};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const LOCAL_CONFIG: &str = "vpnd.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub openvpn: OpenVpnConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Defaults for connect requests that carry no settings
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub relays: Vec<RelayInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub block_on_startup: bool,
    pub block_when_disconnected: bool,
    pub shutdown_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            block_on_startup: true,
            block_when_disconnected: false,
            shutdown_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub backend: BackendKind,
    /// Point the system resolver at the tunnel's DNS servers while connected
    pub manage_dns: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            manage_dns: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenVpnConfig {
    pub binary: PathBuf,
    /// Provider configuration (certificates, credentials)
    pub config_file: Option<PathBuf>,
    pub extra_args: Vec<String>,
    /// Passed as `--mssfix`; unset leaves OpenVPN's default
    pub mssfix: Option<u16>,
    pub stop_timeout_secs: u64,
    /// Loopback address for plugin callbacks; port 0 picks a free one
    pub plugin_addr: SocketAddr,
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("openvpn"),
            config_file: None,
            extra_args: Vec::new(),
            mssfix: None,
            stop_timeout_secs: 5,
            plugin_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub listen: SocketAddr,
    /// Where the per-session token is written; defaults to `~/.vpnd/rpc-token`
    pub token_file: Option<PathBuf>,
    /// Notifications buffered per subscriber before it is evicted
    pub subscriber_queue: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 46620)),
            token_file: None,
            subscriber_queue: 64,
        }
    }
}

/// A relay in the catalogue, with its location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: TransportProtocol,
    pub hostname: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl RelayInfo {
    pub fn endpoint(&self) -> RelayEndpoint {
        RelayEndpoint::new(self.ip, self.port, self.protocol)
    }
}

/// Where the current relay is, as far as the catalogue knows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `~/.vpnd`
    pub fn user_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".vpnd"))
    }

    pub fn user_config_path() -> Option<PathBuf> {
        Self::user_dir().map(|dir| dir.join("config.toml"))
    }

    /// First config file that exists, `explicit` taking precedence
    pub fn find(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            return Some(local);
        }

        Self::user_config_path().filter(|path| path.exists())
    }

    /// Load from the lookup order, falling back to defaults
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match Self::find(explicit) {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rpc.listen.ip().is_loopback() {
            return Err(ConfigError::Invalid(format!(
                "rpc.listen must be a loopback address, got {}",
                self.rpc.listen
            )));
        }
        if !self.openvpn.plugin_addr.ip().is_loopback() {
            return Err(ConfigError::Invalid(format!(
                "openvpn.plugin_addr must be a loopback address, got {}",
                self.openvpn.plugin_addr
            )));
        }
        if self.rpc.subscriber_queue == 0 {
            return Err(ConfigError::Invalid(
                "rpc.subscriber_queue must be at least 1".to_string(),
            ));
        }
        if self.daemon.shutdown_timeout_secs == 0 || self.openvpn.stop_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if self.openvpn.mssfix == Some(0) {
            return Err(ConfigError::Invalid("openvpn.mssfix must be at least 1".to_string()));
        }
        for relay in &self.relays {
            if relay.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "relay {} has port 0",
                    relay.ip
                )));
            }
        }
        Ok(())
    }

    pub fn token_file(&self) -> Option<PathBuf> {
        self.rpc
            .token_file
            .clone()
            .or_else(|| Self::user_dir().map(|dir| dir.join("rpc-token")))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.shutdown_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.openvpn.stop_timeout_secs)
    }

    /// Catalogue entry matching `relay`; falls back to an IP-only match
    pub fn locate(&self, relay: &RelayEndpoint) -> GeoLocation {
        let entry = self
            .relays
            .iter()
            .find(|r| r.endpoint() == *relay)
            .or_else(|| self.relays.iter().find(|r| r.ip == relay.ip));

        GeoLocation {
            ip: relay.ip,
            hostname: entry.and_then(|r| r.hostname.clone()),
            country: entry.and_then(|r| r.country.clone()),
            city: entry.and_then(|r| r.city.clone()),
        }
    }
}
