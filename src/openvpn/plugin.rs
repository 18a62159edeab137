//! Plugin bridge: the `vpnd plugin` side of the callback channel
//!
//! OpenVPN runs this binary as its `--up`, `--route-up` and `--down` script
//! with connection details in the environment. We forward one framed message
//! to the daemon and wait for its ack. Exiting non-zero makes OpenVPN abort,
//! which the daemon then sees as the process going down.
//!
//! # Key Variables
//!
//! | Variable | Example | Description |
//! |----------|---------|-------------|
//! | `script_type` | `up` | Lifecycle event |
//! | `dev` | `tun0` | Tunnel device name |
//! | `foreign_option_N` | `dhcp-option DNS 10.8.0.1` | Pushed options |
//! | `VPND_PLUGIN_ADDR` | `127.0.0.1:40123` | Daemon plugin listener |
//! | `VPND_PROCESS_TOKEN` | `9f2c...` | Identifies the spawning process |

use super::frame::{self, FrameError};
use super::{PLUGIN_ADDR_ENV, PROCESS_TOKEN_ENV};
use crate::net::validate_interface_alias;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info};

const PLUGIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid IP address in {var}: {value}")]
    InvalidIp { var: String, value: String },
    #[error("Invalid plugin address: {0}")]
    InvalidAddr(String),
    #[error("Unknown script type: {0}")]
    UnknownScriptType(String),
    #[error("Invalid tunnel device name: {0:?}")]
    InvalidDevice(String),
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Environment parsing failed: {0}")]
    Env(#[from] EnvError),
    #[error("Failed to reach daemon: {0}")]
    Connect(#[from] std::io::Error),
    #[error("Callback exchange failed: {0}")]
    Frame(#[from] FrameError),
    #[error("Daemon did not answer within {0:?}")]
    Timeout(Duration),
}

/// The hook OpenVPN is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    Up,
    RouteUp,
    Down,
}

impl std::str::FromStr for ScriptType {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ScriptType::Up),
            "route-up" => Ok(ScriptType::RouteUp),
            "down" => Ok(ScriptType::Down),
            _ => Err(EnvError::UnknownScriptType(s.to_string())),
        }
    }
}

/// Callback body as sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginEvent {
    Up {
        tunnel_alias: String,
        dns_servers: Vec<IpAddr>,
    },
    RouteUp,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMessage {
    pub token: String,
    pub event: PluginEvent,
}

/// Parsed OpenVPN script environment
#[derive(Debug, Clone)]
pub struct PluginEnv {
    pub script_type: ScriptType,
    pub tunnel_device: String,
    /// DNS servers pushed with `dhcp-option DNS` / `dhcp-option DNS6`
    pub dns_servers: Vec<IpAddr>,
    pub plugin_addr: SocketAddr,
    pub token: String,
}

impl PluginEnv {
    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_env_fn(|key| env::var(key))
    }

    /// Parse environment using a custom getter (for testing)
    pub fn from_env_fn<F>(get_var: F) -> Result<Self, EnvError>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let required = |key: &str| get_var(key).map_err(|_| EnvError::MissingVar(key.into()));

        let script_type: ScriptType = required("script_type")?.parse()?;
        let tunnel_device = required("dev")?;
        validate_interface_alias(&tunnel_device)
            .map_err(|_| EnvError::InvalidDevice(tunnel_device.clone()))?;

        let addr_str = required(PLUGIN_ADDR_ENV)?;
        let plugin_addr = addr_str
            .parse()
            .map_err(|_| EnvError::InvalidAddr(addr_str.clone()))?;
        let token = required(PROCESS_TOKEN_ENV)?;

        let mut dns_servers = Vec::new();
        for index in 1.. {
            let var = format!("foreign_option_{}", index);
            let Ok(option) = get_var(&var) else {
                break;
            };
            let mut parts = option.split_whitespace();
            if parts.next() != Some("dhcp-option") {
                continue;
            }
            if !matches!(parts.next(), Some("DNS") | Some("DNS6")) {
                continue;
            }
            let value = parts.next().unwrap_or_default();
            let ip: IpAddr = value.parse().map_err(|_| EnvError::InvalidIp {
                var: var.clone(),
                value: value.to_string(),
            })?;
            dns_servers.push(ip);
        }

        Ok(Self {
            script_type,
            tunnel_device,
            dns_servers,
            plugin_addr,
            token,
        })
    }

    pub fn message(&self) -> PluginMessage {
        let event = match self.script_type {
            ScriptType::Up => PluginEvent::Up {
                tunnel_alias: self.tunnel_device.clone(),
                dns_servers: self.dns_servers.clone(),
            },
            ScriptType::RouteUp => PluginEvent::RouteUp,
            ScriptType::Down => PluginEvent::Down,
        };
        PluginMessage {
            token: self.token.clone(),
            event,
        }
    }
}

/// Send one callback to the daemon and wait for the ack
pub async fn send_message(addr: SocketAddr, message: &PluginMessage) -> Result<(), PluginError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        frame::write_frame(&mut stream, message).await?;
        frame::read_ack(&mut stream).await?;
        Ok::<(), PluginError>(())
    };

    tokio::time::timeout(PLUGIN_TIMEOUT, exchange)
        .await
        .map_err(|_| PluginError::Timeout(PLUGIN_TIMEOUT))?
}

/// Entry point for `vpnd plugin`
pub async fn run_plugin() -> Result<(), PluginError> {
    let env = PluginEnv::from_env()?;
    info!(
        "Plugin callback: script_type={:?}, dev={}",
        env.script_type, env.tunnel_device
    );
    debug!("Pushed DNS servers: {:?}", env.dns_servers);

    send_message(env.plugin_addr, &env.message()).await
}
