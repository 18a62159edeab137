//! RPC gateway between the daemon and its clients
//!
//! Newline-delimited JSON over loopback TCP. The first request on every
//! connection must be `auth` with the per-session token the daemon writes to
//! its token file.
//!
//! # Methods
//!
//! | Method | Params | Result |
//! |--------|--------|--------|
//! | `auth` | `{"token"}` | `true` |
//! | `connect` | `{"relay", "settings"?}` | `true` |
//! | `disconnect`, `block`, `reset` | none | `true` |
//! | `get_state` | none | tunnel state |
//! | `get_current_location` | none | location or `null` |
//! | `subscribe` | none | `true`, then `{"notification": ...}` lines |
//! | `set_allow_lan` | `{"allow_lan"}` | `true` |
//! | `get_allow_lan` | none | `bool` |
//! | `set_openvpn_mssfix` | `{"mssfix"}` (`null` clears) | `true` |
//! | `get_tunnel_options` | none | `{"openvpn": {"mssfix"}}` |
//!
//! Settings changes are persisted and take effect on the next `connect`.

pub mod broadcast;
pub mod client;
pub mod server;

pub use broadcast::{SubscriberRegistry, Subscription};
pub use client::RpcClient;
pub use server::RpcGateway;

use crate::net::{RelayEndpoint, SecuritySettings};
use crate::tunnel::Notification;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed by daemon")]
    Closed,
    #[error("{code}: {message}")]
    Remote { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: RemoteError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Anything the daemon writes to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Notification { notification: Notification },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub relay: RelayEndpoint,
    /// Daemon defaults when absent
    #[serde(default)]
    pub settings: Option<SecuritySettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowLanParams {
    pub allow_lan: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MssfixParams {
    #[serde(default)]
    pub mssfix: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVpnTunnelOptions {
    pub mssfix: Option<u16>,
}

/// Result of `get_tunnel_options`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOptions {
    pub openvpn: OpenVpnTunnelOptions,
}

/// Write the session token readable by the owner only
pub fn write_token_file(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Remove first so an existing file's wider permissions are not kept
    let _ = std::fs::remove_file(path);

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(token.as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(path, token)?;

    Ok(())
}

pub fn read_token_file(path: &Path) -> std::io::Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}
