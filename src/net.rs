//! Network endpoint and security setting types shared across the daemon

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NetError {
    #[error("Unknown transport protocol: {0}")]
    UnknownProtocol(String),
    #[error("Invalid port: {0}")]
    InvalidPort(String),
    #[error("Invalid IP address: {0}")]
    InvalidIp(String),
    #[error("Invalid interface alias: {0:?}")]
    InvalidAlias(String),
}

/// Transport protocol used to reach a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl FromStr for TransportProtocol {
    type Err = NetError;

    /// Protocol identifiers are matched case-insensitively ("TCP" == "tcp").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(TransportProtocol::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(TransportProtocol::Udp)
        } else {
            Err(NetError::UnknownProtocol(s.to_string()))
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => f.write_str("tcp"),
            TransportProtocol::Udp => f.write_str("udp"),
        }
    }
}

/// A VPN server endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: TransportProtocol,
}

impl RelayEndpoint {
    pub fn new(ip: IpAddr, port: u16, protocol: TransportProtocol) -> Self {
        Self { ip, port, protocol }
    }

    /// Build an endpoint from the textual forms used on the command line.
    ///
    /// Port 0 is rejected; the valid range is 1..=65535.
    pub fn parse(ip: &str, port: &str, protocol: &str) -> Result<Self, NetError> {
        let ip = ip
            .trim()
            .parse()
            .map_err(|_| NetError::InvalidIp(ip.to_string()))?;
        let port = match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => return Err(NetError::InvalidPort(port.to_string())),
        };
        let protocol = protocol.trim().parse()?;
        Ok(Self { ip, port, protocol })
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}/{}", ip, self.port, self.protocol),
            IpAddr::V6(ip) => write!(f, "[{}]:{}/{}", ip, self.port, self.protocol),
        }
    }
}

/// Per-connection security settings, fixed for the lifetime of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub permit_dhcp: bool,
    pub permit_lan: bool,
}

/// Parse a `yes`/`no` flag, ignoring case
pub fn parse_yes_no(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if value.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        None
    }
}

/// Longest interface name the OS accepts (IFNAMSIZ - 1 on Unix)
#[cfg(not(target_os = "windows"))]
pub const MAX_ALIAS_LEN: usize = 15;
#[cfg(target_os = "windows")]
pub const MAX_ALIAS_LEN: usize = 256;

fn is_alias_char(c: char) -> bool {
    if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
        return true;
    }
    // Adapter friendly names such as "OpenVPN TAP-Windows6 (2)"
    cfg!(target_os = "windows") && matches!(c, ' ' | '(' | ')' | '#')
}

/// Check a tunnel interface alias before it is written into firewall scripts.
///
/// Quotes, `$`, `;` and anything else that could end a quoted string in nft,
/// pf or PowerShell are rejected.
pub fn validate_interface_alias(alias: &str) -> Result<&str, NetError> {
    if alias.is_empty() || alias.len() > MAX_ALIAS_LEN || !alias.chars().all(is_alias_char) {
        return Err(NetError::InvalidAlias(alias.to_string()));
    }
    Ok(alias)
}
