//! Tunnel states and the notifications emitted on transitions

use crate::net::{RelayEndpoint, SecuritySettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Why the daemon is blocking all traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BlockReason {
    /// An explicit `block` command
    Requested,
    /// Daemon started with `block_on_startup`
    StartupDefault,
    /// Tunnel disconnected while `block_when_disconnected` is set
    BlockWhenDisconnected,
    PolicyApplyFailed(String),
    ProcessSpawnFailed(String),
    ProcessCrashed(String),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Requested => f.write_str("requested"),
            BlockReason::StartupDefault => f.write_str("blocked on startup"),
            BlockReason::BlockWhenDisconnected => f.write_str("blocked while disconnected"),
            BlockReason::PolicyApplyFailed(msg) => write!(f, "policy apply failed: {}", msg),
            BlockReason::ProcessSpawnFailed(msg) => write!(f, "process spawn failed: {}", msg),
            BlockReason::ProcessCrashed(msg) => write!(f, "process crashed: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected,
    Connecting {
        relay: RelayEndpoint,
        settings: SecuritySettings,
    },
    Connected {
        relay: RelayEndpoint,
        settings: SecuritySettings,
        tunnel_alias: String,
        dns_servers: Vec<IpAddr>,
    },
    Disconnecting,
    Blocked {
        reason: BlockReason,
    },
}

impl TunnelState {
    pub fn name(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting { .. } => "connecting",
            TunnelState::Connected { .. } => "connected",
            TunnelState::Disconnecting => "disconnecting",
            TunnelState::Blocked { .. } => "blocked",
        }
    }

    /// The relay in use, if a connection is in progress or established
    pub fn relay(&self) -> Option<&RelayEndpoint> {
        match self {
            TunnelState::Connecting { relay, .. } | TunnelState::Connected { relay, .. } => {
                Some(relay)
            }
            _ => None,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Connecting { relay, .. } => write!(f, "connecting to {}", relay),
            TunnelState::Connected {
                relay,
                tunnel_alias,
                ..
            } => write!(f, "connected to {} via {}", relay, tunnel_alias),
            TunnelState::Blocked { reason } => write!(f, "blocked ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Category of an error reported to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PolicyApply,
    ProcessSpawn,
    ProcessCrashed,
}

/// Emitted by the state machine; `sequence` increases by one per notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    StateChanged {
        sequence: u64,
        state: TunnelState,
    },
    Error {
        sequence: u64,
        code: ErrorCode,
        message: String,
    },
}

impl Notification {
    pub fn sequence(&self) -> u64 {
        match self {
            Notification::StateChanged { sequence, .. } | Notification::Error { sequence, .. } => {
                *sequence
            }
        }
    }
}

/// Receives every notification, in order, from the state machine thread
pub trait EventListener: Send + Sync {
    fn notify(&self, notification: &Notification);
}
