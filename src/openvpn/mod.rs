//! OpenVPN process supervision
//!
//! The daemon spawns OpenVPN with its own binary configured as the `--up`,
//! `--route-up` and `--down` script. OpenVPN runs that script as
//! `vpnd plugin`, which forwards the lifecycle callback to the daemon over a
//! loopback TCP connection.
//!
//! # Lifecycle
//!
//! | OpenVPN `script_type` | Event |
//! |-----------------------|-------|
//! | `up` | [`ProcessEvent::Up`] with the tunnel device and pushed DNS |
//! | `route-up` | [`ProcessEvent::RouteUp`] |
//! | `down` | process shutdown begins; [`ProcessEvent::Down`] follows on exit |

pub mod args;
pub mod frame;
pub mod listener;
pub mod plugin;
pub mod supervisor;

pub use frame::{FrameError, read_frame, write_frame};
pub use listener::PluginListener;
pub use plugin::{PluginEnv, PluginMessage, run_plugin};
pub use supervisor::{OpenVpnSupervisor, SupervisorOptions};

use crate::net::RelayEndpoint;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Identifies one spawned tunnel process for the lifetime of the daemon
pub type ProcessId = u64;

/// Environment variable carrying the plugin listener address
pub const PLUGIN_ADDR_ENV: &str = "VPND_PLUGIN_ADDR";
/// Environment variable carrying the per-process token
pub const PROCESS_TOKEN_ENV: &str = "VPND_PROCESS_TOKEN";

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("A tunnel process is already running")]
    AlreadyRunning,
    #[error("Failed to spawn tunnel process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why the tunnel process went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownCause {
    /// The daemon asked it to stop
    Requested,
    /// OpenVPN reported the tunnel down before exiting
    TunnelDown,
    /// Exited without being asked; carries the exit status
    Crashed(String),
}

impl fmt::Display for DownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownCause::Requested => f.write_str("requested"),
            DownCause::TunnelDown => f.write_str("tunnel down"),
            DownCause::Crashed(status) => write!(f, "crashed: {}", status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Up {
        tunnel_alias: String,
        dns_servers: Vec<IpAddr>,
    },
    RouteUp,
    /// Emitted exactly once per process, after it has exited
    Down(DownCause),
}

/// Owns the tunnel process on behalf of the state machine
pub trait TunnelSupervisor: Send {
    /// Start a process for `relay`; fails if one is still active
    fn spawn(&mut self, relay: &RelayEndpoint) -> Result<ProcessId, SupervisorError>;

    /// Ask the current process to terminate; no-op when none is running
    fn cancel(&mut self);

    /// True until the last spawned process has exited
    fn is_active(&self) -> bool;

    /// Block until the current process has exited or `timeout` elapses
    fn wait_for_exit(&mut self, timeout: Duration);
}
