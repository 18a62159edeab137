//! vpnd - VPN tunnel daemon with a fail-closed kill switch
//!
//! The daemon owns the tunnel's lifecycle, supervises an OpenVPN process and
//! keeps the host firewall in a policy that matches the tunnel state, so no
//! traffic leaks outside the tunnel while it is being set up, torn down or
//! after it fails.
//!
//! # Architecture
//!
//! - `tunnel`: single-writer state machine driving everything else
//! - `firewall`: policy translation and platform backends (nftables, pf,
//!   Windows firewall, in-memory dry run)
//! - `dns`: system resolver set to the tunnel's servers while connected
//! - `openvpn`: process supervision and the plugin callback channel
//! - `rpc`: JSON gateway for clients and the notification stream
//! - `dispatch` / `policy_cli`: local firewall control plane
//! - `config` / `settings`: configuration file handling (TOML) and the
//!   runtime-changeable options persisted back to it
//! - `daemon`: wiring and shutdown
//!
//! # Usage
//!
//! ```bash
//! sudo vpnd daemon
//! vpnd connect --relay 1.2.3.4 --port 1300 --protocol udp --wait
//! ```

pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod firewall;
pub mod net;
pub mod openvpn;
pub mod policy_cli;
pub mod rpc;
pub mod settings;
pub mod token;
pub mod tunnel;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use tunnel::{TunnelHandle, TunnelState};
