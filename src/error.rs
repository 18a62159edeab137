//! Crate-wide error type

use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::firewall::FirewallError;
use crate::openvpn::plugin::PluginError;
use crate::openvpn::{FrameError, SupervisorError};
use crate::rpc::RpcError;
use crate::tunnel::CommandError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Policy apply failed: {0}")]
    PolicyApply(String),
    #[error("Process spawn failed: {0}")]
    ProcessSpawn(String),
    #[error("Tunnel process crashed: {0}")]
    ProcessCrashed(String),
    #[error("Unknown subcommand: {0}")]
    UnknownSubcommand(String),
    #[error("Missing argument: {0}")]
    MissingArgument(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("RPC transport error: {0}")]
    RpcTransport(String),
    #[error("Plugin callback failed: {0}")]
    Plugin(#[from] PluginError),
    #[error("Command rejected: {0}")]
    Command(#[from] CommandError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::UnknownSubcommand(name) => Error::UnknownSubcommand(name),
            DispatchError::MissingArgument(key) => Error::MissingArgument(key),
            DispatchError::Failed(reason) => Error::PolicyApply(reason),
            other => Error::InvalidArgument(other.to_string()),
        }
    }
}

impl From<FirewallError> for Error {
    fn from(e: FirewallError) -> Self {
        Error::PolicyApply(e.to_string())
    }
}

impl From<SupervisorError> for Error {
    fn from(e: SupervisorError) -> Self {
        Error::ProcessSpawn(e.to_string())
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::RpcTransport(e.to_string())
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Io(e) => Error::Io(e),
            RpcError::Remote { code, message } => match code.as_str() {
                "policy_apply" => Error::PolicyApply(message),
                "process_spawn" => Error::ProcessSpawn(message),
                "invalid_params" | "invalid_state" => Error::InvalidArgument(message),
                _ => Error::RpcTransport(format!("{}: {}", code, message)),
            },
            other => Error::RpcTransport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
