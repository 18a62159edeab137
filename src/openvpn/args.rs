//! OpenVPN command line construction

use super::{PLUGIN_ADDR_ENV, PROCESS_TOKEN_ENV};
use crate::net::{RelayEndpoint, TransportProtocol};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Everything needed to start one tunnel process
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub relay: &'a RelayEndpoint,
    /// Binary OpenVPN runs for `--up`, `--route-up` and `--down`
    pub plugin_binary: &'a Path,
    pub plugin_addr: SocketAddr,
    pub token: &'a str,
    /// Provider configuration with certificates and credentials
    pub config_file: Option<&'a PathBuf>,
    pub mssfix: Option<u16>,
    pub extra_args: &'a [String],
}

fn proto_arg(protocol: TransportProtocol) -> &'static str {
    match protocol {
        TransportProtocol::Udp => "udp",
        TransportProtocol::Tcp => "tcp-client",
    }
}

/// Quote a path for OpenVPN's script command parser
fn script_command(binary: &Path) -> String {
    let path = binary.display().to_string().replace('"', "\\\"");
    format!("\"{}\" plugin", path)
}

pub fn build_args(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if let Some(config) = spec.config_file {
        args.push("--config".into());
        args.push(config.display().to_string());
    }

    let script = script_command(spec.plugin_binary);
    args.extend(
        [
            "--client",
            "--dev",
            "tun",
            "--nobind",
            "--persist-key",
            "--proto",
            proto_arg(spec.relay.protocol),
            "--remote",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(spec.relay.ip.to_string());
    args.push(spec.relay.port.to_string());

    // Reconnect loops would hide failures from the state machine
    args.extend(["--connect-retry-max", "1"].iter().map(|s| s.to_string()));

    args.extend(["--script-security", "2"].iter().map(|s| s.to_string()));
    for hook in ["--up", "--route-up", "--down"] {
        args.push(hook.to_string());
        args.push(script.clone());
    }

    args.push("--setenv".into());
    args.push(PLUGIN_ADDR_ENV.into());
    args.push(spec.plugin_addr.to_string());
    args.push("--setenv".into());
    args.push(PROCESS_TOKEN_ENV.into());
    args.push(spec.token.to_string());

    if let Some(mssfix) = spec.mssfix {
        args.push("--mssfix".into());
        args.push(mssfix.to_string());
    }

    args.extend(spec.extra_args.iter().cloned());
    args
}
