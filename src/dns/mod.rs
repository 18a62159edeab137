//! System resolver configuration
//!
//! While the tunnel is up the resolver points at the servers the relay pushed;
//! the firewall only lets DNS through the tunnel to those servers, so leaving
//! the old resolver in place would break name resolution. Any other policy
//! restores what was there before.
//!
//! | Platform | Mechanism |
//! |----------|-----------|
//! | Linux | rewrites `/etc/resolv.conf`, keeping the original to restore |
//! | macOS | `scutil` on the primary service's `DNS` key |
//! | Windows | `Set-DnsClientServerAddress` on the tunnel adapter |
//! | any | in-memory (`dry-run`) |

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(target_os = "windows")]
pub mod windows;

pub mod memory;

pub use memory::MemoryDns;

use crate::firewall::BackendKind;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} failed: {stderr}")]
    Rejected { program: String, stderr: String },
    #[error("Failed to update {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("No primary network service")]
    NoPrimaryService,
    #[error("Simulated DNS failure: {0}")]
    Simulated(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Platform resolver interface
///
/// `set` may be called repeatedly; `reset` restores the configuration that
/// was in place before the first `set` and is a no-op when nothing was set.
pub trait DnsBackend: Send {
    fn set(&self, tunnel_alias: &str, servers: &[IpAddr]) -> Result<(), DnsError>;
    fn reset(&self) -> Result<(), DnsError>;
}

/// Get the resolver backend matching the firewall backend kind
pub fn get_dns_backend(kind: BackendKind) -> Result<Box<dyn DnsBackend>, DnsError> {
    if kind == BackendKind::DryRun {
        return Ok(Box::new(MemoryDns::new()));
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::ResolvConf::new()))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(mac::Scutil::new()))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(windows::DnsClient::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        Err(DnsError::UnsupportedPlatform)
    }
}

/// Run `program` feeding `input` on stdin and return its stdout
#[cfg(any(target_os = "macos", target_os = "windows"))]
pub(crate) fn run_with_stdin(program: &str, args: &[&str], input: &str) -> Result<String, DnsError> {
    use std::io::Write;
    use std::process::{Command, Stdio};

    tracing::debug!("{} {}\n{}", program, args.join(" "), input);

    let spawn_err = |source| DnsError::Spawn {
        program: program.to_string(),
        source,
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).map_err(spawn_err)?;
    }

    let output = child.wait_with_output().map_err(spawn_err)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DnsError::Rejected {
            program: program.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
