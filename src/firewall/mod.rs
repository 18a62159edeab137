//! Firewall kill switch
//!
//! Policies are computed by [`policy::translate`] and pushed to the OS packet
//! filter through a [`FirewallBackend`]. Every backend replaces the complete
//! set of daemon-owned rules in a single operation and only ever touches rules
//! it created itself:
//!
//! | Platform | Mechanism | Ownership tag |
//! |----------|-----------|---------------|
//! | Linux | `nft -f -` transaction | table `inet vpnd` |
//! | macOS | `pfctl -a vpnd -f -` | anchor `vpnd` |
//! | Windows | one PowerShell script, managed block rules | rule group `vpnd` |
//! | any | in-memory (`dry-run`) | n/a |

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(any(target_os = "windows", test))]
mod ranges;

pub mod controller;
pub mod memory;
pub mod policy;

pub use controller::FirewallController;
pub use memory::MemoryFirewall;
pub use policy::{FirewallPolicy, PermitRule, translate};

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// Tag identifying rules owned by this daemon
pub const MANAGED_TAG: &str = "vpnd";

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} rejected the rule set: {stderr}")]
    Rejected { program: String, stderr: String },
    #[error("Simulated firewall failure: {0}")]
    Simulated(String),
    #[error("DNS configuration failed: {0}")]
    Dns(#[from] crate::dns::DnsError),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Platform packet filter interface
///
/// `apply_rules` replaces every daemon-owned rule with `rules` (in order,
/// followed by an implicit deny-all). `remove_all_managed_rules` deletes the
/// daemon-owned rules and leaves everything else alone.
pub trait FirewallBackend: Send {
    fn apply_rules(&self, rules: &[PermitRule]) -> Result<(), FirewallError>;
    fn remove_all_managed_rules(&self) -> Result<(), FirewallError>;
}

/// Which backend the daemon should drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// The packet filter of the running OS
    #[default]
    Native,
    /// Record rules in memory and log them, touching nothing
    DryRun,
}

/// Get the firewall backend for the current platform
pub fn get_firewall_backend(kind: BackendKind) -> Result<Box<dyn FirewallBackend>, FirewallError> {
    if kind == BackendKind::DryRun {
        return Ok(Box::new(MemoryFirewall::new()));
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(mac::PfFirewall::new()))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::NftablesFirewall::new()))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(windows::WindowsFirewall::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        Err(FirewallError::UnsupportedPlatform)
    }
}

/// Run `program` feeding `input` on stdin; non-zero exit becomes `Rejected`
pub(crate) fn run_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), FirewallError> {
    debug!("{} {}\n{}", program, args.join(" "), input);

    let spawn_err = |source| FirewallError::Spawn {
        program: program.to_string(),
        source,
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).map_err(spawn_err)?;
    }

    let output = child.wait_with_output().map_err(spawn_err)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FirewallError::Rejected {
            program: program.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firewall_error_display() {
        let err = FirewallError::Rejected {
            program: "nft".to_string(),
            stderr: "syntax error".to_string(),
        };
        assert_eq!(err.to_string(), "nft rejected the rule set: syntax error");

        let err = FirewallError::UnsupportedPlatform;
        assert_eq!(err.to_string(), "Unsupported platform");
    }

    #[test]
    fn test_dry_run_backend_always_available() {
        let backend = get_firewall_backend(BackendKind::DryRun).unwrap();
        backend.apply_rules(&[PermitRule::Loopback]).unwrap();
        backend.remove_all_managed_rules().unwrap();
    }

    #[test]
    fn test_get_native_backend_returns_ok() {
        #[cfg(any(target_os = "macos", target_os = "linux", target_os = "windows"))]
        {
            assert!(get_firewall_backend(BackendKind::Native).is_ok());
        }
    }

    #[test]
    fn test_backend_kind_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            backend: BackendKind,
        }
        let w: Wrapper = toml::from_str("backend = \"dry-run\"").unwrap();
        assert_eq!(w.backend, BackendKind::DryRun);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_stdin_reports_failure() {
        let result = run_with_stdin("sh", &["-c", "cat >/dev/null; echo denied >&2; exit 1"], "x");
        match result {
            Err(FirewallError::Rejected { program, stderr }) => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "denied");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }

        assert!(run_with_stdin("sh", &["-c", "cat >/dev/null"], "rules").is_ok());
    }
}
