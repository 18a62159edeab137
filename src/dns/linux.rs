//! resolv.conf rewriting
//!
//! The file as found before the first change is kept in memory and written
//! back on reset. Lines other than `nameserver` (search domains, options) are
//! carried over into the rewritten file.

use super::{DnsBackend, DnsError};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

pub const RESOLV_CONF: &str = "/etc/resolv.conf";

pub struct ResolvConf {
    path: PathBuf,
    /// Original contents while ours are in place
    saved: Mutex<Option<String>>,
}

impl ResolvConf {
    pub fn new() -> Self {
        Self::with_path(RESOLV_CONF)
    }

    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            saved: Mutex::new(None),
        }
    }

    fn file_err(&self, source: std::io::Error) -> DnsError {
        DnsError::File {
            path: self.path.clone(),
            source,
        }
    }

    fn read(&self) -> Result<String, DnsError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(self.file_err(e)),
        }
    }

    fn write(&self, contents: &str) -> Result<(), DnsError> {
        std::fs::write(&self.path, contents).map_err(|e| self.file_err(e))
    }
}

impl Default for ResolvConf {
    fn default() -> Self {
        Self::new()
    }
}

/// `original` with its nameservers replaced by `servers`
pub fn render(original: &str, servers: &[IpAddr]) -> String {
    let mut contents = String::from("# Generated by vpnd while the tunnel is up\n");
    for server in servers {
        contents.push_str(&format!("nameserver {}\n", server));
    }
    for line in original.lines() {
        if line.trim_start().starts_with("nameserver") {
            continue;
        }
        contents.push_str(line);
        contents.push('\n');
    }
    contents
}

impl DnsBackend for ResolvConf {
    fn set(&self, _tunnel_alias: &str, servers: &[IpAddr]) -> Result<(), DnsError> {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        let original = match saved.as_ref() {
            Some(original) => original.clone(),
            None => {
                let current = self.read()?;
                debug!("Saved {} ({} bytes)", self.path.display(), current.len());
                *saved = Some(current.clone());
                current
            }
        };

        self.write(&render(&original, servers))?;
        info!("Resolver set to {:?} in {}", servers, self.path.display());
        Ok(())
    }

    fn reset(&self) -> Result<(), DnsError> {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(original) = saved.as_ref() {
            self.write(original)?;
            *saved = None;
            info!("Restored {}", self.path.display());
        }
        Ok(())
    }
}
