//! Windows resolver via the DnsClient PowerShell module

use super::{DnsBackend, DnsError, run_with_stdin};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use tracing::info;

const POWERSHELL_ARGS: &[&str] = &["-NoProfile", "-NonInteractive", "-Command", "-"];

pub struct DnsClient {
    /// Adapter whose servers we set
    alias: Mutex<Option<String>>,
}

impl DnsClient {
    pub fn new() -> Self {
        Self {
            alias: Mutex::new(None),
        }
    }
}

impl Default for DnsClient {
    fn default() -> Self {
        Self::new()
    }
}

pub fn render_set(alias: &str, servers: &[IpAddr]) -> String {
    let servers = servers
        .iter()
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "$ErrorActionPreference = 'Stop'\nSet-DnsClientServerAddress -InterfaceAlias '{}' -ServerAddresses ({})\nClear-DnsClientCache\n",
        alias, servers
    )
}

/// The adapter may already be gone, taking its settings with it
pub fn render_reset(alias: &str) -> String {
    format!(
        "$ErrorActionPreference = 'Stop'\nif (Get-NetAdapter -Name '{0}' -IncludeHidden -ErrorAction SilentlyContinue) {{ Set-DnsClientServerAddress -InterfaceAlias '{0}' -ResetServerAddresses }}\nClear-DnsClientCache\n",
        alias
    )
}

impl DnsBackend for DnsClient {
    fn set(&self, tunnel_alias: &str, servers: &[IpAddr]) -> Result<(), DnsError> {
        let mut alias = self.alias.lock().unwrap_or_else(PoisonError::into_inner);
        run_with_stdin("powershell", POWERSHELL_ARGS, &render_set(tunnel_alias, servers))?;
        *alias = Some(tunnel_alias.to_string());
        info!("Resolver set to {:?} on {}", servers, tunnel_alias);
        Ok(())
    }

    fn reset(&self) -> Result<(), DnsError> {
        let mut alias = self.alias.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(name) = alias.as_ref() {
            run_with_stdin("powershell", POWERSHELL_ARGS, &render_reset(name))?;
            info!("Reset resolver on {}", name);
            *alias = None;
        }
        Ok(())
    }
}
