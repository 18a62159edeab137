//! Settings that clients can change while the daemon runs
//!
//! Shared by the RPC gateway and the tunnel supervisor. Changes are written
//! back to the config file the daemon was started from, so they survive a
//! restart; they apply to the next connection attempt.

use crate::config::{Config, ConfigError, GeoLocation};
use crate::net::{RelayEndpoint, SecuritySettings};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

#[derive(Debug)]
pub struct SettingsStore {
    config: RwLock<Config>,
    /// Where changes are persisted; in-memory only when `None`
    path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            config: RwLock::new(config),
            path,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Config) -> T) -> T {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        f(&config)
    }

    /// Apply `change` to a copy, validate and persist it, then publish it
    fn update(&self, change: impl FnOnce(&mut Config)) -> Result<(), ConfigError> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = config.clone();
        change(&mut next);
        next.validate()?;

        match &self.path {
            Some(path) => {
                next.save(path)?;
                debug!("Saved settings to {}", path.display());
            }
            None => debug!("No config path; settings change is not persisted"),
        }
        *config = next;
        Ok(())
    }

    /// Defaults for connect requests that carry no settings
    pub fn security(&self) -> SecuritySettings {
        self.read(|c| c.security)
    }

    pub fn allow_lan(&self) -> bool {
        self.read(|c| c.security.permit_lan)
    }

    pub fn set_allow_lan(&self, allow_lan: bool) -> Result<(), ConfigError> {
        self.update(|c| c.security.permit_lan = allow_lan)?;
        info!(
            "Local network sharing set to {}",
            if allow_lan { "allow" } else { "block" }
        );
        Ok(())
    }

    pub fn mssfix(&self) -> Option<u16> {
        self.read(|c| c.openvpn.mssfix)
    }

    pub fn set_mssfix(&self, mssfix: Option<u16>) -> Result<(), ConfigError> {
        self.update(|c| c.openvpn.mssfix = mssfix)?;
        match mssfix {
            Some(value) => info!("OpenVPN mssfix set to {}", value),
            None => info!("OpenVPN mssfix cleared"),
        }
        Ok(())
    }

    pub fn locate(&self, relay: &RelayEndpoint) -> GeoLocation {
        self.read(|c| c.locate(relay))
    }
}
