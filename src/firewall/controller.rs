//! Applies firewall policies through a platform backend

use super::{FirewallBackend, FirewallError, FirewallPolicy, PermitRule};
use crate::dns::DnsBackend;
use std::net::IpAddr;
use tracing::{error, info, warn};

/// Owns the backend and remembers the last successfully applied policy.
///
/// With a resolver backend attached, the system resolver follows the policy:
/// set to the tunnel's servers under `Connected`, restored under anything else.
pub struct FirewallController {
    backend: Box<dyn FirewallBackend>,
    dns: Option<Box<dyn DnsBackend>>,
    dns_active: bool,
    active: Option<FirewallPolicy>,
}

impl FirewallController {
    pub fn new(backend: Box<dyn FirewallBackend>) -> Self {
        Self {
            backend,
            dns: None,
            dns_active: false,
            active: None,
        }
    }

    pub fn with_dns(mut self, dns: Box<dyn DnsBackend>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Replace the active rule set with `policy`.
    ///
    /// Re-applying the active policy goes through the backend again and has
    /// the same effect. On failure the remembered policy is left untouched.
    pub fn apply(&mut self, policy: &FirewallPolicy) -> Result<(), FirewallError> {
        let result = match policy {
            FirewallPolicy::Reset => self.backend.remove_all_managed_rules(),
            _ => self.backend.apply_rules(policy.rules()),
        }
        .and_then(|()| self.sync_dns(policy));

        match result {
            Ok(()) => {
                info!(
                    "Applied {} policy ({} rules)",
                    policy.name(),
                    policy.rules().len()
                );
                self.active = Some(policy.clone());
                Ok(())
            }
            Err(e) => {
                error!("Failed to apply {} policy: {}", policy.name(), e);
                Err(e)
            }
        }
    }

    /// Shorthand for applying [`FirewallPolicy::Reset`]
    pub fn reset(&mut self) -> Result<(), FirewallError> {
        self.apply(&FirewallPolicy::Reset)
    }

    pub fn active_policy(&self) -> Option<&FirewallPolicy> {
        self.active.as_ref()
    }

    /// Runs after the rules are in place, so DNS never points at servers the
    /// firewall does not admit yet. A failed restore is logged, not returned.
    fn sync_dns(&mut self, policy: &FirewallPolicy) -> Result<(), FirewallError> {
        let Some(dns) = &self.dns else {
            return Ok(());
        };

        if let Some((alias, servers)) = tunnel_dns(policy) {
            dns.set(alias, &servers)?;
            self.dns_active = true;
            return Ok(());
        }

        if self.dns_active {
            if let Err(e) = dns.reset() {
                warn!("Failed to reset DNS settings: {}", e);
            }
            self.dns_active = false;
        }
        Ok(())
    }
}

/// Tunnel alias and pushed servers of a `Connected` policy
fn tunnel_dns(policy: &FirewallPolicy) -> Option<(&str, Vec<IpAddr>)> {
    let FirewallPolicy::Connected { rules } = policy else {
        return None;
    };
    let alias = rules.iter().find_map(|rule| match rule {
        PermitRule::TunnelInterface { alias } => Some(alias.as_str()),
        _ => None,
    })?;
    let servers: Vec<IpAddr> = rules
        .iter()
        .filter_map(|rule| match rule {
            PermitRule::Dns { server, .. } => Some(*server),
            _ => None,
        })
        .collect();
    (!servers.is_empty()).then_some((alias, servers))
}
