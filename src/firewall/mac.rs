//! macOS packet filter (pf) backend
//!
//! Rules are loaded into the `vpnd` anchor, which `pfctl -a` replaces as a
//! whole. The main ruleset must reference the anchor (`anchor "vpnd"` in
//! /etc/pf.conf); applying fails while it does not, since pf would never
//! evaluate the rules. The anchor ends in `block drop quick all`.

use super::policy::{LAN_NETS_V4, LAN_NETS_V6};
use super::{FirewallBackend, FirewallError, MANAGED_TAG, PermitRule, run_with_stdin};
use std::net::IpAddr;
use std::process::Command;
use tracing::debug;

pub struct PfFirewall;

impl PfFirewall {
    pub fn new() -> Self {
        Self
    }

    /// Refuse to load an anchor the main ruleset never evaluates
    fn ensure_anchor_referenced(&self) -> Result<(), FirewallError> {
        let anchors = pfctl(&["-s", "Anchors"])?;
        if anchor_listed(&anchors) {
            return Ok(());
        }
        Err(FirewallError::Rejected {
            program: "pfctl".to_string(),
            stderr: format!(
                "anchor \"{0}\" is not referenced from the main ruleset; add `anchor \"{0}\"` to /etc/pf.conf",
                MANAGED_TAG
            ),
        })
    }

    fn enable_pf(&self) {
        // -E takes a reference on pf; fails harmlessly if already enabled
        match Command::new("pfctl").arg("-E").output() {
            Ok(output) => debug!("pfctl -E exited with {}", output.status),
            Err(e) => debug!("pfctl -E failed: {}", e),
        }
    }
}

impl Default for PfFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallBackend for PfFirewall {
    fn apply_rules(&self, rules: &[PermitRule]) -> Result<(), FirewallError> {
        self.ensure_anchor_referenced()?;
        run_with_stdin("pfctl", &["-a", MANAGED_TAG, "-f", "-"], &render_anchor(rules))?;
        self.enable_pf();
        Ok(())
    }

    fn remove_all_managed_rules(&self) -> Result<(), FirewallError> {
        pfctl(&["-a", MANAGED_TAG, "-F", "rules"])?;
        Ok(())
    }
}

/// Run pfctl and return its stdout; non-zero exit becomes `Rejected`
fn pfctl(args: &[&str]) -> Result<String, FirewallError> {
    let output = Command::new("pfctl")
        .args(args)
        .output()
        .map_err(|e| FirewallError::Spawn {
            program: "pfctl".to_string(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FirewallError::Rejected {
            program: "pfctl".to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether `pfctl -s Anchors` output lists the daemon's top-level anchor
pub fn anchor_listed(anchors: &str) -> bool {
    anchors.lines().any(|line| line.trim() == MANAGED_TAG)
}

fn inet(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "inet",
        IpAddr::V6(_) => "inet6",
    }
}

fn render_rule(rule: &PermitRule) -> Vec<String> {
    match rule {
        PermitRule::Loopback => vec!["pass quick on lo0 all flags any keep state".into()],
        PermitRule::Dhcp => vec![
            "pass out quick inet proto udp from any port 68 to any port 67 keep state".into(),
            "pass in quick inet proto udp from any port 67 to any port 68 keep state".into(),
            "pass out quick inet6 proto udp from any port 546 to any port 547 keep state".into(),
            "pass in quick inet6 proto udp from any port 547 to any port 546 keep state".into(),
        ],
        PermitRule::Lan => {
            let v4 = LAN_NETS_V4.join(", ");
            let v6 = LAN_NETS_V6.join(", ");
            vec![
                format!("pass out quick inet from any to {{ {} }} keep state", v4),
                format!("pass in quick inet from {{ {} }} to any keep state", v4),
                format!("pass out quick inet6 from any to {{ {} }} keep state", v6),
                format!("pass in quick inet6 from {{ {} }} to any keep state", v6),
            ]
        }
        PermitRule::Relay(relay) => vec![format!(
            "pass out quick {} proto {} from any to {} port {} keep state",
            inet(&relay.ip),
            relay.protocol,
            relay.ip,
            relay.port
        )],
        PermitRule::Dns {
            server,
            tunnel_alias,
        } => vec![format!(
            "pass out quick on {} {} proto {{ tcp, udp }} from any to {} port 53 keep state",
            tunnel_alias,
            inet(server),
            server
        )],
        PermitRule::TunnelInterface { alias } => vec![
            format!(
                "block drop out quick on {} proto {{ tcp, udp }} from any to any port 53",
                alias
            ),
            format!("pass quick on {} all keep state", alias),
        ],
    }
}

/// Render the anchor contents for `rules`
pub fn render_anchor(rules: &[PermitRule]) -> String {
    let mut anchor = String::new();
    for rule in rules {
        for line in render_rule(rule) {
            anchor.push_str(&line);
            anchor.push('\n');
        }
    }
    anchor.push_str("block drop quick all\n");
    anchor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::FirewallPolicy;
    use crate::net::RelayEndpoint;

    #[test]
    fn test_render_blocked_anchor() {
        let anchor = render_anchor(FirewallPolicy::blocked().rules());
        assert_eq!(
            anchor,
            "pass quick on lo0 all flags any keep state\nblock drop quick all\n"
        );
    }

    #[test]
    fn test_render_relay() {
        let relay = RelayEndpoint::parse("1.2.3.4", "1300", "udp").unwrap();
        let anchor = render_anchor(&[PermitRule::Relay(relay)]);
        assert!(anchor.contains("pass out quick inet proto udp from any to 1.2.3.4 port 1300"));
        assert!(anchor.ends_with("block drop quick all\n"));
    }

    #[test]
    fn test_anchor_listed() {
        assert!(anchor_listed("  com.apple\n  vpnd\n"));
        assert!(!anchor_listed("  com.apple\n"));
        assert!(!anchor_listed("  com.apple/vpnd\n  vpnd.old\n"));
        assert!(!anchor_listed(""));
    }

    #[test]
    fn test_mac_backend_creation() {
        let _manager = PfFirewall::new();
        let _default = PfFirewall::default();
    }
}
