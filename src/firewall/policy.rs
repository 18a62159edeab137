//! Translation from tunnel state to firewall policy

use crate::net::{RelayEndpoint, SecuritySettings};
use crate::tunnel::TunnelState;
use std::fmt;
use std::net::IpAddr;

/// IPv4 networks considered "local" when LAN access is permitted
pub const LAN_NETS_V4: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "224.0.0.0/24",
];

/// IPv6 networks considered "local" when LAN access is permitted
pub const LAN_NETS_V6: &[&str] = &["fe80::/10", "fc00::/7", "ff02::/16"];

/// A single permit rule. Anything not matched by some rule is denied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PermitRule {
    /// Traffic on the loopback interface
    Loopback,
    /// DHCPv4 (68 -> 67) and DHCPv6 (546 -> 547) client exchanges
    Dhcp,
    /// Traffic to and from private and link-local networks
    Lan,
    /// Outbound traffic to the relay on its port and protocol
    Relay(RelayEndpoint),
    /// DNS (port 53) to `server`, only through the tunnel interface
    Dns { server: IpAddr, tunnel_alias: String },
    /// Everything on the tunnel interface except DNS to unlisted servers
    TunnelInterface { alias: String },
}

impl fmt::Display for PermitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermitRule::Loopback => f.write_str("loopback"),
            PermitRule::Dhcp => f.write_str("dhcp"),
            PermitRule::Lan => f.write_str("lan"),
            PermitRule::Relay(relay) => write!(f, "relay {}", relay),
            PermitRule::Dns { server, tunnel_alias } => {
                write!(f, "dns {} via {}", server, tunnel_alias)
            }
            PermitRule::TunnelInterface { alias } => write!(f, "tunnel {}", alias),
        }
    }
}

/// Declarative firewall policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallPolicy {
    Connecting { rules: Vec<PermitRule> },
    Connected { rules: Vec<PermitRule> },
    Blocked { rules: Vec<PermitRule> },
    /// No daemon-owned rules at all
    Reset,
}

impl FirewallPolicy {
    /// Loopback, optional DHCP/LAN, and the relay
    pub fn connecting(relay: &RelayEndpoint, settings: &SecuritySettings) -> Self {
        FirewallPolicy::Connecting {
            rules: base_rules(relay, settings),
        }
    }

    /// Like `connecting`, plus the tunnel's DNS servers and the tunnel itself
    pub fn connected(
        relay: &RelayEndpoint,
        settings: &SecuritySettings,
        tunnel_alias: &str,
        dns_servers: &[IpAddr],
    ) -> Self {
        let mut rules = base_rules(relay, settings);
        for server in dns_servers {
            rules.push(PermitRule::Dns {
                server: *server,
                tunnel_alias: tunnel_alias.to_string(),
            });
        }
        rules.push(PermitRule::TunnelInterface {
            alias: tunnel_alias.to_string(),
        });
        FirewallPolicy::Connected { rules }
    }

    /// Loopback only
    pub fn blocked() -> Self {
        FirewallPolicy::Blocked {
            rules: vec![PermitRule::Loopback],
        }
    }

    pub fn rules(&self) -> &[PermitRule] {
        match self {
            FirewallPolicy::Connecting { rules }
            | FirewallPolicy::Connected { rules }
            | FirewallPolicy::Blocked { rules } => rules,
            FirewallPolicy::Reset => &[],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FirewallPolicy::Connecting { .. } => "connecting",
            FirewallPolicy::Connected { .. } => "connected",
            FirewallPolicy::Blocked { .. } => "blocked",
            FirewallPolicy::Reset => "reset",
        }
    }
}

fn base_rules(relay: &RelayEndpoint, settings: &SecuritySettings) -> Vec<PermitRule> {
    let mut rules = vec![PermitRule::Loopback];
    if settings.permit_dhcp {
        rules.push(PermitRule::Dhcp);
    }
    if settings.permit_lan {
        rules.push(PermitRule::Lan);
    }
    rules.push(PermitRule::Relay(*relay));
    rules
}

/// Compute the policy that must be active while in `state`.
///
/// `settings` are the security settings of the current connection attempt.
/// `Disconnecting` maps to the blocked policy: the tunnel is going away and
/// nothing may leak while the process shuts down.
pub fn translate(state: &TunnelState, settings: &SecuritySettings) -> FirewallPolicy {
    match state {
        TunnelState::Disconnected => FirewallPolicy::Reset,
        TunnelState::Connecting { relay, .. } => FirewallPolicy::connecting(relay, settings),
        TunnelState::Connected {
            relay,
            tunnel_alias,
            dns_servers,
            ..
        } => FirewallPolicy::connected(relay, settings, tunnel_alias, dns_servers),
        TunnelState::Disconnecting | TunnelState::Blocked { .. } => FirewallPolicy::blocked(),
    }
}
