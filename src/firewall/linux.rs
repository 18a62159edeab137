//! Linux nftables backend
//!
//! All rules live in the `inet vpnd` table. A policy is loaded as one `nft -f`
//! transaction that creates the table if needed, deletes it and recreates it
//! with the new chains, so the kernel switches from the old rule set to the new
//! one in a single commit.

use super::policy::{LAN_NETS_V4, LAN_NETS_V6};
use super::{FirewallBackend, FirewallError, MANAGED_TAG, PermitRule, run_with_stdin};
use crate::net::TransportProtocol;
use std::net::IpAddr;

pub struct NftablesFirewall;

impl NftablesFirewall {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NftablesFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallBackend for NftablesFirewall {
    fn apply_rules(&self, rules: &[PermitRule]) -> Result<(), FirewallError> {
        run_with_stdin("nft", &["-f", "-"], &render_ruleset(rules))
    }

    fn remove_all_managed_rules(&self) -> Result<(), FirewallError> {
        run_with_stdin("nft", &["-f", "-"], &render_reset())
    }
}

fn family(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "ip",
        IpAddr::V6(_) => "ip6",
    }
}

fn proto(protocol: TransportProtocol) -> &'static str {
    match protocol {
        TransportProtocol::Tcp => "tcp",
        TransportProtocol::Udp => "udp",
    }
}

/// Output and input chain statements for one rule
fn render_rule(rule: &PermitRule) -> (Vec<String>, Vec<String>) {
    match rule {
        PermitRule::Loopback => (
            vec!["oifname \"lo\" accept".into()],
            vec!["iifname \"lo\" accept".into()],
        ),
        PermitRule::Dhcp => (
            vec![
                "udp sport 68 udp dport 67 accept".into(),
                "udp sport 546 udp dport 547 accept".into(),
            ],
            vec![
                "udp sport 67 udp dport 68 accept".into(),
                "udp sport 547 udp dport 546 accept".into(),
            ],
        ),
        PermitRule::Lan => {
            let v4 = LAN_NETS_V4.join(", ");
            let v6 = LAN_NETS_V6.join(", ");
            (
                vec![
                    format!("ip daddr {{ {} }} accept", v4),
                    format!("ip6 daddr {{ {} }} accept", v6),
                ],
                vec![
                    format!("ip saddr {{ {} }} accept", v4),
                    format!("ip6 saddr {{ {} }} accept", v6),
                ],
            )
        }
        PermitRule::Relay(relay) => (
            vec![format!(
                "{} daddr {} {} dport {} accept",
                family(&relay.ip),
                relay.ip,
                proto(relay.protocol),
                relay.port
            )],
            vec![],
        ),
        PermitRule::Dns {
            server,
            tunnel_alias,
        } => (
            ["udp", "tcp"]
                .iter()
                .map(|p| {
                    format!(
                        "oifname \"{}\" {} daddr {} {} dport 53 accept",
                        tunnel_alias,
                        family(server),
                        server,
                        p
                    )
                })
                .collect(),
            vec![],
        ),
        PermitRule::TunnelInterface { alias } => (
            vec![
                format!("oifname \"{}\" udp dport 53 drop", alias),
                format!("oifname \"{}\" tcp dport 53 drop", alias),
                format!("oifname \"{}\" accept", alias),
            ],
            vec![format!("iifname \"{}\" accept", alias)],
        ),
    }
}

fn chain(out: &mut String, name: &str, hook: &str, statements: &[String]) {
    out.push_str(&format!("    chain {} {{\n", name));
    out.push_str(&format!(
        "        type filter hook {} priority 0; policy drop;\n",
        hook
    ));
    for statement in statements {
        out.push_str("        ");
        out.push_str(statement);
        out.push('\n');
    }
    out.push_str("    }\n");
}

/// Render a complete replacement transaction for `rules`
pub fn render_ruleset(rules: &[PermitRule]) -> String {
    let mut output = Vec::new();
    let mut input = Vec::new();

    // Replies to connections we permitted; pointless when only loopback is open
    if rules.iter().any(|r| *r != PermitRule::Loopback) {
        input.push("ct state established,related accept".to_string());
    }

    for rule in rules {
        let (o, i) = render_rule(rule);
        output.extend(o);
        input.extend(i);
    }

    let mut script = render_reset();
    script.push_str(&format!("table inet {} {{\n", MANAGED_TAG));
    chain(&mut script, "output", "output", &output);
    chain(&mut script, "input", "input", &input);
    script.push_str("}\n");
    script
}

/// Render a transaction deleting the managed table
pub fn render_reset() -> String {
    format!(
        "table inet {tag} {{}}\ndelete table inet {tag}\n",
        tag = MANAGED_TAG
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::FirewallPolicy;
    use crate::net::{RelayEndpoint, SecuritySettings};

    #[test]
    fn test_render_reset_only_touches_managed_table() {
        let script = render_reset();
        assert_eq!(script, "table inet vpnd {}\ndelete table inet vpnd\n");
    }

    #[test]
    fn test_render_blocked() {
        let script = render_ruleset(FirewallPolicy::blocked().rules());

        assert!(script.starts_with("table inet vpnd {}\ndelete table inet vpnd\n"));
        assert!(script.contains("policy drop;"));
        assert!(script.contains("oifname \"lo\" accept"));
        assert!(script.contains("iifname \"lo\" accept"));
        assert!(!script.contains("ct state"));
        assert!(!script.contains("dport"));
    }

    #[test]
    fn test_render_connected() {
        let relay = RelayEndpoint::parse("1.2.3.4", "1300", "udp").unwrap();
        let settings = SecuritySettings {
            permit_dhcp: true,
            permit_lan: false,
        };
        let dns = vec!["10.8.0.1".parse().unwrap()];
        let policy = FirewallPolicy::connected(&relay, &settings, "tun0", &dns);

        let script = render_ruleset(policy.rules());

        assert!(script.contains("ip daddr 1.2.3.4 udp dport 1300 accept"));
        assert!(script.contains("udp sport 68 udp dport 67 accept"));
        assert!(script.contains("oifname \"tun0\" ip daddr 10.8.0.1 udp dport 53 accept"));
        assert!(script.contains("oifname \"tun0\" udp dport 53 drop"));
        assert!(script.contains("ct state established,related accept"));
        assert!(!script.contains("192.168.0.0/16"));

        // DNS permits must precede the tunnel's DNS drop
        let permit = script.find("10.8.0.1 udp dport 53 accept").unwrap();
        let drop = script.find("\"tun0\" udp dport 53 drop").unwrap();
        assert!(permit < drop);
    }

    #[test]
    fn test_render_ipv6_relay() {
        let relay = RelayEndpoint::parse("2001:db8::1", "443", "tcp").unwrap();
        let script = render_ruleset(&[PermitRule::Relay(relay)]);
        assert!(script.contains("ip6 daddr 2001:db8::1 tcp dport 443 accept"));
    }

    #[test]
    fn test_linux_backend_creation() {
        let _manager = NftablesFirewall::new();
        let _default = NftablesFirewall::default();
    }
}
