//! Windows firewall backend
//!
//! Rules live in the `vpnd` rule group; the profiles' default actions are
//! never touched. Windows lets any matching allow rule through unless a block
//! rule also matches, and block rules always win, so the deny-all is expressed
//! as managed block rules covering every address the policy does not permit.
//! The allow rules are still added for profiles whose default is block.
//!
//! Each policy is one PowerShell script that adds the new generation of rules
//! before deleting the previous one, so any intermediate state is the union
//! of both and never more permissive than the old policy.
//!
//! With DHCP permitted the catch-all block is split per protocol (TCP, UDP,
//! ICMP) so UDP 68/546 stays open; other IP protocols are then not blocked.

use super::policy::{LAN_NETS_V4, LAN_NETS_V6};
use super::ranges::{IpNet, complement, other_ports};
use super::{FirewallBackend, FirewallError, MANAGED_TAG, PermitRule, run_with_stdin};
use crate::net::{RelayEndpoint, TransportProtocol};
use crate::token::random_token;
use std::net::IpAddr;

const POWERSHELL_ARGS: &[&str] = &["-NoProfile", "-NonInteractive", "-Command", "-"];

const LOOPBACK_NETS: &[&str] = &["127.0.0.0/8", "::1"];

pub struct WindowsFirewall;

impl WindowsFirewall {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WindowsFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallBackend for WindowsFirewall {
    fn apply_rules(&self, rules: &[PermitRule]) -> Result<(), FirewallError> {
        let generation: String = random_token().chars().take(8).collect();
        run_with_stdin("powershell", POWERSHELL_ARGS, &render_script(rules, &generation))
    }

    fn remove_all_managed_rules(&self) -> Result<(), FirewallError> {
        run_with_stdin("powershell", POWERSHELL_ARGS, &render_reset())
    }
}

fn lan_nets() -> impl Iterator<Item = &'static str> {
    LAN_NETS_V4.iter().chain(LAN_NETS_V6.iter()).copied()
}

fn nets<'a>(specs: impl Iterator<Item = &'a str>) -> Vec<IpNet> {
    specs.filter_map(IpNet::parse).collect()
}

fn protocol_name(protocol: TransportProtocol) -> &'static str {
    match protocol {
        TransportProtocol::Udp => "UDP",
        TransportProtocol::Tcp => "TCP",
    }
}

fn icmp_for(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "ICMPv4",
        IpAddr::V6(_) => "ICMPv6",
    }
}

/// What a rule set permits, gathered for building its block rules
#[derive(Default)]
struct Permits<'a> {
    dhcp: bool,
    lan: bool,
    relay: Option<&'a RelayEndpoint>,
    tunnel: Option<&'a str>,
    dns: Vec<IpAddr>,
}

impl<'a> Permits<'a> {
    fn collect(rules: &'a [PermitRule]) -> Self {
        let mut permits = Self::default();
        for rule in rules {
            match rule {
                PermitRule::Loopback => {}
                PermitRule::Dhcp => permits.dhcp = true,
                PermitRule::Lan => permits.lan = true,
                PermitRule::Relay(relay) => permits.relay = Some(relay),
                PermitRule::Dns { server, .. } => permits.dns.push(*server),
                PermitRule::TunnelInterface { alias } => permits.tunnel = Some(alias),
            }
        }
        permits
    }

    fn relay_in_lan(&self, relay: &RelayEndpoint) -> bool {
        self.lan && nets(lan_nets()).iter().any(|n| n.contains(relay.ip))
    }

    /// Interface condition for rules covering everything but the tunnel
    fn outside_tunnel(&self) -> &'static str {
        if self.tunnel.is_some() {
            " -InterfaceAlias $others"
        } else {
            ""
        }
    }
}

fn block_params(permits: &Permits<'_>) -> Vec<String> {
    let mut params = Vec::new();
    let iface = permits.outside_tunnel();

    let mut exempt = nets(LOOPBACK_NETS.iter().copied());
    if permits.lan {
        exempt.extend(nets(lan_nets()));
    }
    if let Some(relay) = permits.relay {
        exempt.push(IpNet::host(relay.ip));
    }
    let rest = complement(&exempt).join(",");

    for direction in ["Outbound", "Inbound"] {
        if permits.dhcp {
            for protocol in ["TCP", "ICMPv4", "ICMPv6"] {
                params.push(format!(
                    "-Direction {}{} -Protocol {} -RemoteAddress {}",
                    direction, iface, protocol, rest
                ));
            }
            params.push(format!(
                "-Direction {}{} -Protocol UDP -LocalPort {} -RemoteAddress {}",
                direction,
                iface,
                other_ports(&[68, 546]),
                rest
            ));
            params.push(format!(
                "-Direction {}{} -Protocol UDP -LocalPort 68,546 -RemotePort {} -RemoteAddress {}",
                direction,
                iface,
                other_ports(&[67, 547]),
                rest
            ));
        } else {
            params.push(format!(
                "-Direction {}{} -RemoteAddress {}",
                direction, iface, rest
            ));
        }
    }

    // The relay address is exempt above; narrow it to its port and protocol
    if let Some(relay) = permits.relay.filter(|r| !permits.relay_in_lan(r)) {
        let other = match relay.protocol {
            TransportProtocol::Udp => TransportProtocol::Tcp,
            TransportProtocol::Tcp => TransportProtocol::Udp,
        };
        params.push(format!(
            "-Direction Outbound{} -Protocol {} -RemotePort {} -RemoteAddress {}",
            iface,
            protocol_name(relay.protocol),
            other_ports(&[relay.port]),
            relay.ip
        ));
        params.push(format!(
            "-Direction Outbound{} -Protocol {} -RemoteAddress {}",
            iface,
            protocol_name(other),
            relay.ip
        ));
        params.push(format!(
            "-Direction Outbound{} -Protocol {} -RemoteAddress {}",
            iface,
            icmp_for(&relay.ip),
            relay.ip
        ));
        params.push(format!("-Direction Inbound{} -RemoteAddress {}", iface, relay.ip));
    }

    // DNS inside the tunnel only to the pushed servers (and LAN if permitted)
    if let Some(alias) = permits.tunnel {
        let mut resolvers: Vec<IpNet> = permits.dns.iter().copied().map(IpNet::host).collect();
        if permits.lan {
            resolvers.extend(nets(lan_nets()));
        }
        let others = complement(&resolvers).join(",");
        for protocol in ["UDP", "TCP"] {
            params.push(format!(
                "-Direction Outbound -InterfaceAlias '{}' -Protocol {} -RemotePort 53 -RemoteAddress {}",
                alias, protocol, others
            ));
        }
    }

    params
}

fn allow_params(rule: &PermitRule) -> Vec<String> {
    let lan = lan_nets().collect::<Vec<_>>().join(",");

    match rule {
        PermitRule::Loopback => vec![
            format!("-Direction Outbound -RemoteAddress {}", LOOPBACK_NETS.join(",")),
            format!("-Direction Inbound -RemoteAddress {}", LOOPBACK_NETS.join(",")),
        ],
        PermitRule::Dhcp => vec![
            "-Direction Outbound -Protocol UDP -LocalPort 68 -RemotePort 67".into(),
            "-Direction Inbound -Protocol UDP -LocalPort 68 -RemotePort 67".into(),
            "-Direction Outbound -Protocol UDP -LocalPort 546 -RemotePort 547".into(),
            "-Direction Inbound -Protocol UDP -LocalPort 546 -RemotePort 547".into(),
        ],
        PermitRule::Lan => vec![
            format!("-Direction Outbound -RemoteAddress {}", lan),
            format!("-Direction Inbound -RemoteAddress {}", lan),
        ],
        PermitRule::Relay(relay) => vec![format!(
            "-Direction Outbound -RemoteAddress {} -Protocol {} -RemotePort {}",
            relay.ip,
            protocol_name(relay.protocol),
            relay.port
        )],
        PermitRule::Dns {
            server,
            tunnel_alias,
        } => ["UDP", "TCP"]
            .iter()
            .map(|p| {
                format!(
                    "-Direction Outbound -InterfaceAlias '{}' -RemoteAddress {} -Protocol {} -RemotePort 53",
                    tunnel_alias, server, p
                )
            })
            .collect(),
        PermitRule::TunnelInterface { alias } => vec![
            format!("-Direction Outbound -InterfaceAlias '{}'", alias),
            format!("-Direction Inbound -InterfaceAlias '{}'", alias),
        ],
    }
}

fn remove_group() -> String {
    format!(
        "Get-NetFirewallRule -Group '{}' -ErrorAction SilentlyContinue | Remove-NetFirewallRule\n",
        MANAGED_TAG
    )
}

/// Render the script replacing the managed rules with `rules`.
///
/// New rules are named `vpnd-<generation>-<n>`; everything else in the group
/// is removed once they are all in place.
pub fn render_script(rules: &[PermitRule], generation: &str) -> String {
    let permits = Permits::collect(rules);
    let prefix = format!("{}-{}-", MANAGED_TAG, generation);

    let mut script = String::from("$ErrorActionPreference = 'Stop'\n");
    script.push_str(
        "$disabled = @(Get-NetFirewallProfile | Where-Object { $_.Enabled -ne 'True' })\n",
    );
    script.push_str(
        "if ($disabled.Count -gt 0) { throw \"Windows Firewall is off for profile(s): $($disabled.Name -join ', ')\" }\n",
    );
    if let Some(alias) = permits.tunnel {
        script.push_str(&format!(
            "$others = @(Get-NetAdapter -IncludeHidden | Where-Object {{ $_.Name -ne '{}' }} | ForEach-Object {{ $_.Name }})\n",
            alias
        ));
    }

    let mut index = 0;
    let mut add = |script: &mut String, action: &str, params: &str| {
        script.push_str(&format!(
            "New-NetFirewallRule -Group '{}' -DisplayName '{}{}' -Action {} {} | Out-Null\n",
            MANAGED_TAG, prefix, index, action, params
        ));
        index += 1;
    };

    // Blocks go in first so a half-applied script errs towards blocking
    let blocks = block_params(&permits);
    if permits.tunnel.is_some() {
        script.push_str("if ($others.Count -gt 0) {\n");
    }
    for params in blocks.iter().filter(|p| p.contains("$others")) {
        add(&mut script, "Block", params);
    }
    if permits.tunnel.is_some() {
        script.push_str("}\n");
    }
    for params in blocks.iter().filter(|p| !p.contains("$others")) {
        add(&mut script, "Block", params);
    }
    for rule in rules {
        for params in allow_params(rule) {
            add(&mut script, "Allow", &params);
        }
    }

    script.push_str(&format!(
        "Get-NetFirewallRule -Group '{}' -ErrorAction SilentlyContinue | Where-Object {{ -not $_.DisplayName.StartsWith('{}') }} | Remove-NetFirewallRule\n",
        MANAGED_TAG, prefix
    ));
    script
}

/// Render the script removing every managed rule
pub fn render_reset() -> String {
    let mut script = String::from("$ErrorActionPreference = 'Stop'\n");
    script.push_str(&remove_group());
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::FirewallPolicy;
    use crate::net::SecuritySettings;

    fn relay() -> RelayEndpoint {
        RelayEndpoint::parse("1.2.3.4", "1300", "udp").unwrap()
    }

    fn blocks(script: &str) -> Vec<&str> {
        script.lines().filter(|l| l.contains("-Action Block")).collect()
    }

    #[test]
    fn test_blocked_policy_blocks_all_but_loopback() {
        let script = render_script(FirewallPolicy::blocked().rules(), "g1");
        let blocks = blocks(&script);

        assert_eq!(blocks.len(), 2);
        for line in &blocks {
            assert!(line.contains(
                "-RemoteAddress 0.0.0.0-126.255.255.255,128.0.0.0-255.255.255.255,::,::2-ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff"
            ));
            assert!(!line.contains("-Protocol"));
        }
        assert!(!script.contains("Set-NetFirewallProfile"));
    }

    #[test]
    fn test_new_generation_added_before_old_removed() {
        let script = render_script(&[PermitRule::Loopback], "g2");
        let add = script.find("New-NetFirewallRule").unwrap();
        let remove = script.find("Remove-NetFirewallRule").unwrap();
        assert!(add < remove);
        assert!(script.contains("-DisplayName 'vpnd-g2-0'"));
        assert!(script.contains("StartsWith('vpnd-g2-')"));

        let first_block = script.find("-Action Block").unwrap();
        let first_allow = script.find("-Action Allow").unwrap();
        assert!(first_block < first_allow);
    }

    #[test]
    fn test_relay_narrowed_to_port_and_protocol() {
        let relay = relay();
        let script = render_script(&[PermitRule::Loopback, PermitRule::Relay(relay)], "g");

        assert!(script.contains("-Action Allow -Direction Outbound -RemoteAddress 1.2.3.4 -Protocol UDP -RemotePort 1300"));
        assert!(script.contains("-Protocol UDP -RemotePort 1-1299,1301-65535 -RemoteAddress 1.2.3.4 "));
        assert!(script.contains("-Protocol TCP -RemoteAddress 1.2.3.4 "));
        assert!(script.contains("-Protocol ICMPv4 -RemoteAddress 1.2.3.4 "));
        assert!(script.contains("0.0.0.0-1.2.3.3,1.2.3.5-126.255.255.255,"));
    }

    #[test]
    fn test_dhcp_splits_catch_all_by_protocol() {
        let script = render_script(&[PermitRule::Loopback, PermitRule::Dhcp], "g");
        let blocks = blocks(&script);

        assert!(blocks.iter().all(|l| l.contains("-Protocol")));
        assert!(blocks.iter().any(|l| l.contains("-Protocol UDP -LocalPort 1-67,69-545,547-65535")));
        assert!(blocks.iter().any(|l| l.contains("-LocalPort 68,546 -RemotePort 1-66,68-546,548-65535")));
    }

    #[test]
    fn test_connected_blocks_outside_tunnel_and_foreign_dns() {
        let settings = SecuritySettings {
            permit_dhcp: false,
            permit_lan: false,
        };
        let dns = ["10.8.0.1".parse().unwrap()];
        let policy = FirewallPolicy::connected(&relay(), &settings, "tun0", &dns);
        let script = render_script(policy.rules(), "g");

        assert!(script.contains("$others = @(Get-NetAdapter -IncludeHidden | Where-Object { $_.Name -ne 'tun0' }"));
        assert!(script.contains("-Direction Outbound -InterfaceAlias $others -RemoteAddress "));
        assert!(script.contains(
            "-Direction Outbound -InterfaceAlias 'tun0' -Protocol UDP -RemotePort 53 -RemoteAddress 0.0.0.0-10.8.0.0,10.8.0.2-255.255.255.255,::-ffff"
        ));

        // rules scoped to $others only run when there is another adapter
        let guard = script.find("if ($others.Count -gt 0) {").unwrap();
        let scoped = script.find("-InterfaceAlias $others").unwrap();
        assert!(guard < scoped);
    }

    #[test]
    fn test_lan_dns_stays_reachable_in_tunnel() {
        let settings = SecuritySettings {
            permit_dhcp: false,
            permit_lan: true,
        };
        let policy = FirewallPolicy::connected(&relay(), &settings, "tun0", &[]);
        let script = render_script(policy.rules(), "g");
        let dns_block = script
            .lines()
            .find(|l| l.contains("-InterfaceAlias 'tun0' -Protocol UDP -RemotePort 53"))
            .unwrap();
        assert!(dns_block.contains("0.0.0.0-9.255.255.255,11.0.0.0-"));
    }

    #[test]
    fn test_profile_check_fails_the_script() {
        let script = render_script(&[PermitRule::Loopback], "g");
        let check = script.find("throw").unwrap();
        let add = script.find("New-NetFirewallRule").unwrap();
        assert!(check < add);
    }

    #[test]
    fn test_reset_only_removes_group() {
        let script = render_reset();
        assert!(script.contains("Get-NetFirewallRule -Group 'vpnd'"));
        assert!(!script.contains("Set-NetFirewallProfile"));
        assert!(!script.contains("New-NetFirewallRule"));
    }

    #[test]
    fn test_windows_backend_creation() {
        let _manager = WindowsFirewall::new();
        let _default = WindowsFirewall::default();
    }
}
