//! Address and port range arithmetic
//!
//! Windows firewall rules can only match, never exclude, so "everything but
//! these networks" has to be spelled out as the ranges in between.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const V4_MAX: u128 = u32::MAX as u128;

/// An address with a prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNet {
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            prefix: width(&addr),
        }
    }

    /// Parse `10.0.0.0/8` or a bare address
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().ok()?;
                let prefix: u8 = prefix.parse().ok()?;
                (prefix <= width(&addr)).then_some(Self { addr, prefix })
            }
            None => s.parse().ok().map(Self::host),
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.addr.is_ipv4() != ip.is_ipv4() {
            return false;
        }
        let (first, last) = self.span();
        (first..=last).contains(&to_u128(ip))
    }

    fn span(&self) -> (u128, u128) {
        let host_bits = u32::from(width(&self.addr) - self.prefix);
        let mask = if host_bits == 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        let value = to_u128(self.addr);
        (value & !mask, value | mask)
    }
}

fn width(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Stretches of `0..=max` not covered by any of `spans`
fn gaps(mut spans: Vec<(u128, u128)>, max: u128) -> Vec<(u128, u128)> {
    spans.sort_unstable();

    let mut gaps = Vec::new();
    // None once everything up to max is covered
    let mut next = Some(0u128);
    for (first, last) in spans {
        let Some(start) = next else {
            break;
        };
        if first > start {
            gaps.push((start, first - 1));
        }
        if last >= start {
            next = last.checked_add(1).filter(|n| *n <= max);
        }
    }
    if let Some(start) = next {
        gaps.push((start, max));
    }
    gaps
}

fn range<T: std::fmt::Display>(first: T, last: T, single: bool) -> String {
    if single {
        first.to_string()
    } else {
        format!("{}-{}", first, last)
    }
}

/// Every IPv4 and IPv6 address outside `nets`, as `first-last` ranges
pub fn complement(nets: &[IpNet]) -> Vec<String> {
    let spans = |v4: bool| {
        nets.iter()
            .filter(|n| n.addr.is_ipv4() == v4)
            .map(IpNet::span)
            .collect::<Vec<_>>()
    };

    let mut ranges = Vec::new();
    for (first, last) in gaps(spans(true), V4_MAX) {
        // both ends fit: gaps never exceed V4_MAX
        let (a, b) = (Ipv4Addr::from(first as u32), Ipv4Addr::from(last as u32));
        ranges.push(range(a, b, first == last));
    }
    for (first, last) in gaps(spans(false), u128::MAX) {
        let (a, b) = (Ipv6Addr::from(first), Ipv6Addr::from(last));
        ranges.push(range(a, b, first == last));
    }
    ranges
}

/// Port list matching every port in 1-65535 except `excluded`
pub fn other_ports(excluded: &[u16]) -> String {
    let spans = excluded
        .iter()
        .map(|p| (u128::from(*p), u128::from(*p)))
        .collect();

    gaps(spans, u128::from(u16::MAX))
        .into_iter()
        .filter_map(|(first, last)| {
            let first = first.max(1);
            (first <= last).then(|| range(first, last, first == last))
        })
        .collect::<Vec<_>>()
        .join(",")
}
