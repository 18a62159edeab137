//! macOS resolver via scutil
//!
//! The primary service's `State:/Network/Service/<id>/DNS` key is copied to
//! `State:/Network/vpnd/OriginalDNS` before it is overwritten, and copied back
//! on reset.

use super::{DnsBackend, DnsError, run_with_stdin};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use tracing::info;

const SAVED_KEY: &str = "State:/Network/vpnd/OriginalDNS";

pub struct Scutil {
    /// Service whose DNS key we replaced
    service: Mutex<Option<String>>,
}

impl Scutil {
    pub fn new() -> Self {
        Self {
            service: Mutex::new(None),
        }
    }
}

impl Default for Scutil {
    fn default() -> Self {
        Self::new()
    }
}

fn scutil(input: &str) -> Result<String, DnsError> {
    run_with_stdin("scutil", &[], input)
}

fn service_key(service: &str) -> String {
    format!("State:/Network/Service/{}/DNS", service)
}

/// `PrimaryService` from `show State:/Network/Global/IPv4` output
pub fn parse_primary_service(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "PrimaryService").then(|| value.trim().to_string())
    })
}

pub fn render_save(service: &str) -> String {
    format!(
        "open\nd.init\nget {}\nset {}\nquit\n",
        service_key(service),
        SAVED_KEY
    )
}

pub fn render_set(service: &str, servers: &[IpAddr]) -> String {
    let servers = servers
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "open\nd.init\nd.add ServerAddresses * {}\nset {}\nquit\n",
        servers,
        service_key(service)
    )
}

pub fn render_restore(service: &str) -> String {
    format!(
        "open\nd.init\nget {}\nset {}\nremove {}\nquit\n",
        SAVED_KEY,
        service_key(service),
        SAVED_KEY
    )
}

impl DnsBackend for Scutil {
    fn set(&self, _tunnel_alias: &str, servers: &[IpAddr]) -> Result<(), DnsError> {
        let mut saved = self.service.lock().unwrap_or_else(PoisonError::into_inner);
        let service = match saved.as_ref() {
            Some(service) => service.clone(),
            None => {
                let output = scutil("open\nshow State:/Network/Global/IPv4\nquit\n")?;
                let service = parse_primary_service(&output).ok_or(DnsError::NoPrimaryService)?;
                scutil(&render_save(&service))?;
                *saved = Some(service.clone());
                service
            }
        };

        scutil(&render_set(&service, servers))?;
        info!("Resolver set to {:?} on service {}", servers, service);
        Ok(())
    }

    fn reset(&self) -> Result<(), DnsError> {
        let mut saved = self.service.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(service) = saved.as_ref() {
            scutil(&render_restore(service))?;
            info!("Restored resolver on service {}", service);
            *saved = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_primary_service() {
        let output = "<dictionary> {\n  PrimaryInterface : en0\n  PrimaryService : 8C1A-42\n  Router : 192.168.1.1\n}\n";
        assert_eq!(parse_primary_service(output).as_deref(), Some("8C1A-42"));
        assert_eq!(parse_primary_service("  No such key\n"), None);
    }

    #[test]
    fn test_render_set() {
        let servers: Vec<IpAddr> = vec!["10.8.0.1".parse().unwrap(), "10.8.0.2".parse().unwrap()];
        assert_eq!(
            render_set("svc", &servers),
            "open\nd.init\nd.add ServerAddresses * 10.8.0.1 10.8.0.2\nset State:/Network/Service/svc/DNS\nquit\n"
        );
    }

    #[test]
    fn test_restore_reads_saved_copy() {
        let script = render_restore("svc");
        let get = script.find("get State:/Network/vpnd/OriginalDNS").unwrap();
        let set = script.find("set State:/Network/Service/svc/DNS").unwrap();
        assert!(get < set);
        assert!(script.contains("remove State:/Network/vpnd/OriginalDNS"));
    }
}
