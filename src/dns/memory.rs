//! In-memory resolver for dry runs and tests

use super::{DnsBackend, DnsError};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

#[derive(Default)]
struct State {
    /// Tunnel alias and servers while set
    current: Option<(String, Vec<IpAddr>)>,
    resets: usize,
    pending_failures: usize,
}

/// Clones share state, so a test can keep one and hand the other to a controller
#[derive(Clone, Default)]
pub struct MemoryDns {
    inner: Arc<Mutex<State>>,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Servers currently set, with the tunnel alias
    pub fn current(&self) -> Option<(String, Vec<IpAddr>)> {
        self.state().current.clone()
    }

    /// Number of resets that restored something
    pub fn resets(&self) -> usize {
        self.state().resets
    }

    /// Make the next `count` operations fail
    pub fn fail_next(&self, count: usize) {
        self.state().pending_failures = count;
    }

    fn take_failure(state: &mut State) -> Result<(), DnsError> {
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(DnsError::Simulated("injected failure".to_string()));
        }
        Ok(())
    }
}

impl DnsBackend for MemoryDns {
    fn set(&self, tunnel_alias: &str, servers: &[IpAddr]) -> Result<(), DnsError> {
        let mut state = self.state();
        Self::take_failure(&mut state)?;
        state.current = Some((tunnel_alias.to_string(), servers.to_vec()));
        info!("dry-run dns: resolver set to {:?} on {}", servers, tunnel_alias);
        Ok(())
    }

    fn reset(&self) -> Result<(), DnsError> {
        let mut state = self.state();
        Self::take_failure(&mut state)?;
        if state.current.take().is_some() {
            state.resets += 1;
            info!("dry-run dns: resolver restored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_reset() {
        let dns = MemoryDns::new();
        let other = dns.clone();
        let servers: Vec<IpAddr> = vec!["10.8.0.1".parse().unwrap()];

        dns.set("tun0", &servers).unwrap();
        assert_eq!(other.current(), Some(("tun0".to_string(), servers)));

        other.reset().unwrap();
        other.reset().unwrap();
        assert_eq!(dns.current(), None);
        assert_eq!(dns.resets(), 1);
    }

    #[test]
    fn test_fail_next() {
        let dns = MemoryDns::new();
        dns.fail_next(1);
        assert!(dns.set("tun0", &[]).is_err());
        assert!(dns.current().is_none());
        dns.set("tun0", &[]).unwrap();
    }
}
