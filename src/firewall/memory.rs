//! In-memory firewall backend
//!
//! Used for the `dry-run` backend and as the fake in tests. Applied rule sets
//! are recorded so callers can inspect what the daemon would have enforced.

use super::{FirewallBackend, FirewallError, PermitRule};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
}

#[derive(Default)]
struct State {
    rules: Vec<PermitRule>,
    history: Vec<Vec<PermitRule>>,
    pending_failures: usize,
    delay: Option<Duration>,
}

/// Cloneable handle; every clone sees the same rule table
#[derive(Clone, Default)]
pub struct MemoryFirewall {
    inner: Arc<Inner>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The currently enforced rules
    pub fn rules(&self) -> Vec<PermitRule> {
        self.state().rules.clone()
    }

    pub fn managed_rule_count(&self) -> usize {
        self.state().rules.len()
    }

    /// Every rule table that was successfully installed, in order
    pub fn history(&self) -> Vec<Vec<PermitRule>> {
        self.state().history.clone()
    }

    /// Make the next `count` operations fail
    pub fn fail_next(&self, count: usize) {
        self.state().pending_failures = count;
    }

    /// Make each operation take at least `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    /// Number of times an operation started while another was still running
    pub fn overlapping_operations(&self) -> usize {
        self.inner.overlaps.load(Ordering::SeqCst)
    }

    fn replace(&self, rules: &[PermitRule]) -> Result<(), FirewallError> {
        if self.inner.in_flight.swap(true, Ordering::SeqCst) {
            self.inner.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let delay = self.state().delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let result = {
            let mut state = self.state();
            if state.pending_failures > 0 {
                state.pending_failures -= 1;
                Err(FirewallError::Simulated("injected failure".to_string()))
            } else {
                state.rules = rules.to_vec();
                state.history.push(rules.to_vec());
                Ok(())
            }
        };

        self.inner.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

impl FirewallBackend for MemoryFirewall {
    fn apply_rules(&self, rules: &[PermitRule]) -> Result<(), FirewallError> {
        self.replace(rules)?;
        info!("dry-run firewall: installed {} rules", rules.len());
        for rule in rules {
            debug!("  permit {}", rule);
        }
        Ok(())
    }

    fn remove_all_managed_rules(&self) -> Result<(), FirewallError> {
        self.replace(&[])?;
        info!("dry-run firewall: removed all managed rules");
        Ok(())
    }
}
