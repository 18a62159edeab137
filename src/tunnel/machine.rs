//! The tunnel state machine actor
//!
//! Runs on a dedicated thread and drains its inbox one command at a time.
//! Firewall application blocks that thread, which keeps every policy change
//! strictly ordered before the side effect it guards:
//!
//! 1. `connect`: Connecting policy, then spawn, then `Connecting`
//! 2. tunnel up: Connected policy, then `Connected`
//! 3. any failure: blocked policy, then `Blocked`

use super::state::{BlockReason, ErrorCode, EventListener, Notification, TunnelState};
use super::{CommandError, Reply, TunnelCommand, TunnelInbox};
use crate::firewall::{FirewallController, FirewallPolicy, translate};
use crate::net::{RelayEndpoint, SecuritySettings};
use crate::openvpn::{DownCause, ProcessEvent, ProcessId, TunnelSupervisor};
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Keep blocking after a disconnect and at shutdown
    pub block_when_disconnected: bool,
    /// How long shutdown waits for the tunnel process to exit
    pub shutdown_timeout: Duration,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            block_when_disconnected: false,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

pub struct TunnelStateMachine {
    state: TunnelState,
    settings: SecuritySettings,
    firewall: FirewallController,
    supervisor: Box<dyn TunnelSupervisor>,
    current_process: Option<ProcessId>,
    options: MachineOptions,
    listener: Arc<dyn EventListener>,
    commands: mpsc::UnboundedReceiver<TunnelCommand>,
    state_tx: watch::Sender<TunnelState>,
    sequence: u64,
}

impl TunnelStateMachine {
    pub fn new(
        inbox: TunnelInbox,
        firewall: FirewallController,
        supervisor: Box<dyn TunnelSupervisor>,
        listener: Arc<dyn EventListener>,
        options: MachineOptions,
    ) -> Self {
        Self {
            state: TunnelState::Disconnected,
            settings: SecuritySettings::default(),
            firewall,
            supervisor,
            current_process: None,
            options,
            listener,
            commands: inbox.commands,
            state_tx: inbox.state,
            sequence: 0,
        }
    }

    pub fn state(&self) -> &TunnelState {
        &self.state
    }

    /// Apply the startup policy: blocked when `block_on_startup`, otherwise reset
    pub fn initialize(&mut self, block_on_startup: bool) {
        if block_on_startup {
            self.enter_blocked(BlockReason::StartupDefault);
        } else {
            match self.firewall.reset() {
                Ok(()) => self.set_state(TunnelState::Disconnected),
                Err(e) => self.fail(ErrorCode::PolicyApply, e.to_string()),
            }
        }
    }

    /// Process commands until shutdown or until every handle is dropped
    pub fn run(mut self) {
        info!("Tunnel state machine started in state {}", self.state);
        while let Some(command) = self.commands.blocking_recv() {
            if !self.handle(command) {
                break;
            }
        }
        info!("Tunnel state machine stopped in state {}", self.state);
    }

    /// Run on a dedicated thread
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("tunnel-state-machine".to_string())
            .spawn(move || self.run())
    }

    /// Returns false once the machine should stop
    fn handle(&mut self, command: TunnelCommand) -> bool {
        match command {
            TunnelCommand::Connect {
                relay,
                settings,
                reply,
            } => {
                let result = self.connect(relay, settings);
                respond(reply, result);
            }
            TunnelCommand::Disconnect { reply } => {
                let result = self.disconnect();
                respond(reply, result);
            }
            TunnelCommand::Block { reply } => {
                let result = self.block();
                respond(reply, result);
            }
            TunnelCommand::Reset { reply } => {
                let result = self.reset();
                respond(reply, result);
            }
            TunnelCommand::Process { process, event } => self.on_process_event(process, event),
            TunnelCommand::Shutdown { done } => {
                self.shutdown();
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return false;
            }
        }
        true
    }

    fn connect(
        &mut self,
        relay: RelayEndpoint,
        settings: SecuritySettings,
    ) -> Result<(), CommandError> {
        if !matches!(
            self.state,
            TunnelState::Disconnected | TunnelState::Blocked { .. }
        ) {
            return Err(self.invalid("connect"));
        }

        info!("Connecting to {}", relay);
        self.settings = settings;
        let next = TunnelState::Connecting { relay, settings };

        if let Err(e) = self.firewall.apply(&translate(&next, &self.settings)) {
            let message = e.to_string();
            self.fail(ErrorCode::PolicyApply, message.clone());
            return Err(CommandError::PolicyApply(message));
        }

        // A process cancelled by an earlier block/reset may still be exiting
        if self.supervisor.is_active() {
            self.supervisor.wait_for_exit(self.options.shutdown_timeout);
        }

        match self.supervisor.spawn(&relay) {
            Ok(process) => {
                self.current_process = Some(process);
                self.set_state(next);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.fail(ErrorCode::ProcessSpawn, message.clone());
                Err(CommandError::ProcessSpawn(message))
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), CommandError> {
        if !matches!(
            self.state,
            TunnelState::Connecting { .. } | TunnelState::Connected { .. }
        ) {
            return Err(self.invalid("disconnect"));
        }

        info!("Disconnecting");
        let next = TunnelState::Disconnecting;
        if let Err(e) = self.firewall.apply(&translate(&next, &self.settings)) {
            let message = e.to_string();
            self.cancel_process();
            self.fail(ErrorCode::PolicyApply, message.clone());
            return Err(CommandError::PolicyApply(message));
        }

        self.set_state(next);
        self.supervisor.cancel();
        Ok(())
    }

    fn block(&mut self) -> Result<(), CommandError> {
        info!("Blocking all traffic on request");
        let result = self.enter_blocked(BlockReason::Requested);
        self.cancel_process();
        result
    }

    fn reset(&mut self) -> Result<(), CommandError> {
        info!("Resetting firewall policy");
        self.cancel_process();
        match self.firewall.reset() {
            Ok(()) => {
                self.set_state(TunnelState::Disconnected);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.fail(ErrorCode::PolicyApply, message.clone());
                Err(CommandError::PolicyApply(message))
            }
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down tunnel state machine");
        self.cancel_process();
        self.supervisor.wait_for_exit(self.options.shutdown_timeout);

        if self.options.block_when_disconnected {
            let _ = self.enter_blocked(BlockReason::BlockWhenDisconnected);
        } else if let Err(e) = self.reset() {
            error!("Failed to reset firewall on shutdown: {}", e);
        }
    }

    fn on_process_event(&mut self, process: ProcessId, event: ProcessEvent) {
        if self.current_process != Some(process) {
            debug!("Ignoring {:?} from stale process {}", event, process);
            return;
        }

        match event {
            ProcessEvent::Up {
                tunnel_alias,
                dns_servers,
            } => self.on_tunnel_up(tunnel_alias, dns_servers),
            ProcessEvent::RouteUp => debug!("Tunnel routes configured"),
            ProcessEvent::Down(cause) => {
                self.current_process = None;
                self.on_process_down(cause);
            }
        }
    }

    fn on_tunnel_up(&mut self, tunnel_alias: String, dns_servers: Vec<IpAddr>) {
        let (relay, settings) = match &self.state {
            TunnelState::Connecting { relay, settings } => (*relay, *settings),
            other => {
                warn!("Ignoring tunnel up while {}", other.name());
                return;
            }
        };

        let next = TunnelState::Connected {
            relay,
            settings,
            tunnel_alias,
            dns_servers,
        };

        match self.firewall.apply(&translate(&next, &self.settings)) {
            Ok(()) => self.set_state(next),
            Err(e) => {
                self.cancel_process();
                self.fail(ErrorCode::PolicyApply, e.to_string());
            }
        }
    }

    fn on_process_down(&mut self, cause: DownCause) {
        match self.state {
            TunnelState::Disconnecting => {
                info!("Tunnel process exited ({})", cause);
                if self.options.block_when_disconnected {
                    let _ = self.enter_blocked(BlockReason::BlockWhenDisconnected);
                } else {
                    match self.firewall.reset() {
                        Ok(()) => self.set_state(TunnelState::Disconnected),
                        Err(e) => self.fail(ErrorCode::PolicyApply, e.to_string()),
                    }
                }
            }
            TunnelState::Connecting { .. } | TunnelState::Connected { .. } => {
                warn!("Tunnel process went down unexpectedly ({})", cause);
                self.notify_error(ErrorCode::ProcessCrashed, cause.to_string());
                let _ = self.enter_blocked(BlockReason::ProcessCrashed(cause.to_string()));
            }
            _ => debug!("Tunnel process exited ({}) while {}", cause, self.state.name()),
        }
    }

    fn cancel_process(&mut self) {
        if self.current_process.take().is_some() {
            self.supervisor.cancel();
        }
    }

    /// Report an error and fall back to blocking everything
    fn fail(&mut self, code: ErrorCode, message: String) {
        self.notify_error(code, message.clone());
        let reason = match code {
            ErrorCode::PolicyApply => BlockReason::PolicyApplyFailed(message),
            ErrorCode::ProcessSpawn => BlockReason::ProcessSpawnFailed(message),
            ErrorCode::ProcessCrashed => BlockReason::ProcessCrashed(message),
        };
        let _ = self.enter_blocked(reason);
    }

    /// Apply the blocked policy and declare `Blocked`.
    ///
    /// The state becomes `Blocked` even when the apply fails: it is the most
    /// restrictive declared state, and the previous policy stays in force.
    fn enter_blocked(&mut self, reason: BlockReason) -> Result<(), CommandError> {
        let result = self
            .firewall
            .apply(&FirewallPolicy::blocked())
            .map_err(|e| {
                self.notify_error(ErrorCode::PolicyApply, e.to_string());
                CommandError::PolicyApply(e.to_string())
            });
        self.set_state(TunnelState::Blocked { reason });
        result
    }

    fn invalid(&self, command: &'static str) -> CommandError {
        warn!("Rejecting {} while {}", command, self.state.name());
        CommandError::InvalidState {
            command,
            state: self.state.name(),
        }
    }

    fn set_state(&mut self, state: TunnelState) {
        info!("Tunnel state: {} -> {}", self.state.name(), state);
        self.state = state.clone();
        self.state_tx.send_replace(state.clone());
        self.sequence += 1;
        self.listener.notify(&Notification::StateChanged {
            sequence: self.sequence,
            state,
        });
    }

    fn notify_error(&mut self, code: ErrorCode, message: String) {
        error!("{:?}: {}", code, message);
        self.sequence += 1;
        self.listener.notify(&Notification::Error {
            sequence: self.sequence,
            code,
            message,
        });
    }
}

fn respond(reply: Option<Reply>, result: Result<(), CommandError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{MemoryFirewall, PermitRule};
    use crate::net::TransportProtocol;
    use crate::openvpn::SupervisorError;
    use crate::tunnel::{TunnelHandle, channel};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<Notification>>,
    }

    impl EventListener for RecordingListener {
        fn notify(&self, notification: &Notification) {
            self.events.lock().unwrap().push(notification.clone());
        }
    }

    impl RecordingListener {
        fn states(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|n| match n {
                    Notification::StateChanged { state, .. } => Some(state.name()),
                    _ => None,
                })
                .collect()
        }

        fn errors(&self) -> Vec<ErrorCode> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|n| match n {
                    Notification::Error { code, .. } => Some(*code),
                    _ => None,
                })
                .collect()
        }
    }

    /// Emits `Down(Requested)` through the handle when cancelled
    struct FakeSupervisor {
        handle: TunnelHandle,
        next_id: Arc<AtomicU64>,
        active: Option<ProcessId>,
        fail_spawn: Arc<AtomicBool>,
        spawned_while_active: Arc<AtomicBool>,
    }

    impl TunnelSupervisor for FakeSupervisor {
        fn spawn(&mut self, _relay: &RelayEndpoint) -> Result<ProcessId, SupervisorError> {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(SupervisorError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "openvpn not found",
                )));
            }
            if self.active.is_some() {
                self.spawned_while_active.store(true, Ordering::SeqCst);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.active = Some(id);
            Ok(id)
        }

        fn cancel(&mut self) {
            if let Some(id) = self.active.take() {
                self.handle
                    .process_event(id, ProcessEvent::Down(DownCause::Requested));
            }
        }

        fn is_active(&self) -> bool {
            self.active.is_some()
        }

        fn wait_for_exit(&mut self, _timeout: Duration) {}
    }

    struct Harness {
        handle: TunnelHandle,
        firewall: MemoryFirewall,
        listener: Arc<RecordingListener>,
        next_id: Arc<AtomicU64>,
        fail_spawn: Arc<AtomicBool>,
        spawned_while_active: Arc<AtomicBool>,
        thread: Option<thread::JoinHandle<()>>,
    }

    fn start(block_on_startup: bool, options: MachineOptions) -> Harness {
        let (handle, inbox) = channel();
        let firewall = MemoryFirewall::new();
        let listener = Arc::new(RecordingListener::default());
        let next_id = Arc::new(AtomicU64::new(0));
        let fail_spawn = Arc::new(AtomicBool::new(false));
        let spawned_while_active = Arc::new(AtomicBool::new(false));

        let supervisor = FakeSupervisor {
            handle: handle.clone(),
            next_id: next_id.clone(),
            active: None,
            fail_spawn: fail_spawn.clone(),
            spawned_while_active: spawned_while_active.clone(),
        };

        let mut machine = TunnelStateMachine::new(
            inbox,
            FirewallController::new(Box::new(firewall.clone())),
            Box::new(supervisor),
            listener.clone(),
            options,
        );
        machine.initialize(block_on_startup);
        let thread = machine.spawn().unwrap();

        Harness {
            handle,
            firewall,
            listener,
            next_id,
            fail_spawn,
            spawned_while_active,
            thread: Some(thread),
        }
    }

    impl Harness {
        fn current_process(&self) -> ProcessId {
            self.next_id.load(Ordering::SeqCst)
        }

        async fn wait_for(&self, name: &'static str) -> TunnelState {
            let mut rx = self.handle.watch_state();
            let state = tokio::time::timeout(
                Duration::from_secs(5),
                rx.wait_for(|s| s.name() == name),
            )
            .await
            .expect("timed out waiting for state")
            .expect("state machine stopped");
            state.clone()
        }

        async fn stop(mut self) {
            self.handle.shutdown().await.unwrap();
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    fn relay() -> RelayEndpoint {
        RelayEndpoint::new("1.2.3.4".parse().unwrap(), 1300, TransportProtocol::Udp)
    }

    fn dhcp_only() -> SecuritySettings {
        SecuritySettings {
            permit_dhcp: true,
            permit_lan: false,
        }
    }

    fn tunnel_up() -> ProcessEvent {
        ProcessEvent::Up {
            tunnel_alias: "tun0".to_string(),
            dns_servers: vec!["10.8.0.1".parse().unwrap()],
        }
    }

    #[tokio::test]
    async fn test_startup_blocked_by_default() {
        let h = start(true, MachineOptions::default());
        assert_eq!(
            h.handle.state(),
            TunnelState::Blocked {
                reason: BlockReason::StartupDefault
            }
        );
        assert_eq!(h.firewall.rules(), vec![PermitRule::Loopback]);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_connect_then_crash_blocks() {
        let h = start(false, MachineOptions::default());

        h.handle.connect(relay(), dhcp_only()).await.unwrap();
        assert_eq!(
            h.firewall.rules(),
            FirewallPolicy::connecting(&relay(), &dhcp_only()).rules()
        );

        h.handle.process_event(h.current_process(), tunnel_up());
        let connected = h.wait_for("connected").await;
        assert_eq!(
            h.firewall.rules(),
            translate(&connected, &dhcp_only()).rules()
        );

        h.handle.process_event(
            h.current_process(),
            ProcessEvent::Down(DownCause::Crashed("exit status: 1".to_string())),
        );
        h.wait_for("blocked").await;

        assert_eq!(
            h.listener.states(),
            vec!["disconnected", "connecting", "connected", "blocked"]
        );
        assert_eq!(h.listener.errors(), vec![ErrorCode::ProcessCrashed]);
        assert_eq!(h.firewall.rules(), vec![PermitRule::Loopback]);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_policy_failure_blocks_and_never_spawns() {
        let h = start(false, MachineOptions::default());
        h.firewall.fail_next(1);

        let result = h.handle.connect(relay(), dhcp_only()).await;
        assert!(matches!(result, Err(CommandError::PolicyApply(_))));
        assert_eq!(h.current_process(), 0);
        assert!(matches!(
            h.handle.state(),
            TunnelState::Blocked {
                reason: BlockReason::PolicyApplyFailed(_)
            }
        ));
        assert_eq!(h.firewall.rules(), vec![PermitRule::Loopback]);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_blocks() {
        let h = start(false, MachineOptions::default());
        h.fail_spawn.store(true, Ordering::SeqCst);

        let result = h.handle.connect(relay(), dhcp_only()).await;
        assert!(matches!(result, Err(CommandError::ProcessSpawn(_))));
        assert_eq!(h.listener.errors(), vec![ErrorCode::ProcessSpawn]);
        assert_eq!(h.firewall.rules(), vec![PermitRule::Loopback]);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_connected_policy_failure_blocks() {
        let h = start(false, MachineOptions::default());
        h.handle.connect(relay(), dhcp_only()).await.unwrap();

        h.firewall.fail_next(1);
        h.handle.process_event(h.current_process(), tunnel_up());
        h.wait_for("blocked").await;

        assert!(!h.listener.states().contains(&"connected"));
        assert_eq!(h.firewall.rules(), vec![PermitRule::Loopback]);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_resets_after_exit() {
        let h = start(false, MachineOptions::default());
        h.handle.connect(relay(), dhcp_only()).await.unwrap();
        h.handle.process_event(h.current_process(), tunnel_up());
        h.wait_for("connected").await;

        h.handle.disconnect().await.unwrap();
        h.wait_for("disconnected").await;

        assert_eq!(
            h.listener.states(),
            vec![
                "disconnected",
                "connecting",
                "connected",
                "disconnecting",
                "disconnected"
            ]
        );
        assert_eq!(h.firewall.managed_rule_count(), 0);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_policy_failure_cancels_process() {
        let h = start(false, MachineOptions::default());
        h.handle.connect(relay(), dhcp_only()).await.unwrap();
        h.handle.process_event(h.current_process(), tunnel_up());
        h.wait_for("connected").await;

        h.firewall.fail_next(1);
        let result = h.handle.disconnect().await;
        assert!(matches!(result, Err(CommandError::PolicyApply(_))));
        assert!(matches!(
            h.handle.state(),
            TunnelState::Blocked {
                reason: BlockReason::PolicyApplyFailed(_)
            }
        ));
        assert_eq!(h.listener.errors(), vec![ErrorCode::PolicyApply]);

        // the old process must be gone before the next attempt spawns
        h.handle.connect(relay(), dhcp_only()).await.unwrap();
        assert!(!h.spawned_while_active.load(Ordering::SeqCst));
        h.stop().await;
    }

    #[tokio::test]
    async fn test_reset_failure_blocks() {
        let h = start(false, MachineOptions::default());
        h.handle.connect(relay(), dhcp_only()).await.unwrap();

        h.firewall.fail_next(1);
        let result = h.handle.reset().await;
        assert!(matches!(result, Err(CommandError::PolicyApply(_))));
        assert!(matches!(
            h.handle.state(),
            TunnelState::Blocked {
                reason: BlockReason::PolicyApplyFailed(_)
            }
        ));
        assert_eq!(h.firewall.rules(), vec![PermitRule::Loopback]);

        h.handle.connect(relay(), dhcp_only()).await.unwrap();
        assert!(!h.spawned_while_active.load(Ordering::SeqCst));
        h.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_with_block_when_disconnected() {
        let options = MachineOptions {
            block_when_disconnected: true,
            ..MachineOptions::default()
        };
        let h = start(false, options);
        h.handle.connect(relay(), dhcp_only()).await.unwrap();
        h.handle.disconnect().await.unwrap();

        let state = h.wait_for("blocked").await;
        assert_eq!(
            state,
            TunnelState::Blocked {
                reason: BlockReason::BlockWhenDisconnected
            }
        );
        assert_eq!(h.firewall.rules(), vec![PermitRule::Loopback]);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_rejected() {
        let h = start(false, MachineOptions::default());

        assert!(matches!(
            h.handle.disconnect().await,
            Err(CommandError::InvalidState { .. })
        ));

        h.handle.connect(relay(), dhcp_only()).await.unwrap();
        let applies = h.firewall.history().len();
        assert_eq!(
            h.handle.connect(relay(), dhcp_only()).await,
            Err(CommandError::InvalidState {
                command: "connect",
                state: "connecting"
            })
        );
        assert_eq!(h.firewall.history().len(), applies);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_back_to_back_connects_are_serialized() {
        let h = start(false, MachineOptions::default());
        h.firewall.set_delay(Duration::from_millis(50));

        let a = h.handle.clone();
        let b = h.handle.clone();
        let (first, second) = tokio::join!(
            a.connect(relay(), dhcp_only()),
            b.connect(relay(), dhcp_only())
        );

        assert_eq!(
            [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
            1
        );
        assert_eq!(h.firewall.overlapping_operations(), 0);
        assert!(!h.spawned_while_active.load(Ordering::SeqCst));
        h.stop().await;
    }

    #[tokio::test]
    async fn test_block_from_connected_ignores_stale_down() {
        let h = start(false, MachineOptions::default());
        h.handle.connect(relay(), dhcp_only()).await.unwrap();
        h.handle.process_event(h.current_process(), tunnel_up());
        h.wait_for("connected").await;

        h.handle.block().await.unwrap();
        assert_eq!(
            h.handle.state(),
            TunnelState::Blocked {
                reason: BlockReason::Requested
            }
        );
        // the fake's Down(Requested) for the cancelled process is stale now
        h.handle.reset().await.unwrap();
        assert_eq!(h.handle.state(), TunnelState::Disconnected);
        assert!(h.listener.errors().is_empty());
        h.stop().await;
    }

    #[tokio::test]
    async fn test_reset_from_any_state_clears_rules() {
        let h = start(true, MachineOptions::default());
        h.handle.reset().await.unwrap();
        assert_eq!(h.firewall.managed_rule_count(), 0);

        h.handle.connect(relay(), dhcp_only()).await.unwrap();
        h.handle.reset().await.unwrap();
        assert_eq!(h.firewall.managed_rule_count(), 0);
        assert_eq!(h.handle.state(), TunnelState::Disconnected);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_applies_configured_policy() {
        let options = MachineOptions {
            block_when_disconnected: true,
            ..MachineOptions::default()
        };
        let h = start(false, options);
        h.handle.connect(relay(), dhcp_only()).await.unwrap();

        let firewall = h.firewall.clone();
        h.stop().await;
        assert_eq!(firewall.rules(), vec![PermitRule::Loopback]);
    }

    #[tokio::test]
    async fn test_sequences_strictly_increase() {
        let h = start(true, MachineOptions::default());
        h.fail_spawn.store(true, Ordering::SeqCst);
        let _ = h.handle.connect(relay(), dhcp_only()).await;
        h.handle.reset().await.unwrap();

        let sequences: Vec<u64> = h
            .listener
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.sequence())
            .collect();
        assert_eq!(sequences, (1..=sequences.len() as u64).collect::<Vec<_>>());
        h.stop().await;
    }
}
