//! Spawns and monitors the OpenVPN process
//!
//! Each process gets a monitor task on the tokio runtime. The monitor owns the
//! child and is the only place a [`ProcessEvent::Down`] is produced, so every
//! process yields exactly one, after it has really exited.

use super::args::{LaunchSpec, build_args};
use super::listener::{Control, PluginRoutes, Route};
use super::{DownCause, ProcessEvent, ProcessId, SupervisorError, TunnelSupervisor};
use crate::net::RelayEndpoint;
use crate::settings::SettingsStore;
use crate::token::random_token;
use crate::tunnel::TunnelHandle;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// OpenVPN binary
    pub binary: PathBuf,
    /// Binary OpenVPN runs as its lifecycle script, normally our own executable
    pub plugin_binary: PathBuf,
    pub plugin_addr: SocketAddr,
    pub config_file: Option<PathBuf>,
    pub extra_args: Vec<String>,
    /// Grace period between SIGTERM and kill
    pub stop_timeout: Duration,
    /// Runtime options read at every launch
    pub settings: Arc<SettingsStore>,
}

struct Running {
    id: ProcessId,
    control: mpsc::UnboundedSender<Control>,
    exited: watch::Receiver<bool>,
}

pub struct OpenVpnSupervisor {
    runtime: Handle,
    options: SupervisorOptions,
    routes: PluginRoutes,
    events: TunnelHandle,
    next_id: ProcessId,
    current: Option<Running>,
}

impl OpenVpnSupervisor {
    pub fn new(
        runtime: Handle,
        options: SupervisorOptions,
        routes: PluginRoutes,
        events: TunnelHandle,
    ) -> Self {
        Self {
            runtime,
            options,
            routes,
            events,
            next_id: 0,
            current: None,
        }
    }

    fn launch(&self, relay: &RelayEndpoint, token: &str) -> Result<Child, SupervisorError> {
        let args = build_args(&LaunchSpec {
            relay,
            plugin_binary: &self.options.plugin_binary,
            plugin_addr: self.options.plugin_addr,
            token,
            config_file: self.options.config_file.as_ref(),
            mssfix: self.options.settings.mssfix(),
            extra_args: &self.options.extra_args,
        });
        debug!("Launching {} {:?}", self.options.binary.display(), args);

        // Child reaping needs the runtime's reactor
        let _guard = self.runtime.enter();
        let child = Command::new(&self.options.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

impl TunnelSupervisor for OpenVpnSupervisor {
    fn spawn(&mut self, relay: &RelayEndpoint) -> Result<ProcessId, SupervisorError> {
        if self.is_active() {
            return Err(SupervisorError::AlreadyRunning);
        }

        self.next_id += 1;
        let id = self.next_id;
        let token = random_token();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        // Registered first so a fast `up` callback finds its route
        self.routes.register(
            token.clone(),
            Route {
                process: id,
                control: control_tx.clone(),
            },
        );

        let mut child = match self.launch(relay, &token) {
            Ok(child) => child,
            Err(e) => {
                self.routes.remove(&token);
                return Err(e);
            }
        };
        info!(
            "Started OpenVPN process {} (pid {:?}) for {}",
            id,
            child.id(),
            relay
        );

        if let Some(stdout) = child.stdout.take() {
            self.runtime.spawn(forward_output(id, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            self.runtime.spawn(forward_output(id, stderr));
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        self.runtime.spawn(monitor(Monitor {
            id,
            child,
            control: control_rx,
            events: self.events.clone(),
            routes: self.routes.clone(),
            token,
            exited: exited_tx,
            stop_timeout: self.options.stop_timeout,
        }));

        self.current = Some(Running {
            id,
            control: control_tx,
            exited: exited_rx,
        });
        Ok(id)
    }

    fn cancel(&mut self) {
        if let Some(running) = &self.current {
            if !*running.exited.borrow() {
                info!("Stopping OpenVPN process {}", running.id);
                let _ = running.control.send(Control::Stop(DownCause::Requested));
            }
        }
    }

    fn is_active(&self) -> bool {
        self.current
            .as_ref()
            .map(|running| !*running.exited.borrow())
            .unwrap_or(false)
    }

    fn wait_for_exit(&mut self, timeout: Duration) {
        let Some(running) = &self.current else {
            return;
        };
        let mut exited = running.exited.clone();
        let waited = self.runtime.block_on(async move {
            tokio::time::timeout(timeout, exited.wait_for(|done| *done))
                .await
                .map(|waited| waited.map(|_| ()))
        });
        if waited.is_err() {
            warn!(
                "OpenVPN process {} still running after {:?}",
                running.id, timeout
            );
        }
    }
}

struct Monitor {
    id: ProcessId,
    child: Child,
    control: mpsc::UnboundedReceiver<Control>,
    events: TunnelHandle,
    routes: PluginRoutes,
    token: String,
    exited: watch::Sender<bool>,
    stop_timeout: Duration,
}

async fn monitor(mut m: Monitor) {
    let cause = tokio::select! {
        status = m.child.wait() => match status {
            Ok(status) => DownCause::Crashed(status.to_string()),
            Err(e) => DownCause::Crashed(e.to_string()),
        },
        Some(Control::Stop(cause)) = m.control.recv() => {
            stop_child(m.id, &mut m.child, m.stop_timeout).await;
            cause
        }
    };

    m.routes.remove(&m.token);
    m.exited.send_replace(true);
    info!("OpenVPN process {} exited ({})", m.id, cause);
    m.events.process_event(m.id, ProcessEvent::Down(cause));
}

/// SIGTERM, then kill once `timeout` has passed
async fn stop_child(id: ProcessId, child: &mut Child, timeout: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to signal OpenVPN process {}: {}", id, e);
            }
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("OpenVPN process {} terminated: {}", id, status);
                    return;
                }
                Ok(Err(e)) => warn!("Waiting on OpenVPN process {} failed: {}", id, e),
                Err(_) => warn!(
                    "OpenVPN process {} ignored SIGTERM for {:?}, killing",
                    id, timeout
                ),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = timeout;

    if let Err(e) = child.kill().await {
        warn!("Failed to kill OpenVPN process {}: {}", id, e);
    }
}

async fn forward_output<R: AsyncRead + Unpin>(id: ProcessId, output: R) {
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "openvpn", "[{}] {}", id, line);
    }
}
