//! Daemon wiring
//!
//! Builds one instance of each component, applies the startup policy before
//! anything can connect, and on shutdown lets the state machine apply the
//! configured exit policy.

use crate::config::Config;
use crate::dns::get_dns_backend;
use crate::error::{Error, Result};
use crate::firewall::{BackendKind, FirewallController, FirewallError, get_firewall_backend};
use crate::openvpn::listener::PluginRoutes;
use crate::openvpn::{OpenVpnSupervisor, PluginListener, SupervisorOptions};
use crate::rpc::{RpcGateway, SubscriberRegistry, write_token_file};
use crate::settings::SettingsStore;
use crate::token::random_token;
use crate::tunnel::{self, MachineOptions, TunnelHandle, TunnelStateMachine};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle as TaskHandle;
use tracing::{debug, info, warn};

pub struct Daemon {
    handle: TunnelHandle,
    machine: Option<JoinHandle<()>>,
    rpc_task: TaskHandle<()>,
    plugin_task: TaskHandle<()>,
    rpc_addr: SocketAddr,
    token: String,
    token_file: Option<PathBuf>,
}

impl Daemon {
    /// Start every component.
    ///
    /// `config_path` is where settings changed over RPC are saved;
    /// `plugin_binary` is what OpenVPN runs as its script.
    pub async fn start(
        config: Config,
        config_path: Option<PathBuf>,
        plugin_binary: PathBuf,
    ) -> Result<Self> {
        config.validate()?;
        if config.firewall.backend == BackendKind::Native {
            warn_if_unprivileged();
        }

        let backend = get_firewall_backend(config.firewall.backend)?;
        let mut controller = FirewallController::new(backend);
        if config.firewall.manage_dns {
            let dns = get_dns_backend(config.firewall.backend).map_err(FirewallError::from)?;
            controller = controller.with_dns(dns);
        } else {
            info!("Leaving the system resolver alone (firewall.manage_dns = false)");
        }

        let (handle, inbox) = tunnel::channel();
        let registry = Arc::new(SubscriberRegistry::new(config.rpc.subscriber_queue));
        let routes = PluginRoutes::new();
        let settings = Arc::new(SettingsStore::new(config.clone(), config_path));

        let plugin_listener = PluginListener::bind(config.openvpn.plugin_addr).await?;
        let plugin_addr = plugin_listener.local_addr()?;

        let supervisor = OpenVpnSupervisor::new(
            Handle::current(),
            SupervisorOptions {
                binary: config.openvpn.binary.clone(),
                plugin_binary,
                plugin_addr,
                config_file: config.openvpn.config_file.clone(),
                extra_args: config.openvpn.extra_args.clone(),
                stop_timeout: config.stop_timeout(),
                settings: settings.clone(),
            },
            routes.clone(),
            handle.clone(),
        );

        let mut machine = TunnelStateMachine::new(
            inbox,
            controller,
            Box::new(supervisor),
            registry.clone(),
            MachineOptions {
                block_when_disconnected: config.daemon.block_when_disconnected,
                shutdown_timeout: config.shutdown_timeout(),
            },
        );
        machine.initialize(config.daemon.block_on_startup);
        info!("Initial state: {}", machine.state());
        let machine = machine.spawn()?;

        let rpc_listener = TcpListener::bind(config.rpc.listen).await?;
        let rpc_addr = rpc_listener.local_addr()?;

        let token = random_token();
        let token_file = config.token_file();
        match &token_file {
            Some(path) => {
                write_token_file(path, &token)?;
                info!("RPC token written to {}", path.display());
            }
            None => warn!("No token file location; RPC clients cannot authenticate"),
        }

        let gateway = Arc::new(RpcGateway::new(
            handle.clone(),
            registry,
            token.clone(),
            settings,
        ));
        let rpc_task = tokio::spawn(gateway.serve(rpc_listener));
        let plugin_task = tokio::spawn(plugin_listener.run(routes, handle.clone()));

        Ok(Self {
            handle,
            machine: Some(machine),
            rpc_task,
            plugin_task,
            rpc_addr,
            token,
            token_file,
        })
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn tunnel(&self) -> &TunnelHandle {
        &self.handle
    }

    /// Apply the exit policy and stop everything
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down daemon");
        self.rpc_task.abort();

        // Plugin callbacks keep flowing while the tunnel process winds down
        self.handle.shutdown().await?;
        self.plugin_task.abort();

        if let Some(machine) = self.machine.take() {
            tokio::task::spawn_blocking(move || machine.join())
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))?
                .map_err(|_| Error::Io(std::io::Error::other("state machine thread panicked")))?;
        }

        if let Some(path) = &self.token_file {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove token file {}: {}", path.display(), e);
            }
        }

        info!("Daemon stopped in state {}", self.handle.state());
        Ok(())
    }
}

/// Run until SIGINT, SIGTERM or SIGHUP
pub async fn run(config: Config, config_path: Option<PathBuf>, plugin_binary: PathBuf) -> Result<()> {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    })
    .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    let daemon = Daemon::start(config, config_path, plugin_binary).await?;
    info!("vpnd running; RPC on {}", daemon.rpc_addr());

    signal_rx.recv().await;
    info!("Termination signal received");
    daemon.shutdown().await
}

fn warn_if_unprivileged() {
    #[cfg(unix)]
    {
        if !nix::unistd::geteuid().is_root() {
            warn!("Not running as root; firewall changes will likely fail");
        }
    }
}
