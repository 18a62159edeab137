//! Daemon side of the plugin callback channel
//!
//! One loopback TCP connection per callback: read a frame, route it by its
//! process token, ack. Anything malformed or carrying an unknown token is
//! logged and dropped without an ack, so the plugin exits non-zero.

use super::frame::{self, FrameError};
use super::plugin::{PluginEvent, PluginMessage};
use super::{DownCause, ProcessEvent, ProcessId};
use crate::tunnel::TunnelHandle;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Instructions from the callback channel to a process monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Control {
    Stop(DownCause),
}

#[derive(Clone)]
pub(crate) struct Route {
    pub process: ProcessId,
    pub control: mpsc::UnboundedSender<Control>,
}

/// Live processes by token, shared by the supervisor and the listener
#[derive(Clone, Default)]
pub struct PluginRoutes {
    inner: Arc<Mutex<HashMap<String, Route>>>,
}

impl PluginRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, token: String, route: Route) {
        if let Ok(mut routes) = self.inner.lock() {
            routes.insert(token, route);
        }
    }

    pub(crate) fn remove(&self, token: &str) {
        if let Ok(mut routes) = self.inner.lock() {
            routes.remove(token);
        }
    }

    pub(crate) fn lookup(&self, token: &str) -> Option<Route> {
        self.inner.lock().ok()?.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PluginListener {
    listener: TcpListener,
}

impl PluginListener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept callbacks until the task is dropped
    pub async fn run(self, routes: PluginRoutes, events: TunnelHandle) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Plugin listener on {}", addr),
            Err(e) => warn!("Plugin listener address unavailable: {}", e),
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Plugin accept failed: {}", e);
                    continue;
                }
            };

            let routes = routes.clone();
            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_callback(stream, &routes, &events).await {
                    warn!("Discarding plugin callback from {}: {}", peer, e);
                }
            });
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CallbackError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("timed out reading callback")]
    Timeout,
    #[error("unknown process token")]
    UnknownToken,
}

async fn handle_callback(
    mut stream: TcpStream,
    routes: &PluginRoutes,
    events: &TunnelHandle,
) -> Result<(), CallbackError> {
    let body = tokio::time::timeout(READ_TIMEOUT, frame::read_frame(&mut stream))
        .await
        .map_err(|_| CallbackError::Timeout)??;
    let message: PluginMessage = frame::decode(&body)?;

    let route = routes
        .lookup(&message.token)
        .ok_or(CallbackError::UnknownToken)?;
    debug!("Plugin callback for process {}: {:?}", route.process, message.event);

    match message.event {
        PluginEvent::Up {
            tunnel_alias,
            dns_servers,
        } => events.process_event(
            route.process,
            ProcessEvent::Up {
                tunnel_alias,
                dns_servers,
            },
        ),
        PluginEvent::RouteUp => events.process_event(route.process, ProcessEvent::RouteUp),
        // Down is reported by the monitor once the process has exited
        PluginEvent::Down => {
            let _ = route.control.send(Control::Stop(DownCause::TunnelDown));
        }
    }

    frame::write_ack(&mut stream).await?;
    Ok(())
}
