//! Tunnel lifecycle
//!
//! The [`TunnelStateMachine`] is the only writer of tunnel state. Everything
//! that wants to change it (RPC clients, the supervisor's process events,
//! shutdown) goes through a [`TunnelHandle`], which enqueues a
//! [`TunnelCommand`] into the machine's single inbox.

pub mod machine;
pub mod state;

pub use machine::{MachineOptions, TunnelStateMachine};
pub use state::{BlockReason, ErrorCode, EventListener, Notification, TunnelState};

use crate::net::{RelayEndpoint, SecuritySettings};
use crate::openvpn::{ProcessEvent, ProcessId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

/// Why a command was not carried out
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Cannot {command} while {state}")]
    InvalidState {
        command: &'static str,
        state: &'static str,
    },
    #[error("Failed to apply firewall policy: {0}")]
    PolicyApply(String),
    #[error("Failed to start tunnel process: {0}")]
    ProcessSpawn(String),
    #[error("Tunnel state machine is not running")]
    Unavailable,
}

pub type Reply = oneshot::Sender<Result<(), CommandError>>;

/// Inputs processed by the state machine, strictly in arrival order
#[derive(Debug)]
pub enum TunnelCommand {
    Connect {
        relay: RelayEndpoint,
        settings: SecuritySettings,
        reply: Option<Reply>,
    },
    Disconnect {
        reply: Option<Reply>,
    },
    Block {
        reply: Option<Reply>,
    },
    Reset {
        reply: Option<Reply>,
    },
    Process {
        process: ProcessId,
        event: ProcessEvent,
    },
    Shutdown {
        done: Option<oneshot::Sender<()>>,
    },
}

/// Receiving half handed to [`TunnelStateMachine::new`]
pub struct TunnelInbox {
    pub(crate) commands: mpsc::UnboundedReceiver<TunnelCommand>,
    pub(crate) state: watch::Sender<TunnelState>,
}

/// Cloneable sender side of the state machine's inbox
#[derive(Clone)]
pub struct TunnelHandle {
    commands: mpsc::UnboundedSender<TunnelCommand>,
    state: watch::Receiver<TunnelState>,
}

/// Create a connected handle/inbox pair
pub fn channel() -> (TunnelHandle, TunnelInbox) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(TunnelState::Disconnected);
    (
        TunnelHandle {
            commands: commands_tx,
            state: state_rx,
        },
        TunnelInbox {
            commands: commands_rx,
            state: state_tx,
        },
    )
}

impl TunnelHandle {
    /// Enqueue a command without waiting for its outcome
    pub fn send(&self, command: TunnelCommand) -> Result<(), CommandError> {
        self.commands
            .send(command)
            .map_err(|_| CommandError::Unavailable)
    }

    async fn request<F>(&self, make: F) -> Result<(), CommandError>
    where
        F: FnOnce(Option<Reply>) -> TunnelCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.send(make(Some(tx)))?;
        rx.await.map_err(|_| CommandError::Unavailable)?
    }

    pub async fn connect(
        &self,
        relay: RelayEndpoint,
        settings: SecuritySettings,
    ) -> Result<(), CommandError> {
        self.request(|reply| TunnelCommand::Connect {
            relay,
            settings,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<(), CommandError> {
        self.request(|reply| TunnelCommand::Disconnect { reply }).await
    }

    pub async fn block(&self) -> Result<(), CommandError> {
        self.request(|reply| TunnelCommand::Block { reply }).await
    }

    pub async fn reset(&self) -> Result<(), CommandError> {
        self.request(|reply| TunnelCommand::Reset { reply }).await
    }

    /// Ask the machine to apply the shutdown policy and stop
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        let (tx, rx) = oneshot::channel();
        self.send(TunnelCommand::Shutdown { done: Some(tx) })?;
        rx.await.map_err(|_| CommandError::Unavailable)
    }

    /// Forward a lifecycle event from the tunnel process
    pub fn process_event(&self, process: ProcessId, event: ProcessEvent) {
        if self
            .send(TunnelCommand::Process { process, event })
            .is_err()
        {
            tracing::debug!("Dropping process event, state machine stopped");
        }
    }

    /// Latest published state
    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// A receiver observing every published state
    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_without_machine_is_unavailable() {
        let (handle, inbox) = channel();
        drop(inbox);

        assert_eq!(handle.disconnect().await, Err(CommandError::Unavailable));
        assert_eq!(handle.state(), TunnelState::Disconnected);
    }

    #[test]
    fn test_command_error_display() {
        let err = CommandError::InvalidState {
            command: "connect",
            state: "connected",
        };
        assert_eq!(err.to_string(), "Cannot connect while connected");
    }
}
