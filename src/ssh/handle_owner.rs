//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to
//! it through a cloneable [`HandleController`] that sends commands over an
//! mpsc channel. Closing the transport is a command like any other, so a
//! second `disconnect()` after the owner has exited is simply a failed send.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, session_id);
//! let channel = controller.open_session_channel().await?;
//! // from any task, any number of times
//! controller.disconnect().await;
//! ```

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for PTY/shell)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Close the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (it copies the sender). Any holder can open channels or
/// close the connection, so it is never handed outside the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a session channel (for PTY/shell)
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Close the SSH connection. Safe to call repeatedly and after the
    /// connection is already gone.
    pub async fn disconnect(&self) {
        if self.cmd_tx.send(HandleCommand::Disconnect).await.is_err() {
            debug!("Disconnect requested but handle owner already stopped");
        }
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller for sending commands. The
/// task ends on `Disconnect` or when every controller has been dropped.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(16);

    tokio::spawn(async move {
        info!("Handle owner task started for session {}", session_id);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }
                HandleCommand::Disconnect => {
                    info!("Disconnect requested for session {}", session_id);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            debug!("Disconnect for session {} returned: {}", session_id, e);
        }
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController::new(cmd_tx)
}

/// Reject everything still queued with `Disconnect`
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
