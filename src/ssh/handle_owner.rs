//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>` of a tunnel session. Dial
//! paths talk to it through a cloneable [`HandleController`] that sends
//! commands over an mpsc channel, so the handle is never shared behind a lock.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "bastion:22".into());
//! let channel = controller.open_direct_tcpip("10.0.0.5", 3306, "127.0.0.1", 0).await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task notices a transport the server has dropped
const LIVENESS_INTERVAL: Duration = Duration::from_secs(2);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel to a target behind the SSH host
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Close the SSH connection
    Disconnect,
}

/// Cloneable handle to the owner task. Holding one grants full control of
/// the session, so it never leaves the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap a raw command sender. Production code uses
    /// [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Non-blocking disconnect for use from synchronous teardown paths.
    /// If the queue is full the owner task is still told to stop once every
    /// controller is dropped.
    pub fn request_disconnect(&self) {
        if let Err(e) = self.cmd_tx.try_send(HandleCommand::Disconnect) {
            debug!("Disconnect request not queued: {}", e);
        }
    }

    /// True while the owner task is running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Move `handle` into its owner task and return the controller for it
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let mut handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

        info!("Handle owner task started for {}", label);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH transport for {} closed by peer", label);
                        break;
                    }
                    continue;
                }
            };

            match cmd {
                Some(HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // Dropped channel is closed by the server
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }
                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for {}", label);
                    break;
                }
                None => {
                    debug!("All controllers dropped for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx }
}

/// Fail every queued command with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_owner_reports_disconnected() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        assert!(controller.is_connected());

        drop(cmd_rx);
        assert!(!controller.is_connected());
        assert!(matches!(
            controller.open_direct_tcpip("db", 5432, "127.0.0.1", 0).await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_drain_fails_queued_commands() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: "db".into(),
                port: 5432,
                originator_host: "127.0.0.1".into(),
                originator_port: 0,
                reply_tx,
            })
            .await
            .unwrap();
        cmd_tx.send(HandleCommand::Disconnect).await.unwrap();

        drain_pending_commands(&mut cmd_rx);

        assert!(matches!(reply_rx.await.unwrap(), Err(russh::Error::Disconnect)));
        assert!(cmd_tx.send(HandleCommand::Disconnect).await.is_err());
    }

    #[tokio::test]
    async fn test_request_disconnect_queues_command() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let controller = HandleController::new(cmd_tx);

        controller.request_disconnect();
        // Full queue is tolerated
        controller.request_disconnect();

        assert!(matches!(cmd_rx.recv().await, Some(HandleCommand::Disconnect)));
    }
}
