//! Loopback forwarding
//!
//! Forwards connections from `127.0.0.1:<ephemeral>` to a target behind a
//! tunnel, for drivers that only accept a literal `host:port`. Every bridged
//! socket holds its own [`DialLease`](super::DialLease), so closing the
//! tunnel stops the listener at once but waits for open sockets to finish.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::manager::TunnelEntry;
use super::DialError;

/// Connection statistics of a loopback forward
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub connection_count: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Handle to a running loopback forward. Dropping it stops the listener.
pub struct LoopbackForward {
    bound_addr: SocketAddr,
    target: String,
    stop: CancellationToken,
    stats: Arc<RwLock<ForwardStats>>,
}

impl LoopbackForward {
    pub(crate) async fn start(entry: Arc<TunnelEntry>, target: String) -> Result<Self, DialError> {
        super::parse_dial_addr(&target)?;
        if entry.is_closing() {
            return Err(DialError::Closing(entry.name().to_string()));
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let bound_addr = listener.local_addr()?;

        info!(
            "Started loopback forward {} -> {} via {}",
            bound_addr,
            target,
            entry.name()
        );

        // Child token: cancelled by stop() or by the tunnel closing
        let stop = entry.shutdown_token().child_token();
        let stats = Arc::new(RwLock::new(ForwardStats::default()));

        tokio::spawn(accept_loop(
            listener,
            entry,
            target.clone(),
            stop.clone(),
            stats.clone(),
        ));

        Ok(Self {
            bound_addr,
            target,
            stop,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("Stopping loopback forward on {}", self.bound_addr);
            self.stop.cancel();
        }
    }
}

impl Drop for LoopbackForward {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    entry: Arc<TunnelEntry>,
    target: String,
    stop: CancellationToken,
    stats: Arc<RwLock<ForwardStats>>,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                };

                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                debug!("Accepted {} for {}", peer, target);

                {
                    let mut s = stats.write();
                    s.connection_count += 1;
                    s.active_connections += 1;
                }

                let entry = entry.clone();
                let target = target.clone();
                let stop = stop.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    if let Err(e) = bridge(entry, stream, &target, &stop, &stats).await {
                        warn!("Loopback connection to {} failed: {}", target, e);
                    }
                    let mut s = stats.write();
                    s.active_connections = s.active_connections.saturating_sub(1);
                });
            }
        }
    }
    debug!("Loopback forward to {} exited", target);
}

async fn bridge(
    entry: Arc<TunnelEntry>,
    mut local: TcpStream,
    target: &str,
    stop: &CancellationToken,
    stats: &RwLock<ForwardStats>,
) -> Result<(), DialError> {
    let lease = entry.acquire()?;
    let mut remote = lease.dial(target, stop).await?;

    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((sent, received)) => {
            let mut s = stats.write();
            s.bytes_sent += sent;
            s.bytes_received += received;
            debug!("Loopback connection closed ({} up, {} down)", sent, received);
        }
        Err(e) => debug!("Loopback connection ended: {}", e),
    }
    Ok(())
}
