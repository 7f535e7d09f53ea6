//! Dial paths
//!
//! A dial path is a driver-level network name backed by a forwarding
//! function instead of a resolvable host. Opening a tunnel registers its SSH
//! session under a fresh name; a database driver told to connect through
//! that name ends up calling [`Dialer::dial`] on the session.
//!
//! # Lifecycle
//!
//! ```text
//! TunnelManager::open ──► TunnelProvider::connect ──► DialRegistry::register(name, Weak<dyn Dialer>)
//!        │
//!        ├── lease()  ──► DialLease::dial(addr) ──► Dialer::dial
//!        │
//!        └── close()  ──► unregister + Dialer::close   (deferred while leases are held)
//! ```

pub mod forward;
pub mod manager;
pub mod naming;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::types::SshConfig;
use crate::ssh::SshError;

pub use forward::LoopbackForward;
pub use manager::{CloseOutcome, DialLease, TunnelEntry, TunnelError, TunnelManager};
pub use naming::{global_namer, DialPathNamer};
pub use registry::{dial, global_registry, DialRegistry, InMemoryDialRegistry, RegistryError};

/// Byte stream returned by a dial
pub trait DialIo: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> DialIo for T {}

pub type DialStream = Pin<Box<dyn DialIo>>;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Unknown dial path: {0}")]
    UnknownPath(String),

    #[error("Dial path {0} refers to a closed session")]
    SessionClosed(String),

    #[error("Dial path {0} is closing")]
    Closing(String),

    #[error("Invalid dial address: {0}")]
    InvalidAddress(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dial cancelled")]
    Cancelled,
}

impl Serialize for DialError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Something that can open TCP streams on behalf of a driver
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str, cancel: &CancellationToken) -> Result<DialStream, DialError>;

    fn is_open(&self) -> bool;

    /// Release the underlying session. Idempotent.
    fn close(&self);
}

/// Opens one authenticated session per call
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn connect(
        &self,
        ssh: &SshConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Dialer>, SshError>;
}

/// Where a driver should connect for a given saved connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NetworkPath {
    Direct { host: String, port: u16 },
    /// `name` replaces the network name in the driver's connection string;
    /// `target` is the database address as seen from the SSH host.
    Tunnel { name: String, target: String },
}

/// Split `host:port` or `[v6]:port`
pub fn parse_dial_addr(addr: &str) -> Result<(String, u16), DialError> {
    let invalid = || DialError::InvalidAddress(addr.to_string());

    let (host, port) = match addr.strip_prefix('[') {
        Some(rest) => rest.split_once("]:").ok_or_else(invalid)?,
        None => addr.rsplit_once(':').ok_or_else(invalid)?,
    };
    let host = host.trim();
    if host.is_empty() || (!addr.starts_with('[') && host.contains(':')) {
        return Err(invalid());
    }

    match port.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok((host.to_string(), port)),
        _ => Err(invalid()),
    }
}
