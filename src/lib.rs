//! DbNexus - connection management core of a multi-database desktop client
//!
//! Saved connections are persisted, sanitized and resolved to a network path
//! their database driver can use: either a direct `host:port` or a named dial
//! path backed by an SSH tunnel.

pub mod config;
pub mod dialpath;
pub mod service;
pub mod ssh;

pub use config::{AppState, ConnectionConfig, DbType, SavedConnection, SshConfig};
pub use dialpath::{DialRegistry, NetworkPath, TunnelManager};
pub use service::{ConnectionService, ServiceError, ServiceOptions};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter. Calling it twice is a no-op.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
