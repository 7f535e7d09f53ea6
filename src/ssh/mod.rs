//! SSH module - tunnel sessions for database connections
//!
//! Built on russh. A tunnel session is used purely as a TCP proxy: it is
//! authenticated once, owned by a single task, and dialed through
//! direct-tcpip channels.
//!
//! # Features
//! - Key and password authentication, offered in that order
//! - Pluggable host key verification (known_hosts by default)
//! - Bounded, cancellable connect and handshake

mod client;
mod error;
mod handle_owner;
pub mod known_hosts;
mod tunnel;

pub use client::ClientHandler;
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{
    AcceptAnyHostKey, HostKeyPolicy, HostKeyVerification, HostKeyVerifier, KnownHostsStore,
    KnownHostsVerifier,
};
pub use tunnel::{SshTunnel, SshTunnelProvider, TunnelAuth, DEFAULT_DIAL_TIMEOUT};
