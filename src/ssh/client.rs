//! russh client handler

use std::sync::Arc;

use russh::client;
use russh::keys::PublicKey;
use tracing::debug;

use super::error::SshError;
use super::known_hosts::{HostKeyVerifier, KnownHostsStore};

/// Processes server-initiated events for one tunnel session. Host key
/// checks are delegated to the configured [`HostKeyVerifier`].
pub struct ClientHandler {
    host: String,
    port: u16,
    verifier: Arc<dyn HostKeyVerifier>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            host,
            port,
            verifier,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Checking host key for {}:{} ({})",
            self.host,
            self.port,
            KnownHostsStore::fingerprint(server_public_key)
        );
        self.verifier
            .verify(&self.host, self.port, server_public_key)
            .map(|()| true)
    }
}
