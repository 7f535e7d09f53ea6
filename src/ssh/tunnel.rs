//! SSH Tunnel Provider
//!
//! Opens one authenticated SSH session per call and exposes it as a
//! [`Dialer`]: every dial becomes a direct-tcpip channel to the target as
//! seen from the SSH host.
//!
//! Auth methods are collected up front. A readable, parseable private key is
//! offered first, then a non-empty password; a config with neither fails
//! before any network traffic. Connect, handshake and auth share one bounded
//! timeout. Failures are returned as-is; retrying is up to the caller.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PrivateKey;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::known_hosts::{HostKeyPolicy, HostKeyVerifier};
use crate::config::types::{format_host_port, SshConfig};
use crate::dialpath::{parse_dial_addr, DialError, DialStream, Dialer, TunnelProvider};

/// Connect + handshake + auth budget
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Credentials offered to the server, in order
pub struct TunnelAuth {
    key: Option<Arc<PrivateKey>>,
    password: Option<String>,
}

impl TunnelAuth {
    pub fn from_config(ssh: &SshConfig) -> Result<Self, SshError> {
        let key = if ssh.key_path.is_empty() {
            None
        } else {
            let path = expand_home(&ssh.key_path);
            match russh::keys::load_secret_key(&path, None) {
                Ok(key) => Some(Arc::new(key)),
                Err(e) => {
                    warn!("Skipping private key {:?}: {}", path, e);
                    None
                }
            }
        };

        let password = (!ssh.password.is_empty()).then(|| ssh.password.clone());

        if key.is_none() && password.is_none() {
            return Err(SshError::NoAuthMethods(format_host_port(&ssh.host, ssh.port)));
        }
        Ok(Self { key, password })
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }
}

impl fmt::Debug for TunnelAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelAuth")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    auth: &TunnelAuth,
) -> Result<(), SshError> {
    if let Some(key) = &auth.key {
        let result = handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), None))
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
        if result.success() {
            debug!("Public key accepted for {}", user);
            return Ok(());
        }
        debug!("Public key rejected for {}", user);
    }

    if let Some(password) = &auth.password {
        let result = handle
            .authenticate_password(user, password)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
        if result.success() {
            debug!("Password accepted for {}", user);
            return Ok(());
        }
        debug!("Password rejected for {}", user);
    }

    Err(SshError::AuthenticationFailed(format!(
        "server rejected every offered method for user {:?}",
        user
    )))
}

pub struct SshTunnelProvider {
    dial_timeout: Duration,
    verifier: Arc<dyn HostKeyVerifier>,
}

impl Default for SshTunnelProvider {
    fn default() -> Self {
        Self::new(HostKeyPolicy::default().verifier())
    }
}

impl SshTunnelProvider {
    pub fn new(verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            verifier,
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Connect and authenticate one session
    pub async fn open(
        &self,
        ssh: &SshConfig,
        cancel: &CancellationToken,
    ) -> Result<SshTunnel, SshError> {
        let label = format_host_port(&ssh.host, ssh.port);
        let auth = TunnelAuth::from_config(ssh)?;

        info!("Connecting tunnel session to {} as {}", label, ssh.user);

        let config = client::Config {
            // Liveness comes from keepalives
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = ClientHandler::new(ssh.host.clone(), ssh.port, self.verifier.clone());

        let establish = async {
            let mut handle = client::connect(
                Arc::new(config),
                (ssh.host.as_str(), ssh.port),
                handler,
            )
            .await
            .map_err(|e| match e {
                SshError::ProtocolError(msg) => SshError::ConnectionFailed(msg),
                other => other,
            })?;
            debug!("SSH handshake with {} completed", label);
            authenticate(&mut handle, &ssh.user, &auth).await?;
            Ok::<_, SshError>(handle)
        };

        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SshError::Cancelled),
            result = tokio::time::timeout(self.dial_timeout, establish) => {
                result.map_err(|_| {
                    SshError::Timeout(format!(
                        "SSH dial to {} exceeded {}ms",
                        label,
                        self.dial_timeout.as_millis()
                    ))
                })??
            }
        };

        info!("Tunnel session to {} established", label);
        Ok(SshTunnel {
            controller: spawn_handle_owner_task(handle, label.clone()),
            label,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl TunnelProvider for SshTunnelProvider {
    async fn connect(
        &self,
        ssh: &SshConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Dialer>, SshError> {
        let tunnel: Arc<dyn Dialer> = Arc::new(self.open(ssh, cancel).await?);
        Ok(tunnel)
    }
}

/// One open SSH session used as a TCP proxy
pub struct SshTunnel {
    label: String,
    controller: HandleController,
    closed: AtomicBool,
}

#[async_trait]
impl Dialer for SshTunnel {
    async fn dial(&self, addr: &str, cancel: &CancellationToken) -> Result<DialStream, DialError> {
        if !self.is_open() {
            return Err(DialError::SessionClosed(self.label.clone()));
        }
        let (host, port) = parse_dial_addr(addr)?;

        let channel = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            result = self.controller.open_direct_tcpip(&host, u32::from(port), "127.0.0.1", 0) => {
                result.map_err(|e| match e {
                    SshError::Disconnected => DialError::SessionClosed(self.label.clone()),
                    other => DialError::Channel(other.to_string()),
                })?
            }
        };

        debug!("Opened direct-tcpip channel to {} via {}", addr, self.label);
        let stream: DialStream = Box::pin(channel.into_stream());
        Ok(stream)
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.controller.is_connected()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closing tunnel session to {}", self.label);
            self.controller.request_disconnect();
        }
    }
}
