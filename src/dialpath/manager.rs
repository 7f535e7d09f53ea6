//! Tunnel Manager
//!
//! Owns the open tunnels, one per saved connection. Each tunnel is one SSH
//! session registered under a unique dial-path name.
//!
//! # Teardown
//!
//! Drivers hold a [`DialLease`] while they use a dial path. `close` marks the
//! tunnel as closing, which refuses new leases and stops loopback listeners.
//! If no lease is outstanding the name is unregistered and the session closed
//! right away; otherwise that happens when the last lease drops.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::forward::LoopbackForward;
use super::naming::{global_namer, DialPathNamer};
use super::registry::{DialRegistry, RegistryError};
use super::{DialError, DialStream, Dialer, TunnelProvider};
use crate::config::types::ConnectionConfig;
use crate::ssh::SshError;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("SSH is not enabled for connection {0}")]
    SshNotEnabled(String),

    #[error("No open tunnel for connection {0}")]
    NoTunnel(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dial(#[from] DialError),
}

impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result of [`TunnelManager::close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    /// Leases still held; teardown runs when the last one drops
    Deferred { leases: usize },
    NotOpen,
}

/// One open tunnel
pub struct TunnelEntry {
    connection_id: String,
    name: String,
    ssh_host: String,
    dialer: Arc<dyn Dialer>,
    registry: Arc<dyn DialRegistry>,
    leases: AtomicUsize,
    closing: AtomicBool,
    torn_down: AtomicBool,
    shutdown: CancellationToken,
}

impl TunnelEntry {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Registered dial-path name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ssh_host(&self) -> &str {
        &self.ssh_host
    }

    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_usable(&self) -> bool {
        !self.is_closing() && self.dialer.is_open()
    }

    /// Cancelled as soon as the tunnel starts closing
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn acquire(self: &Arc<Self>) -> Result<DialLease, DialError> {
        self.leases.fetch_add(1, Ordering::SeqCst);
        let lease = DialLease {
            entry: self.clone(),
        };
        if self.is_closing() {
            // Dropping the lease releases the count
            return Err(DialError::Closing(self.name.clone()));
        }
        Ok(lease)
    }

    fn begin_close(&self) -> CloseOutcome {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.cancel();

        let leases = self.lease_count();
        if leases == 0 {
            self.teardown();
            CloseOutcome::Closed
        } else {
            info!(
                "Deferring teardown of {} until {} lease(s) are released",
                self.name, leases
            );
            CloseOutcome::Deferred { leases }
        }
    }

    fn release(&self) {
        let remaining = self.leases.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.is_closing() {
            self.teardown();
        }
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.unregister(&self.name);
        self.dialer.close();
        info!(
            "Tunnel {} for connection {} closed",
            self.name, self.connection_id
        );
    }
}

/// Keeps a tunnel alive while a driver uses its dial path
pub struct DialLease {
    entry: Arc<TunnelEntry>,
}

impl DialLease {
    pub fn name(&self) -> &str {
        self.entry.name()
    }

    pub async fn dial(
        &self,
        addr: &str,
        cancel: &CancellationToken,
    ) -> Result<DialStream, DialError> {
        if self.entry.torn_down.load(Ordering::SeqCst) || !self.entry.dialer.is_open() {
            return Err(DialError::SessionClosed(self.entry.name.clone()));
        }
        self.entry.dialer.dial(addr, cancel).await
    }
}

impl Drop for DialLease {
    fn drop(&mut self) {
        self.entry.release();
    }
}

/// Fresh names tried before a duplicate registration is reported
const MAX_NAME_ATTEMPTS: usize = 8;

pub struct TunnelManager {
    provider: Arc<dyn TunnelProvider>,
    registry: Arc<dyn DialRegistry>,
    namer: Arc<DialPathNamer>,
    tunnels: DashMap<String, Arc<TunnelEntry>>,
}

impl TunnelManager {
    /// Manager naming its dial paths with the process-wide namer
    pub fn new(provider: Arc<dyn TunnelProvider>, registry: Arc<dyn DialRegistry>) -> Self {
        Self::with_namer(provider, registry, global_namer())
    }

    pub fn with_namer(
        provider: Arc<dyn TunnelProvider>,
        registry: Arc<dyn DialRegistry>,
        namer: Arc<DialPathNamer>,
    ) -> Self {
        Self {
            provider,
            registry,
            namer,
            tunnels: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn DialRegistry> {
        &self.registry
    }

    /// Register `dialer` under a new name. A name another manager already
    /// took is skipped.
    fn register_unique(
        &self,
        host: &str,
        dialer: &Arc<dyn Dialer>,
    ) -> Result<String, RegistryError> {
        let mut attempt = 1;
        loop {
            let name = self.namer.next(host);
            match self.registry.register(&name, Arc::downgrade(dialer)) {
                Ok(()) => return Ok(name),
                Err(RegistryError::Duplicate(_)) if attempt < MAX_NAME_ATTEMPTS => {
                    debug!("Dial path {} already taken, renaming", name);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open (or reuse) the tunnel for `connection_id` and return its entry
    pub async fn open(
        &self,
        connection_id: &str,
        config: &ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<TunnelEntry>, TunnelError> {
        let ssh = match (&config.ssh, config.use_ssh) {
            (Some(ssh), true) if !ssh.host.is_empty() => ssh,
            _ => return Err(TunnelError::SshNotEnabled(connection_id.to_string())),
        };

        if let Some(existing) = self.live_entry(connection_id) {
            debug!("Reusing tunnel {} for {}", existing.name, connection_id);
            return Ok(existing);
        }

        info!(
            "Opening tunnel for connection {} via {}:{}",
            connection_id, ssh.host, ssh.port
        );
        let dialer = self.provider.connect(ssh, cancel).await?;

        let name = match self.register_unique(&ssh.host, &dialer) {
            Ok(name) => name,
            Err(e) => {
                dialer.close();
                return Err(e.into());
            }
        };

        let entry = Arc::new(TunnelEntry {
            connection_id: connection_id.to_string(),
            name,
            ssh_host: ssh.host.clone(),
            dialer,
            registry: self.registry.clone(),
            leases: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        match self.tunnels.entry(connection_id.to_string()) {
            Entry::Occupied(slot) if slot.get().is_usable() => {
                // Lost a race with a concurrent open
                debug!("Discarding duplicate tunnel {}", entry.name);
                entry.begin_close();
                Ok(slot.get().clone())
            }
            Entry::Occupied(mut slot) => {
                let stale = std::mem::replace(slot.get_mut(), entry.clone());
                stale.begin_close();
                Ok(entry)
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    fn live_entry(&self, connection_id: &str) -> Option<Arc<TunnelEntry>> {
        let entry = self.tunnels.get(connection_id)?.value().clone();
        if entry.is_usable() {
            return Some(entry);
        }

        warn!(
            "Tunnel {} for {} is no longer usable, replacing it",
            entry.name, connection_id
        );
        self.tunnels
            .remove_if(connection_id, |_, current| Arc::ptr_eq(current, &entry));
        entry.begin_close();
        None
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<TunnelEntry>> {
        self.tunnels.get(connection_id).map(|e| e.value().clone())
    }

    /// Lease the dial path of an open tunnel
    pub fn lease(&self, connection_id: &str) -> Result<DialLease, TunnelError> {
        let entry = self
            .get(connection_id)
            .ok_or_else(|| TunnelError::NoTunnel(connection_id.to_string()))?;
        Ok(entry.acquire()?)
    }

    /// Close the tunnel of `connection_id`
    pub fn close(&self, connection_id: &str) -> CloseOutcome {
        match self.tunnels.remove(connection_id) {
            Some((_, entry)) => entry.begin_close(),
            None => CloseOutcome::NotOpen,
        }
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    pub fn open_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Bind a loopback listener that forwards to `target` through the tunnel
    /// of `connection_id`
    pub async fn open_loopback(
        &self,
        connection_id: &str,
        target: &str,
    ) -> Result<LoopbackForward, TunnelError> {
        let entry = self
            .get(connection_id)
            .ok_or_else(|| TunnelError::NoTunnel(connection_id.to_string()))?;
        Ok(LoopbackForward::start(entry, target.to_string()).await?)
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{DbType, SshConfig};
    use crate::dialpath::registry::InMemoryDialRegistry;
    use crate::dialpath::testing::FakeProvider;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn ssh_config(host: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(DbType::Postgres);
        config.host = "10.0.0.5".into();
        config.use_ssh = true;
        config.ssh = Some(SshConfig {
            host: host.into(),
            user: "deploy".into(),
            password: "pw".into(),
            ..SshConfig::default()
        });
        config
    }

    fn manager() -> (TunnelManager, Arc<FakeProvider>, Arc<InMemoryDialRegistry>) {
        let provider = Arc::new(FakeProvider::new());
        let registry = Arc::new(InMemoryDialRegistry::new());
        let manager = TunnelManager::new(provider.clone(), registry.clone());
        (manager, provider, registry)
    }

    #[tokio::test]
    async fn test_managers_sharing_registry_never_collide() {
        let registry = Arc::new(InMemoryDialRegistry::new());
        let first = TunnelManager::with_namer(
            Arc::new(FakeProvider::new()),
            registry.clone(),
            Arc::new(DialPathNamer::with_clock(|| 1_000)),
        );
        let second = TunnelManager::with_namer(
            Arc::new(FakeProvider::new()),
            registry.clone(),
            Arc::new(DialPathNamer::with_clock(|| 1_000)),
        );
        let cancel = CancellationToken::new();
        let config = ssh_config("bastion");

        let a = first.open("pg", &config, &cancel).await.unwrap();
        let b = second.open("pg", &config, &cancel).await.unwrap();

        assert_eq!(a.name(), "ssh_bastion_1000");
        assert_eq!(b.name(), "ssh_bastion_1001");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_open_registers_unique_names() {
        let (manager, _, registry) = manager();
        let cancel = CancellationToken::new();
        let config = ssh_config("bastion");

        let a = manager.open("a", &config, &cancel).await.unwrap();
        let b = manager.open("b", &config, &cancel).await.unwrap();

        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("ssh_bastion_"));
        assert_eq!(registry.names().len(), 2);
    }

    #[tokio::test]
    async fn test_open_reuses_live_tunnel() {
        let (manager, provider, _) = manager();
        let cancel = CancellationToken::new();
        let config = ssh_config("bastion");

        let first = manager.open("a", &config, &cancel).await.unwrap();
        let second = manager.open("a", &config, &cancel).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_open_requires_ssh() {
        let (manager, provider, _) = manager();
        let direct = ConnectionConfig::new(DbType::Mysql);
        assert!(matches!(
            manager.open("a", &direct, &CancellationToken::new()).await,
            Err(TunnelError::SshNotEnabled(_))
        ));
        assert_eq!(provider.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_is_surfaced() {
        let (manager, _, registry) = manager();
        let config = ssh_config(FakeProvider::UNREACHABLE_HOST);
        assert!(matches!(
            manager.open("a", &config, &CancellationToken::new()).await,
            Err(TunnelError::Ssh(SshError::ConnectionFailed(_)))
        ));
        assert!(registry.is_empty());
        assert_eq!(manager.open_count(), 0);
    }

    #[tokio::test]
    async fn test_close_without_leases() {
        let (manager, provider, registry) = manager();
        let entry = manager
            .open("a", &ssh_config("bastion"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manager.close("a"), CloseOutcome::Closed);
        assert!(registry.is_empty());
        assert!(!provider.dialers()[0].is_open());
        assert!(entry.shutdown_token().is_cancelled());
        assert_eq!(manager.close("a"), CloseOutcome::NotOpen);
    }

    #[tokio::test]
    async fn test_close_is_deferred_while_leased() {
        let (manager, provider, registry) = manager();
        let cancel = CancellationToken::new();
        manager.open("a", &ssh_config("bastion"), &cancel).await.unwrap();

        let lease = manager.lease("a").unwrap();
        assert_eq!(manager.close("a"), CloseOutcome::Deferred { leases: 1 });

        // In-flight driver keeps working
        let mut stream = lease.dial("10.0.0.5:5432", &cancel).await.unwrap();
        stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(registry.len(), 1);

        drop(lease);
        assert!(registry.is_empty());
        assert!(!provider.dialers()[0].is_open());
    }

    #[tokio::test]
    async fn test_closing_tunnel_refuses_new_leases() {
        let (manager, _, _) = manager();
        let entry = manager
            .open("a", &ssh_config("bastion"), &CancellationToken::new())
            .await
            .unwrap();
        let held = manager.lease("a").unwrap();
        manager.close("a");

        assert!(matches!(entry.acquire(), Err(DialError::Closing(_))));
        assert_eq!(entry.lease_count(), 1);
        assert!(matches!(manager.lease("a"), Err(TunnelError::NoTunnel(_))));
        drop(held);
        assert_eq!(entry.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_after_close_is_reported() {
        let (manager, _, registry) = manager();
        let cancel = CancellationToken::new();
        let entry = manager
            .open("a", &ssh_config("bastion"), &cancel)
            .await
            .unwrap();
        let name = entry.name().to_string();
        manager.close("a");

        let registry: &dyn DialRegistry = registry.as_ref();
        assert!(matches!(
            crate::dialpath::dial(registry, &name, "10.0.0.5:5432", &cancel).await,
            Err(DialError::UnknownPath(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let (manager, provider, registry) = manager();
        let cancel = CancellationToken::new();
        let config = ssh_config("bastion");

        let first = manager.open("a", &config, &cancel).await.unwrap();
        provider.dialers()[0].close();
        let second = manager.open("a", &config, &cancel).await.unwrap();

        assert_ne!(first.name(), second.name());
        assert_eq!(provider.connect_count(), 2);
        assert_eq!(registry.names(), vec![second.name().to_string()]);
    }

    #[tokio::test]
    async fn test_close_all() {
        let (manager, _, registry) = manager();
        let cancel = CancellationToken::new();
        manager.open("a", &ssh_config("h1"), &cancel).await.unwrap();
        manager.open("b", &ssh_config("h2"), &cancel).await.unwrap();

        manager.close_all();
        assert_eq!(manager.open_count(), 0);
        assert!(registry.is_empty());
    }
}
