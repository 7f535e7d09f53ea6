//! Connection Service
//!
//! The API the UI layer calls: saved-connection CRUD with persistence, and
//! resolving a saved connection to the network path its driver should use.
//!
//! State is held behind a lock and persisted from a snapshot after every
//! mutation. Saves are serialized and snapshot the state only once they hold
//! the save lock, so the file on disk always ends on the newest state and
//! callers may share one service across tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{
    merge, AppState, ConfigStorage, SavedConnection, SortPreference, StorageError, StoreError,
};
use crate::dialpath::{
    global_registry, CloseOutcome, DialLease, DialRegistry, LoopbackForward, NetworkPath,
    TunnelError, TunnelManager, TunnelProvider,
};
use crate::ssh::{HostKeyPolicy, SshTunnelProvider, DEFAULT_DIAL_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl serde::Serialize for ServiceError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Clone)]
pub struct ServiceOptions {
    /// Defaults to `<config_dir>/state.json`
    pub state_path: Option<PathBuf>,
    pub dial_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
    /// Defaults to the process-wide registry
    pub registry: Option<Arc<dyn DialRegistry>>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            state_path: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            host_key_policy: HostKeyPolicy::default(),
            registry: None,
        }
    }
}

pub struct ConnectionService {
    storage: ConfigStorage,
    state: RwLock<AppState>,
    save_lock: tokio::sync::Mutex<()>,
    tunnels: TunnelManager,
}

impl ConnectionService {
    /// Load persisted state and wire up the SSH tunnel provider
    pub async fn load(options: ServiceOptions) -> Result<Self, ServiceError> {
        let storage = match options.state_path {
            Some(path) => ConfigStorage::with_path(path),
            None => ConfigStorage::new()?,
        };
        let provider = SshTunnelProvider::new(options.host_key_policy.verifier())
            .with_dial_timeout(options.dial_timeout);
        let registry = options
            .registry
            .unwrap_or_else(|| global_registry() as Arc<dyn DialRegistry>);

        Self::with_parts(storage, Arc::new(provider), registry).await
    }

    pub async fn with_parts(
        storage: ConfigStorage,
        provider: Arc<dyn TunnelProvider>,
        registry: Arc<dyn DialRegistry>,
    ) -> Result<Self, ServiceError> {
        let state = storage.load().await?;
        info!(
            "Loaded {} saved connections from {:?}",
            state.connections.len(),
            storage.path()
        );

        Ok(Self {
            storage,
            state: RwLock::new(state),
            save_lock: tokio::sync::Mutex::new(()),
            tunnels: TunnelManager::new(provider, registry),
        })
    }

    async fn save(&self) -> Result<(), ServiceError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.state.read().clone();
        self.storage.save(&snapshot).await?;
        Ok(())
    }

    pub fn list_connections(&self) -> Vec<SavedConnection> {
        self.state.read().connections.list().to_vec()
    }

    pub fn get_connection(&self, id: &str) -> Option<SavedConnection> {
        self.state.read().connections.get(id).cloned()
    }

    pub async fn create_connection(&self, raw: &Value) -> Result<SavedConnection, ServiceError> {
        let created = self.state.write().connections.add(raw).clone();
        self.save().await?;
        Ok(created)
    }

    /// Replace a connection. Its tunnel, if any, is closed since it was
    /// opened for the old settings.
    pub async fn update_connection(
        &self,
        id: &str,
        raw: &Value,
    ) -> Result<SavedConnection, ServiceError> {
        let updated = self.state.write().connections.update(id, raw)?.clone();
        self.tunnels.close(id);
        self.save().await?;
        Ok(updated)
    }

    pub async fn remove_connection(&self, id: &str) -> Result<SavedConnection, ServiceError> {
        let removed = self.state.write().connections.remove(id)?;
        self.tunnels.close(id);
        self.save().await?;
        Ok(removed)
    }

    /// Append connections from a JSON array. Returns the assigned ids.
    pub async fn import_connections(&self, json: &str) -> Result<Vec<String>, ServiceError> {
        let ids = self.state.write().connections.import_json(json)?;
        self.save().await?;
        Ok(ids)
    }

    pub fn export_connections(&self) -> Result<String, ServiceError> {
        Ok(self.state.read().connections.export_json()?)
    }

    /// Resolve where the driver for `id` should connect, opening the SSH
    /// tunnel when the connection uses one
    pub async fn open_network_path(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<NetworkPath, ServiceError> {
        let conn = self
            .get_connection(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let config = &conn.config;

        if !config.use_ssh {
            debug!("Connection {} is direct", id);
            return Ok(NetworkPath::Direct {
                host: config.host.clone(),
                port: config.port,
            });
        }

        let entry = self.tunnels.open(id, config, cancel).await?;
        Ok(NetworkPath::Tunnel {
            name: entry.name().to_string(),
            target: config.target_addr(),
        })
    }

    pub fn close_network_path(&self, id: &str) -> CloseOutcome {
        self.tunnels.close(id)
    }

    /// Hold the dial path of `id` open while a driver connects through it
    pub fn lease(&self, id: &str) -> Result<DialLease, ServiceError> {
        Ok(self.tunnels.lease(id)?)
    }

    /// Expose the tunneled database of `id` on a loopback port
    pub async fn open_loopback(&self, id: &str) -> Result<LoopbackForward, ServiceError> {
        let target = self
            .get_connection(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .config
            .target_addr();
        Ok(self.tunnels.open_loopback(id, &target).await?)
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    /// Snapshot of the whole state
    pub fn state(&self) -> AppState {
        self.state.read().clone()
    }

    /// Mutate settings, re-sanitize the result and persist it
    pub async fn update_settings<F>(&self, f: F) -> Result<AppState, ServiceError>
    where
        F: FnOnce(&mut AppState),
    {
        let updated = {
            let mut state = self.state.write();
            f(&mut state);
            let raw = serde_json::to_value(&*state)?;
            *state = merge(&raw, &AppState::default());
            state.clone()
        };
        self.save().await?;
        Ok(updated)
    }

    /// Count one more open of `table`. Returns the new count.
    pub async fn record_table_access(
        &self,
        connection_id: &str,
        db_name: &str,
        table: &str,
    ) -> Result<u64, ServiceError> {
        let key = AppState::table_access_key(connection_id, db_name, table);
        let state = self
            .update_settings(|state| {
                let count = state.table_access_count.entry(key.clone()).or_insert(0);
                *count = count.saturating_add(1);
            })
            .await?;
        Ok(state.table_access_count.get(&key).copied().unwrap_or(0))
    }

    pub async fn set_table_sort_preference(
        &self,
        connection_id: &str,
        db_name: &str,
        preference: SortPreference,
    ) -> Result<(), ServiceError> {
        let key = AppState::table_sort_key(connection_id, db_name);
        self.update_settings(|state| {
            state.table_sort_preference.insert(key, preference);
        })
        .await?;
        Ok(())
    }

    /// Close every tunnel
    pub fn shutdown(&self) {
        info!("Closing {} open tunnel(s)", self.tunnels.open_count());
        self.tunnels.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Appearance, DbType, Theme};
    use crate::dialpath::testing::FakeProvider;
    use crate::dialpath::InMemoryDialRegistry;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        registry: Arc<InMemoryDialRegistry>,
        service: ConnectionService,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let registry = Arc::new(InMemoryDialRegistry::new());
        let service = ConnectionService::with_parts(
            ConfigStorage::with_path(path.clone()),
            Arc::new(FakeProvider::new()),
            registry.clone(),
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            path,
            registry,
            service,
        }
    }

    fn tunneled() -> Value {
        json!({
            "id": "pg",
            "name": "prod",
            "config": {
                "type": "postgres",
                "host": "10.0.0.5",
                "useSSH": true,
                "ssh": { "host": "bastion", "user": "deploy", "password": "pw" },
            },
        })
    }

    #[tokio::test]
    async fn test_create_is_persisted() {
        let f = fixture().await;
        let created = f
            .service
            .create_connection(&json!({ "config": { "type": "redis", "host": "cache" } }))
            .await
            .unwrap();
        assert_eq!(created.id, "conn-1");
        assert_eq!(created.name, "redis-cache");

        let reloaded = ConfigStorage::with_path(f.path.clone()).load().await.unwrap();
        assert_eq!(reloaded.connections.list(), &[created]);
    }

    #[tokio::test]
    async fn test_direct_network_path() {
        let f = fixture().await;
        f.service
            .create_connection(&json!({ "id": "my", "config": { "type": "mysql", "host": "db" } }))
            .await
            .unwrap();

        let path = f
            .service
            .open_network_path("my", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            path,
            NetworkPath::Direct {
                host: "db".into(),
                port: 3306
            }
        );
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_network_path() {
        let f = fixture().await;
        f.service.create_connection(&tunneled()).await.unwrap();

        let path = f
            .service
            .open_network_path("pg", &CancellationToken::new())
            .await
            .unwrap();
        let NetworkPath::Tunnel { name, target } = path else {
            panic!("expected a tunnel path");
        };
        assert!(name.starts_with("ssh_bastion_"));
        assert_eq!(target, "10.0.0.5:5432");
        assert_eq!(f.registry.names(), vec![name]);
    }

    #[tokio::test]
    async fn test_update_and_remove_close_tunnel() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        f.service.create_connection(&tunneled()).await.unwrap();

        f.service.open_network_path("pg", &cancel).await.unwrap();
        f.service.update_connection("pg", &tunneled()).await.unwrap();
        assert!(f.registry.is_empty());

        f.service.open_network_path("pg", &cancel).await.unwrap();
        assert_eq!(f.registry.len(), 1);
        f.service.remove_connection("pg").await.unwrap();
        assert!(f.registry.is_empty());

        assert!(matches!(
            f.service.open_network_path("pg", &cancel).await,
            Err(ServiceError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_remove_waits_for_lease() {
        let f = fixture().await;
        f.service.create_connection(&tunneled()).await.unwrap();
        f.service
            .open_network_path("pg", &CancellationToken::new())
            .await
            .unwrap();

        let lease = f.service.lease("pg").unwrap();
        f.service.remove_connection("pg").await.unwrap();
        assert_eq!(f.registry.len(), 1);
        drop(lease);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_import_export() {
        let f = fixture().await;
        let ids = f
            .service
            .import_connections(r#"[{"id":"a","config":{"type":"mongodb"}},{"id":"a"}]"#)
            .await
            .unwrap();
        assert_eq!(ids, vec!["a", "a-2"]);
        assert_eq!(f.service.list_connections()[0].config.db_type, DbType::Mongodb);

        assert!(matches!(
            f.service.import_connections("{}").await,
            Err(ServiceError::Store(StoreError::Format(_)))
        ));

        let exported: Value = serde_json::from_str(&f.service.export_connections().unwrap()).unwrap();
        assert_eq!(exported.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_settings_resanitizes() {
        let f = fixture().await;
        let state = f
            .service
            .update_settings(|state| {
                state.theme = Theme::Dark;
                state.appearance = Appearance { opacity: 5.0, blur: 3 };
                state.query_options.max_rows = 0;
            })
            .await
            .unwrap();

        assert_eq!(state.theme, Theme::Dark);
        assert_eq!(state.appearance, Appearance { opacity: 1.0, blur: 3 });
        assert_eq!(state.query_options.max_rows, 5000);

        let reloaded = ConfigStorage::with_path(f.path.clone()).load().await.unwrap();
        assert_eq!(reloaded, state);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_all_persisted() {
        let f = fixture().await;
        let service = Arc::new(f.service);

        let tasks: Vec<_> = (0..32)
            .map(|n| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .create_connection(&json!({ "id": format!("c{}", n), "config": { "host": "db" } }))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reloaded = ConfigStorage::with_path(f.path.clone()).load().await.unwrap();
        assert_eq!(reloaded.connections.len(), 32);
        assert_eq!(reloaded.connections.list(), service.list_connections().as_slice());
    }

    #[tokio::test]
    async fn test_table_access_and_sort_preference_persist() {
        let f = fixture().await;
        assert_eq!(f.service.record_table_access("pg", "app", "users").await.unwrap(), 1);
        assert_eq!(f.service.record_table_access("pg", "app", "users").await.unwrap(), 2);
        f.service
            .set_table_sort_preference("pg", "app", SortPreference::Frequency)
            .await
            .unwrap();

        let reloaded = ConfigStorage::with_path(f.path.clone()).load().await.unwrap();
        assert_eq!(reloaded.table_access_count.get("pg-app-users"), Some(&2));
        assert_eq!(
            reloaded.table_sort_preference.get("pg-app"),
            Some(&SortPreference::Frequency)
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let f = fixture().await;
        f.service.create_connection(&tunneled()).await.unwrap();
        f.service
            .open_network_path("pg", &CancellationToken::new())
            .await
            .unwrap();

        f.service.shutdown();
        assert!(f.registry.is_empty());
        assert_eq!(f.service.tunnels().open_count(), 0);
    }
}
