//! Saved-Connection Store
//!
//! In-memory list of [`SavedConnection`] keyed by id. Every entry that goes in
//! passes through the sanitizer, and ids stay unique.
//!
//! The store has no internal locking: mutation takes `&mut self`, so callers
//! on several threads must serialize access themselves.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::sanitize::{claim_unique_id, sanitize_saved_connection, sanitize_saved_connections};
use super::types::SavedConnection;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Invalid import format: {0}")]
    Format(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Serialize for StoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConnectionStore {
    connections: Vec<SavedConnection>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an untyped list (persisted or imported)
    pub fn from_value(value: &Value) -> Self {
        Self {
            connections: sanitize_saved_connections(Some(value)),
        }
    }

    pub fn list(&self) -> &[SavedConnection] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SavedConnection> {
        self.connections.iter().find(|c| c.id == id)
    }

    fn used_ids(&self) -> HashSet<String> {
        self.connections.iter().map(|c| c.id.clone()).collect()
    }

    /// Sanitize and append a connection. A colliding id is suffixed.
    pub fn add(&mut self, raw: &Value) -> &SavedConnection {
        let ordinal = self.connections.len() + 1;
        let mut conn = sanitize_saved_connection(raw, ordinal);
        conn.id = claim_unique_id(&mut self.used_ids(), &conn.id, ordinal);

        info!(
            "Adding connection {} ({}, {})",
            conn.id, conn.name, conn.config.db_type
        );
        self.connections.push(conn);
        &self.connections[ordinal - 1]
    }

    /// Replace the connection stored under `id`. The id itself never changes.
    pub fn update(&mut self, id: &str, raw: &Value) -> Result<&SavedConnection, StoreError> {
        let idx = self
            .connections
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut conn = sanitize_saved_connection(raw, idx + 1);
        conn.id = id.to_string();

        debug!("Updating connection {}", id);
        self.connections[idx] = conn;
        Ok(&self.connections[idx])
    }

    pub fn remove(&mut self, id: &str) -> Result<SavedConnection, StoreError> {
        let idx = self
            .connections
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        info!("Removing connection {}", id);
        Ok(self.connections.remove(idx))
    }

    /// Append connections from a JSON array export. Returns the ids assigned.
    pub fn import_json(&mut self, json: &str) -> Result<Vec<String>, StoreError> {
        let value: Value = serde_json::from_str(json)?;
        let Value::Array(items) = value else {
            return Err(StoreError::Format(
                "expected a JSON array of connections".to_string(),
            ));
        };

        let mut used = self.used_ids();
        let mut imported = Vec::with_capacity(items.len());
        for item in &items {
            let ordinal = self.connections.len() + 1;
            let mut conn = sanitize_saved_connection(item, ordinal);
            conn.id = claim_unique_id(&mut used, &conn.id, ordinal);
            imported.push(conn.id.clone());
            self.connections.push(conn);
        }

        info!("Imported {} connections", imported.len());
        Ok(imported)
    }

    pub fn export_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&self.connections)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::DbType;
    use serde_json::json;

    #[test]
    fn test_add_assigns_ids() {
        let mut store = ConnectionStore::new();
        let first = store.add(&json!({ "config": { "type": "postgres", "host": "pg" } })).clone();
        assert_eq!(first.id, "conn-1");
        assert_eq!(first.name, "postgres-pg");

        let second = store.add(&json!({ "id": "conn-1", "name": "dup" })).clone();
        assert_eq!(second.id, "conn-1-2");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_update_keeps_id() {
        let mut store = ConnectionStore::new();
        store.add(&json!({ "id": "a", "name": "old" }));

        let updated = store
            .update("a", &json!({ "id": "ignored", "name": "new", "config": { "type": "redis" } }))
            .unwrap();
        assert_eq!(updated.id, "a");
        assert_eq!(updated.name, "new");
        assert_eq!(updated.config.db_type, DbType::Redis);

        assert!(matches!(
            store.update("missing", &json!({})),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove() {
        let mut store = ConnectionStore::new();
        store.add(&json!({ "id": "a" }));
        store.add(&json!({ "id": "b" }));

        let removed = store.remove("a").unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(store.list().len(), 1);
        assert!(store.get("a").is_none());
        assert!(matches!(store.remove("a"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_import_rejects_non_array() {
        let mut store = ConnectionStore::new();
        assert!(matches!(
            store.import_json(r#"{"id":"a"}"#),
            Err(StoreError::Format(_))
        ));
        assert!(matches!(store.import_json("not json"), Err(StoreError::Json(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_import_resolves_collisions() {
        let mut store = ConnectionStore::new();
        store.add(&json!({ "id": "x" }));

        let ids = store
            .import_json(r#"[{"id":"x","name":"a"},{"name":"b"},{"id":"x","name":"c"}]"#)
            .unwrap();
        assert_eq!(ids, vec!["x-2", "conn-3", "x-4"]);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_long_duplicate_id_survives_reload() {
        let long = "k".repeat(128);
        let mut store = ConnectionStore::new();
        store.add(&json!({ "id": long }));
        let dup = store.add(&json!({ "id": long })).id.clone();
        assert_eq!(dup.chars().count(), 128);
        assert!(dup.ends_with("-2"));

        let exported: Value = serde_json::from_str(&store.export_json().unwrap()).unwrap();
        let reloaded = ConnectionStore::from_value(&exported);
        assert_eq!(reloaded, store);
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut store = ConnectionStore::new();
        store.add(&json!({
            "name": "mongo",
            "config": { "type": "mongodb", "hosts": ["a:1", "b:2"], "topology": "replica" },
            "includeDatabases": ["app"],
        }));
        store.add(&json!({ "name": "cache", "config": { "type": "redis", "redisDB": 2 } }));

        let exported = store.export_json().unwrap();
        let mut other = ConnectionStore::new();
        other.import_json(&exported).unwrap();
        assert_eq!(store, other);
    }
}
