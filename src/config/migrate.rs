//! Schema Migration and Merge
//!
//! Loading persisted state runs two independent stages:
//!
//! 1. [`migrate`] upgrades a document written by an older schema version.
//! 2. [`merge`] re-sanitizes whatever was loaded against the defaults, even
//!    when it is already current, so hand-edited or externally synced files
//!    are tolerated.

use serde_json::{Map, Value};
use tracing::{debug, info};

use super::sanitize::{self, coerce_number, Fields};
use super::store::ConnectionStore;
use super::types::{
    AppState, QueryOptions, SqlFormatOptions, CONFIG_VERSION, DEFAULT_OPACITY, MAX_MAX_ROWS,
};

/// Window opacity that shipped as the hardcoded default before version 2
pub const LEGACY_DEFAULT_OPACITY: f64 = 0.95;

/// Schema version that moved the default opacity from 0.95 to 1.0
pub const OPACITY_DEFAULT_CHANGED_IN: u32 = 2;

const OPACITY_TOLERANCE: f64 = 1e-3;

/// Schema version recorded in a raw document. Missing or invalid versions are
/// treated as the oldest schema.
pub fn schema_version(state: &Value) -> u32 {
    Fields::new(state).bounded_int("version", 1, u32::MAX as i64, 1) as u32
}

/// Whether an appearance still sits at the pre-v2 hardcoded default.
///
/// A non-zero blur means the user opened the appearance settings and chose
/// values, so an opacity of 0.95 next to it is deliberate.
pub fn is_legacy_default_appearance(opacity: f64, blur: f64) -> bool {
    (opacity - LEGACY_DEFAULT_OPACITY).abs() <= OPACITY_TOLERANCE && blur == 0.0
}

fn migrate_legacy_appearance(state: &mut Map<String, Value>) {
    let Some(Value::Object(appearance)) = state.get_mut("appearance") else {
        return;
    };
    let Some(opacity) = appearance.get("opacity").and_then(coerce_number) else {
        return;
    };
    let blur = appearance.get("blur").and_then(coerce_number).unwrap_or(0.0);

    if is_legacy_default_appearance(opacity, blur) {
        info!("Migrating legacy default opacity {} to {}", opacity, DEFAULT_OPACITY);
        appearance.insert("opacity".to_string(), Value::from(DEFAULT_OPACITY));
    }
}

/// Upgrade a raw document written by schema `from_version` to the current
/// schema. Documents already at the current version are returned untouched.
pub fn migrate(state: Value, from_version: u32) -> Value {
    if from_version >= CONFIG_VERSION {
        return state;
    }

    info!(
        "Migrating persisted state from version {} to {}",
        from_version, CONFIG_VERSION
    );

    let mut obj = match state {
        Value::Object(map) => map,
        other => {
            debug!("Persisted state is not an object ({}), starting empty", type_name(&other));
            Map::new()
        }
    };

    // Whole-collection pass: older schemas may carry ids, ports or types the
    // current model rejects.
    let connections = sanitize::sanitize_saved_connections(obj.get("connections"));
    obj.insert(
        "connections".to_string(),
        serde_json::to_value(&connections).unwrap_or_else(|_| Value::Array(Vec::new())),
    );

    if from_version < OPACITY_DEFAULT_CHANGED_IN {
        migrate_legacy_appearance(&mut obj);
    }

    obj.insert("version".to_string(), Value::from(CONFIG_VERSION));
    Value::Object(obj)
}

/// Re-sanitize a loaded document into typed state, falling back to `defaults`
/// field by field.
pub fn merge(loaded: &Value, defaults: &AppState) -> AppState {
    let f = Fields::new(loaded);

    let connections = match f.get("connections") {
        Some(v) => ConnectionStore::from_value(v),
        None => defaults.connections.clone(),
    };

    let saved_queries = match f.get("savedQueries") {
        Some(v) => sanitize::sanitize_saved_queries(Some(v)),
        None => defaults.saved_queries.clone(),
    };

    let format = f.nested("sqlFormatOptions");
    let query = f.nested("queryOptions");

    AppState {
        version: CONFIG_VERSION,
        connections,
        saved_queries,
        theme: f.choice("theme", defaults.theme),
        appearance: sanitize::sanitize_appearance(f.get("appearance"), &defaults.appearance),
        sql_format_options: SqlFormatOptions {
            keyword_case: format.choice("keywordCase", defaults.sql_format_options.keyword_case),
        },
        query_options: QueryOptions {
            max_rows: query.bounded_int(
                "maxRows",
                1,
                MAX_MAX_ROWS as i64,
                defaults.query_options.max_rows as i64,
            ) as u32,
        },
        table_access_count: match f.get("tableAccessCount") {
            Some(v) => sanitize::sanitize_table_access_count(Some(v)),
            None => defaults.table_access_count.clone(),
        },
        table_sort_preference: match f.get("tableSortPreference") {
            Some(v) => sanitize::sanitize_table_sort_preference(Some(v)),
            None => defaults.table_sort_preference.clone(),
        },
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Appearance, KeywordCase, SortPreference, Theme, DEFAULT_MAX_ROWS};
    use serde_json::json;

    fn load(raw: Value) -> AppState {
        let version = schema_version(&raw);
        merge(&migrate(raw, version), &AppState::default())
    }

    #[test]
    fn test_legacy_default_appearance_moves_forward() {
        let state = load(json!({
            "version": 1,
            "appearance": { "opacity": 0.95, "blur": 0 },
        }));
        assert_eq!(state.appearance, Appearance { opacity: 1.0, blur: 0 });
    }

    #[test]
    fn test_explicit_appearance_is_preserved() {
        let state = load(json!({
            "version": 1,
            "appearance": { "opacity": 0.95, "blur": 3 },
        }));
        assert_eq!(state.appearance.opacity, 0.95);
        assert_eq!(state.appearance.blur, 3);
    }

    #[test]
    fn test_current_version_keeps_chosen_opacity() {
        let state = load(json!({
            "version": CONFIG_VERSION,
            "appearance": { "opacity": 0.95, "blur": 0 },
        }));
        assert_eq!(state.appearance.opacity, 0.95);
    }

    #[test]
    fn test_tolerance_window() {
        assert!(is_legacy_default_appearance(0.9504, 0.0));
        assert!(!is_legacy_default_appearance(0.96, 0.0));
        assert!(!is_legacy_default_appearance(0.95, 1.0));
    }

    #[test]
    fn test_missing_version_is_oldest() {
        assert_eq!(schema_version(&json!({})), 1);
        assert_eq!(schema_version(&json!({ "version": "2" })), 2);
        assert_eq!(schema_version(&json!({ "version": -4 })), 1);
        let state = load(json!({ "appearance": { "opacity": "0.95" } }));
        assert_eq!(state.appearance.opacity, 1.0);
    }

    #[test]
    fn test_migrate_non_object() {
        let migrated = migrate(json!([1, 2, 3]), 1);
        assert_eq!(migrated["version"], CONFIG_VERSION);
        assert_eq!(migrated["connections"], json!([]));
    }

    #[test]
    fn test_merge_sanitizes_current_documents() {
        let state = merge(
            &json!({
                "version": CONFIG_VERSION,
                "connections": [
                    { "id": "x", "config": { "type": "postgres", "port": -5 } },
                    { "id": "x", "config": { "type": "redis" } },
                ],
                "theme": "neon",
                "sqlFormatOptions": { "keywordCase": "lower" },
                "queryOptions": { "maxRows": 999999999 },
                "tableSortPreference": { "c1-db": "frequency" },
            }),
            &AppState::default(),
        );

        let ids: Vec<_> = state.connections.list().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "x-2"]);
        assert_eq!(state.connections.list()[0].config.port, 5432);
        assert_eq!(state.theme, Theme::Light);
        assert_eq!(state.sql_format_options.keyword_case, KeywordCase::Lower);
        assert_eq!(state.query_options.max_rows, DEFAULT_MAX_ROWS);
        assert_eq!(state.table_sort_preference["c1-db"], SortPreference::Frequency);
    }

    #[test]
    fn test_merge_uses_defaults_for_missing_fields() {
        let mut defaults = AppState::default();
        defaults.theme = Theme::Dark;
        defaults.query_options.max_rows = 200;
        let state = merge(&json!({}), &defaults);
        assert_eq!(state.theme, Theme::Dark);
        assert_eq!(state.query_options.max_rows, 200);
        assert_eq!(state.version, CONFIG_VERSION);
    }

    #[test]
    fn test_merge_round_trip_is_stable() {
        let state = load(json!({
            "version": 2,
            "connections": [{ "name": "main", "config": { "type": "mysql", "host": "db" } }],
            "savedQueries": [{ "sql": "select 1" }, { "id": "query-1", "sql": "select 2" }],
            "tableAccessCount": { "conn-1-app-users": 3 },
        }));
        let json = serde_json::to_value(&state).unwrap();
        let again = merge(&json, &AppState::default());
        assert_eq!(state, again);
        assert_eq!(again.saved_queries[1].id, "query-1-2");
    }
}
