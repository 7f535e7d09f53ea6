//! Config Sanitizer
//!
//! Total normalization of untyped, possibly stale or corrupted documents into
//! typed records. Nothing in here returns an error: every field has a
//! deterministic fallback, and the worst outcome of bad input is a default
//! value.
//!
//! Rules shared by every record:
//! - strings are trimmed; numbers and booleans are stringified first; any other
//!   JSON type yields the fallback
//! - bounded integers are parsed and truncated; a value outside the range
//!   reverts to the fallback instead of being clamped
//! - lists drop non-array input, trim, drop empty/over-long/invalid entries,
//!   de-duplicate (first wins) and cap the entry count

use std::collections::{BTreeMap, HashSet};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::types::*;

/// Longest accepted connection/query id
pub const MAX_ID_LEN: usize = 128;
pub const MAX_DRIVER_LEN: usize = 128;
pub const MAX_DATABASE_NAME_LEN: usize = 256;
pub const MAX_INCLUDE_DATABASES: usize = 256;
pub const MAX_TABLE_KEY_LEN: usize = 512;

/// Typed read access over one object of an untyped document.
///
/// Non-object input behaves like an empty object, so every accessor falls back.
#[derive(Clone, Copy)]
pub struct Fields<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self {
            map: value.as_object(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.and_then(|m| m.get(key)).filter(|v| !v.is_null())
    }

    pub fn nested(&self, key: &str) -> Fields<'a> {
        Fields {
            map: self.get(key).and_then(Value::as_object),
        }
    }

    pub fn string(&self, key: &str, fallback: &str) -> String {
        match self.get(key) {
            Some(v) => coerce_string(v, fallback),
            None => fallback.to_string(),
        }
    }

    /// Trimmed string; anything longer than `max_len` chars reverts to empty
    pub fn bounded_string(&self, key: &str, max_len: usize) -> String {
        let s = self.string(key, "");
        if s.chars().count() > max_len {
            String::new()
        } else {
            s
        }
    }

    pub fn boolean(&self, key: &str, fallback: bool) -> bool {
        self.get(key)
            .and_then(coerce_bool)
            .unwrap_or(fallback)
    }

    pub fn port(&self, key: &str, fallback: u16) -> u16 {
        let port = self.bounded_int(key, 1, u16::MAX as i64, fallback as i64);
        u16::try_from(port).unwrap_or(fallback)
    }

    pub fn bounded_int(&self, key: &str, min: i64, max: i64, fallback: i64) -> i64 {
        match self.get(key) {
            Some(v) => bounded_int(v, min, max, fallback),
            None => fallback,
        }
    }

    pub fn bounded_float(&self, key: &str, min: f64, max: f64, fallback: f64) -> f64 {
        match self.get(key).and_then(coerce_number) {
            Some(n) if n.is_finite() && n >= min && n <= max => n,
            _ => fallback,
        }
    }

    /// Parse a string-valued enum through its serde names
    pub fn choice<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
        match self.get(key) {
            Some(v) => parse_choice(v).unwrap_or(fallback),
            None => fallback,
        }
    }
}

/// Trim a scalar into a string; non-scalars yield `fallback`
pub fn coerce_string(value: &Value, fallback: &str) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string().trim().to_string(),
        Value::Bool(b) => b.to_string(),
        _ => fallback.to_string(),
    }
}

/// Numeric view of a number or numeric string
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Some(true),
            Some(v) if v == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parse, truncate toward zero, and fall back when outside `[min, max]`
pub fn bounded_int(value: &Value, min: i64, max: i64, fallback: i64) -> i64 {
    let Some(n) = coerce_number(value) else {
        return fallback;
    };
    if !n.is_finite() {
        return fallback;
    }
    let truncated = n.trunc();
    if truncated < min as f64 || truncated > max as f64 {
        return fallback;
    }
    truncated as i64
}

fn parse_choice<T: DeserializeOwned>(value: &Value) -> Option<T> {
    let s = coerce_string(value, "");
    serde_json::from_value(Value::String(s)).ok()
}

/// Seed-list token check: no parentheses, slashes or whitespace, which could
/// smuggle extra syntax into a driver dial string.
pub fn is_valid_host_token(token: &str) -> bool {
    !token
        .chars()
        .any(|c| matches!(c, '(' | ')' | '\\' | '/') || c.is_whitespace())
}

/// Sanitize a string list (see module docs for the policy)
pub fn sanitize_string_list(
    value: Option<&Value>,
    max_len: usize,
    max_count: usize,
    accept: impl Fn(&str) -> bool,
) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if out.len() >= max_count {
            break;
        }
        let entry = coerce_string(item, "");
        if entry.is_empty() || entry.chars().count() > max_len || !accept(&entry) {
            continue;
        }
        if seen.insert(entry.clone()) {
            out.push(entry);
        }
    }
    out
}

/// Sanitize an integer list with the same drop/truncate/dedupe policy
pub fn sanitize_int_list(value: Option<&Value>, min: i64, max: i64, max_count: usize) -> Vec<i64> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if out.len() >= max_count {
            break;
        }
        let Some(n) = coerce_number(item).filter(|n| n.is_finite()) else {
            continue;
        };
        let n = n.trunc();
        if n < min as f64 || n > max as f64 {
            continue;
        }
        let n = n as i64;
        if seen.insert(n) {
            out.push(n);
        }
    }
    out
}

pub fn sanitize_ssh_config(value: &Value) -> SshConfig {
    let f = Fields::new(value);
    SshConfig {
        host: f.string("host", ""),
        port: f.port("port", SSH_DEFAULT_PORT),
        user: f.string("user", ""),
        password: f.string("password", ""),
        key_path: f.string("keyPath", ""),
    }
}

fn sanitize_mongo_options(f: &Fields<'_>) -> MongoOptions {
    MongoOptions {
        hosts: sanitize_string_list(f.get("hosts"), MAX_HOST_LEN, MAX_HOSTS, is_valid_host_token),
        topology: f.choice("topology", Topology::default()),
        replica_set: f.string("replicaSet", ""),
        auth_source: f.string("authSource", ""),
        read_preference: f.choice("readPreference", ReadPreference::default()),
        srv: f.boolean("mongoSrv", false),
        auth_mechanism: f.choice("mongoAuthMechanism", MongoAuthMechanism::default()),
        replica_user: f.string("mongoReplicaUser", ""),
        replica_password: f.string("mongoReplicaPassword", ""),
    }
}

fn sanitize_driver_options(db_type: DbType, f: &Fields<'_>) -> DriverOptions {
    match db_type {
        t if t.supports_mysql_replica() => DriverOptions::MySql(MySqlOptions {
            replica_user: f.string("mysqlReplicaUser", ""),
            replica_password: f.string("mysqlReplicaPassword", ""),
        }),
        DbType::Redis => DriverOptions::Redis {
            db: f.bounded_int("redisDB", 0, MAX_REDIS_DB as i64, 0) as u8,
        },
        DbType::Mongodb => DriverOptions::Mongo(sanitize_mongo_options(f)),
        DbType::Custom => DriverOptions::Custom(CustomDriverOptions {
            driver: f.bounded_string("driver", MAX_DRIVER_LEN),
            dsn: f.bounded_string("dsn", MAX_DSN_LEN),
        }),
        _ => DriverOptions::Standard,
    }
}

/// Normalize an arbitrary value into a valid [`ConnectionConfig`]
pub fn sanitize_connection_config(value: &Value) -> ConnectionConfig {
    let f = Fields::new(value);
    let db_type = normalize_type(&f.string("type", ""));
    let save_password = f.boolean("savePassword", true);
    let use_ssh = f.boolean("useSSH", false);

    let mut config = ConnectionConfig {
        db_type,
        host: f.string("host", ""),
        port: f.port("port", default_port(db_type)),
        user: f.string("user", ""),
        password: f.string("password", ""),
        save_password,
        database: f.string("database", ""),
        use_ssh,
        ssh: use_ssh.then(|| sanitize_ssh_config(f.get("ssh").unwrap_or(&Value::Null))),
        uri: f.bounded_string("uri", MAX_URI_LEN),
        timeout: f.bounded_int(
            "timeout",
            MIN_TIMEOUT_SECS as i64,
            MAX_TIMEOUT_SECS as i64,
            DEFAULT_TIMEOUT_SECS as i64,
        ) as u32,
        options: sanitize_driver_options(db_type, &f),
    };

    if !save_password {
        config.password.clear();
        config.options.clear_passwords();
    }
    config
}

fn sanitize_id(f: &Fields<'_>, prefix: &str, ordinal: usize) -> String {
    let id = f.string("id", "");
    if id.is_empty() || id.chars().count() > MAX_ID_LEN {
        format!("{}-{}", prefix, ordinal)
    } else {
        id
    }
}

/// Normalize one saved connection. `ordinal` is its 1-based list position and
/// seeds the synthesized id and placeholder name.
pub fn sanitize_saved_connection(value: &Value, ordinal: usize) -> SavedConnection {
    let f = Fields::new(value);
    let config = sanitize_connection_config(f.get("config").unwrap_or(&Value::Null));

    let mut name = f.string("name", "");
    if name.is_empty() {
        name = if config.host.is_empty() {
            format!("Connection {}", ordinal)
        } else {
            format!("{}-{}", config.db_type, config.host)
        };
    }

    let include_databases = f
        .get("includeDatabases")
        .map(|v| {
            sanitize_string_list(Some(v), MAX_DATABASE_NAME_LEN, MAX_INCLUDE_DATABASES, |_| true)
        })
        .filter(|list| !list.is_empty());

    let include_redis_databases = f
        .get("includeRedisDatabases")
        .map(|v| {
            sanitize_int_list(Some(v), 0, MAX_REDIS_DB as i64, MAX_REDIS_DB as usize + 1)
                .into_iter()
                .map(|n| n as u8)
                .collect::<Vec<_>>()
        })
        .filter(|list| !list.is_empty());

    SavedConnection {
        id: sanitize_id(&f, "conn", ordinal),
        name,
        config,
        include_databases,
        include_redis_databases,
    }
}

/// Pick an id not yet in `used`, suffixing the ordinal on collision, and
/// record it. A suffixed id is cut back so it never exceeds `MAX_ID_LEN`.
pub fn claim_unique_id(used: &mut HashSet<String>, id: &str, ordinal: usize) -> String {
    let mut candidate = id.to_string();
    let mut suffix = ordinal;
    while used.contains(&candidate) {
        let tail = format!("-{}", suffix);
        let keep = MAX_ID_LEN.saturating_sub(tail.len());
        candidate = id.chars().take(keep).collect::<String>() + &tail;
        suffix += 1;
    }
    used.insert(candidate.clone());
    candidate
}

/// Normalize a connection list. Non-array input yields an empty list; ids are
/// made unique.
pub fn sanitize_saved_connections(value: Option<&Value>) -> Vec<SavedConnection> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let mut used = HashSet::new();
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let ordinal = idx + 1;
            let mut conn = sanitize_saved_connection(item, ordinal);
            conn.id = claim_unique_id(&mut used, &conn.id, ordinal);
            conn
        })
        .collect()
}

pub fn sanitize_saved_queries(value: Option<&Value>) -> Vec<SavedQuery> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let mut used = HashSet::new();
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let ordinal = idx + 1;
            let f = Fields::new(item);
            let id = sanitize_id(&f, "query", ordinal);
            let mut name = f.string("name", "");
            if name.is_empty() {
                name = format!("Query {}", ordinal);
            }
            SavedQuery {
                id: claim_unique_id(&mut used, &id, ordinal),
                name,
                sql: f.string("sql", ""),
                connection_id: f.string("connectionId", ""),
                db_name: f.string("dbName", ""),
                created_at: f.bounded_int("createdAt", 0, i64::MAX, 0) as u64,
            }
        })
        .collect()
}

pub fn sanitize_appearance(value: Option<&Value>, fallback: &Appearance) -> Appearance {
    let f = Fields::new(value.unwrap_or(&Value::Null));
    Appearance {
        opacity: f.bounded_float("opacity", MIN_OPACITY, 1.0, fallback.opacity),
        blur: f.bounded_int("blur", 0, MAX_BLUR as i64, fallback.blur as i64) as u32,
    }
}

pub fn sanitize_table_access_count(value: Option<&Value>) -> BTreeMap<String, u64> {
    let Some(Value::Object(entries)) = value else {
        return BTreeMap::new();
    };

    entries
        .iter()
        .filter_map(|(key, count)| {
            let key = key.trim();
            if key.is_empty() || key.chars().count() > MAX_TABLE_KEY_LEN {
                return None;
            }
            let count = bounded_int(count, 0, i64::MAX, -1);
            (count >= 0).then(|| (key.to_string(), count as u64))
        })
        .collect()
}

pub fn sanitize_table_sort_preference(value: Option<&Value>) -> BTreeMap<String, SortPreference> {
    let Some(Value::Object(entries)) = value else {
        return BTreeMap::new();
    };

    entries
        .iter()
        .filter_map(|(key, pref)| {
            let key = key.trim();
            if key.is_empty() || key.chars().count() > MAX_TABLE_KEY_LEN {
                return None;
            }
            parse_choice::<SortPreference>(pref).map(|p| (key.to_string(), p))
        })
        .collect()
}
