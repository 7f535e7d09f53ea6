//! Connection Configuration Types
//!
//! The persisted data model shared by every supported database type, plus the
//! per-type default tables. `default_port` and `normalize_type` are the only
//! place a port or type fallback is decided.
//!
//! None of the records here derive `Deserialize` directly: decoding goes through
//! the sanitizer so that every load path yields a valid record.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::migrate::merge;
use super::sanitize;
use super::store::ConnectionStore;

/// Current persisted schema version
pub const CONFIG_VERSION: u32 = 3;

/// System-wide fallback port (the mysql default)
pub const MYSQL_DEFAULT_PORT: u16 = 3306;
pub const SSH_DEFAULT_PORT: u16 = 22;

pub const DEFAULT_TIMEOUT_SECS: u32 = 30;
pub const MIN_TIMEOUT_SECS: u32 = 1;
pub const MAX_TIMEOUT_SECS: u32 = 3600;

pub const MAX_REDIS_DB: u8 = 15;
pub const MAX_URI_LEN: usize = 4096;
pub const MAX_DSN_LEN: usize = 4096;

/// Mongo seed list limits
pub const MAX_HOSTS: usize = 64;
pub const MAX_HOST_LEN: usize = 512;

pub const DEFAULT_MAX_ROWS: u32 = 5000;
pub const MAX_MAX_ROWS: u32 = 100_000;

/// Supported connection types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DbType {
    #[default]
    Mysql,
    Mariadb,
    Sphinx,
    Postgres,
    Redis,
    Tdengine,
    Oracle,
    Dameng,
    Kingbase,
    Sqlserver,
    Mongodb,
    Highgo,
    Vastbase,
    Sqlite,
    Custom,
}

impl DbType {
    pub const ALL: [DbType; 15] = [
        DbType::Mysql,
        DbType::Mariadb,
        DbType::Sphinx,
        DbType::Postgres,
        DbType::Redis,
        DbType::Tdengine,
        DbType::Oracle,
        DbType::Dameng,
        DbType::Kingbase,
        DbType::Sqlserver,
        DbType::Mongodb,
        DbType::Highgo,
        DbType::Vastbase,
        DbType::Sqlite,
        DbType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Mysql => "mysql",
            DbType::Mariadb => "mariadb",
            DbType::Sphinx => "sphinx",
            DbType::Postgres => "postgres",
            DbType::Redis => "redis",
            DbType::Tdengine => "tdengine",
            DbType::Oracle => "oracle",
            DbType::Dameng => "dameng",
            DbType::Kingbase => "kingbase",
            DbType::Sqlserver => "sqlserver",
            DbType::Mongodb => "mongodb",
            DbType::Highgo => "highgo",
            DbType::Vastbase => "vastbase",
            DbType::Sqlite => "sqlite",
            DbType::Custom => "custom",
        }
    }

    /// Whether replica credentials apply (read-replica routing)
    pub fn supports_mysql_replica(&self) -> bool {
        matches!(self, DbType::Mysql | DbType::Mariadb)
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unsupported database type: {0}")]
pub struct UnsupportedDbType(pub String);

impl FromStr for DbType {
    type Err = UnsupportedDbType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        DbType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == lowered)
            .ok_or_else(|| UnsupportedDbType(s.to_string()))
    }
}

impl Serialize for DbType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DbType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(normalize_type(&sanitize::coerce_string(&raw, "")))
    }
}

/// Lower-case and validate a raw type name. Anything unsupported maps to mysql.
pub fn normalize_type(raw: &str) -> DbType {
    raw.parse().unwrap_or_default()
}

/// Canonical port for a connection type
pub fn default_port(db_type: DbType) -> u16 {
    match db_type {
        DbType::Mysql | DbType::Mariadb => MYSQL_DEFAULT_PORT,
        DbType::Sphinx => 9306,
        DbType::Postgres | DbType::Vastbase => 5432,
        DbType::Redis => 6379,
        DbType::Tdengine => 6041,
        DbType::Oracle => 1521,
        DbType::Dameng => 5236,
        DbType::Kingbase => 54321,
        DbType::Sqlserver => 1433,
        DbType::Mongodb => 27017,
        DbType::Highgo => 5866,
        // No network port of their own; keep the system-wide fallback.
        DbType::Sqlite | DbType::Custom => MYSQL_DEFAULT_PORT,
    }
}

/// SSH jump settings of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub key_path: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: SSH_DEFAULT_PORT,
            user: String::new(),
            password: String::new(),
            key_path: String::new(),
        }
    }
}

impl SshConfig {
    /// Whether at least one auth method is configured
    pub fn has_credentials(&self) -> bool {
        !self.password.is_empty() || !self.key_path.is_empty()
    }
}

impl<'de> Deserialize<'de> for SshConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(sanitize::sanitize_ssh_config(&raw))
    }
}

/// Mongo deployment shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    #[default]
    Single,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MongoAuthMechanism {
    /// Let the driver negotiate
    #[default]
    #[serde(rename = "")]
    Negotiate,
    #[serde(rename = "SCRAM-SHA-1")]
    ScramSha1,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "MONGODB-X509")]
    X509,
    #[serde(rename = "MONGODB-AWS")]
    Aws,
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "GSSAPI")]
    Gssapi,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MongoOptions {
    pub hosts: Vec<String>,
    pub topology: Topology,
    pub replica_set: String,
    pub auth_source: String,
    pub read_preference: ReadPreference,
    pub srv: bool,
    pub auth_mechanism: MongoAuthMechanism,
    pub replica_user: String,
    pub replica_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MySqlOptions {
    pub replica_user: String,
    pub replica_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CustomDriverOptions {
    pub driver: String,
    pub dsn: String,
}

/// Type-specific extension of a [`ConnectionConfig`].
///
/// Only the variant matching the connection type is ever populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOptions {
    Standard,
    MySql(MySqlOptions),
    Redis { db: u8 },
    Mongo(MongoOptions),
    Custom(CustomDriverOptions),
}

impl DriverOptions {
    /// Empty options of the shape expected for `db_type`
    pub fn for_type(db_type: DbType) -> Self {
        match db_type {
            t if t.supports_mysql_replica() => DriverOptions::MySql(MySqlOptions::default()),
            DbType::Redis => DriverOptions::Redis { db: 0 },
            DbType::Mongodb => DriverOptions::Mongo(MongoOptions::default()),
            DbType::Custom => DriverOptions::Custom(CustomDriverOptions::default()),
            _ => DriverOptions::Standard,
        }
    }

    pub fn matches(&self, db_type: DbType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(&Self::for_type(db_type))
    }

    pub(crate) fn clear_passwords(&mut self) {
        match self {
            DriverOptions::MySql(opts) => opts.replica_password.clear(),
            DriverOptions::Mongo(opts) => opts.replica_password.clear(),
            _ => {}
        }
    }
}

/// How to reach one database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub db_type: DbType,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// When false, every password-shaped field is dropped rather than persisted
    pub save_password: bool,
    pub database: String,
    pub use_ssh: bool,
    /// Present exactly when `use_ssh` is set
    pub ssh: Option<SshConfig>,
    /// Opaque connection-string override
    pub uri: String,
    /// Seconds
    pub timeout: u32,
    pub options: DriverOptions,
}

impl ConnectionConfig {
    pub fn new(db_type: DbType) -> Self {
        Self {
            db_type,
            host: String::new(),
            port: default_port(db_type),
            user: String::new(),
            password: String::new(),
            save_password: true,
            database: String::new(),
            use_ssh: false,
            ssh: None,
            uri: String::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            options: DriverOptions::for_type(db_type),
        }
    }

    /// `host:port` of the database itself
    pub fn target_addr(&self) -> String {
        format_host_port(&self.host, self.port)
    }

    pub fn redis_db(&self) -> Option<u8> {
        match self.options {
            DriverOptions::Redis { db } => Some(db),
            _ => None,
        }
    }

    pub fn mongo(&self) -> Option<&MongoOptions> {
        match &self.options {
            DriverOptions::Mongo(opts) => Some(opts),
            _ => None,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(DbType::default())
    }
}

/// Join host and port, bracketing bare IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl Serialize for ConnectionConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &self.db_type)?;
        map.serialize_entry("host", &self.host)?;
        map.serialize_entry("port", &self.port)?;
        map.serialize_entry("user", &self.user)?;
        map.serialize_entry("password", &self.password)?;
        map.serialize_entry("savePassword", &self.save_password)?;
        map.serialize_entry("database", &self.database)?;
        map.serialize_entry("useSSH", &self.use_ssh)?;
        if let Some(ssh) = &self.ssh {
            map.serialize_entry("ssh", ssh)?;
        }
        map.serialize_entry("uri", &self.uri)?;
        map.serialize_entry("timeout", &self.timeout)?;

        match &self.options {
            DriverOptions::Standard => {}
            DriverOptions::MySql(opts) => {
                map.serialize_entry("mysqlReplicaUser", &opts.replica_user)?;
                map.serialize_entry("mysqlReplicaPassword", &opts.replica_password)?;
            }
            DriverOptions::Redis { db } => {
                map.serialize_entry("redisDB", db)?;
            }
            DriverOptions::Mongo(opts) => {
                map.serialize_entry("hosts", &opts.hosts)?;
                map.serialize_entry("topology", &opts.topology)?;
                map.serialize_entry("replicaSet", &opts.replica_set)?;
                map.serialize_entry("authSource", &opts.auth_source)?;
                map.serialize_entry("readPreference", &opts.read_preference)?;
                map.serialize_entry("mongoSrv", &opts.srv)?;
                map.serialize_entry("mongoAuthMechanism", &opts.auth_mechanism)?;
                map.serialize_entry("mongoReplicaUser", &opts.replica_user)?;
                map.serialize_entry("mongoReplicaPassword", &opts.replica_password)?;
            }
            DriverOptions::Custom(opts) => {
                map.serialize_entry("driver", &opts.driver)?;
                map.serialize_entry("dsn", &opts.dsn)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ConnectionConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(sanitize::sanitize_connection_config(&raw))
    }
}

/// A named, persisted connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConnection {
    pub id: String,
    pub name: String,
    pub config: ConnectionConfig,
    /// Schemas shown in the sidebar; `None` shows all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_databases: Option<Vec<String>>,
    /// Redis DB indices shown in the sidebar; `None` shows all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_redis_databases: Option<Vec<u8>>,
}

impl<'de> Deserialize<'de> for SavedConnection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(sanitize::sanitize_saved_connection(&raw, 1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedQuery {
    pub id: String,
    pub name: String,
    pub sql: String,
    pub connection_id: String,
    pub db_name: String,
    /// Unix milliseconds
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Appearance {
    pub opacity: f64,
    pub blur: u32,
}

pub const DEFAULT_OPACITY: f64 = 1.0;
pub const MIN_OPACITY: f64 = 0.1;
pub const MAX_BLUR: u32 = 20;

impl Default for Appearance {
    fn default() -> Self {
        Self {
            opacity: DEFAULT_OPACITY,
            blur: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordCase {
    #[default]
    Upper,
    Lower,
    Preserve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlFormatOptions {
    pub keyword_case: KeywordCase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub max_rows: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

/// Table ordering in the sidebar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortPreference {
    #[default]
    Name,
    Frequency,
}

/// The whole persisted blob
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub version: u32,
    pub connections: ConnectionStore,
    pub saved_queries: Vec<SavedQuery>,
    pub theme: Theme,
    pub appearance: Appearance,
    pub sql_format_options: SqlFormatOptions,
    pub query_options: QueryOptions,
    /// `connectionId-dbName-tableName` -> access count
    pub table_access_count: BTreeMap<String, u64>,
    /// `connectionId-dbName` -> ordering
    pub table_sort_preference: BTreeMap<String, SortPreference>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            connections: ConnectionStore::default(),
            saved_queries: Vec::new(),
            theme: Theme::default(),
            appearance: Appearance::default(),
            sql_format_options: SqlFormatOptions::default(),
            query_options: QueryOptions::default(),
            table_access_count: BTreeMap::new(),
            table_sort_preference: BTreeMap::new(),
        }
    }
}

impl AppState {
    /// Key of a `table_access_count` entry
    pub fn table_access_key(connection_id: &str, db_name: &str, table: &str) -> String {
        format!("{}-{}-{}", connection_id, db_name, table)
    }

    /// Key of a `table_sort_preference` entry
    pub fn table_sort_key(connection_id: &str, db_name: &str) -> String {
        format!("{}-{}", connection_id, db_name)
    }
}

impl<'de> Deserialize<'de> for AppState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(merge(&raw, &AppState::default()))
    }
}
