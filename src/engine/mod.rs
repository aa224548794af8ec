//! Database Connector Contract and Core Types
//!
//! This module defines the uniform contract every backend implements.
//! Each backend (`PostgreSQL`, `MySQL`/`MariaDB`, SQL Server, `SQLite`) provides a
//! [`Connector`] that owns at most one live session and a [`DsnParser`] that
//! recognises its connection strings.
//!
//! # Session Lifecycle
//! Connectors are used sequentially: `connect` fully, then introspect/execute,
//! then `disconnect`. `connect` either stores a complete session or leaves the
//! connector unconnected. `disconnect` on an unconnected connector is a no-op.
//!
//! # Engine Isolation
//! Each engine implementation is independent; the only shared pieces are the
//! result types below and the safety gate in [`crate::capability`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::capability::{self, Validation};
use crate::dsn::{encode_userinfo, DsnParser};
use crate::error::{Result, SqlGateError};

pub mod registry;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "sqlserver")]
pub mod sqlserver;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    Postgres,
    /// `MySQL` database
    MySQL,
    /// `MariaDB` database (MySQL wire protocol)
    MariaDB,
    /// Microsoft SQL Server
    SqlServer,
    /// `SQLite` database
    SQLite,
}

impl DatabaseType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
            Self::MariaDB => "mariadb",
            Self::SqlServer => "sqlserver",
            Self::SQLite => "sqlite",
        }
    }

    /// Default TCP port for network engines
    #[must_use]
    pub const fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySQL | Self::MariaDB => Some(3306),
            Self::SqlServer => Some(1433),
            Self::SQLite => None,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backend connection parameters produced by a [`DsnParser`]
///
/// Fields are engine-specific (e.g., `file` only applies to `SQLite`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database engine type
    pub engine: DatabaseType,

    /// Hostname (network engines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port number (network engines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username (network engines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password (network engines)
    /// WARNING: Sensitive data, never serialized, logged or included in errors
    #[serde(skip_serializing, default)]
    pub password: Option<String>,

    /// Database name (network engines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Database file path (`:memory:` for an in-memory `SQLite` database)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Remaining DSN query options, verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Create a config for a network engine
    #[must_use]
    pub fn network(engine: DatabaseType, host: impl Into<String>, port: u16) -> Self {
        Self {
            engine,
            host: Some(host.into()),
            port: Some(port),
            user: None,
            password: None,
            database: None,
            file: None,
            options: BTreeMap::new(),
        }
    }

    /// Create a new `SQLite` connection config
    #[must_use]
    pub fn sqlite(file: PathBuf) -> Self {
        Self {
            engine: DatabaseType::SQLite,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            file: Some(file),
            options: BTreeMap::new(),
        }
    }

    /// Whether this is an in-memory `SQLite` database
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.file.as_deref().is_some_and(|f| f.as_os_str() == ":memory:")
    }

    /// Render the config back into a canonical DSN
    ///
    /// Credentials are percent-encoded. Used to turn structured source
    /// configuration into something the connector registry can dispatch on.
    #[must_use]
    pub fn to_dsn(&self) -> String {
        if self.engine == DatabaseType::SQLite {
            return match &self.file {
                Some(_) if self.is_in_memory() => "sqlite::memory:".to_string(),
                Some(file) => format!("sqlite://{}", file.display()),
                None => "sqlite::memory:".to_string(),
            };
        }

        let mut dsn = format!("{}://", self.engine.as_str());
        if let Some(user) = &self.user {
            dsn.push_str(&encode_userinfo(user));
            if let Some(password) = &self.password {
                dsn.push(':');
                dsn.push_str(&encode_userinfo(password));
            }
            dsn.push('@');
        }
        let host = self.host.as_deref().unwrap_or("localhost");
        if host.contains(':') {
            dsn.push_str(&format!("[{host}]"));
        } else {
            dsn.push_str(host);
        }
        if let Some(port) = self.port {
            dsn.push_str(&format!(":{port}"));
        }
        dsn.push('/');
        if let Some(database) = &self.database {
            dsn.push_str(&encode_userinfo(database));
        }
        if !self.options.is_empty() {
            let query: Vec<String> =
                self.options.iter().map(|(k, v)| format!("{k}={v}")).collect();
            dsn.push('?');
            dsn.push_str(&query.join("&"));
        }
        dsn
    }
}

/// Options applied when a connector opens its session
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Upper bound on establishing the session
    pub connection_timeout: Option<Duration>,
    /// Upper bound on each query (also used as lock/busy timeout where supported)
    pub request_timeout: Option<Duration>,
    /// SQL run once right after connecting
    pub init_script: Option<String>,
}

/// Per-execution policy
///
/// `readonly` is tri-state: only an explicit `Some(false)` permits mutating
/// statements. An unset value is treated as read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,

    /// Maximum number of rows to return (enforced by the connector)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,

    /// Query timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecuteOptions {
    /// Read-only options (the default policy)
    #[must_use]
    pub fn read_only() -> Self {
        Self { readonly: Some(true), ..Default::default() }
    }

    /// Options that allow mutating statements
    #[must_use]
    pub fn writable() -> Self {
        Self { readonly: Some(false), ..Default::default() }
    }

    #[must_use]
    pub const fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Whether mutating statements must be rejected
    #[must_use]
    pub const fn is_readonly(&self) -> bool {
        !matches!(self.readonly, Some(false))
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Column description returned by schema introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    /// Column name
    pub name: String,

    /// Declared data type (engine-specific)
    pub data_type: String,

    /// Whether column allows NULL values
    pub nullable: bool,

    /// Default expression (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Index information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIndex {
    /// Index name
    pub name: String,

    /// Column names included in the index, in index order
    pub columns: Vec<String>,

    /// Whether this is a unique index
    pub is_unique: bool,

    /// Whether this index backs the primary key
    pub is_primary: bool,
}

/// Routine kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Procedure,
    Function,
}

/// Stored procedure / function detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProcedure {
    pub name: String,
    pub kind: ProcedureKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

/// Query execution result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in result set
    pub columns: Vec<String>,

    /// Declared column types, aligned with `columns` (empty when the driver
    /// does not report them)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_types: Vec<String>,

    /// Result rows (row-major, aligned with `columns`)
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Number of rows returned
    pub row_count: usize,

    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// Whether `max_rows` cut the result short
    #[serde(default)]
    pub truncated: bool,

    /// Execution time in milliseconds
    #[serde(default)]
    pub execution_ms: u64,
}

impl QueryResult {
    /// Result of a statement that returns no rows
    #[must_use]
    pub fn affected(rows_affected: u64) -> Self {
        Self { rows_affected: Some(rows_affected), ..Default::default() }
    }
}

/// Uniform database access contract
///
/// Implementations: `PostgresConnector`, `MySqlConnector` (also serving
/// `MariaDB`), `SqlServerConnector`, `SqliteConnector`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Unique connector identifier (e.g. "postgres")
    fn id(&self) -> &'static str;

    /// Display name (e.g. "PostgreSQL")
    fn name(&self) -> &'static str;

    fn engine(&self) -> DatabaseType;

    /// Parser for this connector's DSN shape
    fn dsn_parser(&self) -> &dyn DsnParser;

    /// A fresh, unconnected connector of the same kind
    fn new_instance(&self) -> Box<dyn Connector>;

    /// Open the session. Parses `dsn` with this connector's own parser.
    ///
    /// # Errors
    /// [`SqlGateError::DsnFormat`] for an unparseable DSN,
    /// [`SqlGateError::ConnectionFailed`] for network/auth/init-script failures.
    /// On error the connector stays unconnected.
    async fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<()>;

    /// Close the session. No-op when not connected.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn get_schemas(&self) -> Result<Vec<String>>;

    /// Table names in `schema` (backend default schema when `None`)
    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<String>>;

    async fn table_exists(&self, table: &str, schema: Option<&str>) -> Result<bool>;

    async fn get_table_schema(&self, table: &str, schema: Option<&str>)
        -> Result<Vec<TableColumn>>;

    async fn get_table_indexes(&self, table: &str, schema: Option<&str>)
        -> Result<Vec<TableIndex>>;

    async fn get_stored_procedures(&self, schema: Option<&str>) -> Result<Vec<String>>;

    async fn get_stored_procedure_detail(
        &self,
        name: &str,
        schema: Option<&str>,
    ) -> Result<StoredProcedure>;

    /// Execute a statement. The safety gate is NOT applied here; callers run
    /// [`Connector::validate_query`] first.
    ///
    /// # Errors
    /// [`SqlGateError::QueryFailed`] carrying the backend diagnostic.
    async fn execute_query(&self, sql: &str, options: &ExecuteOptions) -> Result<QueryResult>;

    /// Safety-gate predicate for this backend. Never fails.
    fn validate_query(&self, sql: &str, options: &ExecuteOptions) -> Validation {
        capability::validate_query(sql, self.engine(), options)
    }
}

/// Error for operations attempted before `connect`
pub(crate) fn not_connected(engine: DatabaseType) -> SqlGateError {
    SqlGateError::connection_failed(format!("{engine} connector is not connected"))
}

/// Run `fut`, mapping expiry of `timeout` through `on_timeout`
pub(crate) async fn with_timeout<T, F>(
    timeout: Option<Duration>,
    fut: F,
    on_timeout: impl FnOnce(Duration) -> SqlGateError,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| on_timeout(limit))?,
        None => fut.await,
    }
}

/// Apply `max_rows` to collected rows, returning whether rows were dropped
pub(crate) fn cap_rows<T>(rows: &mut Vec<T>, max_rows: Option<usize>) -> bool {
    match max_rows {
        Some(max) if rows.len() > max => {
            rows.truncate(max);
            true
        }
        _ => false,
    }
}
