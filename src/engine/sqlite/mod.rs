//! `SQLite` Connector
//!
//! # Features
//! - File-based connections (`sqlite:///path/to/db.sqlite`)
//! - In-memory connections (`sqlite::memory:`)
//! - Schema introspection via `sqlite_master` and PRAGMAs
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver); the session lives behind a
//!   `parking_lot::Mutex` and is never held across an `.await`
//! - Queries run on the blocking pool, one prepared statement at a time;
//!   a read-only source also refuses statements `SQLite` reports as writes
//! - BLOB data is Base64-encoded for JSON safety
//! - `request_timeout` interrupts a running query and also bounds lock waits
//!   (`busy_timeout`)
//! - Row limits enforced in application code
//! - Only the `main` schema (plus attached databases by name)

mod dsn;

pub use dsn::SqliteDsnParser;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Batch, Connection, ErrorCode, InterruptHandle, OpenFlags, Row, Statement};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

use crate::capability::split_statements;
use crate::dsn::DsnParser;
use crate::engine::{
    not_connected, ConnectOptions, ConnectionConfig, Connector, DatabaseType, ExecuteOptions,
    QueryResult, StoredProcedure, TableColumn, TableIndex,
};
use crate::error::{Result, SqlGateError};

const DEFAULT_SCHEMA: &str = "main";

struct Session {
    conn: Connection,
    request_timeout: Option<Duration>,
}

type SharedSession = Arc<Mutex<Option<Session>>>;

/// `SQLite` connector
#[derive(Default)]
pub struct SqliteConnector {
    parser: SqliteDsnParser,
    session: SharedSession,
}

impl SqliteConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the live session
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        with_session(&self.session, |session| f(&session.conn))
    }
}

fn with_session<T>(session: &SharedSession, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
    let guard = session.lock();
    let session = guard.as_ref().ok_or_else(|| not_connected(DatabaseType::SQLite))?;
    f(session)
}

#[async_trait]
impl Connector for SqliteConnector {
    fn id(&self) -> &'static str {
        "sqlite"
    }

    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn engine(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn dsn_parser(&self) -> &dyn DsnParser {
        &self.parser
    }

    fn new_instance(&self) -> Box<dyn Connector> {
        Box::new(Self::new())
    }

    #[instrument(skip_all, fields(connector = "sqlite"))]
    async fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<()> {
        let config = self.parser.parse(dsn)?;
        let conn = open_connection(&config)?;

        if let Some(timeout) = options.request_timeout {
            conn.busy_timeout(timeout).map_err(|e| {
                SqlGateError::connection_failed(format!("Failed to set SQLite busy timeout: {e}"))
            })?;
        }

        if let Some(script) = &options.init_script {
            conn.execute_batch(script).map_err(|e| {
                SqlGateError::connection_failed(format!("SQLite init script failed: {e}"))
            })?;
            debug!("Init script executed");
        }

        let location =
            config.file.as_deref().map(|f| f.display().to_string()).unwrap_or_default();
        *self.session.lock() = Some(Session { conn, request_timeout: options.request_timeout });
        info!(database = %location, "Connected to SQLite");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().take();
        if let Some(Session { conn, .. }) = session {
            conn.close().map_err(|(_, e)| {
                SqlGateError::engine_error("sqlite", format!("Failed to close database: {e}"))
            })?;
            debug!("SQLite session closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    async fn get_schemas(&self) -> Result<Vec<String>> {
        self.with_conn(|_| Ok(vec![DEFAULT_SCHEMA.to_string()]))
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT name FROM {}.sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
                quote_ident(schema.unwrap_or(DEFAULT_SCHEMA))
            );
            let mut stmt = conn.prepare(&sql).map_err(|e| introspection_error("tables", &e))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| introspection_error("tables", &e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| introspection_error("tables", &e))?;
            Ok(names)
        })
    }

    async fn table_exists(&self, table: &str, schema: Option<&str>) -> Result<bool> {
        self.with_conn(|conn| table_exists(conn, table, schema))
    }

    async fn get_table_schema(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableColumn>> {
        self.with_conn(|conn| {
            let columns = pragma_table_info(conn, table, schema)?;
            if columns.is_empty() && !table_exists(conn, table, schema)? {
                return Err(SqlGateError::invalid_input(format!("Table '{table}' not found")));
            }
            Ok(columns.into_iter().map(|c| c.column).collect())
        })
    }

    async fn get_table_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableIndex>> {
        self.with_conn(|conn| introspect_indexes(conn, table, schema))
    }

    async fn get_stored_procedures(&self, _schema: Option<&str>) -> Result<Vec<String>> {
        // SQLite has no stored procedures
        self.with_conn(|_| Ok(Vec::new()))
    }

    async fn get_stored_procedure_detail(
        &self,
        name: &str,
        _schema: Option<&str>,
    ) -> Result<StoredProcedure> {
        Err(SqlGateError::invalid_input(format!(
            "SQLite does not support stored procedures (requested '{name}')"
        )))
    }

    #[instrument(skip_all, fields(connector = "sqlite"))]
    async fn execute_query(&self, sql: &str, options: &ExecuteOptions) -> Result<QueryResult> {
        let (interrupt, limit) = with_session(&self.session, |session| {
            Ok((session.conn.get_interrupt_handle(), options.timeout().or(session.request_timeout)))
        })?;

        let session = Arc::clone(&self.session);
        let (sql, options) = (sql.to_string(), options.clone());
        let mut task = tokio::task::spawn_blocking(move || {
            with_session(&session, |session| {
                let start = Instant::now();
                let mut result = execute_script(&session.conn, &sql, &options)?;
                result.execution_ms = elapsed_ms(start.elapsed());
                Ok(result)
            })
        });

        let joined = match limit {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    interrupt_and_wait(&interrupt, task).await;
                    return Err(SqlGateError::query_failed(format!(
                        "Query exceeded the {}ms timeout",
                        limit.as_millis()
                    )));
                }
            },
            None => task.await,
        };

        let result = joined.map_err(|e| {
            SqlGateError::engine_error("sqlite", format!("Query task failed: {e}"))
        })??;
        debug!(rows = result.row_count, ms = result.execution_ms, "Query executed");
        Ok(result)
    }
}

/// Stop the running statement and wait until the session is released
async fn interrupt_and_wait(
    interrupt: &InterruptHandle,
    task: tokio::task::JoinHandle<Result<QueryResult>>,
) {
    interrupt.interrupt();
    if let Ok(Err(e)) = task.await {
        debug!(error = %e, "Interrupted query finished");
    }
}

/// Open `SQLite` connection with flags derived from the DSN options
fn open_connection(config: &ConnectionConfig) -> Result<Connection> {
    if config.is_in_memory() {
        return Connection::open_in_memory().map_err(|e| {
            SqlGateError::connection_failed(format!("Failed to open in-memory SQLite database: {e}"))
        });
    }

    let path = config
        .file
        .as_ref()
        .ok_or_else(|| SqlGateError::invalid_input("SQLite requires a database path"))?;

    let flags = match config.options.get("mode").map(String::as_str) {
        Some("ro") => OpenFlags::SQLITE_OPEN_READ_ONLY,
        Some("rw") => OpenFlags::SQLITE_OPEN_READ_WRITE,
        _ => OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    };

    Connection::open_with_flags(path, flags | OpenFlags::SQLITE_OPEN_NO_MUTEX).map_err(|e| {
        SqlGateError::connection_failed(format!(
            "Failed to open SQLite database '{}': {e}",
            path.display()
        ))
    })
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn introspection_error(what: &str, e: &rusqlite::Error) -> SqlGateError {
    SqlGateError::engine_error("sqlite", format!("Failed to query {what}: {e}"))
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn table_exists(conn: &Connection, table: &str, schema: Option<&str>) -> Result<bool> {
    let sql = format!(
        "SELECT 1 FROM {}.sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        quote_ident(schema.unwrap_or(DEFAULT_SCHEMA))
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| introspection_error("table existence", &e))?;
    stmt.exists([table]).map_err(|e| introspection_error("table existence", &e))
}

/// Column plus its primary-key ordinal (0 = not part of the key)
struct PragmaColumn {
    column: TableColumn,
    pk: i64,
}

fn pragma_table_info(
    conn: &Connection,
    table: &str,
    schema: Option<&str>,
) -> Result<Vec<PragmaColumn>> {
    let sql = format!(
        "PRAGMA {}.table_info({})",
        quote_ident(schema.unwrap_or(DEFAULT_SCHEMA)),
        quote_ident(table)
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| introspection_error("columns", &e))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(PragmaColumn {
                column: TableColumn {
                    name: row.get::<_, String>(1)?,
                    data_type: row.get::<_, String>(2)?,
                    nullable: row.get::<_, i64>(3)? == 0, // notnull: 0 = nullable
                    default: row.get::<_, Option<String>>(4)?,
                },
                pk: row.get::<_, i64>(5)?,
            })
        })
        .map_err(|e| introspection_error("columns", &e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| introspection_error("columns", &e))?;
    Ok(columns)
}

fn introspect_indexes(
    conn: &Connection,
    table: &str,
    schema: Option<&str>,
) -> Result<Vec<TableIndex>> {
    let schema_ident = quote_ident(schema.unwrap_or(DEFAULT_SCHEMA));

    let mut list_stmt = conn
        .prepare(&format!("PRAGMA {schema_ident}.index_list({})", quote_ident(table)))
        .map_err(|e| introspection_error("indexes", &e))?;

    // (name, unique, origin)
    let index_list: Vec<(String, bool, String)> = list_stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)? != 0, row.get::<_, String>(3)?))
        })
        .map_err(|e| introspection_error("indexes", &e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| introspection_error("indexes", &e))?;

    let mut indexes = Vec::with_capacity(index_list.len() + 1);
    for (name, is_unique, origin) in index_list {
        let mut info_stmt = conn
            .prepare(&format!("PRAGMA {schema_ident}.index_info({})", quote_ident(&name)))
            .map_err(|e| introspection_error("index columns", &e))?;

        // Expression index columns have a NULL name
        let columns: Vec<String> = info_stmt
            .query_map([], |row| row.get::<_, Option<String>>(2))
            .map_err(|e| introspection_error("index columns", &e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| introspection_error("index columns", &e))?
            .into_iter()
            .flatten()
            .collect();

        indexes.push(TableIndex { name, columns, is_unique, is_primary: origin == "pk" });
    }

    // INTEGER PRIMARY KEY (rowid alias) has no backing index in index_list
    if !indexes.iter().any(|i| i.is_primary) {
        let mut pk_columns: Vec<(i64, String)> = pragma_table_info(conn, table, schema)?
            .into_iter()
            .filter(|c| c.pk > 0)
            .map(|c| (c.pk, c.column.name))
            .collect();
        pk_columns.sort_by_key(|(ordinal, _)| *ordinal);

        if !pk_columns.is_empty() {
            indexes.insert(
                0,
                TableIndex {
                    name: "PRIMARY".to_string(),
                    columns: pk_columns.into_iter().map(|(_, name)| name).collect(),
                    is_unique: true,
                    is_primary: true,
                },
            );
        }
    }

    Ok(indexes)
}

/// Execute every statement of `sql`; the last one produces the result
fn execute_script(conn: &Connection, sql: &str, options: &ExecuteOptions) -> Result<QueryResult> {
    let statements = split_statements(sql, DatabaseType::SQLite);
    let Some((last, leading)) = statements.split_last() else {
        return Err(SqlGateError::invalid_input("Query cannot be empty"));
    };

    for statement in leading {
        let mut stmt = prepare_single(conn, statement, options)?;
        let mut rows = stmt.query([]).map_err(|e| statement_error("execute statement", &e))?;
        while rows.next().map_err(|e| statement_error("execute statement", &e))?.is_some() {}
    }

    execute_statement(conn, last, options)
}

/// Prepare `sql`, which must be exactly one statement to `SQLite` as well
fn prepare_single<'c>(conn: &'c Connection, sql: &str, options: &ExecuteOptions) -> Result<Statement<'c>> {
    let mut batch = Batch::new(conn, sql);
    let stmt = batch
        .next()
        .map_err(|e| statement_error("prepare query", &e))?
        .ok_or_else(|| SqlGateError::invalid_input("Query cannot be empty"))?;

    if batch.next().map_err(|e| statement_error("prepare query", &e))?.is_some() {
        return Err(SqlGateError::validation_rejected(
            "SQLite reads this piece as more than one statement",
        ));
    }
    if options.is_readonly() && !stmt.readonly() {
        return Err(SqlGateError::validation_rejected(
            "Statement writes to the database, which is not allowed on a read-only source \
             (set readonly = false to permit it)",
        ));
    }
    Ok(stmt)
}

/// Failure of a user statement; an interrupt surfaces as its own message
fn statement_error(action: &str, e: &rusqlite::Error) -> SqlGateError {
    if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        return SqlGateError::query_failed("Query was interrupted");
    }
    SqlGateError::query_failed(format!("Failed to {action}: {e}"))
}

fn execute_statement(conn: &Connection, sql: &str, options: &ExecuteOptions) -> Result<QueryResult> {
    let mut stmt = prepare_single(conn, sql, options)?;

    let columns: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    // Non-SELECT query (INSERT, UPDATE, DELETE, DDL)
    if columns.is_empty() {
        stmt.execute([]).map_err(|e| statement_error("execute query", &e))?;
        return Ok(QueryResult::affected(conn.changes()));
    }

    let column_types: Vec<String> = stmt
        .columns()
        .iter()
        .map(|c| c.decl_type().unwrap_or_default().to_string())
        .collect();

    let mut rows = stmt.query([]).map_err(|e| statement_error("execute query", &e))?;

    let mut rows_data = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(|e| statement_error("fetch row", &e))?
    {
        if options.max_rows.is_some_and(|max| rows_data.len() >= max) {
            truncated = true;
            break;
        }
        let values = row_to_json(columns.len(), row)
            .map_err(|e| SqlGateError::query_failed(format!("Failed to decode row: {e}")))?;
        rows_data.push(values);
    }

    Ok(QueryResult {
        row_count: rows_data.len(),
        columns,
        column_types,
        rows: rows_data,
        rows_affected: None,
        truncated,
        execution_ms: 0,
    })
}

/// Convert a `SQLite` row to a JSON-safe `Vec`
fn row_to_json(
    width: usize,
    row: &Row,
) -> std::result::Result<Vec<serde_json::Value>, rusqlite::Error> {
    (0..width).map(|idx| sqlite_value_to_json(row, idx)).collect()
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(
    row: &Row,
    idx: usize,
) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    use base64::Engine;
    use rusqlite::types::ValueRef;

    Ok(match row.get_ref(idx)? {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // NaN/Infinity as null
        ValueRef::Text(s) => serde_json::Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = "
        CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT DEFAULT 'n/a');
        CREATE UNIQUE INDEX idx_users_email ON users(email);
        INSERT INTO users (name, email) VALUES ('Alice', 'alice@example.com');
        INSERT INTO users (name, email) VALUES ('Bob', 'bob@example.com');
        INSERT INTO users (name, email) VALUES ('Carol', 'carol@example.com');
    ";

    async fn connected() -> SqliteConnector {
        let connector = SqliteConnector::new();
        let options =
            ConnectOptions { init_script: Some(FIXTURE.to_string()), ..Default::default() };
        connector.connect("sqlite::memory:", &options).await.unwrap();
        connector
    }

    #[tokio::test]
    async fn test_connect_memory_and_disconnect() {
        let connector = connected().await;
        assert!(connector.is_connected());

        connector.disconnect().await.unwrap();
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let connector = SqliteConnector::new();
        assert!(connector.disconnect().await.is_ok());
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_connect_invalid_dsn() {
        let connector = SqliteConnector::new();
        let err = connector.connect("not-a-dsn", &ConnectOptions::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "DSN_FORMAT");
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_failed_init_script_leaves_connector_unconnected() {
        let connector = SqliteConnector::new();
        let options = ConnectOptions {
            init_script: Some("SELECT * FROM missing_table".to_string()),
            ..Default::default()
        };
        let err = connector.connect("sqlite::memory:", &options).await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let connector = SqliteConnector::new();
        let err = connector.get_tables(None).await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
    }

    #[tokio::test]
    async fn test_connect_read_only_file() {
        let temp_file = std::env::temp_dir().join("sqlgate_sqlite_ro.db");
        let _ = std::fs::remove_file(&temp_file);
        Connection::open(&temp_file)
            .and_then(|c| c.execute_batch("CREATE TABLE t (id INTEGER)"))
            .expect("Failed to create temp database");

        let connector = SqliteConnector::new();
        let dsn = format!("sqlite://{}?mode=ro", temp_file.display());
        connector.connect(&dsn, &ConnectOptions::default()).await.unwrap();

        let err = connector
            .execute_query("INSERT INTO t VALUES (1)", &ExecuteOptions::writable())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "QUERY_FAILED");

        connector.disconnect().await.unwrap();
        let _ = std::fs::remove_file(&temp_file);
    }

    #[tokio::test]
    async fn test_schemas_and_tables() {
        let connector = connected().await;
        assert_eq!(connector.get_schemas().await.unwrap(), vec!["main"]);
        assert_eq!(connector.get_tables(None).await.unwrap(), vec!["users"]);
        assert_eq!(connector.get_tables(Some("main")).await.unwrap(), vec!["users"]);
        assert!(connector.table_exists("users", None).await.unwrap());
        assert!(!connector.table_exists("orders", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_table_schema() {
        let connector = connected().await;
        let columns = connector.get_table_schema("users", None).await.unwrap();

        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[0].data_type, "INTEGER");
        assert_eq!(columns[1].name, "name");
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].default.as_deref(), Some("'n/a'"));
    }

    #[tokio::test]
    async fn test_table_schema_missing_table() {
        let connector = connected().await;
        let err = connector.get_table_schema("orders", None).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_indexes_include_rowid_primary_key() {
        let connector = connected().await;
        let indexes = connector.get_table_indexes("users", None).await.unwrap();

        let primary = indexes.iter().find(|i| i.is_primary).expect("primary key index");
        assert_eq!(primary.columns, vec!["id"]);

        let email = indexes.iter().find(|i| i.name == "idx_users_email").expect("email index");
        assert!(email.is_unique);
        assert!(!email.is_primary);
        assert_eq!(email.columns, vec!["email"]);
    }

    #[tokio::test]
    async fn test_procedures_unsupported() {
        let connector = connected().await;
        assert!(connector.get_stored_procedures(None).await.unwrap().is_empty());
        let err = connector.get_stored_procedure_detail("p", None).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_execute_select() {
        let connector = connected().await;
        let result = connector
            .execute_query("SELECT id, name FROM users ORDER BY id", &ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.column_types, vec!["INTEGER", "TEXT"]);
        assert_eq!(result.row_count, 3);
        assert_eq!(result.rows[0], vec![serde_json::json!(1), serde_json::json!("Alice")]);
        assert_eq!(result.rows_affected, None);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_execute_max_rows_limit() {
        let connector = connected().await;
        let options = ExecuteOptions::default().with_max_rows(2);
        let result = connector.execute_query("SELECT * FROM users", &options).await.unwrap();

        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.row_count, 2);
        assert!(result.truncated);

        let options = ExecuteOptions::default().with_max_rows(3);
        let result = connector.execute_query("SELECT * FROM users", &options).await.unwrap();
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_execute_write_reports_rows_affected() {
        let connector = connected().await;
        let result = connector
            .execute_query("UPDATE users SET email = NULL WHERE id > 1", &ExecuteOptions::writable())
            .await
            .unwrap();
        assert_eq!(result.rows_affected, Some(2));
        assert!(result.columns.is_empty());
    }

    #[tokio::test]
    async fn test_execute_multiple_statements_returns_last() {
        let connector = connected().await;
        let result = connector
            .execute_query(
                "INSERT INTO users (name) VALUES ('Dave'); SELECT COUNT(*) AS n FROM users",
                &ExecuteOptions::writable(),
            )
            .await
            .unwrap();
        assert_eq!(result.rows[0][0], serde_json::json!(4));
    }

    #[tokio::test]
    async fn test_execute_backend_error_is_query_failed() {
        let connector = connected().await;
        let err = connector
            .execute_query("SELECT * FROM nowhere", &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "QUERY_FAILED");
        assert!(err.message().contains("nowhere"));
    }

    #[tokio::test]
    async fn test_execute_all_data_types() {
        let connector = SqliteConnector::new();
        let options = ConnectOptions {
            init_script: Some(
                "CREATE TABLE test_types (int_col INTEGER, real_col REAL, text_col TEXT,
                                          blob_col BLOB, null_col TEXT);
                 INSERT INTO test_types VALUES (42, 3.5, 'hello', x'010203', NULL);"
                    .to_string(),
            ),
            ..Default::default()
        };
        connector.connect("sqlite::memory:", &options).await.unwrap();

        let result = connector
            .execute_query("SELECT * FROM test_types", &ExecuteOptions::default())
            .await
            .unwrap();
        let row = &result.rows[0];

        assert_eq!(row[0], serde_json::json!(42));
        assert_eq!(row[1], serde_json::json!(3.5));
        assert_eq!(row[2], serde_json::json!("hello"));
        assert_eq!(row[3], serde_json::json!("AQID"));
        assert_eq!(row[4], serde_json::Value::Null);
    }

    const LONG_QUERY: &str = "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 50000000)
                              SELECT COUNT(*) FROM n";

    #[tokio::test]
    async fn test_request_timeout_interrupts_running_query() {
        let connector = SqliteConnector::new();
        let options =
            ConnectOptions { request_timeout: Some(Duration::from_millis(200)), ..Default::default() };
        connector.connect("sqlite::memory:", &options).await.unwrap();

        let start = Instant::now();
        let err = connector.execute_query(LONG_QUERY, &ExecuteOptions::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "QUERY_FAILED");
        assert!(err.message().contains("200ms timeout"), "{}", err.message());
        assert!(start.elapsed() < Duration::from_secs(5));

        // The session is usable again
        let result = connector.execute_query("SELECT 1", &ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.rows[0][0], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_per_query_timeout_overrides_source() {
        let connector = connected().await;
        let options = ExecuteOptions { timeout_ms: Some(100), ..Default::default() };
        let err = connector.execute_query(LONG_QUERY, &options).await.unwrap_err();
        assert!(err.message().contains("100ms timeout"));
    }

    #[tokio::test]
    async fn test_readonly_refuses_writes_sqlite_reports() {
        let connector = connected().await;
        let err = connector
            .execute_query("DELETE FROM users", &ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_REJECTED");

        let err = connector
            .execute_query("SELECT 1 AS [a'b]; DROP TABLE users; --'; SELECT 1", &ExecuteOptions::read_only())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_REJECTED");
        assert!(connector.table_exists("users", None).await.unwrap());
    }

    #[test]
    fn test_validate_query_uses_sqlite_rules() {
        let connector = SqliteConnector::new();
        assert!(!connector.validate_query("VACUUM", &ExecuteOptions::default()).is_valid);
        assert!(connector.validate_query("VACUUM", &ExecuteOptions::writable()).is_valid);
    }
}
