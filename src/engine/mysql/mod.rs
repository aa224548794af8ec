//! `MySQL` / `MariaDB` Connector
//!
//! One implementation serves both connector ids (`mysql`, `mariadb`); they
//! differ only in DSN scheme and display name.
//!
//! # Features
//! - Client-server connections via TCP, optional TLS through `ssl-mode`
//! - Schema introspection via `information_schema`
//! - Default schema is the connected database (`DATABASE()`)
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - Ad-hoc queries run one prepared statement at a time; text values are
//!   typed from column metadata
//! - JSON columns preserved as nested JSON, DECIMAL rendered as a string
//! - BLOB data is Base64-encoded for JSON safety
//! - Timeouts enforced via `tokio::time::timeout`; an expired query is killed
//!   from a side connection

mod dsn;

pub use dsn::MySqlDsnParser;

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Column, Conn, Opts, OptsBuilder, Row, SslOpts, Value};
use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capability::split_statements;
use crate::dsn::DsnParser;
use crate::engine::{
    cap_rows, not_connected, with_timeout, ConnectOptions, ConnectionConfig, Connector,
    DatabaseType, ExecuteOptions, ProcedureKind, QueryResult, StoredProcedure, TableColumn,
    TableIndex,
};
use crate::error::{Result, SqlGateError};

/// `BINARY` pseudo character set
const BINARY_CHARSET: u16 = 63;

struct Session {
    conn: Conn,
    opts: Opts,
    database: Option<String>,
    request_timeout: Option<Duration>,
}

/// `MySQL` / `MariaDB` connector
pub struct MySqlConnector {
    parser: MySqlDsnParser,
    session: Mutex<Option<Session>>,
    connected: AtomicBool,
}

impl MySqlConnector {
    #[must_use]
    pub fn mysql() -> Self {
        Self::with_parser(MySqlDsnParser::mysql())
    }

    #[must_use]
    pub fn mariadb() -> Self {
        Self::with_parser(MySqlDsnParser::mariadb())
    }

    fn with_parser(parser: MySqlDsnParser) -> Self {
        Self { parser, session: Mutex::new(None), connected: AtomicBool::new(false) }
    }

    fn is_mariadb(&self) -> bool {
        self.parser.sample_dsn().starts_with("mariadb")
    }

    fn engine_name(&self) -> &'static str {
        if self.is_mariadb() {
            "mariadb"
        } else {
            "mysql"
        }
    }

    fn introspection_error(&self, what: &str, e: &mysql_async::Error) -> SqlGateError {
        SqlGateError::engine_error(self.engine_name(), format!("Failed to query {what}: {e}"))
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    fn id(&self) -> &'static str {
        self.engine_name()
    }

    fn name(&self) -> &'static str {
        if self.is_mariadb() {
            "MariaDB"
        } else {
            "MySQL"
        }
    }

    fn engine(&self) -> DatabaseType {
        if self.is_mariadb() {
            DatabaseType::MariaDB
        } else {
            DatabaseType::MySQL
        }
    }

    fn dsn_parser(&self) -> &dyn DsnParser {
        &self.parser
    }

    fn new_instance(&self) -> Box<dyn Connector> {
        Box::new(Self::with_parser(self.parser))
    }

    #[instrument(skip_all, fields(connector = self.engine_name()))]
    async fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<()> {
        let config = self.parser.parse(dsn)?;
        let opts = Opts::from(build_mysql_opts(&config)?);

        let mut conn = with_timeout(
            options.connection_timeout,
            async {
                Conn::new(opts.clone()).await.map_err(|e| {
                    SqlGateError::connection_failed(format!("Failed to connect to {}: {e}", self.name()))
                })
            },
            |limit| {
                SqlGateError::connection_failed(format!(
                    "Connecting to {} timed out after {}ms",
                    self.name(),
                    limit.as_millis()
                ))
            },
        )
        .await?;

        if let Some(script) = &options.init_script {
            for statement in split_statements(script, self.engine()) {
                if let Err(e) = conn.query_drop(statement).await {
                    let _ = conn.disconnect().await;
                    return Err(SqlGateError::connection_failed(format!(
                        "{} init script failed: {e}",
                        self.name()
                    )));
                }
            }
            debug!("Init script executed");
        }

        let session = Session {
            conn,
            opts,
            database: config.database.clone(),
            request_timeout: options.request_timeout,
        };
        if let Some(previous) = self.session.lock().await.replace(session) {
            let _ = previous.conn.disconnect().await;
        }
        self.connected.store(true, Ordering::SeqCst);

        info!(
            host = config.host.as_deref().unwrap_or_default(),
            database = config.database.as_deref().unwrap_or_default(),
            "Connected to {}",
            self.name()
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(session) = session {
            session.conn.disconnect().await.map_err(|e| {
                SqlGateError::engine_error(self.engine_name(), format!("Failed to disconnect: {e}"))
            })?;
            debug!("{} session closed", self.name());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_schemas(&self) -> Result<Vec<String>> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(|| not_connected(self.engine()))?;
        let rows: Vec<Row> = session
            .conn
            .query(
                "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA
                 WHERE SCHEMA_NAME NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys')
                 ORDER BY SCHEMA_NAME",
            )
            .await
            .map_err(|e| self.introspection_error("schemas", &e))?;
        rows.iter().map(|row| required(row, 0, self.engine_name())).collect()
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(|| not_connected(self.engine()))?;
        let schema = resolve_schema(session, schema).await?;
        let rows: Vec<Row> = session
            .conn
            .exec(
                "SELECT TABLE_NAME FROM information_schema.TABLES
                 WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
                 ORDER BY TABLE_NAME",
                (schema,),
            )
            .await
            .map_err(|e| self.introspection_error("tables", &e))?;
        rows.iter().map(|row| required(row, 0, self.engine_name())).collect()
    }

    async fn table_exists(&self, table: &str, schema: Option<&str>) -> Result<bool> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(|| not_connected(self.engine()))?;
        let schema = resolve_schema(session, schema).await?;
        let count: Option<i64> = session
            .conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.TABLES
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                (schema, table),
            )
            .await
            .map_err(|e| self.introspection_error("table existence", &e))?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn get_table_schema(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableColumn>> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(|| not_connected(self.engine()))?;
        let schema = resolve_schema(session, schema).await?;
        let rows: Vec<Row> = session
            .conn
            .exec(
                "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT
                 FROM information_schema.COLUMNS
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                 ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await
            .map_err(|e| self.introspection_error("columns", &e))?;

        let engine = self.engine_name();
        rows.iter()
            .map(|row| {
                Ok(TableColumn {
                    name: required(row, 0, engine)?,
                    data_type: required(row, 1, engine)?,
                    nullable: required::<String>(row, 2, engine)? == "YES",
                    default: get_opt(row, 3, engine)?,
                })
            })
            .collect()
    }

    async fn get_table_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableIndex>> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(|| not_connected(self.engine()))?;
        let schema = resolve_schema(session, schema).await?;
        let rows: Vec<Row> = session
            .conn
            .exec(
                "SELECT INDEX_NAME, COLUMN_NAME, NON_UNIQUE
                 FROM information_schema.STATISTICS
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                 ORDER BY INDEX_NAME = 'PRIMARY' DESC, INDEX_NAME, SEQ_IN_INDEX",
                (schema, table),
            )
            .await
            .map_err(|e| self.introspection_error("indexes", &e))?;

        let engine = self.engine_name();
        let mut indexes: Vec<TableIndex> = Vec::new();
        for row in &rows {
            let name: String = required(row, 0, engine)?;
            // Functional index parts have no column name
            let column: Option<String> = get_opt(row, 1, engine)?;
            let non_unique: i64 = required(row, 2, engine)?;

            match indexes.last_mut() {
                Some(index) if index.name == name => index.columns.extend(column),
                _ => indexes.push(TableIndex {
                    is_primary: name == "PRIMARY",
                    name,
                    columns: column.into_iter().collect(),
                    is_unique: non_unique == 0,
                }),
            }
        }
        Ok(indexes)
    }

    async fn get_stored_procedures(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(|| not_connected(self.engine()))?;
        let schema = resolve_schema(session, schema).await?;
        let rows: Vec<Row> = session
            .conn
            .exec(
                "SELECT ROUTINE_NAME FROM information_schema.ROUTINES
                 WHERE ROUTINE_SCHEMA = ? ORDER BY ROUTINE_NAME",
                (schema,),
            )
            .await
            .map_err(|e| self.introspection_error("procedures", &e))?;
        rows.iter().map(|row| required(row, 0, self.engine_name())).collect()
    }

    async fn get_stored_procedure_detail(
        &self,
        name: &str,
        schema: Option<&str>,
    ) -> Result<StoredProcedure> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(|| not_connected(self.engine()))?;
        let schema = resolve_schema(session, schema).await?;
        let engine = self.engine_name();

        let row: Row = session
            .conn
            .exec_first(
                "SELECT ROUTINE_NAME, ROUTINE_TYPE, DTD_IDENTIFIER, ROUTINE_BODY, ROUTINE_DEFINITION
                 FROM information_schema.ROUTINES
                 WHERE ROUTINE_SCHEMA = ? AND ROUTINE_NAME = ?
                 LIMIT 1",
                (schema.as_str(), name),
            )
            .await
            .map_err(|e| self.introspection_error("procedure detail", &e))?
            .ok_or_else(|| {
                SqlGateError::invalid_input(format!("Procedure '{schema}.{name}' not found"))
            })?;

        let params: Vec<Row> = session
            .conn
            .exec(
                "SELECT PARAMETER_MODE, PARAMETER_NAME, DTD_IDENTIFIER
                 FROM information_schema.PARAMETERS
                 WHERE SPECIFIC_SCHEMA = ? AND SPECIFIC_NAME = ? AND ORDINAL_POSITION > 0
                 ORDER BY ORDINAL_POSITION",
                (schema.as_str(), name),
            )
            .await
            .map_err(|e| self.introspection_error("procedure parameters", &e))?;

        let mut parameters = Vec::with_capacity(params.len());
        for param in &params {
            let mode: Option<String> = get_opt(param, 0, engine)?;
            let param_name: Option<String> = get_opt(param, 1, engine)?;
            let data_type: Option<String> = get_opt(param, 2, engine)?;
            let rendered = [mode, param_name, data_type].into_iter().flatten().collect::<Vec<_>>();
            parameters.push(rendered.join(" "));
        }

        let kind = if required::<String>(&row, 1, engine)? == "PROCEDURE" {
            ProcedureKind::Procedure
        } else {
            ProcedureKind::Function
        };

        Ok(StoredProcedure {
            name: required(&row, 0, engine)?,
            kind,
            parameters: (!parameters.is_empty()).then(|| parameters.join(", ")),
            return_type: get_opt::<String>(&row, 2, engine)?.filter(|t| !t.is_empty()),
            language: get_opt(&row, 3, engine)?,
            definition: get_opt(&row, 4, engine)?,
        })
    }

    #[instrument(skip_all, fields(connector = self.engine_name()))]
    async fn execute_query(&self, sql: &str, options: &ExecuteOptions) -> Result<QueryResult> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(|| not_connected(self.engine()))?;
        let start = Instant::now();

        let mut result = match options.timeout().or(session.request_timeout) {
            Some(limit) => {
                match tokio::time::timeout(limit, run_script(&mut session.conn, sql, options)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        kill_query(session.opts.clone(), session.conn.id());
                        return Err(SqlGateError::query_failed(format!(
                            "Query exceeded the {}ms timeout and was killed",
                            limit.as_millis()
                        )));
                    }
                }
            }
            None => run_script(&mut session.conn, sql, options).await?,
        };

        result.execution_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(rows = result.row_count, ms = result.execution_ms, "Query executed");
        Ok(result)
    }
}

/// Build `MySQL` connection options from the parsed DSN
fn build_mysql_opts(config: &ConnectionConfig) -> Result<OptsBuilder> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| SqlGateError::invalid_input("MySQL requires a host"))?;

    let ssl_opts = match config.options.get("ssl-mode").map(String::as_str) {
        Some("REQUIRED") => Some(
            SslOpts::default()
                .with_danger_accept_invalid_certs(true)
                .with_danger_skip_domain_validation(true),
        ),
        Some("VERIFY_CA") => Some(SslOpts::default().with_danger_skip_domain_validation(true)),
        Some("VERIFY_IDENTITY") => Some(SslOpts::default()),
        _ => None,
    };

    Ok(OptsBuilder::default()
        .ip_or_hostname(host.clone())
        .tcp_port(config.port.unwrap_or(3306))
        .user(config.user.clone())
        .pass(config.password.clone())
        .db_name(config.database.clone())
        .ssl_opts(ssl_opts))
}

/// Kill a running statement from a side connection
fn kill_query(opts: Opts, connection_id: u32) {
    tokio::spawn(async move {
        match Conn::new(opts).await {
            Ok(mut conn) => {
                if let Err(e) = conn.query_drop(format!("KILL QUERY {connection_id}")).await {
                    warn!("Failed to kill timed-out query: {e}");
                }
                let _ = conn.disconnect().await;
            }
            Err(e) => warn!("Failed to open connection to kill timed-out query: {e}"),
        }
    });
}

/// Explicit schema, else the DSN database, else `DATABASE()`
async fn resolve_schema(session: &mut Session, schema: Option<&str>) -> Result<String> {
    if let Some(schema) = schema.or(session.database.as_deref()) {
        return Ok(schema.to_string());
    }

    let current: Option<Option<String>> =
        session.conn.query_first("SELECT DATABASE()").await.map_err(|e| {
            SqlGateError::engine_error("mysql", format!("Failed to query current database: {e}"))
        })?;

    current.flatten().ok_or_else(|| {
        SqlGateError::invalid_input("No schema given and the connection has no default database")
    })
}

/// Nullable typed getter that never panics on conversion failure
fn get_opt<T: FromValue>(row: &Row, idx: usize, engine: &str) -> Result<Option<T>> {
    match row.get_opt::<Option<T>, usize>(idx) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(SqlGateError::engine_error(
            engine,
            format!("Failed to decode column {idx}: {e}"),
        )),
        None => Ok(None),
    }
}

fn required<T: FromValue>(row: &Row, idx: usize, engine: &str) -> Result<T> {
    get_opt(row, idx, engine)?.ok_or_else(|| {
        SqlGateError::engine_error(engine, format!("Unexpected NULL in column {idx}"))
    })
}

/// Execute every statement of `sql`; the last one produces the result
///
/// Pieces run as prepared statements, which the server refuses to hold more
/// than one statement.
async fn run_script(conn: &mut Conn, sql: &str, options: &ExecuteOptions) -> Result<QueryResult> {
    let statements = split_statements(sql, DatabaseType::MySQL);
    let Some((last, leading)) = statements.split_last() else {
        return Err(SqlGateError::invalid_input("Query cannot be empty"));
    };

    for statement in leading {
        conn.exec_drop(statement.as_str(), ())
            .await
            .map_err(|e| SqlGateError::query_failed(format!("Failed to execute statement: {e}")))?;
    }

    execute_statement(conn, last, options).await
}

async fn execute_statement(conn: &mut Conn, sql: &str, options: &ExecuteOptions) -> Result<QueryResult> {
    let mut result = conn
        .exec_iter(sql, ())
        .await
        .map_err(|e| SqlGateError::query_failed(format!("Failed to execute query: {e}")))?;

    let columns: Vec<Column> = result.columns_ref().to_vec();

    // Query does not return rows (INSERT, UPDATE, DELETE, DDL)
    if columns.is_empty() {
        let rows_affected = result.affected_rows();
        result
            .drop_result()
            .await
            .map_err(|e| SqlGateError::query_failed(format!("Failed to execute query: {e}")))?;
        return Ok(QueryResult::affected(rows_affected));
    }

    let mut rows: Vec<Row> = result
        .collect()
        .await
        .map_err(|e| SqlGateError::query_failed(format!("Failed to fetch rows: {e}")))?;
    result
        .drop_result()
        .await
        .map_err(|e| SqlGateError::query_failed(format!("Failed to finish query: {e}")))?;
    let truncated = cap_rows(&mut rows, options.max_rows);

    let rows: Vec<Vec<Json>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, column)| row.as_ref(idx).map_or(Json::Null, |v| mysql_value_to_json(v, column)))
                .collect()
        })
        .collect();

    Ok(QueryResult {
        row_count: rows.len(),
        columns: columns.iter().map(|c| c.name_str().into_owned()).collect(),
        column_types: columns.iter().map(column_type_name).collect(),
        rows,
        rows_affected: None,
        truncated,
        execution_ms: 0,
    })
}

fn column_type_name(column: &Column) -> String {
    let raw = format!("{:?}", column.column_type());
    raw.trim_start_matches("MYSQL_TYPE_").to_ascii_lowercase()
}

fn float_to_json(v: f64) -> Json {
    // NaN/Infinity as null
    serde_json::Number::from_f64(v).map_or(Json::Null, Json::Number)
}

/// Convert `MySQL` value to JSON value, typed by column metadata
fn mysql_value_to_json(value: &Value, column: &Column) -> Json {
    use base64::Engine;

    match value {
        Value::NULL => Json::Null,

        // Strings, DECIMAL and JSON arrive as bytes
        Value::Bytes(bytes) => {
            let text = std::str::from_utf8(bytes).ok();
            match (column.column_type(), text) {
                (
                    ColumnType::MYSQL_TYPE_TINY
                    | ColumnType::MYSQL_TYPE_SHORT
                    | ColumnType::MYSQL_TYPE_INT24
                    | ColumnType::MYSQL_TYPE_LONG
                    | ColumnType::MYSQL_TYPE_LONGLONG
                    | ColumnType::MYSQL_TYPE_YEAR,
                    Some(text),
                ) => text
                    .parse::<i64>()
                    .map(Json::from)
                    .or_else(|_| text.parse::<u64>().map(Json::from))
                    .unwrap_or_else(|_| Json::String(text.to_string())),
                (ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE, Some(text)) => {
                    text.parse::<f64>().map_or_else(|_| Json::String(text.to_string()), float_to_json)
                }
                (ColumnType::MYSQL_TYPE_JSON, Some(text)) => {
                    serde_json::from_str(text).unwrap_or_else(|_| Json::String(text.to_string()))
                }
                (
                    ColumnType::MYSQL_TYPE_BLOB
                    | ColumnType::MYSQL_TYPE_TINY_BLOB
                    | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
                    | ColumnType::MYSQL_TYPE_LONG_BLOB
                    | ColumnType::MYSQL_TYPE_VAR_STRING
                    | ColumnType::MYSQL_TYPE_STRING
                    | ColumnType::MYSQL_TYPE_BIT
                    | ColumnType::MYSQL_TYPE_GEOMETRY,
                    _,
                ) if column.character_set() == BINARY_CHARSET => {
                    Json::String(base64::engine::general_purpose::STANDARD.encode(bytes))
                }
                (_, Some(text)) => Json::String(text.to_string()),
                (_, None) => Json::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
            }
        }

        Value::Int(i) => Json::from(*i),
        Value::UInt(u) => Json::from(*u),
        Value::Float(f) => float_to_json(f64::from(*f)),
        Value::Double(d) => float_to_json(*d),

        Value::Date(year, month, day, hour, minute, second, micro) => Json::String(format!(
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
        )),

        Value::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            Json::String(format!("{sign}{total_hours}:{minutes:02}:{seconds:02}.{micros:06}"))
        }
    }
}
