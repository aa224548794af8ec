//! `PostgreSQL` Connector
//!
//! # Features
//! - Client-server connections via TCP
//! - Schema introspection via `information_schema` and `pg_catalog`
//! - Rich type system support (JSON/JSONB, NUMERIC, timestamps, UUID, arrays)
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` (async driver, requires tokio runtime)
//! - The connection future runs on a spawned task for the session's lifetime
//! - JSON/JSONB preserved as nested JSON, NUMERIC rendered as a decimal string
//! - BYTEA data is Base64-encoded for JSON safety
//! - Result sets containing types without a binary decoder are re-run over the
//!   simple (text) protocol and returned as strings
//! - Timeouts enforced via `tokio::time::timeout`; an expired query is cancelled
//!   server-side
//! - Only plaintext connections (`sslmode` disable/allow/prefer)

mod dsn;

pub use dsn::PostgresDsnParser;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row, SimpleQueryMessage};
use tracing::{debug, info, instrument, warn};

use crate::capability::split_statements;
use crate::dsn::DsnParser;
use crate::engine::{
    cap_rows, not_connected, with_timeout, ConnectOptions, ConnectionConfig, Connector,
    DatabaseType, ExecuteOptions, ProcedureKind, QueryResult, StoredProcedure, TableColumn,
    TableIndex,
};
use crate::error::{Result, SqlGateError};

const DEFAULT_SCHEMA: &str = "public";

/// Live session: client plus the task driving its connection
struct Session {
    client: Client,
    connection_task: JoinHandle<()>,
    request_timeout: Option<Duration>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

/// `PostgreSQL` connector
#[derive(Default)]
pub struct PostgresConnector {
    parser: PostgresDsnParser,
    session: RwLock<Option<Arc<Session>>>,
}

impl PostgresConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session.read().clone().ok_or_else(|| not_connected(DatabaseType::Postgres))
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn id(&self) -> &'static str {
        "postgres"
    }

    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn engine(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn dsn_parser(&self) -> &dyn DsnParser {
        &self.parser
    }

    fn new_instance(&self) -> Box<dyn Connector> {
        Box::new(Self::new())
    }

    #[instrument(skip_all, fields(connector = "postgres"))]
    async fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<()> {
        let config = self.parser.parse(dsn)?;
        let pg_config = build_pg_config(&config, options)?;

        let (client, connection) = with_timeout(
            options.connection_timeout,
            async {
                pg_config.connect(NoTls).await.map_err(|e| {
                    SqlGateError::connection_failed(pg_error("Failed to connect to PostgreSQL", &e))
                })
            },
            |limit| {
                SqlGateError::connection_failed(format!(
                    "Connecting to PostgreSQL timed out after {}ms",
                    limit.as_millis()
                ))
            },
        )
        .await?;

        // Note: Connection errors are not logged to prevent credential leakage
        let connection_task = tokio::spawn(async move {
            let _ = connection.await;
        });

        let session =
            Session { client, connection_task, request_timeout: options.request_timeout };

        if let Some(script) = &options.init_script {
            // Dropping the session on failure aborts the connection task
            session.client.batch_execute(script).await.map_err(|e| {
                SqlGateError::connection_failed(pg_error("PostgreSQL init script failed", &e))
            })?;
            debug!("Init script executed");
        }

        *self.session.write() = Some(Arc::new(session));
        info!(
            host = config.host.as_deref().unwrap_or_default(),
            database = config.database.as_deref().unwrap_or_default(),
            "Connected to PostgreSQL"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.session.write().take().is_some() {
            debug!("PostgreSQL session closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.read().as_ref().is_some_and(|s| !s.client.is_closed())
    }

    async fn get_schemas(&self) -> Result<Vec<String>> {
        let session = self.session()?;
        let rows = session
            .client
            .query(
                "SELECT schema_name::text FROM information_schema.schemata
                 WHERE schema_name NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
                   AND schema_name NOT LIKE 'pg_temp_%'
                   AND schema_name NOT LIKE 'pg_toast_temp_%'
                 ORDER BY schema_name",
                &[],
            )
            .await
            .map_err(|e| introspection_error("schemas", &e))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let session = self.session()?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = session
            .client
            .query(
                "SELECT table_name::text FROM information_schema.tables
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                 ORDER BY table_name",
                &[&schema],
            )
            .await
            .map_err(|e| introspection_error("tables", &e))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn table_exists(&self, table: &str, schema: Option<&str>) -> Result<bool> {
        let session = self.session()?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let row = session
            .client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.tables
                     WHERE table_schema = $1 AND table_name = $2
                 )",
                &[&schema, &table],
            )
            .await
            .map_err(|e| introspection_error("table existence", &e))?;
        Ok(row.get(0))
    }

    async fn get_table_schema(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableColumn>> {
        let session = self.session()?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = session
            .client
            .query(
                "SELECT column_name::text, data_type::text, is_nullable::text, column_default::text
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await
            .map_err(|e| introspection_error("columns", &e))?;

        Ok(rows
            .iter()
            .map(|row| TableColumn {
                name: row.get(0),
                data_type: row.get(1),
                nullable: row.get::<_, String>(2) == "YES",
                default: row.get(3),
            })
            .collect())
    }

    async fn get_table_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableIndex>> {
        let session = self.session()?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = session
            .client
            .query(
                "SELECT i.relname::text,
                        array_agg(a.attname::text ORDER BY array_position(ix.indkey::int2[], a.attnum)),
                        ix.indisunique,
                        ix.indisprimary
                 FROM pg_class t
                 JOIN pg_namespace n ON n.oid = t.relnamespace
                 JOIN pg_index ix ON ix.indrelid = t.oid
                 JOIN pg_class i ON i.oid = ix.indexrelid
                 JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
                 WHERE n.nspname = $1 AND t.relname = $2
                 GROUP BY i.relname, ix.indisunique, ix.indisprimary
                 ORDER BY ix.indisprimary DESC, i.relname",
                &[&schema, &table],
            )
            .await
            .map_err(|e| introspection_error("indexes", &e))?;

        Ok(rows
            .iter()
            .map(|row| TableIndex {
                name: row.get(0),
                columns: row.get(1),
                is_unique: row.get(2),
                is_primary: row.get(3),
            })
            .collect())
    }

    async fn get_stored_procedures(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let session = self.session()?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = session
            .client
            .query(
                "SELECT DISTINCT p.proname::text
                 FROM pg_proc p
                 JOIN pg_namespace n ON n.oid = p.pronamespace
                 WHERE n.nspname = $1 AND p.prokind IN ('p', 'f')
                 ORDER BY 1",
                &[&schema],
            )
            .await
            .map_err(|e| introspection_error("procedures", &e))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn get_stored_procedure_detail(
        &self,
        name: &str,
        schema: Option<&str>,
    ) -> Result<StoredProcedure> {
        let session = self.session()?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let row = session
            .client
            .query_opt(
                "SELECT p.proname::text,
                        p.prokind::text,
                        pg_get_function_arguments(p.oid),
                        pg_get_function_result(p.oid),
                        l.lanname::text,
                        pg_get_functiondef(p.oid)
                 FROM pg_proc p
                 JOIN pg_namespace n ON n.oid = p.pronamespace
                 JOIN pg_language l ON l.oid = p.prolang
                 WHERE n.nspname = $1 AND p.proname = $2 AND p.prokind IN ('p', 'f')
                 ORDER BY p.oid
                 LIMIT 1",
                &[&schema, &name],
            )
            .await
            .map_err(|e| introspection_error("procedure detail", &e))?
            .ok_or_else(|| {
                SqlGateError::invalid_input(format!("Procedure '{schema}.{name}' not found"))
            })?;

        let kind = if row.get::<_, String>(1) == "p" {
            ProcedureKind::Procedure
        } else {
            ProcedureKind::Function
        };

        Ok(StoredProcedure {
            name: row.get(0),
            kind,
            parameters: row.get::<_, Option<String>>(2).filter(|p| !p.is_empty()),
            return_type: row.get(3),
            language: row.get(4),
            definition: row.get(5),
        })
    }

    #[instrument(skip_all, fields(connector = "postgres"))]
    async fn execute_query(&self, sql: &str, options: &ExecuteOptions) -> Result<QueryResult> {
        let session = self.session()?;
        let start = Instant::now();

        let mut result = match options.timeout().or(session.request_timeout) {
            Some(limit) => {
                match tokio::time::timeout(limit, run_script(&session.client, sql, options)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        let token = session.client.cancel_token();
                        tokio::spawn(async move {
                            if let Err(e) = token.cancel_query(NoTls).await {
                                warn!("Failed to cancel timed-out query: {e}");
                            }
                        });
                        return Err(SqlGateError::query_failed(format!(
                            "Query exceeded the {}ms timeout and was cancelled",
                            limit.as_millis()
                        )));
                    }
                }
            }
            None => run_script(&session.client, sql, options).await?,
        };

        result.execution_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(rows = result.row_count, ms = result.execution_ms, "Query executed");
        Ok(result)
    }
}

/// Build `tokio-postgres` config from parsed DSN and connect options
fn build_pg_config(config: &ConnectionConfig, options: &ConnectOptions) -> Result<Config> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| SqlGateError::invalid_input("PostgreSQL requires a host"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| SqlGateError::invalid_input("PostgreSQL requires a user"))?;

    match config.options.get("sslmode").map(String::as_str) {
        Some(mode @ ("require" | "verify-ca" | "verify-full")) => {
            return Err(SqlGateError::connection_failed(format!(
                "sslmode={mode} requires TLS, which is not supported; use sslmode=disable or prefer"
            )));
        }
        _ => {}
    }

    let mut pg_config = Config::new();
    pg_config
        .host(host)
        .port(config.port.unwrap_or(5432))
        .user(user)
        .dbname(config.database.as_deref().unwrap_or(user))
        .ssl_mode(SslMode::Disable);

    if let Some(password) = &config.password {
        pg_config.password(password);
    }
    if let Some(name) = config.options.get("application_name") {
        pg_config.application_name(name);
    }
    if let Some(timeout) = options.connection_timeout {
        pg_config.connect_timeout(timeout);
    }

    Ok(pg_config)
}

/// Render a driver error, preferring the server diagnostic
fn pg_error(context: &str, e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{context}: {} (SQLSTATE {})", db.message(), db.code().code()),
        None => format!("{context}: {e}"),
    }
}

fn introspection_error(what: &str, e: &tokio_postgres::Error) -> SqlGateError {
    SqlGateError::engine_error("postgres", pg_error(&format!("Failed to query {what}"), e))
}

/// Execute every statement of `sql`; the last one produces the result
///
/// Each piece goes through the extended protocol, which refuses a piece the
/// server parses as more than one command.
async fn run_script(client: &Client, sql: &str, options: &ExecuteOptions) -> Result<QueryResult> {
    let statements = split_statements(sql, DatabaseType::Postgres);
    let Some((last, leading)) = statements.split_last() else {
        return Err(SqlGateError::invalid_input("Query cannot be empty"));
    };

    for statement in leading {
        client.execute(statement.as_str(), &[]).await.map_err(|e| {
            SqlGateError::query_failed(pg_error("Failed to execute statement", &e))
        })?;
    }

    execute_statement(client, last, options).await
}

async fn execute_statement(
    client: &Client,
    sql: &str,
    options: &ExecuteOptions,
) -> Result<QueryResult> {
    let stmt = client
        .prepare(sql)
        .await
        .map_err(|e| SqlGateError::query_failed(pg_error("Failed to prepare query", &e)))?;

    // Non-SELECT query (INSERT, UPDATE, DELETE, DDL)
    if stmt.columns().is_empty() {
        let rows_affected = client
            .execute(&stmt, &[])
            .await
            .map_err(|e| SqlGateError::query_failed(pg_error("Failed to execute query", &e)))?;
        return Ok(QueryResult::affected(rows_affected));
    }

    let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
    let column_types: Vec<String> =
        stmt.columns().iter().map(|c| c.type_().name().to_string()).collect();

    if !stmt.columns().iter().all(|c| is_binary_supported(c.type_())) {
        return execute_as_text(client, sql, columns, column_types, options).await;
    }

    let mut rows = client
        .query(&stmt, &[])
        .await
        .map_err(|e| SqlGateError::query_failed(pg_error("Failed to execute query", &e)))?;
    let truncated = cap_rows(&mut rows, options.max_rows);

    let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;
    Ok(QueryResult {
        row_count: rows.len(),
        columns,
        column_types,
        rows,
        rows_affected: None,
        truncated,
        execution_ms: 0,
    })
}

/// Re-run a query over the simple protocol, returning every value as text
async fn execute_as_text(
    client: &Client,
    sql: &str,
    columns: Vec<String>,
    column_types: Vec<String>,
    options: &ExecuteOptions,
) -> Result<QueryResult> {
    let messages = client
        .simple_query(sql)
        .await
        .map_err(|e| SqlGateError::query_failed(pg_error("Failed to execute query", &e)))?;

    let mut rows: Vec<Vec<Value>> = messages
        .iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|idx| row.get(idx).map_or(Value::Null, |v| Value::String(v.to_string())))
                    .collect(),
            ),
            _ => None,
        })
        .collect();
    let truncated = cap_rows(&mut rows, options.max_rows);

    Ok(QueryResult {
        row_count: rows.len(),
        columns,
        column_types,
        rows,
        rows_affected: None,
        truncated,
        execution_ms: 0,
    })
}

fn is_binary_supported(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::OID
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::NUMERIC
            | Type::VARCHAR
            | Type::TEXT
            | Type::BPCHAR
            | Type::NAME
            | Type::UNKNOWN
            | Type::JSON
            | Type::JSONB
            | Type::BYTEA
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
            | Type::DATE
            | Type::TIME
            | Type::UUID
            | Type::TEXT_ARRAY
            | Type::VARCHAR_ARRAY
            | Type::INT4_ARRAY
            | Type::INT8_ARRAY
    )
}

/// Convert a `PostgreSQL` row to a JSON-safe `Vec`
fn row_to_json(row: &Row) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| postgres_value_to_json(row, idx)).collect()
}

/// Nullable typed getter
fn cell<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        SqlGateError::query_failed(format!(
            "Failed to decode column '{}': {e}",
            row.columns()[idx].name()
        ))
    })
}

fn float_to_json(v: f64) -> Value {
    // NaN/Infinity as null
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> Result<Value> {
    use base64::Engine;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    let col_type = row.columns()[idx].type_();

    let value = match *col_type {
        Type::BOOL => cell::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => cell::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => cell::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => cell::<i64>(row, idx)?.map(Value::from),
        Type::OID => cell::<u32>(row, idx)?.map(Value::from),
        Type::FLOAT4 => cell::<f32>(row, idx)?.map(|v| float_to_json(f64::from(v))),
        Type::FLOAT8 => cell::<f64>(row, idx)?.map(float_to_json),
        Type::NUMERIC => {
            cell::<rust_decimal::Decimal>(row, idx)?.map(|v| Value::String(v.to_string()))
        }
        Type::JSON | Type::JSONB => cell::<Value>(row, idx)?,
        Type::BYTEA => cell::<Vec<u8>>(row, idx)?
            .map(|v| Value::String(base64::engine::general_purpose::STANDARD.encode(v))),
        Type::TIMESTAMP => cell::<NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => cell::<DateTime<Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => {
            cell::<NaiveDate>(row, idx)?.map(|v| Value::String(v.format("%Y-%m-%d").to_string()))
        }
        Type::TIME => cell::<NaiveTime>(row, idx)?
            .map(|v| Value::String(v.format("%H:%M:%S%.f").to_string())),
        Type::UUID => cell::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => cell::<Vec<Option<String>>>(row, idx)?
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        Type::INT4_ARRAY => cell::<Vec<Option<i32>>>(row, idx)?
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        Type::INT8_ARRAY => cell::<Vec<Option<i64>>>(row, idx)?
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        // Text types (VARCHAR, TEXT, CHAR, NAME, unknown literals)
        _ => cell::<String>(row, idx)?.map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}
