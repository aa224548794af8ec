//! SQL Server Connector
//!
//! # Features
//! - TDS 7.3+ connections with SQL Server authentication
//! - Schema introspection via `INFORMATION_SCHEMA` and the `sys` catalog views
//! - Default schema is `dbo`
//!
//! # Implementation Notes
//! - Uses `tiberius` behind a single-connection `bb8` pool; the pool replaces a
//!   broken connection on checkout
//! - Encryption follows the `encrypt` option (required / login-only / server
//!   decides when absent); `trustServerCertificate=true` skips validation
//! - DECIMAL/NUMERIC rendered as a decimal string, binary data Base64-encoded
//! - Row counts of non-query statements are read back through `@@ROWCOUNT`
//! - Timeouts enforced via `tokio::time::timeout`; there is no server-side
//!   cancel, so the pool holding the abandoned connection is replaced

mod dsn;

pub use dsn::SqlServerDsnParser;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use bb8_tiberius::ConnectionManager;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::Value as Json;
use std::time::{Duration, Instant};
use tiberius::{AuthMethod, ColumnData, Config, EncryptionLevel, FromSql, Row, ToSql};
use tracing::{debug, info, instrument, warn};

use crate::capability::split_statements;
use crate::dsn::DsnParser;
use crate::engine::{
    cap_rows, not_connected, with_timeout, ConnectOptions, ConnectionConfig, Connector,
    DatabaseType, ExecuteOptions, ProcedureKind, QueryResult, StoredProcedure, TableColumn,
    TableIndex,
};
use crate::error::{Result, SqlGateError};

const DEFAULT_SCHEMA: &str = "dbo";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Appended to the last statement of a script to recover its row count
const ROWCOUNT_PROBE: &str = "SELECT CAST(@@ROWCOUNT AS BIGINT)";

type PooledClient<'a> = PooledConnection<'a, ConnectionManager>;

#[derive(Clone)]
struct Session {
    pool: Pool<ConnectionManager>,
    tds: Config,
    connection_timeout: Duration,
    request_timeout: Option<Duration>,
}

/// SQL Server connector
#[derive(Default)]
pub struct SqlServerConnector {
    parser: SqlServerDsnParser,
    session: RwLock<Option<Session>>,
}

impl SqlServerConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> Result<Session> {
        self.session.read().clone().ok_or_else(|| not_connected(DatabaseType::SqlServer))
    }

    /// Swap in a fresh pool; the old connection may still be mid-response
    fn discard_connection(&self, stale: &Session) {
        let pool = pool_builder(stale.connection_timeout)
            .build_unchecked(ConnectionManager::new(stale.tds.clone()));
        if let Some(session) = self.session.write().as_mut() {
            session.pool = pool;
        }
        warn!("SQL Server connection discarded after a timed-out request");
    }

    /// Run a parameterized catalog query and return its first result set
    async fn fetch(&self, what: &str, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>> {
        let session = self.session()?;
        let mut conn = checkout(&session.pool).await?;
        let stream = conn.query(sql, params).await.map_err(|e| introspection_error(what, &e))?;
        stream.into_first_result().await.map_err(|e| introspection_error(what, &e))
    }
}

#[async_trait]
impl Connector for SqlServerConnector {
    fn id(&self) -> &'static str {
        "sqlserver"
    }

    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn engine(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }

    fn dsn_parser(&self) -> &dyn DsnParser {
        &self.parser
    }

    fn new_instance(&self) -> Box<dyn Connector> {
        Box::new(Self::new())
    }

    #[instrument(skip_all, fields(connector = "sqlserver"))]
    async fn connect(&self, dsn: &str, options: &ConnectOptions) -> Result<()> {
        let config = self.parser.parse(dsn)?;
        let tds = build_tds_config(&config)?;
        let connection_timeout = options.connection_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let pool = pool_builder(connection_timeout)
            .build(ConnectionManager::new(tds.clone()))
            .await
            .map_err(|e| SqlGateError::connection_failed(format!("Failed to create SQL Server pool: {e}")))?;

        with_timeout(
            options.connection_timeout,
            async {
                let mut conn = pool.get().await.map_err(|e| {
                    SqlGateError::connection_failed(format!("Failed to connect to SQL Server: {e}"))
                })?;

                conn.simple_query("SELECT 1")
                    .await
                    .map_err(|e| SqlGateError::connection_failed(format!("SQL Server test query failed: {e}")))?
                    .into_results()
                    .await
                    .map_err(|e| SqlGateError::connection_failed(format!("SQL Server test query failed: {e}")))?;

                if let Some(script) = &options.init_script {
                    for statement in split_statements(script, DatabaseType::SqlServer) {
                        conn.execute(statement.as_str(), &[]).await.map_err(|e| {
                            SqlGateError::connection_failed(format!("SQL Server init script failed: {e}"))
                        })?;
                    }
                    debug!("Init script executed");
                }
                Ok(())
            },
            |limit| {
                SqlGateError::connection_failed(format!(
                    "Connecting to SQL Server timed out after {}ms",
                    limit.as_millis()
                ))
            },
        )
        .await?;

        *self.session.write() = Some(Session {
            pool,
            tds,
            connection_timeout,
            request_timeout: options.request_timeout,
        });

        info!(
            host = config.host.as_deref().unwrap_or_default(),
            database = config.database.as_deref().unwrap_or_default(),
            "Connected to SQL Server"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.session.write().take().is_some() {
            debug!("SQL Server pool closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.read().is_some()
    }

    async fn get_schemas(&self) -> Result<Vec<String>> {
        let rows = self
            .fetch(
                "schemas",
                "SELECT name FROM sys.schemas
                 WHERE schema_id < 16384 AND name NOT IN ('sys', 'INFORMATION_SCHEMA', 'guest')
                 ORDER BY name",
                &[],
            )
            .await?;
        rows.iter().map(|row| required_text(row, 0)).collect()
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = self
            .fetch(
                "tables",
                "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES
                 WHERE TABLE_SCHEMA = @P1 AND TABLE_TYPE = 'BASE TABLE'
                 ORDER BY TABLE_NAME",
                &[&schema],
            )
            .await?;
        rows.iter().map(|row| required_text(row, 0)).collect()
    }

    async fn table_exists(&self, table: &str, schema: Option<&str>) -> Result<bool> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = self
            .fetch(
                "table existence",
                "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES
                 WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2",
                &[&schema, &table],
            )
            .await?;
        let count = match rows.first() {
            Some(row) => row.try_get::<i32, usize>(0).map_err(|e| decode_error(0, &e))?,
            None => None,
        };
        Ok(count.unwrap_or(0) > 0)
    }

    async fn get_table_schema(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableColumn>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = self
            .fetch(
                "columns",
                "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT
                 FROM INFORMATION_SCHEMA.COLUMNS
                 WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
                 ORDER BY ORDINAL_POSITION",
                &[&schema, &table],
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(TableColumn {
                    name: required_text(row, 0)?,
                    data_type: required_text(row, 1)?,
                    nullable: required_text(row, 2)? == "YES",
                    default: text(row, 3)?,
                })
            })
            .collect()
    }

    async fn get_table_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableIndex>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = self
            .fetch(
                "indexes",
                "SELECT i.name, c.name, i.is_unique, i.is_primary_key
                 FROM sys.indexes i
                 JOIN sys.index_columns ic ON i.object_id = ic.object_id AND i.index_id = ic.index_id
                 JOIN sys.columns c ON ic.object_id = c.object_id AND ic.column_id = c.column_id
                 JOIN sys.tables t ON i.object_id = t.object_id
                 JOIN sys.schemas s ON t.schema_id = s.schema_id
                 WHERE s.name = @P1 AND t.name = @P2
                   AND i.name IS NOT NULL AND ic.is_included_column = 0
                 ORDER BY i.is_primary_key DESC, i.name, ic.key_ordinal",
                &[&schema, &table],
            )
            .await?;

        let mut indexes: Vec<TableIndex> = Vec::new();
        for row in &rows {
            let name = required_text(row, 0)?;
            let column = required_text(row, 1)?;
            match indexes.last_mut() {
                Some(index) if index.name == name => index.columns.push(column),
                _ => indexes.push(TableIndex {
                    name,
                    columns: vec![column],
                    is_unique: flag(row, 2)?,
                    is_primary: flag(row, 3)?,
                }),
            }
        }
        Ok(indexes)
    }

    async fn get_stored_procedures(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = self
            .fetch(
                "procedures",
                "SELECT ROUTINE_NAME FROM INFORMATION_SCHEMA.ROUTINES
                 WHERE ROUTINE_SCHEMA = @P1 ORDER BY ROUTINE_NAME",
                &[&schema],
            )
            .await?;
        rows.iter().map(|row| required_text(row, 0)).collect()
    }

    async fn get_stored_procedure_detail(
        &self,
        name: &str,
        schema: Option<&str>,
    ) -> Result<StoredProcedure> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = self
            .fetch(
                "procedure detail",
                "SELECT ROUTINE_NAME, ROUTINE_TYPE, DATA_TYPE, ROUTINE_BODY,
                        OBJECT_DEFINITION(OBJECT_ID(QUOTENAME(ROUTINE_SCHEMA) + '.' + QUOTENAME(ROUTINE_NAME)))
                 FROM INFORMATION_SCHEMA.ROUTINES
                 WHERE ROUTINE_SCHEMA = @P1 AND ROUTINE_NAME = @P2",
                &[&schema, &name],
            )
            .await?;
        let row = rows.first().ok_or_else(|| {
            SqlGateError::invalid_input(format!("Procedure '{schema}.{name}' not found"))
        })?;

        let params = self
            .fetch(
                "procedure parameters",
                "SELECT PARAMETER_MODE, PARAMETER_NAME, DATA_TYPE
                 FROM INFORMATION_SCHEMA.PARAMETERS
                 WHERE SPECIFIC_SCHEMA = @P1 AND SPECIFIC_NAME = @P2 AND ORDINAL_POSITION > 0
                 ORDER BY ORDINAL_POSITION",
                &[&schema, &name],
            )
            .await?;

        let mut parameters = Vec::with_capacity(params.len());
        for param in &params {
            let rendered = [text(param, 0)?, text(param, 1)?, text(param, 2)?]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            parameters.push(rendered.join(" "));
        }

        let kind = if required_text(row, 1)? == "PROCEDURE" {
            ProcedureKind::Procedure
        } else {
            ProcedureKind::Function
        };

        Ok(StoredProcedure {
            name: required_text(row, 0)?,
            kind,
            parameters: (!parameters.is_empty()).then(|| parameters.join(", ")),
            return_type: text(row, 2)?,
            language: text(row, 3)?,
            definition: text(row, 4)?,
        })
    }

    #[instrument(skip_all, fields(connector = "sqlserver"))]
    async fn execute_query(&self, sql: &str, options: &ExecuteOptions) -> Result<QueryResult> {
        let session = self.session()?;
        let start = Instant::now();
        let mut conn = checkout(&session.pool).await?;

        let mut timed_out = false;
        let outcome = with_timeout(
            options.timeout().or(session.request_timeout),
            run_script(&mut conn, sql, options),
            |limit| {
                timed_out = true;
                SqlGateError::query_failed(format!(
                    "Query exceeded the {}ms timeout",
                    limit.as_millis()
                ))
            },
        )
        .await;

        if timed_out {
            drop(conn);
            self.discard_connection(&session);
        }
        let mut result = outcome?;

        result.execution_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(rows = result.row_count, ms = result.execution_ms, "Query executed");
        Ok(result)
    }
}

/// Build the TDS client configuration from the parsed DSN
fn build_tds_config(config: &ConnectionConfig) -> Result<Config> {
    let host = config
        .host
        .as_deref()
        .ok_or_else(|| SqlGateError::invalid_input("SQL Server requires a host"))?;
    let user = config
        .user
        .as_deref()
        .ok_or_else(|| SqlGateError::invalid_input("SQL Server DSN requires a user"))?;

    let mut tds = Config::new();
    tds.host(host);
    tds.port(config.port.unwrap_or(1433));
    if let Some(database) = &config.database {
        tds.database(database);
    }
    tds.authentication(AuthMethod::sql_server(user, config.password.as_deref().unwrap_or_default()));
    tds.application_name("sqlgate");

    tds.encryption(match config.options.get("encrypt").map(String::as_str) {
        Some("true") => EncryptionLevel::Required,
        Some("false") => EncryptionLevel::Off,
        _ => EncryptionLevel::On,
    });
    if config.options.get("trustServerCertificate").map(String::as_str) == Some("true") {
        tds.trust_cert();
    }

    Ok(tds)
}

fn pool_builder(connection_timeout: Duration) -> bb8::Builder<ConnectionManager> {
    Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .retry_connection(false)
        .connection_timeout(connection_timeout)
}

async fn checkout(pool: &Pool<ConnectionManager>) -> Result<PooledClient<'_>> {
    pool.get().await.map_err(|e| {
        SqlGateError::connection_failed(format!("Failed to acquire SQL Server connection: {e}"))
    })
}

fn introspection_error(what: &str, e: &tiberius::error::Error) -> SqlGateError {
    SqlGateError::engine_error("sqlserver", format!("Failed to query {what}: {e}"))
}

fn decode_error(idx: usize, e: &tiberius::error::Error) -> SqlGateError {
    SqlGateError::engine_error("sqlserver", format!("Failed to decode column {idx}: {e}"))
}

fn text(row: &Row, idx: usize) -> Result<Option<String>> {
    row.try_get::<&str, usize>(idx)
        .map(|value| value.map(str::to_string))
        .map_err(|e| decode_error(idx, &e))
}

fn required_text(row: &Row, idx: usize) -> Result<String> {
    text(row, idx)?.ok_or_else(|| {
        SqlGateError::engine_error("sqlserver", format!("Unexpected NULL in column {idx}"))
    })
}

fn flag(row: &Row, idx: usize) -> Result<bool> {
    row.try_get::<bool, usize>(idx)
        .map(|value| value.unwrap_or(false))
        .map_err(|e| decode_error(idx, &e))
}

/// Execute every statement of `sql`; the last one produces the result
async fn run_script(
    conn: &mut PooledClient<'_>,
    sql: &str,
    options: &ExecuteOptions,
) -> Result<QueryResult> {
    let statements = split_statements(sql, DatabaseType::SqlServer);
    let Some((last, leading)) = statements.split_last() else {
        return Err(SqlGateError::invalid_input("Query cannot be empty"));
    };

    for statement in leading {
        conn.execute(statement.as_str(), &[])
            .await
            .map_err(|e| SqlGateError::query_failed(format!("Failed to execute statement: {e}")))?;
    }

    // Newline first so a trailing line comment cannot swallow the probe
    let batch = format!("{last}\n;{ROWCOUNT_PROBE}");
    let mut results = conn
        .simple_query(batch)
        .await
        .map_err(|e| SqlGateError::query_failed(format!("Failed to execute query: {e}")))?
        .into_results()
        .await
        .map_err(|e| SqlGateError::query_failed(format!("Failed to fetch rows: {e}")))?;

    let probe = results.pop();
    let Some(mut rows) = results.into_iter().next() else {
        let affected = probe
            .and_then(|rows| rows.into_iter().next())
            .and_then(|row| row.try_get::<i64, usize>(0).ok().flatten())
            .unwrap_or(0);
        return Ok(QueryResult::affected(u64::try_from(affected).unwrap_or(0)));
    };

    let truncated = cap_rows(&mut rows, options.max_rows);

    // Column metadata travels with each row; an empty result set reports none
    let (columns, column_types) = rows.first().map_or_else(
        || (Vec::new(), Vec::new()),
        |row| {
            row.columns()
                .iter()
                .map(|c| {
                    (c.name().to_string(), format!("{:?}", c.column_type()).to_ascii_lowercase())
                })
                .unzip()
        },
    );

    let rows: Vec<Vec<Json>> = rows
        .iter()
        .map(|row| row.cells().map(|(_, data)| sqlserver_value_to_json(data)).collect())
        .collect();

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

fn float_to_json(v: f64) -> Json {
    // NaN/Infinity as null
    serde_json::Number::from_f64(v).map_or(Json::Null, Json::Number)
}

/// Convert a TDS cell to a JSON value
fn sqlserver_value_to_json(data: &ColumnData<'static>) -> Json {
    use base64::Engine;

    match data {
        ColumnData::U8(v) => v.map_or(Json::Null, Json::from),
        ColumnData::I16(v) => v.map_or(Json::Null, Json::from),
        ColumnData::I32(v) => v.map_or(Json::Null, Json::from),
        ColumnData::I64(v) => v.map_or(Json::Null, Json::from),
        ColumnData::F32(v) => v.map_or(Json::Null, |f| float_to_json(f64::from(f))),
        ColumnData::F64(v) => v.map_or(Json::Null, float_to_json),
        ColumnData::Bit(v) => v.map_or(Json::Null, Json::Bool),
        ColumnData::String(v) => v.as_ref().map_or(Json::Null, |s| Json::String(s.to_string())),
        ColumnData::Guid(v) => v.map_or(Json::Null, |g| Json::String(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map_or(Json::Null, |bytes| {
            Json::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }),
        ColumnData::Numeric(_) => match Decimal::from_sql(data) {
            Ok(Some(d)) => Json::String(d.to_string()),
            _ => Json::Null,
        },
        ColumnData::Xml(v) => v
            .as_ref()
            .map_or(Json::Null, |xml| Json::String(xml.clone().into_owned().into_string())),
        _ => temporal_to_json(data),
    }
}

/// Date/time cells, rendered in ISO 8601
fn temporal_to_json(data: &ColumnData<'static>) -> Json {
    if let Ok(Some(v)) = DateTime::<FixedOffset>::from_sql(data) {
        return Json::String(v.to_rfc3339());
    }
    if let Ok(Some(v)) = NaiveDateTime::from_sql(data) {
        return Json::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(v)) = NaiveDate::from_sql(data) {
        return Json::String(v.to_string());
    }
    if let Ok(Some(v)) = NaiveTime::from_sql(data) {
        return Json::String(v.to_string());
    }
    Json::Null
}
