//! `execute_sql` tool
//!
//! Runs a statement (or script) on a source after the safety gate. Tool
//! settings override the source's `readonly` and `max_rows`.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::ExecuteSqlConfig;
use crate::engine::ExecuteOptions;
use crate::error::{Result, SqlGateError};
use crate::sources::ConnectedSource;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExecuteSqlArgs {
    /// Source id; optional when exactly one source is configured
    #[serde(default)]
    pub source: Option<String>,
    /// SQL to execute. Several statements may be separated by `;`.
    pub sql: String,
}

/// Effective policy: tool settings first, then the source
#[must_use]
pub fn effective_options(config: &ExecuteSqlConfig, source: &ConnectedSource) -> ExecuteOptions {
    let base = source.config.execute_options();
    ExecuteOptions {
        readonly: config.readonly.or(base.readonly),
        max_rows: config.max_rows.or(base.max_rows),
        timeout_ms: source.config.request_timeout.map(|secs| secs.saturating_mul(1000)),
    }
}

pub(crate) async fn run(
    config: &ExecuteSqlConfig,
    source: &ConnectedSource,
    args: ExecuteSqlArgs,
) -> Result<Value> {
    let options = effective_options(config, source);
    let connector = &source.connector;

    if let Err(e) = connector.validate_query(&args.sql, &options).into_result() {
        warn!(source = %source.config.id, error = %e, "Statement rejected");
        return Err(e.for_source(&source.config.id));
    }

    debug!(source = %source.config.id, readonly = options.is_readonly(), "Executing SQL");
    let result = connector
        .execute_query(&args.sql, &options)
        .await
        .map_err(|e| e.for_source(&source.config.id))?;

    serde_json::to_value(result)
        .map_err(|e| SqlGateError::query_failed(format!("Failed to serialize result: {e}")))
}
