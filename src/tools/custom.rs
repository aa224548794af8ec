//! Custom tools
//!
//! A custom tool carries an opaque payload. When the payload names a
//! `statement`, invoking the tool runs it through the safety gate with the
//! source's policy. Other payloads have no executable meaning.

use serde_json::{json, Value};

use super::CustomToolConfig;
use crate::error::{Result, SqlGateError};
use crate::sources::ConnectedSource;

pub(crate) async fn run(config: &CustomToolConfig, source: &ConnectedSource) -> Result<Value> {
    let Some(statement) = config.payload.get("statement").and_then(Value::as_str) else {
        return Err(SqlGateError::invalid_input(format!(
            "Custom tool '{}' has no statement to execute",
            config.name
        )));
    };

    let options = source.config.execute_options();
    source
        .connector
        .validate_query(statement, &options)
        .into_result()
        .map_err(|e| e.for_source(&source.config.id))?;

    let result = source
        .connector
        .execute_query(statement, &options)
        .await
        .map_err(|e| e.for_source(&source.config.id))?;

    Ok(json!({
        "tool": config.name,
        "source": source.config.id,
        "result": result,
    }))
}
