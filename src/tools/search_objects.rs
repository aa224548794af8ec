//! `search_objects` tool
//!
//! Progressive schema discovery: find schemas, tables, columns, procedures or
//! indexes whose name matches a SQL `LIKE` pattern, at a chosen level of
//! detail.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::Connector;
use crate::error::{Result, SqlGateError};
use crate::sources::ConnectedSource;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Schema,
    Table,
    Column,
    Procedure,
    Index,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    /// Names only
    #[default]
    Names,
    /// Names plus key metadata
    Summary,
    /// Everything introspection reports
    Full,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchObjectsArgs {
    /// Source id; optional when exactly one source is configured
    #[serde(default)]
    pub source: Option<String>,
    pub object_type: ObjectType,
    /// SQL LIKE pattern (`%` any run, `_` one character), case-insensitive
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Restrict to one schema
    #[serde(default)]
    pub schema: Option<String>,
    /// Restrict columns and indexes to one table
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub detail_level: DetailLevel,
    /// Maximum results (default 100, at most 1000)
    #[serde(default)]
    pub limit: Option<usize>,
}

fn default_pattern() -> String {
    "%".to_string()
}

/// Case-insensitive SQL `LIKE` match; `\` escapes the next character
#[must_use]
pub fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('_') => {
                p += 1;
                t += 1;
            }
            Some('\\') if pattern.get(p + 1) == Some(&text[t]) => {
                p += 2;
                t += 1;
            }
            Some(&c) if c != '\\' && c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '%')
}

/// Bounded result accumulator
struct Matches {
    limit: usize,
    results: Vec<Value>,
    truncated: bool,
}

impl Matches {
    fn new(limit: usize) -> Self {
        Self { limit, results: Vec::new(), truncated: false }
    }

    fn is_full(&self) -> bool {
        self.truncated
    }

    fn push(&mut self, value: Value) {
        if self.results.len() < self.limit {
            self.results.push(value);
        } else {
            self.truncated = true;
        }
    }
}

pub(crate) async fn run(source: &ConnectedSource, args: SearchObjectsArgs) -> Result<Value> {
    let limit = args.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(SqlGateError::invalid_input(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    if args.table.is_some() && !matches!(args.object_type, ObjectType::Column | ObjectType::Index) {
        return Err(SqlGateError::invalid_input(
            "'table' only applies to column and index searches",
        ));
    }

    let connector = source.connector.as_ref();
    let mut matches = Matches::new(limit);
    search(connector, &args, &mut matches)
        .await
        .map_err(|e| e.for_source(&source.config.id))?;

    debug!(
        source = %source.config.id,
        object_type = ?args.object_type,
        count = matches.results.len(),
        "Object search finished"
    );

    Ok(json!({
        "source": source.config.id,
        "object_type": args.object_type,
        "pattern": args.pattern,
        "detail_level": args.detail_level,
        "count": matches.results.len(),
        "truncated": matches.truncated,
        "results": matches.results,
    }))
}

async fn search(connector: &dyn Connector, args: &SearchObjectsArgs, out: &mut Matches) -> Result<()> {
    let schemas = match &args.schema {
        Some(schema) => vec![schema.clone()],
        None => connector.get_schemas().await?,
    };

    for schema in &schemas {
        if out.is_full() {
            break;
        }
        match args.object_type {
            ObjectType::Schema => {
                if !like_match(&args.pattern, schema) {
                    continue;
                }
                let entry = match args.detail_level {
                    DetailLevel::Names => json!({ "name": schema }),
                    DetailLevel::Summary => {
                        let tables = connector.get_tables(Some(schema)).await?;
                        json!({ "name": schema, "table_count": tables.len() })
                    }
                    DetailLevel::Full => {
                        let tables = connector.get_tables(Some(schema)).await?;
                        let procedures = connector.get_stored_procedures(Some(schema)).await?;
                        json!({ "name": schema, "tables": tables, "procedures": procedures })
                    }
                };
                out.push(entry);
            }
            ObjectType::Table => {
                for table in connector.get_tables(Some(schema)).await? {
                    if !like_match(&args.pattern, &table) {
                        continue;
                    }
                    let entry = match args.detail_level {
                        DetailLevel::Names => json!({ "name": table, "schema": schema }),
                        DetailLevel::Summary => {
                            let columns = connector.get_table_schema(&table, Some(schema)).await?;
                            json!({ "name": table, "schema": schema, "column_count": columns.len() })
                        }
                        DetailLevel::Full => {
                            let columns = connector.get_table_schema(&table, Some(schema)).await?;
                            let indexes = connector.get_table_indexes(&table, Some(schema)).await?;
                            json!({ "name": table, "schema": schema, "columns": columns, "indexes": indexes })
                        }
                    };
                    out.push(entry);
                    if out.is_full() {
                        break;
                    }
                }
            }
            ObjectType::Column => {
                for table in tables_in_scope(connector, schema, args.table.as_deref()).await? {
                    for column in connector.get_table_schema(&table, Some(schema)).await? {
                        if !like_match(&args.pattern, &column.name) {
                            continue;
                        }
                        let entry = match args.detail_level {
                            DetailLevel::Names => {
                                json!({ "name": column.name, "schema": schema, "table": table })
                            }
                            DetailLevel::Summary => json!({
                                "name": column.name,
                                "schema": schema,
                                "table": table,
                                "data_type": column.data_type,
                                "nullable": column.nullable,
                            }),
                            DetailLevel::Full => json!({
                                "name": column.name,
                                "schema": schema,
                                "table": table,
                                "data_type": column.data_type,
                                "nullable": column.nullable,
                                "default": column.default,
                            }),
                        };
                        out.push(entry);
                    }
                    if out.is_full() {
                        break;
                    }
                }
            }
            ObjectType::Procedure => {
                for name in connector.get_stored_procedures(Some(schema)).await? {
                    if !like_match(&args.pattern, &name) {
                        continue;
                    }
                    let entry = match args.detail_level {
                        DetailLevel::Names => json!({ "name": name, "schema": schema }),
                        DetailLevel::Summary => {
                            let detail = connector.get_stored_procedure_detail(&name, Some(schema)).await?;
                            json!({
                                "name": name,
                                "schema": schema,
                                "kind": detail.kind,
                                "parameters": detail.parameters,
                                "return_type": detail.return_type,
                            })
                        }
                        DetailLevel::Full => {
                            let detail = connector.get_stored_procedure_detail(&name, Some(schema)).await?;
                            let mut entry = serde_json::to_value(detail).map_err(|e| {
                                SqlGateError::query_failed(format!("Failed to serialize procedure: {e}"))
                            })?;
                            entry["schema"] = json!(schema);
                            entry
                        }
                    };
                    out.push(entry);
                    if out.is_full() {
                        break;
                    }
                }
            }
            ObjectType::Index => {
                for table in tables_in_scope(connector, schema, args.table.as_deref()).await? {
                    for index in connector.get_table_indexes(&table, Some(schema)).await? {
                        if !like_match(&args.pattern, &index.name) {
                            continue;
                        }
                        let entry = match args.detail_level {
                            DetailLevel::Names => {
                                json!({ "name": index.name, "schema": schema, "table": table })
                            }
                            DetailLevel::Summary | DetailLevel::Full => json!({
                                "name": index.name,
                                "schema": schema,
                                "table": table,
                                "columns": index.columns,
                                "is_unique": index.is_unique,
                                "is_primary": index.is_primary,
                            }),
                        };
                        out.push(entry);
                    }
                    if out.is_full() {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn tables_in_scope(
    connector: &dyn Connector,
    schema: &str,
    table: Option<&str>,
) -> Result<Vec<String>> {
    match table {
        Some(table) if connector.table_exists(table, Some(schema)).await? => Ok(vec![table.to_string()]),
        Some(_) => Ok(Vec::new()),
        None => connector.get_tables(Some(schema)).await,
    }
}
