//! Resource Router
//!
//! Maps `db://` addresses to introspection calls on a source's connector.
//! Stateless: each read parses the address, resolves the source and
//! translates the template variables into connector calls.
//!
//! ```text
//! db://schemas
//! db://schemas/{schema}/tables
//! db://schemas/{schema}/tables/{table}
//! db://schemas/{schema}/tables/{table}/indexes
//! db://schemas/{schema}/procedures
//! db://schemas/{schema}/procedures/{procedure}
//! ```

use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, SqlGateError};
use crate::sources::SourceManager;

const SCHEME: &str = "db://";

/// Advertised resource template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceTemplate {
    #[serde(rename = "uriTemplate")]
    pub uri_template: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "mimeType")]
    pub mime_type: &'static str,
}

pub const RESOURCE_TEMPLATES: &[ResourceTemplate] = &[
    ResourceTemplate {
        uri_template: "db://schemas",
        name: "schemas",
        description: "Schemas of the source",
        mime_type: "application/json",
    },
    ResourceTemplate {
        uri_template: "db://schemas/{schema}/tables",
        name: "tables",
        description: "Tables in a schema",
        mime_type: "application/json",
    },
    ResourceTemplate {
        uri_template: "db://schemas/{schema}/tables/{table}",
        name: "table_structure",
        description: "Columns of a table",
        mime_type: "application/json",
    },
    ResourceTemplate {
        uri_template: "db://schemas/{schema}/tables/{table}/indexes",
        name: "indexes",
        description: "Indexes of a table",
        mime_type: "application/json",
    },
    ResourceTemplate {
        uri_template: "db://schemas/{schema}/procedures",
        name: "procedures",
        description: "Stored procedures and functions in a schema",
        mime_type: "application/json",
    },
    ResourceTemplate {
        uri_template: "db://schemas/{schema}/procedures/{procedure}",
        name: "procedure_detail",
        description: "Signature and definition of a stored procedure",
        mime_type: "application/json",
    },
];

/// A parsed resource address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    Schemas,
    Tables { schema: String },
    Table { schema: String, table: String },
    Indexes { schema: String, table: String },
    Procedures { schema: String },
    Procedure { schema: String, procedure: String },
}

impl ResourceAddress {
    /// Parse a `db://` URI; segments are percent-decoded
    ///
    /// # Errors
    /// [`SqlGateError::InvalidInput`] when the URI matches no template.
    pub fn parse(uri: &str) -> Result<Self> {
        let unknown = || SqlGateError::invalid_input(format!("Unknown resource '{uri}'"));

        let path = uri.strip_prefix(SCHEME).ok_or_else(unknown)?;
        let path = path.trim_end_matches('/');
        let segments = path
            .split('/')
            .map(|s| {
                percent_decode_str(s)
                    .decode_utf8()
                    .map(|s| s.into_owned())
                    .map_err(|_| SqlGateError::invalid_input(format!("Resource '{uri}' is not valid UTF-8")))
            })
            .collect::<Result<Vec<String>>>()?;
        if segments.iter().any(String::is_empty) {
            return Err(unknown());
        }

        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        let address = match segments.as_slice() {
            ["schemas"] => Self::Schemas,
            ["schemas", schema, "tables"] => Self::Tables { schema: (*schema).to_string() },
            ["schemas", schema, "tables", table] => {
                Self::Table { schema: (*schema).to_string(), table: (*table).to_string() }
            }
            ["schemas", schema, "tables", table, "indexes"] => {
                Self::Indexes { schema: (*schema).to_string(), table: (*table).to_string() }
            }
            ["schemas", schema, "procedures"] => Self::Procedures { schema: (*schema).to_string() },
            ["schemas", schema, "procedures", procedure] => Self::Procedure {
                schema: (*schema).to_string(),
                procedure: (*procedure).to_string(),
            },
            _ => return Err(unknown()),
        };
        Ok(address)
    }
}

/// Read a resource, scoped to `source` (or the only configured source)
///
/// # Errors
/// Address, source resolution or introspection errors; a missing table is
/// [`SqlGateError::InvalidInput`].
pub async fn read(uri: &str, source: Option<&str>, sources: &SourceManager) -> Result<Value> {
    let address = ResourceAddress::parse(uri)?;
    let resolved = sources.resolve(source)?;
    let source_id = resolved.config.id.as_str();
    let connector = resolved.connector.as_ref();

    debug!(source = %source_id, ?address, "Reading resource");

    let payload = match address {
        ResourceAddress::Schemas => {
            let schemas = connector.get_schemas().await?;
            json!({ "source": source_id, "count": schemas.len(), "schemas": schemas })
        }
        ResourceAddress::Tables { schema } => {
            let tables = connector.get_tables(Some(&schema)).await?;
            json!({ "source": source_id, "schema": schema, "count": tables.len(), "tables": tables })
        }
        ResourceAddress::Table { schema, table } => {
            if !connector.table_exists(&table, Some(&schema)).await? {
                return Err(table_not_found(&schema, &table));
            }
            let columns = connector.get_table_schema(&table, Some(&schema)).await?;
            json!({ "source": source_id, "schema": schema, "table": table, "columns": columns })
        }
        ResourceAddress::Indexes { schema, table } => {
            if !connector.table_exists(&table, Some(&schema)).await? {
                return Err(table_not_found(&schema, &table));
            }
            let indexes = connector.get_table_indexes(&table, Some(&schema)).await?;
            json!({ "source": source_id, "schema": schema, "table": table, "indexes": indexes })
        }
        ResourceAddress::Procedures { schema } => {
            let procedures = connector.get_stored_procedures(Some(&schema)).await?;
            json!({
                "source": source_id,
                "schema": schema,
                "count": procedures.len(),
                "procedures": procedures,
            })
        }
        ResourceAddress::Procedure { schema, procedure } => {
            let detail = connector.get_stored_procedure_detail(&procedure, Some(&schema)).await?;
            json!({ "source": source_id, "schema": schema, "procedure": detail })
        }
    };

    Ok(payload)
}

fn table_not_found(schema: &str, table: &str) -> SqlGateError {
    SqlGateError::invalid_input(format!("Table '{schema}.{table}' does not exist"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_all_templates() {
        assert_eq!(ResourceAddress::parse("db://schemas").unwrap(), ResourceAddress::Schemas);
        assert_eq!(
            ResourceAddress::parse("db://schemas/public/tables").unwrap(),
            ResourceAddress::Tables { schema: "public".into() }
        );
        assert_eq!(
            ResourceAddress::parse("db://schemas/public/tables/users").unwrap(),
            ResourceAddress::Table { schema: "public".into(), table: "users".into() }
        );
        assert_eq!(
            ResourceAddress::parse("db://schemas/public/tables/users/indexes").unwrap(),
            ResourceAddress::Indexes { schema: "public".into(), table: "users".into() }
        );
        assert_eq!(
            ResourceAddress::parse("db://schemas/dbo/procedures").unwrap(),
            ResourceAddress::Procedures { schema: "dbo".into() }
        );
        assert_eq!(
            ResourceAddress::parse("db://schemas/dbo/procedures/usp_report").unwrap(),
            ResourceAddress::Procedure { schema: "dbo".into(), procedure: "usp_report".into() }
        );
        assert_eq!(RESOURCE_TEMPLATES.len(), 6);
    }

    #[test]
    fn test_parse_decodes_segments() {
        assert_eq!(
            ResourceAddress::parse("db://schemas/my%20schema/tables/order%2Fitems").unwrap(),
            ResourceAddress::Table { schema: "my schema".into(), table: "order/items".into() }
        );
        assert_eq!(ResourceAddress::parse("db://schemas/").unwrap(), ResourceAddress::Schemas);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        for uri in [
            "db://",
            "db://tables",
            "db://schemas//tables",
            "db://schemas/public/views",
            "db://schemas/public/tables/users/columns",
            "file:///etc/passwd",
        ] {
            let err = ResourceAddress::parse(uri).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_INPUT", "{uri}");
        }
    }

    #[cfg(feature = "sqlite")]
    mod sqlite {
        use super::*;
        use pretty_assertions::assert_eq;
        use crate::config::SourceConfig;
        use crate::engine::sqlite::SqliteConnector;
        use crate::engine::{ConnectOptions, Connector};
        use crate::sources::ConnectedSource;
        use std::sync::Arc;

        async fn sources() -> SourceManager {
            let connector = SqliteConnector::new();
            let options = ConnectOptions {
                init_script: Some(
                    "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);
                     CREATE INDEX idx_users_email ON users(email);"
                        .to_string(),
                ),
                ..Default::default()
            };
            connector.connect("sqlite::memory:", &options).await.unwrap();
            SourceManager::from_connected(vec![ConnectedSource {
                config: SourceConfig::from_dsn("lite", "sqlite::memory:"),
                connector: Arc::new(connector),
            }])
        }

        #[tokio::test]
        async fn test_read_schemas_and_tables() {
            let sources = sources().await;
            let schemas = read("db://schemas", None, &sources).await.unwrap();
            assert_eq!(schemas["schemas"], json!(["main"]));

            let tables = read("db://schemas/main/tables", Some("lite"), &sources).await.unwrap();
            assert_eq!(tables["tables"], json!(["users"]));
        }

        #[tokio::test]
        async fn test_read_table_columns_and_indexes() {
            let sources = sources().await;
            let table = read("db://schemas/main/tables/users", None, &sources).await.unwrap();
            assert_eq!(table["columns"][1]["name"], "email");
            assert_eq!(table["columns"][1]["nullable"], false);

            let indexes = read("db://schemas/main/tables/users/indexes", None, &sources).await.unwrap();
            let names: Vec<&str> = indexes["indexes"]
                .as_array()
                .unwrap()
                .iter()
                .map(|i| i["name"].as_str().unwrap())
                .collect();
            assert!(names.contains(&"idx_users_email"));
        }

        #[tokio::test]
        async fn test_missing_table_is_invalid_input() {
            let sources = sources().await;
            let err = read("db://schemas/main/tables/ghosts", None, &sources).await.unwrap_err();
            assert_eq!(err.error_code(), "INVALID_INPUT");
        }

        #[tokio::test]
        async fn test_unknown_source() {
            let sources = sources().await;
            let err = read("db://schemas", Some("pg1"), &sources).await.unwrap_err();
            assert_eq!(err.error_code(), "CONNECTOR_NOT_FOUND");
        }

        #[tokio::test]
        async fn test_procedures_empty_on_sqlite() {
            let sources = sources().await;
            let procs = read("db://schemas/main/procedures", None, &sources).await.unwrap();
            assert_eq!(procs["count"], 0);
            let err = read("db://schemas/main/procedures/nope", None, &sources).await.unwrap_err();
            assert_eq!(err.error_code(), "INVALID_INPUT");
        }
    }
}
