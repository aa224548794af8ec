//! End-to-End Integration Tests
//!
//! Drives the full path a request takes: configuration → connector registry →
//! source manager → tool registry / resource router → connector, against
//! temp-file and in-memory `SQLite` databases. Covers:
//! - DSN dispatch for every configured source
//! - Default tool backfill and the deduplication of `get_all_tools`
//! - The safety gate on read-only and writable sources
//! - Resource reads through the same connectors

#![cfg(feature = "sqlite")]

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::path::PathBuf;

use sqlgate::tools::{call_tool, EXECUTE_SQL, SEARCH_OBJECTS};
use sqlgate::{resources, ConnectorRegistry, SourceManager, TomlConfig, ToolRegistry};

// ============================================================================
// Test Helpers
// ============================================================================

/// Create a `SQLite` file with sample data, unique per call
fn create_test_db() -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_file =
        std::env::temp_dir().join(format!("sqlgate_integration_{}_{id}.db", std::process::id()));
    let _ = std::fs::remove_file(&temp_file);

    let conn = rusqlite::Connection::open(&temp_file).expect("Failed to create temp database");
    conn.execute_batch(
        "CREATE TABLE users (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             email TEXT
         );
         CREATE UNIQUE INDEX idx_users_email ON users(email);
         INSERT INTO users (name, email) VALUES
             ('Alice', 'alice@example.com'),
             ('Bob', 'bob@example.com'),
             ('Carol', 'carol@example.com');",
    )
    .expect("Failed to seed database");

    temp_file
}

async fn start(toml: &str) -> (ToolRegistry, SourceManager) {
    let config = TomlConfig::from_toml_str(toml).expect("valid config");
    let registry = ConnectorRegistry::with_default_connectors().expect("default connectors");
    let sources = SourceManager::connect_all(&config, &registry).await.expect("sources connect");
    (ToolRegistry::new(&config), sources)
}

fn two_sources(readonly_b: bool) -> (String, PathBuf, PathBuf) {
    let a = create_test_db();
    let b = create_test_db();
    let toml = format!(
        r#"
[[sources]]
id = "reporting"
dsn = "sqlite://{}"

[[sources]]
id = "scratch"
dsn = "sqlite://{}"
readonly = {readonly_b}
"#,
        a.display(),
        b.display()
    );
    (toml, a, b)
}

// ============================================================================
// Dispatch and Registry
// ============================================================================

#[tokio::test]
async fn test_sources_dispatch_to_sqlite_connector() {
    let (toml, a, b) = two_sources(false);
    let (_, sources) = start(&toml).await;

    for id in ["reporting", "scratch"] {
        let connector = sources.connector_for(Some(id)).unwrap();
        assert_eq!(connector.id(), "sqlite");
        assert!(connector.is_connected());
    }

    sources.disconnect_all().await;
    let _ = std::fs::remove_file(a);
    let _ = std::fs::remove_file(b);
}

#[tokio::test]
async fn test_defaults_backfilled_for_every_source() {
    let (toml, a, b) = two_sources(false);
    let (tools, sources) = start(&toml).await;

    for id in ["reporting", "scratch"] {
        let names: Vec<&str> = tools.get_tools_for_source(id).iter().map(|t| t.name()).collect();
        assert_eq!(names, vec![EXECUTE_SQL, SEARCH_OBJECTS]);
    }

    // Both sources enable the same two names: the flattened view collapses them
    assert_eq!(tools.get_all_tools().len(), 2);

    sources.disconnect_all().await;
    let _ = std::fs::remove_file(a);
    let _ = std::fs::remove_file(b);
}

// ============================================================================
// Safety Gate
// ============================================================================

#[tokio::test]
async fn test_drop_rejected_on_readonly_source_and_allowed_on_writable() {
    let (toml, a, b) = two_sources(false);
    let (tools, sources) = start(&toml).await;

    // `reporting` leaves readonly unset
    let err = call_tool(
        &tools,
        &sources,
        EXECUTE_SQL,
        json!({ "source": "reporting", "sql": "DROP TABLE users" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_REJECTED");
    assert!(sources.connector_for(Some("reporting")).unwrap().table_exists("users", None).await.unwrap());

    // `scratch` sets readonly = false
    call_tool(&tools, &sources, EXECUTE_SQL, json!({ "source": "scratch", "sql": "DROP TABLE users" }))
        .await
        .unwrap();
    assert!(!sources.connector_for(Some("scratch")).unwrap().table_exists("users", None).await.unwrap());

    sources.disconnect_all().await;
    let _ = std::fs::remove_file(a);
    let _ = std::fs::remove_file(b);
}

#[tokio::test]
async fn test_quoted_identifier_cannot_hide_a_drop() {
    let (toml, a, b) = two_sources(true);
    let (tools, sources) = start(&toml).await;

    for sql in [
        "SELECT 1 AS [a'b]; DROP TABLE users; --'; SELECT 1",
        "SELECT 1 AS `a'b`; DROP TABLE users; --'; SELECT 1",
        "SELECT 1 /* '; */ ; DROP TABLE users; -- '",
    ] {
        let err = call_tool(&tools, &sources, EXECUTE_SQL, json!({ "source": "reporting", "sql": sql }))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_REJECTED", "{sql}");
    }
    assert!(sources.connector_for(Some("reporting")).unwrap().table_exists("users", None).await.unwrap());

    sources.disconnect_all().await;
    let _ = std::fs::remove_file(a);
    let _ = std::fs::remove_file(b);
}

#[tokio::test]
async fn test_request_timeout_bounds_execute_sql() {
    let (tools, sources) =
        start("[[sources]]\nid = \"mem\"\ndsn = \"sqlite::memory:\"\nrequest_timeout = 1\n").await;

    let start = std::time::Instant::now();
    let err = call_tool(
        &tools,
        &sources,
        EXECUTE_SQL,
        json!({ "sql": "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 100000000) \
                        SELECT COUNT(*) FROM n" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.error_code(), "QUERY_FAILED");
    assert!(err.message().contains("1000ms timeout"), "{}", err.message());
    assert!(start.elapsed() < std::time::Duration::from_secs(10));
}

#[tokio::test]
async fn test_source_is_required_when_ambiguous() {
    let (toml, a, b) = two_sources(true);
    let (tools, sources) = start(&toml).await;

    let err = call_tool(&tools, &sources, EXECUTE_SQL, json!({ "sql": "SELECT 1" })).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");
    assert!(err.message().contains("reporting"));

    sources.disconnect_all().await;
    let _ = std::fs::remove_file(a);
    let _ = std::fs::remove_file(b);
}

#[tokio::test]
async fn test_max_rows_caps_results() {
    let (tools, sources) = start(
        "[[sources]]\nid = \"mem\"\ndsn = \"sqlite::memory:\"\nmax_rows = 2\n\
         init_script = \"CREATE TABLE n (v INTEGER); INSERT INTO n VALUES (1), (2), (3), (4);\"\n",
    )
    .await;

    let result = call_tool(&tools, &sources, EXECUTE_SQL, json!({ "sql": "SELECT v FROM n ORDER BY v" }))
        .await
        .unwrap();
    assert_eq!(result["rows"], json!([[1], [2]]));
    assert_eq!(result["truncated"], true);
}

#[tokio::test]
async fn test_tool_not_enabled_for_source() {
    let db = create_test_db();
    let toml = format!(
        r#"
[[sources]]
id = "locked"
dsn = "sqlite://{}"

[[tools]]
name = "search_objects"
source = "locked"
"#,
        db.display()
    );
    let (tools, sources) = start(&toml).await;

    let err = call_tool(&tools, &sources, EXECUTE_SQL, json!({ "sql": "SELECT 1" })).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");

    let found = call_tool(
        &tools,
        &sources,
        SEARCH_OBJECTS,
        json!({ "object_type": "column", "pattern": "%mail%" }),
    )
    .await
    .unwrap();
    assert_eq!(found["count"], 1);
    assert_eq!(found["results"][0]["table"], "users");

    sources.disconnect_all().await;
    let _ = std::fs::remove_file(db);
}

#[tokio::test]
async fn test_custom_tool_runs_fixed_statement() {
    let db = create_test_db();
    let toml = format!(
        r#"
[[sources]]
id = "crm"
dsn = "sqlite://{}"

[[tools]]
name = "count_users"
source = "crm"
description = "Number of users"
statement = "SELECT COUNT(*) AS n FROM users"
"#,
        db.display()
    );
    let (tools, sources) = start(&toml).await;

    let result = call_tool(&tools, &sources, "count_users", Value::Null).await.unwrap();
    assert_eq!(result["result"]["rows"], json!([[3]]));

    sources.disconnect_all().await;
    let _ = std::fs::remove_file(db);
}

// ============================================================================
// Resources
// ============================================================================

#[tokio::test]
async fn test_resource_reads_follow_hierarchy() {
    let db = create_test_db();
    let (_, sources) = start(&format!("[[sources]]\nid = \"crm\"\ndsn = \"sqlite://{}\"\n", db.display())).await;

    let schemas = resources::read("db://schemas", None, &sources).await.unwrap();
    let schema = schemas["schemas"][0].as_str().unwrap().to_string();

    let tables = resources::read(&format!("db://schemas/{schema}/tables"), None, &sources).await.unwrap();
    assert_eq!(tables["tables"], json!(["users"]));

    let table = resources::read(&format!("db://schemas/{schema}/tables/users"), Some("crm"), &sources)
        .await
        .unwrap();
    let columns: Vec<&str> =
        table["columns"].as_array().unwrap().iter().map(|c| c["name"].as_str().unwrap()).collect();
    assert_eq!(columns, vec!["id", "name", "email"]);

    let indexes = resources::read(&format!("db://schemas/{schema}/tables/users/indexes"), None, &sources)
        .await
        .unwrap();
    assert!(indexes["indexes"]
        .as_array()
        .unwrap()
        .iter()
        .any(|i| i["name"] == "idx_users_email" && i["is_unique"] == true));

    sources.disconnect_all().await;
    let _ = std::fs::remove_file(db);
}
