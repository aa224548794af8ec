//! Edge Case Testing
//!
//! Boundary conditions of DSN dispatch, configuration and the tool registry:
//! - Strings no parser accepts
//! - In-memory and path-shaped `SQLite` DSNs
//! - Registry access before initialization
//! - Empty versus missing `tools`
//! - Statements hidden in comments, literals and multi-statement scripts

use pretty_assertions::assert_eq;

use sqlgate::tools::{EXECUTE_SQL, SEARCH_OBJECTS};
use sqlgate::{
    validate_query, ConnectorRegistry, DatabaseType, ExecuteOptions, TomlConfig, ToolRegistry,
    ToolRegistryHandle,
};

// ============================================================================
// DSN Dispatch
// ============================================================================

#[test]
fn test_not_a_dsn_is_rejected_by_every_parser() {
    let registry = ConnectorRegistry::with_default_connectors().unwrap();
    for id in registry.get_available_connectors() {
        let connector = registry.get_connector(id).unwrap();
        assert!(!connector.dsn_parser().is_valid_dsn("not-a-dsn"), "{id} accepted not-a-dsn");
        assert_eq!(connector.dsn_parser().parse("not-a-dsn").unwrap_err().error_code(), "DSN_FORMAT");
    }
    assert!(registry.get_connector_for_dsn("not-a-dsn").is_none());
}

#[test]
fn test_every_sample_dsn_round_trips() {
    let registry = ConnectorRegistry::with_default_connectors().unwrap();
    for sample in registry.get_all_sample_dsns() {
        assert_eq!(registry.get_connector_for_dsn(sample.dsn).unwrap().id(), sample.id);
    }
}

#[test]
fn test_near_miss_dsns_match_nothing() {
    let registry = ConnectorRegistry::with_default_connectors().unwrap();
    for dsn in ["", "   ", "postgres:/missing-slash", "mysql//root@localhost", "oracle://scott@db/orcl"] {
        assert!(registry.get_connector_for_dsn(dsn).is_none(), "{dsn:?} matched a connector");
    }
}

#[cfg(feature = "sqlite")]
#[test]
fn test_sqlite_memory_dsn_accepted() {
    let registry = ConnectorRegistry::with_default_connectors().unwrap();
    let connector = registry.get_connector_for_dsn("sqlite::memory:").unwrap();
    assert_eq!(connector.id(), "sqlite");
    assert!(connector.dsn_parser().parse("sqlite::memory:").unwrap().is_in_memory());
}

#[cfg(feature = "postgres")]
#[test]
fn test_pg1_dsn_resolves_to_postgres() {
    let registry = ConnectorRegistry::with_default_connectors().unwrap();
    let dsn = "postgres://u:p@h:5432/db?sslmode=disable";
    let connector = registry.get_connector_for_dsn(dsn).unwrap();
    assert_eq!(connector.id(), "postgres");

    let config = connector.dsn_parser().parse(dsn).unwrap();
    assert_eq!(config.host.as_deref(), Some("h"));
    assert_eq!(config.port, Some(5432));
    assert_eq!(config.database.as_deref(), Some("db"));
}

// ============================================================================
// Tool Registry
// ============================================================================

const PG1: &str = r#"
[[sources]]
id = "pg1"
dsn = "postgres://u:p@h:5432/db?sslmode=disable"
"#;

#[test]
fn test_pg1_gets_default_tools() {
    let config = TomlConfig::from_toml_str(PG1).unwrap();
    let registry = ToolRegistry::new(&config);

    let tools = registry.get_tools_for_source("pg1");
    let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
    assert_eq!(names, vec![EXECUTE_SQL, SEARCH_OBJECTS]);
    assert!(tools.iter().all(|t| t.source() == "pg1"));
    assert!(registry.get_builtin_tool_config(EXECUTE_SQL, "pg1").is_some());
    assert!(registry.get_builtin_tool_config(EXECUTE_SQL, "pg2").is_none());
}

#[test]
fn test_empty_and_missing_tools_agree() {
    let missing = ToolRegistry::new(&TomlConfig::from_toml_str(PG1).unwrap());
    let empty = ToolRegistry::new(&TomlConfig::from_toml_str(&format!("tools = []\n{PG1}")).unwrap());
    assert_eq!(missing.get_tools_for_source("pg1"), empty.get_tools_for_source("pg1"));
}

#[test]
fn test_registry_handle_fails_before_initialize() {
    let handle = ToolRegistryHandle::new();
    let err = handle.get().unwrap_err();
    assert_eq!(err.error_code(), "REGISTRY_NOT_INITIALIZED");
}

#[test]
fn test_tool_for_unknown_source_rejected_at_load() {
    let err = TomlConfig::from_toml_str(&format!("{PG1}\n[[tools]]\nname = \"execute_sql\"\nsource = \"pg2\"\n"))
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFIG_ERROR");
}

#[test]
fn test_duplicate_builtin_for_source_rejected_at_load() {
    let err = TomlConfig::from_toml_str(&format!(
        "{PG1}\n[[tools]]\nname = \"execute_sql\"\nsource = \"pg1\"\n[[tools]]\nname = \"execute_sql\"\nsource = \"pg1\"\n"
    ))
    .unwrap_err();
    assert_eq!(err.error_code(), "CONFIG_ERROR");
}

#[test]
fn test_zero_max_rows_rejected() {
    let err = TomlConfig::from_toml_str(&format!("{PG1}max_rows = 0\n")).unwrap_err();
    assert_eq!(err.error_code(), "CONFIG_ERROR");
}

// ============================================================================
// Safety Gate
// ============================================================================

#[test]
fn test_drop_verdict_depends_only_on_explicit_false() {
    for readonly in [None, Some(true)] {
        let options = ExecuteOptions { readonly, ..Default::default() };
        assert!(!validate_query("DROP TABLE t", DatabaseType::Postgres, &options).is_valid);
    }
    assert!(validate_query("DROP TABLE t", DatabaseType::Postgres, &ExecuteOptions::writable()).is_valid);
}

#[test]
fn test_mutation_after_read_in_script() {
    let result = validate_query(
        "SELECT * FROM users; /* then */ truncate users",
        DatabaseType::MySQL,
        &ExecuteOptions::read_only(),
    );
    assert!(!result.is_valid);
    assert!(result.message.unwrap().contains("TRUNCATE"));
}

#[test]
fn test_verbs_in_identifiers_are_reads() {
    for sql in [
        "SELECT updated_at, created_by FROM audit",
        "SELECT * FROM `delete_queue`",
        "SELECT '; DROP TABLE x; --' AS payload",
    ] {
        assert!(validate_query(sql, DatabaseType::MySQL, &ExecuteOptions::read_only()).is_valid, "{sql}");
    }
}

#[test]
fn test_quote_characters_inside_identifiers_and_escapes() {
    let cases = [
        (DatabaseType::SQLite, "SELECT 1 AS [a'b]; DROP TABLE users; --'; SELECT 1"),
        (DatabaseType::SqlServer, "SELECT 1 AS [a'b]; DROP TABLE users; --'; SELECT 1"),
        (DatabaseType::MySQL, "SELECT '\\''; DROP TABLE users; -- '"),
        (DatabaseType::MariaDB, "SELECT '\\''; DROP TABLE users; -- '"),
        (DatabaseType::Postgres, "SELECT E'\\''; DROP TABLE users; --'; SELECT 1"),
        (DatabaseType::MySQL, "SELECT 1 # '\n; DROP TABLE users; -- '"),
    ];
    for (engine, sql) in cases {
        let result = validate_query(sql, engine, &ExecuteOptions::read_only());
        assert!(!result.is_valid, "{engine}: {sql}");
        assert!(result.message.unwrap().contains("DROP"), "{engine}: {sql}");
    }
}

#[test]
fn test_quote_characters_in_reads_stay_valid() {
    let cases = [
        (DatabaseType::SQLite, "SELECT [it's] FROM [t]"),
        (DatabaseType::SqlServer, "SELECT [a]]b] FROM dbo.[drop]"),
        (DatabaseType::MySQL, "SELECT 'it\\'s; fine' AS s # delete"),
        (DatabaseType::Postgres, "SELECT E'it\\'s; fine' AS s"),
    ];
    for (engine, sql) in cases {
        assert!(validate_query(sql, engine, &ExecuteOptions::read_only()).is_valid, "{engine}: {sql}");
    }
}

#[test]
fn test_unicode_text_in_query() {
    let sql = "SELECT '日本語 🚀' AS greeting, 'Ünïcödé' AS name";
    assert!(validate_query(sql, DatabaseType::SQLite, &ExecuteOptions::read_only()).is_valid);
}
