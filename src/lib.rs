//! sqlgate - Uniform Database Access for Agents
//!
//! sqlgate exposes Postgres, MySQL/MariaDB, SQL Server and SQLite sources
//! behind one connector contract, and serves them to agents as MCP tools and
//! resources.
//!
//! # Architecture
//! A DSN is dispatched to a connector purely by its shape. Each configured
//! source gets its own connected connector; tools and resources address a
//! source by id. Every execution path runs the safety gate first.
//!
//! # Module Organization
//! - [`error`] - Error types and handling
//! - [`dsn`] - DSN parsing contract and URL helpers
//! - [`engine`] - Connector contract, core types, backends and the connector registry
//! - [`capability`] - Query safety gate
//! - [`config`] - `sqlgate.toml` loading and validation
//! - [`tools`] - Tool registry and built-in tools
//! - [`sources`] - Live connectors per configured source
//! - [`resources`] - `db://` resource router
//! - [`output`] - JSON output envelopes
//! - [`mcp`] - MCP server (JSON-RPC 2.0 over stdio)

pub mod capability;
pub mod config;
pub mod dsn;
pub mod engine;
pub mod error;
pub mod mcp;
pub mod output;
pub mod resources;
pub mod sources;
pub mod tools;

pub use capability::{split_statements, validate_query, Validation};
pub use config::{discover, ConfigOrigin, SourceConfig, SshConfig, TomlConfig};
pub use dsn::DsnParser;
pub use engine::registry::{ConnectorRegistry, SampleDsn};
pub use engine::{
    ConnectOptions, ConnectionConfig, Connector, DatabaseType, ExecuteOptions, ProcedureKind,
    QueryResult, StoredProcedure, TableColumn, TableIndex,
};
pub use error::{redact_dsn, Result, SqlGateError};
pub use mcp::McpServer;
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use resources::{ResourceAddress, RESOURCE_TEMPLATES};
pub use sources::{ConnectedSource, SourceManager};
pub use tools::{ToolConfig, ToolRegistry, ToolRegistryHandle};
