//! Tool Registry
//!
//! Derives, per configured source, the effective set of tools. Built once
//! from a validated [`TomlConfig`]:
//!
//! 1. Group the declared `[[tools]]` entries by source.
//! 2. Every source that received no entry gets the built-in defaults
//!    (`execute_sql`, `search_objects`) scoped to it. An empty `tools = []`
//!    declares nothing, so it backfills exactly like a missing key.
//! 3. Freeze the per-source lists.
//!
//! The registry is reached through a [`ToolRegistryHandle`]; reading it before
//! [`ToolRegistryHandle::initialize`] fails with
//! [`SqlGateError::RegistryNotInitialized`].

pub mod custom;
pub mod execute_sql;
pub mod search_objects;

use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::TomlConfig;
use crate::error::{Result, SqlGateError};
use crate::sources::{ConnectedSource, SourceManager};

pub const EXECUTE_SQL: &str = "execute_sql";
pub const SEARCH_OBJECTS: &str = "search_objects";

/// Built-in tool names, in advertised order
pub const BUILTIN_TOOLS: &[&str] = &[EXECUTE_SQL, SEARCH_OBJECTS];

/// `[[tools]]` entry as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub name: String,
    pub source: String,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

/// Tool configuration, discriminated by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ToolEntry", into = "ToolEntry")]
pub enum ToolConfig {
    ExecuteSql(ExecuteSqlConfig),
    SearchObjects(SearchObjectsConfig),
    Custom(CustomToolConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteSqlConfig {
    #[serde(skip)]
    pub source: String,
    /// Overrides the source's `readonly`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    /// Overrides the source's `max_rows`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchObjectsConfig {
    #[serde(skip)]
    pub source: String,
}

/// Custom tool with an opaque payload
#[derive(Debug, Clone, PartialEq)]
pub struct CustomToolConfig {
    pub name: String,
    pub source: String,
    pub description: Option<String>,
    pub payload: Map<String, Value>,
}

impl ToolConfig {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ExecuteSql(_) => EXECUTE_SQL,
            Self::SearchObjects(_) => SEARCH_OBJECTS,
            Self::Custom(custom) => &custom.name,
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::ExecuteSql(c) => &c.source,
            Self::SearchObjects(c) => &c.source,
            Self::Custom(c) => &c.source,
        }
    }

    #[must_use]
    pub fn is_builtin(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// The built-in default set for `source`
    #[must_use]
    pub fn defaults_for(source: &str) -> Vec<Self> {
        vec![
            Self::ExecuteSql(ExecuteSqlConfig { source: source.to_string(), ..Default::default() }),
            Self::SearchObjects(SearchObjectsConfig { source: source.to_string() }),
        ]
    }
}

fn settings_error(entry: &ToolEntry, e: &serde_json::Error) -> SqlGateError {
    SqlGateError::config_error(format!(
        "Tool '{}' for source '{}': {e}",
        entry.name, entry.source
    ))
}

impl TryFrom<ToolEntry> for ToolConfig {
    type Error = SqlGateError;

    fn try_from(entry: ToolEntry) -> Result<Self> {
        if entry.source.trim().is_empty() {
            return Err(SqlGateError::config_error(format!(
                "Tool '{}' must name a source",
                entry.name
            )));
        }

        match entry.name.as_str() {
            EXECUTE_SQL => {
                let mut config: ExecuteSqlConfig =
                    serde_json::from_value(Value::Object(entry.settings.clone()))
                        .map_err(|e| settings_error(&entry, &e))?;
                if config.max_rows == Some(0) {
                    return Err(SqlGateError::config_error(format!(
                        "Tool 'execute_sql' for source '{}': max_rows must be greater than 0",
                        entry.source
                    )));
                }
                config.source = entry.source;
                Ok(Self::ExecuteSql(config))
            }
            SEARCH_OBJECTS => {
                let mut config: SearchObjectsConfig =
                    serde_json::from_value(Value::Object(entry.settings.clone()))
                        .map_err(|e| settings_error(&entry, &e))?;
                config.source = entry.source;
                Ok(Self::SearchObjects(config))
            }
            name => {
                let valid = !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
                if !valid {
                    return Err(SqlGateError::config_error(format!(
                        "Invalid tool name '{name}': use letters, digits, '_' or '-'"
                    )));
                }

                let mut payload = entry.settings;
                let description = match payload.remove("description") {
                    Some(Value::String(text)) => Some(text),
                    Some(_) => {
                        return Err(SqlGateError::config_error(format!(
                            "Tool '{name}': description must be a string"
                        )))
                    }
                    None => None,
                };
                if payload.get("statement").is_some_and(|s| !s.is_string()) {
                    return Err(SqlGateError::config_error(format!(
                        "Tool '{name}': statement must be a string"
                    )));
                }

                Ok(Self::Custom(CustomToolConfig {
                    name: name.to_string(),
                    source: entry.source,
                    description,
                    payload,
                }))
            }
        }
    }
}

impl From<ToolConfig> for ToolEntry {
    fn from(config: ToolConfig) -> Self {
        let object = |value: serde_json::Result<Value>| match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        match config {
            ToolConfig::ExecuteSql(c) => Self {
                name: EXECUTE_SQL.to_string(),
                settings: object(serde_json::to_value(&c)),
                source: c.source,
            },
            ToolConfig::SearchObjects(c) => Self {
                name: SEARCH_OBJECTS.to_string(),
                settings: Map::new(),
                source: c.source,
            },
            ToolConfig::Custom(c) => {
                let mut settings = c.payload;
                if let Some(description) = c.description {
                    settings.insert("description".to_string(), Value::String(description));
                }
                Self { name: c.name, source: c.source, settings }
            }
        }
    }
}

/// Effective tools per source, frozen after construction
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `(source id, tools)` in configuration order
    by_source: Vec<(String, Vec<ToolConfig>)>,
}

impl ToolRegistry {
    /// Build from a validated configuration
    #[must_use]
    pub fn new(config: &TomlConfig) -> Self {
        let declared = config.tools.as_deref().unwrap_or_default();

        let by_source = config
            .sources
            .iter()
            .map(|source| {
                let explicit: Vec<ToolConfig> =
                    declared.iter().filter(|t| t.source() == source.id).cloned().collect();
                let tools = if explicit.is_empty() {
                    debug!(source = %source.id, "No tools declared, enabling defaults");
                    ToolConfig::defaults_for(&source.id)
                } else {
                    explicit
                };
                (source.id.clone(), tools)
            })
            .collect();

        Self { by_source }
    }

    /// Tools enabled for `source_id`; empty for an unknown id
    #[must_use]
    pub fn get_tools_for_source(&self, source_id: &str) -> &[ToolConfig] {
        self.by_source
            .iter()
            .find(|(id, _)| id == source_id)
            .map_or(&[], |(_, tools)| tools.as_slice())
    }

    /// Config of a built-in tool, if enabled for that source
    #[must_use]
    pub fn get_builtin_tool_config(&self, name: &str, source_id: &str) -> Option<&ToolConfig> {
        if !BUILTIN_TOOLS.contains(&name) {
            return None;
        }
        self.get_tool_config(name, source_id)
    }

    /// Config of any tool, if enabled for that source
    #[must_use]
    pub fn get_tool_config(&self, name: &str, source_id: &str) -> Option<&ToolConfig> {
        self.get_tools_for_source(source_id).iter().find(|t| t.name() == name)
    }

    /// Every enabled tool, deduplicated by name (first occurrence wins)
    #[must_use]
    pub fn get_all_tools(&self) -> Vec<&ToolConfig> {
        let mut seen = HashSet::new();
        self.by_source
            .iter()
            .flat_map(|(_, tools)| tools)
            .filter(|tool| seen.insert(tool.name()))
            .collect()
    }

    #[must_use]
    pub fn get_custom_tools(&self) -> Vec<&ToolConfig> {
        self.get_all_tools().into_iter().filter(|t| !t.is_builtin()).collect()
    }

    /// Built-in names enabled by any source
    #[must_use]
    pub fn get_enabled_builtin_tool_names(&self) -> Vec<&'static str> {
        BUILTIN_TOOLS
            .iter()
            .copied()
            .filter(|name| {
                self.by_source.iter().any(|(_, tools)| tools.iter().any(|t| t.name() == *name))
            })
            .collect()
    }

    /// Sources that enable a tool called `name`
    #[must_use]
    pub fn sources_for_tool(&self, name: &str) -> Vec<&str> {
        self.by_source
            .iter()
            .filter(|(_, tools)| tools.iter().any(|t| t.name() == name))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Shared, explicitly initialized access to the [`ToolRegistry`]
#[derive(Debug, Clone, Default)]
pub struct ToolRegistryHandle {
    inner: Arc<RwLock<Option<Arc<ToolRegistry>>>>,
}

impl ToolRegistryHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a registry (replacing any previous one on reload)
    pub fn initialize(&self, registry: ToolRegistry) {
        *self.inner.write() = Some(Arc::new(registry));
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.read().is_some()
    }

    /// # Errors
    /// [`SqlGateError::RegistryNotInitialized`] before [`Self::initialize`].
    pub fn get(&self) -> Result<Arc<ToolRegistry>> {
        self.inner.read().clone().ok_or(SqlGateError::RegistryNotInitialized)
    }
}

/// Tool listing entry (`tools/list`)
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Arguments accepted by custom tools
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct SourceArgs {
    /// Source id; optional when exactly one source is configured
    #[serde(default)]
    pub source: Option<String>,
}

pub(crate) fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// Definitions of every advertised tool
#[must_use]
pub fn tool_definitions(registry: &ToolRegistry) -> Vec<ToolDefinition> {
    registry
        .get_all_tools()
        .into_iter()
        .map(|tool| {
            let sources = registry.sources_for_tool(tool.name()).join(", ");
            match tool {
                ToolConfig::ExecuteSql(_) => ToolDefinition {
                    name: EXECUTE_SQL.to_string(),
                    description: format!(
                        "Execute SQL against a configured source (sources: {sources}). \
                         Mutating statements are rejected unless the source is configured with readonly = false."
                    ),
                    input_schema: schema_of::<execute_sql::ExecuteSqlArgs>(),
                },
                ToolConfig::SearchObjects(_) => ToolDefinition {
                    name: SEARCH_OBJECTS.to_string(),
                    description: format!(
                        "Search schemas, tables, columns, procedures and indexes with SQL LIKE patterns (sources: {sources})"
                    ),
                    input_schema: schema_of::<search_objects::SearchObjectsArgs>(),
                },
                ToolConfig::Custom(custom) => ToolDefinition {
                    name: custom.name.clone(),
                    description: custom
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("Custom tool '{}' (sources: {sources})", custom.name)),
                    input_schema: schema_of::<SourceArgs>(),
                },
            }
        })
        .collect()
}

/// Source a tool call targets
///
/// An explicit `source` argument wins. Otherwise the tool's only enabling
/// source is used, falling back to the single configured source.
///
/// # Errors
/// [`SqlGateError::InvalidInput`] for a non-string `source` or an ambiguous
/// call; [`SqlGateError::ConnectorNotFound`] for an unknown source id.
pub fn target_source<'a>(
    registry: &ToolRegistry,
    sources: &'a SourceManager,
    name: &str,
    arguments: &Value,
) -> Result<&'a ConnectedSource> {
    let requested = match arguments.get("source") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.as_str()),
        Some(_) => return Err(SqlGateError::invalid_input("'source' must be a string")),
    };

    match (requested, registry.sources_for_tool(name).as_slice()) {
        (None, [only]) => sources.resolve(Some(*only)),
        _ => sources.resolve(requested),
    }
}

/// Invoke a tool by name
///
/// The target source is chosen by [`target_source`]. The tool must be
/// enabled for it.
///
/// # Errors
/// [`SqlGateError::InvalidInput`] for unknown tools, bad arguments or a tool
/// not enabled for the source; otherwise whatever the tool itself returns.
#[instrument(skip(registry, sources, arguments))]
pub async fn call_tool(
    registry: &ToolRegistry,
    sources: &SourceManager,
    name: &str,
    arguments: Value,
) -> Result<Value> {
    let source = target_source(registry, sources, name, &arguments)?;

    let tool = registry.get_tool_config(name, &source.config.id).ok_or_else(|| {
        let enabled = registry.sources_for_tool(name);
        if enabled.is_empty() {
            SqlGateError::invalid_input(format!("Unknown tool '{name}'"))
        } else {
            SqlGateError::invalid_input(format!(
                "Tool '{name}' is not enabled for source '{}' (enabled for: {})",
                source.config.id,
                enabled.join(", ")
            ))
        }
    })?;

    match tool {
        ToolConfig::ExecuteSql(config) => {
            let args = parse_args(arguments)?;
            execute_sql::run(config, source, args).await
        }
        ToolConfig::SearchObjects(_) => {
            let args = parse_args(arguments)?;
            search_objects::run(source, args).await
        }
        ToolConfig::Custom(config) => custom::run(config, source).await,
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T> {
    let arguments = if arguments.is_null() { Value::Object(Map::new()) } else { arguments };
    serde_json::from_value(arguments)
        .map_err(|e| SqlGateError::invalid_input(format!("Invalid arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(toml: &str) -> TomlConfig {
        TomlConfig::from_toml_str(toml).unwrap()
    }

    fn names(tools: &[ToolConfig]) -> Vec<&str> {
        tools.iter().map(ToolConfig::name).collect()
    }

    #[test]
    fn test_missing_tools_key_backfills_defaults() {
        let registry = ToolRegistry::new(&config("[[sources]]\nid = \"pg1\"\ndsn = \"sqlite::memory:\"\n"));
        assert_eq!(names(registry.get_tools_for_source("pg1")), vec![EXECUTE_SQL, SEARCH_OBJECTS]);
        assert!(registry.get_tools_for_source("pg1").iter().all(|t| t.source() == "pg1"));
        assert_eq!(registry.get_enabled_builtin_tool_names(), vec!["execute_sql", "search_objects"]);
    }

    #[test]
    fn test_empty_tools_array_backfills_defaults() {
        let registry = ToolRegistry::new(&config(
            "tools = []\n[[sources]]\nid = \"pg1\"\ndsn = \"sqlite::memory:\"\n",
        ));
        assert_eq!(names(registry.get_tools_for_source("pg1")), vec![EXECUTE_SQL, SEARCH_OBJECTS]);
    }

    #[test]
    fn test_explicit_tools_replace_defaults_per_source() {
        let registry = ToolRegistry::new(&config(
            r#"
[[sources]]
id = "a"
dsn = "sqlite::memory:"

[[sources]]
id = "b"
dsn = "sqlite::memory:"

[[tools]]
name = "execute_sql"
source = "a"
readonly = false
max_rows = 10
"#,
        ));

        assert_eq!(names(registry.get_tools_for_source("a")), vec![EXECUTE_SQL]);
        assert_eq!(names(registry.get_tools_for_source("b")), vec![EXECUTE_SQL, SEARCH_OBJECTS]);
        assert!(registry.get_builtin_tool_config(SEARCH_OBJECTS, "a").is_none());

        let Some(ToolConfig::ExecuteSql(exec)) = registry.get_builtin_tool_config(EXECUTE_SQL, "a")
        else {
            panic!("execute_sql not enabled for a");
        };
        assert_eq!(exec.readonly, Some(false));
        assert_eq!(exec.max_rows, Some(10));
    }

    #[test]
    fn test_unknown_source_is_empty() {
        let registry = ToolRegistry::new(&config("[[sources]]\nid = \"pg1\"\ndsn = \"sqlite::memory:\"\n"));
        assert!(registry.get_tools_for_source("nope").is_empty());
        assert!(registry.get_builtin_tool_config(EXECUTE_SQL, "nope").is_none());
        assert!(registry.get_builtin_tool_config("report", "pg1").is_none());
    }

    #[test]
    fn test_get_all_tools_dedup_law() {
        let registry = ToolRegistry::new(&config(
            r#"
[[sources]]
id = "a"
dsn = "sqlite::memory:"

[[sources]]
id = "b"
dsn = "sqlite::memory:"

[[tools]]
name = "report"
source = "a"
statement = "SELECT 1"

[[tools]]
name = "report"
source = "b"
statement = "SELECT 2"

[[tools]]
name = "execute_sql"
source = "b"
"#,
        ));

        let per_source: usize =
            ["a", "b"].iter().map(|id| registry.get_tools_for_source(id).len()).sum();
        let all = registry.get_all_tools();
        assert_eq!(per_source, 3);
        assert_eq!(all.len(), 2);
        assert!(all.len() < per_source);

        // First occurrence wins
        let ToolConfig::Custom(report) = all[0] else { panic!("expected custom tool") };
        assert_eq!(report.source, "a");

        assert_eq!(names(&registry.get_custom_tools().into_iter().cloned().collect::<Vec<_>>()), vec!["report"]);
        assert_eq!(registry.get_enabled_builtin_tool_names(), vec!["execute_sql"]);
    }

    #[test]
    fn test_get_all_tools_distinct_names_is_sum() {
        let registry = ToolRegistry::new(&config(
            "[[sources]]\nid = \"a\"\ndsn = \"sqlite::memory:\"\n[[tools]]\nname = \"one\"\nsource = \"a\"\n[[tools]]\nname = \"two\"\nsource = \"a\"\n",
        ));
        assert_eq!(registry.get_all_tools().len(), registry.get_tools_for_source("a").len());
    }

    #[test]
    fn test_tool_entry_conversion() {
        let entry = ToolEntry {
            name: "report".to_string(),
            source: "a".to_string(),
            settings: serde_json::from_value(serde_json::json!({
                "description": "Daily report",
                "statement": "SELECT 1",
                "owner": "ops"
            }))
            .unwrap(),
        };
        let ToolConfig::Custom(custom) = ToolConfig::try_from(entry).unwrap() else {
            panic!("expected custom tool");
        };
        assert_eq!(custom.description.as_deref(), Some("Daily report"));
        assert!(custom.payload.contains_key("owner"));
        assert!(!custom.payload.contains_key("description"));
    }

    #[test]
    fn test_builtin_settings_validated() {
        let bad = |settings: Value| ToolEntry {
            name: EXECUTE_SQL.to_string(),
            source: "a".to_string(),
            settings: serde_json::from_value(settings).unwrap(),
        };
        assert!(ToolConfig::try_from(bad(serde_json::json!({"max_rows": 0}))).is_err());
        assert!(ToolConfig::try_from(bad(serde_json::json!({"limit": 5}))).is_err());
        assert!(ToolConfig::try_from(ToolEntry {
            name: "bad name".to_string(),
            source: "a".to_string(),
            settings: Map::new(),
        })
        .is_err());
    }

    #[test]
    fn test_handle_fails_fast_before_initialize() {
        let handle = ToolRegistryHandle::new();
        assert!(!handle.is_initialized());
        assert_eq!(handle.get().unwrap_err().error_code(), "REGISTRY_NOT_INITIALIZED");

        handle.initialize(ToolRegistry::new(&config("[[sources]]\nid = \"pg1\"\ndsn = \"sqlite::memory:\"\n")));
        assert!(handle.is_initialized());
        assert_eq!(handle.get().unwrap().get_tools_for_source("pg1").len(), 2);
    }

    #[test]
    fn test_tool_definitions_have_schemas() {
        let registry = ToolRegistry::new(&config(
            "[[sources]]\nid = \"a\"\ndsn = \"sqlite::memory:\"\n[[tools]]\nname = \"report\"\nsource = \"a\"\ndescription = \"Daily report\"\n",
        ));
        let definitions = tool_definitions(&registry);
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].description, "Daily report");
        assert!(definitions[0].input_schema["properties"].get("source").is_some());

        let defaults = tool_definitions(&ToolRegistry::new(&config(
            "[[sources]]\nid = \"a\"\ndsn = \"sqlite::memory:\"\n",
        )));
        let exec = defaults.iter().find(|d| d.name == EXECUTE_SQL).unwrap();
        assert!(exec.input_schema["properties"].get("sql").is_some());
    }
}
