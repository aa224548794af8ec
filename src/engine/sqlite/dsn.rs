//! `SQLite` DSN parsing
//!
//! Accepted shapes:
//! - `sqlite:///absolute/path.db`
//! - `sqlite://relative/path.db`
//! - `sqlite::memory:` (also `sqlite:///:memory:`)
//!
//! Query options (e.g. `?mode=ro`) are kept verbatim in
//! [`ConnectionConfig::options`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::dsn::{parse_bool_option, DsnParser};
use crate::engine::ConnectionConfig;
use crate::error::{redact_dsn, Result, SqlGateError};

const MEMORY: &str = ":memory:";

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDsnParser;

impl DsnParser for SqliteDsnParser {
    fn parse(&self, dsn: &str) -> Result<ConnectionConfig> {
        let trimmed = dsn.trim();
        let rest = strip_scheme(trimmed).ok_or_else(|| {
            SqlGateError::dsn_format(format!(
                "'{}' is not a SQLite DSN (expected sqlite:///path or sqlite::memory:)",
                redact_dsn(trimmed)
            ))
        })?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let path = if location == MEMORY {
            MEMORY
        } else if let Some(path) = location.strip_prefix("//") {
            // sqlite:///abs -> "/abs", sqlite://rel -> "rel"
            path
        } else {
            return Err(SqlGateError::dsn_format(
                "SQLite DSN must be 'sqlite:///path' or 'sqlite::memory:'",
            ));
        };

        let path = if path == "/:memory:" { MEMORY } else { path };
        if path.is_empty() || path == "/" {
            return Err(SqlGateError::dsn_format("SQLite DSN is missing a database path"));
        }

        let mut config = ConnectionConfig::sqlite(PathBuf::from(path));
        config.options = parse_options(query)?;
        Ok(config)
    }

    fn sample_dsn(&self) -> &'static str {
        "sqlite:///tmp/sqlgate.db"
    }
}

fn strip_scheme(dsn: &str) -> Option<&str> {
    let scheme = dsn.get(..7)?;
    scheme.eq_ignore_ascii_case("sqlite:").then(|| &dsn[7..])
}

fn parse_options(query: Option<&str>) -> Result<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "mode" if !matches!(value, "ro" | "rw" | "rwc") => {
                return Err(SqlGateError::dsn_format(format!(
                    "SQLite option 'mode' must be ro, rw or rwc, got '{value}'"
                )));
            }
            "immutable" => {
                parse_bool_option(key, value)?;
            }
            _ => {}
        }
        options.insert(key.to_string(), value.to_string());
    }
    Ok(options)
}
