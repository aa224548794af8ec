//! Query Safety Gate
//!
//! A conservative, backend-aware classifier run before any SQL reaches a
//! connector. It is a static check, not a parser.
//!
//! # Validation Strategy
//! - The lexer follows the quoting and comment rules of the backend:
//!   `[brackets]`, backticks, backslash escapes, `E'...'`, `$tag$` bodies,
//!   `#` and nested comments, and MySQL `/*! ... */` bodies (lexed as SQL)
//! - Comments are stripped, string literals and quoted identifiers are masked
//! - The script is split into statements on `;` outside quotes
//! - Each statement's leading keyword is compared (case-insensitively) against
//!   the mutating verbs for the backend
//! - `WITH`, `EXPLAIN` and `PREPARE` statements are rejected if they contain a
//!   mutating verb anywhere (data-modifying CTEs, `EXPLAIN ANALYZE DELETE ...`)
//! - `SELECT ... INTO` is treated as a write
//! - On SQL Server every word is checked, since a batch needs no `;`
//! - Where a server setting decides how backslashes read inside plain
//!   strings, both readings must pass; an unterminated quote is rejected
//!
//! Mutating statements are allowed only when `readonly` is explicitly `false`.
//! Connectors still execute the pieces one statement at a time, so a piece
//! the server would read as two statements fails instead of running.

use serde::{Deserialize, Serialize};

use crate::engine::{DatabaseType, ExecuteOptions};
use crate::error::{Result, SqlGateError};

/// Verbs that mutate data or schema on every backend
const MUTATING_VERBS: &[&str] =
    &["DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE"];

const POSTGRES_VERBS: &[&str] =
    &["COPY", "VACUUM", "REINDEX", "CLUSTER", "COMMENT", "REFRESH", "MERGE", "CALL", "DO"];

const MYSQL_VERBS: &[&str] = &["REPLACE", "RENAME", "LOAD", "CALL"];

const SQLSERVER_VERBS: &[&str] =
    &["MERGE", "EXEC", "EXECUTE", "BULK", "DENY", "BACKUP", "RESTORE", "DBCC", "KILL", "SHUTDOWN"];

const SQLITE_VERBS: &[&str] = &["VACUUM", "REINDEX", "ATTACH", "DETACH", "REPLACE"];

/// Outcome of the safety gate. Never an error by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub is_valid: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Validation {
    #[must_use]
    pub const fn ok() -> Self {
        Self { is_valid: true, message: None }
    }

    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self { is_valid: false, message: Some(message.into()) }
    }

    /// Map a negative validation to [`SqlGateError::ValidationRejected`]
    pub fn into_result(self) -> Result<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(SqlGateError::validation_rejected(
                self.message.unwrap_or_else(|| "Query rejected by policy".to_string()),
            ))
        }
    }
}

/// Check `sql` against the execution policy for `engine`
#[must_use]
pub fn validate_query(sql: &str, engine: DatabaseType, options: &ExecuteOptions) -> Validation {
    let dialect = Dialect::of(engine);
    let scanned = scan(sql, dialect, true);
    if scanned.statements.is_empty() {
        return Validation::rejected("Query cannot be empty");
    }

    if !options.is_readonly() {
        return Validation::ok();
    }

    if scanned.unterminated {
        return Validation::rejected("Query contains an unterminated quoted string or identifier");
    }

    // Plain-string escaping can hinge on server settings; every reading must pass
    for reading in dialect.readings() {
        for statement in &scan(sql, reading, true).statements {
            if let Some(verb) = mutating_verb(statement, engine) {
                return Validation::rejected(format!(
                    "{verb} statements are not allowed on a read-only source \
                     (set readonly = false to permit them)"
                ));
            }
        }
    }

    Validation::ok()
}

/// First mutating verb that makes `statement` a write, if any
fn mutating_verb(statement: &str, engine: DatabaseType) -> Option<String> {
    let words: Vec<String> = keywords(statement).collect();
    let leading = words.first()?;

    if is_mutating(leading, engine) {
        return Some(leading.clone());
    }

    // T-SQL batches need no `;` between statements
    if engine == DatabaseType::SqlServer {
        if let Some(verb) = words.iter().skip(1).find(|w| is_mutating(w, engine)) {
            return Some(verb.clone());
        }
    }

    match leading.as_str() {
        "WITH" | "EXPLAIN" | "PREPARE" => words.iter().skip(1).find(|w| is_mutating(w, engine)).cloned(),
        "SELECT" if words.iter().any(|w| w == "INTO") => Some("SELECT INTO".to_string()),
        _ => None,
    }
}

fn is_mutating(word: &str, engine: DatabaseType) -> bool {
    let extra = match engine {
        DatabaseType::Postgres => POSTGRES_VERBS,
        DatabaseType::MySQL | DatabaseType::MariaDB => MYSQL_VERBS,
        DatabaseType::SqlServer => SQLSERVER_VERBS,
        DatabaseType::SQLite => SQLITE_VERBS,
    };
    MUTATING_VERBS.contains(&word) || extra.contains(&word)
}

/// Uppercased bare words of a (masked) statement
fn keywords(statement: &str) -> impl Iterator<Item = String> + '_ {
    statement
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_uppercase)
}

/// Split a script into statements on `;` outside quotes and comments,
/// following the quoting rules of `engine`
///
/// Comments are dropped; literal text is preserved.
#[must_use]
pub fn split_statements(sql: &str, engine: DatabaseType) -> Vec<String> {
    scan(sql, Dialect::of(engine), false).statements
}

/// Quoting and comment rules of one backend
#[derive(Debug, Clone, Copy, Default)]
struct Dialect {
    /// `[ident]` identifiers
    brackets: bool,
    /// `]]` stands for `]` inside brackets
    bracket_doubling: bool,
    /// `` `ident` `` identifiers
    backticks: bool,
    /// `"..."` is a string literal (and takes backslash escapes with `'...'`)
    double_quoted_strings: bool,
    /// `#` starts a line comment
    hash_comments: bool,
    /// `--` starts a comment only when followed by whitespace
    spaced_dash_comments: bool,
    nested_comments: bool,
    /// `/*! ... */` bodies are executed by the server
    executable_comments: bool,
    /// `$tag$ ... $tag$`
    dollar_quotes: bool,
    /// `E'...'` always takes backslash escapes
    escape_strings: bool,
    /// Backslash escapes inside plain string literals
    backslash_escapes: bool,
    /// A server setting can flip `backslash_escapes`
    backslash_configurable: bool,
}

impl Dialect {
    fn of(engine: DatabaseType) -> Self {
        match engine {
            // standard_conforming_strings can be turned off per session
            DatabaseType::Postgres => Self {
                nested_comments: true,
                dollar_quotes: true,
                escape_strings: true,
                backslash_configurable: true,
                ..Self::default()
            },
            // NO_BACKSLASH_ESCAPES / ANSI_QUOTES are sql_mode flags
            DatabaseType::MySQL | DatabaseType::MariaDB => Self {
                backticks: true,
                double_quoted_strings: true,
                hash_comments: true,
                spaced_dash_comments: true,
                executable_comments: true,
                backslash_escapes: true,
                backslash_configurable: true,
                ..Self::default()
            },
            DatabaseType::SqlServer => Self {
                brackets: true,
                bracket_doubling: true,
                nested_comments: true,
                ..Self::default()
            },
            DatabaseType::SQLite => Self { brackets: true, backticks: true, ..Self::default() },
        }
    }

    /// Every way the server may read plain string literals
    fn readings(self) -> impl Iterator<Item = Self> {
        let flipped = self
            .backslash_configurable
            .then_some(Self { backslash_escapes: !self.backslash_escapes, ..self });
        std::iter::once(self).chain(flipped)
    }
}

#[derive(Debug, Default)]
struct Scan {
    statements: Vec<String>,
    /// A string literal or quoted identifier ran to the end of input
    unterminated: bool,
}

/// Single pass over `sql`: strips comments, optionally masks quoted content,
/// and splits on top-level `;`
fn scan(sql: &str, dialect: Dialect, mask_literals: bool) -> Scan {
    let bytes = sql.as_bytes();
    let mut scanned = Scan::default();
    let mut current = String::new();
    let mut i = 0;

    while i < bytes.len() {
        let after_ident = i > 0 && is_ident_byte(bytes[i - 1]);

        let quoted = match bytes[i] {
            b'-' if bytes.get(i + 1) == Some(&b'-') && dash_comment_starts(bytes, i, dialect) => {
                i = line_end(sql, i);
                current.push(' ');
                continue;
            }
            b'#' if dialect.hash_comments => {
                i = line_end(sql, i);
                current.push(' ');
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                match executable_comment_len(&sql[i..], dialect) {
                    // The body is lexed as ordinary SQL
                    Some(len) => i += len,
                    None => i = block_comment_end(bytes, i, dialect.nested_comments),
                }
                current.push(' ');
                continue;
            }
            b'E' | b'e' if dialect.escape_strings && bytes.get(i + 1) == Some(&b'\'') && !after_ident => {
                Some(quoted_end(bytes, i + 1, b'\'', true, true))
            }
            b'\'' => Some(quoted_end(bytes, i, b'\'', dialect.backslash_escapes, true)),
            b'"' => Some(quoted_end(
                bytes,
                i,
                b'"',
                dialect.double_quoted_strings && dialect.backslash_escapes,
                true,
            )),
            b'`' if dialect.backticks => Some(quoted_end(bytes, i, b'`', false, true)),
            b'[' if dialect.brackets => Some(quoted_end(bytes, i, b']', false, dialect.bracket_doubling)),
            b'$' if dialect.dollar_quotes && !after_ident && dollar_tag_len(&sql[i..]).is_some() => {
                let tag_len = dollar_tag_len(&sql[i..]).unwrap_or(1);
                let tag = &sql[i..i + tag_len];
                let body_start = i + tag_len;
                Some(sql[body_start..].find(tag).map(|n| body_start + n + tag_len))
            }
            b';' => {
                flush(&mut scanned.statements, &mut current);
                i += 1;
                continue;
            }
            _ => None,
        };

        match quoted {
            Some(Some(end)) => {
                push_quoted(&mut current, &sql[i..end], mask_literals);
                i = end;
            }
            Some(None) => {
                scanned.unterminated = true;
                push_quoted(&mut current, &sql[i..], mask_literals);
                i = bytes.len();
            }
            None => {
                let ch = sql[i..].chars().next().unwrap_or(' ');
                current.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    flush(&mut scanned.statements, &mut current);
    scanned
}

const fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn dash_comment_starts(bytes: &[u8], i: usize, dialect: Dialect) -> bool {
    !dialect.spaced_dash_comments
        || bytes.get(i + 2).map_or(true, |b| b.is_ascii_whitespace() || b.is_ascii_control())
}

fn line_end(sql: &str, i: usize) -> usize {
    sql[i..].find('\n').map_or(sql.len(), |n| i + n)
}

/// Opener length of a `/*!NNNNN` or `/*M!NNNNN` comment whose body runs
fn executable_comment_len(s: &str, dialect: Dialect) -> Option<usize> {
    if !dialect.executable_comments {
        return None;
    }
    let rest = s.strip_prefix("/*!").or_else(|| s.strip_prefix("/*M!"))?;
    let version = rest.bytes().take_while(u8::is_ascii_digit).count();
    Some(s.len() - rest.len() + version)
}

/// Index just past the `*/` closing the comment opened at `start`
fn block_comment_end(bytes: &[u8], start: usize, nested: bool) -> usize {
    let mut depth = 0usize;
    let mut j = start;
    while j + 1 < bytes.len() {
        match (bytes[j], bytes[j + 1]) {
            (b'/', b'*') if depth == 0 || nested => {
                depth += 1;
                j += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                j += 2;
                if depth == 0 {
                    return j;
                }
            }
            _ => j += 1,
        }
    }
    bytes.len()
}

/// Index just past the quote closing the one at `open`
fn quoted_end(bytes: &[u8], open: usize, close: u8, backslash: bool, doubling: bool) -> Option<usize> {
    let mut j = open + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' if backslash => j += 2,
            b if b == close => {
                if doubling && bytes.get(j + 1) == Some(&close) {
                    j += 2;
                } else {
                    return Some(j + 1);
                }
            }
            _ => j += 1,
        }
    }
    None
}

fn push_quoted(out: &mut String, token: &str, mask: bool) {
    if mask {
        out.push_str(" '' ");
    } else {
        out.push_str(token);
    }
}

fn flush(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    current.clear();
}

/// Length of a `$tag$` / `$$` dollar-quote opener at the start of `s`
fn dollar_tag_len(s: &str) -> Option<usize> {
    let rest = s.strip_prefix('$')?;
    let end = rest.find('$')?;
    let tag = &rest[..end];
    let valid = tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !tag.starts_with(|c: char| c.is_ascii_digit());
    valid.then_some(end + 2)
}
