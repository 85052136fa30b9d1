//! Parsing of management command output.
//!
//! All parsing functions are pure so they can be tested without a server:
//! Keeper `mntr` output (`key<TAB>value` lines) and ClickHouse
//! `JSONEachRow` result sets.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid JSON row {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// One `mntr` line: a key, whitespace, then the value.
static KV_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^(\w+)\s+(.+)$").ok());

/// Parse the key/value lines of a Keeper `mntr` response.
///
/// # Example
/// ```
/// use clickhouse_operator::client::parsing::parse_mntr;
///
/// let output = "zk_version\tv25.3\nzk_server_state\tleader\n";
/// let parsed = parse_mntr(output);
/// assert_eq!(parsed.get("zk_server_state"), Some(&"leader".to_string()));
/// ```
pub fn parse_mntr(output: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let Some(kv_regex) = KV_RE.as_ref() else {
        return result;
    };
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = kv_regex.captures(line)
            && let (Some(key), Some(value)) = (caps.get(1), caps.get(2))
        {
            result.insert(key.as_str().to_string(), value.as_str().trim().to_string());
        }
    }
    result
}

/// Split a `JSONEachRow` body into rows.
pub fn parse_json_each_row(body: &str) -> Result<Vec<Value>, ParseError> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|source| ParseError::Json {
                line: index + 1,
                source,
            })
        })
        .collect()
}

/// A non-system database and how to recreate it elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseDescriptor {
    /// Full engine clause, including arguments.
    pub engine_full: String,
    /// Whether the database uses the `Replicated` engine.
    pub is_replicated: bool,
}

fn string_field(row: &Value, field: &str) -> Result<String, ParseError> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ParseError::MissingField(field.to_string()))
}

/// ClickHouse renders `UInt8` flags as numbers and `Bool` as booleans.
fn flag_field(row: &Value, field: &str) -> Result<bool, ParseError> {
    let value = row
        .get(field)
        .ok_or_else(|| ParseError::MissingField(field.to_string()))?;
    value
        .as_bool()
        .or_else(|| value.as_u64().map(|n| n != 0))
        .or_else(|| value.as_str().map(|s| s == "1" || s == "true"))
        .ok_or_else(|| ParseError::MissingField(field.to_string()))
}

/// Parse rows of `name, engine_full, is_replicated`.
pub fn parse_databases(body: &str) -> Result<BTreeMap<String, DatabaseDescriptor>, ParseError> {
    parse_json_each_row(body)?
        .iter()
        .map(|row| {
            Ok((
                string_field(row, "name")?,
                DatabaseDescriptor {
                    engine_full: string_field(row, "engine_full")?,
                    is_replicated: flag_field(row, "is_replicated")?,
                },
            ))
        })
        .collect()
}

/// Parse rows of `database, name` into quoted table references.
pub fn parse_tables(body: &str) -> Result<Vec<String>, ParseError> {
    parse_json_each_row(body)?
        .iter()
        .map(|row| {
            Ok(format!(
                "{}.{}",
                quote_identifier(&string_field(row, "database")?),
                quote_identifier(&string_field(row, "name")?)
            ))
        })
        .collect()
}

/// Backquote an identifier, escaping embedded backquotes.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}
