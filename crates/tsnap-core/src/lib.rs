//! Core record model and snapshot reconciliation for tsnap.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod bucket;
pub mod diff;
pub mod flatten;
pub mod project;

pub use bucket::{bucket, WeeksBucket};
pub use diff::{count_by_status, dedup_by_identifier, diff};
pub use flatten::{flatten, flatten_object, FlattenOptions, ListMergeStrategy};
pub use project::{normalize_date, parse_datetime, project, MissingColumnPolicy, Projection};

pub const CRATE_NAME: &str = "tsnap-core";

pub const CHANGE_STATUS_COLUMN: &str = "change_status";
pub const LAST_CHANGE_SEEN_COLUMN: &str = "last_change_seen";
pub const WEEKS_SINCE_UPDATE_COLUMN: &str = "last_update_n_weeks_ago";

/// Rendering used for timestamps in text outputs (CSV, string columns).
pub const TIMESTAMP_TEXT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single scalar (or list of scalars) held by a flat record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Converts a JSON leaf. Maps nested inside lists are kept as their JSON text.
    pub fn from_json_leaf(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::List(items.iter().map(Value::from_json_leaf).collect()),
            JsonValue::Object(_) => Value::String(value.to_string()),
        }
    }

    /// Text key used to correlate records across snapshots.
    pub fn key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => JsonValue::from(*f),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Timestamp(ts) => JsonValue::String(ts.format(TIMESTAMP_TEXT_FORMAT).to_string()),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_TEXT_FORMAT)),
            Value::List(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Flat record: field name to scalar or list-of-scalar value.
pub type Record = BTreeMap<String, Value>;

/// Ordered rows sharing one column list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Appends `name` to the column list if absent.
    pub fn ensure_column(&mut self, name: &str) {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
    }

    pub fn value<'a>(&'a self, row: usize, column: &str) -> &'a Value {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&Value::Null)
    }

    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows
            .iter()
            .map(move |r| r.get(column).unwrap_or(&Value::Null))
    }
}

/// Classification of a record relative to the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    New,
    Updated,
    Existing,
    Deleted,
}

impl ChangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::New => "new",
            ChangeStatus::Updated => "updated",
            ChangeStatus::Existing => "existing",
            ChangeStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(ChangeStatus::New),
            "updated" => Some(ChangeStatus::Updated),
            "existing" => Some(ChangeStatus::Existing),
            "deleted" => Some(ChangeStatus::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("expected an object at the record root, found {found}")]
    NotAnObject { found: &'static str },
    #[error("record {row} is missing required column `{column}`")]
    MissingColumn { column: String, row: usize },
    #[error("{snapshot} snapshot has no `{field}` column")]
    MissingField { field: String, snapshot: &'static str },
    #[error("{snapshot} snapshot row {row} has no value for identifier `{field}`")]
    MissingIdentifier {
        field: String,
        snapshot: &'static str,
        row: usize,
    },
    #[error("invalid timestamp in `{field}`: {value:?}")]
    InvalidTimestamp { field: String, value: String },
}
