//! Column projection and date normalization for flattened records.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::{CoreError, Record, Table, Value};

pub const DEFAULT_DATE_COLUMNS: [&str; 4] = ["modified_at", "created_at", "completed_at", "due_on"];

pub const DEFAULT_TASK_COLUMNS: [&str; 21] = [
    "gid",
    "assignee_gid",
    "assignee_name",
    "workspace_gid",
    "workspace_name",
    "team_name",
    "projects_gid",
    "projects_name",
    "name",
    "notes",
    "permalink_url",
    "completed",
    "modified_at",
    "created_at",
    "completed_at",
    "due_on",
    "followers_gid",
    "followers_name",
    "memberships_section_gid",
    "memberships_section_name",
    "resource_type",
];

const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// What to do when a record lacks a projected column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingColumnPolicy {
    /// Substitute null.
    #[default]
    Null,
    /// Fail with [`CoreError::MissingColumn`].
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub columns: Vec<String>,
    pub date_columns: Vec<String>,
    pub missing: MissingColumnPolicy,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            columns: DEFAULT_TASK_COLUMNS.iter().map(ToString::to_string).collect(),
            date_columns: DEFAULT_DATE_COLUMNS.iter().map(ToString::to_string).collect(),
            missing: MissingColumnPolicy::default(),
        }
    }
}

impl Projection {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            date_columns: Vec::new(),
            missing: MissingColumnPolicy::default(),
        }
    }

    pub fn with_date_columns(mut self, date_columns: Vec<String>) -> Self {
        self.date_columns = date_columns;
        self
    }

    pub fn with_missing_policy(mut self, missing: MissingColumnPolicy) -> Self {
        self.missing = missing;
        self
    }

    /// Selects the configured columns, then normalizes the date columns.
    pub fn apply(&self, records: &[Record]) -> Result<Table, CoreError> {
        let mut table = project(records, &self.columns, self.missing)?;
        for column in &self.date_columns {
            if !table.has_column(column) {
                continue;
            }
            for row in &mut table.rows {
                if let Some(value) = row.get_mut(column) {
                    *value = normalize_date(value);
                }
            }
        }
        Ok(table)
    }
}

/// Selects exactly `columns`, in order, from every record.
pub fn project(
    records: &[Record],
    columns: &[String],
    missing: MissingColumnPolicy,
) -> Result<Table, CoreError> {
    let mut table = Table::new(columns.to_vec());
    table.rows.reserve(records.len());
    for (row, record) in records.iter().enumerate() {
        let mut projected = Record::new();
        for column in columns {
            let value = match (record.get(column), missing) {
                (Some(value), _) => value.clone(),
                (None, MissingColumnPolicy::Null) => Value::Null,
                (None, MissingColumnPolicy::Error) => {
                    return Err(CoreError::MissingColumn {
                        column: column.clone(),
                        row,
                    })
                }
            };
            projected.insert(column.clone(), value);
        }
        table.rows.push(projected);
    }
    Ok(table)
}

/// Canonical `YYYY-MM-DD` text for a date-like value; null when unparseable.
pub fn normalize_date(value: &Value) -> Value {
    let parsed = match value {
        Value::Timestamp(ts) => Some(ts.naive_utc()),
        Value::String(text) => parse_datetime(text),
        _ => None,
    };
    parsed
        .map(|dt| Value::String(dt.format(CANONICAL_DATE_FORMAT).to_string()))
        .unwrap_or(Value::Null)
}

/// Parses the wall-clock time of a date or datetime string.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
