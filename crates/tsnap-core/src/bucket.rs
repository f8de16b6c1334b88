//! Weeks-since-update bucketing.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{parse_datetime, CoreError, Table, Value, WEEKS_SINCE_UPDATE_COLUMN};

/// Anything older than this many whole weeks collapses into the overflow bucket.
pub const WEEKS_BUCKET_CAP: i64 = 4;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeeksBucket {
    Weeks(i64),
    Overflow,
}

impl WeeksBucket {
    pub fn between(timestamp: NaiveDateTime, reference: NaiveDateTime) -> Self {
        // Clock skew can put a timestamp after the reference; that is the current week.
        let days = (reference - timestamp)
            .num_seconds()
            .div_euclid(SECONDS_PER_DAY)
            .max(0);
        if days > WEEKS_BUCKET_CAP * 7 {
            WeeksBucket::Overflow
        } else {
            WeeksBucket::Weeks(days.div_euclid(7))
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            WeeksBucket::Weeks(n) => Value::Int(n),
            WeeksBucket::Overflow => Value::String(format!("{WEEKS_BUCKET_CAP}+")),
        }
    }
}

/// Adds the `last_update_n_weeks_ago` column computed from `timestamp_field`.
pub fn bucket(
    mut table: Table,
    timestamp_field: &str,
    reference_time: DateTime<Utc>,
) -> Result<Table, CoreError> {
    let reference = reference_time.naive_utc();
    for row in &mut table.rows {
        let raw = row.get(timestamp_field).unwrap_or(&Value::Null);
        let timestamp = match raw {
            Value::Timestamp(ts) => Some(ts.naive_utc()),
            Value::String(text) => parse_datetime(text),
            _ => None,
        }
        .ok_or_else(|| CoreError::InvalidTimestamp {
            field: timestamp_field.to_string(),
            value: raw.to_string(),
        })?;
        row.insert(
            WEEKS_SINCE_UPDATE_COLUMN.to_string(),
            WeeksBucket::between(timestamp, reference).to_value(),
        );
    }
    table.ensure_column(WEEKS_SINCE_UPDATE_COLUMN);
    Ok(table)
}
