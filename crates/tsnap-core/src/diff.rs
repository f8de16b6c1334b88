//! Full-snapshot reconciliation.
//!
//! Both snapshots are indexed by identifier before the union pass, so each
//! lookup is a hash probe. Output order is deterministic: current rows in
//! input order, then rows only present in the previous snapshot in their
//! original order. The unified table is de-duplicated by identifier, first
//! occurrence wins.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::{
    ChangeStatus, CoreError, Record, Table, Value, CHANGE_STATUS_COLUMN, LAST_CHANGE_SEEN_COLUMN,
};

pub fn diff(
    current: &Table,
    previous: Option<&Table>,
    id_field: &str,
    ts_field: &str,
    run_timestamp: DateTime<Utc>,
) -> Result<Table, CoreError> {
    require_columns(current, "current", id_field, ts_field)?;
    let current_index = index_by_identifier(current, id_field, "current")?;

    let mut columns = current.columns.clone();
    for extra in [CHANGE_STATUS_COLUMN, LAST_CHANGE_SEEN_COLUMN] {
        if !columns.iter().any(|c| c == extra) {
            columns.push(extra.to_string());
        }
    }

    let Some(previous) = previous else {
        let rows = current
            .rows
            .iter()
            .map(|row| tag_row(row, &columns, ChangeStatus::New, run_timestamp))
            .collect();
        return Ok(dedup_by_identifier(Table { columns, rows }, id_field));
    };

    require_columns(previous, "previous", id_field, ts_field)?;
    let previous_index = index_by_identifier(previous, id_field, "previous")?;

    let mut rows = Vec::with_capacity(current.len() + previous.len());
    for row in &current.rows {
        let status = match identifier(row, id_field).and_then(|k| previous_index.get(&k)) {
            Some(&prev_pos) => {
                let ours = row.get(ts_field).unwrap_or(&Value::Null);
                let theirs = previous.value(prev_pos, ts_field);
                if ours == theirs {
                    ChangeStatus::Existing
                } else {
                    ChangeStatus::Updated
                }
            }
            None => ChangeStatus::New,
        };
        rows.push(tag_row(row, &columns, status, run_timestamp));
    }

    for row in &previous.rows {
        let still_present = identifier(row, id_field)
            .map(|k| current_index.contains_key(&k))
            .unwrap_or(false);
        if !still_present {
            rows.push(tag_row(row, &columns, ChangeStatus::Deleted, run_timestamp));
        }
    }

    Ok(dedup_by_identifier(Table { columns, rows }, id_field))
}

/// Keeps the first row per identifier, preserving input order.
pub fn dedup_by_identifier(mut table: Table, id_field: &str) -> Table {
    let mut seen: HashSet<Option<String>> = HashSet::with_capacity(table.rows.len());
    table.rows.retain(|row| seen.insert(identifier(row, id_field)));
    table
}

/// Row counts per change status; rows without a recognised status are skipped.
pub fn count_by_status(table: &Table) -> BTreeMap<ChangeStatus, usize> {
    let mut counts = BTreeMap::new();
    for status in table
        .column_values(CHANGE_STATUS_COLUMN)
        .filter_map(Value::as_str)
        .filter_map(ChangeStatus::parse)
    {
        *counts.entry(status).or_default() += 1;
    }
    counts
}

fn require_columns(
    table: &Table,
    snapshot: &'static str,
    id_field: &str,
    ts_field: &str,
) -> Result<(), CoreError> {
    for field in [id_field, ts_field] {
        if !table.has_column(field) {
            return Err(CoreError::MissingField {
                field: field.to_string(),
                snapshot,
            });
        }
    }
    Ok(())
}

fn identifier(row: &Record, id_field: &str) -> Option<String> {
    row.get(id_field).and_then(Value::key)
}

fn index_by_identifier(
    table: &Table,
    id_field: &str,
    snapshot: &'static str,
) -> Result<HashMap<String, usize>, CoreError> {
    let mut index = HashMap::with_capacity(table.len());
    for (row, record) in table.rows.iter().enumerate() {
        let key = identifier(record, id_field).ok_or_else(|| CoreError::MissingIdentifier {
            field: id_field.to_string(),
            snapshot,
            row,
        })?;
        index.entry(key).or_insert(row);
    }
    Ok(index)
}

fn tag_row(
    row: &Record,
    columns: &[String],
    status: ChangeStatus,
    run_timestamp: DateTime<Utc>,
) -> Record {
    let mut out: Record = columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect();
    out.insert(
        CHANGE_STATUS_COLUMN.to_string(),
        Value::String(status.as_str().to_string()),
    );
    let seen = match status {
        ChangeStatus::Existing => Value::Null,
        _ => Value::Timestamp(run_timestamp),
    };
    out.insert(LAST_CHANGE_SEEN_COLUMN.to_string(), seen);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn run_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn snapshot(rows: &[(i64, &str)]) -> Table {
        let mut table = Table::new(vec!["id".into(), "ts".into()]);
        for (id, ts) in rows {
            let mut record = Record::new();
            record.insert("id".into(), Value::Int(*id));
            record.insert("ts".into(), Value::from(*ts));
            table.rows.push(record);
        }
        table
    }

    fn status_of(table: &Table, id: i64) -> Vec<String> {
        table
            .rows
            .iter()
            .filter(|r| r["id"] == Value::Int(id))
            .map(|r| r[CHANGE_STATUS_COLUMN].to_string())
            .collect()
    }

    #[test]
    fn classifies_new_updated_and_deleted() {
        let current = snapshot(&[(1, "A"), (2, "B")]);
        let previous = snapshot(&[(2, "X"), (3, "Y")]);
        let out = diff(&current, Some(&previous), "id", "ts", run_ts()).unwrap();

        assert_eq!(status_of(&out, 1), vec!["new"]);
        assert_eq!(status_of(&out, 2), vec!["updated"]);
        assert_eq!(status_of(&out, 3), vec!["deleted"]);
        assert_eq!(out.len(), 3);
        for row in &out.rows {
            assert_eq!(row[LAST_CHANGE_SEEN_COLUMN], Value::Timestamp(run_ts()));
        }
        assert_eq!(out.rows[2]["ts"], Value::from("Y"));
    }

    #[test]
    fn equal_timestamps_are_existing_without_stamp() {
        let current = snapshot(&[(1, "A")]);
        let previous = snapshot(&[(1, "A")]);
        let out = diff(&current, Some(&previous), "id", "ts", run_ts()).unwrap();
        assert_eq!(status_of(&out, 1), vec!["existing"]);
        assert_eq!(out.rows[0][LAST_CHANGE_SEEN_COLUMN], Value::Null);
    }

    #[test]
    fn no_previous_snapshot_marks_everything_new() {
        let current = snapshot(&[(1, "A"), (2, "B")]);
        let out = diff(&current, None, "id", "ts", run_ts()).unwrap();
        assert!(out
            .column_values(CHANGE_STATUS_COLUMN)
            .all(|v| *v == Value::from("new")));
        assert_eq!(out.columns, vec!["id", "ts", CHANGE_STATUS_COLUMN, LAST_CHANGE_SEEN_COLUMN]);
    }

    #[test]
    fn duplicate_identifiers_keep_first_occurrence() {
        let current = snapshot(&[(1, "first"), (1, "second"), (2, "B")]);
        let out = diff(&current, None, "id", "ts", run_ts()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.rows[0]["ts"], Value::from("first"));

        let previous = snapshot(&[(1, "first")]);
        let out = diff(&current, Some(&previous), "id", "ts", run_ts()).unwrap();
        assert_eq!(status_of(&out, 1), vec!["existing"]);
        assert_eq!(out.rows[0]["ts"], Value::from("first"));
    }

    #[test]
    fn every_identifier_gets_exactly_one_status() {
        let current = snapshot(&[(1, "a"), (2, "b"), (4, "d"), (5, "e")]);
        let previous = snapshot(&[(2, "b"), (3, "c"), (4, "z"), (6, "f")]);
        let out = diff(&current, Some(&previous), "id", "ts", run_ts()).unwrap();

        let ids: Vec<i64> = out
            .rows
            .iter()
            .map(|r| match r["id"] {
                Value::Int(i) => i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 4, 5, 3, 6]);

        let counts = count_by_status(&out);
        assert_eq!(counts[&ChangeStatus::New], 2);
        assert_eq!(counts[&ChangeStatus::Existing], 1);
        assert_eq!(counts[&ChangeStatus::Updated], 1);
        assert_eq!(counts[&ChangeStatus::Deleted], 2);
    }

    #[test]
    fn deleted_rows_are_projected_onto_current_schema() {
        let current = snapshot(&[(1, "A")]);
        let mut previous = snapshot(&[(9, "Z")]);
        previous.columns.push("last_update_n_weeks_ago".into());
        previous.rows[0].insert("last_update_n_weeks_ago".into(), Value::from("4+"));

        let out = diff(&current, Some(&previous), "id", "ts", run_ts()).unwrap();
        let deleted = &out.rows[1];
        assert!(!deleted.contains_key("last_update_n_weeks_ago"));
        assert_eq!(deleted.len(), out.columns.len());
    }

    #[test]
    fn missing_identifier_column_is_fatal() {
        let current = snapshot(&[(1, "A")]);
        let previous = Table::new(vec!["ts".into()]);
        let err = diff(&current, Some(&previous), "id", "ts", run_ts()).unwrap_err();
        assert_eq!(
            err,
            CoreError::MissingField {
                field: "id".into(),
                snapshot: "previous"
            }
        );

        let err = diff(&current, None, "id", "modified_at", run_ts()).unwrap_err();
        assert!(matches!(err, CoreError::MissingField { snapshot: "current", .. }));
    }

    #[test]
    fn null_identifier_is_fatal() {
        let mut current = snapshot(&[(1, "A")]);
        current.rows[0].insert("id".into(), Value::Null);
        let err = diff(&current, None, "id", "ts", run_ts()).unwrap_err();
        assert!(matches!(err, CoreError::MissingIdentifier { row: 0, .. }));
    }
}
