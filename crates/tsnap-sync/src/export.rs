//! CSV export and import of flat tables.

use std::path::Path;

use anyhow::{Context, Result};
use tsnap_core::{Record, Table, Value};
use tsnap_storage::write_file_atomically;

/// Serializes `table` as CSV with a header row. Nulls are empty cells.
pub fn table_to_csv(table: &Table) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&table.columns)
        .context("writing csv header")?;
    for row in 0..table.len() {
        writer
            .write_record(table.columns.iter().map(|c| table.value(row, c).to_string()))
            .with_context(|| format!("writing csv row {row}"))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv writer: {}", err.error()))
}

pub async fn write_csv(path: &Path, table: &Table) -> Result<()> {
    let bytes = table_to_csv(table)?;
    write_file_atomically(path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Reads a CSV file with a header row, typing each cell by [`parse_cell`].
pub fn read_csv(path: &Path) -> Result<Table> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let columns: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut table = Table::new(columns);
    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading {} row {}", path.display(), i + 1))?;
        let row: Record = table
            .columns
            .iter()
            .zip(record.iter())
            .map(|(column, cell)| (column.clone(), parse_cell(cell)))
            .collect();
        table.rows.push(row);
    }
    Ok(table)
}

pub fn parse_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    match cell {
        "true" | "True" | "TRUE" => return Value::Bool(true),
        "false" | "False" | "FALSE" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if f.is_finite() {
            return Value::Float(f);
        }
    }
    Value::String(cell.to_string())
}
