//! Warehouse contract and the parquet-file warehouse.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use tsnap_core::{parse_datetime, Record, Table, Value};
use tsnap_storage::write_file_atomically;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Add rows, keep what is already there.
    Append,
    /// Supersede the table contents in one atomic swap.
    #[default]
    Replace,
}

impl FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" | "write_append" => Ok(LoadMode::Append),
            "replace" | "truncate" | "write_truncate" => Ok(LoadMode::Replace),
            other => Err(format!("unknown load mode `{other}` (expected append or replace)")),
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Append => f.write_str("append"),
            LoadMode::Replace => f.write_str("replace"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub table_id: String,
    pub mode: LoadMode,
    pub rows_loaded: usize,
    pub total_rows: usize,
    pub columns: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid table id `{0}` (expected dot-separated project.dataset.table)")]
    InvalidTableId(String),
    #[error("table {0} does not exist")]
    TableNotFound(String),
    #[error("schema mismatch for {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },
    #[error("arrow: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int64,
    Float64,
    Boolean,
    Timestamp,
    Utf8,
}

impl ColumnType {
    pub fn data_type(self) -> DataType {
        match self {
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            ColumnType::Utf8 => DataType::Utf8,
        }
    }

    fn from_data_type(data_type: &DataType) -> Option<Self> {
        match data_type {
            DataType::Int64 => Some(ColumnType::Int64),
            DataType::Float64 => Some(ColumnType::Float64),
            DataType::Boolean => Some(ColumnType::Boolean),
            DataType::Timestamp(TimeUnit::Microsecond, _) => Some(ColumnType::Timestamp),
            DataType::Utf8 => Some(ColumnType::Utf8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn arrow_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|c| ArrowField::new(&c.name, c.column_type.data_type(), true))
                .collect::<Vec<_>>(),
        ))
    }

    fn from_arrow(table_id: &str, schema: &Schema) -> Result<Self, LoadError> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| {
                ColumnType::from_data_type(f.data_type())
                    .map(|column_type| ColumnSpec {
                        name: f.name().clone(),
                        column_type,
                    })
                    .ok_or_else(|| LoadError::SchemaMismatch {
                        table: table_id.to_string(),
                        detail: format!("unsupported column type {} for {}", f.data_type(), f.name()),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { columns })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Infers one column type per table column from its non-null values.
///
/// All-integer columns are `Int64`, integer/float mixes `Float64`, and
/// homogeneous booleans or timestamps keep their type. Anything else,
/// including all-null and list columns, is `Utf8`.
pub fn infer_schema(table: &Table) -> TableSchema {
    let columns = table
        .columns
        .iter()
        .map(|name| ColumnSpec {
            name: name.clone(),
            column_type: infer_column_type(table.column_values(name)),
        })
        .collect();
    TableSchema { columns }
}

fn infer_column_type<'a>(values: impl Iterator<Item = &'a Value>) -> ColumnType {
    let mut inferred: Option<ColumnType> = None;
    for value in values {
        let ty = match value {
            Value::Null => continue,
            Value::Int(_) => ColumnType::Int64,
            Value::Float(_) => ColumnType::Float64,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Timestamp(_) => ColumnType::Timestamp,
            Value::String(_) | Value::List(_) => return ColumnType::Utf8,
        };
        inferred = Some(match (inferred, ty) {
            (None, ty) => ty,
            (Some(a), b) if a == b => a,
            (Some(ColumnType::Int64), ColumnType::Float64)
            | (Some(ColumnType::Float64), ColumnType::Int64) => ColumnType::Float64,
            _ => return ColumnType::Utf8,
        });
    }
    inferred.unwrap_or(ColumnType::Utf8)
}

/// Destination for loaded snapshots and source of the previous one.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn table_exists(&self, table_id: &str) -> Result<bool, LoadError>;

    async fn create_table(&self, table_id: &str, schema: &TableSchema) -> Result<(), LoadError>;

    /// Replace writes `table` with `schema`; append coerces to the stored schema.
    async fn load(
        &self,
        table_id: &str,
        table: &Table,
        mode: LoadMode,
        schema: &TableSchema,
    ) -> Result<LoadStats, LoadError>;

    /// Full contents of a table; the only query the pipeline issues.
    async fn read_table(&self, table_id: &str) -> Result<Table, LoadError>;
}

/// Creates the destination when absent, then loads `table` with `mode`,
/// using the schema inferred from `table`.
pub async fn load_table(
    warehouse: &dyn Warehouse,
    table_id: &str,
    table: &Table,
    mode: LoadMode,
) -> Result<LoadStats, LoadError> {
    load_table_with_schema(warehouse, table_id, table, mode, &infer_schema(table)).await
}

/// Like [`load_table`] with a caller-fixed schema, so column types stay
/// stable across replace runs whatever values a run happens to carry.
pub async fn load_table_with_schema(
    warehouse: &dyn Warehouse,
    table_id: &str,
    table: &Table,
    mode: LoadMode,
    schema: &TableSchema,
) -> Result<LoadStats, LoadError> {
    if !warehouse.table_exists(table_id).await? {
        warehouse.create_table(table_id, schema).await?;
        info!(table_id, "table created");
    }
    let stats = warehouse.load(table_id, table, mode, schema).await?;
    info!(
        "loaded {} rows ({} total) and {} columns to {} [{}]",
        stats.rows_loaded, stats.total_rows, stats.columns, stats.table_id, stats.mode
    );
    Ok(stats)
}

/// Warehouse of parquet files: `a.b.c` lives at `<root>/a/b/c.parquet`.
///
/// Every write lands in a temp file that is renamed over the table file.
#[derive(Debug, Clone)]
pub struct ParquetWarehouse {
    root: PathBuf,
}

impl ParquetWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, table_id: &str) -> Result<PathBuf, LoadError> {
        let parts: Vec<&str> = table_id.split('.').collect();
        let valid = parts.len() <= 3
            && parts.iter().all(|p| {
                !p.is_empty()
                    && p.chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            });
        let Some((table, dirs)) = parts.split_last().filter(|_| valid) else {
            return Err(LoadError::InvalidTableId(table_id.to_string()));
        };
        let mut path = self.root.clone();
        for dir in dirs {
            path.push(dir);
        }
        path.push(format!("{table}.parquet"));
        Ok(path)
    }

    fn read_file(&self, table_id: &str) -> Result<(TableSchema, Table), LoadError> {
        let path = self.table_path(table_id)?;
        if !path.exists() {
            return Err(LoadError::TableNotFound(table_id.to_string()));
        }
        let file = File::open(&path).map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = TableSchema::from_arrow(table_id, builder.schema())?;
        let mut table = Table::new(schema.column_names());
        for batch in builder.build()? {
            let batch = batch?;
            append_batch_rows(table_id, &mut table, &schema, &batch)?;
        }
        Ok((schema, table))
    }

    async fn write_file(
        &self,
        table_id: &str,
        schema: &TableSchema,
        table: &Table,
    ) -> Result<(), LoadError> {
        let path = self.table_path(table_id)?;
        let arrow_schema = schema.arrow_schema();
        let mut buffer = Vec::new();
        {
            let mut writer = ArrowWriter::try_new(&mut buffer, arrow_schema.clone(), None)?;
            if !table.is_empty() {
                let batch = build_batch(table_id, schema, arrow_schema, table)?;
                writer.write(&batch)?;
            }
            writer.close()?;
        }
        write_file_atomically(&path, &buffer)
            .await
            .map_err(|source| LoadError::Io { path, source })
    }
}

#[async_trait]
impl Warehouse for ParquetWarehouse {
    async fn table_exists(&self, table_id: &str) -> Result<bool, LoadError> {
        Ok(self.table_path(table_id)?.exists())
    }

    async fn create_table(&self, table_id: &str, schema: &TableSchema) -> Result<(), LoadError> {
        if self.table_exists(table_id).await? {
            info!(table_id, "table already exists");
            return Ok(());
        }
        self.write_file(table_id, schema, &Table::new(schema.column_names()))
            .await
    }

    async fn load(
        &self,
        table_id: &str,
        table: &Table,
        mode: LoadMode,
        schema: &TableSchema,
    ) -> Result<LoadStats, LoadError> {
        let (schema, merged) = match mode {
            LoadMode::Replace => {
                if let Some(unknown) = table
                    .columns
                    .iter()
                    .find(|c| !schema.columns.iter().any(|s| &s.name == *c))
                {
                    return Err(LoadError::SchemaMismatch {
                        table: table_id.to_string(),
                        detail: format!("column `{unknown}` is not in the load schema"),
                    });
                }
                (schema.clone(), table.clone())
            }
            LoadMode::Append => {
                let (schema, mut existing) = self.read_file(table_id)?;
                if let Some(unknown) = table.columns.iter().find(|c| !existing.has_column(c)) {
                    return Err(LoadError::SchemaMismatch {
                        table: table_id.to_string(),
                        detail: format!("column `{unknown}` is not in the table schema"),
                    });
                }
                existing.rows.extend(table.rows.iter().cloned());
                (schema, existing)
            }
        };
        self.write_file(table_id, &schema, &merged).await?;
        Ok(LoadStats {
            table_id: table_id.to_string(),
            mode,
            rows_loaded: table.len(),
            total_rows: merged.len(),
            columns: schema.columns.len(),
        })
    }

    async fn read_table(&self, table_id: &str) -> Result<Table, LoadError> {
        Ok(self.read_file(table_id)?.1)
    }
}

fn build_batch(
    table_id: &str,
    schema: &TableSchema,
    arrow_schema: SchemaRef,
    table: &Table,
) -> Result<RecordBatch, LoadError> {
    let mismatch = |column: &str, value: &Value, expected: ColumnType| LoadError::SchemaMismatch {
        table: table_id.to_string(),
        detail: format!("value {value:?} in `{column}` does not fit {expected:?}"),
    };

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.columns.len());
    for spec in &schema.columns {
        let name = spec.name.as_str();
        let values: Vec<&Value> = table.column_values(name).collect();
        let array: ArrayRef = match spec.column_type {
            ColumnType::Int64 => Arc::new(Int64Array::from(
                values
                    .iter()
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::Int(i) => Ok(Some(*i)),
                        other => Err(mismatch(name, other, spec.column_type)),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            ColumnType::Float64 => Arc::new(Float64Array::from(
                values
                    .iter()
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::Int(i) => Ok(Some(*i as f64)),
                        Value::Float(f) => Ok(Some(*f)),
                        other => Err(mismatch(name, other, spec.column_type)),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            ColumnType::Boolean => Arc::new(BooleanArray::from(
                values
                    .iter()
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::Bool(b) => Ok(Some(*b)),
                        other => Err(mismatch(name, other, spec.column_type)),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            ColumnType::Timestamp => Arc::new(
                TimestampMicrosecondArray::from(
                    values
                        .iter()
                        .map(|v| match v {
                            Value::Null => Ok(None),
                            Value::Timestamp(ts) => Ok(Some(ts.timestamp_micros())),
                            Value::String(s) => parse_datetime(s)
                                .map(|dt| Some(dt.and_utc().timestamp_micros()))
                                .ok_or_else(|| mismatch(name, v, spec.column_type)),
                            other => Err(mismatch(name, other, spec.column_type)),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                )
                .with_timezone("UTC"),
            ),
            ColumnType::Utf8 => Arc::new(StringArray::from(
                values
                    .iter()
                    .map(|v| (!v.is_null()).then(|| v.to_string()))
                    .collect::<Vec<_>>(),
            )),
        };
        arrays.push(array);
    }
    Ok(RecordBatch::try_new(arrow_schema, arrays)?)
}

fn append_batch_rows(
    table_id: &str,
    table: &mut Table,
    schema: &TableSchema,
    batch: &RecordBatch,
) -> Result<(), LoadError> {
    let start = table.rows.len();
    table
        .rows
        .extend(std::iter::repeat_with(Record::new).take(batch.num_rows()));

    for (spec, column) in schema.columns.iter().zip(batch.columns()) {
        for i in 0..batch.num_rows() {
            let value = if column.is_null(i) {
                Value::Null
            } else {
                read_cell(column.as_ref(), spec.column_type, i)
                    .ok_or_else(|| LoadError::SchemaMismatch {
                        table: table_id.to_string(),
                        detail: format!("column `{}` is not {:?}", spec.name, spec.column_type),
                    })?
            };
            table.rows[start + i].insert(spec.name.clone(), value);
        }
    }
    Ok(())
}

fn read_cell(column: &dyn Array, column_type: ColumnType, i: usize) -> Option<Value> {
    let any = column.as_any();
    match column_type {
        ColumnType::Int64 => any.downcast_ref::<Int64Array>().map(|a| Value::Int(a.value(i))),
        ColumnType::Float64 => any.downcast_ref::<Float64Array>().map(|a| Value::Float(a.value(i))),
        ColumnType::Boolean => any.downcast_ref::<BooleanArray>().map(|a| Value::Bool(a.value(i))),
        ColumnType::Timestamp => any
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|a| DateTime::<Utc>::from_timestamp_micros(a.value(i)))
            .map(Value::Timestamp),
        ColumnType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map(|a| Value::String(a.value(i).to_string())),
    }
}
