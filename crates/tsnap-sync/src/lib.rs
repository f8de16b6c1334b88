//! Sync pipeline orchestration: extract, flatten, project, diff, bucket, load.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use tsnap_adapters::{
    extract_task_details, AsanaApiSource, FixtureTaskSource, TaskSource, ASANA_API_BASE,
};
use tsnap_core::project::{DEFAULT_DATE_COLUMNS, DEFAULT_TASK_COLUMNS};
use tsnap_core::{
    bucket, count_by_status, dedup_by_identifier, diff, flatten, ChangeStatus, FlattenOptions,
    ListMergeStrategy, MissingColumnPolicy, Projection, Record, Table, LAST_CHANGE_SEEN_COLUMN,
    WEEKS_SINCE_UPDATE_COLUMN,
};
use tsnap_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use uuid::Uuid;

pub mod export;
pub mod warehouse;

pub use export::{read_csv, write_csv};
pub use warehouse::{
    infer_schema, load_table, load_table_with_schema, ColumnType, LoadError, LoadMode, LoadStats,
    ParquetWarehouse, TableSchema, Warehouse,
};

pub const CRATE_NAME: &str = "tsnap-sync";

/// Config file picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tsnap.yaml";

pub const TASK_DETAILS_CSV: &str = "task_details.csv";

/// Asana's published per-token limit for free workspaces.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 150;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Workspace name, resolved to a gid at the start of each run.
    pub workspace: String,
    pub output_dir: PathBuf,
    pub access_token: Option<String>,
    /// Destination table id, `project.dataset.table`.
    pub output_target: String,
    pub warehouse_root: PathBuf,
    pub identifier_field: String,
    pub timestamp_field: String,
    pub load_mode: LoadMode,
    pub columns: Vec<String>,
    pub date_columns: Vec<String>,
    pub list_merge: ListMergeStrategy,
    pub missing_columns: MissingColumnPolicy,
    /// Read the workspace from a JSON capture instead of the API.
    pub fixture_path: Option<PathBuf>,
    pub api_base_url: String,
    pub http_timeout_secs: u64,
    /// API request budget; `0` turns the limiter off.
    pub requests_per_minute: u32,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace: String::new(),
            output_dir: PathBuf::from("./output"),
            access_token: None,
            output_target: String::new(),
            warehouse_root: PathBuf::from("./warehouse"),
            identifier_field: "permalink_url".to_string(),
            timestamp_field: "modified_at".to_string(),
            load_mode: LoadMode::Replace,
            columns: DEFAULT_TASK_COLUMNS.iter().map(ToString::to_string).collect(),
            date_columns: DEFAULT_DATE_COLUMNS.iter().map(ToString::to_string).collect(),
            list_merge: ListMergeStrategy::default(),
            missing_columns: MissingColumnPolicy::default(),
            fixture_path: None,
            api_base_url: ASANA_API_BASE.to_string(),
            http_timeout_secs: 20,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            user_agent: "tsnap-bot/0.1".to_string(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("workspace", &self.workspace)
            .field("output_dir", &self.output_dir)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("output_target", &self.output_target)
            .field("warehouse_root", &self.warehouse_root)
            .field("identifier_field", &self.identifier_field)
            .field("timestamp_field", &self.timestamp_field)
            .field("load_mode", &self.load_mode)
            .field("columns", &self.columns.len())
            .field("date_columns", &self.date_columns)
            .field("list_merge", &self.list_merge)
            .field("missing_columns", &self.missing_columns)
            .field("fixture_path", &self.fixture_path)
            .field("api_base_url", &self.api_base_url)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Defaults, then the YAML file (explicit or `tsnap.yaml` if present), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TSNAP_WORKSPACE") {
            self.workspace = v;
        }
        if let Some(v) = var("TSNAP_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ASANA_PERSONAL_ACCESS_TOKEN") {
            self.access_token = Some(v);
        }
        if let Some(v) = var("TSNAP_TARGET_TABLE") {
            self.output_target = v;
        } else if let (Some(project), Some(dataset), Some(table)) = (
            var("BIGQUERY_PROJECT_ID"),
            var("BIGQUERY_DATASET_ID"),
            var("BIGQUERY_TABLE_ID"),
        ) {
            self.output_target = format!("{project}.{dataset}.{table}");
        }
        if let Some(v) = var("TSNAP_WAREHOUSE_DIR") {
            self.warehouse_root = PathBuf::from(v);
        }
        if let Some(v) = var("TSNAP_ID_FIELD") {
            self.identifier_field = v;
        }
        if let Some(v) = var("TSNAP_TS_FIELD") {
            self.timestamp_field = v;
        }
        if let Some(v) = var("TSNAP_LOAD_MODE") {
            self.load_mode = v
                .parse()
                .map_err(anyhow::Error::msg)
                .context("parsing TSNAP_LOAD_MODE")?;
        }
        if let Some(v) = var("TSNAP_FIXTURE") {
            self.fixture_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("TSNAP_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("parsing TSNAP_HTTP_TIMEOUT_SECS={v}"))?;
        }
        if let Some(v) = var("TSNAP_REQUESTS_PER_MINUTE") {
            self.requests_per_minute = v
                .trim()
                .parse()
                .with_context(|| format!("parsing TSNAP_REQUESTS_PER_MINUTE={v}"))?;
        }
        if let Some(v) = var("TSNAP_USER_AGENT") {
            self.user_agent = v;
        }
        Ok(())
    }

    /// Checks needed to extract: a workspace and a way to reach it.
    pub fn validate_for_extract(&self) -> Result<()> {
        ensure!(!self.workspace.trim().is_empty(), "workspace name is not set");
        ensure!(
            self.fixture_path.is_some() || self.access_token.is_some(),
            "ASANA_PERSONAL_ACCESS_TOKEN is required unless a fixture is configured"
        );
        Ok(())
    }

    /// Extract checks plus a target table and the diff key columns.
    pub fn validate(&self) -> Result<()> {
        self.validate_for_extract()?;
        ensure!(
            !self.output_target.trim().is_empty(),
            "output target table is not set"
        );
        for field in [&self.identifier_field, &self.timestamp_field] {
            ensure!(
                self.columns.iter().any(|c| c == field),
                "column list does not include `{field}`"
            );
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let token_bucket = (self.requests_per_minute > 0).then(|| TokenBucketConfig {
            capacity: (self.requests_per_minute / 10).max(1),
            refill_every: Duration::from_secs(60) / self.requests_per_minute,
        });
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            bearer_token: self.access_token.clone(),
            token_bucket,
            ..Default::default()
        }
    }

    pub fn projection(&self) -> Projection {
        Projection::new(self.columns.clone())
            .with_date_columns(self.date_columns.clone())
            .with_missing_policy(self.missing_columns)
    }

    pub fn flatten_options(&self) -> FlattenOptions {
        FlattenOptions::default().with_list_merge(self.list_merge)
    }
}

/// Flattened, projected task details of one extraction.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub workspace_gid: String,
    pub teams: usize,
    pub projects: usize,
    pub tasks: usize,
    pub table: Table,
    pub csv_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub workspace: String,
    pub extracted_tasks: usize,
    pub had_previous_snapshot: bool,
    pub status_counts: BTreeMap<ChangeStatus, usize>,
    pub load: LoadStats,
    pub reports_dir: String,
}

pub struct SyncPipeline {
    config: PipelineConfig,
    run_id: Uuid,
    source: Box<dyn TaskSource>,
    warehouse: Box<dyn Warehouse>,
    artifacts: ArtifactStore,
}

impl SyncPipeline {
    /// Needs only what extraction needs; [`SyncPipeline::run_at`] checks the rest.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate_for_extract()?;
        let run_id = Uuid::new_v4();
        let source = build_source(&config, run_id)?;
        let warehouse = Box::new(ParquetWarehouse::new(config.warehouse_root.clone()));
        let artifacts = ArtifactStore::new(config.output_dir.join("artifacts"));
        Ok(Self {
            config,
            run_id,
            source,
            warehouse,
            artifacts,
        })
    }

    pub fn with_source(mut self, source: Box<dyn TaskSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_warehouse(mut self, warehouse: Box<dyn Warehouse>) -> Self {
        self.warehouse = warehouse;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_at(Utc::now()).await
    }

    /// One full run; `run_timestamp` stamps changes and anchors the weeks buckets.
    pub async fn run_at(&self, run_timestamp: DateTime<Utc>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let config = &self.config;
        config.validate()?;
        info!(run_id = %self.run_id, workspace = %config.workspace, target = %config.output_target, "sync run starting");

        let snapshot = self.extract_snapshot(run_timestamp).await?;
        let previous = self.previous_snapshot().await;
        let had_previous_snapshot = previous.is_some();

        let diffed = diff(
            &snapshot.table,
            previous.as_ref(),
            &config.identifier_field,
            &config.timestamp_field,
            run_timestamp,
        )
        .context("reconciling against the previous snapshot")?;
        let unified = bucket(diffed, &config.timestamp_field, run_timestamp)
            .context("bucketing by weeks since update")?;
        let status_counts = count_by_status(&unified);
        for (status, count) in &status_counts {
            info!(%status, count, "change status");
        }

        let load = load_table_with_schema(
            self.warehouse.as_ref(),
            &config.output_target,
            &unified,
            config.load_mode,
            &snapshot_schema(&unified),
        )
        .await
        .with_context(|| format!("loading {}", config.output_target))?;

        let reports_dir = config.output_dir.join("reports").join(self.run_id.to_string());
        let summary = SyncRunSummary {
            run_id: self.run_id,
            run_timestamp,
            started_at,
            finished_at: Utc::now(),
            workspace: config.workspace.clone(),
            extracted_tasks: snapshot.table.len(),
            had_previous_snapshot,
            status_counts,
            load,
            reports_dir: reports_dir.display().to_string(),
        };
        self.write_reports(&reports_dir, &summary, &unified).await?;
        info!(run_id = %self.run_id, reports = %summary.reports_dir, "sync run complete");
        Ok(summary)
    }

    /// Extracts the workspace and writes the flattened task details CSV.
    pub async fn extract_snapshot(&self, extracted_at: DateTime<Utc>) -> Result<Snapshot> {
        let config = &self.config;
        let workspace_gid = self
            .source
            .workspace_gid(&config.workspace)
            .await
            .context("looking up workspaces")?;
        let Some(workspace_gid) = workspace_gid else {
            bail!("workspace `{}` not found", config.workspace);
        };
        info!(workspace = %config.workspace, %workspace_gid, source = self.source.source_id(), "workspace resolved");

        let extraction = extract_task_details(self.source.as_ref(), &workspace_gid)
            .await
            .with_context(|| format!("extracting workspace {}", config.workspace))?;
        info!(
            teams = extraction.teams.len(),
            projects = extraction.projects.len(),
            tasks = extraction.task_details.len(),
            "extraction complete"
        );

        let teams = self
            .artifacts
            .store_json(extracted_at, "teams", &extraction.teams)
            .await?;
        let details = self
            .artifacts
            .store_json(extracted_at, "task_details", &extraction.task_details)
            .await?;
        info!(
            teams = %teams.relative_path.display(),
            task_details = %details.relative_path.display(),
            "raw artifacts stored"
        );

        let options = config.flatten_options();
        let records = extraction
            .task_details
            .iter()
            .map(|detail| flatten(detail, &options))
            .collect::<Result<Vec<Record>, _>>()
            .context("flattening task details")?;
        let table = config
            .projection()
            .apply(&records)
            .context("projecting task columns")?;

        let csv_path = config.output_dir.join(TASK_DETAILS_CSV);
        write_csv(&csv_path, &table).await?;
        info!(rows = table.len(), path = %csv_path.display(), "task details written");

        Ok(Snapshot {
            workspace_gid,
            teams: extraction.teams.len(),
            projects: extraction.projects.len(),
            tasks: extraction.tasks.len(),
            table,
            csv_path,
        })
    }

    /// Latest row per identifier from the target table, or `None` if it cannot be read.
    async fn previous_snapshot(&self) -> Option<Table> {
        let target = &self.config.output_target;
        match self.warehouse.table_exists(target).await {
            Ok(true) => {}
            Ok(false) => {
                info!(%target, "no previous snapshot; every row is new");
                return None;
            }
            Err(err) => {
                warn!(%target, error = %err, "checking previous snapshot failed; treating as absent");
                return None;
            }
        }
        match self.warehouse.read_table(target).await {
            Ok(mut table) => {
                // Appended history holds one row per run; keep the most recent.
                table.rows.reverse();
                let mut table = dedup_by_identifier(table, &self.config.identifier_field);
                table.rows.reverse();
                Some(table)
            }
            Err(err) => {
                warn!(%target, error = %err, "reading previous snapshot failed; treating as absent");
                None
            }
        }
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &SyncRunSummary, unified: &Table) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;

        write_csv(&reports_dir.join("snapshot.csv"), unified).await?;

        let brief = format!(
            "# tsnap Run Brief\n\n- Run ID: `{}`\n- Workspace: {}\n- Run timestamp: {}\n- Started: {}\n- Finished: {}\n- Extracted tasks: {}\n- Previous snapshot: {}\n- Target: {} ({}, {} rows loaded, {} total)\n\n## Change Status\n{}\n",
            summary.run_id,
            summary.workspace,
            summary.run_timestamp,
            summary.started_at,
            summary.finished_at,
            summary.extracted_tasks,
            if summary.had_previous_snapshot { "yes" } else { "no" },
            summary.load.table_id,
            summary.load.mode,
            summary.load.rows_loaded,
            summary.load.total_rows,
            summary
                .status_counts
                .iter()
                .map(|(k, v)| format!("- {}: {}", k, v))
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(reports_dir.join("run_brief.md"), brief)
            .await
            .context("writing run_brief.md")?;
        Ok(())
    }
}

fn build_source(config: &PipelineConfig, run_id: Uuid) -> Result<Box<dyn TaskSource>> {
    if let Some(path) = &config.fixture_path {
        return Ok(Box::new(FixtureTaskSource::from_path(path)?));
    }
    ensure!(
        config.access_token.is_some(),
        "ASANA_PERSONAL_ACCESS_TOKEN is not set"
    );
    let http = HttpFetcher::new(config.http_client_config())?;
    Ok(Box::new(
        AsanaApiSource::new(http, run_id).with_base_url(config.api_base_url.clone()),
    ))
}

/// Inferred schema with the derived columns pinned: the weeks bucket is text
/// (it carries `4+`) and `last_change_seen` is a timestamp even when all null.
fn snapshot_schema(table: &Table) -> TableSchema {
    let mut schema = infer_schema(table);
    for column in &mut schema.columns {
        if column.name == WEEKS_SINCE_UPDATE_COLUMN {
            column.column_type = ColumnType::Utf8;
        } else if column.name == LAST_CHANGE_SEEN_COLUMN {
            column.column_type = ColumnType::Timestamp;
        }
    }
    schema
}

pub async fn run_sync_once(config: PipelineConfig) -> Result<SyncRunSummary> {
    SyncPipeline::new(config)?.run_once().await
}

/// Loads a CSV export into `table_id`, creating the table when absent.
pub async fn load_csv_file(
    warehouse: &dyn Warehouse,
    csv_path: &Path,
    table_id: &str,
    mode: LoadMode,
) -> Result<LoadStats> {
    let table = read_csv(csv_path)?;
    info!(rows = table.len(), columns = table.columns.len(), path = %csv_path.display(), "csv read");
    load_table(warehouse, table_id, &table, mode)
        .await
        .with_context(|| format!("loading {} into {table_id}", csv_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use tsnap_core::{Value, CHANGE_STATUS_COLUMN, LAST_CHANGE_SEEN_COLUMN};

    const TARGET: &str = "acme.asana.task_snapshots";

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures/acme-workspace")
            .join(name)
    }

    fn test_config(root: &Path, fixture_name: &str) -> PipelineConfig {
        PipelineConfig {
            workspace: "Acme".into(),
            output_dir: root.join("output"),
            output_target: TARGET.into(),
            warehouse_root: root.join("warehouse"),
            fixture_path: Some(fixture(fixture_name)),
            ..Default::default()
        }
    }

    fn first_run_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn second_run_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).single().unwrap()
    }

    fn statuses_by_url(table: &Table) -> HashMap<String, String> {
        table
            .rows
            .iter()
            .map(|r| (r["permalink_url"].to_string(), r[CHANGE_STATUS_COLUMN].to_string()))
            .collect()
    }

    fn url(project: &str, task: &str) -> String {
        format!("https://app.asana.com/0/{project}/{task}")
    }

    #[tokio::test]
    async fn first_run_marks_everything_new() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path(), "run1.json");
        let pipeline = SyncPipeline::new(config.clone()).unwrap();
        let summary = pipeline.run_at(first_run_at()).await.unwrap();

        assert_eq!(summary.extracted_tasks, 3);
        assert!(!summary.had_previous_snapshot);
        assert_eq!(summary.status_counts[&ChangeStatus::New], 3);
        assert_eq!(summary.load.total_rows, 3);

        let warehouse = ParquetWarehouse::new(&config.warehouse_root);
        let stored = warehouse.read_table(TARGET).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.has_column(WEEKS_SINCE_UPDATE_COLUMN));
        for row in &stored.rows {
            assert_eq!(row[LAST_CHANGE_SEEN_COLUMN], Value::Timestamp(first_run_at()));
        }

        let reports = PathBuf::from(&summary.reports_dir);
        assert!(reports.join("run_summary.json").exists());
        assert!(reports.join("snapshot.csv").exists());
        assert!(reports.join("run_brief.md").exists());
        assert!(config.output_dir.join(TASK_DETAILS_CSV).exists());
        assert!(config.output_dir.join("artifacts").exists());
    }

    #[tokio::test]
    async fn second_run_reconciles_against_the_warehouse() {
        let dir = tempdir().expect("tempdir");
        SyncPipeline::new(test_config(dir.path(), "run1.json"))
            .unwrap()
            .run_at(first_run_at())
            .await
            .unwrap();

        let config = test_config(dir.path(), "run2.json");
        let summary = SyncPipeline::new(config.clone())
            .unwrap()
            .run_at(second_run_at())
            .await
            .unwrap();
        assert!(summary.had_previous_snapshot);
        assert_eq!(summary.load.total_rows, 4);

        let stored = ParquetWarehouse::new(&config.warehouse_root)
            .read_table(TARGET)
            .await
            .unwrap();
        assert_eq!(stored.len(), 4);
        let statuses = statuses_by_url(&stored);
        assert_eq!(statuses[&url("300", "400")], "existing");
        assert_eq!(statuses[&url("300", "401")], "updated");
        assert_eq!(statuses[&url("301", "403")], "new");
        assert_eq!(statuses[&url("301", "402")], "deleted");

        let row = |task_url: String| {
            stored
                .rows
                .iter()
                .find(|r| r["permalink_url"].to_string() == task_url)
                .unwrap()
                .clone()
        };
        assert_eq!(row(url("300", "400"))[LAST_CHANGE_SEEN_COLUMN], Value::Null);
        assert_eq!(
            row(url("300", "401"))[LAST_CHANGE_SEEN_COLUMN],
            Value::Timestamp(second_run_at())
        );
        assert_eq!(row(url("300", "400"))[WEEKS_SINCE_UPDATE_COLUMN], Value::from("1"));
        assert_eq!(row(url("301", "402"))[WEEKS_SINCE_UPDATE_COLUMN], Value::from("4+"));
    }

    #[tokio::test]
    async fn append_mode_diffs_against_latest_rows() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(dir.path(), "run1.json");
        config.load_mode = LoadMode::Append;
        SyncPipeline::new(config.clone())
            .unwrap()
            .run_at(first_run_at())
            .await
            .unwrap();

        config.fixture_path = Some(fixture("run2.json"));
        let summary = SyncPipeline::new(config.clone())
            .unwrap()
            .run_at(second_run_at())
            .await
            .unwrap();
        assert_eq!(summary.load.rows_loaded, 4);
        assert_eq!(summary.load.total_rows, 7);
        assert_eq!(summary.status_counts[&ChangeStatus::Existing], 1);
        assert_eq!(summary.status_counts[&ChangeStatus::Updated], 1);
        assert_eq!(summary.status_counts[&ChangeStatus::New], 1);
        assert_eq!(summary.status_counts[&ChangeStatus::Deleted], 1);
    }

    #[tokio::test]
    async fn replace_then_append_keeps_the_weeks_column_as_text() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(dir.path(), "run1.json");
        // Every run1 task is at most four weeks old here, so all buckets are numbers.
        let early = Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).single().unwrap();
        SyncPipeline::new(config.clone())
            .unwrap()
            .run_at(early)
            .await
            .unwrap();
        let warehouse = ParquetWarehouse::new(&config.warehouse_root);
        let stored = warehouse.read_table(TARGET).await.unwrap();
        assert!(stored
            .column_values(WEEKS_SINCE_UPDATE_COLUMN)
            .all(|v| matches!(v, Value::String(_))));

        config.load_mode = LoadMode::Append;
        config.fixture_path = Some(fixture("run2.json"));
        let summary = SyncPipeline::new(config)
            .unwrap()
            .run_at(second_run_at())
            .await
            .unwrap();
        assert_eq!(summary.load.total_rows, 7);

        let stored = warehouse.read_table(TARGET).await.unwrap();
        let rotated = stored
            .rows
            .iter()
            .rev()
            .find(|r| r["permalink_url"] == Value::from(url("301", "402")))
            .unwrap();
        assert_eq!(rotated[CHANGE_STATUS_COLUMN], Value::from("deleted"));
        assert_eq!(rotated[WEEKS_SINCE_UPDATE_COLUMN], Value::from("4+"));
    }

    #[tokio::test]
    async fn extract_runs_without_a_target_table() {
        let dir = tempdir().expect("tempdir");
        let config = PipelineConfig {
            workspace: "Acme".into(),
            output_dir: dir.path().join("output"),
            warehouse_root: dir.path().join("warehouse"),
            fixture_path: Some(fixture("run1.json")),
            ..Default::default()
        };
        let pipeline = SyncPipeline::new(config).unwrap();
        let snapshot = pipeline.extract_snapshot(first_run_at()).await.unwrap();
        assert_eq!(snapshot.table.len(), 3);
        assert!(snapshot.csv_path.exists());

        let err = pipeline.run_at(first_run_at()).await.unwrap_err();
        assert!(err.to_string().contains("output target table"));
    }

    #[tokio::test]
    async fn unreadable_previous_snapshot_is_treated_as_absent() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path(), "run1.json");
        let warehouse = ParquetWarehouse::new(&config.warehouse_root);
        let path = warehouse.table_path(TARGET).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not parquet").unwrap();

        let summary = SyncPipeline::new(config)
            .unwrap()
            .run_at(first_run_at())
            .await
            .unwrap();
        assert!(!summary.had_previous_snapshot);
        assert_eq!(summary.status_counts[&ChangeStatus::New], 3);
        assert_eq!(warehouse.read_table(TARGET).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_workspace_aborts_before_loading() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(dir.path(), "run1.json");
        config.workspace = "Globex".into();
        let err = SyncPipeline::new(config.clone())
            .unwrap()
            .run_at(first_run_at())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Globex"));
        assert!(!ParquetWarehouse::new(&config.warehouse_root)
            .table_exists(TARGET)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn extract_writes_task_details_csv() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path(), "run2.json");
        let snapshot = SyncPipeline::new(config)
            .unwrap()
            .extract_snapshot(second_run_at())
            .await
            .unwrap();
        assert_eq!(snapshot.workspace_gid, "100");
        assert_eq!(snapshot.teams, 2);
        // 400 is listed under both projects; duplicates survive until the diff.
        assert_eq!(snapshot.table.len(), 4);

        let csv = read_csv(&snapshot.csv_path).unwrap();
        assert_eq!(csv.columns, DEFAULT_TASK_COLUMNS.to_vec());
        assert_eq!(csv.rows[0]["team_name"], Value::from("Marketing"));
        assert_eq!(csv.rows[0]["modified_at"], Value::from("2026-02-20"));
    }

    #[tokio::test]
    async fn csv_files_load_into_the_warehouse() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path(), "run1.json");
        let snapshot = SyncPipeline::new(config.clone())
            .unwrap()
            .extract_snapshot(first_run_at())
            .await
            .unwrap();

        let warehouse = ParquetWarehouse::new(&config.warehouse_root);
        let stats = load_csv_file(&warehouse, &snapshot.csv_path, "acme.asana.raw", LoadMode::Append)
            .await
            .unwrap();
        assert_eq!(stats.rows_loaded, 3);
        let stats = load_csv_file(&warehouse, &snapshot.csv_path, "acme.asana.raw", LoadMode::Append)
            .await
            .unwrap();
        assert_eq!(stats.total_rows, 6);
    }

    #[test]
    fn environment_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            ("TSNAP_WORKSPACE", "Acme"),
            ("ASANA_PERSONAL_ACCESS_TOKEN", "0/secret"),
            ("BIGQUERY_PROJECT_ID", "acme-prod"),
            ("BIGQUERY_DATASET_ID", "asana"),
            ("BIGQUERY_TABLE_ID", "tasks"),
            ("TSNAP_LOAD_MODE", "WRITE_APPEND"),
            ("TSNAP_HTTP_TIMEOUT_SECS", "45"),
            ("TSNAP_REQUESTS_PER_MINUTE", "1500"),
            ("TSNAP_ID_FIELD", ""),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config
            .apply_env(|key| env.get(key).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.workspace, "Acme");
        assert_eq!(config.output_target, "acme-prod.asana.tasks");
        assert_eq!(config.load_mode, LoadMode::Append);
        assert_eq!(config.http_timeout_secs, 45);
        assert_eq!(config.requests_per_minute, 1500);
        assert_eq!(config.identifier_field, "permalink_url");
        config.validate().unwrap();

        let debug = format!("{config:?}");
        assert!(!debug.contains("0/secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn explicit_target_table_wins_and_bad_values_fail() {
        let mut config = PipelineConfig::default();
        config
            .apply_env(|key| match key {
                "TSNAP_TARGET_TABLE" => Some("a.b.c".into()),
                "BIGQUERY_PROJECT_ID" | "BIGQUERY_DATASET_ID" | "BIGQUERY_TABLE_ID" => {
                    Some("x".into())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(config.output_target, "a.b.c");

        let err = config
            .apply_env(|key| (key == "TSNAP_LOAD_MODE").then(|| "upsert".to_string()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("TSNAP_LOAD_MODE"));
    }

    #[test]
    fn yaml_config_fills_unset_fields_with_defaults() {
        let config: PipelineConfig = serde_yaml::from_str(
            "workspace: Acme\noutput_target: acme.asana.tasks\nload_mode: append\nlist_merge: indexed\n",
        )
        .unwrap();
        assert_eq!(config.load_mode, LoadMode::Append);
        assert_eq!(config.list_merge, ListMergeStrategy::Indexed);
        assert_eq!(config.timestamp_field, "modified_at");
        assert_eq!(config.columns.len(), DEFAULT_TASK_COLUMNS.len());
    }

    #[test]
    fn validation_requires_credentials_and_key_columns() {
        let mut config = PipelineConfig {
            workspace: "Acme".into(),
            output_target: "t".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.access_token = Some("token".into());
        config.validate().unwrap();
        config.identifier_field = "external_id".into();
        assert!(config.validate().is_err());
        config.validate_for_extract().unwrap();
        config.output_target.clear();
        config.validate_for_extract().unwrap();
        config.access_token = None;
        assert!(config.validate_for_extract().is_err());
    }

    #[test]
    fn api_requests_are_rate_limited_by_default() {
        let mut config = PipelineConfig {
            access_token: Some("token".into()),
            ..Default::default()
        };
        let http = config.http_client_config();
        assert_eq!(http.bearer_token.as_deref(), Some("token"));
        let bucket = http.token_bucket.unwrap();
        assert_eq!(bucket.capacity, 15);
        assert_eq!(bucket.refill_every, Duration::from_millis(400));

        config.requests_per_minute = 1;
        let bucket = config.http_client_config().token_bucket.unwrap();
        assert_eq!(bucket.capacity, 1);
        assert_eq!(bucket.refill_every, Duration::from_secs(60));

        config
            .apply_env(|key| (key == "TSNAP_REQUESTS_PER_MINUTE").then(|| "0".to_string()))
            .unwrap();
        assert!(config.http_client_config().token_bucket.is_none());
    }
}
