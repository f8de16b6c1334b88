use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tsnap_sync::{load_csv_file, LoadMode, ParquetWarehouse, PipelineConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "tsnap")]
#[command(about = "Task snapshot warehouse: extract, reconcile and load workspace tasks")]
struct Cli {
    /// YAML config file (defaults to ./tsnap.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    workspace: Option<String>,
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// Destination table, `project.dataset.table`.
    #[arg(long, global = true)]
    target: Option<String>,
    #[arg(long, global = true)]
    warehouse_dir: Option<PathBuf>,
    /// Read the workspace from a JSON capture instead of the API.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,
    #[arg(long, global = true)]
    load_mode: Option<LoadMode>,
    #[arg(long, global = true)]
    id_field: Option<String>,
    #[arg(long, global = true)]
    ts_field: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract, diff against the stored snapshot and load (default).
    Sync {
        /// Pin the run timestamp (RFC 3339) instead of using the current time.
        #[arg(long)]
        run_timestamp: Option<DateTime<Utc>>,
    },
    /// Extract and write task_details.csv only.
    Extract,
    /// Load a CSV file into a warehouse table.
    Load {
        csv: PathBuf,
        /// Table id; defaults to the configured target.
        #[arg(long)]
        table: Option<String>,
    },
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load(self.config.as_deref())?;
        if let Some(v) = &self.workspace {
            config.workspace = v.clone();
        }
        if let Some(v) = &self.output_dir {
            config.output_dir = v.clone();
        }
        if let Some(v) = &self.target {
            config.output_target = v.clone();
        }
        if let Some(v) = &self.warehouse_dir {
            config.warehouse_root = v.clone();
        }
        if let Some(v) = &self.fixture {
            config.fixture_path = Some(v.clone());
        }
        if let Some(v) = self.load_mode {
            config.load_mode = v;
        }
        if let Some(v) = &self.id_field {
            config.identifier_field = v.clone();
        }
        if let Some(v) = &self.ts_field {
            config.timestamp_field = v.clone();
        }
        Ok(config)
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = cli.pipeline_config()?;
    info!(?config, "configuration loaded");

    match cli.command.unwrap_or(Commands::Sync { run_timestamp: None }) {
        Commands::Sync { run_timestamp } => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_at(run_timestamp.unwrap_or_else(Utc::now)).await?;
            let counts = summary
                .status_counts
                .iter()
                .map(|(status, n)| format!("{status}={n}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "sync complete: run_id={} tasks={} {} loaded={} total={} table={} reports={}",
                summary.run_id,
                summary.extracted_tasks,
                counts,
                summary.load.rows_loaded,
                summary.load.total_rows,
                summary.load.table_id,
                summary.reports_dir
            );
        }
        Commands::Extract => {
            let pipeline = SyncPipeline::new(config)?;
            let snapshot = pipeline.extract_snapshot(Utc::now()).await?;
            println!(
                "extract complete: teams={} projects={} tasks={} csv={}",
                snapshot.teams,
                snapshot.projects,
                snapshot.table.len(),
                snapshot.csv_path.display()
            );
        }
        Commands::Load { csv, table } => {
            let table_id = table.unwrap_or_else(|| config.output_target.clone());
            anyhow::ensure!(!table_id.is_empty(), "no table given and no target configured");
            let warehouse = ParquetWarehouse::new(config.warehouse_root.clone());
            let stats = load_csv_file(&warehouse, &csv, &table_id, config.load_mode).await?;
            println!(
                "load complete: table={} mode={} rows={} total={} columns={}",
                stats.table_id, stats.mode, stats.rows_loaded, stats.total_rows, stats.columns
            );
        }
    }

    Ok(())
}
