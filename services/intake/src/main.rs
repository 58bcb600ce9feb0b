//! Intake Service - Loads the land and maritime price files into Postgres
//!
//! Responsibilities:
//! - Read both files and normalize them into one dataset (fail fast on bad cells)
//! - Erase the previous load (stations and prices only with --check-existing)
//! - Batch-load every table in dependency order
//! - Record the run in job_runs

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use eess_core::loader::{erase_for, load_dataset};
use eess_core::schema::{create_job_run, ensure_schema, finish_job_run};
use eess_core::source::{read_source, SourceFile};
use eess_core::telemetry::init_tracing;
use eess_core::{ColumnLayout, Dataset, LoadMode, StationKind};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "intake", about = "Normalizes fuel price files and loads them into Postgres")]
struct Args {
    /// Land stations file (CSV or spreadsheet)
    #[arg(long, default_value = "preciosEstacionesTerrestres.csv")]
    land: PathBuf,

    /// Maritime stations file (CSV or spreadsheet)
    #[arg(long, default_value = "preciosEstacionesMaritimas.csv")]
    maritime: PathBuf,

    /// JSON column layout replacing the built-in land layout
    #[arg(long)]
    land_layout: Option<PathBuf>,

    /// JSON column layout replacing the built-in maritime layout
    #[arg(long)]
    maritime_layout: Option<PathBuf>,

    /// Normalize only - don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Keep stored dimension rows and skip candidates already stored by name
    #[arg(long, default_value = "false")]
    check_existing: bool,

    /// Apply db/schema.sql before loading
    #[arg(long, default_value = "false")]
    create_schema: bool,
}

fn layout(kind: StationKind, path: Option<&Path>) -> Result<ColumnLayout> {
    match path {
        Some(path) => ColumnLayout::from_json_file(path, kind)
            .with_context(|| format!("Failed to load {} layout", kind)),
        None => Ok(ColumnLayout::for_kind(kind)),
    }
}

/// Read and normalize both files into one dataset.
fn normalize(args: &Args) -> Result<(Dataset, Vec<SourceFile>)> {
    let processed_at = Local::now().naive_local();
    let mut dataset = Dataset::new();
    let mut files = Vec::new();

    for (kind, path, layout_path) in [
        (StationKind::Land, &args.land, args.land_layout.as_deref()),
        (StationKind::Maritime, &args.maritime, args.maritime_layout.as_deref()),
    ] {
        let layout = layout(kind, layout_path)?;
        let file = read_source(path).with_context(|| format!("Failed to read {}", path.display()))?;
        dataset
            .ingest(&file.table, &layout, processed_at)
            .with_context(|| format!("Failed to normalize {}", path.display()))?;
        files.push(file);
    }

    Ok((dataset, files))
}

fn file_detail(files: &[SourceFile]) -> serde_json::Value {
    json!({
        "files": files
            .iter()
            .map(|f| json!({
                "path": f.path.display().to_string(),
                "content_hash": f.content_hash,
                "size_bytes": f.size_bytes,
            }))
            .collect::<Vec<_>>()
    })
}

async fn load(pool: &PgPool, dataset: &Dataset, mode: LoadMode) -> Result<serde_json::Value> {
    erase_for(pool, mode)
        .await
        .context("Failed to erase previous load")?;
    let reports = load_dataset(pool, dataset, mode)
        .await
        .context("Failed to load dataset")?;
    Ok(json!({ "tables": reports }))
}

async fn run(pool: &PgPool, args: &Args, dataset: &Dataset, files: &[SourceFile]) -> Result<()> {
    if args.create_schema {
        ensure_schema(pool).await.context("Failed to create schema")?;
        info!("schema ready");
    }

    let mode = if args.check_existing {
        LoadMode::CheckExisting
    } else {
        LoadMode::Fast
    };

    let job_run_id = create_job_run(pool, "intake", file_detail(files)).await?;
    let result = load(pool, dataset, mode).await;

    match &result {
        Ok(detail) => finish_job_run(pool, job_run_id, "ok", None, detail.clone()).await?,
        Err(e) => {
            let message = format!("{:#}", e);
            finish_job_run(pool, job_run_id, "failed", Some(&message), json!({})).await?
        }
    }

    result.map(|_| ())
}

/// Normalize, then load unless this is a dry run.
async fn execute(args: &Args) -> Result<()> {
    let mode = if args.dry_run { "dry-run" } else { "live" };
    info!(
        land = %args.land.display(),
        maritime = %args.maritime.display(),
        mode,
        "starting intake"
    );

    let db_url = if args.dry_run {
        None
    } else {
        Some(std::env::var("DB_URL").context("DB_URL env var missing")?)
    };

    let (dataset, files) = normalize(args)?;
    let registry = &dataset.registry;
    info!(
        provinces = registry.provinces.len(),
        municipalities = registry.municipalities.len(),
        localities = registry.localities.len(),
        fuels = registry.fuels.len(),
        operators = registry.operators.len(),
        sale_types = registry.sale_types.len(),
        stations = dataset.stations.len(),
        prices = dataset.prices.len(),
        "normalized dataset"
    );

    let Some(db_url) = db_url else {
        info!("dry run - nothing written");
        return Ok(());
    };

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let result = run(&pool, args, &dataset, &files).await;
    pool.close().await;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let result = execute(&args).await;
    match &result {
        Ok(()) => info!("intake complete"),
        Err(e) => error!(error = %format!("{:#}", e), "intake failed"),
    }
    result
}
