//! Exporter Service - Publishes the loaded stations to the search index
//!
//! Responsibilities:
//! - Rebuild one document per station (with its prices) from the store
//! - Write them as bulk NDJSON
//! - Upload the index mapping, then the bulk file
//! - Write the hand-authored sample document to the document endpoint

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eess_core::export::{
    fetch_station_documents, sample_document, search_base_url, write_bulk, INDEX_NAME,
};
use eess_core::telemetry::init_tracing;
use eess_core::EtlError;
use reqwest::header::CONTENT_TYPE;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "exporter", about = "Exports stations to the search index")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export every station as bulk NDJSON and upload it
    Bulk {
        /// Bulk file to write
        #[arg(long, default_value = "estaciones.json")]
        output: PathBuf,

        /// Index mapping uploaded before the bulk file
        #[arg(long, default_value = "config/estacionesMapping.json")]
        mapping: PathBuf,

        /// Don't (re)create the index mapping
        #[arg(long, default_value = "false")]
        skip_mapping: bool,

        /// Write the bulk file only
        #[arg(long, default_value = "false")]
        skip_upload: bool,
    },
    /// Write the example station document
    SampleDocument {
        #[arg(long, default_value = INDEX_NAME)]
        index: String,
    },
}

struct Config {
    search_url: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        let search_url = search_base_url(|var| std::env::var(var).ok())
            .context("Search endpoint not configured")?;
        Ok(Self { search_url })
    }
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .user_agent("eess-exporter/0.1")
        .build()?)
}

/// Send `body` and fail on any non-2xx status. Returns the response body.
async fn send(request: reqwest::RequestBuilder, label: &str, body: String) -> Result<String> {
    let resp = request
        .body(body)
        .send()
        .await
        .with_context(|| format!("{} request failed", label))?;
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(EtlError::Http(format!("{} returned {}: {}", label, status, text)).into());
    }
    Ok(text)
}

fn write_bulk_file(path: &Path, documents: &[eess_core::export::StationDocument]) -> Result<usize> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let written = write_bulk(&mut writer, INDEX_NAME, documents)?;
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(written)
}

async fn upload_mapping(client: &reqwest::Client, config: &Config, mapping: &Path) -> Result<()> {
    let body = tokio::fs::read_to_string(mapping)
        .await
        .with_context(|| format!("Failed to read mapping {}", mapping.display()))?;
    let url = format!("{}/{}", config.search_url, INDEX_NAME);
    send(
        client.put(&url).header(CONTENT_TYPE, "application/json"),
        "mapping upload",
        body,
    )
    .await?;
    info!(index = INDEX_NAME, "index mapping uploaded");
    Ok(())
}

async fn upload_bulk(client: &reqwest::Client, config: &Config, path: &Path) -> Result<()> {
    let body = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let url = format!("{}/_bulk", config.search_url);
    let response = send(
        client.put(&url).header(CONTENT_TYPE, "application/x-ndjson"),
        "bulk upload",
        body,
    )
    .await?;

    // The bulk endpoint answers 200 even when single items fail
    let parsed: serde_json::Value = serde_json::from_str(&response).unwrap_or_default();
    if parsed.get("errors").and_then(|v| v.as_bool()) == Some(true) {
        warn!("bulk upload finished with item errors");
    } else {
        info!("bulk upload accepted");
    }
    Ok(())
}

async fn export_bulk(
    config: &Config,
    output: &Path,
    mapping: &Path,
    skip_mapping: bool,
    skip_upload: bool,
) -> Result<()> {
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let documents = fetch_station_documents(&pool).await;
    pool.close().await;
    let documents = documents.context("Failed to read stations")?;

    let written = write_bulk_file(output, &documents)?;
    info!(documents = written, path = %output.display(), "bulk file written");

    if skip_upload {
        return Ok(());
    }

    let client = http_client()?;
    if !skip_mapping {
        upload_mapping(&client, config, mapping).await?;
    }
    upload_bulk(&client, config, output).await
}

async fn export_sample(config: &Config, index: &str) -> Result<()> {
    let client = http_client()?;
    let url = format!("{}/{}/_doc", config.search_url, index);
    let body = serde_json::to_string(&sample_document())?;
    send(
        client.post(&url).header(CONTENT_TYPE, "application/json"),
        "sample document",
        body,
    )
    .await?;
    info!(index, "sample document written");
    Ok(())
}

async fn execute(args: &Args) -> Result<()> {
    let config = Config::from_env()?;
    match &args.command {
        Command::Bulk {
            output,
            mapping,
            skip_mapping,
            skip_upload,
        } => export_bulk(&config, output, mapping, *skip_mapping, *skip_upload).await,
        Command::SampleDocument { index } => export_sample(&config, index).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let result = execute(&args).await;
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "export failed");
    }
    result
}
