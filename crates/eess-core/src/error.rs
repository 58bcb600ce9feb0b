//! Error taxonomy shared by every ETL stage.
//!
//! Nothing here is recovered locally: each variant aborts the run that raised it.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("line {line}: invalid number '{value}' in column '{column}'")]
    InvalidNumber {
        line: usize,
        column: &'static str,
        value: String,
    },

    #[error("line {line}: invalid date '{value}' (expected dd/mm/yyyy hh:mm)")]
    InvalidDate { line: usize, value: String },

    #[error("line {line}: unknown margin code '{value}'")]
    InvalidMargin { line: usize, value: String },

    #[error("unknown station kind '{0}'")]
    InvalidStationKind(String),

    #[error("line {line}: missing column {index} ({column})")]
    MissingColumn {
        line: usize,
        index: usize,
        column: &'static str,
    },

    #[error("layout error: {0}")]
    Layout(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("{table}: '{name}' is stored with id {stored}, this run assigned {candidate}")]
    KeyConflict {
        table: &'static str,
        name: String,
        stored: i32,
        candidate: i32,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EtlError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
