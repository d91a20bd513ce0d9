use std::path::PathBuf;

/// Error taxonomy for the pipeline. Recoverable contract outcomes (OHLC
/// violations, backfill detection) are *not* errors; the contract layer
/// returns structured results for those. This enum covers the cases that
/// actually abort a task.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] Box<refinery::Error>),

    #[error("transient IO retries exhausted after {attempts} attempts: {source}")]
    TransientIo {
        attempts: u32,
        source: rusqlite::Error,
    },

    #[error("dataframe error: {0}")]
    Frame(#[from] polars::error::PolarsError),

    #[error("source row for id {id} at {ts} is missing required field `{field}`")]
    NullRequired { id: i64, ts: String, field: String },

    #[error("config: {0}")]
    Config(String),

    #[error("config file {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },

    #[error("refresh cancelled")]
    Cancelled,

    #[error("unknown timeframe `{0}` (not present in dim_timeframe)")]
    UnknownTimeframe(String),

    #[error("{0}")]
    Task(String),
}

impl From<refinery::Error> for PipelineError {
    fn from(e: refinery::Error) -> Self {
        PipelineError::Migration(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
