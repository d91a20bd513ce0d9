//! Shared run-lifecycle types: refresh parameters, per-id summaries, and the
//! cooperative cancellation token polled between per-id blocks and between
//! timeframes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Incremental,
    Full,
    DryRun,
}

impl RefreshMode {
    pub fn writes(self) -> bool {
        !matches!(self, RefreshMode::DryRun)
    }
}

/// Common refresh parameters shared by every refresher command.
#[derive(Debug, Clone)]
pub struct RefreshParams {
    /// Restrict to these ids; empty means all known ids.
    pub ids: Vec<i64>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub mode: RefreshMode,
}

impl Default for RefreshParams {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            start: None,
            end: None,
            mode: RefreshMode::Incremental,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    NoNewData,
    Skipped,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::NoNewData => "no_new_data",
            RunStatus::Skipped => "skipped",
            RunStatus::Failed => "failed",
        }
    }
}

/// One summary line per id per refresh, as surfaced to operators.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: i64,
    pub rows_read: usize,
    pub rows_rejected: usize,
    pub rows_written: usize,
    pub duration: Duration,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn failed(id: i64, duration: Duration, error: String) -> Self {
        Self {
            id,
            rows_read: 0,
            rows_rejected: 0,
            rows_written: 0,
            duration,
            status: RunStatus::Failed,
            error: Some(error),
        }
    }

    pub fn log(&self, component: &str) {
        tracing::info!(
            component,
            id = self.id,
            rows_read = self.rows_read,
            rows_rejected = self.rows_rejected,
            rows_written = self.rows_written,
            duration_ms = self.duration.as_millis() as u64,
            status = self.status.as_str(),
            error = self.error.as_deref().unwrap_or(""),
            "refresh summary"
        );
    }
}

/// Returns true when any per-id summary failed (drives the process exit code).
pub fn any_failed(summaries: &[RunSummary]) -> bool {
    summaries.iter().any(|s| s.status == RunStatus::Failed)
}

/// Cooperative cancellation. Workers poll between per-id blocks and between
/// timeframes; in-flight transactions roll back on drop, and the watermark is
/// never advanced for a cancelled task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Poll point: error out of the current task if cancellation was signalled.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
