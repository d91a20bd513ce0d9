//! Data validator: gap detection, feature-threshold outliers, cross-table
//! consistency, null-ratio and rowcount-drift checks. Advisory only: the
//! report (and optional alert) surfaces issues; nothing re-runs or rolls
//! back because of them.

pub mod checks;

use serde::Serialize;

use crate::db::Db;
use crate::error::Result;

/// Example rows per issue are capped to avoid flooding reports.
pub const EXAMPLES_CAP: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub check: &'static str,
    pub severity: Severity,
    pub table: String,
    pub id: Option<i64>,
    pub message: String,
    pub expected: String,
    pub actual: String,
    /// Capped at [`EXAMPLES_CAP`].
    pub examples: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    pub checked_ids: Vec<i64>,
}

impl ValidationReport {
    pub fn worst_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub fn log(&self) {
        for issue in &self.issues {
            match issue.severity {
                Severity::Critical => tracing::error!(
                    check = issue.check,
                    table = %issue.table,
                    id = issue.id,
                    expected = %issue.expected,
                    actual = %issue.actual,
                    examples = ?issue.examples,
                    "{}",
                    issue.message
                ),
                Severity::Warning => tracing::warn!(
                    check = issue.check,
                    table = %issue.table,
                    id = issue.id,
                    expected = %issue.expected,
                    actual = %issue.actual,
                    "{}",
                    issue.message
                ),
                Severity::Info => tracing::info!(
                    check = issue.check,
                    table = %issue.table,
                    "{}",
                    issue.message
                ),
            }
        }
        tracing::info!(
            issues = self.issues.len(),
            worst = self.worst_severity().map_or("none", Severity::as_str),
            "validation report complete"
        );
    }
}

pub struct Validator;

impl Validator {
    /// Run all five check families against the given ids.
    pub fn run(db: &Db, ids: &[i64]) -> Result<ValidationReport> {
        let mut report = ValidationReport {
            issues: Vec::new(),
            checked_ids: ids.to_vec(),
        };
        let conn = db.conn();
        for &id in ids {
            checks::gap_check(conn, id, &mut report)?;
            checks::outlier_check(conn, id, &mut report)?;
            checks::ema_bounds_check(conn, id, &mut report)?;
            checks::consistency_check(conn, id, &mut report)?;
        }
        checks::null_ratio_check(conn, &mut report)?;
        checks::rowcount_check(conn, &mut report)?;
        Ok(report)
    }
}
