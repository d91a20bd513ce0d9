//! Optional alert transport for validator reports. When no endpoint is
//! configured, issues are logged and nothing else happens; a dead endpoint
//! degrades the same way.

use std::time::Duration;

use crate::validate::ValidationReport;

/// POST the report as JSON to the webhook, or fall back to log-only.
pub fn dispatch(alert_url: Option<&str>, report: &ValidationReport) {
    report.log();
    let Some(url) = alert_url else {
        return;
    };
    if report.issues.is_empty() {
        return;
    }
    match post_report(url, report) {
        Ok(()) => tracing::info!(url, issues = report.issues.len(), "validation alert sent"),
        Err(e) => tracing::warn!(url, error = %e, "alert transport failed, report logged only"),
    }
}

fn post_report(url: &str, report: &ValidationReport) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let response = client.post(url).json(report).send()?;
    if !response.status().is_success() {
        anyhow::bail!("alert endpoint returned {}", response.status());
    }
    Ok(())
}
