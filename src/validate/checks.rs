//! The five validator check families.

use std::collections::HashSet;

use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection};

use super::{Severity, ValidationIssue, ValidationReport, EXAMPLES_CAP};
use crate::error::Result;

/// Relative tolerance for the ret_1d reconciliation (0.01%).
const RET_TOLERANCE: f64 = 1e-4;
/// Absolute tolerance for close reconciliation across tables.
const CLOSE_TOLERANCE: f64 = 0.01;
/// Null ratio above this per column is a warning.
const NULL_RATIO_WARN: f64 = 0.10;
/// Rowcount drift beyond this fraction of the baseline is a warning.
const ROWCOUNT_DRIFT_WARN: f64 = 0.05;

const ROWCOUNT_TABLES: &[&str] = &[
    "cmc_price_bars_1d",
    "cmc_price_bars_multi_tf",
    "cmc_emas_multi_tf_daily",
    "cmc_feat_returns",
    "cmc_feat_vol",
    "cmc_feat_ta",
    "cmc_features_daily",
    "cmc_regimes",
];

/// Check 1: expected-vs-actual date schedule per asset. Crypto sessions are
/// continuous, so every calendar day between the observed min and max should
/// have a daily bar.
pub fn gap_check(conn: &Connection, id: i64, report: &mut ValidationReport) -> Result<()> {
    let dates: Vec<NaiveDate> = conn
        .prepare_cached(
            "SELECT ts FROM cmc_price_bars_1d WHERE id = ?1 AND tf = '1D' ORDER BY ts",
        )?
        .query_map(params![id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let (Some(&min), Some(&max)) = (dates.first(), dates.last()) else {
        return Ok(());
    };

    let have: HashSet<NaiveDate> = dates.iter().copied().collect();
    let expected = (max - min).num_days() + 1;
    let actual = dates.len() as i64;
    if actual >= expected {
        return Ok(());
    }

    let mut examples = Vec::new();
    let mut day = min;
    while day <= max && examples.len() < EXAMPLES_CAP {
        if !have.contains(&day) {
            examples.push(day.to_string());
        }
        day = day + Days::new(1);
    }

    report.push(ValidationIssue {
        check: "gap_detection",
        severity: Severity::Warning,
        table: "cmc_price_bars_1d".into(),
        id: Some(id),
        message: format!("missing {} daily bar(s)", expected - actual),
        expected: format!("{expected} rows"),
        actual: format!("{actual} rows"),
        examples,
    });
    Ok(())
}

/// Check 2: feature-specific outlier thresholds, examples capped.
pub fn outlier_check(conn: &Connection, id: i64, report: &mut ValidationReport) -> Result<()> {
    // extreme daily returns
    let rets: Vec<(NaiveDate, f64)> = conn
        .prepare_cached(
            "SELECT ts, ret_1d FROM cmc_feat_returns
             WHERE id = ?1 AND tf = '1D' AND series = 'ema'
               AND ret_1d IS NOT NULL AND ABS(ret_1d) > 0.5
             ORDER BY ts",
        )?
        .query_map(params![id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if !rets.is_empty() {
        report.push(ValidationIssue {
            check: "outliers",
            severity: Severity::Warning,
            table: "cmc_feat_returns".into(),
            id: Some(id),
            message: format!("{} daily return(s) beyond ±50%", rets.len()),
            expected: "|ret_1d| <= 0.5".into(),
            actual: format!("{} rows above threshold", rets.len()),
            examples: rets
                .iter()
                .take(EXAMPLES_CAP)
                .map(|(ts, r)| format!("{ts}: {r:.4}"))
                .collect(),
        });
    }

    // annualised volatility beyond 500%
    let vols: Vec<(NaiveDate, f64)> = conn
        .prepare_cached(
            "SELECT ts, park_20 FROM cmc_feat_vol
             WHERE id = ?1 AND tf = '1D' AND park_20 IS NOT NULL AND park_20 > 5.0
             ORDER BY ts",
        )?
        .query_map(params![id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if !vols.is_empty() {
        report.push(ValidationIssue {
            check: "outliers",
            severity: Severity::Warning,
            table: "cmc_feat_vol".into(),
            id: Some(id),
            message: format!("{} row(s) with annualised vol above 500%", vols.len()),
            expected: "park_20 <= 5.0".into(),
            actual: format!("{} rows above threshold", vols.len()),
            examples: vols
                .iter()
                .take(EXAMPLES_CAP)
                .map(|(ts, v)| format!("{ts}: {v:.4}"))
                .collect(),
        });
    }

    // RSI out of [0,100]: a computation bug, critical
    let rsis: Vec<(NaiveDate, f64)> = conn
        .prepare_cached(
            "SELECT ts, rsi_14 FROM cmc_feat_ta
             WHERE id = ?1 AND tf = '1D' AND rsi_14 IS NOT NULL
               AND (rsi_14 < 0.0 OR rsi_14 > 100.0)
             ORDER BY ts",
        )?
        .query_map(params![id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if !rsis.is_empty() {
        report.push(ValidationIssue {
            check: "outliers",
            severity: Severity::Critical,
            table: "cmc_feat_ta".into(),
            id: Some(id),
            message: "RSI outside [0,100] indicates an indicator bug".into(),
            expected: "0 <= rsi_14 <= 100".into(),
            actual: format!("{} rows out of bounds", rsis.len()),
            examples: rsis
                .iter()
                .take(EXAMPLES_CAP)
                .map(|(ts, v)| format!("{ts}: {v:.4}"))
                .collect(),
        });
    }
    Ok(())
}

/// Check 2b: EMA sanity. Every stored EMA must be finite (enforced by the
/// NOT NULL REAL column) and within ±10× the largest close observed for the
/// id. Violations are critical: they indicate a smoothing bug upstream.
pub fn ema_bounds_check(conn: &Connection, id: i64, report: &mut ValidationReport) -> Result<()> {
    let max_close: Option<f64> = conn.query_row(
        "SELECT MAX(ABS(close)) FROM cmc_price_bars_1d WHERE id = ?1 AND tf = '1D'",
        params![id],
        |r| r.get(0),
    )?;
    let Some(max_close) = max_close else {
        return Ok(());
    };
    let bound = 10.0 * max_close;
    for table in ["cmc_emas_multi_tf", "cmc_emas_multi_tf_daily"] {
        let sql = format!(
            "SELECT ts, tf, period, ema FROM {table}
             WHERE id = ?1 AND ABS(ema) > ?2 ORDER BY ts"
        );
        let bad: Vec<(NaiveDate, String, i64, f64)> = conn
            .prepare(&sql)?
            .query_map(params![id, bound], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if !bad.is_empty() {
            report.push(ValidationIssue {
                check: "outliers",
                severity: Severity::Critical,
                table: table.to_string(),
                id: Some(id),
                message: "EMA outside the hybrid close bound".into(),
                expected: format!("|ema| <= {bound:.4}"),
                actual: format!("{} rows out of bounds", bad.len()),
                examples: bad
                    .iter()
                    .take(EXAMPLES_CAP)
                    .map(|(ts, tf, p, v)| format!("{ts} {tf} p{p}: {v:.4}"))
                    .collect(),
            });
        }
    }
    Ok(())
}

/// Check 3: JOIN-based cross-table reconciliation. `ret_1d` must agree with
/// the close-to-close return within 0.01%, and `close` must be identical
/// across bars/vol/TA within 0.01 absolute. Mismatches are critical.
pub fn consistency_check(conn: &Connection, id: i64, report: &mut ValidationReport) -> Result<()> {
    let rows: Vec<(NaiveDate, Option<f64>, f64)> = conn
        .prepare_cached(
            "SELECT b.ts, r.ret_1d, b.close
             FROM cmc_price_bars_1d b
             LEFT JOIN cmc_feat_returns r
               ON r.id = b.id AND r.ts = b.ts AND r.tf = '1D' AND r.series = 'ema'
             WHERE b.id = ?1 AND b.tf = '1D'
             ORDER BY b.ts",
        )?
        .query_map(params![id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut mismatches = Vec::new();
    for i in 1..rows.len() {
        let (ts, Some(ret), close) = rows[i] else { continue };
        let prev_close = rows[i - 1].2;
        if prev_close == 0.0 {
            continue;
        }
        let recomputed = close / prev_close - 1.0;
        if (ret - recomputed).abs() > RET_TOLERANCE {
            mismatches.push(format!("{ts}: stored {ret:.6} vs recomputed {recomputed:.6}"));
        }
    }
    if !mismatches.is_empty() {
        report.push(ValidationIssue {
            check: "cross_table_consistency",
            severity: Severity::Critical,
            table: "cmc_feat_returns".into(),
            id: Some(id),
            message: "ret_1d disagrees with close-to-close return".into(),
            expected: format!("|delta| <= {RET_TOLERANCE}"),
            actual: format!("{} mismatching rows", mismatches.len()),
            examples: mismatches.into_iter().take(EXAMPLES_CAP).collect(),
        });
    }

    for (other_table, label) in [("cmc_feat_vol", "vol"), ("cmc_feat_ta", "TA")] {
        let sql = format!(
            "SELECT b.ts, b.close, o.close
             FROM cmc_price_bars_1d b
             JOIN {other_table} o ON o.id = b.id AND o.ts = b.ts AND o.tf = '1D'
             WHERE b.id = ?1 AND b.tf = '1D' AND ABS(b.close - o.close) > ?2
             ORDER BY b.ts"
        );
        let bad: Vec<(NaiveDate, f64, f64)> = conn
            .prepare(&sql)?
            .query_map(params![id, CLOSE_TOLERANCE], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if !bad.is_empty() {
            report.push(ValidationIssue {
                check: "cross_table_consistency",
                severity: Severity::Critical,
                table: other_table.to_string(),
                id: Some(id),
                message: format!("close differs between bars and {label} table"),
                expected: format!("|delta| <= {CLOSE_TOLERANCE}"),
                actual: format!("{} mismatching rows", bad.len()),
                examples: bad
                    .iter()
                    .take(EXAMPLES_CAP)
                    .map(|(ts, a, b)| format!("{ts}: {a} vs {b}"))
                    .collect(),
            });
        }
    }
    Ok(())
}

/// Check 4: per-column null ratio over the unified store.
pub fn null_ratio_check(conn: &Connection, report: &mut ValidationReport) -> Result<()> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM cmc_features_daily", [], |r| r.get(0))?;
    if total == 0 {
        return Ok(());
    }
    let cols: Vec<String> = conn
        .prepare("SELECT name FROM pragma_table_info('cmc_features_daily')")?
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for name in cols {
        if matches!(name.as_str(), "id" | "ts" | "ingested_at") {
            continue;
        }
        let non_null: i64 = conn.query_row(
            &format!("SELECT COUNT({name}) FROM cmc_features_daily"),
            [],
            |r| r.get(0),
        )?;
        let ratio = 1.0 - non_null as f64 / total as f64;
        if ratio > NULL_RATIO_WARN {
            report.push(ValidationIssue {
                check: "null_ratio",
                severity: Severity::Warning,
                table: "cmc_features_daily".into(),
                id: None,
                message: format!("column `{name}` is {:.1}% null", ratio * 100.0),
                expected: format!("<= {:.0}% null", NULL_RATIO_WARN * 100.0),
                actual: format!("{:.1}% null", ratio * 100.0),
                examples: Vec::new(),
            });
        }
    }
    Ok(())
}

/// Check 5: rowcount drift against the recorded baseline, then refresh the
/// baseline for the next run.
pub fn rowcount_check(conn: &Connection, report: &mut ValidationReport) -> Result<()> {
    let recorded_at = crate::db::now_utc();
    for table in ROWCOUNT_TABLES {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        let baseline: Option<i64> = conn
            .query_row(
                "SELECT n_rows FROM cmc_rowcount_baseline WHERE table_name = ?1",
                params![table],
                |r| r.get(0),
            )
            .ok();
        if let Some(base) = baseline {
            if base > 0 {
                let drift = (n - base) as f64 / base as f64;
                if drift.abs() > ROWCOUNT_DRIFT_WARN {
                    report.push(ValidationIssue {
                        check: "rowcount_range",
                        severity: Severity::Warning,
                        table: (*table).to_string(),
                        id: None,
                        message: format!("rowcount drifted {:+.1}% from baseline", drift * 100.0),
                        expected: format!("~{base} rows"),
                        actual: format!("{n} rows"),
                        examples: Vec::new(),
                    });
                }
            }
        }
        conn.execute(
            "INSERT OR REPLACE INTO cmc_rowcount_baseline (table_name, n_rows, recorded_at)
             VALUES (?1, ?2, ?3)",
            params![table, n, recorded_at],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn seeded_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(&dir.path().join("t.db")).unwrap();
        (dir, db)
    }

    fn insert_daily_bar(conn: &Connection, id: i64, seq: i64, ts: &str, close: f64) {
        conn.execute(
            "INSERT INTO cmc_price_bars_1d
                 (id, tf, bar_seq, ts, open, high, low, close, volume,
                  time_open_bar, time_close_bar, time_high, time_low, ingested_at)
             VALUES (?1, '1D', ?2, ?3, ?4, ?4, ?4, ?4, 1.0, ?3, ?3, ?3, ?3, 'test')",
            params![id, seq, ts, close],
        )
        .unwrap();
    }

    #[test]
    fn gap_check_reports_missing_day() {
        let (_dir, db) = seeded_db();
        let conn = db.conn();
        // 2025-03-01..05 and 07..10: 2025-03-06 missing
        let mut seq = 0;
        for day in 1..=10 {
            if day == 6 {
                continue;
            }
            seq += 1;
            insert_daily_bar(conn, 1, seq, &format!("2025-03-{day:02}"), 100.0);
        }
        let mut report = ValidationReport::default();
        gap_check(conn, 1, &mut report).unwrap();
        assert_eq!(report.issues.len(), 1);
        let issue = &report.issues[0];
        assert_eq!(issue.severity, Severity::Warning);
        assert_eq!(issue.expected, "10 rows");
        assert_eq!(issue.actual, "9 rows");
        assert_eq!(issue.examples, vec!["2025-03-06".to_string()]);
    }

    #[test]
    fn gap_check_silent_on_contiguous_history() {
        let (_dir, db) = seeded_db();
        let conn = db.conn();
        for day in 1..=5 {
            insert_daily_bar(conn, 1, day, &format!("2025-03-{day:02}"), 100.0);
        }
        let mut report = ValidationReport::default();
        gap_check(conn, 1, &mut report).unwrap();
        assert!(report.issues.is_empty());
    }

    #[test]
    fn consistency_check_flags_bad_ret() {
        let (_dir, db) = seeded_db();
        let conn = db.conn();
        insert_daily_bar(conn, 1, 1, "2025-01-01", 100.0);
        insert_daily_bar(conn, 1, 2, "2025-01-02", 110.0);
        conn.execute(
            "INSERT INTO cmc_feat_returns (id, tf, ts, series, roll, ret_1d, ingested_at)
             VALUES (1, '1D', '2025-01-02', 'ema', 0, 0.5, 'test')",
            [],
        )
        .unwrap();
        let mut report = ValidationReport::default();
        consistency_check(conn, 1, &mut report).unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].severity, Severity::Critical);
    }

    #[test]
    fn rowcount_check_warns_on_shrink_only() {
        let (_dir, db) = seeded_db();
        let conn = db.conn();
        conn.execute(
            "INSERT INTO cmc_rowcount_baseline (table_name, n_rows, recorded_at)
             VALUES ('cmc_price_bars_1d', 100, 'test')",
            [],
        )
        .unwrap();
        let mut report = ValidationReport::default();
        rowcount_check(conn, &mut report).unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| i.check == "rowcount_range" && i.table == "cmc_price_bars_1d"));
    }
}
