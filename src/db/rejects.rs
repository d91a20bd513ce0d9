//! Append-only audit log of rows that violated bar invariants. Originals are
//! preserved verbatim together with the violation kind and the repair the
//! contract decided on, so every reject has a trail.

use chrono::NaiveDate;
use rusqlite::{params, Connection};

use crate::db::now_utc;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RejectRow {
    pub bar_table: String,
    pub id: i64,
    pub tf: String,
    pub ts: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub violation_type: String,
    pub repair_action: String,
}

pub fn append(conn: &Connection, rows: &[RejectRow]) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let rejected_at = now_utc();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO cmc_bar_rejects
             (bar_table, id, tf, ts, open, high, low, close, volume,
              violation_type, repair_action, rejected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.bar_table,
            row.id,
            row.tf,
            row.ts,
            row.open,
            row.high,
            row.low,
            row.close,
            row.volume,
            row.violation_type,
            row.repair_action,
            rejected_at,
        ])?;
    }
    Ok(rows.len())
}

pub fn count_for(conn: &Connection, bar_table: &str, id: i64) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM cmc_bar_rejects WHERE bar_table = ?1 AND id = ?2",
        params![bar_table, id],
        |r| r.get(0),
    )?;
    Ok(n)
}

/// Per-violation-kind breakdown, surfaced in run summaries when a refresh
/// rejected anything.
pub fn counts_by_reason(
    conn: &Connection,
    bar_table: &str,
    id: i64,
) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT violation_type, COUNT(*) FROM cmc_bar_rejects
         WHERE bar_table = ?1 AND id = ?2
         GROUP BY violation_type ORDER BY violation_type",
    )?;
    let rows = stmt
        .query_map(params![bar_table, id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
