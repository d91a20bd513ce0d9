//! Feature computers over bars and EMAs: returns, volatility estimators,
//! technical indicators, and the unified daily store.

pub mod base;
pub mod indicators;
pub mod returns;
pub mod unified;
pub mod volatility;

use std::time::Instant;

use chrono::NaiveDate;
use rayon::prelude::*;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::state::{self, StateKey, Watermark};
use crate::db::{dims, Db};
use crate::error::Result;
use crate::run::{CancelToken, RefreshMode, RefreshParams, RunStatus, RunSummary};

/// Per-id outcome returned by a feature worker.
pub(crate) struct FeatureOutcome {
    pub rows_read: usize,
    pub rows_written: usize,
    pub status: RunStatus,
}

impl FeatureOutcome {
    pub fn no_new_data() -> Self {
        Self {
            rows_read: 0,
            rows_written: 0,
            status: RunStatus::NoNewData,
        }
    }
}

/// Fan a feature refresh out over ids with the shared worker conventions:
/// one connection per worker, cancellation between ids, per-id failures
/// recorded without stopping the rest.
pub(crate) fn fan_out<F>(
    db: &Db,
    component: &str,
    params: &RefreshParams,
    cancel: &CancelToken,
    per_id: F,
) -> Result<Vec<RunSummary>>
where
    F: Fn(&mut Connection, i64) -> Result<FeatureOutcome> + Sync,
{
    let ids = if params.ids.is_empty() {
        dims::list_source_ids(db.conn())?
    } else {
        params.ids.clone()
    };
    let path = db.path().to_path_buf();
    let summaries: Vec<RunSummary> = ids
        .par_iter()
        .map(|&id| {
            let started = Instant::now();
            if cancel.is_cancelled() {
                return RunSummary {
                    id,
                    rows_read: 0,
                    rows_rejected: 0,
                    rows_written: 0,
                    duration: started.elapsed(),
                    status: RunStatus::Skipped,
                    error: None,
                };
            }
            let result = Db::open_worker(&path)
                .and_then(|mut worker| per_id(worker.conn_mut(), id));
            match result {
                Ok(out) => RunSummary {
                    id,
                    rows_read: out.rows_read,
                    rows_rejected: 0,
                    rows_written: out.rows_written,
                    duration: started.elapsed(),
                    status: out.status,
                    error: None,
                },
                Err(e) => RunSummary::failed(id, started.elapsed(), e.to_string()),
            }
        })
        .collect();

    for s in &summaries {
        s.log(component);
    }
    Ok(summaries)
}

/// Daily source bounds for an id, read from the 1d bar table.
pub(crate) fn daily_bounds(
    conn: &Connection,
    id: i64,
) -> Result<Option<(NaiveDate, NaiveDate)>> {
    let bounds = conn
        .query_row(
            "SELECT MIN(ts), MAX(ts) FROM cmc_price_bars_1d WHERE id = ?1 AND tf = '1D'",
            params![id],
            |r| {
                Ok((
                    r.get::<_, Option<NaiveDate>>(0)?,
                    r.get::<_, Option<NaiveDate>>(1)?,
                ))
            },
        )
        .optional()?;
    Ok(match bounds {
        Some((Some(min), Some(max))) => Some((min, max)),
        _ => None,
    })
}

/// True when the watermark already covers the source window (and the source
/// minimum has not moved earlier), so the refresh can skip outright.
pub(crate) fn covered(
    conn: &Connection,
    component: &str,
    id: i64,
    tf: &str,
    src_min: NaiveDate,
    src_max: NaiveDate,
    mode: RefreshMode,
) -> Result<bool> {
    if mode != RefreshMode::Incremental {
        return Ok(false);
    }
    let wm = state::load(conn, StateKey::new(component, id, tf))?;
    Ok(wm.is_some_and(|w| {
        !w.is_backfill(src_min) && w.daily_max_seen.is_some_and(|max| src_max <= max)
    }))
}

pub(crate) fn advance_watermark(
    conn: &Connection,
    component: &str,
    id: i64,
    tf: &str,
    src_min: NaiveDate,
    src_max: NaiveDate,
) -> Result<()> {
    state::upsert(
        conn,
        StateKey::new(component, id, tf),
        &Watermark {
            daily_min_seen: Some(src_min),
            daily_max_seen: Some(src_max),
            last_time_close: Some(src_max),
            last_canonical_ts: Some(src_max),
            last_bar_seq: None,
        },
    )
}

/// Daily OHLCV rows for an id from the 1d bar table, ts ascending.
pub(crate) struct DailyRows {
    pub ts: Vec<NaiveDate>,
    pub open: Vec<Option<f64>>,
    pub high: Vec<Option<f64>>,
    pub low: Vec<Option<f64>>,
    pub close: Vec<Option<f64>>,
    pub volume: Vec<Option<f64>>,
}

pub(crate) fn load_daily_rows(conn: &Connection, id: i64) -> Result<DailyRows> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, open, high, low, close, volume
         FROM cmc_price_bars_1d WHERE id = ?1 AND tf = '1D' ORDER BY ts",
    )?;
    let mut rows = DailyRows {
        ts: Vec::new(),
        open: Vec::new(),
        high: Vec::new(),
        low: Vec::new(),
        close: Vec::new(),
        volume: Vec::new(),
    };
    let iter = stmt.query_map(params![id], |r| {
        Ok((
            r.get::<_, NaiveDate>(0)?,
            r.get::<_, Option<f64>>(1)?,
            r.get::<_, Option<f64>>(2)?,
            r.get::<_, Option<f64>>(3)?,
            r.get::<_, Option<f64>>(4)?,
            r.get::<_, Option<f64>>(5)?,
        ))
    })?;
    for row in iter {
        let (ts, open, high, low, close, volume) = row?;
        rows.ts.push(ts);
        rows.open.push(open);
        rows.high.push(high);
        rows.low.push(low);
        rows.close.push(close);
        rows.volume.push(volume);
    }
    Ok(rows)
}
