//! EMA refresh lifecycle, shared by all six variants: load state, determine
//! the dirty window, fan out per-id workers (each with an isolated
//! connection), write under UPSERT, then advance the watermark. One id's
//! failure never stops the others.

use std::time::Instant;

use chrono::{Days, NaiveDate};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rusqlite::{params, Connection};

use crate::db::dims::{self, Timeframe};
use crate::db::state::{self, StateKey, Watermark};
use crate::db::Db;
use crate::ema::variants::{
    compute_bar_space, compute_calendar, compute_daily_space, BarClose, EmaPoint, EmaVariantKind,
};
use crate::error::Result;
use crate::run::{CancelToken, RefreshMode, RefreshParams, RunStatus, RunSummary};

pub struct EmaRefresher {
    variant: EmaVariantKind,
    periods: Vec<u32>,
    buffer_frac: f64,
    cancel: CancelToken,
}

impl EmaRefresher {
    pub fn new(
        variant: EmaVariantKind,
        periods: Vec<u32>,
        buffer_frac: f64,
        cancel: CancelToken,
    ) -> Self {
        Self {
            variant,
            periods,
            buffer_frac,
            cancel,
        }
    }

    pub fn refresh(&self, db: &Db, params: &RefreshParams) -> Result<Vec<RunSummary>> {
        let tfs = self.variant.timeframes(&dims::load_timeframes(db.conn())?);
        let ids = if params.ids.is_empty() {
            list_bar_ids(db.conn(), self.variant.source_table())?
        } else {
            params.ids.clone()
        };
        if tfs.is_empty() || ids.is_empty() {
            return Ok(Vec::new());
        }

        let bar = progress_bar(self.variant.component(), ids.len());
        let path = db.path().to_path_buf();
        let summaries: Vec<RunSummary> = ids
            .par_iter()
            .map(|&id| {
                let started = Instant::now();
                if self.cancel.is_cancelled() {
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
                    .and_then(|mut worker| self.refresh_id(worker.conn_mut(), id, &tfs, params));
                bar.inc(1);
                match result {
                    Ok(summary) => summary,
                    Err(e) => RunSummary::failed(id, started.elapsed(), e.to_string()),
                }
            })
            .collect();
        bar.finish_and_clear();

        for s in &summaries {
            s.log(self.variant.component());
        }
        Ok(summaries)
    }

    fn refresh_id(
        &self,
        conn: &mut Connection,
        id: i64,
        tfs: &[Timeframe],
        params: &RefreshParams,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let mut rows_read = 0;
        let mut rows_written = 0;
        let mut any_new = false;

        for tf in tfs {
            self.cancel.check()?;
            let (read, written) = self.refresh_id_tf(conn, id, tf, params)?;
            rows_read += read;
            rows_written += written;
            any_new |= read > 0;
        }

        Ok(RunSummary {
            id,
            rows_read,
            rows_rejected: 0,
            rows_written,
            duration: started.elapsed(),
            status: if any_new {
                RunStatus::Ok
            } else {
                RunStatus::NoNewData
            },
            error: None,
        })
    }

    fn refresh_id_tf(
        &self,
        conn: &mut Connection,
        id: i64,
        tf: &Timeframe,
        params: &RefreshParams,
    ) -> Result<(usize, usize)> {
        let component = self.variant.component();
        let full = params.mode == RefreshMode::Full;

        let (src_min, src_max) = source_bounds(conn, self.variant, id, &tf.tf)?;
        let (Some(src_min), Some(src_max)) = (src_min, src_max) else {
            return Ok((0, 0));
        };

        // Per-period watermarks share one dirty window.
        let mut marks = Vec::with_capacity(self.periods.len());
        for &p in &self.periods {
            let key = StateKey::with_period(component, id, &tf.tf, p);
            marks.push(if full { None } else { state::load(conn, key)? });
        }

        let warm = marks.iter().all(Option::is_some);
        let min_last_close = marks
            .iter()
            .filter_map(|m| m.as_ref().and_then(|w| w.last_time_close))
            .min();
        let min_seen = marks
            .iter()
            .filter_map(|m| m.as_ref().and_then(|w| w.daily_min_seen))
            .min();
        let max_seen = marks
            .iter()
            .filter_map(|m| m.as_ref().and_then(|w| w.daily_max_seen))
            .min();

        let backfill = min_seen.is_some_and(|m| src_min < m);
        if warm && !backfill {
            if let Some(max_seen) = max_seen {
                if src_max <= max_seen {
                    return Ok((0, 0));
                }
            }
        }

        let dirty_start = if warm && !backfill {
            let base = match (min_last_close, min_seen) {
                (Some(close), Some(seen)) => close.max(seen),
                (Some(close), None) => close,
                (None, Some(seen)) => seen,
                (None, None) => src_min,
            };
            let max_period = self.periods.iter().copied().max().unwrap_or(1);
            let span = u64::from(max_period) * u64::from(tf.span_days());
            let buffer = (span as f64 * self.buffer_frac).ceil() as u64;
            Some(base - Days::new(span + buffer))
        } else {
            if backfill {
                tracing::info!(
                    id,
                    tf = %tf.tf,
                    src_min = %src_min,
                    "source minimum moved earlier, recomputing EMA history"
                );
            }
            None
        };

        let (rows_read, mut points_by_period, max_close) =
            self.compute(conn, id, tf, src_min, dirty_start)?;
        for (period, points) in &mut points_by_period {
            enforce_bounds(points, max_close, id, &tf.tf, *period);
        }

        if params.mode.writes() {
            let tx = conn.transaction()?;
            if dirty_start.is_none() {
                let sql = format!(
                    "DELETE FROM {} WHERE id = ?1 AND tf = ?2",
                    self.variant.table()
                );
                tx.execute(&sql, params![id, tf.tf])?;
            }
            let mut written = 0usize;
            for (period, points) in &points_by_period {
                written += write_points(
                    &tx,
                    self.variant,
                    id,
                    &tf.tf,
                    *period,
                    tf.span_days(),
                    points,
                )?;
                let last_close = points.iter().rev().find(|p| !p.roll).map(|p| p.ts);
                let prior = marks
                    .get(
                        self.periods
                            .iter()
                            .position(|p| p == period)
                            .unwrap_or_default(),
                    )
                    .cloned()
                    .flatten();
                let wm = Watermark {
                    daily_min_seen: Some(src_min),
                    daily_max_seen: Some(src_max),
                    last_time_close: last_close.or(prior.and_then(|w| w.last_time_close)),
                    last_canonical_ts: last_close
                        .or(prior.and_then(|w| w.last_canonical_ts)),
                    last_bar_seq: None,
                };
                state::upsert(
                    &tx,
                    StateKey::with_period(component, id, &tf.tf, *period),
                    &wm,
                )?;
            }
            tx.commit()?;
            Ok((rows_read, written))
        } else {
            let written = points_by_period.iter().map(|(_, p)| p.len()).sum();
            Ok((rows_read, written))
        }
    }

    /// Load the variant's source series and compute points for every period.
    /// Also returns the largest observed close for the bounds check.
    fn compute(
        &self,
        conn: &Connection,
        id: i64,
        tf: &Timeframe,
        data_start: NaiveDate,
        dirty_start: Option<NaiveDate>,
    ) -> Result<(usize, Vec<(u32, Vec<EmaPoint>)>, f64)> {
        match self.variant {
            EmaVariantKind::MultiTf => {
                let bars =
                    load_bar_closes(conn, self.variant.source_table(), id, &tf.tf, dirty_start)?;
                let max_close = max_abs(bars.iter().map(|b| b.close));
                let points = self
                    .periods
                    .iter()
                    .map(|&p| (p, compute_bar_space(&bars, p)))
                    .collect();
                Ok((bars.len(), points, max_close))
            }
            EmaVariantKind::MultiTfDaily => {
                let days = load_daily_closes(conn, id, dirty_start)?;
                let max_close = max_abs(days.iter().map(|(_, c)| *c));
                let points = self
                    .periods
                    .iter()
                    .map(|&p| {
                        (
                            p,
                            compute_daily_space(&days, data_start, p, tf.span_days()),
                        )
                    })
                    .collect();
                Ok((days.len(), points, max_close))
            }
            EmaVariantKind::CalUs
            | EmaVariantKind::CalIso
            | EmaVariantKind::CalAnchorUs
            | EmaVariantKind::CalAnchorIso => {
                let days = load_daily_closes(conn, id, dirty_start)?;
                let bars =
                    load_bar_closes(conn, self.variant.source_table(), id, &tf.tf, dirty_start)?;
                let max_close = max_abs(days.iter().map(|(_, c)| *c));
                let propagate = self.variant.propagates_bar_ema();
                let effective = tf.span_days();
                let points = self
                    .periods
                    .iter()
                    .map(|&p| (p, compute_calendar(&days, &bars, p, effective, propagate)))
                    .collect();
                Ok((days.len() + bars.len(), points, max_close))
            }
        }
    }
}

fn max_abs(values: impl Iterator<Item = f64>) -> f64 {
    values.map(f64::abs).fold(0.0, f64::max)
}

/// Hybrid bounds invariant: an EMA must be finite and within ±10× the
/// largest close observed in its source window. Violating points are dropped
/// with a warning; they indicate a smoothing bug, not bad data.
fn enforce_bounds(points: &mut Vec<EmaPoint>, max_close: f64, id: i64, tf: &str, period: u32) {
    let bound = 10.0 * max_close;
    let before = points.len();
    points.retain(|p| p.ema.is_finite() && (max_close == 0.0 || p.ema.abs() <= bound));
    let dropped = before - points.len();
    if dropped > 0 {
        tracing::warn!(id, tf, period, dropped, "EMA points outside hybrid bounds dropped");
    }
}

fn list_bar_ids(conn: &Connection, table: &str) -> Result<Vec<i64>> {
    let sql = format!("SELECT DISTINCT id FROM {table} ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([], |r| r.get::<_, i64>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Min/max of the source series in daily terms: bar close timestamps for the
/// bar-space variant, daily bar timestamps otherwise.
fn source_bounds(
    conn: &Connection,
    variant: EmaVariantKind,
    id: i64,
    tf: &str,
) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
    let bounds = match variant {
        EmaVariantKind::MultiTf => conn.query_row(
            "SELECT MIN(time_close_bar), MAX(time_close_bar)
             FROM cmc_price_bars_multi_tf WHERE id = ?1 AND tf = ?2",
            params![id, tf],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?,
        _ => conn.query_row(
            "SELECT MIN(ts), MAX(ts) FROM cmc_price_bars_1d WHERE id = ?1 AND tf = '1D'",
            params![id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?,
    };
    Ok(bounds)
}

fn load_daily_closes(
    conn: &Connection,
    id: i64,
    from: Option<NaiveDate>,
) -> Result<Vec<(NaiveDate, f64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, close FROM cmc_price_bars_1d
         WHERE id = ?1 AND tf = '1D' AND (?2 IS NULL OR ts >= ?2)
         ORDER BY ts",
    )?;
    let rows = stmt
        .query_map(params![id, from], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_bar_closes(
    conn: &Connection,
    table: &str,
    id: i64,
    tf: &str,
    from: Option<NaiveDate>,
) -> Result<Vec<BarClose>> {
    let sql = format!(
        "SELECT time_close_bar, close, is_partial_end FROM {table}
         WHERE id = ?1 AND tf = ?2 AND (?3 IS NULL OR time_close_bar >= ?3)
         ORDER BY ts"
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw: Vec<(NaiveDate, f64, bool)> = stmt
        .query_map(params![id, tf, from], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let n = raw.len();
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(i, (close_ts, close, partial))| BarClose {
            close_ts,
            close,
            // every bar but the tail is complete; the tail is complete only
            // when its window span is filled
            closed: i + 1 < n || !partial,
        })
        .collect())
}

fn write_points(
    conn: &Connection,
    variant: EmaVariantKind,
    id: i64,
    tf: &str,
    period: u32,
    tf_days: u32,
    points: &[EmaPoint],
) -> Result<usize> {
    let ingested_at = crate::db::now_utc();
    let table = variant.table();
    if variant.has_bar_space() {
        let sql = format!(
            "INSERT OR REPLACE INTO {table}
                 (id, tf, ts, period, ema, ema_bar, roll, roll_bar, tf_days,
                  d1, d2, d1_roll, d2_roll, d1_bar, d2_bar, d1_roll_bar, d2_roll_bar,
                  alignment_source, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        for p in points {
            stmt.execute(params![
                id,
                tf,
                p.ts,
                period,
                p.ema,
                p.ema_bar,
                p.roll,
                p.roll_bar,
                tf_days,
                p.d1,
                p.d2,
                p.d1_roll,
                p.d2_roll,
                p.d1_bar,
                p.d2_bar,
                p.d1_roll_bar,
                p.d2_roll_bar,
                variant.component(),
                ingested_at,
            ])?;
        }
    } else {
        let sql = format!(
            "INSERT OR REPLACE INTO {table}
                 (id, tf, ts, period, ema, roll, tf_days, d1, d2, d1_roll, d2_roll,
                  alignment_source, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        for p in points {
            stmt.execute(params![
                id,
                tf,
                p.ts,
                period,
                p.ema,
                p.roll,
                tf_days,
                p.d1,
                p.d2,
                p.d1_roll,
                p.d2_roll,
                variant.component(),
                ingested_at,
            ])?;
        }
    }
    Ok(points.len())
}

fn progress_bar(component: &str, n: usize) -> ProgressBar {
    let bar = ProgressBar::new(n as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(component.to_string());
    bar
}
