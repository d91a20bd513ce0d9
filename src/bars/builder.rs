//! Bar builders: six variants producing OHLCV bars under different alignment
//! semantics, sharing one refresh lifecycle.
//!
//! Incremental refresh reloads only the tail (rows after the last closed
//! bar), with an O(1) carry-forward fast path when new rows extend the
//! in-progress bar. Backfill (source rows earlier than the watermark
//! minimum) triggers an atomic delete+rebuild for the affected (id, tf),
//! because `bar_seq` would otherwise shift.

use std::time::Instant;

use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rusqlite::{params, Connection, OptionalExtension};

use crate::bars::contract::{
    self, Bar, OhlcPolicy, PriceRow, SourceRow, ViolationRecord,
};
use crate::bars::windows::{self, Window};
use crate::db::dims::{self, Alignment, BaseUnit, RollPolicy, Scheme, Timeframe};
use crate::db::rejects::RejectRow;
use crate::db::state::{self, StateKey, Watermark};
use crate::db::{self, Db};
use crate::error::{PipelineError, Result};
use crate::run::{CancelToken, RefreshMode, RefreshParams, RunStatus, RunSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarVariantKind {
    Daily,
    MultiTf,
    CalUs,
    CalIso,
    CalAnchorUs,
    CalAnchorIso,
}

#[derive(Debug, Clone, Copy)]
enum WindowRule {
    Rolling { tf_days: u32 },
    Calendar { base: BaseUnit, scheme: Scheme },
    Anchor { base: BaseUnit, scheme: Scheme },
}

impl BarVariantKind {
    pub fn table(self) -> &'static str {
        match self {
            BarVariantKind::Daily => "cmc_price_bars_1d",
            BarVariantKind::MultiTf => "cmc_price_bars_multi_tf",
            BarVariantKind::CalUs => "cmc_price_bars_cal_us",
            BarVariantKind::CalIso => "cmc_price_bars_cal_iso",
            BarVariantKind::CalAnchorUs => "cmc_price_bars_cal_anchor_us",
            BarVariantKind::CalAnchorIso => "cmc_price_bars_cal_anchor_iso",
        }
    }

    pub fn component(self) -> &'static str {
        match self {
            BarVariantKind::Daily => "bars_1d",
            BarVariantKind::MultiTf => "bars_multi_tf",
            BarVariantKind::CalUs => "bars_cal_us",
            BarVariantKind::CalIso => "bars_cal_iso",
            BarVariantKind::CalAnchorUs => "bars_cal_anchor_us",
            BarVariantKind::CalAnchorIso => "bars_cal_anchor_iso",
        }
    }

    /// Daily bars reject violating source rows outright; aggregated variants
    /// clamp-repair and keep the audit trail.
    pub fn policy(self) -> OhlcPolicy {
        match self {
            BarVariantKind::Daily => OhlcPolicy::Reject,
            _ => OhlcPolicy::Clamp,
        }
    }

    /// Select this variant's timeframes from the dimension rows.
    pub fn timeframes(self, all: &[Timeframe]) -> Vec<Timeframe> {
        all.iter()
            .filter(|t| match self {
                BarVariantKind::Daily => {
                    t.alignment == Alignment::TfDay && t.tf_days == Some(1)
                }
                BarVariantKind::MultiTf => {
                    t.alignment == Alignment::TfDay && t.tf_days.is_some_and(|d| d > 1)
                }
                BarVariantKind::CalUs => {
                    t.alignment == Alignment::Calendar
                        && t.roll_policy == RollPolicy::None
                        && t.matches_scheme(Scheme::Us)
                }
                BarVariantKind::CalIso => {
                    t.alignment == Alignment::Calendar
                        && t.roll_policy == RollPolicy::None
                        && t.matches_scheme(Scheme::Iso)
                }
                BarVariantKind::CalAnchorUs => {
                    t.alignment == Alignment::Calendar
                        && t.roll_policy == RollPolicy::CalendarAnchor
                        && t.matches_scheme(Scheme::Us)
                }
                BarVariantKind::CalAnchorIso => {
                    t.alignment == Alignment::Calendar
                        && t.roll_policy == RollPolicy::CalendarAnchor
                        && t.matches_scheme(Scheme::Iso)
                }
            })
            .cloned()
            .collect()
    }

    fn window_rule(self, tf: &Timeframe) -> Result<WindowRule> {
        match self {
            BarVariantKind::Daily | BarVariantKind::MultiTf => {
                let tf_days = tf
                    .tf_days
                    .ok_or_else(|| PipelineError::UnknownTimeframe(tf.tf.clone()))?;
                Ok(WindowRule::Rolling { tf_days })
            }
            BarVariantKind::CalUs => Ok(WindowRule::Calendar {
                base: tf.base_unit,
                scheme: Scheme::Us,
            }),
            BarVariantKind::CalIso => Ok(WindowRule::Calendar {
                base: tf.base_unit,
                scheme: Scheme::Iso,
            }),
            BarVariantKind::CalAnchorUs => Ok(WindowRule::Anchor {
                base: tf.base_unit,
                scheme: Scheme::Us,
            }),
            BarVariantKind::CalAnchorIso => Ok(WindowRule::Anchor {
                base: tf.base_unit,
                scheme: Scheme::Iso,
            }),
        }
    }
}

impl WindowRule {
    fn window_for(self, anchor: NaiveDate, ts: NaiveDate) -> Window {
        match self {
            WindowRule::Rolling { tf_days } => windows::rolling_window(anchor, ts, tf_days),
            WindowRule::Calendar { base, scheme } => windows::calendar_window(ts, base, scheme),
            WindowRule::Anchor { base, scheme } => windows::anchor_window(ts, base, scheme),
        }
    }

    /// Anchor windows reset `bar_seq` at year boundaries.
    fn resets_seq_on_year(self) -> bool {
        matches!(self, WindowRule::Anchor { .. })
    }
}

const RETRY_ATTEMPTS: u32 = 3;

pub struct BarBuilder {
    variant: BarVariantKind,
    cancel: CancelToken,
}

impl BarBuilder {
    pub fn new(variant: BarVariantKind, cancel: CancelToken) -> Self {
        Self { variant, cancel }
    }

    /// Refresh all timeframes of this variant for the requested ids.
    /// Ids run in parallel, each worker on its own connection; one id's
    /// failure never stops the others.
    pub fn refresh(&self, db: &Db, params: &RefreshParams) -> Result<Vec<RunSummary>> {
        let ids = if params.ids.is_empty() {
            dims::list_source_ids(db.conn())?
        } else {
            params.ids.clone()
        };
        let tfs = self.variant.timeframes(&dims::load_timeframes(db.conn())?);
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
                let result = Db::open_worker(&path).and_then(|mut worker| {
                    self.refresh_id(worker.conn_mut(), id, &tfs, params)
                });
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
        let mut rows_rejected = 0;
        let mut rows_written = 0;
        let mut any_new = false;

        for tf in tfs {
            self.cancel.check()?;
            let mut attempt = 0u32;
            let tf_outcome = loop {
                match self.refresh_id_tf(conn, id, tf, params) {
                    Ok(v) => break v,
                    Err(PipelineError::Db(e)) if db::is_transient(&e) => {
                        attempt += 1;
                        if attempt >= RETRY_ATTEMPTS {
                            return Err(PipelineError::TransientIo {
                                attempts: attempt,
                                source: e,
                            });
                        }
                        tracing::warn!(id, tf = %tf.tf, attempt, error = %e, "retrying per-id batch");
                        std::thread::sleep(std::time::Duration::from_millis(100 * u64::from(attempt)));
                    }
                    Err(e) => return Err(e),
                }
            };
            rows_read += tf_outcome.rows_read;
            rows_rejected += tf_outcome.rows_rejected;
            rows_written += tf_outcome.rows_written;
            any_new |= tf_outcome.rows_read > 0;
        }

        if rows_rejected > 0 {
            let breakdown =
                crate::db::rejects::counts_by_reason(conn, self.variant.table(), id)?;
            tracing::debug!(id, ?breakdown, "reject breakdown");
        }

        Ok(RunSummary {
            id,
            rows_read,
            rows_rejected,
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
    ) -> Result<TfOutcome> {
        let key = StateKey::new(self.variant.component(), id, &tf.tf);
        let rule = self.variant.window_rule(tf)?;

        let full = params.mode == RefreshMode::Full;
        let existing = if full { None } else { state::load(conn, key)? };

        let (src_min, src_max) = source_bounds(conn, id, params)?;
        let Some(src_min) = src_min else {
            // empty source: no rows and no errors
            return Ok(TfOutcome::default());
        };
        let src_max = src_max.unwrap_or(src_min);

        let plan = match &existing {
            None => Plan::Rebuild,
            Some(wm) if wm.is_backfill(src_min) => {
                tracing::info!(
                    id,
                    tf = %tf.tf,
                    src_min = %src_min,
                    state_min = ?wm.daily_min_seen,
                    "backfill detected, rebuilding bars"
                );
                Plan::Rebuild
            }
            Some(wm) => {
                let covered = wm.daily_max_seen.unwrap_or(src_min);
                if src_max <= covered {
                    return Ok(TfOutcome::default());
                }
                Plan::Append {
                    last_closed_seq: wm.last_bar_seq.unwrap_or(0),
                    last_close: wm.last_time_close,
                    last_canonical: wm.last_canonical_ts,
                    covered,
                    data_start: wm.daily_min_seen.unwrap_or(src_min),
                }
            }
        };

        match plan {
            Plan::Rebuild => {
                let raw = load_source(conn, id, None, params)?;
                self.build_and_write(conn, id, tf, rule, src_min, 0, None, None, &raw, params.mode)
            }
            Plan::Append {
                last_closed_seq,
                last_close,
                last_canonical,
                covered,
                data_start,
            } => {
                // Fast path: fold strictly-new rows into the in-progress bar.
                if let Some(out) =
                    self.try_carry_forward(conn, id, tf, rule, data_start, covered, params)?
                {
                    return Ok(out);
                }
                let raw = load_source(conn, id, last_close, params)?;
                self.build_and_write(
                    conn,
                    id,
                    tf,
                    rule,
                    data_start,
                    last_closed_seq,
                    last_canonical,
                    last_close,
                    &raw,
                    params.mode,
                )
            }
        }
    }

    /// Carry-forward path: applies when the latest bar is still in progress,
    /// every new row lands inside its window, and the strict contract gate
    /// holds. One UPSERT instead of a tail re-aggregation.
    fn try_carry_forward(
        &self,
        conn: &mut Connection,
        id: i64,
        tf: &Timeframe,
        rule: WindowRule,
        data_start: NaiveDate,
        covered: NaiveDate,
        params: &RefreshParams,
    ) -> Result<Option<TfOutcome>> {
        let Some(tail) = load_tail_bar(conn, self.variant.table(), id, &tf.tf)? else {
            return Ok(None);
        };
        if !tail.is_partial_end {
            return Ok(None);
        }
        let window = rule.window_for(data_start, tail.ts);
        let raw = load_source(conn, id, Some(covered), params)?;
        let normalised = contract::normalise_schema(&raw);
        if !normalised.null_rejects.is_empty() {
            return Ok(None);
        }
        if !normalised.rows.iter().all(|r| window.contains(r.ts)) {
            return Ok(None);
        }
        let Some(mut merged) = contract::carry_forward_snapshot(&tail, &normalised.rows) else {
            return Ok(None);
        };
        let pos = (merged.time_close_bar - window.start).num_days() + 1;
        merged.is_partial_end = pos < window.span_days();
        let closed = !merged.is_partial_end;

        if params.mode.writes() {
            let key = StateKey::new(self.variant.component(), id, &tf.tf);
            let tx = conn.transaction()?;
            write_bars(&tx, self.variant.table(), &[merged.clone()])?;
            let prior = state::load(&tx, key)?.unwrap_or_default();
            let wm = Watermark {
                daily_min_seen: Some(data_start),
                daily_max_seen: Some(merged.time_close_bar),
                last_time_close: if closed {
                    Some(merged.time_close_bar)
                } else {
                    prior.last_time_close
                },
                last_canonical_ts: if closed {
                    Some(merged.ts)
                } else {
                    prior.last_canonical_ts
                },
                last_bar_seq: if closed {
                    Some(merged.bar_seq)
                } else {
                    prior.last_bar_seq
                },
            };
            state::upsert(&tx, key, &wm)?;
            tx.commit()?;
        }
        Ok(Some(TfOutcome {
            rows_read: normalised.rows.len(),
            rows_rejected: 0,
            rows_written: 1,
        }))
    }

    /// Aggregate, run the contract, and write atomically. `seq_base` is the
    /// last closed bar's seq (0 on rebuild); everything after the last
    /// canonical window is replaced.
    #[allow(clippy::too_many_arguments)]
    fn build_and_write(
        &self,
        conn: &mut Connection,
        id: i64,
        tf: &Timeframe,
        rule: WindowRule,
        data_start: NaiveDate,
        seq_base: i64,
        last_canonical: Option<NaiveDate>,
        last_close: Option<NaiveDate>,
        raw: &[SourceRow],
        mode: RefreshMode,
    ) -> Result<TfOutcome> {
        let table = self.variant.table();
        let component = self.variant.component();
        let rows_read = raw.len();
        if raw.is_empty() {
            return Ok(TfOutcome::default());
        }

        let normalised = contract::normalise_schema(raw);
        let mut reject_rows: Vec<RejectRow> = normalised
            .null_rejects
            .iter()
            .map(|(row, kind)| RejectRow {
                bar_table: table.to_string(),
                id,
                tf: tf.tf.clone(),
                ts: row.ts,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                violation_type: kind.as_str().to_string(),
                repair_action: "reject".to_string(),
            })
            .collect();

        // Daily bars reject violating source rows before aggregation.
        let rows = if self.variant == BarVariantKind::Daily {
            let violations = contract::detect_row_violations(&normalised.rows);
            for &(idx, kind) in &violations {
                let r = normalised.rows[idx];
                reject_rows.push(RejectRow {
                    bar_table: table.to_string(),
                    id,
                    tf: tf.tf.clone(),
                    ts: r.ts,
                    open: Some(r.open),
                    high: Some(r.high),
                    low: Some(r.low),
                    close: Some(r.close),
                    volume: r.volume,
                    violation_type: kind.as_str().to_string(),
                    repair_action: "reject".to_string(),
                });
            }
            let rejected: Vec<usize> = violations.iter().map(|&(i, _)| i).collect();
            normalised
                .rows
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !rejected.contains(i))
                .map(|(_, r)| r)
                .collect()
        } else {
            normalised.rows
        };

        use chrono::Datelike;
        let base_year = last_canonical.map(|d| d.year());
        let (mut bars, pos_span) = aggregate(&rows, rule, data_start, &tf.tf, id, seq_base, base_year);
        contract::flag_partial_and_gaps(&mut bars, &pos_span);
        // a gap between the previous batch's close and this batch's first row
        if let (Some(prev), Some(first)) = (last_close, bars.first_mut()) {
            let gap = (first.time_open_bar - prev).num_days() - 1;
            if gap > 0 {
                first.is_missing_days = true;
                first.count_missing_days = gap;
            }
        }

        // Aggregated variants clamp-repair at the bar level.
        let sanity = contract::enforce_ohlc_sanity(&bars, self.variant.policy());
        for record in &sanity.records {
            reject_rows.push(violation_to_reject(record, table, id, &tf.tf, &bars));
        }
        let bars = sanity.bars;
        let rows_rejected = reject_rows.len();
        let rows_written = bars.len();

        let last_closed = last_closed_bar(&bars);
        let wm = Watermark {
            daily_min_seen: Some(data_start.min(rows.first().map_or(data_start, |r| r.ts))),
            daily_max_seen: rows.last().map(|r| r.ts),
            last_time_close: last_closed.map(|b| b.time_close_bar),
            last_canonical_ts: last_closed.map(|b| b.ts),
            last_bar_seq: last_closed.map(|b| b.bar_seq),
        };

        if mode.writes() {
            let tx = conn.transaction()?;
            match last_canonical {
                // backfill / cold / full rebuild: replace everything atomically
                None => {
                    delete_all_bars(&tx, table, id, &tf.tf)?;
                    state::delete(&tx, component, id, Some(tf.tf.as_str()))?;
                }
                // forward append: drop the stale tail only
                Some(after) => delete_bars_after_ts(&tx, table, id, &tf.tf, after)?,
            }
            write_bars(&tx, table, &bars)?;
            crate::db::rejects::append(&tx, &reject_rows)?;
            state::upsert(&tx, StateKey::new(component, id, &tf.tf), &wm)?;
            tx.commit()?;
        }

        Ok(TfOutcome {
            rows_read,
            rows_rejected,
            rows_written,
        })
    }
}

#[derive(Debug, Default)]
struct TfOutcome {
    rows_read: usize,
    rows_rejected: usize,
    rows_written: usize,
}

enum Plan {
    Rebuild,
    Append {
        last_closed_seq: i64,
        last_close: Option<NaiveDate>,
        last_canonical: Option<NaiveDate>,
        covered: NaiveDate,
        data_start: NaiveDate,
    },
}

/// Aggregate sorted price rows into bars. Returns the bars plus each bar's
/// `(position_in_window, window_span)` for partial flagging. `seq_base` is
/// the seq of the last bar kept from a previous run (0 when rebuilding);
/// `base_year` is that bar's anchor year, so year-reset numbering continues
/// correctly across append runs.
#[allow(clippy::too_many_arguments)]
fn aggregate(
    rows: &[PriceRow],
    rule: WindowRule,
    data_start: NaiveDate,
    tf: &str,
    id: i64,
    seq_base: i64,
    base_year: Option<i32>,
) -> (Vec<Bar>, Vec<(i64, i64)>) {
    use chrono::Datelike;

    let mut bars = Vec::new();
    let mut pos_span = Vec::new();
    let mut seq = seq_base;
    let mut current_year = base_year;

    let mut i = 0;
    while i < rows.len() {
        let window = rule.window_for(data_start, rows[i].ts);
        let mut j = i;
        while j < rows.len() && window.contains(rows[j].ts) {
            j += 1;
        }
        let group = &rows[i..j];

        if rule.resets_seq_on_year() {
            let year = window.start.year();
            if current_year.is_some_and(|y| y != year) {
                seq = 0;
            }
            current_year = Some(year);
        }
        seq += 1;

        let first = group[0];
        let last = group[group.len() - 1];
        let mut high = first.high;
        let mut time_high = first.ts;
        let mut low = first.low;
        let mut time_low = first.ts;
        let mut volume: Option<f64> = None;
        for r in group {
            if r.high > high {
                high = r.high;
                time_high = r.ts;
            }
            if r.low < low {
                low = r.low;
                time_low = r.ts;
            }
            volume = match (volume, r.volume) {
                (Some(a), Some(b)) => Some(a + b),
                (a, b) => a.or(b),
            };
        }

        bars.push(Bar {
            id,
            tf: tf.to_string(),
            bar_seq: seq,
            ts: window.start,
            open: first.open,
            high,
            low,
            close: last.close,
            volume,
            time_open_bar: first.ts,
            time_close_bar: last.ts,
            time_high,
            time_low,
            bar_anchor_offset: (first.ts - window.start).num_days(),
            is_partial_start: false,
            is_partial_end: false,
            is_missing_days: false,
            count_missing_days: 0,
        });
        pos_span.push(((last.ts - window.start).num_days() + 1, window.span_days()));
        i = j;
    }
    (bars, pos_span)
}

/// The last bar whose window is known complete: every bar but the final one,
/// and the final one only when its span is filled.
fn last_closed_bar(bars: &[Bar]) -> Option<&Bar> {
    match bars.len() {
        0 => None,
        n => {
            let tail = &bars[n - 1];
            if tail.is_partial_end {
                if n >= 2 {
                    Some(&bars[n - 2])
                } else {
                    None
                }
            } else {
                Some(tail)
            }
        }
    }
}

fn violation_to_reject(
    record: &ViolationRecord,
    table: &str,
    id: i64,
    tf: &str,
    bars: &[Bar],
) -> RejectRow {
    let volume = bars.get(record.row_index).and_then(|b| b.volume);
    record.to_reject_row(table, id, tf, volume)
}

fn source_bounds(
    conn: &Connection,
    id: i64,
    params: &RefreshParams,
) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
    let bounds = conn.query_row(
        "SELECT MIN(ts), MAX(ts) FROM price_histories
         WHERE id = ?1
           AND (?2 IS NULL OR ts >= ?2)
           AND (?3 IS NULL OR ts <= ?3)",
        params![id, params.start, params.end],
        |r| Ok((r.get::<_, Option<NaiveDate>>(0)?, r.get::<_, Option<NaiveDate>>(1)?)),
    )?;
    Ok(bounds)
}

fn load_source(
    conn: &Connection,
    id: i64,
    after: Option<NaiveDate>,
    params: &RefreshParams,
) -> Result<Vec<SourceRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, open, high, low, close, volume FROM price_histories
         WHERE id = ?1
           AND (?2 IS NULL OR ts > ?2)
           AND (?3 IS NULL OR ts >= ?3)
           AND (?4 IS NULL OR ts <= ?4)
         ORDER BY ts",
    )?;
    let rows = stmt
        .query_map(params![id, after, params.start, params.end], |r| {
            Ok(SourceRow {
                id,
                ts: r.get(0)?,
                open: r.get(1)?,
                high: r.get(2)?,
                low: r.get(3)?,
                close: r.get(4)?,
                volume: r.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Latest bar by window start for (id, tf): the in-progress tail when it is
/// flagged partial.
fn load_tail_bar(conn: &Connection, table: &str, id: i64, tf: &str) -> Result<Option<Bar>> {
    let sql = format!(
        "SELECT bar_seq, ts, open, high, low, close, volume,
                time_open_bar, time_close_bar, time_high, time_low,
                bar_anchor_offset, is_partial_start, is_partial_end,
                is_missing_days, count_missing_days
         FROM {table} WHERE id = ?1 AND tf = ?2
         ORDER BY ts DESC LIMIT 1"
    );
    let bar = conn
        .query_row(&sql, params![id, tf], |r| {
            Ok(Bar {
                id,
                tf: tf.to_string(),
                bar_seq: r.get(0)?,
                ts: r.get(1)?,
                open: r.get(2)?,
                high: r.get(3)?,
                low: r.get(4)?,
                close: r.get(5)?,
                volume: r.get(6)?,
                time_open_bar: r.get(7)?,
                time_close_bar: r.get(8)?,
                time_high: r.get(9)?,
                time_low: r.get(10)?,
                bar_anchor_offset: r.get(11)?,
                is_partial_start: r.get(12)?,
                is_partial_end: r.get(13)?,
                is_missing_days: r.get(14)?,
                count_missing_days: r.get(15)?,
            })
        })
        .optional()?;
    Ok(bar)
}

fn write_bars(conn: &Connection, table: &str, bars: &[Bar]) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {table}
             (id, tf, bar_seq, ts, open, high, low, close, volume,
              time_open_bar, time_close_bar, time_high, time_low,
              bar_anchor_offset, is_partial_start, is_partial_end,
              is_missing_days, count_missing_days, ingested_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
    );
    let ingested_at = db::now_utc();
    let mut stmt = conn.prepare_cached(&sql)?;
    for b in bars {
        stmt.execute(params![
            b.id,
            b.tf,
            b.bar_seq,
            b.ts,
            b.open,
            b.high,
            b.low,
            b.close,
            b.volume,
            b.time_open_bar,
            b.time_close_bar,
            b.time_high,
            b.time_low,
            b.bar_anchor_offset,
            b.is_partial_start,
            b.is_partial_end,
            b.is_missing_days,
            b.count_missing_days,
            ingested_at,
        ])?;
    }
    Ok(())
}

fn delete_all_bars(conn: &Connection, table: &str, id: i64, tf: &str) -> Result<()> {
    let sql = format!("DELETE FROM {table} WHERE id = ?1 AND tf = ?2");
    conn.execute(&sql, params![id, tf])?;
    Ok(())
}

fn delete_bars_after_ts(
    conn: &Connection,
    table: &str,
    id: i64,
    tf: &str,
    after: NaiveDate,
) -> Result<()> {
    let sql = format!("DELETE FROM {table} WHERE id = ?1 AND tf = ?2 AND ts > ?3");
    conn.execute(&sql, params![id, tf, after])?;
    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn row(ts: &str, open: f64, high: f64, low: f64, close: f64) -> PriceRow {
        PriceRow {
            id: 1,
            ts: d(ts),
            open,
            high,
            low,
            close,
            volume: Some(1.0),
        }
    }

    #[test]
    fn rolling_aggregation_splits_on_stride() {
        let rows: Vec<PriceRow> = (1..=10)
            .map(|i| row(&format!("2025-01-{i:02}"), 10.0, 12.0, 9.0, 11.0))
            .collect();
        let rule = WindowRule::Rolling { tf_days: 7 };
        let (bars, pos_span) = aggregate(&rows, rule, d("2025-01-01"), "7D", 1, 0, None);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].bar_seq, 1);
        assert_eq!(bars[0].ts, d("2025-01-01"));
        assert_eq!(bars[0].time_close_bar, d("2025-01-07"));
        assert_eq!(pos_span[0], (7, 7));
        assert_eq!(bars[1].bar_seq, 2);
        assert_eq!(pos_span[1], (3, 7)); // days 8..10 of a 7-day window
        assert_eq!(bars[1].volume, Some(3.0));
    }

    #[test]
    fn open_close_follow_first_last_rows() {
        let rows = vec![
            row("2025-01-01", 10.0, 12.0, 9.0, 11.0),
            row("2025-01-02", 11.0, 15.0, 10.0, 14.0),
            row("2025-01-03", 14.0, 14.5, 8.0, 9.0),
        ];
        let rule = WindowRule::Rolling { tf_days: 7 };
        let (bars, _) = aggregate(&rows, rule, d("2025-01-01"), "7D", 1, 0, None);
        let b = &bars[0];
        assert_eq!(b.open, 10.0);
        assert_eq!(b.close, 9.0);
        assert_eq!(b.high, 15.0);
        assert_eq!(b.time_high, d("2025-01-02"));
        assert_eq!(b.low, 8.0);
        assert_eq!(b.time_low, d("2025-01-03"));
    }

    #[test]
    fn anchor_rule_resets_seq_across_years() {
        let rows = vec![
            row("2024-12-28", 1.0, 2.0, 0.5, 1.5),
            row("2024-12-31", 1.0, 2.0, 0.5, 1.5),
            row("2025-01-01", 1.0, 2.0, 0.5, 1.5),
            row("2025-01-06", 1.0, 2.0, 0.5, 1.5),
        ];
        let rule = WindowRule::Anchor {
            base: BaseUnit::Week,
            scheme: Scheme::Iso,
        };
        let (bars, _) = aggregate(&rows, rule, d("2024-12-28"), "1W_CAL_ANCHOR_ISO", 1, 0, None);
        // first row 12-28 (Sat) is in the ISO week starting 12-23, so windows:
        // starting 12-23; clipped week 12-30..12-31; then 01-01..01-05; then 01-06..
        assert!(bars.len() >= 3);
        let year_2025_first = bars
            .iter()
            .find(|b| b.ts >= d("2025-01-01"))
            .expect("2025 bar");
        assert_eq!(year_2025_first.bar_seq, 1);
    }

    #[test]
    fn last_closed_bar_skips_partial_tail() {
        let rows: Vec<PriceRow> = (1..=10)
            .map(|i| row(&format!("2025-01-{i:02}"), 10.0, 12.0, 9.0, 11.0))
            .collect();
        let rule = WindowRule::Rolling { tf_days: 7 };
        let (mut bars, pos_span) = aggregate(&rows, rule, d("2025-01-01"), "7D", 1, 0, None);
        contract::flag_partial_and_gaps(&mut bars, &pos_span);
        let closed = last_closed_bar(&bars).unwrap();
        assert_eq!(closed.bar_seq, 1);
    }

    #[test]
    fn variant_timeframe_filters() {
        let tfs = vec![
            Timeframe {
                tf: "1D".into(),
                tf_days: Some(1),
                alignment: Alignment::TfDay,
                roll_policy: RollPolicy::None,
                base_unit: BaseUnit::Day,
                scheme: None,
                canonical: true,
            },
            Timeframe {
                tf: "7D".into(),
                tf_days: Some(7),
                alignment: Alignment::TfDay,
                roll_policy: RollPolicy::None,
                base_unit: BaseUnit::Day,
                scheme: None,
                canonical: true,
            },
            Timeframe {
                tf: "1W_CAL_US".into(),
                tf_days: None,
                alignment: Alignment::Calendar,
                roll_policy: RollPolicy::None,
                base_unit: BaseUnit::Week,
                scheme: Some(Scheme::Us),
                canonical: true,
            },
        ];
        assert_eq!(BarVariantKind::Daily.timeframes(&tfs).len(), 1);
        assert_eq!(BarVariantKind::MultiTf.timeframes(&tfs).len(), 1);
        assert_eq!(BarVariantKind::CalUs.timeframes(&tfs).len(), 1);
        assert_eq!(BarVariantKind::CalIso.timeframes(&tfs).len(), 0);
    }
}
