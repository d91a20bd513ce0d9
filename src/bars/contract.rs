//! Shared bar contract: invariant checks, repair rules, partial/gap flagging.
//!
//! Every function here is pure over row batches and returns structured
//! outcomes (repaired rows plus violation records). Nothing mutates its
//! input and nothing does IO, which gives the six builders one set of rules
//! and gives the validator a single contract to assert against.

use chrono::NaiveDate;

use crate::db::rejects::RejectRow;

/// Raw source row as read from `price_histories`. Prices are optional at this
/// stage so that NULL-required violations can be rejected with a precise kind
/// instead of failing the whole batch.
#[derive(Debug, Clone, Copy)]
pub struct SourceRow {
    pub id: i64,
    pub ts: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

/// A validated source row; produced by [`normalise_schema`].
#[derive(Debug, Clone, Copy)]
pub struct PriceRow {
    pub id: i64,
    pub ts: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

/// Canonical bar record shared by all six bar tables.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub id: i64,
    pub tf: String,
    pub bar_seq: i64,
    pub ts: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
    pub time_open_bar: NaiveDate,
    pub time_close_bar: NaiveDate,
    pub time_high: NaiveDate,
    pub time_low: NaiveDate,
    pub bar_anchor_offset: i64,
    pub is_partial_start: bool,
    pub is_partial_end: bool,
    pub is_missing_days: bool,
    pub count_missing_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    HighLtLow,
    HighLtOcMax,
    LowGtOcMin,
    TimeLowAfterClose,
    NullOpen,
    NullHigh,
    NullLow,
    NullClose,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::HighLtLow => "high_lt_low",
            ViolationKind::HighLtOcMax => "high_lt_oc_max",
            ViolationKind::LowGtOcMin => "low_gt_oc_min",
            ViolationKind::TimeLowAfterClose => "time_low_after_close",
            ViolationKind::NullOpen => "null_open",
            ViolationKind::NullHigh => "null_high",
            ViolationKind::NullLow => "null_low",
            ViolationKind::NullClose => "null_close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    Reject,
    SwapHighLow,
    SetHighToOcMax,
    SetLowToOcMin,
}

impl RepairAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RepairAction::Reject => "reject",
            RepairAction::SwapHighLow => "swap_high_low",
            RepairAction::SetHighToOcMax => "set_high_to_oc_max",
            RepairAction::SetLowToOcMin => "set_low_to_oc_min",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OhlcPolicy {
    Reject,
    Clamp,
}

/// One detected violation, tagged with the repair the active policy implies.
#[derive(Debug, Clone)]
pub struct ViolationRecord {
    pub row_index: usize,
    pub kind: ViolationKind,
    pub action: RepairAction,
    /// Original values before any repair.
    pub original: (NaiveDate, f64, f64, f64, f64),
}

impl ViolationRecord {
    pub fn to_reject_row(&self, bar_table: &str, id: i64, tf: &str, volume: Option<f64>) -> RejectRow {
        let (ts, open, high, low, close) = self.original;
        RejectRow {
            bar_table: bar_table.to_string(),
            id,
            tf: tf.to_string(),
            ts,
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close: Some(close),
            volume,
            violation_type: self.kind.as_str().to_string(),
            repair_action: self.action.as_str().to_string(),
        }
    }
}

/// Outcome of schema normalisation: validated rows plus NULL-field rejects.
#[derive(Debug, Default)]
pub struct NormaliseOutcome {
    pub rows: Vec<PriceRow>,
    pub null_rejects: Vec<(SourceRow, ViolationKind)>,
}

/// Project raw source rows to the canonical column set, rejecting rows with
/// a missing mandatory price field. Rows come back in input order.
pub fn normalise_schema(raw: &[SourceRow]) -> NormaliseOutcome {
    let mut out = NormaliseOutcome::default();
    for row in raw {
        let kind = if row.open.is_none() {
            Some(ViolationKind::NullOpen)
        } else if row.high.is_none() {
            Some(ViolationKind::NullHigh)
        } else if row.low.is_none() {
            Some(ViolationKind::NullLow)
        } else if row.close.is_none() {
            Some(ViolationKind::NullClose)
        } else {
            None
        };
        match kind {
            Some(kind) => out.null_rejects.push((*row, kind)),
            None => out.rows.push(PriceRow {
                id: row.id,
                ts: row.ts,
                open: row.open.unwrap_or_default(),
                high: row.high.unwrap_or_default(),
                low: row.low.unwrap_or_default(),
                close: row.close.unwrap_or_default(),
                volume: row.volume,
            }),
        }
    }
    out
}

fn ohlc_violation(open: f64, high: f64, low: f64, close: f64) -> Option<ViolationKind> {
    if high < low {
        Some(ViolationKind::HighLtLow)
    } else if high < open.max(close) {
        Some(ViolationKind::HighLtOcMax)
    } else if low > open.min(close) {
        Some(ViolationKind::LowGtOcMin)
    } else {
        None
    }
}

/// Detect OHLC violations on validated source rows (the daily builder rejects
/// at this granularity). Returns `(row_index, kind)` pairs.
pub fn detect_row_violations(rows: &[PriceRow]) -> Vec<(usize, ViolationKind)> {
    rows.iter()
        .enumerate()
        .filter_map(|(i, r)| ohlc_violation(r.open, r.high, r.low, r.close).map(|k| (i, k)))
        .collect()
}

/// Detect OHLC violations on aggregated bars, including the time-ordering
/// check `time_low <= time_close_bar`.
pub fn detect_ohlc_violations(bars: &[Bar]) -> Vec<(usize, ViolationKind)> {
    let mut out = Vec::new();
    for (i, b) in bars.iter().enumerate() {
        if let Some(kind) = ohlc_violation(b.open, b.high, b.low, b.close) {
            out.push((i, kind));
        }
        if b.time_low > b.time_close_bar {
            out.push((i, ViolationKind::TimeLowAfterClose));
        }
    }
    out
}

/// Outcome of sanity enforcement over a bar batch.
#[derive(Debug, Default)]
pub struct SanityOutcome {
    /// Bars that survived (repaired under `Clamp`, untouched survivors under
    /// `Reject`). Input order is preserved.
    pub bars: Vec<Bar>,
    /// One record per violation, carrying the original values.
    pub records: Vec<ViolationRecord>,
}

/// Enforce OHLC sanity over a bar batch. Under `Reject` the violating bars
/// are dropped; under `Clamp` they are repaired in this order:
/// high<low -> swap; high<max(o,c) -> high=max(o,c); low>min(o,c) ->
/// low=min(o,c); time_low>time_close_bar -> low=min(o,c).
pub fn enforce_ohlc_sanity(bars: &[Bar], policy: OhlcPolicy) -> SanityOutcome {
    let mut out = SanityOutcome::default();
    for (i, bar) in bars.iter().enumerate() {
        let original = (bar.ts, bar.open, bar.high, bar.low, bar.close);
        let mut repaired = bar.clone();
        let mut kinds = Vec::new();

        if repaired.high < repaired.low {
            kinds.push((ViolationKind::HighLtLow, RepairAction::SwapHighLow));
            std::mem::swap(&mut repaired.high, &mut repaired.low);
        }
        if repaired.high < repaired.open.max(repaired.close) {
            kinds.push((ViolationKind::HighLtOcMax, RepairAction::SetHighToOcMax));
            repaired.high = repaired.open.max(repaired.close);
        }
        if repaired.low > repaired.open.min(repaired.close) {
            kinds.push((ViolationKind::LowGtOcMin, RepairAction::SetLowToOcMin));
            repaired.low = repaired.open.min(repaired.close);
        }
        if repaired.time_low > repaired.time_close_bar {
            kinds.push((ViolationKind::TimeLowAfterClose, RepairAction::SetLowToOcMin));
            repaired.low = repaired.low.min(repaired.open.min(repaired.close));
            repaired.time_low = repaired.time_close_bar;
        }

        if kinds.is_empty() {
            out.bars.push(repaired);
            continue;
        }
        for (kind, action) in kinds {
            out.records.push(ViolationRecord {
                row_index: i,
                kind,
                action: match policy {
                    OhlcPolicy::Reject => RepairAction::Reject,
                    OhlcPolicy::Clamp => action,
                },
                original,
            });
        }
        if policy == OhlcPolicy::Clamp {
            out.bars.push(repaired);
        }
    }
    out
}

/// Flag partial-end and missing-day diagnostics in place over a batch that is
/// sorted by window order. `pos_span[i]` is `(position_in_window, window_span)`
/// in days for bar `i`.
pub fn flag_partial_and_gaps(bars: &mut [Bar], pos_span: &[(i64, i64)]) {
    for (bar, &(pos, span)) in bars.iter_mut().zip(pos_span) {
        // Data-start anchoring: the first bar opens where the data opens.
        bar.is_partial_start = false;
        bar.is_partial_end = pos < span;
    }
    for i in 1..bars.len() {
        let expected = bars[i - 1].time_close_bar.succ_opt();
        let gap = match expected {
            Some(next) => (bars[i].time_open_bar - next).num_days(),
            None => 0,
        };
        if gap > 0 {
            bars[i].is_missing_days = true;
            bars[i].count_missing_days = gap;
        } else {
            bars[i].is_missing_days = false;
            bars[i].count_missing_days = 0;
        }
    }
}

/// O(1) update of the last in-progress bar: fold `new_rows` into `existing`
/// when the strict gate holds (rows strictly after the bar's current close,
/// in ascending order, and the merged bar still satisfies the OHLC
/// invariants). Returns `None` when the gate fails, which forces the caller
/// to rebuild that window from source.
pub fn carry_forward_snapshot(existing: &Bar, new_rows: &[PriceRow]) -> Option<Bar> {
    if new_rows.is_empty() {
        return Some(existing.clone());
    }
    let mut prev = existing.time_close_bar;
    for row in new_rows {
        if row.ts <= prev {
            return None;
        }
        prev = row.ts;
    }

    let mut bar = existing.clone();
    for row in new_rows {
        if ohlc_violation(row.open, row.high, row.low, row.close).is_some() {
            return None;
        }
        if row.high > bar.high {
            bar.high = row.high;
            bar.time_high = row.ts;
        }
        if row.low < bar.low {
            bar.low = row.low;
            bar.time_low = row.ts;
        }
        bar.close = row.close;
        bar.time_close_bar = row.ts;
        bar.volume = match (bar.volume, row.volume) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
    if ohlc_violation(bar.open, bar.high, bar.low, bar.close).is_some() {
        return None;
    }
    Some(bar)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            id: 1,
            tf: "7D".into(),
            bar_seq: 1,
            ts: d("2025-01-01"),
            open,
            high,
            low,
            close,
            volume: Some(10.0),
            time_open_bar: d("2025-01-01"),
            time_close_bar: d("2025-01-07"),
            time_high: d("2025-01-03"),
            time_low: d("2025-01-05"),
            bar_anchor_offset: 0,
            is_partial_start: false,
            is_partial_end: false,
            is_missing_days: false,
            count_missing_days: 0,
        }
    }

    #[test]
    fn clean_bar_passes_untouched() {
        let bars = vec![bar(10.0, 12.0, 9.0, 11.0)];
        let out = enforce_ohlc_sanity(&bars, OhlcPolicy::Clamp);
        assert_eq!(out.bars.len(), 1);
        assert!(out.records.is_empty());
    }

    #[test]
    fn high_lt_oc_max_clamps_high() {
        // spec scenario 2: open=10 high=9 low=8 close=11
        let bars = vec![bar(10.0, 9.0, 8.0, 11.0)];
        let out = enforce_ohlc_sanity(&bars, OhlcPolicy::Clamp);
        assert_eq!(out.bars[0].high, 11.0);
        assert_eq!(out.records[0].kind, ViolationKind::HighLtOcMax);
        assert_eq!(out.records[0].action, RepairAction::SetHighToOcMax);
        assert_eq!(out.records[0].original.2, 9.0);
    }

    #[test]
    fn reject_policy_drops_violators() {
        let bars = vec![bar(10.0, 9.0, 8.0, 11.0), bar(10.0, 12.0, 9.0, 11.0)];
        let out = enforce_ohlc_sanity(&bars, OhlcPolicy::Reject);
        assert_eq!(out.bars.len(), 1);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].action, RepairAction::Reject);
    }

    #[test]
    fn high_lt_low_swaps() {
        let bars = vec![bar(5.0, 4.0, 6.0, 5.0)];
        let out = enforce_ohlc_sanity(&bars, OhlcPolicy::Clamp);
        let b = &out.bars[0];
        assert!(b.high >= b.low);
        assert_eq!(out.records[0].kind, ViolationKind::HighLtLow);
    }

    #[test]
    fn time_low_after_close_repaired() {
        let mut b = bar(10.0, 12.0, 9.0, 11.0);
        b.time_low = d("2025-01-09");
        let out = enforce_ohlc_sanity(&[b], OhlcPolicy::Clamp);
        assert_eq!(out.records[0].kind, ViolationKind::TimeLowAfterClose);
        assert_eq!(out.bars[0].low, 9.0_f64.min(10.0).min(11.0));
    }

    #[test]
    fn null_close_rejected_by_normalise() {
        let raw = vec![SourceRow {
            id: 1,
            ts: d("2025-01-01"),
            open: Some(1.0),
            high: Some(2.0),
            low: Some(0.5),
            close: None,
            volume: None,
        }];
        let out = normalise_schema(&raw);
        assert!(out.rows.is_empty());
        assert_eq!(out.null_rejects[0].1, ViolationKind::NullClose);
    }

    #[test]
    fn gap_flagging_counts_missing_days() {
        let mut bars = vec![bar(1.0, 2.0, 0.5, 1.5), bar(1.0, 2.0, 0.5, 1.5)];
        bars[1].time_open_bar = d("2025-01-10");
        bars[1].time_close_bar = d("2025-01-12");
        let spans = vec![(7, 7), (3, 7)];
        flag_partial_and_gaps(&mut bars, &spans);
        assert!(!bars[0].is_missing_days);
        assert!(bars[1].is_missing_days);
        assert_eq!(bars[1].count_missing_days, 2); // Jan 8, Jan 9
        assert!(bars[1].is_partial_end);
        assert!(!bars[0].is_partial_end);
    }

    #[test]
    fn carry_forward_extends_tail_bar() {
        let existing = bar(10.0, 12.0, 9.0, 11.0);
        let rows = vec![PriceRow {
            id: 1,
            ts: d("2025-01-08"),
            open: 11.0,
            high: 13.0,
            low: 10.5,
            close: 12.5,
            volume: Some(3.0),
        }];
        let merged = carry_forward_snapshot(&existing, &rows).unwrap();
        assert_eq!(merged.high, 13.0);
        assert_eq!(merged.time_high, d("2025-01-08"));
        assert_eq!(merged.close, 12.5);
        assert_eq!(merged.volume, Some(13.0));
    }

    #[test]
    fn carry_forward_gate_rejects_out_of_order() {
        let existing = bar(10.0, 12.0, 9.0, 11.0);
        let rows = vec![PriceRow {
            id: 1,
            ts: d("2025-01-03"), // not after the bar's close
            open: 11.0,
            high: 13.0,
            low: 10.5,
            close: 12.5,
            volume: None,
        }];
        assert!(carry_forward_snapshot(&existing, &rows).is_none());
    }
}
