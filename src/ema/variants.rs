//! The six EMA variants. All share the smoothing kernel and differ only in
//! source table, timeframe filter, alpha derivation, and whether they carry
//! bar-space columns.
//!
//! Alpha rules:
//! - tf_day bar-space (v1): `2/(period+1)` over bar closes.
//! - tf_day daily-space (v2): `2/(period*tf_days+1)` over daily closes.
//! - calendar: daily alpha from a lookup keyed by effective days, falling
//!   back to `2/(effective_days+1)`; bar alpha `2/(period+1)`.
//! - calendar_anchor: same, plus `1-(1-alpha_bar)^(1/tf_days)` to propagate
//!   the bar-space EMA across daily rows between canonical closes.

use chrono::NaiveDate;

use crate::db::dims::{Alignment, RollPolicy, Scheme, Timeframe};
use crate::ema::kernel::{
    compute_ema, daily_alpha_from_bar, diff_all, diff_canonical, ema_step,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmaVariantKind {
    /// tf_day v1: bar-space over the multi-TF bar table.
    MultiTf,
    /// tf_day v2: daily-space over the 1d bar table.
    MultiTfDaily,
    CalUs,
    CalIso,
    CalAnchorUs,
    CalAnchorIso,
}

impl EmaVariantKind {
    pub fn table(self) -> &'static str {
        match self {
            EmaVariantKind::MultiTf => "cmc_emas_multi_tf",
            EmaVariantKind::MultiTfDaily => "cmc_emas_multi_tf_daily",
            EmaVariantKind::CalUs => "cmc_emas_cal_us",
            EmaVariantKind::CalIso => "cmc_emas_cal_iso",
            EmaVariantKind::CalAnchorUs => "cmc_emas_cal_anchor_us",
            EmaVariantKind::CalAnchorIso => "cmc_emas_cal_anchor_iso",
        }
    }

    pub fn component(self) -> &'static str {
        match self {
            EmaVariantKind::MultiTf => "emas_multi_tf",
            EmaVariantKind::MultiTfDaily => "emas_multi_tf_daily",
            EmaVariantKind::CalUs => "emas_cal_us",
            EmaVariantKind::CalIso => "emas_cal_iso",
            EmaVariantKind::CalAnchorUs => "emas_cal_anchor_us",
            EmaVariantKind::CalAnchorIso => "emas_cal_anchor_iso",
        }
    }

    /// The bar table this variant reads.
    pub fn source_table(self) -> &'static str {
        match self {
            EmaVariantKind::MultiTf => "cmc_price_bars_multi_tf",
            EmaVariantKind::MultiTfDaily => "cmc_price_bars_1d",
            EmaVariantKind::CalUs => "cmc_price_bars_cal_us",
            EmaVariantKind::CalIso => "cmc_price_bars_cal_iso",
            EmaVariantKind::CalAnchorUs => "cmc_price_bars_cal_anchor_us",
            EmaVariantKind::CalAnchorIso => "cmc_price_bars_cal_anchor_iso",
        }
    }

    /// Calendar and anchor variants carry the bar-space column set.
    pub fn has_bar_space(self) -> bool {
        matches!(
            self,
            EmaVariantKind::CalUs
                | EmaVariantKind::CalIso
                | EmaVariantKind::CalAnchorUs
                | EmaVariantKind::CalAnchorIso
        )
    }

    /// Anchor variants propagate `ema_bar` between canonical closes with the
    /// compounded daily alpha; plain calendar variants hold it.
    pub fn propagates_bar_ema(self) -> bool {
        matches!(
            self,
            EmaVariantKind::CalAnchorUs | EmaVariantKind::CalAnchorIso
        )
    }

    pub fn timeframes(self, all: &[Timeframe]) -> Vec<Timeframe> {
        all.iter()
            .filter(|t| match self {
                EmaVariantKind::MultiTf => {
                    t.alignment == Alignment::TfDay && t.tf_days.is_some_and(|d| d > 1)
                }
                EmaVariantKind::MultiTfDaily => t.alignment == Alignment::TfDay,
                EmaVariantKind::CalUs => {
                    t.alignment == Alignment::Calendar
                        && t.roll_policy == RollPolicy::None
                        && t.matches_scheme(Scheme::Us)
                }
                EmaVariantKind::CalIso => {
                    t.alignment == Alignment::Calendar
                        && t.roll_policy == RollPolicy::None
                        && t.matches_scheme(Scheme::Iso)
                }
                EmaVariantKind::CalAnchorUs => {
                    t.alignment == Alignment::Calendar
                        && t.roll_policy == RollPolicy::CalendarAnchor
                        && t.matches_scheme(Scheme::Us)
                }
                EmaVariantKind::CalAnchorIso => {
                    t.alignment == Alignment::Calendar
                        && t.roll_policy == RollPolicy::CalendarAnchor
                        && t.matches_scheme(Scheme::Iso)
                }
            })
            .cloned()
            .collect()
    }
}

/// Pre-computed alphas for the common effective-day spans; everything else
/// falls back to the same formula.
const ALPHA_LOOKUP: &[(u32, f64)] = &[
    (7, 2.0 / 8.0),
    (14, 2.0 / 15.0),
    (21, 2.0 / 22.0),
    (30, 2.0 / 31.0),
    (63, 2.0 / 64.0),
    (91, 2.0 / 92.0),
    (182, 2.0 / 183.0),
    (365, 2.0 / 366.0),
];

pub fn alpha_for_effective_days(effective_days: u32) -> f64 {
    ALPHA_LOOKUP
        .iter()
        .find(|(d, _)| *d == effective_days)
        .map_or_else(|| 2.0 / (f64::from(effective_days) + 1.0), |(_, a)| *a)
}

pub fn bar_alpha(period: u32) -> f64 {
    2.0 / (f64::from(period) + 1.0)
}

pub fn daily_space_alpha(period: u32, tf_days: u32) -> f64 {
    2.0 / (f64::from(period) * f64::from(tf_days) + 1.0)
}

/// One computed EMA row prior to keying with (id, tf, period).
#[derive(Debug, Clone, PartialEq)]
pub struct EmaPoint {
    pub ts: NaiveDate,
    pub ema: f64,
    pub ema_bar: Option<f64>,
    pub roll: bool,
    pub roll_bar: Option<bool>,
    pub d1: Option<f64>,
    pub d2: Option<f64>,
    pub d1_roll: Option<f64>,
    pub d2_roll: Option<f64>,
    pub d1_bar: Option<f64>,
    pub d2_bar: Option<f64>,
    pub d1_roll_bar: Option<f64>,
    pub d2_roll_bar: Option<f64>,
}

/// A source bar reduced to what EMA computation needs.
#[derive(Debug, Clone, Copy)]
pub struct BarClose {
    pub close_ts: NaiveDate,
    pub close: f64,
    /// Window is complete; its close is a canonical close.
    pub closed: bool,
}

fn assemble(
    ts: &[NaiveDate],
    ema: &[Option<f64>],
    canonical: &[bool],
    ema_bar: Option<&[Option<f64>]>,
) -> Vec<EmaPoint> {
    let d1 = diff_canonical(ema, canonical);
    let d2 = diff_canonical(&d1, canonical);
    let d1_roll = diff_all(ema);
    let d2_roll = diff_all(&d1_roll);
    let (bd1, bd2, bd1_roll, bd2_roll) = match ema_bar {
        Some(bar) => {
            let d1b = diff_canonical(bar, canonical);
            let d2b = diff_canonical(&d1b, canonical);
            let d1rb = diff_all(bar);
            let d2rb = diff_all(&d1rb);
            (Some(d1b), Some(d2b), Some(d1rb), Some(d2rb))
        }
        None => (None, None, None, None),
    };

    let mut out = Vec::with_capacity(ts.len());
    for i in 0..ts.len() {
        let Some(value) = ema[i] else { continue };
        out.push(EmaPoint {
            ts: ts[i],
            ema: value,
            ema_bar: ema_bar.and_then(|b| b[i]),
            roll: !canonical[i],
            roll_bar: ema_bar.map(|_| !canonical[i]),
            d1: d1[i],
            d2: d2[i],
            d1_roll: d1_roll[i],
            d2_roll: d2_roll[i],
            d1_bar: bd1.as_ref().and_then(|v| v[i]),
            d2_bar: bd2.as_ref().and_then(|v| v[i]),
            d1_roll_bar: bd1_roll.as_ref().and_then(|v| v[i]),
            d2_roll_bar: bd2_roll.as_ref().and_then(|v| v[i]),
        });
    }
    out
}

/// tf_day v1: bar-space EMA at bar closes. Closed bars are canonical
/// (`roll = FALSE`); the in-progress tail, if present, yields one
/// `roll = TRUE` row from its latest snapshot.
pub fn compute_bar_space(bars: &[BarClose], period: u32) -> Vec<EmaPoint> {
    let ts: Vec<NaiveDate> = bars.iter().map(|b| b.close_ts).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let canonical: Vec<bool> = bars.iter().map(|b| b.closed).collect();
    let ema = compute_ema(&closes, bar_alpha(period), period as usize);
    assemble(&ts, &ema, &canonical, None)
}

/// tf_day v2: daily-space EMA over daily closes. A day is canonical when it
/// ends a tf-day stride counted from the data start.
pub fn compute_daily_space(
    days: &[(NaiveDate, f64)],
    data_start: NaiveDate,
    period: u32,
    tf_days: u32,
) -> Vec<EmaPoint> {
    let ts: Vec<NaiveDate> = days.iter().map(|(d, _)| *d).collect();
    let closes: Vec<f64> = days.iter().map(|(_, c)| *c).collect();
    let canonical: Vec<bool> = ts
        .iter()
        .map(|d| (*d - data_start).num_days() % i64::from(tf_days) == i64::from(tf_days) - 1)
        .collect();
    let ema = compute_ema(&closes, daily_space_alpha(period, tf_days), period as usize);
    assemble(&ts, &ema, &canonical, None)
}

/// Calendar and anchor variants: a daily-space EMA over daily closes plus a
/// bar-space EMA that snaps to the new bar EMA at each canonical close and is
/// held (calendar) or propagated with the compounded daily alpha (anchor)
/// between closes.
pub fn compute_calendar(
    days: &[(NaiveDate, f64)],
    bars: &[BarClose],
    period: u32,
    effective_days: u32,
    propagate: bool,
) -> Vec<EmaPoint> {
    let ts: Vec<NaiveDate> = days.iter().map(|(d, _)| *d).collect();
    let closes: Vec<f64> = days.iter().map(|(_, c)| *c).collect();

    let close_dates: Vec<NaiveDate> = bars
        .iter()
        .filter(|b| b.closed)
        .map(|b| b.close_ts)
        .collect();
    let canonical: Vec<bool> = ts.iter().map(|d| close_dates.binary_search(d).is_ok()).collect();

    let alpha_daily = alpha_for_effective_days(period.saturating_mul(effective_days));
    let ema = compute_ema(&closes, alpha_daily, period as usize);

    // Bar-space EMA evolved over closed bar closes only.
    let bar_closes: Vec<f64> = bars
        .iter()
        .filter(|b| b.closed)
        .map(|b| b.close)
        .collect();
    let alpha_bar = bar_alpha(period);
    let bar_ema_series = compute_ema(&bar_closes, alpha_bar, period as usize);
    let alpha_prop = daily_alpha_from_bar(alpha_bar, effective_days.max(1));

    // Walk daily rows, snapping at closes and holding/propagating between.
    let mut ema_bar: Vec<Option<f64>> = vec![None; ts.len()];
    let mut bar_idx = 0usize;
    let mut held: Option<f64> = None;
    for i in 0..ts.len() {
        if canonical[i] {
            held = bar_ema_series.get(bar_idx).copied().flatten();
            bar_idx += 1;
        } else if propagate {
            if let Some(prev) = held {
                held = Some(ema_step(prev, closes[i], alpha_prop));
            }
        }
        ema_bar[i] = held;
    }

    assemble(&ts, &ema, &canonical, Some(&ema_bar))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn alpha_lookup_agrees_with_fallback() {
        assert!((alpha_for_effective_days(7) - 2.0 / 8.0).abs() < 1e-12);
        // a span not in the table goes through the formula
        assert!((alpha_for_effective_days(100) - 2.0 / 101.0).abs() < 1e-12);
    }

    #[test]
    fn bar_space_marks_partial_tail_as_roll() {
        let bars = vec![
            BarClose { close_ts: d("2025-01-07"), close: 10.0, closed: true },
            BarClose { close_ts: d("2025-01-14"), close: 11.0, closed: true },
            BarClose { close_ts: d("2025-01-17"), close: 12.0, closed: false },
        ];
        let points = compute_bar_space(&bars, 2);
        assert_eq!(points.len(), 2); // min_periods=2 withholds the first
        assert!(!points[0].roll);
        assert!(points[1].roll);
        assert_eq!(points[1].ts, d("2025-01-17"));
    }

    #[test]
    fn daily_space_canonical_stride() {
        let days: Vec<(NaiveDate, f64)> = (1..=6)
            .map(|i| (d(&format!("2025-01-0{i}")), 10.0 + f64::from(i)))
            .collect();
        let points = compute_daily_space(&days, d("2025-01-01"), 1, 3);
        // strides of 3 from Jan 1: canonical on Jan 3 and Jan 6
        let canonical: Vec<NaiveDate> =
            points.iter().filter(|p| !p.roll).map(|p| p.ts).collect();
        assert_eq!(canonical, vec![d("2025-01-03"), d("2025-01-06")]);
    }

    #[test]
    fn calendar_bar_ema_snaps_and_holds() {
        let days: Vec<(NaiveDate, f64)> = (1..=10)
            .map(|i| (d(&format!("2025-01-{i:02}")), 100.0))
            .collect();
        let bars = vec![
            BarClose { close_ts: d("2025-01-04"), close: 100.0, closed: true },
            BarClose { close_ts: d("2025-01-08"), close: 100.0, closed: true },
        ];
        let points = compute_calendar(&days, &bars, 1, 7, false);
        let jan4 = points.iter().find(|p| p.ts == d("2025-01-04")).unwrap();
        assert!(!jan4.roll);
        assert_eq!(jan4.ema_bar, Some(100.0));
        let jan6 = points.iter().find(|p| p.ts == d("2025-01-06")).unwrap();
        assert!(jan6.roll);
        assert_eq!(jan6.ema_bar, Some(100.0)); // held between closes
    }

    #[test]
    fn anchor_propagation_moves_between_closes() {
        let mut days: Vec<(NaiveDate, f64)> = (1..=12)
            .map(|i| (d(&format!("2025-01-{i:02}")), 100.0))
            .collect();
        // daily closes jump after the second bar close
        for day in days.iter_mut().skip(8) {
            day.1 = 200.0;
        }
        let bars = vec![
            BarClose { close_ts: d("2025-01-04"), close: 100.0, closed: true },
            BarClose { close_ts: d("2025-01-08"), close: 100.0, closed: true },
        ];
        let points = compute_calendar(&days, &bars, 2, 7, true);
        let jan12 = points.iter().find(|p| p.ts == d("2025-01-12")).unwrap();
        let bar_ema = jan12.ema_bar.unwrap();
        assert!(bar_ema > 100.0 && bar_ema < 200.0);
    }

    #[test]
    fn roll_false_exactly_at_canonical_closes() {
        let days: Vec<(NaiveDate, f64)> = (1..=9)
            .map(|i| (d(&format!("2025-01-0{i}")), 50.0 + f64::from(i)))
            .collect();
        let bars = vec![
            BarClose { close_ts: d("2025-01-04"), close: 54.0, closed: true },
            BarClose { close_ts: d("2025-01-09"), close: 59.0, closed: true },
        ];
        let points = compute_calendar(&days, &bars, 1, 7, false);
        for p in &points {
            let is_close = p.ts == d("2025-01-04") || p.ts == d("2025-01-09");
            assert_eq!(!p.roll, is_close, "roll mismatch at {}", p.ts);
        }
    }
}
