//! Window assignment for the six bar alignments.
//!
//! tf_day windows roll in fixed N-day strides anchored at the asset's data
//! start. Calendar windows align to fixed period boundaries (US weeks start
//! Sunday, ISO weeks start Monday). Anchor windows are calendar windows
//! clipped at year boundaries, so the year boundary always closes the bar.

use chrono::{Datelike, Days, NaiveDate};

use crate::db::dims::{BaseUnit, Scheme};

/// Inclusive window bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Window {
    pub fn span_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, d: NaiveDate) -> bool {
        d >= self.start && d <= self.end
    }
}

/// Rolling N-day window containing `ts`, anchored at `data_start`.
pub fn rolling_window(data_start: NaiveDate, ts: NaiveDate, tf_days: u32) -> Window {
    debug_assert!(ts >= data_start);
    let idx = (ts - data_start).num_days() / i64::from(tf_days);
    let start = data_start + Days::new((idx as u64) * u64::from(tf_days));
    let end = start + Days::new(u64::from(tf_days) - 1);
    Window { start, end }
}

pub fn week_start(d: NaiveDate, scheme: Scheme) -> NaiveDate {
    let back = match scheme {
        Scheme::Us => d.weekday().num_days_from_sunday(),
        Scheme::Iso => d.weekday().num_days_from_monday(),
    };
    d - Days::new(u64::from(back))
}

fn month_start(d: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(d.year(), d.month(), 1).unwrap_or(d)
}

fn quarter_start(d: NaiveDate) -> NaiveDate {
    let month = 1 + ((d.month0() / 3) * 3);
    NaiveDate::from_ymd_opt(d.year(), month, 1).unwrap_or(d)
}

fn year_start(d: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(d.year(), 1, 1).unwrap_or(d)
}

fn next_period_start(start: NaiveDate, base: BaseUnit) -> NaiveDate {
    match base {
        BaseUnit::Day => start + Days::new(1),
        BaseUnit::Week => start + Days::new(7),
        BaseUnit::Month => {
            let (y, m) = if start.month() == 12 {
                (start.year() + 1, 1)
            } else {
                (start.year(), start.month() + 1)
            };
            NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(start)
        }
        BaseUnit::Quarter => {
            let (y, m) = if start.month() >= 10 {
                (start.year() + 1, 1)
            } else {
                (start.year(), start.month() + 3)
            };
            NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(start)
        }
        BaseUnit::Year => NaiveDate::from_ymd_opt(start.year() + 1, 1, 1).unwrap_or(start),
    }
}

/// Calendar window containing `ts` for the given base unit and scheme.
/// The scheme only matters for weeks; months, quarters and years have fixed
/// starts in both schemes.
pub fn calendar_window(ts: NaiveDate, base: BaseUnit, scheme: Scheme) -> Window {
    let start = match base {
        BaseUnit::Day => ts,
        BaseUnit::Week => week_start(ts, scheme),
        BaseUnit::Month => month_start(ts),
        BaseUnit::Quarter => quarter_start(ts),
        BaseUnit::Year => year_start(ts),
    };
    let end = next_period_start(start, base) - Days::new(1);
    Window { start, end }
}

/// Calendar window clipped at the year boundary: the start never precedes
/// Jan 1 and the end never exceeds Dec 31 of the year containing `ts`.
/// A week straddling New Year therefore yields two windows, and the year
/// boundary is a guaranteed closure point.
pub fn anchor_window(ts: NaiveDate, base: BaseUnit, scheme: Scheme) -> Window {
    let w = calendar_window(ts, base, scheme);
    let ys = year_start(ts);
    let ye = NaiveDate::from_ymd_opt(ts.year(), 12, 31).unwrap_or(w.end);
    Window {
        start: w.start.max(ys),
        end: w.end.min(ye),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn rolling_windows_anchor_at_data_start() {
        let start = d("2025-01-03");
        let w = rolling_window(start, d("2025-01-03"), 7);
        assert_eq!(w.start, d("2025-01-03"));
        assert_eq!(w.end, d("2025-01-09"));
        let w2 = rolling_window(start, d("2025-01-10"), 7);
        assert_eq!(w2.start, d("2025-01-10"));
        assert_eq!(w2.span_days(), 7);
    }

    #[test]
    fn us_week_starts_sunday_iso_starts_monday() {
        // 2025-01-01 is a Wednesday
        let day = d("2025-01-01");
        assert_eq!(week_start(day, Scheme::Us), d("2024-12-29")); // Sunday
        assert_eq!(week_start(day, Scheme::Iso), d("2024-12-30")); // Monday
        assert_eq!(day.weekday(), Weekday::Wed);
    }

    #[test]
    fn calendar_month_window() {
        let w = calendar_window(d("2025-02-14"), BaseUnit::Month, Scheme::Us);
        assert_eq!(w.start, d("2025-02-01"));
        assert_eq!(w.end, d("2025-02-28"));
        assert_eq!(w.span_days(), 28);
    }

    #[test]
    fn calendar_quarter_and_year_windows() {
        let q = calendar_window(d("2025-08-01"), BaseUnit::Quarter, Scheme::Iso);
        assert_eq!(q.start, d("2025-07-01"));
        assert_eq!(q.end, d("2025-09-30"));
        let y = calendar_window(d("2025-08-01"), BaseUnit::Year, Scheme::Iso);
        assert_eq!(y.start, d("2025-01-01"));
        assert_eq!(y.end, d("2025-12-31"));
    }

    #[test]
    fn anchor_clips_week_straddling_new_year() {
        // ISO week containing 2025-01-01 runs 2024-12-30 .. 2025-01-05
        let before = anchor_window(d("2024-12-31"), BaseUnit::Week, Scheme::Iso);
        assert_eq!(before.start, d("2024-12-30"));
        assert_eq!(before.end, d("2024-12-31"));
        let after = anchor_window(d("2025-01-01"), BaseUnit::Week, Scheme::Iso);
        assert_eq!(after.start, d("2025-01-01"));
        assert_eq!(after.end, d("2025-01-05"));
    }

    #[test]
    fn anchor_leaves_interior_weeks_alone() {
        let w = anchor_window(d("2025-06-11"), BaseUnit::Week, Scheme::Us);
        assert_eq!(w.span_days(), 7);
    }
}
