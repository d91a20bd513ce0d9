//! Watermark state store. One row per (component, id, tf, period); the only
//! shared mutable state in the pipeline, guarded by PK-conflict UPSERTs.
//!
//! `daily_max_seen` is monotone non-decreasing under incremental refresh.
//! A source minimum earlier than `daily_min_seen` signals backfill, which the
//! caller answers with a full rebuild for the affected (id, tf).

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::now_utc;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateKey<'a> {
    pub component: &'a str,
    pub id: i64,
    pub tf: &'a str,
    /// 0 for components that do not fan out per EMA period.
    pub period: u32,
}

impl<'a> StateKey<'a> {
    pub fn new(component: &'a str, id: i64, tf: &'a str) -> Self {
        Self {
            component,
            id,
            tf,
            period: 0,
        }
    }

    pub fn with_period(component: &'a str, id: i64, tf: &'a str, period: u32) -> Self {
        Self {
            component,
            id,
            tf,
            period,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    pub daily_min_seen: Option<NaiveDate>,
    pub daily_max_seen: Option<NaiveDate>,
    pub last_time_close: Option<NaiveDate>,
    pub last_canonical_ts: Option<NaiveDate>,
    pub last_bar_seq: Option<i64>,
}

impl Watermark {
    /// True when `src_min` precedes what this watermark has already covered.
    pub fn is_backfill(&self, src_min: NaiveDate) -> bool {
        self.daily_min_seen.is_some_and(|min| src_min < min)
    }
}

pub fn load(conn: &Connection, key: StateKey<'_>) -> Result<Option<Watermark>> {
    let wm = conn
        .query_row(
            "SELECT daily_min_seen, daily_max_seen, last_time_close, last_canonical_ts, last_bar_seq
             FROM cmc_refresh_state
             WHERE component = ?1 AND id = ?2 AND tf = ?3 AND period = ?4",
            params![key.component, key.id, key.tf, key.period],
            |r| {
                Ok(Watermark {
                    daily_min_seen: r.get(0)?,
                    daily_max_seen: r.get(1)?,
                    last_time_close: r.get(2)?,
                    last_canonical_ts: r.get(3)?,
                    last_bar_seq: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(wm)
}

/// UPSERT the watermark. `daily_max_seen` is kept monotone at the SQL level:
/// a concurrent or repeated write can never move it backwards.
pub fn upsert(conn: &Connection, key: StateKey<'_>, wm: &Watermark) -> Result<()> {
    conn.execute(
        "INSERT INTO cmc_refresh_state
             (component, id, tf, period, daily_min_seen, daily_max_seen,
              last_time_close, last_canonical_ts, last_bar_seq, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (component, id, tf, period) DO UPDATE SET
             daily_min_seen = excluded.daily_min_seen,
             daily_max_seen = MAX(COALESCE(cmc_refresh_state.daily_max_seen, excluded.daily_max_seen),
                                  COALESCE(excluded.daily_max_seen, cmc_refresh_state.daily_max_seen)),
             last_time_close = excluded.last_time_close,
             last_canonical_ts = excluded.last_canonical_ts,
             last_bar_seq = excluded.last_bar_seq,
             updated_at = excluded.updated_at",
        params![
            key.component,
            key.id,
            key.tf,
            key.period,
            wm.daily_min_seen,
            wm.daily_max_seen,
            wm.last_time_close,
            wm.last_canonical_ts,
            wm.last_bar_seq,
            now_utc(),
        ],
    )?;
    Ok(())
}

/// Remove state rows, used by full refresh (state is reset at end of the run)
/// and by backfill rebuilds.
pub fn delete(conn: &Connection, component: &str, id: i64, tf: Option<&str>) -> Result<()> {
    match tf {
        Some(tf) => conn.execute(
            "DELETE FROM cmc_refresh_state WHERE component = ?1 AND id = ?2 AND tf = ?3",
            params![component, id, tf],
        )?,
        None => conn.execute(
            "DELETE FROM cmc_refresh_state WHERE component = ?1 AND id = ?2",
            params![component, id],
        )?,
    };
    Ok(())
}

/// Minimum `daily_max_seen` across a set of components for one id, used as
/// the refresh horizon of the unified daily store.
pub fn min_max_seen_across(
    conn: &Connection,
    components: &[&str],
    id: i64,
) -> Result<Option<NaiveDate>> {
    let mut min: Option<NaiveDate> = None;
    for component in components {
        let max_seen: Option<NaiveDate> = conn
            .query_row(
                "SELECT MIN(daily_max_seen) FROM cmc_refresh_state
                 WHERE component = ?1 AND id = ?2",
                params![component, id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        match (min, max_seen) {
            (_, None) => return Ok(None),
            (None, Some(m)) => min = Some(m),
            (Some(cur), Some(m)) if m < cur => min = Some(m),
            _ => {}
        }
    }
    Ok(min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn upsert_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(&dir.path().join("t.db")).unwrap();
        let key = StateKey::new("bars_1d", 1, "1D");
        let wm = Watermark {
            daily_min_seen: Some(d("2025-01-01")),
            daily_max_seen: Some(d("2025-01-05")),
            last_time_close: Some(d("2025-01-05")),
            last_canonical_ts: Some(d("2025-01-05")),
            last_bar_seq: Some(5),
        };
        upsert(db.conn(), key, &wm).unwrap();
        assert_eq!(load(db.conn(), key).unwrap(), Some(wm));
    }

    #[test]
    fn daily_max_seen_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(&dir.path().join("t.db")).unwrap();
        let key = StateKey::new("bars_1d", 1, "1D");
        let newer = Watermark {
            daily_max_seen: Some(d("2025-02-01")),
            ..Watermark::default()
        };
        let older = Watermark {
            daily_max_seen: Some(d("2025-01-15")),
            ..Watermark::default()
        };
        upsert(db.conn(), key, &newer).unwrap();
        upsert(db.conn(), key, &older).unwrap();
        let got = load(db.conn(), key).unwrap().unwrap();
        assert_eq!(got.daily_max_seen, Some(d("2025-02-01")));
    }

    #[test]
    fn backfill_probe() {
        let wm = Watermark {
            daily_min_seen: Some(d("2025-02-01")),
            ..Watermark::default()
        };
        assert!(wm.is_backfill(d("2025-01-15")));
        assert!(!wm.is_backfill(d("2025-02-01")));
        assert!(!Watermark::default().is_backfill(d("2025-01-15")));
    }
}
