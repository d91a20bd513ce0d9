#![allow(dead_code)]

use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection};
use tempfile::TempDir;

use cmc_pipeline::db::Db;

pub fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

/// Fresh migrated database in a temp dir. Keep the TempDir alive for the
/// duration of the test.
pub fn open_db() -> (TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pipeline.db")).unwrap();
    (dir, db)
}

pub fn insert_price(
    conn: &Connection,
    id: i64,
    ts: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
) {
    conn.execute(
        "INSERT OR REPLACE INTO price_histories (id, ts, open, high, low, close, volume)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1000.0)",
        params![id, ts, open, high, low, close],
    )
    .unwrap();
}

/// A well-formed synthetic history: a gentle upward ramp with a repeating
/// wobble so EMAs, RSI and vol all get non-degenerate values.
pub fn insert_ramp(conn: &Connection, id: i64, start: NaiveDate, days: u64) {
    for i in 0..days {
        let ts = start + Days::new(i);
        let base = 100.0 + i as f64 * 0.3;
        let wobble = ((i % 7) as f64 - 3.0) * 0.8;
        let close = base + wobble;
        let open = close - 0.4;
        let high = close + 1.2;
        let low = open - 1.1;
        insert_price(conn, id, ts, open, high, low, close);
    }
}

pub fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |r| r.get(0)).unwrap()
}
