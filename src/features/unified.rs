//! Unified daily feature store: a materialised LEFT JOIN of bars, EMAs,
//! returns, volatility and TA by (id, ts). Missing upstreams degrade to NULL
//! columns instead of failing the refresh; the refresh horizon is the
//! minimum `daily_max_seen` across the populated sources.

use chrono::NaiveDate;
use rusqlite::{params, Connection};

use crate::db::state;
use crate::db::Db;
use crate::ema::variants::EmaVariantKind;
use crate::error::Result;
use crate::features::{self, FeatureOutcome};
use crate::run::{CancelToken, RefreshParams, RunStatus, RunSummary};

pub const COMPONENT: &str = "features_daily";

/// Components whose watermarks bound the refresh horizon, besides bars.
const SOURCE_COMPONENTS: &[&str] = &["feat_returns", "feat_vol", "feat_ta"];

pub struct UnifiedRefresher {
    cancel: CancelToken,
}

impl UnifiedRefresher {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    pub fn refresh(&self, db: &Db, params: &RefreshParams) -> Result<Vec<RunSummary>> {
        features::fan_out(db, COMPONENT, params, &self.cancel, |conn, id| {
            refresh_id(conn, id, params)
        })
    }
}

fn refresh_id(conn: &mut Connection, id: i64, params: &RefreshParams) -> Result<FeatureOutcome> {
    let Some((src_min, src_max)) = features::daily_bounds(conn, id)? else {
        return Ok(FeatureOutcome::no_new_data());
    };

    // Horizon: never run past a source that has not caught up yet.
    let mut horizon = src_max;
    for component in SOURCE_COMPONENTS {
        if let Some(max_seen) = state::min_max_seen_across(conn, &[component], id)? {
            horizon = horizon.min(max_seen);
        }
    }
    if features::covered(conn, COMPONENT, id, "1D", src_min, horizon, params.mode)? {
        return Ok(FeatureOutcome::no_new_data());
    }

    let ema_table = EmaVariantKind::MultiTfDaily.table();
    let insert = format!(
        "INSERT OR REPLACE INTO cmc_features_daily
             (id, ts, open, high, low, close, volume,
              ema_9, ema_21, ema_50, ema_200,
              ret_1d, ret_7d, ret_30d, log_ret_1d, ret_1d_z,
              park_20, gk_20, rs_20, atr_14,
              rsi_14, macd_hist_12_26_9, bb_upper_20_2, bb_lower_20_2, adx_14,
              is_outlier_ret, is_outlier_vol, ingested_at)
         SELECT b.id, b.ts, b.open, b.high, b.low, b.close, b.volume,
                e9.ema, e21.ema, e50.ema, e200.ema,
                r.ret_1d, r.ret_7d, r.ret_30d, r.log_ret_1d, r.ret_1d_z,
                v.park_20, v.gk_20, v.rs_20, v.atr_14,
                t.rsi_14, t.macd_hist_12_26_9, t.bb_upper_20_2, t.bb_lower_20_2, t.adx_14,
                r.is_outlier, v.is_outlier, ?3
         FROM cmc_price_bars_1d b
         LEFT JOIN {ema_table} e9
                ON e9.id = b.id AND e9.ts = b.ts AND e9.tf = '1D' AND e9.period = 9
         LEFT JOIN {ema_table} e21
                ON e21.id = b.id AND e21.ts = b.ts AND e21.tf = '1D' AND e21.period = 21
         LEFT JOIN {ema_table} e50
                ON e50.id = b.id AND e50.ts = b.ts AND e50.tf = '1D' AND e50.period = 50
         LEFT JOIN {ema_table} e200
                ON e200.id = b.id AND e200.ts = b.ts AND e200.tf = '1D' AND e200.period = 200
         LEFT JOIN cmc_feat_returns r
                ON r.id = b.id AND r.ts = b.ts AND r.tf = '1D' AND r.series = 'ema'
         LEFT JOIN cmc_feat_vol v ON v.id = b.id AND v.ts = b.ts AND v.tf = '1D'
         LEFT JOIN cmc_feat_ta t ON t.id = b.id AND t.ts = b.ts AND t.tf = '1D'
         WHERE b.id = ?1 AND b.tf = '1D' AND b.ts <= ?2"
    );

    let mut rows_written = 0usize;
    if params.mode.writes() {
        let tx = conn.transaction()?;
        rows_written = tx.execute(&insert, params![id, horizon, crate::db::now_utc()])?;
        features::advance_watermark(&tx, COMPONENT, id, "1D", src_min, horizon)?;
        tx.commit()?;
        let hash = feature_hash(conn, id, src_min, horizon)?;
        tracing::info!(id, rows = rows_written, hash = %hash, "unified feature store refreshed");
    }

    Ok(FeatureOutcome {
        rows_read: rows_written,
        rows_written,
        status: RunStatus::Ok,
    })
}

/// Deterministic hash of the stored feature rows for an id over a window.
/// Identical inputs always produce identical rows, so the hash is stable
/// across re-runs (`ingested_at` is excluded).
pub fn feature_hash(
    conn: &Connection,
    id: i64,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<String> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, close, ema_9, ema_21, ema_50, ema_200, ret_1d, park_20, rsi_14
         FROM cmc_features_daily
         WHERE id = ?1 AND ts >= ?2 AND ts <= ?3 ORDER BY ts",
    )?;
    let mut hasher = blake3::Hasher::new();
    let rows = stmt.query_map(params![id, start, end], |r| {
        let ts: NaiveDate = r.get(0)?;
        let mut line = ts.to_string();
        for col in 1..9 {
            let v: Option<f64> = r.get(col)?;
            line.push('|');
            match v {
                Some(x) => line.push_str(&format!("{x:.10}")),
                None => line.push('-'),
            }
        }
        Ok(line)
    })?;
    for line in rows {
        hasher.update(line?.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hasher.finalize().to_hex().to_string())
}
