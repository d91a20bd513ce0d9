//! Returns feature: multi-horizon arithmetic and log returns with first and
//! second order deltas, per-series sampling (daily-spaced vs canonical-close
//! spaced), gap-day tracking, rolling z-scores on the key horizons, and
//! flag-but-keep outliers. Null policy is `skip`: gap days stay null.

use chrono::NaiveDate;
use polars::prelude::*;
use rusqlite::{params, Connection};

use crate::config::Tunables;
use crate::db::dims::OutlierMethod;
use crate::db::{dims, Db};
use crate::ema::kernel::diff_all;
use crate::error::Result;
use crate::features::{self, base, FeatureOutcome};
use crate::run::{CancelToken, RefreshParams, RunStatus, RunSummary};

pub const COMPONENT: &str = "feat_returns";

/// Horizons with a physical column in `cmc_feat_returns`.
const HORIZON_COLUMNS: &[(u32, &str)] = &[
    (1, "ret_1d"),
    (3, "ret_3d"),
    (7, "ret_7d"),
    (14, "ret_14d"),
    (30, "ret_30d"),
];

/// |1-day return| above this is an outlier regardless of z-score.
const RET_1D_OUTLIER_ABS: f64 = 0.5;

pub struct ReturnsRefresher {
    tunables: Tunables,
    cancel: CancelToken,
}

struct SeriesRows {
    tf: String,
    series: &'static str,
    ts: Vec<NaiveDate>,
    /// Keyed by horizon column name.
    rets: Vec<(String, Vec<Option<f64>>)>,
    log_rets: Vec<(String, Vec<Option<f64>>)>,
    d1: Vec<Option<f64>>,
    d2: Vec<Option<f64>>,
    gap_days: Vec<Option<i64>>,
    z: Vec<(String, Vec<Option<f64>>)>,
    is_outlier: Vec<bool>,
}

impl ReturnsRefresher {
    pub fn new(tunables: Tunables, cancel: CancelToken) -> Self {
        Self { tunables, cancel }
    }

    pub fn refresh(&self, db: &Db, params: &RefreshParams) -> Result<Vec<RunSummary>> {
        let tfs = dims::load_timeframes(db.conn())?;
        let horizons: Vec<u32> = HORIZON_COLUMNS
            .iter()
            .map(|(n, _)| *n)
            .filter(|n| {
                self.tunables.return_windows.contains(n)
                    && tfs.iter().any(|t| t.tf_days == Some(*n))
            })
            .collect();
        let multi_tfs: Vec<(String, u32)> = tfs
            .iter()
            .filter(|t| {
                t.alignment == dims::Alignment::TfDay && t.tf_days.is_some_and(|d| d > 1)
            })
            .filter_map(|t| t.tf_days.map(|d| (t.tf.clone(), d)))
            .collect();

        features::fan_out(db, COMPONENT, params, &self.cancel, |conn, id| {
            self.refresh_id(conn, id, &horizons, &multi_tfs, params)
        })
    }

    fn refresh_id(
        &self,
        conn: &mut Connection,
        id: i64,
        horizons: &[u32],
        multi_tfs: &[(String, u32)],
        params: &RefreshParams,
    ) -> Result<FeatureOutcome> {
        let Some((src_min, src_max)) = features::daily_bounds(conn, id)? else {
            return Ok(FeatureOutcome::no_new_data());
        };
        if features::covered(conn, COMPONENT, id, "1D", src_min, src_max, params.mode)? {
            return Ok(FeatureOutcome::no_new_data());
        }

        let daily = features::load_daily_rows(conn, id)?;
        let policy = dims::load_feature_policy(conn, "returns")?;
        let mut all_series =
            vec![self.daily_series(&daily.ts, &daily.close, horizons, policy.outlier_method)?];
        for (tf, tf_days) in multi_tfs {
            all_series.push(bar_series(conn, id, tf, *tf_days)?);
        }

        let rows_read = daily.ts.len();
        let mut rows_written = 0;
        if params.mode.writes() {
            let tx = conn.transaction()?;
            for series in &all_series {
                rows_written += write_series(&tx, id, series)?;
            }
            features::advance_watermark(&tx, COMPONENT, id, "1D", src_min, src_max)?;
            tx.commit()?;
        } else {
            rows_written = all_series.iter().map(|s| s.ts.len()).sum();
        }

        Ok(FeatureOutcome {
            rows_read,
            rows_written,
            status: RunStatus::Ok,
        })
    }

    /// Daily-spaced series over 1d bar closes (`series='ema'`, tf `1D`).
    fn daily_series(
        &self,
        ts: &[NaiveDate],
        close: &[Option<f64>],
        horizons: &[u32],
        outlier_method: OutlierMethod,
    ) -> Result<SeriesRows> {
        let mut rets = Vec::new();
        let mut log_rets = Vec::new();
        for &n in horizons {
            let r = pct_change(close, n as usize);
            if let Some(col_name) = horizon_column(n) {
                log_rets.push((
                    format!("log_{col_name}"),
                    r.iter()
                        .map(|v| v.and_then(|x| (x + 1.0 > 0.0).then(|| (x + 1.0).ln())))
                        .collect(),
                ));
                rets.push((col_name.to_string(), r));
            }
        }

        // rolling z-scores on the designated key horizons only
        let mut z = Vec::new();
        let key_cols = ["ret_1d", "ret_7d", "ret_30d"];
        let columns: Vec<Column> = rets
            .iter()
            .filter(|(name, _)| key_cols.contains(&name.as_str()))
            .map(|(name, values)| {
                Float64Chunked::from_iter_options(name.as_str().into(), values.iter().copied())
                    .into_series()
                    .into_column()
            })
            .collect();
        if !columns.is_empty() {
            let df = DataFrame::new_infer_height(columns)?;
            let mut lf = df.lazy();
            let present: Vec<String> = key_cols
                .iter()
                .filter(|c| rets.iter().any(|(n, _)| n == *c))
                .map(|c| (*c).to_string())
                .collect();
            for name in &present {
                lf = base::with_rolling_zscore(
                    lf,
                    name,
                    self.tunables.zscore_window as usize,
                    &format!("{name}_z"),
                );
            }
            let out = lf.collect()?;
            for name in &present {
                z.push((
                    format!("{name}_z"),
                    base::column_to_f64_opt(&out, &format!("{name}_z"))?,
                ));
            }
        }

        let d1 = diff_all(close);
        let d2 = diff_all(&d1);
        let gap_days = gaps(ts);

        let ret_1d = rets
            .iter()
            .find(|(n, _)| n == "ret_1d")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| vec![None; ts.len()]);
        // method from dim_features, ORed with the hard |ret_1d| threshold
        let method_mask: Vec<bool> = match outlier_method {
            OutlierMethod::ZScore => {
                let z_cols: Vec<&[Option<f64>]> = z.iter().map(|(_, v)| v.as_slice()).collect();
                (0..ts.len())
                    .map(|i| {
                        z_cols.iter().any(|col| {
                            col[i].is_some_and(|v| v.abs() > self.tunables.outlier_sigma)
                        })
                    })
                    .collect()
            }
            OutlierMethod::Iqr => base::iqr_outlier_mask(&ret_1d, self.tunables.iqr_k),
        };
        let is_outlier = (0..ts.len())
            .map(|i| ret_1d[i].is_some_and(|r| r.abs() > RET_1D_OUTLIER_ABS) || method_mask[i])
            .collect();

        Ok(SeriesRows {
            tf: "1D".into(),
            series: "ema",
            ts: ts.to_vec(),
            rets,
            log_rets,
            d1,
            d2,
            gap_days,
            z,
            is_outlier,
        })
    }
}

/// Canonical-close-spaced series (`series='ema_bar'`) for one multi-TF
/// timeframe: returns over whole bars, mapped onto the day-horizon columns
/// they correspond to.
fn bar_series(conn: &Connection, id: i64, tf: &str, tf_days: u32) -> Result<SeriesRows> {
    let mut stmt = conn.prepare_cached(
        "SELECT time_close_bar, close, is_partial_end
         FROM cmc_price_bars_multi_tf WHERE id = ?1 AND tf = ?2 ORDER BY ts",
    )?;
    let raw: Vec<(NaiveDate, f64, bool)> = stmt
        .query_map(params![id, tf], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let n = raw.len();
    let closed: Vec<(NaiveDate, f64)> = raw
        .into_iter()
        .enumerate()
        .filter(|(i, (_, _, partial))| *i + 1 < n || !*partial)
        .map(|(_, (ts, close, _))| (ts, close))
        .collect();

    let ts: Vec<NaiveDate> = closed.iter().map(|(t, _)| *t).collect();
    let close: Vec<Option<f64>> = closed.iter().map(|(_, c)| Some(*c)).collect();

    let mut rets = Vec::new();
    let mut log_rets = Vec::new();
    let mut tf_ret: Vec<Option<f64>> = vec![None; ts.len()];
    for (horizon, col_name) in HORIZON_COLUMNS {
        if horizon % tf_days != 0 {
            continue;
        }
        let bars_back = (horizon / tf_days) as usize;
        let r = pct_change(&close, bars_back);
        if *horizon == tf_days {
            tf_ret.clone_from(&r);
        }
        log_rets.push((
            format!("log_{col_name}"),
            r.iter()
                .map(|v| v.and_then(|x| (x + 1.0 > 0.0).then(|| (x + 1.0).ln())))
                .collect(),
        ));
        rets.push(((*col_name).to_string(), r));
    }

    let d1 = diff_all(&close);
    let d2 = diff_all(&d1);
    let gap_days = gaps(&ts);
    let is_outlier = tf_ret
        .iter()
        .map(|v| v.is_some_and(|r| r.abs() > RET_1D_OUTLIER_ABS))
        .collect();

    Ok(SeriesRows {
        tf: tf.to_string(),
        series: "ema_bar",
        ts,
        rets,
        log_rets,
        d1,
        d2,
        gap_days,
        z: Vec::new(),
        is_outlier,
    })
}

fn horizon_column(n: u32) -> Option<&'static str> {
    HORIZON_COLUMNS
        .iter()
        .find(|(h, _)| *h == n)
        .map(|(_, c)| *c)
}

fn pct_change(values: &[Option<f64>], n: usize) -> Vec<Option<f64>> {
    let len = values.len();
    let mut out = vec![None; len];
    if n == 0 {
        return out;
    }
    for i in n..len {
        if let (Some(cur), Some(prev)) = (values[i], values[i - n]) {
            if prev != 0.0 {
                out[i] = Some(cur / prev - 1.0);
            }
        }
    }
    out
}

fn gaps(ts: &[NaiveDate]) -> Vec<Option<i64>> {
    let mut out = vec![None; ts.len()];
    for i in 1..ts.len() {
        out[i] = Some((ts[i] - ts[i - 1]).num_days());
    }
    out
}

fn write_series(conn: &Connection, id: i64, s: &SeriesRows) -> Result<usize> {
    let ingested_at = crate::db::now_utc();
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO cmc_feat_returns
             (id, tf, ts, series, roll, ret_1d, ret_3d, ret_7d, ret_14d, ret_30d,
              log_ret_1d, log_ret_7d, log_ret_30d, d1, d2, gap_days,
              ret_1d_z, ret_7d_z, ret_30d_z, is_outlier, ingested_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
    )?;
    let get = |set: &[(String, Vec<Option<f64>>)], name: &str, i: usize| -> Option<f64> {
        set.iter().find(|(n, _)| n == name).and_then(|(_, v)| v[i])
    };
    for i in 0..s.ts.len() {
        stmt.execute(params![
            id,
            s.tf,
            s.ts[i],
            s.series,
            get(&s.rets, "ret_1d", i),
            get(&s.rets, "ret_3d", i),
            get(&s.rets, "ret_7d", i),
            get(&s.rets, "ret_14d", i),
            get(&s.rets, "ret_30d", i),
            get(&s.log_rets, "log_ret_1d", i),
            get(&s.log_rets, "log_ret_7d", i),
            get(&s.log_rets, "log_ret_30d", i),
            s.d1[i],
            s.d2[i],
            s.gap_days[i],
            get(&s.z, "ret_1d_z", i),
            get(&s.z, "ret_7d_z", i),
            get(&s.z, "ret_30d_z", i),
            s.is_outlier[i],
            ingested_at,
        ])?;
    }
    Ok(s.ts.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn pct_change_matches_definition() {
        let values = vec![Some(100.0), Some(110.0), Some(99.0)];
        let r = pct_change(&values, 1);
        assert_eq!(r[0], None);
        assert!((r[1].unwrap() - 0.1).abs() < 1e-12);
        assert!((r[2].unwrap() + 0.1).abs() < 1e-12);
    }

    #[test]
    fn gap_days_tracks_calendar_distance() {
        let ts = vec![d("2025-01-01"), d("2025-01-02"), d("2025-01-05")];
        let g = gaps(&ts);
        assert_eq!(g, vec![None, Some(1), Some(3)]);
    }

    #[test]
    fn large_daily_move_is_outlier() {
        let tunables = Tunables::default();
        let refresher = ReturnsRefresher::new(tunables, CancelToken::new());
        let ts: Vec<NaiveDate> = (1..=4)
            .map(|i| d(&format!("2025-01-0{i}")))
            .collect();
        let close = vec![Some(100.0), Some(101.0), Some(160.0), Some(161.0)];
        let series = refresher
            .daily_series(&ts, &close, &[1], OutlierMethod::ZScore)
            .unwrap();
        assert!(series.is_outlier[2]); // +58% day
        assert!(!series.is_outlier[1]);
    }

    #[test]
    fn log_return_tracks_arith_return() {
        let tunables = Tunables::default();
        let refresher = ReturnsRefresher::new(tunables, CancelToken::new());
        let ts: Vec<NaiveDate> = (1..=3).map(|i| d(&format!("2025-01-0{i}"))).collect();
        let close = vec![Some(100.0), Some(110.0), Some(121.0)];
        let series = refresher
            .daily_series(&ts, &close, &[1], OutlierMethod::ZScore)
            .unwrap();
        let (_, log1) = series
            .log_rets
            .iter()
            .find(|(n, _)| n == "log_ret_1d")
            .unwrap();
        assert!((log1[1].unwrap() - (1.1_f64).ln()).abs() < 1e-12);
    }
}
