//! Volatility estimators over daily OHLC: Parkinson, Garman-Klass,
//! Rogers-Satchell across rolling windows, plus ATR. Annualised by
//! `sqrt(periods_per_year)` from the session calendar. Null policy is
//! forward-fill; annualised vol above 500% is flagged-but-kept.

use polars::prelude::*;
use rusqlite::{params, Connection};

use crate::config::Tunables;
use crate::db::dims::{self, OutlierMethod};
use crate::db::Db;
use crate::error::Result;
use crate::features::{self, base, FeatureOutcome};
use crate::run::{CancelToken, RefreshParams, RunStatus, RunSummary};

pub const COMPONENT: &str = "feat_vol";

/// Annualised volatility above this is an outlier (5.0 = 500%).
const VOL_OUTLIER_ANN: f64 = 5.0;

const LN_4: f64 = 1.386_294_361_119_890_6; // 4 ln 2

pub struct VolatilityRefresher {
    tunables: Tunables,
    cancel: CancelToken,
}

impl VolatilityRefresher {
    pub fn new(tunables: Tunables, cancel: CancelToken) -> Self {
        Self { tunables, cancel }
    }

    pub fn refresh(&self, db: &Db, params: &RefreshParams) -> Result<Vec<RunSummary>> {
        let session = dims::load_session(db.conn(), "crypto")?;
        let ann = f64::from(session.trading_days_per_year).sqrt();
        features::fan_out(db, COMPONENT, params, &self.cancel, |conn, id| {
            self.refresh_id(conn, id, ann, params)
        })
    }

    fn refresh_id(
        &self,
        conn: &mut Connection,
        id: i64,
        ann: f64,
        params: &RefreshParams,
    ) -> Result<FeatureOutcome> {
        let Some((src_min, src_max)) = features::daily_bounds(conn, id)? else {
            return Ok(FeatureOutcome::no_new_data());
        };
        if features::covered(conn, COMPONENT, id, "1D", src_min, src_max, params.mode)? {
            return Ok(FeatureOutcome::no_new_data());
        }

        let daily = features::load_daily_rows(conn, id)?;
        let policy = dims::load_feature_policy(conn, "volatility")?;
        let df = df! {
            "open" => &daily.open,
            "high" => &daily.high,
            "low" => &daily.low,
            "close" => &daily.close,
        }?;
        let df = base::apply_null_policy(df, &["open", "high", "low", "close"], &policy)?;
        let open = base::column_to_f64_opt(&df, "open")?;
        let high = base::column_to_f64_opt(&df, "high")?;
        let low = base::column_to_f64_opt(&df, "low")?;
        let close = base::column_to_f64_opt(&df, "close")?;
        let n = close.len();

        // per-day squared-range terms; rolling means below turn them into
        // variances per estimator
        let mut park_term = vec![None; n];
        let mut gk_term = vec![None; n];
        let mut rs_term = vec![None; n];
        for i in 0..n {
            let (Some(o), Some(h), Some(l), Some(c)) = (open[i], high[i], low[i], close[i])
            else {
                continue;
            };
            if o <= 0.0 || h <= 0.0 || l <= 0.0 || c <= 0.0 {
                continue;
            }
            let hl = (h / l).ln();
            let co = (c / o).ln();
            park_term[i] = Some(hl * hl / LN_4);
            gk_term[i] = Some(0.5 * hl * hl - (2.0 * std::f64::consts::LN_2 - 1.0) * co * co);
            let hc = (h / c).ln();
            let ho = (h / o).ln();
            let lc = (l / c).ln();
            let lo = (l / o).ln();
            rs_term[i] = Some(hc * ho + lc * lo);
        }

        let windows = &self.tunables.vol_windows;
        let mut park = Vec::new();
        let mut gk = Vec::new();
        let mut rs = Vec::new();
        for &w in windows {
            park.push((w, annualised_sqrt_mean(&park_term, w as usize, ann)));
            gk.push((w, annualised_sqrt_mean(&gk_term, w as usize, ann)));
            rs.push((w, annualised_sqrt_mean(&rs_term, w as usize, ann)));
        }
        let atr_14 = atr(&close, &high, &low, 14);

        // rolling z-score for the key series (shortest-window Parkinson)
        let park_key = park.first().map(|(_, v)| v.clone()).unwrap_or_default();
        let z = if park_key.is_empty() {
            Vec::new()
        } else {
            let s = Float64Chunked::from_iter_options("park_key".into(), park_key.iter().copied())
                .into_series()
                .into_column();
            let zdf = base::with_rolling_zscore(
                DataFrame::new_infer_height(vec![s])?.lazy(),
                "park_key",
                self.tunables.zscore_window as usize,
                "park_key_z",
            )
            .collect()?;
            base::column_to_f64_opt(&zdf, "park_key_z")?
        };

        // configured method (IQR fences on ATR, or z-score on the key
        // Parkinson series), ORed with the hard annualised-vol threshold
        let method_mask: Vec<bool> = match policy.outlier_method {
            OutlierMethod::Iqr => base::iqr_outlier_mask(&atr_14, self.tunables.iqr_k),
            OutlierMethod::ZScore => z
                .iter()
                .map(|v| v.is_some_and(|x| x.abs() > self.tunables.outlier_sigma))
                .collect(),
        };
        let is_outlier: Vec<bool> = (0..n)
            .map(|i| {
                method_mask.get(i).copied().unwrap_or(false)
                    || park
                        .iter()
                        .chain(gk.iter())
                        .chain(rs.iter())
                        .any(|(_, v)| v[i].is_some_and(|x| x > VOL_OUTLIER_ANN))
            })
            .collect();

        let rows_read = n;
        let mut rows_written = 0;
        if params.mode.writes() {
            let tx = conn.transaction()?;
            let ingested_at = crate::db::now_utc();
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO cmc_feat_vol
                     (id, tf, ts, park_20, park_63, park_126, gk_20, gk_63, gk_126,
                      rs_20, rs_63, rs_126, atr_14, close, park_20_z, is_outlier, ingested_at)
                 VALUES (?1, '1D', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )?;
            let pick = |set: &[(u32, Vec<Option<f64>>)], w: u32, i: usize| -> Option<f64> {
                set.iter().find(|(win, _)| *win == w).and_then(|(_, v)| v[i])
            };
            for i in 0..n {
                let Some(c) = close[i] else { continue };
                stmt.execute(params![
                    id,
                    daily.ts[i],
                    pick(&park, 20, i),
                    pick(&park, 63, i),
                    pick(&park, 126, i),
                    pick(&gk, 20, i),
                    pick(&gk, 63, i),
                    pick(&gk, 126, i),
                    pick(&rs, 20, i),
                    pick(&rs, 63, i),
                    pick(&rs, 126, i),
                    atr_14[i],
                    c,
                    z.get(i).copied().flatten(),
                    is_outlier[i],
                    ingested_at,
                ])?;
                rows_written += 1;
            }
            drop(stmt);
            features::advance_watermark(&tx, COMPONENT, id, "1D", src_min, src_max)?;
            tx.commit()?;
        } else {
            rows_written = n;
        }

        Ok(FeatureOutcome {
            rows_read,
            rows_written,
            status: RunStatus::Ok,
        })
    }
}

fn annualised_sqrt_mean(terms: &[Option<f64>], window: usize, ann: f64) -> Vec<Option<f64>> {
    base::rolling_mean(terms, window)
        .into_iter()
        .map(|v| v.map(|x| x.max(0.0).sqrt() * ann))
        .collect()
}

/// ATR as an SMA over true ranges against the previous close.
fn atr(
    close: &[Option<f64>],
    high: &[Option<f64>],
    low: &[Option<f64>],
    period: usize,
) -> Vec<Option<f64>> {
    let n = close.len();
    let mut tr = vec![None; n];
    for i in 0..n {
        let (Some(h), Some(l)) = (high[i], low[i]) else {
            continue;
        };
        let range = match i.checked_sub(1).and_then(|j| close[j]) {
            Some(prev) => (h - l).max((h - prev).abs()).max((l - prev).abs()),
            None => h - l,
        };
        tr[i] = Some(range);
    }
    base::rolling_mean(&tr, period)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parkinson_zero_for_flat_days() {
        // h == l means zero range, zero variance
        let terms: Vec<Option<f64>> = vec![Some(0.0); 25];
        let out = annualised_sqrt_mean(&terms, 20, 365.0_f64.sqrt());
        assert_eq!(out[24], Some(0.0));
        assert_eq!(out[10], None); // window not yet full
    }

    #[test]
    fn atr_uses_true_range_against_prev_close() {
        let close = vec![Some(100.0), Some(100.0), Some(100.0)];
        let high = vec![Some(101.0), Some(105.0), Some(101.0)];
        let low = vec![Some(99.0), Some(100.5), Some(99.0)];
        let out = atr(&close, &high, &low, 1);
        // day 1: gap above prev close dominates: max(4.5, 5.0, 0.5) = 5.0
        assert_eq!(out[1], Some(5.0));
    }

    #[test]
    fn annualisation_scales_by_sqrt_days() {
        let terms: Vec<Option<f64>> = vec![Some(0.0004); 30];
        let daily = annualised_sqrt_mean(&terms, 20, 1.0);
        let annual = annualised_sqrt_mean(&terms, 20, 365.0_f64.sqrt());
        let ratio = annual[29].unwrap() / daily[29].unwrap();
        assert!((ratio - 365.0_f64.sqrt()).abs() < 1e-9);
    }
}
