//! Technical indicators over daily bars, driven by the `dim_indicators`
//! parameter rows. The standard kit is RSI{7,14,21}, MACD{12/26/9, 8/17/9},
//! Stoch{14,3}, BB{20,2}, ATR{14}, ADX{14}; inactive rows simply do not
//! compute. RSI outside [0,100] is flagged critical: it indicates a bug,
//! not bad data.

use polars::prelude::*;
use rusqlite::{params, Connection};
use rust_ti::standard_indicators::bulk as sti;
use serde::Deserialize;

use crate::db::dims::{self, IndicatorSpec};
use crate::db::Db;
use crate::error::Result;
use crate::features::{self, base, FeatureOutcome};
use crate::run::{CancelToken, RefreshParams, RunStatus, RunSummary};

pub const COMPONENT: &str = "feat_ta";

#[derive(Debug, Deserialize)]
struct RsiParams {
    period: usize,
}

#[derive(Debug, Deserialize)]
struct MacdParams {
    fast: usize,
    slow: usize,
    signal: usize,
}

#[derive(Debug, Deserialize)]
struct StochParams {
    period: usize,
    smooth: usize,
}

#[derive(Debug, Deserialize)]
struct BbParams {
    period: usize,
    n_std: f64,
}

#[derive(Debug, Deserialize)]
struct PeriodParams {
    period: usize,
}

/// Computed columns keyed by their table column name.
type Columns = Vec<(String, Vec<Option<f64>>)>;

pub struct IndicatorRefresher {
    cancel: CancelToken,
}

impl IndicatorRefresher {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    pub fn refresh(&self, db: &Db, params: &RefreshParams) -> Result<Vec<RunSummary>> {
        let specs = dims::load_active_indicators(db.conn())?;
        features::fan_out(db, COMPONENT, params, &self.cancel, |conn, id| {
            refresh_id(conn, id, &specs, params)
        })
    }
}

fn refresh_id(
    conn: &mut Connection,
    id: i64,
    specs: &[IndicatorSpec],
    params: &RefreshParams,
) -> Result<FeatureOutcome> {
    let Some((src_min, src_max)) = features::daily_bounds(conn, id)? else {
        return Ok(FeatureOutcome::no_new_data());
    };
    if features::covered(conn, COMPONENT, id, "1D", src_min, src_max, params.mode)? {
        return Ok(FeatureOutcome::no_new_data());
    }

    let daily = features::load_daily_rows(conn, id)?;
    let policy = dims::load_feature_policy(conn, "ta")?;
    let df = df! {
        "high" => &daily.high,
        "low" => &daily.low,
        "close" => &daily.close,
    }?;
    let df = base::apply_null_policy(df, &["high", "low", "close"], &policy)?;
    let high = dense(&base::column_to_f64_opt(&df, "high")?);
    let low = dense(&base::column_to_f64_opt(&df, "low")?);
    let close = dense(&base::column_to_f64_opt(&df, "close")?);
    let n = close.len();

    let mut columns: Columns = Vec::new();
    for spec in specs {
        match compute_one(spec, &close, &high, &low, n) {
            Ok(mut cols) => columns.append(&mut cols),
            Err(e) => {
                tracing::warn!(name = %spec.name, error = %e, "skipping indicator");
            }
        }
    }

    // RSI outside [0,100] indicates a computation bug; flag critical.
    let mut is_outlier = vec![false; n];
    for (name, values) in &columns {
        if name.starts_with("rsi_") {
            for (i, v) in values.iter().enumerate() {
                if let Some(x) = v {
                    if !(0.0..=100.0).contains(x) {
                        tracing::error!(id, column = %name, value = x, "RSI out of [0,100]");
                        is_outlier[i] = true;
                    }
                }
            }
        }
    }

    let mut rows_written = 0;
    if params.mode.writes() {
        let tx = conn.transaction()?;
        let ingested_at = crate::db::now_utc();
        let mut stmt = tx.prepare_cached(
            "INSERT OR REPLACE INTO cmc_feat_ta
                 (id, tf, ts, rsi_7, rsi_14, rsi_21,
                  macd_12_26, macd_signal_12_26_9, macd_hist_12_26_9,
                  macd_8_17, macd_signal_8_17_9, macd_hist_8_17_9,
                  stoch_k_14, stoch_d_14_3, bb_upper_20_2, bb_mid_20_2, bb_lower_20_2,
                  atr_14, adx_14, close, is_outlier, ingested_at)
             VALUES (?1, '1D', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                     ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        )?;
        let get = |name: &str, i: usize| -> Option<f64> {
            columns
                .iter()
                .find(|(n, _)| n == name)
                .and_then(|(_, v)| v[i])
        };
        for i in 0..n {
            stmt.execute(params![
                id,
                daily.ts[i],
                get("rsi_7", i),
                get("rsi_14", i),
                get("rsi_21", i),
                get("macd_12_26", i),
                get("macd_signal_12_26_9", i),
                get("macd_hist_12_26_9", i),
                get("macd_8_17", i),
                get("macd_signal_8_17_9", i),
                get("macd_hist_8_17_9", i),
                get("stoch_k_14", i),
                get("stoch_d_14_3", i),
                get("bb_upper_20_2", i),
                get("bb_mid_20_2", i),
                get("bb_lower_20_2", i),
                get("atr_14", i),
                get("adx_14", i),
                close[i],
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
        rows_read: n,
        rows_written,
        status: RunStatus::Ok,
    })
}

fn compute_one(
    spec: &IndicatorSpec,
    close: &[f64],
    high: &[f64],
    low: &[f64],
    n: usize,
) -> anyhow::Result<Columns> {
    match spec.name.as_str() {
        "rsi" => {
            let p: RsiParams = serde_json::from_value(spec.params.clone())?;
            if n < p.period + 1 {
                return Ok(vec![(format!("rsi_{}", p.period), vec![None; n])]);
            }
            let values = if p.period == 14 {
                sti::rsi(close)
            } else {
                rust_ti::momentum_indicators::bulk::relative_strength_index(
                    close,
                    rust_ti::ConstantModelType::SmoothedMovingAverage,
                    p.period,
                )
            };
            Ok(vec![(format!("rsi_{}", p.period), pad(&values, n))])
        }
        "macd" => {
            let p: MacdParams = serde_json::from_value(spec.params.clone())?;
            if n < p.slow + p.signal {
                return Ok(Vec::new());
            }
            let (line, signal, hist) = if (p.fast, p.slow, p.signal) == (12, 26, 9) {
                let out = sti::macd(close);
                (
                    out.iter().map(|t| t.0).collect::<Vec<f64>>(),
                    out.iter().map(|t| t.1).collect::<Vec<f64>>(),
                    out.iter().map(|t| t.2).collect::<Vec<f64>>(),
                )
            } else {
                let line = rust_ti::momentum_indicators::bulk::macd_line(
                    close,
                    p.fast,
                    rust_ti::ConstantModelType::ExponentialMovingAverage,
                    p.slow,
                    rust_ti::ConstantModelType::ExponentialMovingAverage,
                );
                let signal = rust_ti::momentum_indicators::bulk::signal_line(
                    &line,
                    rust_ti::ConstantModelType::ExponentialMovingAverage,
                    p.signal,
                );
                let hist: Vec<f64> = line
                    .iter()
                    .skip(line.len() - signal.len())
                    .zip(&signal)
                    .map(|(m, s)| m - s)
                    .collect();
                (line, signal, hist)
            };
            Ok(vec![
                (format!("macd_{}_{}", p.fast, p.slow), pad(&line, n)),
                (
                    format!("macd_signal_{}_{}_{}", p.fast, p.slow, p.signal),
                    pad(&signal, n),
                ),
                (
                    format!("macd_hist_{}_{}_{}", p.fast, p.slow, p.signal),
                    pad(&hist, n),
                ),
            ])
        }
        "stoch" => {
            let p: StochParams = serde_json::from_value(spec.params.clone())?;
            if n < p.period {
                return Ok(Vec::new());
            }
            let k: Vec<f64> = close
                .windows(p.period)
                .map(|w| rust_ti::momentum_indicators::single::stochastic_oscillator(w))
                .collect();
            let d = sma(&k, p.smooth);
            Ok(vec![
                (format!("stoch_k_{}", p.period), pad(&k, n)),
                (format!("stoch_d_{}_{}", p.period, p.smooth), pad(&d, n)),
            ])
        }
        "bb" => {
            let p: BbParams = serde_json::from_value(spec.params.clone())?;
            if n < p.period {
                return Ok(Vec::new());
            }
            let bands = rust_ti::candle_indicators::bulk::moving_constant_bands(
                close,
                rust_ti::ConstantModelType::SimpleMovingAverage,
                rust_ti::DeviationModel::StandardDeviation,
                p.n_std,
                p.period,
            );
            let lower: Vec<f64> = bands.iter().map(|t| t.0).collect();
            let mid: Vec<f64> = bands.iter().map(|t| t.1).collect();
            let upper: Vec<f64> = bands.iter().map(|t| t.2).collect();
            let std_tag = if (p.n_std - p.n_std.round()).abs() < f64::EPSILON {
                format!("{}", p.n_std.round() as i64)
            } else {
                format!("{}", p.n_std)
            };
            Ok(vec![
                (format!("bb_upper_{}_{std_tag}", p.period), pad(&upper, n)),
                (format!("bb_mid_{}_{std_tag}", p.period), pad(&mid, n)),
                (format!("bb_lower_{}_{std_tag}", p.period), pad(&lower, n)),
            ])
        }
        "atr" => {
            let p: PeriodParams = serde_json::from_value(spec.params.clone())?;
            if n < p.period {
                return Ok(Vec::new());
            }
            let values: Vec<f64> = (0..=n - p.period)
                .map(|i| {
                    let end = i + p.period;
                    rust_ti::other_indicators::single::average_true_range(
                        &close[i..end],
                        &high[i..end],
                        &low[i..end],
                        rust_ti::ConstantModelType::SimpleMovingAverage,
                    )
                })
                .collect();
            Ok(vec![(format!("atr_{}", p.period), pad(&values, n))])
        }
        "adx" => {
            let p: PeriodParams = serde_json::from_value(spec.params.clone())?;
            Ok(vec![(format!("adx_{}", p.period), adx(high, low, close, p.period))])
        }
        other => anyhow::bail!("unknown indicator `{other}`"),
    }
}

/// Left-pad a bulk-indicator output to the source length with nulls.
fn pad(values: &[f64], n: usize) -> Vec<Option<f64>> {
    let padding = n.saturating_sub(values.len());
    let mut out = vec![None; padding];
    out.extend(values.iter().map(|v| v.is_finite().then_some(*v)));
    out.truncate(n);
    out
}

fn sma(values: &[f64], period: usize) -> Vec<f64> {
    if values.len() < period || period == 0 {
        return Vec::new();
    }
    values
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

fn dense(values: &[Option<f64>]) -> Vec<f64> {
    values.iter().map(|v| v.unwrap_or(f64::NAN)).collect()
}

/// Wilder's ADX. Directional movement smoothed over `period`, then the DX
/// series smoothed again over `period`.
fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = close.len();
    let mut out = vec![None; n];
    if n < 2 * period + 1 || period == 0 {
        return out;
    }

    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    let mut tr = vec![0.0; n];
    for i in 1..n {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
        tr[i] = (high[i] - low[i])
            .max((high[i] - close[i - 1]).abs())
            .max((low[i] - close[i - 1]).abs());
    }

    // Wilder smoothing: seed with a plain sum, then s = s - s/p + x
    let mut s_plus: f64 = plus_dm[1..=period].iter().sum();
    let mut s_minus: f64 = minus_dm[1..=period].iter().sum();
    let mut s_tr: f64 = tr[1..=period].iter().sum();
    let mut dx = vec![None; n];
    for i in period..n {
        if i > period {
            s_plus = s_plus - s_plus / period as f64 + plus_dm[i];
            s_minus = s_minus - s_minus / period as f64 + minus_dm[i];
            s_tr = s_tr - s_tr / period as f64 + tr[i];
        }
        if s_tr > 0.0 {
            let di_plus = 100.0 * s_plus / s_tr;
            let di_minus = 100.0 * s_minus / s_tr;
            let sum = di_plus + di_minus;
            if sum > 0.0 {
                dx[i] = Some(100.0 * (di_plus - di_minus).abs() / sum);
            }
        }
    }

    let mut adx_val: Option<f64> = None;
    let mut seed: Vec<f64> = Vec::with_capacity(period);
    for i in period..n {
        let Some(x) = dx[i] else { continue };
        adx_val = match adx_val {
            None => {
                seed.push(x);
                if seed.len() == period {
                    Some(seed.iter().sum::<f64>() / period as f64)
                } else {
                    None
                }
            }
            Some(prev) => Some((prev * (period as f64 - 1.0) + x) / period as f64),
        };
        out[i] = adx_val;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trending(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn pad_aligns_to_source_length() {
        let out = pad(&[1.0, 2.0], 5);
        assert_eq!(out, vec![None, None, None, Some(1.0), Some(2.0)]);
    }

    #[test]
    fn rsi_stays_in_bounds_on_trend() {
        let close = trending(60);
        let spec = IndicatorSpec {
            name: "rsi".into(),
            params: json!({"period": 14}),
        };
        let cols = compute_one(&spec, &close, &close, &close, 60).unwrap();
        let (_, values) = &cols[0];
        for v in values.iter().flatten() {
            assert!((0.0..=100.0).contains(v));
        }
        // strictly rising closes pin RSI at the top
        assert!(values.last().unwrap().unwrap() > 90.0);
    }

    #[test]
    fn bb_bands_straddle_price() {
        let close = trending(40);
        let spec = IndicatorSpec {
            name: "bb".into(),
            params: json!({"period": 20, "n_std": 2.0}),
        };
        let cols = compute_one(&spec, &close, &close, &close, 40).unwrap();
        let upper = cols.iter().find(|(n, _)| n == "bb_upper_20_2").unwrap();
        let lower = cols.iter().find(|(n, _)| n == "bb_lower_20_2").unwrap();
        let i = 39;
        assert!(upper.1[i].unwrap() > lower.1[i].unwrap());
    }

    #[test]
    fn adx_rises_in_a_strong_trend() {
        let n = 80;
        let close = trending(n);
        let high: Vec<f64> = close.iter().map(|c| c + 1.0).collect();
        let low: Vec<f64> = close.iter().map(|c| c - 1.0).collect();
        let out = adx(&high, &low, &close, 14);
        let last = out[n - 1].unwrap();
        assert!(last > 25.0, "persistent trend should push ADX up, got {last}");
        assert!(last <= 100.0);
    }

    #[test]
    fn short_series_produces_all_nulls() {
        let close = trending(5);
        let spec = IndicatorSpec {
            name: "rsi".into(),
            params: json!({"period": 14}),
        };
        let cols = compute_one(&spec, &close, &close, &close, 5).unwrap();
        assert!(cols[0].1.iter().all(Option::is_none));
    }
}
