//! Regime analytics: flip detection (shift-compare per layer), per-regime
//! return statistics, and EMA comovement (Spearman correlation, sign
//! agreement, bounded-lag lead/lag) written as a scoped snapshot per refresh.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use statrs::statistics::Statistics;

use crate::config::Tunables;
use crate::db::Db;
use crate::ema::variants::EmaVariantKind;
use crate::error::Result;
use crate::features::{self, FeatureOutcome};
use crate::run::{CancelToken, RefreshParams, RunStatus, RunSummary};

pub const COMPONENT: &str = "regime_analytics";

/// Return columns probed, in preference order, for per-regime stats.
const RETURN_CANDIDATES: &[&str] = &["ret_1d", "log_ret_1d"];

pub struct RegimeAnalytics {
    tunables: Tunables,
    cancel: CancelToken,
}

impl RegimeAnalytics {
    pub fn new(tunables: Tunables, cancel: CancelToken) -> Self {
        Self { tunables, cancel }
    }

    pub fn refresh(&self, db: &Db, params: &RefreshParams) -> Result<Vec<RunSummary>> {
        features::fan_out(db, COMPONENT, params, &self.cancel, |conn, id| {
            self.refresh_id(conn, id, params)
        })
    }

    fn refresh_id(
        &self,
        conn: &mut Connection,
        id: i64,
        params: &RefreshParams,
    ) -> Result<FeatureOutcome> {
        let layers = load_layer_history(conn, id)?;
        if layers.ts.is_empty() {
            return Ok(FeatureOutcome::no_new_data());
        }
        if !params.mode.writes() {
            return Ok(FeatureOutcome {
                rows_read: layers.ts.len(),
                rows_written: 0,
                status: RunStatus::Ok,
            });
        }

        let tx = conn.transaction()?;
        let mut rows_written = 0usize;
        rows_written += write_flips(&tx, id, &layers)?;
        rows_written += write_stats(&tx, id)?;
        rows_written += self.write_comovement(&tx, id)?;
        tx.commit()?;

        Ok(FeatureOutcome {
            rows_read: layers.ts.len(),
            rows_written,
            status: RunStatus::Ok,
        })
    }

    /// Spearman, sign agreement, and best lead/lag for each configured EMA
    /// pair over the trailing window. Single snapshot per refresh: scoped
    /// delete then insert.
    fn write_comovement(&self, conn: &Connection, id: i64) -> Result<usize> {
        conn.execute(
            "DELETE FROM cmc_regime_comovement WHERE id = ?1 AND tf = '1D'",
            params![id],
        )?;
        let computed_at = crate::db::now_utc();
        let window = self.tunables.comovement_window as usize;
        let max_lag = self.tunables.comovement_max_lag as i64;
        let table = EmaVariantKind::MultiTfDaily.table();

        let mut written = 0usize;
        for &(a, b) in &self.tunables.comovement_pairs {
            let sa = load_ema_series(conn, table, id, a)?;
            let sb = load_ema_series(conn, table, id, b)?;
            let (xs, ys) = align_tail(&sa, &sb, window);
            if xs.len() < 10 {
                continue;
            }
            let spearman = spearman(&xs, &ys);
            let agreement = sign_agreement(&xs, &ys);
            let lead_lag = best_lead_lag(&xs, &ys, max_lag);
            conn.execute(
                "INSERT OR REPLACE INTO cmc_regime_comovement
                     (id, tf, ema_a, ema_b, spearman, sign_agreement, best_lead_lag,
                      window_rows, computed_at)
                 VALUES (?1, '1D', ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![id, a, b, spearman, agreement, lead_lag, xs.len() as i64, computed_at],
            )?;
            written += 1;
        }
        Ok(written)
    }
}

struct LayerHistory {
    ts: Vec<NaiveDate>,
    labels: [Vec<String>; 3],
}

fn load_layer_history(conn: &Connection, id: i64) -> Result<LayerHistory> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, l0_label, l1_label, l2_label
         FROM cmc_regimes WHERE id = ?1 AND tf = '1D' ORDER BY ts",
    )?;
    let mut history = LayerHistory {
        ts: Vec::new(),
        labels: [Vec::new(), Vec::new(), Vec::new()],
    };
    let rows = stmt.query_map(params![id], |r| {
        Ok((
            r.get::<_, NaiveDate>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
        ))
    })?;
    for row in rows {
        let (ts, l0, l1, l2) = row?;
        history.ts.push(ts);
        history.labels[0].push(l0);
        history.labels[1].push(l1);
        history.labels[2].push(l2);
    }
    Ok(history)
}

/// Shift-compare each layer's label sequence and emit one flip row per
/// change. The first assignment has `old_regime = NULL` and duration 0;
/// later flips carry the bar count since the previous flip.
fn write_flips(conn: &Connection, id: i64, history: &LayerHistory) -> Result<usize> {
    conn.execute(
        "DELETE FROM cmc_regime_flips WHERE id = ?1 AND tf = '1D'",
        params![id],
    )?;
    let ingested_at = crate::db::now_utc();
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO cmc_regime_flips
             (id, ts, tf, layer, old_regime, new_regime, duration_bars, ingested_at)
         VALUES (?1, ?2, '1D', ?3, ?4, ?5, ?6, ?7)",
    )?;
    let mut written = 0usize;
    for (layer_idx, layer_name) in ["L0", "L1", "L2"].iter().enumerate() {
        let labels = &history.labels[layer_idx];
        let mut last_flip_at = 0usize;
        for i in 0..labels.len() {
            let prev = if i == 0 { None } else { Some(&labels[i - 1]) };
            if prev.map(String::as_str) == Some(labels[i].as_str()) {
                continue;
            }
            let duration = (i - last_flip_at) as i64;
            stmt.execute(params![
                id,
                history.ts[i],
                layer_name,
                prev,
                labels[i],
                if prev.is_none() { 0 } else { duration },
                ingested_at,
            ])?;
            last_flip_at = i;
            written += 1;
        }
    }
    Ok(written)
}

/// Per-regime return stats grouped by regime_key. The return column is
/// auto-discovered from the candidate list against the unified store.
fn write_stats(conn: &Connection, id: i64) -> Result<usize> {
    let Some(ret_col) = discover_return_column(conn)? else {
        tracing::warn!(id, "no return column available, skipping regime stats");
        return Ok(0);
    };
    conn.execute(
        "DELETE FROM cmc_regime_stats WHERE id = ?1 AND tf = '1D'",
        params![id],
    )?;

    let sql = format!(
        "SELECT r.regime_key, f.{ret_col}
         FROM cmc_regimes r
         LEFT JOIN cmc_features_daily f ON f.id = r.id AND f.ts = r.ts
         WHERE r.id = ?1 AND r.tf = '1D'
         ORDER BY r.regime_key"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(String, Option<f64>)> = stmt
        .query_map(params![id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let total = rows.len();
    if total == 0 {
        return Ok(0);
    }

    let computed_at = crate::db::now_utc();
    let mut written = 0usize;
    let mut i = 0;
    while i < total {
        let key = rows[i].0.clone();
        let mut j = i;
        let mut rets = Vec::new();
        while j < total && rows[j].0 == key {
            if let Some(r) = rows[j].1 {
                rets.push(r);
            }
            j += 1;
        }
        let n_bars = (j - i) as i64;
        let (avg, std): (Option<f64>, Option<f64>) = if rets.is_empty() {
            (None, None)
        } else if rets.len() == 1 {
            (Some(rets[0]), None)
        } else {
            (
                Some((&rets[..]).mean()),
                Some((&rets[..]).std_dev()), // sample SD
            )
        };
        conn.execute(
            "INSERT OR REPLACE INTO cmc_regime_stats
                 (id, tf, regime_key, n_bars, pct_of_history, avg_ret_1d, std_ret_1d, computed_at)
             VALUES (?1, '1D', ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                key,
                n_bars,
                n_bars as f64 / total as f64,
                avg,
                std,
                computed_at
            ],
        )?;
        written += 1;
        i = j;
    }
    Ok(written)
}

fn discover_return_column(conn: &Connection) -> Result<Option<&'static str>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('cmc_features_daily')")?;
    let cols: Vec<String> = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(RETURN_CANDIDATES
        .iter()
        .find(|c| cols.iter().any(|have| have == *c))
        .copied())
}

fn load_ema_series(
    conn: &Connection,
    table: &str,
    id: i64,
    period: u32,
) -> Result<Vec<f64>> {
    let sql = format!(
        "SELECT ema FROM {table}
         WHERE id = ?1 AND tf = '1D' AND period = ?2 ORDER BY ts"
    );
    let mut stmt = conn.prepare(&sql)?;
    let values = stmt
        .query_map(params![id, period], |r| r.get::<_, f64>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(values)
}

fn align_tail(a: &[f64], b: &[f64], window: usize) -> (Vec<f64>, Vec<f64>) {
    let n = a.len().min(b.len()).min(window);
    (
        a[a.len() - n..].to_vec(),
        b[b.len() - n..].to_vec(),
    )
}

fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let mx = xs[..n].iter().sum::<f64>() / n as f64;
    let my = ys[..n].iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for i in 0..n {
        let dx = xs[i] - mx;
        let dy = ys[i] - my;
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }
    if vx <= 0.0 || vy <= 0.0 {
        return None;
    }
    Some(cov / (vx.sqrt() * vy.sqrt()))
}

fn ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut out = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        // average rank for ties
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            out[order[k]] = rank;
        }
        i = j + 1;
    }
    out
}

/// Spearman correlation: Pearson over ranks with average-tie handling.
pub fn spearman(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    pearson(&ranks(&xs[..n]), &ranks(&ys[..n]))
}

/// Fraction of rows where the day-over-day changes agree in sign.
pub fn sign_agreement(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let mut agree = 0usize;
    let mut counted = 0usize;
    for i in 1..n {
        let dx = xs[i] - xs[i - 1];
        let dy = ys[i] - ys[i - 1];
        if dx == 0.0 && dy == 0.0 {
            agree += 1;
            counted += 1;
        } else if dx != 0.0 || dy != 0.0 {
            counted += 1;
            if dx.signum() == dy.signum() {
                agree += 1;
            }
        }
    }
    (counted > 0).then(|| agree as f64 / counted as f64)
}

/// Lag in `[-max_lag, max_lag]` maximising cross-correlation; positive means
/// the first series leads the second.
pub fn best_lead_lag(xs: &[f64], ys: &[f64], max_lag: i64) -> Option<i64> {
    let n = xs.len().min(ys.len());
    if n < 4 {
        return None;
    }
    let mut best: Option<(i64, f64)> = None;
    for lag in -max_lag..=max_lag {
        let (a, b): (&[f64], &[f64]) = if lag >= 0 {
            let l = lag as usize;
            if l >= n {
                continue;
            }
            (&xs[..n - l], &ys[l..n])
        } else {
            let l = (-lag) as usize;
            if l >= n {
                continue;
            }
            (&xs[l..n], &ys[..n - l])
        };
        if let Some(r) = pearson(a, b) {
            if best.is_none_or(|(_, br)| r.abs() > br.abs()) {
                best = Some((lag, r));
            }
        }
    }
    best.map(|(lag, _)| lag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spearman_perfect_monotone() {
        let xs: Vec<f64> = (0..20).map(f64::from).collect();
        let ys: Vec<f64> = xs.iter().map(|x| x * x).collect(); // monotone, nonlinear
        assert!((spearman(&xs, &ys).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn spearman_inverse_monotone() {
        let xs: Vec<f64> = (0..20).map(f64::from).collect();
        let ys: Vec<f64> = xs.iter().map(|x| -x).collect();
        assert!((spearman(&xs, &ys).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn sign_agreement_counts_matching_moves() {
        let xs = vec![1.0, 2.0, 1.0, 2.0];
        let ys = vec![5.0, 6.0, 7.0, 8.0];
        // moves: (+,+) agree, (-,+) disagree, (+,+) agree
        assert!((sign_agreement(&xs, &ys).unwrap() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn lead_lag_detects_shifted_copy() {
        // aperiodic wave so only the true shift correlates perfectly
        let base: Vec<f64> = (0..80)
            .map(|i| (f64::from(i) * 0.37).sin() * 10.0 + f64::from(i) * 0.1)
            .collect();
        // ys trails xs by 3 steps: xs leads with lag +3
        let xs: Vec<f64> = base[3..].to_vec();
        let ys: Vec<f64> = base[..base.len() - 3].to_vec();
        assert_eq!(best_lead_lag(&xs, &ys, 10), Some(3));
    }

    #[test]
    fn ranks_average_ties() {
        let r = ranks(&[10.0, 20.0, 20.0, 30.0]);
        assert_eq!(r, vec![1.0, 2.5, 2.5, 4.0]);
    }
}
