//! Regime labelling refresh: walks each asset's unified feature history in
//! timestamp order, gates layers by data budget, applies hysteresis with
//! tightening bypass, resolves the policy, and writes one regime row per day.

use chrono::NaiveDate;
use rusqlite::{params, Connection};

use crate::config::Tunables;
use crate::db::Db;
use crate::error::Result;
use crate::features::{self, FeatureOutcome};
use crate::regime::hysteresis::HysteresisTracker;
use crate::regime::labeler::{
    self, DataBudget, EmaSnapshot, Layer, LABELER_VERSION,
};
use crate::regime::policy::{is_tightening, PolicyTable};
use crate::run::{CancelToken, RefreshParams, RunStatus, RunSummary};

pub const COMPONENT: &str = "regimes";

pub struct RegimeRefresher {
    tunables: Tunables,
    policy: PolicyTable,
    /// `--no-hysteresis` bypasses the min-hold filter entirely.
    hysteresis_enabled: bool,
    cancel: CancelToken,
}

impl RegimeRefresher {
    pub fn new(
        tunables: Tunables,
        policy: PolicyTable,
        hysteresis_enabled: bool,
        cancel: CancelToken,
    ) -> Self {
        Self {
            tunables,
            policy,
            hysteresis_enabled,
            cancel,
        }
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
        let Some((src_min, src_max)) = features::daily_bounds(conn, id)? else {
            return Ok(FeatureOutcome::no_new_data());
        };
        if features::covered(conn, COMPONENT, id, "1D", src_min, src_max, params.mode)? {
            return Ok(FeatureOutcome::no_new_data());
        }

        let rows = load_snapshots(conn, id)?;
        if rows.is_empty() {
            return Ok(FeatureOutcome::no_new_data());
        }
        let budget = load_budget(conn, id, rows.len())?;
        let l0_on = budget.layer_enabled(Layer::L0);
        let l1_on = budget.layer_enabled(Layer::L1);
        let l2_on = budget.layer_enabled(Layer::L2);
        let tier = labeler::feature_tier(l0_on, l1_on, l2_on);
        let version_hash = self.policy.version_hash(LABELER_VERSION);
        let min_hold = if self.hysteresis_enabled {
            self.tunables.min_bars_hold
        } else {
            1
        };

        let mut trackers = [
            HysteresisTracker::new(),
            HysteresisTracker::new(),
            HysteresisTracker::new(),
        ];

        let mut rows_written = 0usize;
        let tx = conn.transaction()?;
        let ingested_at = crate::db::now_utc();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO cmc_regimes
                     (id, ts, tf, l0_label, l1_label, l2_label, regime_key, feature_tier,
                      l0_enabled, l1_enabled, l2_enabled, size_mult, stop_mult, orders,
                      setups, gross_cap, pyramids, version_hash, ingested_at)
                 VALUES (?1, ?2, '1D', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                         ?14, ?15, ?16, ?17, ?18)",
            )?;

            for (ts, snapshot) in &rows {
                let raw = [
                    if l0_on {
                        labeler::label_l0(snapshot)
                    } else {
                        labeler::proxy_label(Layer::L0, snapshot)
                    },
                    if l1_on {
                        labeler::label_l1(snapshot)
                    } else {
                        labeler::proxy_label(Layer::L1, snapshot)
                    },
                    if l2_on {
                        labeler::label_l2(snapshot)
                    } else {
                        labeler::proxy_label(Layer::L2, snapshot)
                    },
                ];

                let mut committed = [String::new(), String::new(), String::new()];
                for (slot, layer) in [Layer::L0, Layer::L1, Layer::L2].iter().enumerate() {
                    let policy = &self.policy;
                    let key = layer.key();
                    committed[slot] = trackers[slot].observe(raw[slot], min_hold, |old, new| {
                        is_tightening(&policy.for_label(key, old), &policy.for_label(key, new))
                    });
                }

                let resolved = self
                    .policy
                    .resolve(&committed[0], &committed[1], &committed[2]);
                let key = labeler::regime_key(&committed[0], &committed[1], &committed[2]);

                if params.mode.writes() {
                    stmt.execute(params![
                        id,
                        ts,
                        committed[0],
                        committed[1],
                        committed[2],
                        key,
                        tier,
                        l0_on,
                        l1_on,
                        l2_on,
                        resolved.size_mult,
                        resolved.stop_mult,
                        serde_json::to_string(&resolved.orders).unwrap_or_default(),
                        serde_json::to_string(&resolved.setups).unwrap_or_default(),
                        resolved.gross_cap,
                        resolved.pyramids,
                        version_hash,
                        ingested_at,
                    ])?;
                }
                rows_written += 1;
            }
        }
        if params.mode.writes() {
            features::advance_watermark(&tx, COMPONENT, id, "1D", src_min, src_max)?;
            tx.commit()?;
        }

        Ok(FeatureOutcome {
            rows_read: rows.len(),
            rows_written,
            status: RunStatus::Ok,
        })
    }
}

fn load_snapshots(conn: &Connection, id: i64) -> Result<Vec<(NaiveDate, EmaSnapshot)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, close, ema_9, ema_21, ema_50, ema_200
         FROM cmc_features_daily WHERE id = ?1 ORDER BY ts",
    )?;
    let rows = stmt
        .query_map(params![id], |r| {
            Ok((
                r.get::<_, NaiveDate>(0)?,
                EmaSnapshot {
                    close: r.get(1)?,
                    ema_9: r.get(2)?,
                    ema_21: r.get(3)?,
                    ema_50: r.get(4)?,
                    ema_200: r.get(5)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Bar-history counts per granularity. Calendar weekly/monthly bars come from
/// the US-scheme calendar table; if that family has not been built the counts
/// are zero and the corresponding layers fall back to proxies.
fn load_budget(conn: &Connection, id: i64, daily_bars: usize) -> Result<DataBudget> {
    let weekly_bars: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cmc_price_bars_cal_us WHERE id = ?1 AND tf = '1W_CAL_US'",
        params![id],
        |r| r.get(0),
    )?;
    let monthly_bars: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cmc_price_bars_cal_us WHERE id = ?1 AND tf = '1M_CAL'",
        params![id],
        |r| r.get(0),
    )?;
    Ok(DataBudget {
        daily_bars,
        weekly_bars: weekly_bars as usize,
        monthly_bars: monthly_bars as usize,
    })
}
