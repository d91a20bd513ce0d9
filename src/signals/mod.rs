//! Signal generators over the unified daily feature store. Each generator
//! applies a deterministic entry rule to a per-asset DataFrame and emits
//! regime-annotated records. With `regime_enabled = false` the `regime_key`
//! column is NULL, enabling A/B comparison over identical inputs.

pub mod breakout;
pub mod crossover;
pub mod rsi_reversion;

use chrono::NaiveDate;
use polars::prelude::*;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use crate::db::Db;
use crate::error::Result;
use crate::features::{self, base, FeatureOutcome};
use crate::run::{CancelToken, RefreshParams, RunStatus, RunSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

/// An entry rule evaluates the feature frame and marks entry rows.
/// The frame is row-aligned with the per-asset timestamp vector.
pub trait EntryRule: Send + Sync {
    fn evaluate(&self, df: &DataFrame) -> Result<Vec<Option<Direction>>>;
    fn name(&self) -> &'static str;
    /// Setup class checked against the regime policy's allowed setups.
    fn setup(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    EmaCross,
    RsiReversion,
    AtrBreakout,
}

impl GeneratorKind {
    pub fn table(self) -> &'static str {
        match self {
            GeneratorKind::EmaCross => "cmc_signals_ema_cross",
            GeneratorKind::RsiReversion => "cmc_signals_rsi_reversion",
            GeneratorKind::AtrBreakout => "cmc_signals_atr_breakout",
        }
    }

    pub fn component(self) -> &'static str {
        match self {
            GeneratorKind::EmaCross => "signals_ema_cross",
            GeneratorKind::RsiReversion => "signals_rsi_reversion",
            GeneratorKind::AtrBreakout => "signals_atr_breakout",
        }
    }

    fn rule(self) -> Box<dyn EntryRule> {
        match self {
            GeneratorKind::EmaCross => Box::new(crossover::EmaCrossover {
                fast_col: "ema_9".into(),
                slow_col: "ema_21".into(),
            }),
            GeneratorKind::RsiReversion => Box::new(rsi_reversion::RsiReversion {
                rsi_col: "rsi_14".into(),
                oversold: 30.0,
                overbought: 70.0,
            }),
            GeneratorKind::AtrBreakout => Box::new(breakout::AtrBreakout {
                close_col: "close".into(),
                atr_col: "atr_14".into(),
                multiplier: 1.5,
            }),
        }
    }
}

pub struct SignalGenerator {
    kind: GeneratorKind,
    /// Annotation-only A/B switch: policy enforcement stays out of scope.
    regime_enabled: bool,
    cancel: CancelToken,
}

impl SignalGenerator {
    pub fn new(kind: GeneratorKind, regime_enabled: bool, cancel: CancelToken) -> Self {
        Self {
            kind,
            regime_enabled,
            cancel,
        }
    }

    pub fn refresh(&self, db: &Db, params: &RefreshParams) -> Result<Vec<RunSummary>> {
        features::fan_out(db, self.kind.component(), params, &self.cancel, |conn, id| {
            self.refresh_id(conn, id, params)
        })
    }

    fn refresh_id(
        &self,
        conn: &mut Connection,
        id: i64,
        params: &RefreshParams,
    ) -> Result<FeatureOutcome> {
        let component = self.kind.component();
        let Some((src_min, src_max)) = features::daily_bounds(conn, id)? else {
            return Ok(FeatureOutcome::no_new_data());
        };
        if features::covered(conn, component, id, "1D", src_min, src_max, params.mode)? {
            return Ok(FeatureOutcome::no_new_data());
        }

        let (ts, df) = load_feature_frame(conn, id)?;
        if ts.is_empty() {
            return Ok(FeatureOutcome::no_new_data());
        }
        let rule = self.kind.rule();
        let entries = rule.evaluate(&df)?;
        let close = base::column_to_f64_opt(&df, "close")?;

        let mut rows_written = 0usize;
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "INSERT OR REPLACE INTO {}
                     (id, ts, direction, entry_price, regime_key, setup_allowed,
                      features, ingested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                self.kind.table()
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            let ingested_at = crate::db::now_utc();
            for (i, entry) in entries.iter().enumerate() {
                let Some(direction) = entry else { continue };
                let Some(entry_price) = close[i] else { continue };
                let (regime_key, setup_allowed) = if self.regime_enabled {
                    regime_at(&tx, id, ts[i], rule.setup())?
                } else {
                    (None, None)
                };
                let snapshot = feature_snapshot(&df, i)?;
                if params.mode.writes() {
                    stmt.execute(params![
                        id,
                        ts[i],
                        direction.as_str(),
                        entry_price,
                        regime_key,
                        setup_allowed,
                        snapshot,
                        ingested_at,
                    ])?;
                }
                rows_written += 1;
            }
        }
        if params.mode.writes() {
            features::advance_watermark(&tx, component, id, "1D", src_min, src_max)?;
            tx.commit()?;
        }

        Ok(FeatureOutcome {
            rows_read: ts.len(),
            rows_written,
            status: RunStatus::Ok,
        })
    }
}

/// Regime context at the entry timestamp: the composite key and whether the
/// active policy's setups include this generator's setup class.
fn regime_at(
    conn: &Connection,
    id: i64,
    ts: NaiveDate,
    setup: &str,
) -> Result<(Option<String>, Option<bool>)> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT regime_key, setups FROM cmc_regimes
             WHERE id = ?1 AND ts = ?2 AND tf = '1D'",
            params![id, ts],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(match row {
        None => (None, None),
        Some((key, setups_json)) => {
            let allowed = serde_json::from_str::<Vec<String>>(&setups_json)
                .map(|setups| setups.iter().any(|s| s == setup))
                .unwrap_or(false);
            (Some(key), Some(allowed))
        }
    })
}

fn load_feature_frame(conn: &Connection, id: i64) -> Result<(Vec<NaiveDate>, DataFrame)> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, close, ema_9, ema_21, rsi_14, atr_14
         FROM cmc_features_daily WHERE id = ?1 ORDER BY ts",
    )?;
    let mut ts = Vec::new();
    let mut close = Vec::new();
    let mut ema_9 = Vec::new();
    let mut ema_21 = Vec::new();
    let mut rsi_14 = Vec::new();
    let mut atr_14 = Vec::new();
    let rows = stmt.query_map(params![id], |r| {
        Ok((
            r.get::<_, NaiveDate>(0)?,
            r.get::<_, Option<f64>>(1)?,
            r.get::<_, Option<f64>>(2)?,
            r.get::<_, Option<f64>>(3)?,
            r.get::<_, Option<f64>>(4)?,
            r.get::<_, Option<f64>>(5)?,
        ))
    })?;
    for row in rows {
        let (t, c, e9, e21, rsi, atr) = row?;
        ts.push(t);
        close.push(c);
        ema_9.push(e9);
        ema_21.push(e21);
        rsi_14.push(rsi);
        atr_14.push(atr);
    }
    let df = df! {
        "close" => &close,
        "ema_9" => &ema_9,
        "ema_21" => &ema_21,
        "rsi_14" => &rsi_14,
        "atr_14" => &atr_14,
    }?;
    Ok((ts, df))
}

/// JSON snapshot of the feature row active at entry.
fn feature_snapshot(df: &DataFrame, i: usize) -> Result<String> {
    let mut obj = serde_json::Map::new();
    for name in ["close", "ema_9", "ema_21", "rsi_14", "atr_14"] {
        let values = base::column_to_f64_opt(df, name)?;
        obj.insert(name.to_string(), json!(values[i]));
    }
    Ok(serde_json::Value::Object(obj).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_round_trip() {
        assert_eq!(Direction::Long.as_str(), "long");
        assert_eq!(Direction::Short.as_str(), "short");
    }

    #[test]
    fn generator_tables_are_distinct() {
        let tables = [
            GeneratorKind::EmaCross.table(),
            GeneratorKind::RsiReversion.table(),
            GeneratorKind::AtrBreakout.table(),
        ];
        assert_eq!(
            tables.len(),
            tables.iter().collect::<std::collections::HashSet<_>>().len()
        );
    }
}
