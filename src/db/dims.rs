//! Dimension-table loaders. The dimension rows drive refresh selection:
//! builders and EMA refreshers filter `dim_timeframe` by alignment, roll
//! policy, and scheme, so adding a timeframe row is enough to include it.

use rusqlite::Connection;
use serde_json::Value;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    TfDay,
    Calendar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollPolicy {
    None,
    CalendarAnchor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseUnit {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl BaseUnit {
    /// Nominal day span used for alpha derivation on variable-length periods.
    pub fn effective_days(self) -> u32 {
        match self {
            BaseUnit::Day => 1,
            BaseUnit::Week => 7,
            BaseUnit::Month => 30,
            BaseUnit::Quarter => 91,
            BaseUnit::Year => 365,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Us,
    Iso,
}

#[derive(Debug, Clone)]
pub struct Timeframe {
    pub tf: String,
    pub tf_days: Option<u32>,
    pub alignment: Alignment,
    pub roll_policy: RollPolicy,
    pub base_unit: BaseUnit,
    pub scheme: Option<Scheme>,
    pub canonical: bool,
}

impl Timeframe {
    /// Day span used when sizing dirty windows and daily-space alphas.
    pub fn span_days(&self) -> u32 {
        self.tf_days.unwrap_or_else(|| self.base_unit.effective_days())
    }

    /// Calendar-week scheme rows match only their own scheme; scheme-free
    /// rows (months, quarters, years) are included in both scheme variants.
    pub fn matches_scheme(&self, scheme: Scheme) -> bool {
        self.scheme.is_none() || self.scheme == Some(scheme)
    }
}

fn parse_alignment(s: &str) -> Result<Alignment> {
    match s {
        "tf_day" => Ok(Alignment::TfDay),
        "calendar" => Ok(Alignment::Calendar),
        other => Err(PipelineError::Config(format!(
            "unknown alignment_type `{other}` in dim_timeframe"
        ))),
    }
}

fn parse_roll_policy(s: &str) -> Result<RollPolicy> {
    match s {
        "none" => Ok(RollPolicy::None),
        "calendar_anchor" => Ok(RollPolicy::CalendarAnchor),
        other => Err(PipelineError::Config(format!(
            "unknown roll_policy `{other}` in dim_timeframe"
        ))),
    }
}

fn parse_base_unit(s: &str) -> Result<BaseUnit> {
    match s {
        "D" => Ok(BaseUnit::Day),
        "W" => Ok(BaseUnit::Week),
        "M" => Ok(BaseUnit::Month),
        "Q" => Ok(BaseUnit::Quarter),
        "Y" => Ok(BaseUnit::Year),
        other => Err(PipelineError::Config(format!(
            "unknown base_unit `{other}` in dim_timeframe"
        ))),
    }
}

fn parse_scheme(s: &str) -> Result<Scheme> {
    match s {
        "US" => Ok(Scheme::Us),
        "ISO" => Ok(Scheme::Iso),
        other => Err(PipelineError::Config(format!(
            "unknown scheme `{other}` in dim_timeframe"
        ))),
    }
}

pub fn load_timeframes(conn: &Connection) -> Result<Vec<Timeframe>> {
    let mut stmt = conn.prepare(
        "SELECT tf, tf_days, alignment_type, roll_policy, base_unit, scheme, canonical
         FROM dim_timeframe WHERE canonical = 1 ORDER BY tf",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, Option<u32>>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, String>(4)?,
            r.get::<_, Option<String>>(5)?,
            r.get::<_, bool>(6)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (tf, tf_days, alignment, roll, unit, scheme, canonical) = row?;
        out.push(Timeframe {
            tf,
            tf_days,
            alignment: parse_alignment(&alignment)?,
            roll_policy: parse_roll_policy(&roll)?,
            base_unit: parse_base_unit(&unit)?,
            scheme: scheme.as_deref().map(parse_scheme).transpose()?,
            canonical,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct Session {
    pub asset_class: String,
    pub continuous: bool,
    pub trading_days_per_year: u32,
}

pub fn load_session(conn: &Connection, asset_class: &str) -> Result<Session> {
    let session = conn.query_row(
        "SELECT asset_class, continuous, trading_days_per_year
         FROM dim_sessions WHERE asset_class = ?1",
        [asset_class],
        |r| {
            Ok(Session {
                asset_class: r.get(0)?,
                continuous: r.get(1)?,
                trading_days_per_year: r.get(2)?,
            })
        },
    )?;
    Ok(session)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullPolicy {
    Skip,
    ForwardFill,
    Interpolate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierMethod {
    ZScore,
    Iqr,
}

#[derive(Debug, Clone)]
pub struct FeaturePolicy {
    pub feature: String,
    pub null_policy: NullPolicy,
    pub interpolate_limit: Option<u32>,
    pub outlier_method: OutlierMethod,
}

pub fn load_feature_policy(conn: &Connection, feature: &str) -> Result<FeaturePolicy> {
    let row = conn.query_row(
        "SELECT feature, null_policy, interpolate_limit, outlier_method
         FROM dim_features WHERE feature = ?1",
        [feature],
        |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<u32>>(2)?,
                r.get::<_, String>(3)?,
            ))
        },
    )?;
    let null_policy = match row.1.as_str() {
        "skip" => NullPolicy::Skip,
        "forward_fill" => NullPolicy::ForwardFill,
        "interpolate" => NullPolicy::Interpolate,
        other => {
            return Err(PipelineError::Config(format!(
                "unknown null_policy `{other}` for feature `{feature}`"
            )))
        }
    };
    let outlier_method = match row.3.as_str() {
        "zscore" => OutlierMethod::ZScore,
        "iqr" => OutlierMethod::Iqr,
        other => {
            return Err(PipelineError::Config(format!(
                "unknown outlier_method `{other}` for feature `{feature}`"
            )))
        }
    };
    Ok(FeaturePolicy {
        feature: row.0,
        null_policy,
        interpolate_limit: row.2,
        outlier_method,
    })
}

#[derive(Debug, Clone)]
pub struct IndicatorSpec {
    pub name: String,
    pub params: Value,
}

/// Active indicator parameter sets. Inactive rows are simply not selected.
pub fn load_active_indicators(conn: &Connection) -> Result<Vec<IndicatorSpec>> {
    let mut stmt = conn.prepare(
        "SELECT name, params FROM dim_indicators WHERE is_active = 1 ORDER BY name, params",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (name, raw) = row?;
        let params: Value = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::Config(format!("dim_indicators params for `{name}`: {e}"))
        })?;
        out.push(IndicatorSpec { name, params });
    }
    Ok(out)
}

/// All asset ids present in the upstream source.
pub fn list_source_ids(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT DISTINCT id FROM price_histories ORDER BY id")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, i64>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn seeded_timeframes_parse() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(&dir.path().join("t.db")).unwrap();
        let tfs = load_timeframes(db.conn()).unwrap();
        assert!(tfs.iter().any(|t| t.tf == "1D" && t.tf_days == Some(1)));
        assert!(tfs
            .iter()
            .any(|t| t.tf == "1W_CAL_ISO" && t.scheme == Some(Scheme::Iso)));
        let anchor = tfs.iter().find(|t| t.tf == "1M_CAL_ANCHOR").unwrap();
        assert_eq!(anchor.roll_policy, RollPolicy::CalendarAnchor);
        assert_eq!(anchor.span_days(), 30);
    }

    #[test]
    fn scheme_free_rows_match_both_schemes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(&dir.path().join("t.db")).unwrap();
        let tfs = load_timeframes(db.conn()).unwrap();
        let month = tfs.iter().find(|t| t.tf == "1M_CAL").unwrap();
        assert!(month.matches_scheme(Scheme::Us));
        assert!(month.matches_scheme(Scheme::Iso));
        let us_week = tfs.iter().find(|t| t.tf == "1W_CAL_US").unwrap();
        assert!(!us_week.matches_scheme(Scheme::Iso));
    }

    #[test]
    fn indicator_seed_is_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(&dir.path().join("t.db")).unwrap();
        let specs = load_active_indicators(db.conn()).unwrap();
        assert!(specs.iter().any(|s| s.name == "macd"));
        assert!(specs.len() >= 9);
    }
}
