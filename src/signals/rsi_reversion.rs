//! RSI mean-reversion entries: long on the bar RSI drops into the oversold
//! zone, short on the bar it rises into the overbought zone.

use polars::prelude::*;

use super::{Direction, EntryRule};
use crate::error::Result;
use crate::features::base::column_to_f64_opt;

pub struct RsiReversion {
    pub rsi_col: String,
    pub oversold: f64,
    pub overbought: f64,
}

impl EntryRule for RsiReversion {
    fn evaluate(&self, df: &DataFrame) -> Result<Vec<Option<Direction>>> {
        let rsi = column_to_f64_opt(df, &self.rsi_col)?;
        let n = df.height();
        let mut out = vec![None; n];
        for i in 1..n {
            let (Some(cur), Some(prev)) = (rsi[i], rsi[i - 1]) else {
                continue;
            };
            if cur < self.oversold && prev >= self.oversold {
                out[i] = Some(Direction::Long);
            } else if cur > self.overbought && prev <= self.overbought {
                out[i] = Some(Direction::Short);
            }
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "rsi_reversion"
    }

    fn setup(&self) -> &'static str {
        "reversion"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enters_on_zone_crossing_not_inside() {
        let df = df! {
            "rsi_14" => &[50.0, 28.0, 25.0, 45.0, 75.0, 80.0],
        }
        .unwrap();
        let rule = RsiReversion {
            rsi_col: "rsi_14".into(),
            oversold: 30.0,
            overbought: 70.0,
        };
        let out = rule.evaluate(&df).unwrap();
        assert_eq!(out[1], Some(Direction::Long)); // crossed into oversold
        assert_eq!(out[2], None); // already inside the zone
        assert_eq!(out[4], Some(Direction::Short));
        assert_eq!(out[5], None);
    }
}
