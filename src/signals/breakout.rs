//! ATR breakout entries: a close moving more than `multiplier × ATR` beyond
//! the previous close is treated as a range break in that direction.

use polars::prelude::*;

use super::{Direction, EntryRule};
use crate::error::Result;
use crate::features::base::column_to_f64_opt;

pub struct AtrBreakout {
    pub close_col: String,
    pub atr_col: String,
    pub multiplier: f64,
}

impl EntryRule for AtrBreakout {
    fn evaluate(&self, df: &DataFrame) -> Result<Vec<Option<Direction>>> {
        let close = column_to_f64_opt(df, &self.close_col)?;
        let atr = column_to_f64_opt(df, &self.atr_col)?;
        let n = df.height();
        let mut out = vec![None; n];
        for i in 1..n {
            let (Some(cur), Some(prev), Some(range)) = (close[i], close[i - 1], atr[i - 1])
            else {
                continue;
            };
            if range <= 0.0 {
                continue;
            }
            let threshold = self.multiplier * range;
            if cur > prev + threshold {
                out[i] = Some(Direction::Long);
            } else if cur < prev - threshold {
                out[i] = Some(Direction::Short);
            }
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "atr_breakout"
    }

    fn setup(&self) -> &'static str {
        "breakout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakout_requires_atr_multiple() {
        let df = df! {
            "close" => &[100.0, 101.0, 110.0, 108.0, 90.0],
            "atr_14" => &[2.0, 2.0, 2.0, 2.0, 2.0],
        }
        .unwrap();
        let rule = AtrBreakout {
            close_col: "close".into(),
            atr_col: "atr_14".into(),
            multiplier: 1.5,
        };
        let out = rule.evaluate(&df).unwrap();
        assert_eq!(out[1], None); // +1 < 3.0 threshold
        assert_eq!(out[2], Some(Direction::Long)); // +9 > 3.0
        assert_eq!(out[3], None);
        assert_eq!(out[4], Some(Direction::Short)); // -18 < -3.0
    }

    #[test]
    fn zero_atr_never_fires() {
        let df = df! {
            "close" => &[100.0, 200.0],
            "atr_14" => &[0.0, 0.0],
        }
        .unwrap();
        let rule = AtrBreakout {
            close_col: "close".into(),
            atr_col: "atr_14".into(),
            multiplier: 1.5,
        };
        let out = rule.evaluate(&df).unwrap();
        assert!(out.iter().all(Option::is_none));
    }
}
