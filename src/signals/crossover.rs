//! EMA crossover entries: long when the fast EMA crosses above the slow,
//! short when it crosses below. Entries fire only on the crossing bar.

use polars::prelude::*;

use super::{Direction, EntryRule};
use crate::error::Result;
use crate::features::base::column_to_f64_opt;

pub struct EmaCrossover {
    pub fast_col: String,
    pub slow_col: String,
}

impl EntryRule for EmaCrossover {
    fn evaluate(&self, df: &DataFrame) -> Result<Vec<Option<Direction>>> {
        let fast = column_to_f64_opt(df, &self.fast_col)?;
        let slow = column_to_f64_opt(df, &self.slow_col)?;
        let n = df.height();
        let mut out = vec![None; n];
        for i in 1..n {
            let (Some(f), Some(s), Some(pf), Some(ps)) =
                (fast[i], slow[i], fast[i - 1], slow[i - 1])
            else {
                continue;
            };
            if f > s && pf <= ps {
                out[i] = Some(Direction::Long);
            } else if f < s && pf >= ps {
                out[i] = Some(Direction::Short);
            }
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "ema_cross"
    }

    fn setup(&self) -> &'static str {
        "trend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_only_on_the_crossing_bar() {
        let df = df! {
            "ema_9" => &[1.0, 2.0, 3.0, 4.0, 3.0],
            "ema_21" => &[2.0, 2.5, 2.5, 2.5, 3.5],
        }
        .unwrap();
        let rule = EmaCrossover {
            fast_col: "ema_9".into(),
            slow_col: "ema_21".into(),
        };
        let out = rule.evaluate(&df).unwrap();
        assert_eq!(out[2], Some(Direction::Long)); // 3.0 crosses above 2.5
        assert_eq!(out[3], None); // still above, no re-entry
        assert_eq!(out[4], Some(Direction::Short));
    }

    #[test]
    fn null_gap_suppresses_entry() {
        let df = df! {
            "ema_9" => &[Some(1.0), None, Some(3.0)],
            "ema_21" => &[Some(2.0), Some(2.5), Some(2.5)],
        }
        .unwrap();
        let rule = EmaCrossover {
            fast_col: "ema_9".into(),
            slow_col: "ema_21".into(),
        };
        let out = rule.evaluate(&df).unwrap();
        assert!(out.iter().all(Option::is_none));
    }
}
