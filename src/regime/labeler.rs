//! Multi-layer regime labeler: L0 (cycle), L1 (weekly macro), L2 (daily
//! trend) as pure functions over a wide-format EMA snapshot, with data-budget
//! gating that falls back to conservative proxy labels instead of nulls.

pub const LABELER_VERSION: &str = "labeler-v1";

/// Bar-history requirements per layer.
pub const L0_MIN_MONTHLY_BARS: usize = 60;
pub const L1_MIN_WEEKLY_BARS: usize = 52;
pub const L2_MIN_DAILY_BARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    L0,
    L1,
    L2,
}

impl Layer {
    pub fn as_str(self) -> &'static str {
        match self {
            Layer::L0 => "L0",
            Layer::L1 => "L1",
            Layer::L2 => "L2",
        }
    }

    /// Lower-case key used in the policy table.
    pub fn key(self) -> &'static str {
        match self {
            Layer::L0 => "l0",
            Layer::L1 => "l1",
            Layer::L2 => "l2",
        }
    }
}

/// Wide-format EMA snapshot for one (id, ts).
#[derive(Debug, Clone, Copy, Default)]
pub struct EmaSnapshot {
    pub close: Option<f64>,
    pub ema_9: Option<f64>,
    pub ema_21: Option<f64>,
    pub ema_50: Option<f64>,
    pub ema_200: Option<f64>,
}

/// L0 cycle label from the long EMAs.
pub fn label_l0(s: &EmaSnapshot) -> &'static str {
    match (s.close, s.ema_50, s.ema_200) {
        (Some(close), Some(e50), Some(e200)) => {
            if close > e200 && e50 > e200 {
                "bull_cycle"
            } else if close < e200 && e50 < e200 {
                "bear_cycle"
            } else {
                "transition"
            }
        }
        _ => infer_cycle_proxy(s),
    }
}

/// Conservative cycle proxy when the full EMA set is unavailable: lean on
/// whatever long EMA exists, defaulting to `transition`.
pub fn infer_cycle_proxy(s: &EmaSnapshot) -> &'static str {
    match (s.close, s.ema_200.or(s.ema_50)) {
        (Some(close), Some(long)) if close > long => "bull_cycle",
        (Some(close), Some(long)) if close < long => "bear_cycle",
        _ => "transition",
    }
}

/// L1 weekly-macro label from the mid EMAs.
pub fn label_l1(s: &EmaSnapshot) -> &'static str {
    match (s.ema_21, s.ema_50) {
        (Some(e21), Some(e50)) if e21 > e50 => "risk_on",
        (Some(e21), Some(e50)) if e21 < e50 => "risk_off",
        _ => "neutral",
    }
}

/// L2 daily-trend label from the fast EMAs.
pub fn label_l2(s: &EmaSnapshot) -> &'static str {
    match (s.close, s.ema_9, s.ema_21) {
        (Some(close), Some(e9), Some(e21)) if e9 > e21 && close > e21 => "bull",
        (Some(close), Some(e9), Some(e21)) if e9 < e21 && close < e21 => "bear",
        _ => "chop",
    }
}

/// Proxy labels used when a layer is disabled by the data budget.
pub fn proxy_label(layer: Layer, s: &EmaSnapshot) -> &'static str {
    match layer {
        Layer::L0 => infer_cycle_proxy(s),
        Layer::L1 => "neutral",
        Layer::L2 => "chop",
    }
}

/// Bar-history counts per granularity for one id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataBudget {
    pub daily_bars: usize,
    pub weekly_bars: usize,
    pub monthly_bars: usize,
}

impl DataBudget {
    pub fn layer_enabled(&self, layer: Layer) -> bool {
        match layer {
            Layer::L0 => self.monthly_bars >= L0_MIN_MONTHLY_BARS,
            Layer::L1 => self.weekly_bars >= L1_MIN_WEEKLY_BARS,
            Layer::L2 => self.daily_bars >= L2_MIN_DAILY_BARS,
        }
    }
}

pub fn feature_tier(l0: bool, l1: bool, l2: bool) -> &'static str {
    match (l0, l1, l2) {
        (true, true, true) => "full",
        (false, false, false) => "minimal",
        _ => "degraded",
    }
}

/// Composite key from the active layer labels.
pub fn regime_key(l0: &str, l1: &str, l2: &str) -> String {
    format!("{l0}|{l1}|{l2}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(close: f64, e9: f64, e21: f64, e50: f64, e200: f64) -> EmaSnapshot {
        EmaSnapshot {
            close: Some(close),
            ema_9: Some(e9),
            ema_21: Some(e21),
            ema_50: Some(e50),
            ema_200: Some(e200),
        }
    }

    #[test]
    fn aligned_uptrend_labels_bull_everywhere() {
        let s = snapshot(110.0, 108.0, 106.0, 104.0, 100.0);
        assert_eq!(label_l0(&s), "bull_cycle");
        assert_eq!(label_l1(&s), "risk_on");
        assert_eq!(label_l2(&s), "bull");
    }

    #[test]
    fn aligned_downtrend_labels_bear_everywhere() {
        let s = snapshot(90.0, 92.0, 94.0, 96.0, 100.0);
        assert_eq!(label_l0(&s), "bear_cycle");
        assert_eq!(label_l1(&s), "risk_off");
        assert_eq!(label_l2(&s), "bear");
    }

    #[test]
    fn mixed_trend_is_transition_and_chop() {
        // price above the long EMA but the 50 below it
        let s = snapshot(101.0, 99.0, 100.5, 98.0, 100.0);
        assert_eq!(label_l0(&s), "transition");
        assert_eq!(label_l2(&s), "chop");
    }

    #[test]
    fn proxy_never_returns_null_like_value() {
        let empty = EmaSnapshot::default();
        assert_eq!(infer_cycle_proxy(&empty), "transition");
        assert_eq!(proxy_label(Layer::L1, &empty), "neutral");
        assert_eq!(proxy_label(Layer::L2, &empty), "chop");
    }

    #[test]
    fn budget_gates_per_layer() {
        let budget = DataBudget {
            daily_bars: 200,
            weekly_bars: 10,
            monthly_bars: 2,
        };
        assert!(budget.layer_enabled(Layer::L2));
        assert!(!budget.layer_enabled(Layer::L1));
        assert!(!budget.layer_enabled(Layer::L0));
        assert_eq!(feature_tier(false, false, true), "degraded");
    }

    #[test]
    fn regime_key_concatenates_layers() {
        assert_eq!(
            regime_key("bull_cycle", "risk_on", "bull"),
            "bull_cycle|risk_on|bull"
        );
    }
}
