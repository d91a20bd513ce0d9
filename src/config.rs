//! Pipeline configuration.
//!
//! | Env Var | Default | Purpose |
//! |---------|---------|---------|
//! | `CMC_DB` | `./cmc.db` | SQLite database path |
//! | `CMC_CONFIG` | (none) | Optional TOML tunables file |
//! | `CMC_ALERT_URL` | (none) | Webhook for validator reports; if unset, log only |
//! | `RUST_LOG` | `info` | Logging verbosity |

use std::path::{Path, PathBuf};

use garde::Validate;
use serde::Deserialize;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub alert_url: Option<String>,
    pub tunables: Tunables,
}

/// Numeric knobs with validated ranges. All have defaults; a TOML file may
/// override any subset.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    /// EMA periods computed by every EMA variant.
    #[garde(length(min = 1), inner(range(min = 1)))]
    pub ema_periods: Vec<u32>,
    /// Dirty-window lookback as a fraction of `max_period × tf_days`.
    #[garde(range(min = 0.0, max = 2.0))]
    pub ema_buffer_frac: f64,
    /// Day horizons for the returns feature (intersected with dim_timeframe).
    #[garde(length(min = 1), inner(range(min = 1)))]
    pub return_windows: Vec<u32>,
    /// Rolling windows for the volatility estimators.
    #[garde(length(min = 1), inner(range(min = 2)))]
    pub vol_windows: Vec<u32>,
    /// Rolling z-score window (days).
    #[garde(range(min = 2))]
    pub zscore_window: u32,
    /// Z-score outlier threshold in sigmas.
    #[garde(range(min = 0.1))]
    pub outlier_sigma: f64,
    /// IQR outlier fence multiplier.
    #[garde(range(min = 0.1))]
    pub iqr_k: f64,
    /// Hysteresis minimum hold (bars) before a loosening label commits.
    #[garde(range(min = 1))]
    pub min_bars_hold: u32,
    /// Trailing window (rows) for EMA comovement.
    #[garde(range(min = 10))]
    pub comovement_window: u32,
    /// Bounded lag range for cross-correlation lead/lag search.
    #[garde(range(min = 1, max = 60))]
    pub comovement_max_lag: u32,
    /// EMA period pairs for comovement, as (fast, slow).
    #[garde(skip)]
    pub comovement_pairs: Vec<(u32, u32)>,
    /// Optional TOML policy overlay path for the regime policy table.
    #[garde(skip)]
    pub policy_overlay: Option<PathBuf>,
    /// Ids sampled by the orchestrator's validation phase.
    #[garde(range(min = 1))]
    pub validate_sample_ids: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            ema_periods: vec![9, 21, 50, 200],
            ema_buffer_frac: 0.2,
            return_windows: vec![1, 3, 7, 14, 30],
            vol_windows: vec![20, 63, 126],
            zscore_window: 252,
            outlier_sigma: 4.0,
            iqr_k: 1.5,
            min_bars_hold: 3,
            comovement_window: 90,
            comovement_max_lag: 10,
            comovement_pairs: vec![(9, 21), (21, 50), (50, 200)],
            policy_overlay: None,
            validate_sample_ids: 5,
        }
    }
}

impl PipelineConfig {
    /// Resolve from environment plus optional TOML file. CLI flags override
    /// by mutating the returned value.
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("CMC_DB")
            .map_or_else(|_| PathBuf::from("./cmc.db"), PathBuf::from);
        let alert_url = std::env::var("CMC_ALERT_URL").ok().filter(|s| !s.is_empty());

        let tunables = match std::env::var("CMC_CONFIG") {
            Ok(path) => Tunables::from_file(Path::new(&path))?,
            Err(_) => Tunables::default(),
        };

        let cfg = Self {
            db_path,
            alert_url,
            tunables,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.tunables
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn max_ema_period(&self) -> u32 {
        self.tunables.ema_periods.iter().copied().max().unwrap_or(200)
    }
}

impl Tunables {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let tunables: Tunables = toml::from_str(&text).map_err(|e| PipelineError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(tunables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let t = Tunables::default();
        assert!(t.validate().is_ok());
    }

    #[test]
    fn zero_period_rejected() {
        let t = Tunables {
            ema_periods: vec![0],
            ..Tunables::default()
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn toml_overrides_subset() {
        let t: Tunables = toml::from_str("ema_periods = [5, 10]\nmin_bars_hold = 2\n").unwrap();
        assert_eq!(t.ema_periods, vec![5, 10]);
        assert_eq!(t.min_bars_hold, 2);
        // untouched keys keep defaults
        assert_eq!(t.zscore_window, 252);
    }
}
