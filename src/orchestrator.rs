//! Full-pipeline orchestration: bars, then EMAs, then three phases.
//! A: returns/vol/TA in parallel (independent of each other),
//! B: unified store then the regime pipeline (sequential),
//! C: validation over a sampled id set.
//!
//! A failure in one component is recorded and does not halt the pipeline by
//! default; downstream components tolerate missing inputs through LEFT
//! JOINs. The exit status is non-zero iff any failure was recorded.

use rand::prelude::*;

use crate::bars::{BarBuilder, BarVariantKind};
use crate::config::PipelineConfig;
use crate::db::{dims, Db};
use crate::ema::{EmaRefresher, EmaVariantKind};
use crate::error::Result;
use crate::features::indicators::IndicatorRefresher;
use crate::features::returns::ReturnsRefresher;
use crate::features::unified::UnifiedRefresher;
use crate::features::volatility::VolatilityRefresher;
use crate::regime::{PolicyTable, RegimeAnalytics, RegimeRefresher};
use crate::run::{any_failed, CancelToken, RefreshParams, RunSummary};
use crate::signals::{GeneratorKind, SignalGenerator};
use crate::validate::Validator;

const BAR_VARIANTS: [BarVariantKind; 6] = [
    BarVariantKind::Daily,
    BarVariantKind::MultiTf,
    BarVariantKind::CalUs,
    BarVariantKind::CalIso,
    BarVariantKind::CalAnchorUs,
    BarVariantKind::CalAnchorIso,
];

const EMA_VARIANTS: [EmaVariantKind; 6] = [
    EmaVariantKind::MultiTf,
    EmaVariantKind::MultiTfDaily,
    EmaVariantKind::CalUs,
    EmaVariantKind::CalIso,
    EmaVariantKind::CalAnchorUs,
    EmaVariantKind::CalAnchorIso,
];

const GENERATORS: [GeneratorKind; 3] = [
    GeneratorKind::EmaCross,
    GeneratorKind::RsiReversion,
    GeneratorKind::AtrBreakout,
];

#[derive(Debug)]
pub struct ComponentOutcome {
    pub component: String,
    pub failed: bool,
    pub summaries: Vec<RunSummary>,
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub components: Vec<ComponentOutcome>,
}

impl PipelineOutcome {
    pub fn any_failed(&self) -> bool {
        self.components.iter().any(|c| c.failed)
    }

    fn record(&mut self, component: &str, result: Result<Vec<RunSummary>>) -> bool {
        match result {
            Ok(summaries) => {
                let failed = any_failed(&summaries);
                self.components.push(ComponentOutcome {
                    component: component.to_string(),
                    failed,
                    summaries,
                });
                failed
            }
            Err(e) => {
                tracing::error!(component, error = %e, "component refresh failed");
                self.components.push(ComponentOutcome {
                    component: component.to_string(),
                    failed: true,
                    summaries: Vec::new(),
                });
                true
            }
        }
    }
}

pub struct Orchestrator {
    cfg: PipelineConfig,
    cancel: CancelToken,
    continue_on_error: bool,
}

impl Orchestrator {
    pub fn new(cfg: PipelineConfig, cancel: CancelToken, continue_on_error: bool) -> Self {
        Self {
            cfg,
            cancel,
            continue_on_error,
        }
    }

    /// Run the whole pipeline in dependency order. Foundational failures
    /// (bars, EMAs) stop the run unless `--continue-on-error`; everything
    /// downstream is fail-open by design.
    pub fn run(&self, db: &Db, params: &RefreshParams) -> Result<PipelineOutcome> {
        let mut outcome = PipelineOutcome::default();
        let tunables = &self.cfg.tunables;

        for variant in BAR_VARIANTS {
            self.cancel.check()?;
            let builder = BarBuilder::new(variant, self.cancel.clone());
            let failed = outcome.record(variant.component(), builder.refresh(db, params));
            if failed && !self.continue_on_error {
                tracing::error!(component = variant.component(), "stopping: bar family failed");
                return Ok(outcome);
            }
        }

        for variant in EMA_VARIANTS {
            self.cancel.check()?;
            let refresher = EmaRefresher::new(
                variant,
                tunables.ema_periods.clone(),
                tunables.ema_buffer_frac,
                self.cancel.clone(),
            );
            let failed = outcome.record(variant.component(), refresher.refresh(db, params));
            if failed && !self.continue_on_error {
                tracing::error!(component = variant.component(), "stopping: EMA family failed");
                return Ok(outcome);
            }
        }

        // Phase A: independent feature kinds in parallel, one connection
        // universe per thread.
        self.cancel.check()?;
        let path = db.path().to_path_buf();
        let (returns_res, vol_res, ta_res) = std::thread::scope(|scope| {
            let returns = scope.spawn(|| {
                let worker = Db::open_worker(&path)?;
                ReturnsRefresher::new(tunables.clone(), self.cancel.clone())
                    .refresh(&worker, params)
            });
            let vol = scope.spawn(|| {
                let worker = Db::open_worker(&path)?;
                VolatilityRefresher::new(tunables.clone(), self.cancel.clone())
                    .refresh(&worker, params)
            });
            let ta = scope.spawn(|| {
                let worker = Db::open_worker(&path)?;
                IndicatorRefresher::new(self.cancel.clone()).refresh(&worker, params)
            });
            (
                returns.join().unwrap_or_else(|_| Err(panic_error("returns"))),
                vol.join().unwrap_or_else(|_| Err(panic_error("vol"))),
                ta.join().unwrap_or_else(|_| Err(panic_error("indicators"))),
            )
        });
        outcome.record("feat_returns", returns_res);
        outcome.record("feat_vol", vol_res);
        outcome.record("feat_ta", ta_res);

        // Phase B: unified store, then the regime pipeline, sequential.
        self.cancel.check()?;
        outcome.record(
            "features_daily",
            UnifiedRefresher::new(self.cancel.clone()).refresh(db, params),
        );

        self.cancel.check()?;
        let policy = match &tunables.policy_overlay {
            Some(path) => PolicyTable::with_overlay(path)?,
            None => PolicyTable::default_table(),
        };
        outcome.record(
            "regimes",
            RegimeRefresher::new(tunables.clone(), policy, true, self.cancel.clone())
                .refresh(db, params),
        );
        outcome.record(
            "regime_analytics",
            RegimeAnalytics::new(tunables.clone(), self.cancel.clone()).refresh(db, params),
        );

        for kind in GENERATORS {
            self.cancel.check()?;
            outcome.record(
                kind.component(),
                SignalGenerator::new(kind, true, self.cancel.clone()).refresh(db, params),
            );
        }

        // Phase C: validation on a sampled id set. Advisory only.
        self.cancel.check()?;
        let mut ids = if params.ids.is_empty() {
            dims::list_source_ids(db.conn())?
        } else {
            params.ids.clone()
        };
        let sample = self.cfg.tunables.validate_sample_ids as usize;
        if ids.len() > sample {
            let mut rng = rand::rng();
            ids.shuffle(&mut rng);
            ids.truncate(sample);
            ids.sort_unstable();
        }
        match Validator::run(db, &ids) {
            Ok(report) => crate::alert::dispatch(self.cfg.alert_url.as_deref(), &report),
            Err(e) => tracing::error!(error = %e, "validator failed"),
        }

        Ok(outcome)
    }
}

fn panic_error(component: &str) -> crate::error::PipelineError {
    crate::error::PipelineError::Task(format!("{component} worker panicked"))
}
