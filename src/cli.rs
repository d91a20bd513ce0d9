//! Command-line surface: one subcommand per refresher plus the orchestrator.
//! Exit code 0 means no per-id or per-component failure was recorded.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::bars::{BarBuilder, BarVariantKind};
use crate::config::{PipelineConfig, Tunables};
use crate::db::Db;
use crate::ema::{EmaRefresher, EmaVariantKind};
use crate::orchestrator::Orchestrator;
use crate::regime::{PolicyTable, RegimeAnalytics, RegimeRefresher};
use crate::run::{any_failed, CancelToken, RefreshMode, RefreshParams};
use crate::signals::{GeneratorKind, SignalGenerator};
use crate::validate::Validator;

#[derive(Debug, Parser)]
#[command(
    name = "cmc-pipeline",
    about = "Incremental bar, feature, and signal pipeline for crypto market data"
)]
pub struct Cli {
    /// SQLite database path (overrides CMC_DB).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
    /// TOML tunables file (overrides CMC_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BarsVariantArg {
    #[value(name = "1d")]
    Daily,
    MultiTf,
    CalUs,
    CalIso,
    CalAnchorUs,
    CalAnchorIso,
}

impl From<BarsVariantArg> for BarVariantKind {
    fn from(v: BarsVariantArg) -> Self {
        match v {
            BarsVariantArg::Daily => BarVariantKind::Daily,
            BarsVariantArg::MultiTf => BarVariantKind::MultiTf,
            BarsVariantArg::CalUs => BarVariantKind::CalUs,
            BarsVariantArg::CalIso => BarVariantKind::CalIso,
            BarsVariantArg::CalAnchorUs => BarVariantKind::CalAnchorUs,
            BarsVariantArg::CalAnchorIso => BarVariantKind::CalAnchorIso,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EmasVariantArg {
    MultiTf,
    MultiTfDaily,
    CalUs,
    CalIso,
    CalAnchorUs,
    CalAnchorIso,
}

impl From<EmasVariantArg> for EmaVariantKind {
    fn from(v: EmasVariantArg) -> Self {
        match v {
            EmasVariantArg::MultiTf => EmaVariantKind::MultiTf,
            EmasVariantArg::MultiTfDaily => EmaVariantKind::MultiTfDaily,
            EmasVariantArg::CalUs => EmaVariantKind::CalUs,
            EmasVariantArg::CalIso => EmaVariantKind::CalIso,
            EmasVariantArg::CalAnchorUs => EmaVariantKind::CalAnchorUs,
            EmasVariantArg::CalAnchorIso => EmaVariantKind::CalAnchorIso,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GeneratorArg {
    EmaCross,
    RsiReversion,
    AtrBreakout,
}

impl From<GeneratorArg> for GeneratorKind {
    fn from(v: GeneratorArg) -> Self {
        match v {
            GeneratorArg::EmaCross => GeneratorKind::EmaCross,
            GeneratorArg::RsiReversion => GeneratorKind::RsiReversion,
            GeneratorArg::AtrBreakout => GeneratorKind::AtrBreakout,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Comma-separated asset ids to refresh.
    #[arg(long, value_delimiter = ',', conflicts_with = "all")]
    pub ids: Vec<i64>,
    /// Refresh every id known to the source (the default when --ids is absent).
    #[arg(long)]
    pub all: bool,
    /// Restrict the refresh window start (YYYY-MM-DD).
    #[arg(long)]
    pub start: Option<NaiveDate>,
    /// Restrict the refresh window end (YYYY-MM-DD).
    #[arg(long)]
    pub end: Option<NaiveDate>,
    /// Ignore state and recompute; state is reset at the end.
    #[arg(long)]
    pub full_refresh: bool,
    /// Do everything except writes and state updates.
    #[arg(long)]
    pub dry_run: bool,
}

impl CommonArgs {
    fn to_params(&self) -> RefreshParams {
        RefreshParams {
            ids: self.ids.clone(),
            start: self.start,
            end: self.end,
            mode: if self.dry_run {
                RefreshMode::DryRun
            } else if self.full_refresh {
                RefreshMode::Full
            } else {
                RefreshMode::Incremental
            },
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build one bar family.
    Bars {
        #[arg(long, value_enum)]
        variant: BarsVariantArg,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Refresh one EMA family.
    Emas {
        #[arg(long, value_enum)]
        variant: EmasVariantArg,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Refresh the returns feature.
    Returns {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Refresh the volatility estimators.
    Vol {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Refresh the technical indicators.
    Indicators {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Rebuild the unified daily feature store.
    Unified {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run the regime labeler and analytics.
    Regimes {
        /// Bypass the min-hold hysteresis filter.
        #[arg(long)]
        no_hysteresis: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run one signal generator.
    Signals {
        #[arg(long, value_enum)]
        generator: GeneratorArg,
        /// Disable regime annotation; emit NULL regime_key.
        #[arg(long)]
        no_regime: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run the validator over the given ids (all when omitted).
    Validate {
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
    },
    /// Run the full pipeline in dependency order.
    RefreshAll {
        /// Do not halt on per-component failure.
        #[arg(long)]
        continue_on_error: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
}

/// Dispatch a parsed CLI invocation. Returns the process exit code.
pub fn run(cli: &Cli) -> anyhow::Result<i32> {
    let mut cfg = PipelineConfig::from_env()?;
    if let Some(db) = &cli.db {
        cfg.db_path.clone_from(db);
    }
    if let Some(path) = &cli.config {
        cfg.tunables = Tunables::from_file(path)?;
        cfg.validate()?;
    }
    let db = Db::open(&cfg.db_path)?;
    let cancel = CancelToken::new();

    let failed = match &cli.command {
        Command::Bars { variant, common } => {
            let builder = BarBuilder::new((*variant).into(), cancel);
            any_failed(&builder.refresh(&db, &common.to_params())?)
        }
        Command::Emas { variant, common } => {
            let refresher = EmaRefresher::new(
                (*variant).into(),
                cfg.tunables.ema_periods.clone(),
                cfg.tunables.ema_buffer_frac,
                cancel,
            );
            any_failed(&refresher.refresh(&db, &common.to_params())?)
        }
        Command::Returns { common } => {
            let refresher =
                crate::features::returns::ReturnsRefresher::new(cfg.tunables.clone(), cancel);
            any_failed(&refresher.refresh(&db, &common.to_params())?)
        }
        Command::Vol { common } => {
            let refresher =
                crate::features::volatility::VolatilityRefresher::new(cfg.tunables.clone(), cancel);
            any_failed(&refresher.refresh(&db, &common.to_params())?)
        }
        Command::Indicators { common } => {
            let refresher = crate::features::indicators::IndicatorRefresher::new(cancel);
            any_failed(&refresher.refresh(&db, &common.to_params())?)
        }
        Command::Unified { common } => {
            let refresher = crate::features::unified::UnifiedRefresher::new(cancel);
            any_failed(&refresher.refresh(&db, &common.to_params())?)
        }
        Command::Regimes {
            no_hysteresis,
            common,
        } => {
            let policy = match &cfg.tunables.policy_overlay {
                Some(path) => PolicyTable::with_overlay(path)?,
                None => PolicyTable::default_table(),
            };
            let params = common.to_params();
            let labeler = RegimeRefresher::new(
                cfg.tunables.clone(),
                policy,
                !no_hysteresis,
                cancel.clone(),
            );
            let mut failed = any_failed(&labeler.refresh(&db, &params)?);
            let analytics = RegimeAnalytics::new(cfg.tunables.clone(), cancel);
            failed |= any_failed(&analytics.refresh(&db, &params)?);
            failed
        }
        Command::Signals {
            generator,
            no_regime,
            common,
        } => {
            let runner = SignalGenerator::new((*generator).into(), !no_regime, cancel);
            any_failed(&runner.refresh(&db, &common.to_params())?)
        }
        Command::Validate { ids } => {
            let ids = if ids.is_empty() {
                crate::db::dims::list_source_ids(db.conn())?
            } else {
                ids.clone()
            };
            let report = Validator::run(&db, &ids)?;
            crate::alert::dispatch(cfg.alert_url.as_deref(), &report);
            false
        }
        Command::RefreshAll {
            continue_on_error,
            common,
        } => {
            let orchestrator = Orchestrator::new(cfg.clone(), cancel, *continue_on_error);
            orchestrator.run(&db, &common.to_params())?.any_failed()
        }
    };

    Ok(i32::from(failed))
}
