//! Command-line parsing for the `forecast` evaluation runner.
//!
//! Argument parsing and dispatch live here and in `crate::app`, away from
//! the modeling code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::GroupTag;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "forecast",
    version,
    about = "Rolling-origin forecast evaluation over financial panels"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Evaluate one model on one dataset and write its result record.
    Run(RunArgs),
    /// Print the run list, one `dataset<TAB>model` per line.
    Plan(PlanArgs),
    /// Print the result state of every planned pair.
    Status(FilterArgs),
    /// List registered datasets.
    Datasets(DatasetsArgs),
    /// List registered models.
    Models(CatalogArgs),
}

/// Catalog locations; override `DATASETS_CATALOG` / `MODELS_CATALOG`.
#[derive(Debug, Args, Clone, Default)]
pub struct CatalogArgs {
    #[arg(long, value_name = "TOML")]
    pub datasets_catalog: Option<PathBuf>,

    #[arg(long, value_name = "TOML")]
    pub models_catalog: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Registered dataset name (e.g. `ftsfr_cds_portfolio_returns`).
    #[arg(long)]
    pub dataset: String,

    /// Registered model key.
    #[arg(long)]
    pub model: String,

    /// Cap training length and trial counts; verbose logging.
    #[arg(long)]
    pub debug: bool,

    /// Exit without work when a successful record already exists.
    #[arg(long)]
    pub skip_existing: bool,

    /// Exit without work for business-day and daily datasets.
    #[arg(long)]
    pub skip_daily: bool,

    /// Test horizon; defaults to the dataset frequency's horizon.
    #[arg(long)]
    pub horizon: Option<usize>,

    /// Seed for neural initialisation and search.
    #[arg(long, default_value_t = crate::app::pipeline::DEFAULT_SEED)]
    pub seed: u64,

    #[command(flatten)]
    pub catalogs: CatalogArgs,
}

/// Which pairs a listing covers.
#[derive(Debug, Args, Clone, Default)]
pub struct FilterArgs {
    /// Restrict to a model key (repeatable).
    #[arg(long = "model")]
    pub models: Vec<String>,

    /// Restrict to a dataset (repeatable).
    #[arg(long = "dataset")]
    pub datasets: Vec<String>,

    #[arg(long, value_enum)]
    pub group: Option<GroupTag>,

    /// Data source available upstream (repeatable); datasets requiring any
    /// other source are excluded.
    #[arg(long = "source")]
    pub sources: Vec<String>,

    #[command(flatten)]
    pub catalogs: CatalogArgs,
}

#[derive(Debug, Args, Clone, Default)]
pub struct PlanArgs {
    #[arg(long)]
    pub skip_existing: bool,

    #[arg(long)]
    pub skip_daily: bool,

    #[command(flatten)]
    pub filter: FilterArgs,
}

#[derive(Debug, Args, Clone, Default)]
pub struct DatasetsArgs {
    #[arg(long, value_enum)]
    pub group: Option<GroupTag>,

    #[command(flatten)]
    pub catalogs: CatalogArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "forecast",
            "run",
            "--dataset",
            "ftsfr_x",
            "--model",
            "naive",
            "--skip-existing",
            "--horizon",
            "12",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.dataset, "ftsfr_x");
        assert!(args.skip_existing);
        assert!(!args.skip_daily);
        assert_eq!(args.horizon, Some(12));
        assert_eq!(args.seed, 42);
    }

    #[test]
    fn plan_filters_repeat() {
        let cli = Cli::try_parse_from([
            "forecast",
            "plan",
            "--model",
            "naive",
            "--model",
            "arima",
            "--group",
            "basis-spreads",
        ])
        .unwrap();
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(args.filter.models, vec!["naive", "arima"]);
        assert_eq!(args.filter.group, Some(GroupTag::BasisSpreads));
    }

    #[test]
    fn run_requires_dataset_and_model() {
        let err = Cli::try_parse_from(["forecast", "run", "--model", "naive"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
