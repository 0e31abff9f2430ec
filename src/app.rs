//! Top-level application orchestration.
//!
//! `src/main.rs` only maps errors to exit codes; this module is the real
//! main that:
//! - parses CLI arguments
//! - initialises logging on stderr
//! - loads the run configuration and catalogs
//! - dispatches to the job pipeline, the planner or the catalog listings

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{CatalogArgs, Command, DatasetsArgs, FilterArgs, PlanArgs, RunArgs};
use crate::config::RunConfig;
use crate::error::AppError;
use crate::planner::PlanOptions;

pub mod pipeline;

use pipeline::{Catalogs, JobOutcome, JobRequest};

/// Entry point for the `forecast` binary.
pub fn run() -> Result<(), AppError> {
    // `forecast --dataset D --model M` behaves like `forecast run ...`.
    let argv = rewrite_args(std::env::args().collect());
    let cli = crate::cli::Cli::parse_from(argv);

    let debug = matches!(&cli.command, Command::Run(args) if args.debug);
    init_tracing(debug);

    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Plan(args) => handle_plan(args),
        Command::Status(args) => handle_status(args),
        Command::Datasets(args) => handle_datasets(args),
        Command::Models(args) => handle_models(args),
    }
}

/// Log to stderr; `RUST_LOG` wins, otherwise `info` (`debug` for this crate
/// under `--debug`).
fn init_tracing(debug: bool) {
    let default = if debug { "info,panel_forecast=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_config(catalogs: &CatalogArgs) -> Result<RunConfig, AppError> {
    let mut config = RunConfig::from_env()?;
    if let Some(path) = &catalogs.datasets_catalog {
        config.datasets_catalog = path.clone();
    }
    if let Some(path) = &catalogs.models_catalog {
        config.models_catalog = path.clone();
    }
    Ok(config)
}

fn handle_run(args: RunArgs) -> Result<(), AppError> {
    let config = run_config(&args.catalogs)?;
    let catalogs = Catalogs::load(&config)?;
    let hardware = crate::hardware::probe(config.accelerator_override);

    let request = JobRequest {
        dataset: args.dataset,
        model_key: args.model,
        horizon: args.horizon,
        seed: args.seed,
        debug: args.debug,
        skip_existing: args.skip_existing,
        skip_daily: args.skip_daily,
    };
    match pipeline::run_job(&config, &catalogs, &hardware, &request)? {
        JobOutcome::Done(report) => println!("{}", crate::report::format_job_summary(&report)),
        JobOutcome::Skipped(reason) => {
            println!("skipped {} / {}: {}", request.dataset, request.model_key, reason.as_str());
        }
    }
    Ok(())
}

fn plan_options(filter: &FilterArgs, skip_existing: bool, skip_daily: bool) -> PlanOptions {
    PlanOptions {
        skip_existing,
        skip_daily,
        models: filter.models.clone(),
        datasets: filter.datasets.clone(),
        group: filter.group,
        sources: (!filter.sources.is_empty()).then(|| filter.sources.clone()),
    }
}

fn handle_plan(args: PlanArgs) -> Result<(), AppError> {
    let config = run_config(&args.filter.catalogs)?;
    let catalogs = Catalogs::load(&config)?;
    let opts = plan_options(&args.filter, args.skip_existing, args.skip_daily);
    let plan = crate::planner::plan(&catalogs.datasets, &catalogs.models, &opts, &config.metrics_root())?;
    if !plan.jobs.is_empty() {
        println!("{}", crate::report::format_plan(&plan));
    }
    Ok(())
}

fn handle_status(args: FilterArgs) -> Result<(), AppError> {
    let config = run_config(&args.catalogs)?;
    let catalogs = Catalogs::load(&config)?;
    let opts = plan_options(&args, false, false);
    let plan = crate::planner::plan(&catalogs.datasets, &catalogs.models, &opts, &config.metrics_root())?;
    let rows = crate::planner::status(&plan, &config.metrics_root());
    if !rows.is_empty() {
        println!("{}", crate::report::format_status(&rows));
    }
    Ok(())
}

fn handle_datasets(args: DatasetsArgs) -> Result<(), AppError> {
    let config = run_config(&args.catalogs)?;
    let catalogs = Catalogs::load(&config)?;
    let listing = match args.group {
        Some(group) => crate::report::format_datasets(catalogs.datasets.by_group(group)),
        None => crate::report::format_datasets(catalogs.datasets.list()),
    };
    println!("{listing}");
    Ok(())
}

fn handle_models(args: CatalogArgs) -> Result<(), AppError> {
    let config = run_config(&args)?;
    let catalogs = Catalogs::load(&config)?;
    println!("{}", crate::report::format_models(catalogs.models.list()));
    Ok(())
}

/// Rewrite argv so bare flags default to the `run` subcommand.
///
/// Rules:
/// - `forecast`                       -> `forecast run`
/// - `forecast --dataset D ...`       -> `forecast run --dataset D ...`
/// - `forecast --help/--version/-h`   -> unchanged
fn rewrite_args(mut argv: Vec<String>) -> Vec<String> {
    let Some(arg1) = argv.get(1).cloned() else {
        argv.push("run".to_string());
        return argv;
    };

    let is_top_level_help_or_version = matches!(
        arg1.as_str(),
        "-h" | "--help" | "-V" | "--version" | "help"
    );
    if is_top_level_help_or_version {
        return argv;
    }

    let is_subcommand = matches!(arg1.as_str(), "run" | "plan" | "status" | "datasets" | "models");
    if is_subcommand {
        return argv;
    }

    if arg1.starts_with('-') {
        argv.insert(1, "run".to_string());
    }
    argv
}
