//! The per-job workflow shared by `forecast run` and the integration tests.
//!
//! resolve -> preprocess -> fit -> rolling forecast -> metrics -> persist
//!
//! Each phase transition is logged with the elapsed wall time. Any error
//! after the descriptors resolve moves the job to `failed` and is returned to
//! the caller; nothing is written in that case.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::adapter::{self, ClassicalAdapter, FitContext};
use crate::config::RunConfig;
use crate::cv::{self, CvPlan};
use crate::domain::{DatasetDescriptor, ErrorRecord, Family, Phase, QualityFlag};
use crate::error::AppError;
use crate::hardware::HardwareConfig;
use crate::io::{load_panel, quality_flag, write_record};
use crate::metrics::{self, PanelMetrics};
use crate::models::{ClassicalConfig, ClassicalKind};
use crate::planner::{self, PlanOptions, SkipReason};
use crate::preprocess::{self, PreprocessOptions, PreprocessReport, Splits};
use crate::registry::{DatasetRegistry, ModelRegistry, ModelSpec};

pub const DEFAULT_SEED: u64 = 42;

/// Baselines evaluated next to every neural job.
const COMPANIONS: [(ClassicalKind, &str); 2] = [
    (ClassicalKind::HistoricAverage, "historical_average"),
    (ClassicalKind::SeasonalNaive, "seasonal_naive"),
];

/// Both catalogs, loaded once per process.
#[derive(Debug, Clone, Default)]
pub struct Catalogs {
    pub datasets: DatasetRegistry,
    pub models: ModelRegistry,
}

impl Catalogs {
    pub fn load(run: &RunConfig) -> Result<Self, AppError> {
        Ok(Self {
            datasets: DatasetRegistry::load(&run.datasets_catalog, &run.data_dir)?,
            models: ModelRegistry::load(&run.models_catalog)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub dataset: String,
    pub model_key: String,
    /// Overrides the frequency's default test horizon.
    pub horizon: Option<usize>,
    pub seed: u64,
    pub debug: bool,
    pub skip_existing: bool,
    pub skip_daily: bool,
}

impl JobRequest {
    pub fn new(dataset: impl Into<String>, model_key: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            model_key: model_key.into(),
            horizon: None,
            seed: DEFAULT_SEED,
            debug: false,
            skip_existing: false,
            skip_daily: false,
        }
    }
}

/// A baseline evaluated on the same splits as a neural job.
#[derive(Debug, Clone)]
pub struct CompanionReport {
    pub model_key: String,
    pub metrics: PanelMetrics,
    /// Whether a record was written for the companion pair.
    pub written: bool,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub dataset: String,
    pub model_key: String,
    pub family: Family,
    /// `HardwareConfig::describe` of the probe the job ran under.
    pub hardware: String,
    pub preprocess: PreprocessReport,
    pub n_entities: usize,
    pub horizon: usize,
    pub plan: CvPlan,
    pub forecasts: usize,
    pub aligned_pairs: usize,
    pub failed_entities: usize,
    pub metrics: PanelMetrics,
    pub record: ErrorRecord,
    pub record_path: PathBuf,
    pub companions: Vec<CompanionReport>,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Done(Box<JobReport>),
    Skipped(SkipReason),
}

/// Phase bookkeeping for one job.
struct Tracker<'a> {
    dataset: &'a str,
    model: &'a str,
    phase: Phase,
    started: Instant,
}

impl<'a> Tracker<'a> {
    fn new(dataset: &'a str, model: &'a str) -> Self {
        Self {
            dataset,
            model,
            phase: Phase::New,
            started: Instant::now(),
        }
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        info!(
            target: "job",
            dataset = self.dataset,
            model = self.model,
            phase = %phase,
            elapsed_s = self.elapsed(),
            "phase"
        );
    }

    fn fail(&mut self, err: &AppError) {
        let from = self.phase;
        self.phase = Phase::Failed;
        error!(
            target: "job",
            dataset = self.dataset,
            model = self.model,
            phase = %Phase::Failed,
            from = %from,
            kind = %err.kind(),
            elapsed_s = self.elapsed(),
            "{}",
            err.message()
        );
    }
}

/// Run one `(dataset, model)` job end to end.
pub fn run_job(
    run: &RunConfig,
    catalogs: &Catalogs,
    hardware: &HardwareConfig,
    req: &JobRequest,
) -> Result<JobOutcome, AppError> {
    let mut tracker = Tracker::new(&req.dataset, &req.model_key);
    let dataset = catalogs.datasets.resolve(&req.dataset)?;
    let model = catalogs.models.resolve(&req.model_key)?;
    tracker.enter(Phase::Resolved);

    let opts = PlanOptions {
        skip_existing: req.skip_existing,
        skip_daily: req.skip_daily,
        ..PlanOptions::default()
    };
    if let Some(reason) = planner::skip_reason(dataset, &model.key, &opts, &run.metrics_root()) {
        tracker.enter(Phase::Skipped);
        info!(target: "job", dataset = %dataset.name, model = %model.key, reason = reason.as_str(), "skipped");
        return Ok(JobOutcome::Skipped(reason));
    }

    match execute(&mut tracker, run, catalogs, hardware, req, dataset, model) {
        Ok(report) => Ok(JobOutcome::Done(Box::new(report))),
        Err(e) => {
            tracker.fail(&e);
            Err(e)
        }
    }
}

fn execute(
    tracker: &mut Tracker<'_>,
    run: &RunConfig,
    catalogs: &Catalogs,
    hardware: &HardwareConfig,
    req: &JobRequest,
    dataset: &DatasetDescriptor,
    model: &crate::registry::ModelDescriptor,
) -> Result<JobReport, AppError> {
    let (panel, load) = load_panel(&dataset.panel_path)?;
    info!(
        target: "panel",
        dataset = %dataset.name,
        entities = panel.n_entities(),
        rows = panel.n_rows(),
        null_keys = load.null_keys,
        "panel loaded"
    );

    let splits = preprocess::preprocess(
        &panel,
        PreprocessOptions {
            frequency: dataset.frequency,
            seasonality: dataset.seasonality,
            horizon: req.horizon,
        },
    )?;
    info!(
        target: "preprocess",
        entities = splits.n_entities(),
        dropped = splits.report.dropped.len(),
        gap_rows = splits.report.gap_rows_inserted,
        min_train = splits.report.min_train_length,
        horizon = splits.horizon,
        "splits ready"
    );
    tracker.enter(Phase::Preprocessed);

    info!(
        target: "hardware",
        accelerator = %hardware.accelerator,
        devices = hardware.devices,
        strategy = hardware.strategy,
        data_workers = hardware.data_worker_count,
        hpo_jobs = hardware.hpo_parallel_jobs,
        "fitting"
    );
    let mut adapter = adapter::build(model);
    let ctx = FitContext {
        dataset,
        model_key: &model.key,
        hardware,
        run,
        debug: req.debug,
        seed: req.seed,
    };
    adapter.fit(&splits, &ctx)?;
    tracker.enter(Phase::Fitted);

    let outcome = cv::run(adapter.as_mut(), &splits)?;
    let failed_entities = outcome.failures().count();
    info!(
        target: "cv",
        windows = outcome.plan.n_windows,
        forecasts = outcome.forecasts.len(),
        aligned = outcome.aligned_pairs(),
        failed = failed_entities,
        "rolling forecasts done"
    );
    tracker.enter(Phase::Forecast);

    let panel_metrics = metrics::evaluate(&outcome, &splits);
    info!(
        target: "metrics",
        mase = ?panel_metrics.mase,
        rmse = ?panel_metrics.rmse,
        r2oos = ?panel_metrics.r2oos,
        "evaluated"
    );
    tracker.enter(Phase::Evaluated);

    let companions = if model.family() == Family::NeuralAuto {
        baseline_companions(catalogs, &splits, dataset, hardware, &run.metrics_root())
    } else {
        Vec::new()
    };

    let record = panel_metrics
        .clone()
        .into_record(&model.key, &dataset.name, tracker.elapsed());
    let record_path = write_record(&run.metrics_root(), &record)?;
    tracker.enter(Phase::Persisted);
    tracker.enter(Phase::Done);

    Ok(JobReport {
        dataset: dataset.name.clone(),
        model_key: model.key.clone(),
        family: model.family(),
        hardware: hardware.describe(),
        n_entities: splits.n_entities(),
        horizon: splits.horizon,
        preprocess: splits.report.clone(),
        plan: outcome.plan,
        forecasts: outcome.forecasts.len(),
        aligned_pairs: outcome.aligned_pairs(),
        failed_entities,
        metrics: panel_metrics,
        record,
        record_path,
        companions,
        elapsed_seconds: tracker.elapsed(),
    })
}

/// Catalog key and config for a companion kind; the catalog entry wins when
/// one exists.
fn companion_config(catalogs: &Catalogs, kind: ClassicalKind, fallback: &str) -> (String, ClassicalConfig) {
    catalogs
        .models
        .list()
        .find_map(|m| match &m.spec {
            ModelSpec::Classical(cfg) if cfg.kind == kind => Some((m.key.clone(), cfg.clone())),
            _ => None,
        })
        .unwrap_or_else(|| (fallback.to_string(), ClassicalConfig::new(kind)))
}

/// Evaluate the cheap baselines on the neural job's splits.
///
/// Their records are written only where no successful record exists yet.
/// Failures are logged and never fail the job.
fn baseline_companions(
    catalogs: &Catalogs,
    splits: &Splits,
    dataset: &DatasetDescriptor,
    hardware: &HardwareConfig,
    metrics_root: &Path,
) -> Vec<CompanionReport> {
    let mut out = Vec::with_capacity(COMPANIONS.len());
    for (kind, fallback) in COMPANIONS {
        let started = Instant::now();
        let (key, config) = companion_config(catalogs, kind, fallback);
        let mut adapter = ClassicalAdapter::with_seasonality(config, dataset.seasonality, hardware.classical_threads());
        adapter.fit_splits(splits);
        let outcome = match cv::run(&mut adapter, splits) {
            Ok(o) => o,
            Err(e) => {
                warn!(target: "job", companion = %key, error = %e, "baseline companion failed");
                continue;
            }
        };
        let panel_metrics = metrics::evaluate(&outcome, splits);
        info!(target: "job", companion = %key, mase = ?panel_metrics.mase, "baseline companion");

        let mut written = false;
        if quality_flag(metrics_root, &dataset.name, &key) != QualityFlag::Success {
            let record = panel_metrics
                .clone()
                .into_record(&key, &dataset.name, started.elapsed().as_secs_f64());
            match write_record(metrics_root, &record) {
                Ok(_) => written = true,
                Err(e) => warn!(target: "job", companion = %key, error = %e, "companion record not written"),
            }
        }
        out.push(CompanionReport {
            model_key: key,
            metrics: panel_metrics,
            written,
        });
    }
    out
}
