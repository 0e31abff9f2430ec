//! Run-list planning over the two catalogs.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::debug;

use crate::domain::{DatasetDescriptor, GroupTag, QualityFlag};
use crate::error::AppError;
use crate::io::results;
use crate::registry::{DatasetRegistry, ModelDescriptor, ModelRegistry};

/// Filters and skip rules for a plan.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    pub skip_existing: bool,
    pub skip_daily: bool,
    /// Restrict to these model keys (all enabled models when empty).
    pub models: Vec<String>,
    /// Restrict to these datasets (all when empty).
    pub datasets: Vec<String>,
    pub group: Option<GroupTag>,
    /// Upstream data sources on hand; datasets needing anything else are
    /// left out. No filtering when `None`.
    pub sources: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Job {
    pub model_key: String,
    pub dataset: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A successful record already exists.
    Existing,
    /// Business-day or daily dataset under `skip_daily`.
    Daily,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Existing => "existing result",
            SkipReason::Daily => "daily frequency",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Ordered by `(model, dataset)`.
    pub jobs: Vec<Job>,
    pub skipped: Vec<(Job, SkipReason)>,
}

/// Why a pair would be skipped, if at all.
pub fn skip_reason(
    dataset: &DatasetDescriptor,
    model_key: &str,
    opts: &PlanOptions,
    metrics_root: &Path,
) -> Option<SkipReason> {
    if opts.skip_daily && dataset.frequency.is_daily() {
        return Some(SkipReason::Daily);
    }
    if opts.skip_existing
        && results::quality_flag(metrics_root, &dataset.name, model_key) == QualityFlag::Success
    {
        return Some(SkipReason::Existing);
    }
    None
}

fn selected_models<'a>(models: &'a ModelRegistry, opts: &PlanOptions) -> Result<Vec<&'a ModelDescriptor>, AppError> {
    if opts.models.is_empty() {
        return Ok(models.enabled().collect());
    }
    let mut out = Vec::with_capacity(opts.models.len());
    for key in &opts.models {
        let m = models.resolve(key)?;
        if m.enabled {
            out.push(m);
        }
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out.dedup_by(|a, b| a.key == b.key);
    Ok(out)
}

fn selected_datasets<'a>(
    datasets: &'a DatasetRegistry,
    opts: &PlanOptions,
) -> Result<Vec<&'a DatasetDescriptor>, AppError> {
    let mut out: Vec<&DatasetDescriptor> = if opts.datasets.is_empty() {
        datasets.list().collect()
    } else {
        opts.datasets
            .iter()
            .map(|name| datasets.resolve(name))
            .collect::<Result<_, _>>()?
    };
    if let Some(group) = opts.group {
        out.retain(|d| d.group == group);
    }
    if let Some(sources) = &opts.sources {
        let available: BTreeSet<&str> = datasets.available(sources).map(|d| d.name.as_str()).collect();
        out.retain(|d| available.contains(d.name.as_str()));
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out.dedup_by(|a, b| a.name == b.name);
    Ok(out)
}

/// Enumerate the `(dataset, model)` pairs to run.
pub fn plan(
    datasets: &DatasetRegistry,
    models: &ModelRegistry,
    opts: &PlanOptions,
    metrics_root: &Path,
) -> Result<Plan, AppError> {
    let models = selected_models(models, opts)?;
    let datasets = selected_datasets(datasets, opts)?;

    let mut out = Plan::default();
    for model in &models {
        for dataset in &datasets {
            let job = Job {
                model_key: model.key.clone(),
                dataset: dataset.name.clone(),
            };
            match skip_reason(dataset, &model.key, opts, metrics_root) {
                Some(reason) => out.skipped.push((job, reason)),
                None => out.jobs.push(job),
            }
        }
    }
    debug!(target: "planner", jobs = out.jobs.len(), skipped = out.skipped.len(), "plan built");
    Ok(out)
}

/// Quality flag of every pair the plan covers, including skipped ones.
pub fn status(plan: &Plan, metrics_root: &Path) -> Vec<(Job, QualityFlag)> {
    let mut all: Vec<Job> = plan
        .jobs
        .iter()
        .cloned()
        .chain(plan.skipped.iter().map(|(j, _)| j.clone()))
        .collect();
    all.sort();
    all.into_iter()
        .map(|job| {
            let flag = results::quality_flag(metrics_root, &job.dataset, &job.model_key);
            (job, flag)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorRecord, ResultQuality};
    use tempfile::tempdir;

    const DATASETS: &str = r#"
        [returns]
        required_data_sources = ["wrds"]

        [returns.ftsfr_ff25]
        frequency = "ME"
        seasonality = 12
        description = "portfolios"
        group = "returns_portfolios"

        [returns.ftsfr_cds]
        frequency = "B"
        seasonality = 5
        description = "cds"
        group = "basis_spreads"
        required_data_sources = ["markit"]
    "#;

    const MODELS: &str = r#"
        [naive]
        family = "classical"
        constructor_ref = "Naive"
        display_name = "Naive"
        table_name = "naive"

        [arima]
        family = "classical"
        constructor_ref = "AutoARIMA"
        display_name = "ARIMA"
        table_name = "arima"

        [off]
        family = "classical"
        constructor_ref = "Naive"
        display_name = "Off"
        table_name = "off"
        enabled = false
    "#;

    fn registries() -> (DatasetRegistry, ModelRegistry) {
        (
            DatasetRegistry::from_toml_str(DATASETS, Path::new("/data")).unwrap(),
            ModelRegistry::from_toml_str(MODELS).unwrap(),
        )
    }

    fn pairs(plan: &Plan) -> Vec<(&str, &str)> {
        plan.jobs
            .iter()
            .map(|j| (j.model_key.as_str(), j.dataset.as_str()))
            .collect()
    }

    #[test]
    fn plan_is_ordered_by_model_then_dataset() {
        let (d, m) = registries();
        let dir = tempdir().unwrap();
        let plan = plan(&d, &m, &PlanOptions::default(), dir.path()).unwrap();
        assert_eq!(
            pairs(&plan),
            vec![
                ("arima", "ftsfr_cds"),
                ("arima", "ftsfr_ff25"),
                ("naive", "ftsfr_cds"),
                ("naive", "ftsfr_ff25"),
            ]
        );
    }

    #[test]
    fn skip_rules_apply() {
        let (d, m) = registries();
        let dir = tempdir().unwrap();
        let record = |mase| ErrorRecord {
            model_key: "naive".into(),
            dataset_name: "ftsfr_ff25".into(),
            mase,
            mse: Some(1.0),
            rmse: Some(1.0),
            r2oos: None,
            wall_time_seconds: 0.1,
            quality: ResultQuality::from_mase(mase),
        };
        results::write_record(dir.path(), &record(Some(0.9))).unwrap();

        let opts = PlanOptions {
            skip_existing: true,
            skip_daily: true,
            models: vec!["naive".into()],
            ..PlanOptions::default()
        };
        let p = plan(&d, &m, &opts, dir.path()).unwrap();
        assert!(p.jobs.is_empty());
        assert_eq!(p.skipped.len(), 2);
        assert!(p.skipped.iter().any(|(j, r)| j.dataset == "ftsfr_cds" && *r == SkipReason::Daily));

        // A null-MASE record is re-run.
        results::write_record(dir.path(), &record(None)).unwrap();
        let p = plan(&d, &m, &opts, dir.path()).unwrap();
        assert_eq!(pairs(&p), vec![("naive", "ftsfr_ff25")]);

        let flags = status(&p, dir.path());
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[1].1, QualityFlag::QualityIssues);
        assert_eq!(flags[0].1, QualityFlag::NoCsv);
    }

    #[test]
    fn filters_resolve_names() {
        let (d, m) = registries();
        let dir = tempdir().unwrap();
        let opts = PlanOptions {
            models: vec!["missing".into()],
            ..PlanOptions::default()
        };
        let err = plan(&d, &m, &opts, dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ModelNotRegistered);

        let opts = PlanOptions {
            group: Some(GroupTag::BasisSpreads),
            models: vec!["off".into(), "naive".into()],
            ..PlanOptions::default()
        };
        let p = plan(&d, &m, &opts, dir.path()).unwrap();
        assert_eq!(pairs(&p), vec![("naive", "ftsfr_cds")]);
    }

    #[test]
    fn datasets_without_their_sources_are_left_out() {
        let (d, m) = registries();
        let dir = tempdir().unwrap();
        let opts = PlanOptions {
            models: vec!["naive".into()],
            sources: Some(vec!["wrds".into()]),
            ..PlanOptions::default()
        };
        let p = plan(&d, &m, &opts, dir.path()).unwrap();
        assert_eq!(pairs(&p), vec![("naive", "ftsfr_ff25")]);

        let opts = PlanOptions {
            sources: Some(Vec::new()),
            ..opts
        };
        assert!(plan(&d, &m, &opts, dir.path()).unwrap().jobs.is_empty());

        let opts = PlanOptions {
            sources: Some(vec!["wrds".into(), "markit".into()]),
            ..opts
        };
        assert_eq!(plan(&d, &m, &opts, dir.path()).unwrap().jobs.len(), 2);
    }
}
