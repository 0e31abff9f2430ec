//! Classical adapter: one independent statistical model per entity.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::{debug, warn};

use super::{Adapter, FitContext};
use crate::cv::{CvPlan, EntityFailure, MAX_CV_WINDOWS_CLASSICAL};
use crate::domain::{Family, Series};
use crate::error::AppError;
use crate::models::{BoxedForecaster, ClassicalConfig};
use crate::preprocess::{Splits, TrainSeries};

type Slot = Option<Result<BoxedForecaster, EntityFailure>>;

pub struct ClassicalAdapter {
    config: ClassicalConfig,
    seasonality: usize,
    threads: usize,
    /// Models fitted on the full training window, indexed like `index`.
    arena: Vec<Slot>,
    index: HashMap<String, usize>,
}

impl ClassicalAdapter {
    pub fn new(config: ClassicalConfig) -> Self {
        Self {
            config,
            seasonality: 1,
            threads: 1,
            arena: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Adapter configured without a job context (baseline companions, tests).
    pub fn with_seasonality(config: ClassicalConfig, seasonality: usize, threads: usize) -> Self {
        let mut adapter = Self::new(config);
        adapter.seasonality = seasonality.max(1);
        adapter.threads = threads.max(1);
        adapter
    }

    pub fn config(&self) -> &ClassicalConfig {
        &self.config
    }

    fn fit_one(&self, train: &TrainSeries) -> Result<BoxedForecaster, EntityFailure> {
        fit_entity(&self.config, self.seasonality, train)
    }

    fn pool(&self) -> Option<rayon::ThreadPool> {
        match rayon::ThreadPoolBuilder::new().num_threads(self.threads).build() {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(target: "classical", error = %e, "thread pool unavailable; running sequentially");
                None
            }
        }
    }

    /// Fit every entity on its training window (in parallel) and keep the
    /// results in the arena.
    pub fn fit_splits(&mut self, splits: &Splits) {
        let (config, seasonality) = (&self.config, self.seasonality);
        let fit = |train: &TrainSeries| Some(fit_entity(config, seasonality, train));
        let arena: Vec<Slot> = match self.pool() {
            Some(pool) => pool.install(|| splits.train.par_iter().map(fit).collect()),
            None => splits.train.iter().map(fit).collect(),
        };
        let failures = arena
            .iter()
            .filter(|s| matches!(s, Some(Err(_))))
            .count();
        if failures > 0 {
            warn!(target: "classical", model = %self.config.kind, failures, "entity fits failed");
        }
        self.index = splits
            .train
            .iter()
            .enumerate()
            .map(|(i, t)| (t.entity_id.clone(), i))
            .collect();
        self.arena = arena;
        debug!(target: "classical", model = %self.config.kind, entities = self.arena.len(), "fitted");
    }

    fn take_fitted(&mut self, entity_id: &str) -> Option<Result<BoxedForecaster, EntityFailure>> {
        let slot = *self.index.get(entity_id)?;
        self.arena.get_mut(slot)?.take()
    }
}

fn fit_entity(
    config: &ClassicalConfig,
    seasonality: usize,
    train: &TrainSeries,
) -> Result<BoxedForecaster, EntityFailure> {
    let mut model = config.build(seasonality);
    model
        .fit(&train.values)
        .map_err(|e| EntityFailure::fit(&train.entity_id, e.to_string()))?;
    Ok(model)
}

/// Roll one entity through its test window.
///
/// Window origins refit non-retraining models on every actual seen so far;
/// inside a window their state absorbs each actual through `update`.
/// Retraining models refit whenever the history has grown.
pub fn roll(
    config: &ClassicalConfig,
    mut model: BoxedForecaster,
    train: &TrainSeries,
    test: &Series,
    plan: &CvPlan,
) -> Result<Vec<f64>, EntityFailure> {
    let id = &test.entity_id;
    let origins = plan.origins(test.len());
    let mut history = train.values.clone();
    let mut last_fit = history.len();
    let mut out = Vec::with_capacity(test.len());

    for (k, actual) in test.values.iter().enumerate() {
        let at_origin = origins.contains(&k);
        if (config.retrain_each_step || at_origin) && history.len() != last_fit {
            model
                .fit(&history)
                .map_err(|e| EntityFailure::fit(id, e.to_string()))?;
            last_fit = history.len();
        }
        let pred = model
            .predict_next()
            .map_err(|e| EntityFailure::forecast(id, e.to_string()))?;
        out.push(pred);

        if let Some(v) = actual {
            history.push(*v);
            if !config.retrain_each_step {
                model
                    .update(*v)
                    .map_err(|e| EntityFailure::forecast(id, e.to_string()))?;
            }
        }
    }
    Ok(out)
}

impl Adapter for ClassicalAdapter {
    fn family(&self) -> Family {
        Family::Classical
    }

    fn max_cv_windows(&self) -> usize {
        MAX_CV_WINDOWS_CLASSICAL
    }

    /// Per-entity fit failures are kept for the CV run to report; even a
    /// panel where no entity fits still yields a (null-metric) result.
    fn fit(&mut self, splits: &Splits, ctx: &FitContext<'_>) -> Result<(), AppError> {
        self.seasonality = ctx.dataset.seasonality.max(1);
        self.threads = ctx.hardware.classical_threads();
        self.fit_splits(splits);
        if !self.arena.is_empty() && self.arena.iter().all(|s| matches!(s, Some(Err(_)))) {
            warn!(
                target: "classical",
                model = %self.config.kind,
                entities = self.arena.len(),
                "no entity could be fitted; metrics will be null"
            );
        }
        Ok(())
    }

    fn forecast_one_step_rolling(
        &mut self,
        train: &TrainSeries,
        test: &Series,
        plan: &CvPlan,
    ) -> Result<Vec<f64>, EntityFailure> {
        let model = match self.take_fitted(&train.entity_id) {
            Some(fitted) => fitted?,
            None => self.fit_one(train)?,
        };
        roll(&self.config, model, train, test, plan)
    }

    fn forecast_panel(&mut self, splits: &Splits, plan: &CvPlan) -> Vec<Result<Vec<f64>, EntityFailure>> {
        let mut arena = std::mem::take(&mut self.arena);
        arena.resize_with(splits.n_entities(), || None);
        let jobs: Vec<(Slot, (&TrainSeries, &Series))> = arena
            .into_iter()
            .zip(splits.train.iter().zip(&splits.test))
            .collect();

        let (config, seasonality) = (&self.config, self.seasonality);
        let run = |(slot, (train, test)): (Slot, (&TrainSeries, &Series))| {
            let model = match slot {
                Some(fitted) => fitted?,
                None => fit_entity(config, seasonality, train)?,
            };
            roll(config, model, train, test, plan)
        };
        match self.pool() {
            Some(pool) => pool.install(|| jobs.into_par_iter().map(run).collect()),
            None => jobs.into_iter().map(run).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Frequency;
    use crate::error::ErrorKind;
    use crate::models::ClassicalKind;
    use crate::preprocess::PreprocessReport;
    use chrono::NaiveDate;

    fn splits(train_vals: Vec<f64>, test_vals: Vec<Option<f64>>) -> Splits {
        let start = NaiveDate::from_ymd_opt(2000, 1, 31).unwrap();
        let mut ts = vec![start];
        for _ in 1..(train_vals.len() + test_vals.len()) {
            let last = *ts.last().unwrap();
            ts.push(Frequency::M.advance(last));
        }
        let n = train_vals.len();
        let mut test = Series::new("e");
        for (t, v) in ts[n..].iter().zip(&test_vals) {
            test.push(*t, *v);
        }
        Splits {
            frequency: Frequency::M,
            seasonality: 12,
            horizon: test_vals.len(),
            train: vec![TrainSeries {
                entity_id: "e".into(),
                timestamps: ts[..n].to_vec(),
                values: train_vals,
            }],
            test: vec![test],
            report: PreprocessReport::default(),
        }
    }

    #[test]
    fn naive_uses_actuals_not_predictions() {
        // y_t = t, 45 training points, 5 test points.
        let s = splits((0..45i32).map(f64::from).collect(), (45..50i32).map(|t| Some(f64::from(t))).collect());
        let mut adapter = ClassicalAdapter::with_seasonality(ClassicalConfig::new(ClassicalKind::Naive), 12, 2);
        adapter.fit_splits(&s);
        let plan = CvPlan::new(MAX_CV_WINDOWS_CLASSICAL, 5).unwrap();
        let out = adapter.forecast_panel(&s, &plan);
        assert_eq!(out[0].as_ref().unwrap(), &vec![44.0, 45.0, 46.0, 47.0, 48.0]);
    }

    #[test]
    fn missing_actuals_are_not_appended() {
        let s = splits(vec![1.0, 2.0, 3.0], vec![Some(4.0), None, Some(6.0)]);
        let adapter = ClassicalAdapter::with_seasonality(ClassicalConfig::new(ClassicalKind::Naive), 1, 1);
        let model = adapter.fit_one(&s.train[0]).unwrap();
        let plan = CvPlan::new(5, 3).unwrap();
        let out = roll(adapter.config(), model, &s.train[0], &s.test[0], &plan).unwrap();
        assert_eq!(out, vec![3.0, 4.0, 4.0]);
    }

    #[test]
    fn non_retraining_models_update_within_windows() {
        let mut cfg = ClassicalConfig::new(ClassicalKind::HistoricAverage);
        assert!(!cfg.retrain_each_step);
        let s = splits(vec![2.0, 4.0], vec![Some(6.0), Some(8.0), Some(10.0), Some(12.0)]);
        let adapter = ClassicalAdapter::with_seasonality(cfg.clone(), 1, 1);
        let plan = CvPlan::new(2, 4).unwrap();
        let out = roll(&cfg, adapter.fit_one(&s.train[0]).unwrap(), &s.train[0], &s.test[0], &plan).unwrap();
        assert_eq!(out, vec![3.0, 4.0, 5.0, 6.0]);

        // Retraining gives the same answer for a model whose state is its history.
        cfg.retrain_each_step = true;
        let out2 = roll(&cfg, adapter.fit_one(&s.train[0]).unwrap(), &s.train[0], &s.test[0], &plan).unwrap();
        assert_eq!(out, out2);
    }

    #[test]
    fn fit_failures_become_entity_failures() {
        // ARIMA cannot fit an empty history.
        let s = splits(vec![], vec![Some(1.0)]);
        let mut adapter = ClassicalAdapter::with_seasonality(ClassicalConfig::new(ClassicalKind::AutoArima), 1, 1);
        adapter.fit_splits(&s);
        let plan = CvPlan::new(5, 1).unwrap();
        let out = adapter.forecast_panel(&s, &plan);
        assert_eq!(out[0].as_ref().unwrap_err().kind, ErrorKind::ModelFitFailure);
    }

    #[test]
    fn a_panel_that_never_fits_still_evaluates() {
        use crate::config::RunConfig;
        use crate::domain::{DatasetDescriptor, GroupTag, ResultQuality};
        use crate::hardware::probe_with;

        let dir = tempfile::tempdir().unwrap();
        let run = RunConfig::new(dir.path(), dir.path()).unwrap();
        let hardware = probe_with(2, 0, false, None);
        let ds = DatasetDescriptor {
            name: "ftsfr_empty".into(),
            module: "m".into(),
            panel_path: "/unused.parquet".into(),
            frequency: Frequency::M,
            seasonality: 1,
            group: GroupTag::Other,
            description: String::new(),
            table_display_name: "Empty".into(),
            short_name: "empty".into(),
            is_balanced: true,
            required_data_sources: Vec::new(),
        };
        let ctx = FitContext {
            dataset: &ds,
            model_key: "auto_arima",
            hardware: &hardware,
            run: &run,
            debug: false,
            seed: 1,
        };

        let s = splits(vec![], vec![Some(1.0)]);
        let mut adapter = ClassicalAdapter::new(ClassicalConfig::new(ClassicalKind::AutoArima));
        adapter.fit(&s, &ctx).unwrap();
        let outcome = crate::cv::run(&mut adapter, &s).unwrap();
        assert_eq!(outcome.failures().count(), 1);
        let metrics = crate::metrics::evaluate(&outcome, &s);
        assert_eq!(metrics.mase, None);
        assert_eq!(metrics.quality(), ResultQuality::NullMase);
    }
}
