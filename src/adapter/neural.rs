//! Neural adapter: one global network per panel, chosen by search.

use tracing::info;

use super::{Adapter, FitContext, rolling_batched};
use crate::cv::{CvPlan, EntityFailure, MAX_CV_WINDOWS_NEURAL};
use crate::domain::{Family, Series};
use crate::error::AppError;
use crate::neural::{self, FitRequest, FittedNeural, NeuralConfig};
use crate::preprocess::{Splits, TrainSeries};

pub struct NeuralAdapter {
    config: NeuralConfig,
    fitted: Option<FittedNeural>,
}

impl NeuralAdapter {
    pub fn new(config: NeuralConfig) -> Self {
        Self { config, fitted: None }
    }

    pub fn fitted(&self) -> Option<&FittedNeural> {
        self.fitted.as_ref()
    }

    fn not_fitted(test: &[&Series]) -> Vec<Result<Vec<f64>, EntityFailure>> {
        test.iter()
            .map(|t| Err(EntityFailure::forecast(&t.entity_id, "forecast requested before fit")))
            .collect()
    }

    fn roll(&self, train: &[&TrainSeries], test: &[&Series]) -> Vec<Result<Vec<f64>, EntityFailure>> {
        match &self.fitted {
            Some(fitted) => rolling_batched(train, test, |histories| fitted.predict(histories)),
            None => Self::not_fitted(test),
        }
    }
}

impl Adapter for NeuralAdapter {
    fn family(&self) -> Family {
        Family::NeuralAuto
    }

    fn max_cv_windows(&self) -> usize {
        MAX_CV_WINDOWS_NEURAL
    }

    fn fit(&mut self, splits: &Splits, ctx: &FitContext<'_>) -> Result<(), AppError> {
        let config = if ctx.debug {
            self.config.debug_capped()
        } else {
            self.config.clone()
        };
        let log_dir = ctx
            .run
            .trial_log_root()
            .join(&ctx.dataset.name)
            .join(ctx.model_key);
        info!(
            target: "hpo",
            model = ctx.model_key,
            dataset = %ctx.dataset.name,
            trials = config.num_samples,
            jobs = ctx.hardware.hpo_parallel_jobs,
            "starting search"
        );
        let fitted = neural::fit_auto(FitRequest {
            config: &config,
            seasonality: splits.seasonality,
            horizon: splits.horizon,
            series: splits.train.iter().map(|t| t.values.clone()).collect(),
            device: ctx.hardware.device(),
            parallel_jobs: ctx.hardware.hpo_parallel_jobs,
            seed: ctx.seed,
            log_dir: Some(log_dir),
        })?;
        self.fitted = Some(fitted);
        Ok(())
    }

    fn forecast_one_step_rolling(
        &mut self,
        train: &TrainSeries,
        test: &Series,
        _plan: &CvPlan,
    ) -> Result<Vec<f64>, EntityFailure> {
        self.roll(&[train], &[test])
            .pop()
            .unwrap_or_else(|| Err(EntityFailure::forecast(&test.entity_id, "no prediction produced")))
    }

    fn forecast_panel(&mut self, splits: &Splits, _plan: &CvPlan) -> Vec<Result<Vec<f64>, EntityFailure>> {
        let train: Vec<&TrainSeries> = splits.train.iter().collect();
        let test: Vec<&Series> = splits.test.iter().collect();
        self.roll(&train, &test)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::neural::NeuralArch;
    use chrono::NaiveDate;

    #[test]
    fn forecasting_before_fit_fails_every_entity() {
        let mut adapter = NeuralAdapter::new(NeuralConfig::new(NeuralArch::NLinear));
        let train = TrainSeries {
            entity_id: "a".into(),
            timestamps: vec![NaiveDate::from_ymd_opt(2020, 1, 31).unwrap()],
            values: vec![1.0],
        };
        let mut test = Series::new("a");
        test.push(NaiveDate::from_ymd_opt(2020, 2, 29).unwrap(), Some(2.0));
        let plan = CvPlan::new(MAX_CV_WINDOWS_NEURAL, 1).unwrap();
        let err = adapter.forecast_one_step_rolling(&train, &test, &plan).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForecastFailure);
        assert!(adapter.fitted().is_none());
    }
}
