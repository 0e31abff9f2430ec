//! Adapters bridge model families to one fit/forecast contract.
//!
//! The CV engine only talks to [`Adapter`]. Dispatch from a catalog entry to
//! an adapter is an exhaustive match on the entry's family.

use crate::config::RunConfig;
use crate::cv::{CvPlan, EntityFailure};
use crate::domain::{DatasetDescriptor, Family, Series};
use crate::error::AppError;
use crate::hardware::HardwareConfig;
use crate::preprocess::{Splits, TrainSeries};
use crate::registry::{ModelDescriptor, ModelSpec};

pub mod classical;
pub mod foundation;
pub mod neural;

pub use classical::ClassicalAdapter;
pub use foundation::FoundationAdapter;
pub use neural::NeuralAdapter;

/// Job-level inputs every adapter may consult while fitting.
pub struct FitContext<'a> {
    pub dataset: &'a DatasetDescriptor,
    pub model_key: &'a str,
    pub hardware: &'a HardwareConfig,
    pub run: &'a RunConfig,
    pub debug: bool,
    pub seed: u64,
}

pub trait Adapter: Send {
    fn family(&self) -> Family;

    /// Upper bound on CV windows for this family.
    fn max_cv_windows(&self) -> usize;

    fn fit(&mut self, splits: &Splits, ctx: &FitContext<'_>) -> Result<(), AppError>;

    /// One prediction per test timestamp, conditioned on the training window
    /// and every earlier observed test actual.
    fn forecast_one_step_rolling(
        &mut self,
        train: &TrainSeries,
        test: &Series,
        plan: &CvPlan,
    ) -> Result<Vec<f64>, EntityFailure>;

    /// Rolling forecasts for every entity, in split order.
    fn forecast_panel(&mut self, splits: &Splits, plan: &CvPlan) -> Vec<Result<Vec<f64>, EntityFailure>> {
        splits
            .train
            .iter()
            .zip(&splits.test)
            .map(|(train, test)| self.forecast_one_step_rolling(train, test, plan))
            .collect()
    }
}

/// Instantiate the adapter for a catalog entry.
pub fn build(model: &ModelDescriptor) -> Box<dyn Adapter> {
    match &model.spec {
        ModelSpec::Classical(cfg) => Box::new(ClassicalAdapter::new(cfg.clone())),
        ModelSpec::Neural(cfg) => Box::new(NeuralAdapter::new(cfg.clone())),
        ModelSpec::Foundation(cfg) => Box::new(FoundationAdapter::new(cfg.clone())),
    }
}

/// Rolling one-step forecasts batched across entities per origin offset.
///
/// At offset `k` every entity with more than `k` test timestamps is predicted
/// in one call; then each observed actual at `k` is appended to its history.
/// A failed call fails every entity in that batch.
pub(crate) fn rolling_batched<F>(
    train: &[&TrainSeries],
    test: &[&Series],
    mut predict: F,
) -> Vec<Result<Vec<f64>, EntityFailure>>
where
    F: FnMut(&[&[f64]]) -> Result<Vec<f64>, String>,
{
    let mut histories: Vec<Vec<f64>> = train.iter().map(|t| t.values.clone()).collect();
    let mut preds: Vec<Vec<f64>> = test.iter().map(|t| Vec::with_capacity(t.len())).collect();
    let mut failed: Vec<Option<EntityFailure>> = vec![None; test.len()];
    let max_len = test.iter().map(|t| t.len()).max().unwrap_or(0);

    for k in 0..max_len {
        let active: Vec<usize> = (0..test.len())
            .filter(|&e| failed[e].is_none() && test[e].len() > k)
            .collect();
        if active.is_empty() {
            break;
        }
        let batch: Vec<&[f64]> = active.iter().map(|&e| histories[e].as_slice()).collect();
        match predict(&batch) {
            Ok(out) if out.len() == active.len() => {
                for (&e, p) in active.iter().zip(out) {
                    preds[e].push(p);
                    if let Some(actual) = test[e].values[k] {
                        histories[e].push(actual);
                    }
                }
            }
            Ok(out) => {
                let msg = format!("batch returned {} predictions for {} entities", out.len(), active.len());
                for &e in &active {
                    failed[e] = Some(EntityFailure::forecast(&test[e].entity_id, msg.clone()));
                }
            }
            Err(msg) => {
                for &e in &active {
                    failed[e] = Some(EntityFailure::forecast(&test[e].entity_id, msg.clone()));
                }
            }
        }
    }

    preds
        .into_iter()
        .zip(failed)
        .map(|(p, f)| match f {
            Some(failure) => Err(failure),
            None => Ok(p),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn train(id: &str, values: &[f64]) -> TrainSeries {
        TrainSeries {
            entity_id: id.to_string(),
            timestamps: (0..values.len())
                .map(|i| NaiveDate::from_ymd_opt(2000, 1, 1).unwrap() + chrono::Days::new(i as u64))
                .collect(),
            values: values.to_vec(),
        }
    }

    fn test_series(id: &str, values: &[Option<f64>]) -> Series {
        let mut s = Series::new(id);
        for (i, v) in values.iter().enumerate() {
            s.push(NaiveDate::from_ymd_opt(2001, 1, 1).unwrap() + chrono::Days::new(i as u64), *v);
        }
        s
    }

    #[test]
    fn batched_rolling_feeds_actuals_forward() {
        let tr = [train("a", &[1.0, 2.0]), train("b", &[10.0])];
        let te = [
            test_series("a", &[Some(3.0), None, Some(5.0)]),
            test_series("b", &[Some(11.0)]),
        ];
        let mut calls = Vec::new();
        let out = rolling_batched(&[&tr[0], &tr[1]], &[&te[0], &te[1]], |h| {
            calls.push(h.len());
            Ok(h.iter().map(|s| *s.last().unwrap()).collect())
        });
        assert_eq!(calls, vec![2, 1, 1]);
        assert_eq!(out[0].as_ref().unwrap(), &vec![2.0, 3.0, 3.0]);
        assert_eq!(out[1].as_ref().unwrap(), &vec![10.0]);
    }

    #[test]
    fn a_failed_batch_fails_its_entities() {
        let tr = [train("a", &[1.0])];
        let te = [test_series("a", &[Some(2.0), Some(3.0)])];
        let out = rolling_batched(&[&tr[0]], &[&te[0]], |_| Err("boom".to_string()));
        let err = out[0].as_ref().unwrap_err();
        assert_eq!(err.message, "boom");
    }
}
