//! Rolling-origin one-step-ahead evaluation.
//!
//! The engine turns one unified plan `{n_windows, step_size = 1, horizon = 1}`
//! into calls on an adapter, then aligns predictions with the test actuals.
//! Actuals, never predictions, are fed forward between steps.

use std::ops::Range;

use tracing::{debug, warn};

use crate::adapter::Adapter;
use crate::domain::{ForecastRecord, Series};
use crate::error::{AppError, ErrorKind};
use crate::preprocess::{Splits, TrainSeries};

/// Window cap for classical adapters.
pub const MAX_CV_WINDOWS_CLASSICAL: usize = 5;
pub const MAX_CV_WINDOWS_FOUNDATION: usize = 5;
pub const MAX_CV_WINDOWS_NEURAL: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CvPlan {
    pub n_windows: usize,
    pub step_size: usize,
    pub horizon: usize,
}

impl CvPlan {
    /// Plan for a panel whose shortest test window has `shortest_test_len`
    /// timestamps.
    pub fn new(max_windows: usize, shortest_test_len: usize) -> Result<Self, AppError> {
        let step_size = 1;
        let n_windows = max_windows.min(shortest_test_len / step_size);
        if n_windows == 0 {
            return Err(AppError::new(
                ErrorKind::InsufficientHistory,
                format!("Shortest test window ({shortest_test_len}) cannot supply a CV window."),
            ));
        }
        Ok(Self {
            n_windows,
            step_size,
            horizon: 1,
        })
    }

    /// Partition `0..len` into `n_windows` contiguous chunks of near-equal
    /// length. Empty chunks are dropped.
    pub fn windows(&self, len: usize) -> Vec<Range<usize>> {
        let n = self.n_windows.max(1);
        (0..n)
            .map(|i| (i * len / n)..((i + 1) * len / n))
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// Offsets at which a window starts.
    pub fn origins(&self, len: usize) -> Vec<usize> {
        self.windows(len).into_iter().map(|r| r.start).collect()
    }

    pub fn window_of(&self, offset: usize, len: usize) -> usize {
        self.windows(len)
            .iter()
            .position(|r| r.contains(&offset))
            .unwrap_or(0)
    }
}

/// A per-entity model failure. The entity's metrics become null.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFailure {
    pub entity_id: String,
    /// `ModelFitFailure` or `ForecastFailure`.
    pub kind: ErrorKind,
    pub message: String,
}

impl EntityFailure {
    pub fn fit(entity_id: &str, message: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            kind: ErrorKind::ModelFitFailure,
            message: message.into(),
        }
    }

    pub fn forecast(entity_id: &str, message: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            kind: ErrorKind::ForecastFailure,
            message: message.into(),
        }
    }
}

/// Predictions paired with observed actuals for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSeries {
    pub entity_id: String,
    pub actual: Vec<f64>,
    pub predicted: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct CvOutcome {
    pub plan: CvPlan,
    /// Ordered by `(entity, cutoff)`; one per aligned pair.
    pub forecasts: Vec<ForecastRecord>,
    /// One entry per entity of the splits, in the same order.
    pub entities: Vec<Result<AlignedSeries, EntityFailure>>,
}

impl CvOutcome {
    pub fn aligned_pairs(&self) -> usize {
        self.entities
            .iter()
            .filter_map(|e| e.as_ref().ok())
            .map(|a| a.actual.len())
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityFailure> {
        self.entities.iter().filter_map(|e| e.as_ref().err())
    }
}

/// Run the adapter over every entity and align its output.
pub fn run(adapter: &mut dyn Adapter, splits: &Splits) -> Result<CvOutcome, AppError> {
    let plan = CvPlan::new(adapter.max_cv_windows(), splits.shortest_test_len())?;
    debug!(target: "cv", n_windows = plan.n_windows, entities = splits.n_entities(), "rolling origin plan");

    let predictions = adapter.forecast_panel(splits, &plan);
    let mut forecasts = Vec::new();
    let mut entities = Vec::with_capacity(splits.n_entities());

    for ((train, test), result) in splits.train.iter().zip(&splits.test).zip(predictions) {
        let checked = result.and_then(|preds| check_predictions(test, preds));
        match checked {
            Ok(preds) => {
                forecasts.extend(records(&plan, train, test, &preds));
                entities.push(Ok(align(test, &preds)));
            }
            Err(failure) => entities.push(Err(failure)),
        }
    }

    let outcome = CvOutcome {
        plan,
        forecasts,
        entities,
    };
    let failed = outcome.failures().count();
    if failed > 0 {
        let fit = outcome
            .failures()
            .filter(|f| f.kind == ErrorKind::ModelFitFailure)
            .count();
        warn!(
            target: "cv",
            failed,
            fit_failures = fit,
            forecast_failures = failed - fit,
            "entities failed; their metrics are null"
        );
    }
    Ok(outcome)
}

fn check_predictions(test: &Series, preds: Vec<f64>) -> Result<Vec<f64>, EntityFailure> {
    if preds.len() != test.len() {
        return Err(EntityFailure::forecast(
            &test.entity_id,
            format!("expected {} predictions, got {}", test.len(), preds.len()),
        ));
    }
    if let Some(pos) = preds.iter().position(|p| !p.is_finite()) {
        return Err(EntityFailure::forecast(
            &test.entity_id,
            format!("non-finite prediction at test offset {pos}"),
        ));
    }
    Ok(preds)
}

fn records(plan: &CvPlan, train: &TrainSeries, test: &Series, preds: &[f64]) -> Vec<ForecastRecord> {
    let windows = plan.windows(test.len());
    let mut out = Vec::with_capacity(preds.len());
    for (w, range) in windows.iter().enumerate() {
        for k in range.clone() {
            // Steps without an actual are forecast but never materialized.
            if test.values[k].is_none() {
                continue;
            }
            let cutoff = if k == 0 {
                train.last_timestamp().unwrap_or(test.timestamps[0])
            } else {
                test.timestamps[k - 1]
            };
            out.push(ForecastRecord {
                entity_id: test.entity_id.clone(),
                cutoff,
                timestamp: test.timestamps[k],
                window: w,
                prediction: preds[k],
            });
        }
    }
    out
}

/// Pair each prediction with its actual; drop pairs with a missing actual.
pub fn align(test: &Series, preds: &[f64]) -> AlignedSeries {
    let (actual, predicted): (Vec<f64>, Vec<f64>) = test
        .values
        .iter()
        .zip(preds)
        .filter_map(|(a, p)| a.map(|a| (a, *p)))
        .unzip();
    AlignedSeries {
        entity_id: test.entity_id.clone(),
        actual,
        predicted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn windows_partition_the_test_range() {
        let plan = CvPlan::new(5, 24).unwrap();
        assert_eq!(plan.n_windows, 5);
        let w = plan.windows(24);
        assert_eq!(w.len(), 5);
        assert_eq!(w[0].start, 0);
        assert_eq!(w[4].end, 24);
        assert!(w.windows(2).all(|p| p[0].end == p[1].start));
        assert_eq!(plan.window_of(23, 24), 4);
        assert_eq!(plan.origins(24)[0], 0);

        // A longer entity is split into the same number of chunks.
        assert_eq!(plan.windows(60).len(), 5);
    }

    #[test]
    fn short_test_windows_cap_the_plan() {
        assert_eq!(CvPlan::new(50, 3).unwrap().n_windows, 3);
        let err = CvPlan::new(5, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientHistory);
    }

    #[test]
    fn alignment_drops_missing_actuals() {
        let mut test = Series::new("a");
        let d = |m| NaiveDate::from_ymd_opt(2020, m, 1).unwrap();
        test.push(d(1), Some(1.0));
        test.push(d(2), None);
        test.push(d(3), Some(3.0));
        let a = align(&test, &[0.5, 9.0, 2.5]);
        assert_eq!(a.actual, vec![1.0, 3.0]);
        assert_eq!(a.predicted, vec![0.5, 2.5]);
    }

    #[test]
    fn bad_predictions_become_entity_failures() {
        let mut test = Series::new("a");
        test.push(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), Some(1.0));
        assert!(check_predictions(&test, vec![]).is_err());
        let err = check_predictions(&test, vec![f64::NAN]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForecastFailure);
    }
}
