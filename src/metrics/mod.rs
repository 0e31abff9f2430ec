//! Point-forecast error metrics.
//!
//! Every metric is computed per entity and then averaged across entities
//! without weights. An entity whose metric is undefined contributes nothing;
//! when fewer than a tenth of the panel's entities yield a valid value the
//! panel metric itself is null.

use tracing::warn;

use crate::cv::{AlignedSeries, CvOutcome};
use crate::domain::{ErrorRecord, ResultQuality};
use crate::math::stats;
use crate::preprocess::Splits;

/// Relative tolerance under which a MASE scale counts as zero.
const SCALE_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityMetrics {
    pub entity_id: String,
    pub mase: Option<f64>,
    pub mse: Option<f64>,
    pub rmse: Option<f64>,
    pub r2oos: Option<f64>,
}

/// Panel-level metrics and how many entities backed each one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelMetrics {
    pub mase: Option<f64>,
    pub mse: Option<f64>,
    pub rmse: Option<f64>,
    pub r2oos: Option<f64>,
    pub total_entities: usize,
    pub valid_mase: usize,
    pub valid_mse: usize,
    pub valid_r2oos: usize,
}

impl PanelMetrics {
    pub fn quality(&self) -> ResultQuality {
        ResultQuality::from_mase(self.mase)
    }

    pub fn into_record(self, model_key: &str, dataset_name: &str, wall_time_seconds: f64) -> ErrorRecord {
        ErrorRecord {
            model_key: model_key.to_string(),
            dataset_name: dataset_name.to_string(),
            quality: self.quality(),
            mase: self.mase,
            mse: self.mse,
            rmse: self.rmse,
            r2oos: self.r2oos,
            wall_time_seconds,
        }
    }
}

/// Mean absolute seasonal difference of the training window.
pub fn seasonal_scale(train: &[f64], seasonality: usize) -> Option<f64> {
    let m = seasonality.max(1);
    let diffs: Vec<f64> = stats::diff(train, m).iter().map(|d| d.abs()).collect();
    stats::mean(&diffs)
}

/// MASE for one entity.
///
/// The scale counts as zero below `1e-10 * max(1, mean|train|)`. On such a
/// series the metric is null, unless the forecast errors are themselves
/// below the same tolerance, in which case the forecast is exact and scores 0.
pub fn mase(actual: &[f64], predicted: &[f64], train: &[f64], seasonality: usize) -> Option<f64> {
    let mae = stats::mean(&abs_errors(actual, predicted))?;
    let scale = seasonal_scale(train, seasonality)?;
    let level = stats::mean(&train.iter().map(|v| v.abs()).collect::<Vec<_>>()).unwrap_or(0.0);
    let tol = SCALE_TOLERANCE * level.max(1.0);
    if scale > tol {
        Some(mae / scale)
    } else if mae <= tol {
        Some(0.0)
    } else {
        None
    }
}

pub fn mse(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    let sq: Vec<f64> = actual.iter().zip(predicted).map(|(a, p)| (a - p) * (a - p)).collect();
    stats::mean(&sq)
}

/// Out-of-sample R² against the training mean.
///
/// Null when the baseline explains nothing to compare against (zero sum of
/// squares) or there are no pairs.
pub fn r2oos(actual: &[f64], predicted: &[f64], train: &[f64]) -> Option<f64> {
    let baseline = stats::mean(train)?;
    if actual.is_empty() {
        return None;
    }
    let ss_model: f64 = actual.iter().zip(predicted).map(|(a, p)| (a - p) * (a - p)).sum();
    let ss_base: f64 = actual.iter().map(|a| (a - baseline) * (a - baseline)).sum();
    if ss_base > 0.0 && ss_base.is_finite() {
        Some(1.0 - ss_model / ss_base)
    } else {
        None
    }
}

fn abs_errors(actual: &[f64], predicted: &[f64]) -> Vec<f64> {
    actual.iter().zip(predicted).map(|(a, p)| (a - p).abs()).collect()
}

pub fn entity_metrics(aligned: &AlignedSeries, train: &[f64], seasonality: usize) -> EntityMetrics {
    let (a, p) = (&aligned.actual, &aligned.predicted);
    let mse = mse(a, p);
    EntityMetrics {
        entity_id: aligned.entity_id.clone(),
        mase: mase(a, p, train, seasonality),
        rmse: mse.map(f64::sqrt),
        mse,
        r2oos: r2oos(a, p, train),
    }
}

/// Unweighted mean of the valid values, or null when fewer than 10% of
/// `total` entities have one.
fn panel_mean(name: &str, values: &[f64], total: usize) -> Option<f64> {
    if total == 0 || values.len() * 10 < total {
        warn!(
            target: "metrics",
            metric = name,
            valid = values.len(),
            total,
            "too few entities with a valid value; metric is null"
        );
        return None;
    }
    stats::mean(values)
}

/// Combine per-entity metrics over a panel of `total_entities`.
pub fn aggregate(entities: &[EntityMetrics], total_entities: usize) -> PanelMetrics {
    let collect = |f: fn(&EntityMetrics) -> Option<f64>| -> Vec<f64> {
        entities.iter().filter_map(f).filter(|v| v.is_finite()).collect()
    };
    let mase = collect(|e| e.mase);
    let mse = collect(|e| e.mse);
    let rmse = collect(|e| e.rmse);
    let r2 = collect(|e| e.r2oos);

    let out = PanelMetrics {
        mase: panel_mean("MASE", &mase, total_entities),
        mse: panel_mean("MSE", &mse, total_entities),
        rmse: panel_mean("RMSE", &rmse, total_entities),
        r2oos: panel_mean("R2oos", &r2, total_entities),
        total_entities,
        valid_mase: mase.len(),
        valid_mse: mse.len(),
        valid_r2oos: r2.len(),
    };
    if out.mase == Some(0.0) {
        warn!(target: "metrics", "MASE is exactly zero; predictions reproduce the actuals");
    }
    out
}

/// Metrics for a finished CV run.
///
/// Failed entities count towards the panel size but contribute no value.
pub fn evaluate(outcome: &CvOutcome, splits: &Splits) -> PanelMetrics {
    let per_entity: Vec<EntityMetrics> = outcome
        .entities
        .iter()
        .zip(&splits.train)
        .filter_map(|(result, train)| result.as_ref().ok().map(|a| (a, train)))
        .map(|(aligned, train)| entity_metrics(aligned, &train.values, splits.seasonality))
        .collect();
    let undefined = per_entity.iter().filter(|e| e.mase.is_none()).count();
    if undefined > 0 {
        warn!(target: "metrics", entities = undefined, "MASE undefined for some entities");
    }
    aggregate(&per_entity, splits.n_entities())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cv::{CvPlan, EntityFailure};
    use crate::domain::{Frequency, Series};
    use crate::preprocess::{PreprocessReport, TrainSeries};
    use chrono::NaiveDate;

    fn aligned(actual: Vec<f64>, predicted: Vec<f64>) -> AlignedSeries {
        AlignedSeries {
            entity_id: "e".into(),
            actual,
            predicted,
        }
    }

    #[test]
    fn mase_scales_by_seasonal_naive_error() {
        // Training seasonal differences with m = 2 are all 2.
        let train = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let v = mase(&[7.0, 8.0], &[6.0, 7.0], &train, 2).unwrap();
        assert!((v - 0.5).abs() < 1e-12);
    }

    #[test]
    fn mase_is_null_on_a_flat_scale_unless_exact() {
        let flat = [3.0; 10];
        assert_eq!(mase(&[3.0], &[4.0], &flat, 1), None);
        assert_eq!(mase(&[3.0], &[3.0], &flat, 1), Some(0.0));
        // Too short for one seasonal difference.
        assert_eq!(mase(&[3.0], &[4.0], &[1.0, 2.0], 12), None);
    }

    #[test]
    fn r2oos_against_training_mean() {
        let train = [0.0, 2.0];
        // Baseline predicts 1 everywhere.
        let r = r2oos(&[2.0, 0.0], &[2.0, 0.0], &train).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
        let r = r2oos(&[2.0, 0.0], &[1.0, 1.0], &train).unwrap();
        assert!(r.abs() < 1e-12);
        let r = r2oos(&[2.0, 0.0], &[0.0, 2.0], &train).unwrap();
        assert!(r < 0.0);
        // Zero baseline variance.
        assert_eq!(r2oos(&[1.0, 1.0], &[1.0, 2.0], &train), None);
    }

    #[test]
    fn entity_with_no_pairs_is_all_null() {
        let m = entity_metrics(&aligned(vec![], vec![]), &[1.0, 2.0, 3.0], 1);
        assert_eq!(m.mase, None);
        assert_eq!(m.mse, None);
        assert_eq!(m.rmse, None);
        assert_eq!(m.r2oos, None);
    }

    #[test]
    fn aggregate_is_unweighted_and_honours_the_tenth_rule() {
        let e = |mase: f64| EntityMetrics {
            entity_id: "x".into(),
            mase: Some(mase),
            mse: Some(mase * mase),
            rmse: Some(mase),
            r2oos: None,
        };
        let out = aggregate(&[e(1.0), e(3.0)], 2);
        assert_eq!(out.mase, Some(2.0));
        assert_eq!(out.mse, Some(5.0));
        assert_eq!(out.r2oos, None);
        assert_eq!(out.quality(), ResultQuality::Ok);

        // One valid entity out of 11 is below 10%.
        let out = aggregate(&[e(1.0)], 11);
        assert_eq!(out.mase, None);
        assert_eq!(out.valid_mase, 1);
        assert_eq!(out.quality(), ResultQuality::NullMase);
        // Exactly 10% is enough.
        assert_eq!(aggregate(&[e(1.0)], 10).mase, Some(1.0));
    }

    #[test]
    fn record_carries_quality_flag() {
        let m = PanelMetrics {
            mase: Some(0.0),
            ..PanelMetrics::default()
        };
        let r = m.into_record("naive", "ftsfr_x", 2.0);
        assert_eq!(r.quality, ResultQuality::ZeroMase);
        assert_eq!(r.model_key, "naive");
    }

    fn splits_for(ids: &[&str]) -> Splits {
        let start = NaiveDate::from_ymd_opt(2000, 1, 31).unwrap();
        let train = ids
            .iter()
            .map(|id| TrainSeries {
                entity_id: id.to_string(),
                timestamps: std::iter::successors(Some(start), |d| Some(Frequency::M.advance(*d)))
                    .take(10)
                    .collect(),
                values: (0..10i32).map(f64::from).collect(),
            })
            .collect();
        Splits {
            frequency: Frequency::M,
            seasonality: 1,
            horizon: 2,
            train,
            test: ids.iter().map(|id| Series::new(*id)).collect(),
            report: PreprocessReport::default(),
        }
    }

    fn outcome(entities: Vec<Result<AlignedSeries, EntityFailure>>) -> CvOutcome {
        CvOutcome {
            plan: CvPlan::new(5, 2).unwrap(),
            forecasts: Vec::new(),
            entities,
        }
    }

    fn pairs(id: &str, predicted: Vec<f64>) -> Result<AlignedSeries, EntityFailure> {
        Ok(AlignedSeries {
            entity_id: id.into(),
            actual: vec![10.0, 11.0],
            predicted,
        })
    }

    #[test]
    fn failed_and_unobserved_entities_drop_out_of_the_average() {
        let splits = splits_for(&["a", "b", "c", "d"]);
        let out = evaluate(
            &outcome(vec![
                pairs("a", vec![9.0, 10.0]),
                pairs("b", vec![7.0, 8.0]),
                Err(EntityFailure::fit("c", "diverged")),
                // Every test actual was missing.
                Ok(aligned(vec![], vec![])),
            ]),
            &splits,
        );
        assert_eq!(out.total_entities, 4);
        assert_eq!(out.valid_mase, 2);
        assert_eq!(out.mase, Some(2.0));
        assert_eq!(out.mse, Some(5.0));
        // Training mean 4.5 gives a baseline sum of squares of 72.5 per entity.
        let r2 = out.r2oos.unwrap();
        assert!((r2 - (1.0 - 10.0 / 72.5)).abs() < 1e-12);
    }

    #[test]
    fn evaluate_is_null_below_a_tenth_of_the_panel() {
        let ids: Vec<String> = (0..11).map(|i| format!("e{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut entities = vec![pairs("e0", vec![9.0, 10.0])];
        entities.extend(ids[1..].iter().map(|id| Err(EntityFailure::forecast(id, "nan"))));

        let out = evaluate(&outcome(entities.clone()), &splits_for(&id_refs));
        assert_eq!(out.valid_mase, 1);
        assert_eq!(out.mase, None);
        assert_eq!(out.rmse, None);
        assert_eq!(out.quality(), ResultQuality::NullMase);

        // With ten entities the single valid one is exactly a tenth.
        entities.pop();
        let out = evaluate(&outcome(entities), &splits_for(&id_refs[..10]));
        assert_eq!(out.mase, Some(1.0));
    }
}
