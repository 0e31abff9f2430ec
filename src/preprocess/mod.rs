//! Panel preprocessing: one set of train/test splits shared by every model.
//!
//! Steps, in order:
//!
//! 1. gap fill on the frequency's period grid
//! 2. test split (the last `h` valid observations per entity)
//! 3. minimum training length filter
//! 4. training imputation (forward fill, backward fill, cross-sectional mean)
//! 5. degenerate-series removal
//! 6. entity-set synchronization between train and test
//!
//! Test values are never imputed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::domain::{Frequency, Panel, Series};
use crate::error::{AppError, ErrorKind};
use crate::math::std_dev;

/// Absolute floor on the number of valid training observations.
pub const MIN_ABSOLUTE: usize = 30;
/// Panels with at most this many entities only apply [`MIN_ABSOLUTE`].
pub const SMALL_PANEL_ENTITIES: usize = 10;
/// Training series with a standard deviation below this are constant.
pub const MIN_TRAIN_STD: f64 = 1e-12;
/// Training magnitudes above this overflow downstream scalers.
pub const MAX_ABS_VALUE: f64 = 1e12;

/// A fully observed training series.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSeries {
    pub entity_id: String,
    pub timestamps: Vec<NaiveDate>,
    pub values: Vec<f64>,
}

impl TrainSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<NaiveDate> {
        self.timestamps.last().copied()
    }
}

/// Why an entity left the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DropReason {
    /// Not enough valid observations to form a test window and a training window.
    NoTrainingWindow,
    TooShort,
    Unimputable,
    Constant,
    NonFinite,
    Magnitude,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreprocessReport {
    pub input_entities: usize,
    pub gap_rows_inserted: usize,
    pub min_train_length: usize,
    pub dropped: BTreeMap<String, DropReason>,
}

impl PreprocessReport {
    pub fn dropped_count(&self, reason: DropReason) -> usize {
        self.dropped.values().filter(|r| **r == reason).count()
    }
}

/// Output of preprocessing.
#[derive(Debug, Clone, PartialEq)]
pub struct Splits {
    pub frequency: Frequency,
    pub seasonality: usize,
    pub horizon: usize,
    /// Ordered by entity id, aligned with `test`.
    pub train: Vec<TrainSeries>,
    pub test: Vec<Series>,
    pub report: PreprocessReport,
}

impl Splits {
    pub fn entities(&self) -> Vec<&str> {
        self.train.iter().map(|t| t.entity_id.as_str()).collect()
    }

    pub fn n_entities(&self) -> usize {
        self.train.len()
    }

    /// Length of the shortest test window.
    pub fn shortest_test_len(&self) -> usize {
        self.test.iter().map(Series::len).min().unwrap_or(0)
    }

    /// Reassemble the splits into a panel (training values as observed).
    pub fn to_panel(&self) -> Panel {
        let rows = self.train.iter().zip(&self.test).flat_map(|(tr, te)| {
            let train_rows = tr
                .timestamps
                .iter()
                .zip(&tr.values)
                .map(|(ts, v)| (tr.entity_id.clone(), *ts, Some(*v)));
            let test_rows = te
                .timestamps
                .iter()
                .zip(&te.values)
                .map(|(ts, v)| (te.entity_id.clone(), *ts, *v));
            train_rows.chain(test_rows).collect::<Vec<_>>()
        });
        Panel::from_rows(rows).0
    }
}

/// Caller-facing knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessOptions {
    pub frequency: Frequency,
    pub seasonality: usize,
    /// `None` uses the frequency's default horizon.
    pub horizon: Option<usize>,
}

/// Minimum number of valid training observations.
pub fn min_train_length(seasonality: usize, n_entities: usize) -> usize {
    if n_entities <= SMALL_PANEL_ENTITIES {
        MIN_ABSOLUTE
    } else {
        MIN_ABSOLUTE.max(4 * seasonality)
    }
}

/// Insert missing rows so consecutive timestamps are one period apart.
///
/// Leading and trailing missing rows are trimmed first, so the grid spans the
/// first to the last observation. Rows that fall into the same period collapse
/// onto the later one. Returns the filled series and the number of inserted rows.
pub fn gap_fill(series: &Series, frequency: Frequency) -> (Series, usize) {
    let mut out = Series::new(series.entity_id.clone());
    let first = series.values.iter().position(Option::is_some);
    let last = series.values.iter().rposition(Option::is_some);
    let (Some(first), Some(last)) = (first, last) else {
        return (out, 0);
    };

    let mut inserted = 0;
    for i in first..=last {
        let ts = series.timestamps[i];
        let value = series.values[i];
        if let Some(&prev) = out.timestamps.last() {
            let gap = frequency.periods_between(prev, ts);
            if gap <= 0 {
                // Same period: the later row wins unless it is missing.
                if value.is_some() {
                    if let Some(slot) = out.values.last_mut() {
                        *slot = value;
                    }
                    if let Some(slot) = out.timestamps.last_mut() {
                        *slot = ts;
                    }
                }
                continue;
            }
            let mut fill = prev;
            for _ in 1..gap {
                fill = frequency.advance(fill);
                out.push(fill, None);
                inserted += 1;
            }
        }
        out.push(ts, value);
    }
    (out, inserted)
}

/// Split off the test window made of the last `h` valid observations.
///
/// Returns `None` when the series has no valid observation before that window.
pub fn split_test(series: &Series, h: usize) -> Option<(Series, Series)> {
    if h == 0 {
        return None;
    }
    let valid: Vec<usize> = series
        .values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|_| i))
        .collect();
    if valid.len() <= h {
        return None;
    }
    let start = valid[valid.len() - h];

    let mut train = Series::new(series.entity_id.clone());
    let mut test = Series::new(series.entity_id.clone());
    for i in 0..series.len() {
        let target = if i < start { &mut train } else { &mut test };
        target.push(series.timestamps[i], series.values[i]);
    }
    Some((train, test))
}

/// Forward fill then backward fill; `None` if nothing is observed.
fn fill_within(values: &[Option<f64>]) -> Option<Vec<f64>> {
    let first = values.iter().flatten().next().copied()?;
    let mut out = Vec::with_capacity(values.len());
    let mut carry = first;
    for v in values {
        if let Some(x) = v {
            carry = *x;
        }
        out.push(carry);
    }
    Some(out)
}

/// Impute training windows.
///
/// Entities with no observation at all take the cross-sectional mean of the
/// other entities at each timestamp; if some timestamp has no donor the entity
/// is returned as `None`.
pub fn impute_training(train: &[Series]) -> Vec<Option<TrainSeries>> {
    let mut by_date: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for s in train {
        for (ts, v) in s.timestamps.iter().zip(&s.values) {
            if let Some(x) = v {
                let slot = by_date.entry(*ts).or_insert((0.0, 0));
                slot.0 += x;
                slot.1 += 1;
            }
        }
    }

    train
        .iter()
        .map(|s| {
            let values = match fill_within(&s.values) {
                Some(v) => v,
                None => s
                    .timestamps
                    .iter()
                    .map(|ts| by_date.get(ts).map(|(sum, n)| sum / *n as f64))
                    .collect::<Option<Vec<f64>>>()?,
            };
            Some(TrainSeries {
                entity_id: s.entity_id.clone(),
                timestamps: s.timestamps.clone(),
                values,
            })
        })
        .collect()
}

/// Classify a training window that would break downstream models.
pub fn degenerate_reason(values: &[f64]) -> Option<DropReason> {
    if values.iter().any(|v| !v.is_finite()) {
        return Some(DropReason::NonFinite);
    }
    if values.iter().any(|v| v.abs() > MAX_ABS_VALUE) {
        return Some(DropReason::Magnitude);
    }
    match std_dev(values) {
        Some(sd) if sd >= MIN_TRAIN_STD => None,
        _ => Some(DropReason::Constant),
    }
}

/// Run the full pipeline over a panel.
pub fn preprocess(panel: &Panel, opts: PreprocessOptions) -> Result<Splits, AppError> {
    let horizon = opts.horizon.unwrap_or_else(|| opts.frequency.default_horizon());
    if horizon == 0 {
        return Err(AppError::new(ErrorKind::InsufficientHistory, "Test horizon must be positive."));
    }

    let mut report = PreprocessReport {
        input_entities: panel.n_entities(),
        min_train_length: min_train_length(opts.seasonality, panel.n_entities()),
        ..PreprocessReport::default()
    };

    // 1-3: gap fill, split, minimum length.
    let mut raw_train = Vec::new();
    let mut tests: BTreeMap<String, Series> = BTreeMap::new();
    for series in &panel.series {
        let (filled, inserted) = gap_fill(series, opts.frequency);
        report.gap_rows_inserted += inserted;

        let Some((train, test)) = split_test(&filled, horizon) else {
            report.dropped.insert(series.entity_id.clone(), DropReason::NoTrainingWindow);
            continue;
        };
        if train.valid_count() < report.min_train_length {
            report.dropped.insert(series.entity_id.clone(), DropReason::TooShort);
            continue;
        }
        tests.insert(series.entity_id.clone(), test);
        raw_train.push(train);
    }

    // 4-5: imputation and degenerate removal.
    let mut train_ok: BTreeMap<String, TrainSeries> = BTreeMap::new();
    for (raw, imputed) in raw_train.iter().zip(impute_training(&raw_train)) {
        let Some(imputed) = imputed else {
            report.dropped.insert(raw.entity_id.clone(), DropReason::Unimputable);
            continue;
        };
        if let Some(reason) = degenerate_reason(&imputed.values) {
            report.dropped.insert(raw.entity_id.clone(), reason);
            continue;
        }
        train_ok.insert(imputed.entity_id.clone(), imputed);
    }

    // 6: both splits cover the same entities.
    let test_ok: BTreeSet<&String> = tests
        .iter()
        .filter(|(_, t)| t.valid_count() > 0)
        .map(|(id, _)| id)
        .collect();
    let keep: Vec<String> = train_ok
        .keys()
        .filter(|id| test_ok.contains(id))
        .cloned()
        .collect();

    if keep.is_empty() {
        return Err(AppError::new(
            ErrorKind::EmptyAfterFiltering,
            format!(
                "No entity survived preprocessing ({} in panel, {} dropped).",
                report.input_entities,
                report.dropped.len()
            ),
        ));
    }

    let mut train = Vec::with_capacity(keep.len());
    let mut test = Vec::with_capacity(keep.len());
    for id in &keep {
        if let (Some(tr), Some(te)) = (train_ok.remove(id), tests.remove(id)) {
            train.push(tr);
            test.push(te);
        }
    }

    for (reason, label) in [
        (DropReason::NoTrainingWindow, "no_training_window"),
        (DropReason::TooShort, "too_short"),
        (DropReason::Constant, "constant"),
        (DropReason::NonFinite, "non_finite"),
        (DropReason::Magnitude, "magnitude"),
        (DropReason::Unimputable, "unimputable"),
    ] {
        let n = report.dropped_count(reason);
        if n > 0 {
            debug!(target: "preprocess", reason = label, entities = n, "entities dropped");
        }
    }
    info!(
        target: "preprocess",
        entities_in = report.input_entities,
        entities_kept = train.len(),
        dropped = report.dropped.len(),
        gap_rows = report.gap_rows_inserted,
        horizon,
        min_train = report.min_train_length,
        "preprocessing finished"
    );

    Ok(Splits {
        frequency: opts.frequency,
        seasonality: opts.seasonality,
        horizon,
        train,
        test,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn month_end(i: u32) -> NaiveDate {
        (0..i).fold(NaiveDate::from_ymd_opt(2000, 1, 31).unwrap(), |d, _| Frequency::M.advance(d))
    }

    fn monthly(id: &str, values: &[Option<f64>]) -> Series {
        let mut s = Series::new(id);
        for (i, v) in values.iter().enumerate() {
            s.push(month_end(i as u32), *v);
        }
        s
    }

    fn opts(h: usize) -> PreprocessOptions {
        PreprocessOptions {
            frequency: Frequency::M,
            seasonality: 12,
            horizon: Some(h),
        }
    }

    fn wiggle(n: usize, phase: f64) -> Vec<Option<f64>> {
        (0..n).map(|t| Some((t as f64 * 0.7 + phase).sin() + 0.01 * t as f64)).collect()
    }

    #[test]
    fn gap_fill_inserts_missing_months() {
        let mut s = Series::new("a");
        s.push(month_end(0), Some(1.0));
        s.push(month_end(3), Some(2.0));
        let (filled, inserted) = gap_fill(&s, Frequency::M);
        assert_eq!(inserted, 2);
        assert_eq!(filled.values, vec![Some(1.0), None, None, Some(2.0)]);
        assert_eq!(filled.timestamps[1], month_end(1));
        assert_eq!(filled.timestamps[2], NaiveDate::from_ymd_opt(2000, 3, 31).unwrap());
    }

    #[test]
    fn test_window_holds_last_valid_observations_and_gaps() {
        let s = monthly("a", &[Some(1.0), Some(2.0), Some(3.0), None, Some(5.0), Some(6.0)]);
        let (train, test) = split_test(&s, 3).unwrap();
        assert_eq!(train.values, vec![Some(1.0), Some(2.0)]);
        assert_eq!(test.values, vec![Some(3.0), None, Some(5.0), Some(6.0)]);
        assert!(split_test(&s, 5).is_none());
    }

    #[test]
    fn short_series_are_dropped() {
        // 3 entities with 10, 40 and 200 monthly points.
        let panel = Panel {
            series: vec![
                monthly("e1", &wiggle(10, 0.0)),
                monthly("e2", &wiggle(40, 1.0)),
                monthly("e3", &wiggle(200, 2.0)),
            ],
        };
        let splits = preprocess(&panel, opts(24)).unwrap();
        assert_eq!(splits.entities(), vec!["e3"]);
        assert_eq!(splits.train[0].len(), 200 - 24);
        assert_eq!(splits.test[0].len(), 24);
        assert_eq!(splits.report.dropped_count(DropReason::TooShort), 2);
    }

    #[test]
    fn constant_panel_is_empty_after_filtering() {
        let panel = Panel {
            series: (0..5).map(|i| monthly(&format!("c{i}"), &vec![Some(1.0); 60])).collect(),
        };
        let err = preprocess(&panel, opts(24)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyAfterFiltering);
    }

    #[test]
    fn training_gaps_are_imputed_but_test_gaps_are_not() {
        let mut values = wiggle(60, 0.3);
        values[0] = None;
        values[10] = None;
        values[57] = None;
        let panel = Panel {
            series: vec![monthly("a", &values)],
        };
        let splits = preprocess(&panel, opts(4)).unwrap();
        let train = &splits.train[0];
        // Leading missing row is trimmed, the interior one forward-filled.
        assert_eq!(train.timestamps[0], month_end(1));
        assert_eq!(train.values[9], values[9].unwrap());
        assert!(splits.test[0].values.contains(&None));
    }

    #[test]
    fn all_missing_entity_takes_cross_sectional_mean() {
        let a = monthly("a", &[Some(1.0), Some(3.0)]);
        let b = monthly("b", &[Some(3.0), None]);
        let c = monthly("c", &[None, None]);
        let out = impute_training(&[a, b, c]);
        assert_eq!(out[1].as_ref().unwrap().values, vec![3.0, 3.0]);
        assert_eq!(out[2].as_ref().unwrap().values, vec![2.0, 3.0]);
    }

    #[test]
    fn degenerate_reasons() {
        assert_eq!(degenerate_reason(&[1.0, 1.0, 1.0]), Some(DropReason::Constant));
        assert_eq!(degenerate_reason(&[1.0, 2e12]), Some(DropReason::Magnitude));
        assert_eq!(degenerate_reason(&[1.0, f64::NAN]), Some(DropReason::NonFinite));
        assert_eq!(degenerate_reason(&[1.0, 2.0]), None);
    }

    #[test]
    fn train_and_test_are_adjacent() {
        let panel = Panel {
            series: vec![monthly("a", &wiggle(80, 0.0)), monthly("b", &wiggle(70, 1.0))],
        };
        let splits = preprocess(&panel, opts(12)).unwrap();
        for (tr, te) in splits.train.iter().zip(&splits.test) {
            let last = tr.last_timestamp().unwrap();
            assert_eq!(Frequency::M.periods_between(last, te.timestamps[0]), 1);
        }
    }

    fn arb_panel() -> impl Strategy<Value = Panel> {
        prop::collection::vec(
            prop::collection::vec(prop::option::weighted(0.9, -100.0f64..100.0), 40..90),
            1..6,
        )
        .prop_map(|entities| Panel {
            series: entities
                .iter()
                .enumerate()
                .map(|(i, vals)| monthly(&format!("e{i}"), vals))
                .collect(),
        })
    }

    proptest! {
        #[test]
        fn preprocessing_is_a_fixed_point(panel in arb_panel()) {
            if let Ok(first) = preprocess(&panel, opts(6)) {
                let second = preprocess(&first.to_panel(), opts(6)).unwrap();
                prop_assert_eq!(&first.train, &second.train);
                prop_assert_eq!(&first.test, &second.test);
            }
        }

        #[test]
        fn gap_fill_is_identity_without_gaps(values in prop::collection::vec(-50.0f64..50.0, 31..80)) {
            let s = monthly("x", &values.iter().copied().map(Some).collect::<Vec<_>>());
            let (filled, inserted) = gap_fill(&s, Frequency::M);
            prop_assert_eq!(inserted, 0);
            prop_assert_eq!(&filled, &s);
            prop_assert!(filled.valid_count() >= min_train_length(12, 1));
        }

        #[test]
        fn dropped_months_are_restored_as_missing(skip in 1usize..20) {
            let vals: Vec<Option<f64>> = (0..24).map(|t| Some(t as f64)).collect();
            let mut s = monthly("x", &vals);
            s.timestamps.remove(skip);
            s.values.remove(skip);
            let (filled, inserted) = gap_fill(&s, Frequency::M);
            prop_assert_eq!(inserted, 1);
            prop_assert_eq!(filled.values[skip], None);
            prop_assert_eq!(filled.timestamps[skip], month_end(skip as u32));
        }
    }
}
