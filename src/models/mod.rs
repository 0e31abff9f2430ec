//! Classical statistical forecasters.
//!
//! Every model implements [`Forecaster`], a one-step interface that matches the
//! rolling-origin protocol: fit on a history, predict the next value, then
//! either refit on the extended history or fold the new actual into the
//! model's state.

use std::fmt;

use thiserror::Error;

pub mod arima;
pub mod baseline;
pub mod ets;
pub mod grid;
pub mod theta;

pub use arima::AutoArima;
pub use baseline::{HistoricAverage, Naive, RandomWalkWithDrift, SeasonalNaive, WindowAverage};
pub use ets::AutoEts;
pub use theta::AutoTheta;

/// Per-entity model failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("fit failed: {0}")]
    Fit(String),
    #[error("forecast failed: {0}")]
    Forecast(String),
}

/// One-step-ahead forecaster over a single univariate history.
pub trait Forecaster: Send {
    fn name(&self) -> &'static str;

    /// Estimate the model from scratch on `history`.
    fn fit(&mut self, history: &[f64]) -> Result<(), ModelError>;

    /// Forecast the value that follows the current state.
    fn predict_next(&self) -> Result<f64, ModelError>;

    /// Fold a newly observed actual into the state without re-estimating
    /// parameters.
    fn update(&mut self, actual: f64) -> Result<(), ModelError>;
}

pub type BoxedForecaster = Box<dyn Forecaster>;

/// Classical constructor refs understood by the model catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassicalKind {
    Naive,
    SeasonalNaive,
    HistoricAverage,
    WindowAverage,
    RandomWalkWithDrift,
    AutoArima,
    AutoEts,
    AutoTheta,
}

impl ClassicalKind {
    pub const ALL: [ClassicalKind; 8] = [
        ClassicalKind::Naive,
        ClassicalKind::SeasonalNaive,
        ClassicalKind::HistoricAverage,
        ClassicalKind::WindowAverage,
        ClassicalKind::RandomWalkWithDrift,
        ClassicalKind::AutoArima,
        ClassicalKind::AutoEts,
        ClassicalKind::AutoTheta,
    ];

    pub fn from_ref(constructor_ref: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.constructor_ref().eq_ignore_ascii_case(constructor_ref.trim()))
    }

    pub fn constructor_ref(self) -> &'static str {
        match self {
            ClassicalKind::Naive => "Naive",
            ClassicalKind::SeasonalNaive => "SeasonalNaive",
            ClassicalKind::HistoricAverage => "HistoricAverage",
            ClassicalKind::WindowAverage => "WindowAverage",
            ClassicalKind::RandomWalkWithDrift => "RandomWalkWithDrift",
            ClassicalKind::AutoArima => "AutoARIMA",
            ClassicalKind::AutoEts => "AutoETS",
            ClassicalKind::AutoTheta => "AutoTheta",
        }
    }

    /// Whether the model is re-estimated after every appended actual.
    ///
    /// Cheap families and families whose state cannot be updated
    /// incrementally refit; ARIMA and the averages update in place.
    pub fn default_retrain_each_step(self) -> bool {
        match self {
            ClassicalKind::Naive
            | ClassicalKind::SeasonalNaive
            | ClassicalKind::RandomWalkWithDrift
            | ClassicalKind::AutoEts
            | ClassicalKind::AutoTheta => true,
            ClassicalKind::HistoricAverage
            | ClassicalKind::WindowAverage
            | ClassicalKind::AutoArima => false,
        }
    }
}

impl fmt::Display for ClassicalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.constructor_ref())
    }
}

/// Typed parameters of a classical catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassicalConfig {
    pub kind: ClassicalKind,
    /// Overrides the dataset seasonality when set.
    pub season_length: Option<usize>,
    /// Window length for `WindowAverage`.
    pub window: usize,
    pub retrain_each_step: bool,
    pub max_p: usize,
    pub max_q: usize,
    pub max_d: usize,
}

impl ClassicalConfig {
    pub fn new(kind: ClassicalKind) -> Self {
        Self {
            kind,
            season_length: None,
            window: 12,
            retrain_each_step: kind.default_retrain_each_step(),
            max_p: 3,
            max_q: 3,
            max_d: 2,
        }
    }

    /// Instantiate a fresh, unfitted model for one entity.
    pub fn build(&self, dataset_seasonality: usize) -> BoxedForecaster {
        let m = self.season_length.unwrap_or(dataset_seasonality).max(1);
        match self.kind {
            ClassicalKind::Naive => Box::new(Naive::default()),
            ClassicalKind::SeasonalNaive => Box::new(SeasonalNaive::new(m)),
            ClassicalKind::HistoricAverage => Box::new(HistoricAverage::default()),
            ClassicalKind::WindowAverage => Box::new(WindowAverage::new(self.window.max(1))),
            ClassicalKind::RandomWalkWithDrift => Box::new(RandomWalkWithDrift::default()),
            ClassicalKind::AutoArima => Box::new(AutoArima::new(self.max_p, self.max_d, self.max_q)),
            ClassicalKind::AutoEts => Box::new(AutoEts::new(m)),
            ClassicalKind::AutoTheta => Box::new(AutoTheta::new(m)),
        }
    }
}
