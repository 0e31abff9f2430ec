//! Benchmark forecasters: naive, seasonal naive, averages, drift.

use std::collections::VecDeque;

use super::{Forecaster, ModelError};

fn require_history(name: &str, history: &[f64]) -> Result<(), ModelError> {
    if history.is_empty() {
        return Err(ModelError::Fit(format!("{name}: empty history")));
    }
    if history.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::Fit(format!("{name}: non-finite history")));
    }
    Ok(())
}

fn not_fitted(name: &str) -> ModelError {
    ModelError::Forecast(format!("{name}: model is not fitted"))
}

/// Repeats the last observation.
#[derive(Debug, Clone, Default)]
pub struct Naive {
    last: Option<f64>,
}

impl Forecaster for Naive {
    fn name(&self) -> &'static str {
        "Naive"
    }

    fn fit(&mut self, history: &[f64]) -> Result<(), ModelError> {
        require_history(self.name(), history)?;
        self.last = history.last().copied();
        Ok(())
    }

    fn predict_next(&self) -> Result<f64, ModelError> {
        self.last.ok_or_else(|| not_fitted(self.name()))
    }

    fn update(&mut self, actual: f64) -> Result<(), ModelError> {
        self.last = Some(actual);
        Ok(())
    }
}

/// Repeats the observation one season back.
///
/// With less than one full season of history it degrades to [`Naive`].
#[derive(Debug, Clone)]
pub struct SeasonalNaive {
    season: usize,
    tail: VecDeque<f64>,
}

impl SeasonalNaive {
    pub fn new(season: usize) -> Self {
        Self {
            season: season.max(1),
            tail: VecDeque::new(),
        }
    }
}

impl Forecaster for SeasonalNaive {
    fn name(&self) -> &'static str {
        "SeasonalNaive"
    }

    fn fit(&mut self, history: &[f64]) -> Result<(), ModelError> {
        require_history(self.name(), history)?;
        let start = history.len().saturating_sub(self.season);
        self.tail = history[start..].iter().copied().collect();
        Ok(())
    }

    fn predict_next(&self) -> Result<f64, ModelError> {
        if self.tail.len() == self.season {
            self.tail.front().copied().ok_or_else(|| not_fitted(self.name()))
        } else {
            self.tail.back().copied().ok_or_else(|| not_fitted(self.name()))
        }
    }

    fn update(&mut self, actual: f64) -> Result<(), ModelError> {
        self.tail.push_back(actual);
        while self.tail.len() > self.season {
            self.tail.pop_front();
        }
        Ok(())
    }
}

/// Mean of the entire history.
#[derive(Debug, Clone, Default)]
pub struct HistoricAverage {
    sum: f64,
    count: usize,
}

impl Forecaster for HistoricAverage {
    fn name(&self) -> &'static str {
        "HistoricAverage"
    }

    fn fit(&mut self, history: &[f64]) -> Result<(), ModelError> {
        require_history(self.name(), history)?;
        self.sum = history.iter().sum();
        self.count = history.len();
        Ok(())
    }

    fn predict_next(&self) -> Result<f64, ModelError> {
        if self.count == 0 {
            return Err(not_fitted(self.name()));
        }
        Ok(self.sum / self.count as f64)
    }

    fn update(&mut self, actual: f64) -> Result<(), ModelError> {
        self.sum += actual;
        self.count += 1;
        Ok(())
    }
}

/// Mean of the last `window` observations.
#[derive(Debug, Clone)]
pub struct WindowAverage {
    window: usize,
    tail: VecDeque<f64>,
}

impl WindowAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            tail: VecDeque::new(),
        }
    }
}

impl Forecaster for WindowAverage {
    fn name(&self) -> &'static str {
        "WindowAverage"
    }

    fn fit(&mut self, history: &[f64]) -> Result<(), ModelError> {
        require_history(self.name(), history)?;
        let start = history.len().saturating_sub(self.window);
        self.tail = history[start..].iter().copied().collect();
        Ok(())
    }

    fn predict_next(&self) -> Result<f64, ModelError> {
        if self.tail.is_empty() {
            return Err(not_fitted(self.name()));
        }
        Ok(self.tail.iter().sum::<f64>() / self.tail.len() as f64)
    }

    fn update(&mut self, actual: f64) -> Result<(), ModelError> {
        self.tail.push_back(actual);
        while self.tail.len() > self.window {
            self.tail.pop_front();
        }
        Ok(())
    }
}

/// Last value plus the average historical step.
#[derive(Debug, Clone, Default)]
pub struct RandomWalkWithDrift {
    first: f64,
    last: f64,
    count: usize,
}

impl Forecaster for RandomWalkWithDrift {
    fn name(&self) -> &'static str {
        "RandomWalkWithDrift"
    }

    fn fit(&mut self, history: &[f64]) -> Result<(), ModelError> {
        require_history(self.name(), history)?;
        self.first = history[0];
        self.last = history[history.len() - 1];
        self.count = history.len();
        Ok(())
    }

    fn predict_next(&self) -> Result<f64, ModelError> {
        match self.count {
            0 => Err(not_fitted(self.name())),
            1 => Ok(self.last),
            n => Ok(self.last + (self.last - self.first) / (n - 1) as f64),
        }
    }

    fn update(&mut self, actual: f64) -> Result<(), ModelError> {
        self.last = actual;
        self.count += 1;
        Ok(())
    }
}
