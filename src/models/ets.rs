//! Additive exponential smoothing with automatic configuration.
//!
//! Candidate family: additive errors, trend none/additive/damped and season
//! none/additive. Smoothing parameters are chosen from a fixed grid by
//! one-step SSE; the component combination is chosen by AICc.

use std::collections::VecDeque;
use std::fmt;

use crate::models::grid;

use super::{Forecaster, ModelError};

const ALPHAS: [f64; 5] = [0.1, 0.3, 0.5, 0.7, 0.9];
const BETAS: [f64; 4] = [0.01, 0.05, 0.1, 0.2];
const GAMMAS: [f64; 4] = [0.01, 0.05, 0.1, 0.3];
const PHIS: [f64; 2] = [0.9, 0.98];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendKind {
    None,
    Additive,
    Damped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtsParams {
    pub trend: TrendKind,
    pub seasonal: bool,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub phi: f64,
}

impl fmt::Display for EtsParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trend = match self.trend {
            TrendKind::None => "N",
            TrendKind::Additive => "A",
            TrendKind::Damped => "Ad",
        };
        let season = if self.seasonal { "A" } else { "N" };
        write!(f, "ETS(A,{trend},{season})")
    }
}

impl EtsParams {
    fn n_params(&self) -> usize {
        let smoothing = 1
            + usize::from(self.trend != TrendKind::None)
            + usize::from(self.seasonal)
            + usize::from(self.trend == TrendKind::Damped);
        let initial = 1 + usize::from(self.trend != TrendKind::None);
        smoothing + initial
    }
}

#[derive(Debug, Clone)]
struct EtsState {
    params: EtsParams,
    level: f64,
    trend: f64,
    /// Seasonal indices, oldest first; the front is the one due next.
    season: VecDeque<f64>,
}

impl EtsState {
    fn init(y: &[f64], params: EtsParams, m: usize) -> Option<Self> {
        if params.seasonal {
            if y.len() < 2 * m {
                return None;
            }
            let first: f64 = y[..m].iter().sum::<f64>() / m as f64;
            let second: f64 = y[m..2 * m].iter().sum::<f64>() / m as f64;
            let trend = match params.trend {
                TrendKind::None => 0.0,
                _ => (second - first) / m as f64,
            };
            let season = y[..m].iter().map(|v| v - first).collect();
            Some(Self {
                params,
                level: first,
                trend,
                season,
            })
        } else {
            let k = (y.len() - 1).min(10);
            if k == 0 {
                return None;
            }
            let trend = match params.trend {
                TrendKind::None => 0.0,
                _ => (y[k] - y[0]) / k as f64,
            };
            Some(Self {
                params,
                level: y[0],
                trend,
                season: VecDeque::new(),
            })
        }
    }

    /// Index of the first observation the recursion runs over.
    fn start(&self) -> usize {
        if self.params.seasonal { self.season.len() } else { 1 }
    }

    fn damped_trend(&self) -> f64 {
        match self.params.trend {
            TrendKind::None => 0.0,
            TrendKind::Additive => self.trend,
            TrendKind::Damped => self.params.phi * self.trend,
        }
    }

    fn forecast(&self) -> f64 {
        self.level + self.damped_trend() + self.season.front().copied().unwrap_or(0.0)
    }

    fn step(&mut self, y: f64) -> f64 {
        let p = self.params;
        let s = self.season.front().copied().unwrap_or(0.0);
        let tr = self.damped_trend();
        let e = y - (self.level + tr + s);
        self.level = self.level + tr + p.alpha * e;
        if p.trend != TrendKind::None {
            self.trend = tr + p.beta * e;
        }
        if p.seasonal {
            self.season.pop_front();
            self.season.push_back(s + p.gamma * e);
        }
        e
    }
}

/// Run the filter over `y`; returns the final state and the one-step SSE.
fn filter(y: &[f64], params: EtsParams, m: usize) -> Option<(EtsState, f64)> {
    let mut state = EtsState::init(y, params, m)?;
    let mut sse = 0.0;
    for &v in &y[state.start()..] {
        let e = state.step(v);
        sse += e * e;
        if !sse.is_finite() {
            return None;
        }
    }
    Some((state, sse))
}

fn candidate_grid(m: usize, n: usize) -> Vec<EtsParams> {
    let seasonal_options: &[bool] = if m > 1 && n >= 2 * m + 4 { &[false, true] } else { &[false] };
    let mut out = Vec::new();
    for &seasonal in seasonal_options {
        for trend in [TrendKind::None, TrendKind::Additive, TrendKind::Damped] {
            for &alpha in &ALPHAS {
                let betas: &[f64] = if trend == TrendKind::None { &[0.0] } else { &BETAS };
                let gammas: &[f64] = if seasonal { &GAMMAS } else { &[0.0] };
                let phis: &[f64] = if trend == TrendKind::Damped { &PHIS } else { &[1.0] };
                for &beta in betas.iter().filter(|b| **b <= alpha) {
                    for &gamma in gammas.iter().filter(|g| **g <= 1.0 - alpha) {
                        for &phi in phis {
                            out.push(EtsParams {
                                trend,
                                seasonal,
                                alpha,
                                beta,
                                gamma,
                                phi,
                            });
                        }
                    }
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct AutoEts {
    season: usize,
    state: Option<EtsState>,
}

impl AutoEts {
    pub fn new(season: usize) -> Self {
        Self {
            season: season.max(1),
            state: None,
        }
    }

    /// Selected configuration of the last fit.
    pub fn params(&self) -> Option<EtsParams> {
        self.state.as_ref().map(|s| s.params)
    }
}

impl Forecaster for AutoEts {
    fn name(&self) -> &'static str {
        "AutoETS"
    }

    fn fit(&mut self, history: &[f64]) -> Result<(), ModelError> {
        if history.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::Fit("AutoETS: non-finite history".into()));
        }
        if history.len() < 4 {
            return Err(ModelError::Fit(format!(
                "AutoETS: need at least 4 observations, got {}",
                history.len()
            )));
        }
        let m = self.season;
        let candidates = candidate_grid(m, history.len());

        let best = grid::search(&candidates, |params| {
            let (state, sse) = filter(history, *params, m)?;
            let n = (history.len() - state.start()) as f64;
            let k = (params.n_params() + if params.seasonal { m - 1 } else { 0 }) as f64;
            let sigma2 = (sse / n).max(1e-300);
            let aicc = n * sigma2.ln() + 2.0 * k + 2.0 * k * (k + 1.0) / (n - k - 1.0).max(1.0);
            Some((state, aicc))
        })
        .ok_or_else(|| ModelError::Fit("AutoETS: no admissible configuration".into()))?;

        self.state = Some(best.value);
        Ok(())
    }

    fn predict_next(&self) -> Result<f64, ModelError> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| ModelError::Forecast("AutoETS: model is not fitted".into()))?;
        let y = state.forecast();
        if !y.is_finite() {
            return Err(ModelError::Forecast("AutoETS: non-finite forecast".into()));
        }
        Ok(y)
    }

    fn update(&mut self, actual: f64) -> Result<(), ModelError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| ModelError::Forecast("AutoETS: model is not fitted".into()))?;
        state.step(actual);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_is_picked_up_on_a_line() {
        let y: Vec<f64> = (0..60).map(|t| 10.0 + 0.5 * t as f64).collect();
        let mut m = AutoEts::new(1);
        m.fit(&y).unwrap();
        assert_ne!(m.params().unwrap().trend, TrendKind::None);
        let pred = m.predict_next().unwrap();
        assert!((pred - 40.0).abs() < 0.5, "pred = {pred}");
    }

    #[test]
    fn seasonal_pattern_is_reproduced() {
        let pattern = [1.0, 3.0, 2.0, 5.0];
        let y: Vec<f64> = (0..48).map(|t| 10.0 + pattern[t % 4]).collect();
        let mut m = AutoEts::new(4);
        m.fit(&y).unwrap();
        assert!(m.params().unwrap().seasonal);
        let pred = m.predict_next().unwrap();
        assert!((pred - 11.0).abs() < 0.2, "pred = {pred}");
        m.update(11.0).unwrap();
        assert!((m.predict_next().unwrap() - 13.0).abs() < 0.2);
    }

    #[test]
    fn display_names_components() {
        let p = EtsParams {
            trend: TrendKind::Damped,
            seasonal: true,
            alpha: 0.3,
            beta: 0.1,
            gamma: 0.1,
            phi: 0.9,
        };
        assert_eq!(p.to_string(), "ETS(A,Ad,A)");
    }
}
