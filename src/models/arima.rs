//! ARIMA with automatic order selection.
//!
//! - the differencing order `d` is chosen with repeated KPSS tests
//! - `(p, q)` is chosen by AICc over a full grid, evaluated in parallel
//! - each candidate is estimated with the two-stage Hannan–Rissanen
//!   regression (long AR for innovations, then OLS on lags and innovations)
//!
//! After fitting, new actuals update the lag and innovation buffers without
//! re-estimating coefficients.

use std::collections::VecDeque;

use crate::math::{diff, ols};
use crate::models::grid;

use super::{Forecaster, ModelError};

/// 5% critical value of the KPSS level-stationarity statistic.
const KPSS_CRITICAL_5PCT: f64 = 0.463;

#[derive(Debug, Clone, PartialEq)]
pub struct ArimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
    pub intercept: bool,
}

#[derive(Debug, Clone)]
struct ArimaCoefficients {
    constant: f64,
    phi: Vec<f64>,
    theta: Vec<f64>,
    aicc: f64,
}

#[derive(Debug, Clone)]
struct ArimaState {
    order: ArimaOrder,
    coef: ArimaCoefficients,
    /// Most recent differenced values, newest last.
    w_tail: VecDeque<f64>,
    /// Most recent innovations, newest last.
    e_tail: VecDeque<f64>,
    /// Most recent levels, newest last (length `d`).
    y_tail: VecDeque<f64>,
}

#[derive(Debug, Clone)]
pub struct AutoArima {
    max_p: usize,
    max_d: usize,
    max_q: usize,
    state: Option<ArimaState>,
}

impl AutoArima {
    pub fn new(max_p: usize, max_d: usize, max_q: usize) -> Self {
        Self {
            max_p,
            max_d,
            max_q,
            state: None,
        }
    }

    /// Order chosen by the last fit.
    pub fn order(&self) -> Option<&ArimaOrder> {
        self.state.as_ref().map(|s| &s.order)
    }

    fn predict_w(state: &ArimaState) -> f64 {
        let mut w = state.coef.constant;
        for (i, phi) in state.coef.phi.iter().enumerate() {
            w += phi * state.w_tail[state.w_tail.len() - 1 - i];
        }
        for (j, theta) in state.coef.theta.iter().enumerate() {
            w += theta * state.e_tail[state.e_tail.len() - 1 - j];
        }
        w
    }
}

/// KPSS level-stationarity statistic with a Bartlett long-run variance.
pub fn kpss_statistic(x: &[f64]) -> Option<f64> {
    let n = x.len();
    if n < 4 {
        return None;
    }
    let m = x.iter().sum::<f64>() / n as f64;
    let e: Vec<f64> = x.iter().map(|v| v - m).collect();

    let mut s = 0.0;
    let mut eta = 0.0;
    for v in &e {
        s += v;
        eta += s * s;
    }

    let lags = ((3.0 * (n as f64).sqrt()) / 13.0).ceil() as usize;
    let mut lr_var = e.iter().map(|v| v * v).sum::<f64>() / n as f64;
    for l in 1..=lags.min(n - 1) {
        let w = 1.0 - l as f64 / (lags as f64 + 1.0);
        let gamma: f64 = (l..n).map(|t| e[t] * e[t - l]).sum::<f64>() / n as f64;
        lr_var += 2.0 * w * gamma;
    }
    if lr_var <= 0.0 {
        return None;
    }
    Some(eta / (n as f64 * n as f64 * lr_var))
}

fn choose_d(y: &[f64], max_d: usize) -> usize {
    let mut w = y.to_vec();
    let mut d = 0;
    while d < max_d {
        match kpss_statistic(&w) {
            Some(stat) if stat > KPSS_CRITICAL_5PCT => {
                let next = diff(&w, 1);
                if next.len() < 8 {
                    break;
                }
                w = next;
                d += 1;
            }
            _ => break,
        }
    }
    d
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// Long-AR innovations: residuals of an AR(`m`) fitted by OLS, zero-padded.
fn long_ar_innovations(w: &[f64], m: usize) -> Option<Vec<f64>> {
    if m == 0 {
        return Some(vec![0.0; w.len()]);
    }
    if w.len() <= 2 * m + 2 {
        return None;
    }
    let rows: Vec<Vec<f64>> = (m..w.len())
        .map(|t| {
            let mut r = Vec::with_capacity(m + 1);
            r.push(1.0);
            r.extend((1..=m).map(|i| w[t - i]));
            r
        })
        .collect();
    let fit = ols(&rows, &w[m..])?;
    let mut e = vec![0.0; m];
    e.extend(fit.residuals);
    Some(e)
}

fn estimate(w: &[f64], p: usize, q: usize, intercept: bool, innovations: &[f64]) -> Option<ArimaCoefficients> {
    let start = if q > 0 {
        p.max(innovations_lag_start(innovations) + q)
    } else {
        p
    };
    let n_eff = w.len().checked_sub(start)?;
    let k = p + q + usize::from(intercept);

    if k == 0 {
        let sse: f64 = w.iter().map(|v| v * v).sum();
        let n = w.len() as f64;
        let sigma2 = sse / n;
        if sigma2 <= 0.0 {
            return None;
        }
        return Some(ArimaCoefficients {
            constant: 0.0,
            phi: Vec::new(),
            theta: Vec::new(),
            aicc: n * sigma2.ln() + 2.0 + 4.0 / (n - 2.0).max(1.0),
        });
    }
    if n_eff < k + 3 {
        return None;
    }

    let rows: Vec<Vec<f64>> = (start..w.len())
        .map(|t| {
            let mut r = Vec::with_capacity(k);
            if intercept {
                r.push(1.0);
            }
            r.extend((1..=p).map(|i| w[t - i]));
            r.extend((1..=q).map(|j| innovations[t - j]));
            r
        })
        .collect();
    let fit = ols(&rows, &w[start..])?;

    let (constant, rest) = if intercept {
        (fit.beta[0], &fit.beta[1..])
    } else {
        (0.0, &fit.beta[..])
    };
    let phi = rest[..p].to_vec();
    let theta = rest[p..].to_vec();

    // A unit root at z = ±1 makes the recursion explode.
    if p > 0 && phi.iter().sum::<f64>().abs() >= 1.0 {
        return None;
    }

    let n = n_eff as f64;
    let sigma2 = fit.sse / n;
    if !(sigma2 > 0.0 && sigma2.is_finite()) {
        return None;
    }
    let kk = (k + 1) as f64;
    let aicc = n * sigma2.ln() + 2.0 * kk + 2.0 * kk * (kk + 1.0) / (n - kk - 1.0).max(1.0);
    Some(ArimaCoefficients {
        constant,
        phi,
        theta,
        aicc,
    })
}

/// First index after the zero-padded prefix of the long-AR innovations.
fn innovations_lag_start(innovations: &[f64]) -> usize {
    innovations.iter().position(|e| *e != 0.0).unwrap_or(0)
}

/// Recompute innovations recursively with the final coefficients.
fn filter_innovations(w: &[f64], coef: &ArimaCoefficients) -> Vec<f64> {
    let p = coef.phi.len();
    let q = coef.theta.len();
    let mut e = vec![0.0; w.len()];
    for t in 0..w.len() {
        let mut pred = coef.constant;
        for i in 1..=p.min(t) {
            pred += coef.phi[i - 1] * w[t - i];
        }
        for j in 1..=q.min(t) {
            pred += coef.theta[j - 1] * e[t - j];
        }
        if t >= p {
            e[t] = w[t] - pred;
        }
    }
    e
}

impl Forecaster for AutoArima {
    fn name(&self) -> &'static str {
        "AutoARIMA"
    }

    fn fit(&mut self, history: &[f64]) -> Result<(), ModelError> {
        if history.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::Fit("AutoARIMA: non-finite history".into()));
        }
        if history.len() < 8 {
            return Err(ModelError::Fit(format!(
                "AutoARIMA: need at least 8 observations, got {}",
                history.len()
            )));
        }

        let d = choose_d(history, self.max_d);
        let mut w = history.to_vec();
        for _ in 0..d {
            w = diff(&w, 1);
        }
        let intercept = d <= 1;

        let long_m = (self.max_p.max(self.max_q) + 2).min(w.len() / 4);
        let innovations = if self.max_q > 0 {
            long_ar_innovations(&w, long_m).unwrap_or_else(|| vec![0.0; w.len()])
        } else {
            vec![0.0; w.len()]
        };
        let has_innovations = innovations.iter().any(|e| *e != 0.0);
        let max_q = if has_innovations { self.max_q } else { 0 };

        let orders: Vec<(usize, usize)> = (0..=self.max_p)
            .flat_map(|p| (0..=max_q).map(move |q| (p, q)))
            .collect();

        let best = grid::search(&orders, |&(p, q)| {
            estimate(&w, p, q, intercept, &innovations).map(|c| {
                let score = c.aicc;
                (c, score)
            })
        })
        .ok_or_else(|| ModelError::Fit("AutoARIMA: no admissible (p, q) order".into()))?;

        let (p, q) = orders[best.idx];
        let coef = best.value;
        let e = filter_innovations(&w, &coef);

        let keep_w = p.max(1);
        let keep_e = q.max(1);
        let state = ArimaState {
            order: ArimaOrder { p, d, q, intercept },
            w_tail: w[w.len().saturating_sub(keep_w)..].iter().copied().collect(),
            e_tail: e[e.len().saturating_sub(keep_e)..].iter().copied().collect(),
            y_tail: history[history.len() - d..].iter().copied().collect(),
            coef,
        };
        self.state = Some(state);
        Ok(())
    }

    fn predict_next(&self) -> Result<f64, ModelError> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| ModelError::Forecast("AutoARIMA: model is not fitted".into()))?;
        let w_hat = Self::predict_w(state);

        // Undo differencing: y_{t+1} = w_{t+1} - Σ_{k=1..d} (-1)^k C(d,k) y_{t+1-k}.
        let d = state.order.d;
        let mut y_hat = w_hat;
        for k in 1..=d {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            y_hat -= sign * binomial(d, k) * state.y_tail[d - k];
        }
        if !y_hat.is_finite() {
            return Err(ModelError::Forecast("AutoARIMA: non-finite forecast".into()));
        }
        Ok(y_hat)
    }

    fn update(&mut self, actual: f64) -> Result<(), ModelError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| ModelError::Forecast("AutoARIMA: model is not fitted".into()))?;

        let d = state.order.d;
        let mut w_new = actual;
        for k in 1..=d {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            w_new += sign * binomial(d, k) * state.y_tail[d - k];
        }
        let w_hat = Self::predict_w(state);
        let e_new = w_new - w_hat;

        state.w_tail.push_back(w_new);
        state.w_tail.pop_front();
        state.e_tail.push_back(e_new);
        state.e_tail.pop_front();
        if d > 0 {
            state.y_tail.push_back(actual);
            state.y_tail.pop_front();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn ar1(phi: f64, n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut y = vec![0.0];
        for _ in 1..n {
            let prev = *y.last().unwrap();
            y.push(phi * prev + noise.sample(&mut rng));
        }
        y
    }

    #[test]
    fn kpss_separates_stationary_from_trending() {
        let stationary: Vec<f64> = (0..300).map(|t| (t as f64 * 1.3).sin()).collect();
        let trending: Vec<f64> = (0..300).map(|t| t as f64 * 0.5).collect();
        assert!(kpss_statistic(&stationary).unwrap() < KPSS_CRITICAL_5PCT);
        assert!(kpss_statistic(&trending).unwrap() > KPSS_CRITICAL_5PCT);
    }

    #[test]
    fn fits_ar1_and_forecasts_toward_phi_times_last() {
        let y = ar1(0.7, 400, 11);
        let mut m = AutoArima::new(2, 0, 1);
        m.fit(&y).unwrap();
        let order = m.order().unwrap().clone();
        assert_eq!(order.d, 0);
        assert!(order.p >= 1 || order.q >= 1);

        let last = *y.last().unwrap();
        let pred = m.predict_next().unwrap();
        assert!((pred - 0.7 * last).abs() < 1.0 + 0.2 * last.abs(), "pred = {pred}, last = {last}");
    }

    #[test]
    fn linear_trend_is_differenced_and_extrapolated() {
        let y: Vec<f64> = (0..120).map(|t| 3.0 + 2.0 * t as f64 + if t % 2 == 0 { 0.1 } else { -0.1 }).collect();
        let mut m = AutoArima::new(1, 2, 0);
        m.fit(&y).unwrap();
        assert!(m.order().unwrap().d >= 1);
        let pred = m.predict_next().unwrap();
        assert!((pred - (3.0 + 2.0 * 120.0)).abs() < 1.0, "pred = {pred}");

        m.update(243.1).unwrap();
        let pred = m.predict_next().unwrap();
        assert!((pred - 245.0).abs() < 1.5, "pred = {pred}");
    }

    #[test]
    fn short_history_is_a_fit_failure() {
        let mut m = AutoArima::new(2, 1, 2);
        assert!(matches!(m.fit(&[1.0, 2.0, 3.0]), Err(ModelError::Fit(_))));
        assert!(m.predict_next().is_err());
    }
}
