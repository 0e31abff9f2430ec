//! Hyperparameter search with a tree-structured Parzen estimator.
//!
//! Every axis of the search space is mapped onto `[0, 1)`. The first trials
//! are drawn uniformly; afterwards observations are split into the best
//! `GAMMA` fraction and the rest, a Parzen estimator is fitted to each group
//! per axis and the candidate maximising `l(x) / g(x)` is proposed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::Device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::train::{self, StepLog, TrainSettings};
use super::windows::WindowSet;
use super::{NeuralConfig, TrialParams};
use crate::error::{AppError, ErrorKind};
use crate::math::{normal_pdf, std_dev};

const GAMMA: f64 = 0.25;
const N_CANDIDATES: usize = 24;
const N_STARTUP: usize = 3;
const DIMS: usize = 8;
/// Mixture weight of the uniform prior in each Parzen estimator.
const PRIOR_WEIGHT: f64 = 1.0;

/// Maps unit-cube points to concrete trial parameters.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    cfg: NeuralConfig,
    input_sizes: Vec<usize>,
}

fn pick<T: Copy>(choices: &[T], u: f64) -> T {
    let idx = ((u * choices.len() as f64) as usize).min(choices.len() - 1);
    choices[idx]
}

fn int_between(lo: usize, hi: usize, u: f64) -> usize {
    (lo + (u * (hi - lo + 1) as f64) as usize).min(hi)
}

impl SearchSpace {
    pub fn new(cfg: &NeuralConfig, seasonality: usize) -> Self {
        Self {
            input_sizes: cfg.input_sizes(seasonality),
            cfg: cfg.clone(),
        }
    }

    pub fn decode(&self, u: &[f64]) -> TrialParams {
        let (lr_lo, lr_hi) = self.cfg.lr_range;
        let (d_lo, d_hi) = self.cfg.dropout_range;
        TrialParams {
            input_size: pick(&self.input_sizes, u[0]),
            learning_rate: (lr_lo.ln() + u[1] * (lr_hi.ln() - lr_lo.ln())).exp(),
            max_steps: pick(&self.cfg.max_steps_choices, u[2]),
            batch_size: pick(&self.cfg.batch_size_choices, u[3]),
            scaler: pick(&self.cfg.scaler_choices, u[4]),
            depth: int_between(self.cfg.depth_range.0, self.cfg.depth_range.1, u[5]),
            width: int_between(self.cfg.width_range.0, self.cfg.width_range.1, u[6]),
            dropout: d_lo + u[7] * (d_hi - d_lo),
        }
    }
}

/// Sequential proposal state.
pub struct Tpe {
    rng: StdRng,
    observed: Vec<(Vec<f64>, f64)>,
}

impl Tpe {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            observed: Vec::new(),
        }
    }

    pub fn observe(&mut self, point: Vec<f64>, loss: f64) {
        if loss.is_finite() {
            self.observed.push((point, loss));
        }
    }

    pub fn propose(&mut self) -> Vec<f64> {
        if self.observed.len() < N_STARTUP.max(2) {
            return (0..DIMS).map(|_| self.rng.gen_range(0.0..1.0)).collect();
        }
        let mut sorted = self.observed.clone();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
        let n_good = ((GAMMA * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len() - 1);
        let (good, bad) = sorted.split_at(n_good);

        let good_axes: Vec<Parzen> = (0..DIMS).map(|d| Parzen::fit(good, d)).collect();
        let bad_axes: Vec<Parzen> = (0..DIMS).map(|d| Parzen::fit(bad, d)).collect();

        let mut best: Option<(f64, Vec<f64>)> = None;
        for _ in 0..N_CANDIDATES {
            let x: Vec<f64> = good_axes.iter().map(|p| p.sample(&mut self.rng)).collect();
            let score: f64 = (0..DIMS)
                .map(|d| good_axes[d].density(x[d]).ln() - bad_axes[d].density(x[d]).ln())
                .sum();
            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, x));
            }
        }
        best.map(|(_, x)| x)
            .unwrap_or_else(|| (0..DIMS).map(|_| self.rng.gen_range(0.0..1.0)).collect())
    }
}

/// One-dimensional Gaussian kernel mixture with a uniform prior on `[0, 1)`.
struct Parzen {
    centers: Vec<f64>,
    bandwidth: f64,
}

impl Parzen {
    fn fit(points: &[(Vec<f64>, f64)], dim: usize) -> Self {
        let centers: Vec<f64> = points.iter().map(|(p, _)| p[dim]).collect();
        let n = centers.len().max(1) as f64;
        let sd = std_dev(&centers).unwrap_or(0.25);
        let bandwidth = (1.06 * sd * n.powf(-0.2)).clamp(0.05, 0.5);
        Self { centers, bandwidth }
    }

    fn density(&self, x: f64) -> f64 {
        let kernels: f64 = self
            .centers
            .iter()
            .map(|c| normal_pdf((x - c) / self.bandwidth) / self.bandwidth)
            .sum();
        (kernels + PRIOR_WEIGHT) / (self.centers.len() as f64 + PRIOR_WEIGHT)
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        if self.centers.is_empty() {
            return rng.gen_range(0.0..1.0);
        }
        let c = self.centers[rng.gen_range(0..self.centers.len())];
        let noise = Normal::new(0.0, self.bandwidth)
            .map(|n| n.sample(rng))
            .unwrap_or(0.0);
        (c + noise).clamp(0.0, 1.0 - 1e-9)
    }
}

/// Inputs of a search run.
pub struct SearchRequest<'a> {
    pub config: &'a NeuralConfig,
    pub seasonality: usize,
    /// Validation points per entity before the one-fifth cap.
    pub val_size: usize,
    pub series: Vec<Vec<f64>>,
    pub device: Device,
    pub parallel_jobs: usize,
    pub seed: u64,
    /// Per-trial logs go to `<log_dir>/trial_<n>/` when set.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialRecord {
    pub index: usize,
    pub params: TrialParams,
    pub val_loss: Option<f64>,
    pub best_step: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub trials: Vec<TrialRecord>,
    /// Index into `trials` of the lowest validation loss.
    pub best: usize,
}

impl SearchOutcome {
    pub fn best_trial(&self) -> &TrialRecord {
        &self.trials[self.best]
    }

    pub fn failed(&self) -> usize {
        self.trials.iter().filter(|t| t.error.is_some()).count()
    }
}

fn trial_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(index as u64 + 1)
}

/// Run `num_samples` trials (fewer if the time budget runs out).
pub fn search(req: &SearchRequest<'_>) -> Result<SearchOutcome, AppError> {
    let cfg = req.config;
    let space = SearchSpace::new(cfg, req.seasonality);
    let set = WindowSet::new(req.series.clone(), req.val_size);
    let settings = |max_steps: usize| TrainSettings {
        max_steps,
        val_check_steps: cfg.val_check_steps,
        patience: cfg.early_stop_patience,
    };

    let jobs = req.parallel_jobs.clamp(1, cfg.num_samples.max(1));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .map_err(|e| AppError::new(ErrorKind::HpoTrialFailure, format!("Failed to start trial pool: {e}")))?;

    let started = Instant::now();
    let mut tpe = Tpe::new(req.seed);
    let mut trials: Vec<TrialRecord> = Vec::with_capacity(cfg.num_samples);

    while trials.len() < cfg.num_samples {
        if let Some(budget) = cfg.budget_seconds {
            if !trials.is_empty() && started.elapsed().as_secs_f64() >= budget {
                info!(target: "hpo", completed = trials.len(), budget, "time budget exhausted");
                break;
            }
        }

        let batch_len = jobs.min(cfg.num_samples - trials.len());
        let proposals: Vec<(usize, Vec<f64>)> = (0..batch_len)
            .map(|k| (trials.len() + k, tpe.propose()))
            .collect();

        let results: Vec<(usize, Vec<f64>, TrialParams, Result<(f64, usize, Vec<StepLog>), String>)> =
            pool.install(|| {
                proposals
                    .into_par_iter()
                    .map(|(index, point)| {
                        let params = space.decode(&point);
                        let outcome = train::train(
                            cfg.arch,
                            &params,
                            &set,
                            settings(params.max_steps),
                            &req.device,
                            trial_seed(req.seed, index),
                        )
                        .map(|o| (o.best_loss, o.best_step, o.log));
                        (index, point, params, outcome)
                    })
                    .collect()
            });

        for (index, point, params, outcome) in results {
            let record = match outcome {
                Ok((loss, best_step, log)) => {
                    tpe.observe(point, loss);
                    debug!(target: "hpo", trial = index, loss, best_step, "trial finished");
                    if let Some(dir) = &req.log_dir {
                        write_trial_log(dir, index, &params, &log);
                    }
                    TrialRecord {
                        index,
                        params,
                        val_loss: Some(loss),
                        best_step,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(target: "hpo", trial = index, error = %e, "trial failed; skipping");
                    tpe.observe(point, f64::INFINITY);
                    TrialRecord {
                        index,
                        params,
                        val_loss: None,
                        best_step: 0,
                        error: Some(e),
                    }
                }
            };
            trials.push(record);
        }
    }

    let best = trials
        .iter()
        .enumerate()
        .filter_map(|(i, t)| t.val_loss.map(|l| (i, l)))
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(i, _)| i)
        .ok_or_else(|| {
            AppError::new(
                ErrorKind::HpoTrialFailure,
                format!("All {} trials failed for {}", trials.len(), cfg.arch),
            )
        })?;

    Ok(SearchOutcome { trials, best })
}

fn write_trial_log(dir: &Path, index: usize, params: &TrialParams, log: &[StepLog]) {
    let trial_dir = dir.join(format!("trial_{index}"));
    let result = fs::create_dir_all(&trial_dir)
        .map_err(|e| e.to_string())
        .and_then(|_| {
            let json = serde_json::to_string_pretty(params).map_err(|e| e.to_string())?;
            fs::write(trial_dir.join("params.json"), json).map_err(|e| e.to_string())
        })
        .and_then(|_| {
            let mut w = csv::Writer::from_path(trial_dir.join("metrics.csv")).map_err(|e| e.to_string())?;
            for row in log {
                w.serialize(row).map_err(|e| e.to_string())?;
            }
            w.flush().map_err(|e| e.to_string())
        });
    if let Err(e) = result {
        warn!(target: "hpo", dir = %trial_dir.display(), error = %e, "failed to write trial log");
    }
}
