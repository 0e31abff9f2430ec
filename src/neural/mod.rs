//! Neural-auto forecasters: search, refit and one-step inference.
//!
//! - typed search space (`config`)
//! - per-window scalers (`scaler`)
//! - training windows and tensor batches (`windows`)
//! - network architectures (`nets`)
//! - Adam optimizer (`optim`)
//! - training loop with early stopping (`train`)
//! - Parzen-estimator hyperparameter search (`hpo`)

use std::path::PathBuf;

use candle_core::Device;
use tracing::{info, warn};

pub mod config;
pub mod hpo;
pub mod nets;
pub mod optim;
pub mod scaler;
pub mod train;
pub mod windows;

pub use config::{NeuralArch, NeuralConfig, ScalerKind, TrialParams};

use crate::error::{AppError, ErrorKind};
use hpo::{SearchOutcome, SearchRequest};
use nets::Model;
use train::TrainSettings;
use windows::WindowSet;

pub const BEST_WEIGHTS_FILE: &str = "best.safetensors";
pub const BEST_PARAMS_FILE: &str = "best_params.json";

/// Everything needed to fit one neural catalog entry on a panel.
pub struct FitRequest<'a> {
    pub config: &'a NeuralConfig,
    pub seasonality: usize,
    /// Test horizon; the default validation size.
    pub horizon: usize,
    /// Fully observed training histories, one per entity.
    pub series: Vec<Vec<f64>>,
    pub device: Device,
    pub parallel_jobs: usize,
    pub seed: u64,
    pub log_dir: Option<PathBuf>,
}

/// A refitted network with the configuration that won the search.
pub struct FittedNeural {
    pub arch: NeuralArch,
    pub params: TrialParams,
    pub model: Model,
    pub device: Device,
    pub search: SearchOutcome,
}

impl FittedNeural {
    /// One-step forecasts for a batch of histories.
    pub fn predict(&self, histories: &[&[f64]]) -> Result<Vec<f64>, String> {
        train::predict(&self.model, histories, self.params.scaler, &self.device)
    }
}

/// Search the configuration space, then refit the best configuration on the
/// full training windows for the step count at which it peaked.
pub fn fit_auto(req: FitRequest<'_>) -> Result<FittedNeural, AppError> {
    let cfg = req.config;
    cfg.validate()
        .map_err(|e| AppError::new(ErrorKind::Config, format!("{}: {e}", cfg.arch)))?;

    let val_size = cfg.val_size.unwrap_or(req.horizon);
    let search_req = SearchRequest {
        config: cfg,
        seasonality: req.seasonality,
        val_size,
        series: req.series.clone(),
        device: req.device.clone(),
        parallel_jobs: req.parallel_jobs,
        seed: req.seed,
        log_dir: req.log_dir.clone(),
    };
    let search = hpo::search(&search_req)?;
    let best = search.best_trial().clone();
    info!(
        target: "hpo",
        arch = %cfg.arch,
        trials = search.trials.len(),
        failed = search.failed(),
        best_trial = best.index,
        val_loss = best.val_loss.unwrap_or(f64::NAN),
        best_step = best.best_step,
        "search finished"
    );

    let refit_steps = best.best_step.max(cfg.val_check_steps.min(best.params.max_steps)).max(1);
    let set = WindowSet::new(req.series, 0);
    let settings = TrainSettings {
        max_steps: refit_steps,
        val_check_steps: refit_steps,
        patience: 1,
    };
    let outcome = train::train(cfg.arch, &best.params, &set, settings, &req.device, req.seed)
        .map_err(|e| AppError::new(ErrorKind::ModelFitFailure, format!("Refit of {} failed: {e}", cfg.arch)))?;

    if let Some(dir) = &req.log_dir {
        save_best(dir, &outcome.model, &best.params);
    }

    Ok(FittedNeural {
        arch: cfg.arch,
        params: best.params,
        model: outcome.model,
        device: req.device,
        search,
    })
}

fn save_best(dir: &std::path::Path, model: &Model, params: &TrialParams) {
    let result = std::fs::create_dir_all(dir)
        .map_err(|e| e.to_string())
        .and_then(|_| model.store.snapshot().map_err(|e| e.to_string()))
        .and_then(|snap| candle_core::safetensors::save(&snap, dir.join(BEST_WEIGHTS_FILE)).map_err(|e| e.to_string()))
        .and_then(|_| serde_json::to_string_pretty(params).map_err(|e| e.to_string()))
        .and_then(|json| std::fs::write(dir.join(BEST_PARAMS_FILE), json).map_err(|e| e.to_string()));
    if let Err(e) = result {
        warn!(target: "hpo", dir = %dir.display(), error = %e, "failed to save best weights");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fit_auto_refits_and_saves_the_winner() {
        let dir = tempdir().unwrap();
        let mut cfg = NeuralConfig::new(NeuralArch::NLinear);
        cfg.max_steps_choices = vec![30];
        cfg.batch_size_choices = vec![16];
        cfg.num_samples = 2;
        cfg.val_check_steps = 10;
        let series: Vec<Vec<f64>> = (0..2)
            .map(|e| (0..50).map(|t| (t as f64 * 0.4 + e as f64).cos() + 3.0).collect())
            .collect();
        let fitted = fit_auto(FitRequest {
            config: &cfg,
            seasonality: 4,
            horizon: 5,
            series: series.clone(),
            device: Device::Cpu,
            parallel_jobs: 1,
            seed: 9,
            log_dir: Some(dir.path().to_path_buf()),
        })
        .unwrap();
        assert_eq!(fitted.search.trials.len(), 2);
        assert!(dir.path().join(BEST_WEIGHTS_FILE).is_file());
        assert!(dir.path().join(BEST_PARAMS_FILE).is_file());

        let histories: Vec<&[f64]> = series.iter().map(Vec::as_slice).collect();
        let preds = fitted.predict(&histories).unwrap();
        assert_eq!(preds.len(), 2);
        assert!(preds.iter().all(|p| p.is_finite()));
    }
}
