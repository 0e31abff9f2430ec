//! Run configuration sourced from the environment (and `.env`).

use std::path::{Path, PathBuf};

use crate::error::{AppError, ErrorKind};
use crate::hardware::Accelerator;

pub const DEFAULT_DATASETS_CATALOG: &str = "datasets.toml";
pub const DEFAULT_MODELS_CATALOG: &str = "models.toml";

/// Paths and knobs shared by every job of one process.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Result root; records land under `error_metrics/`.
    pub output_dir: PathBuf,
    /// Panel root.
    pub data_dir: PathBuf,
    pub datasets_catalog: PathBuf,
    pub models_catalog: PathBuf,
    pub foundation_model_dir: PathBuf,
    pub accelerator_override: Option<Accelerator>,
}

impl RunConfig {
    /// Build a config from explicit roots, using defaults for everything else.
    pub fn new(output_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let output_dir = require_absolute("OUTPUT_DIR", output_dir.into())?;
        let data_dir = require_absolute("DATA_DIR", data_dir.into())?;
        let foundation_model_dir = data_dir.join("foundation_models");
        Ok(Self {
            output_dir,
            data_dir,
            datasets_catalog: PathBuf::from(DEFAULT_DATASETS_CATALOG),
            models_catalog: PathBuf::from(DEFAULT_MODELS_CATALOG),
            foundation_model_dir,
            accelerator_override: None,
        })
    }

    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RunConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let output_dir = lookup("OUTPUT_DIR")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::new(ErrorKind::Config, "Missing OUTPUT_DIR in environment (.env)."))?;
        let data_dir = lookup("DATA_DIR")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::new(ErrorKind::Config, "Missing DATA_DIR in environment (.env)."))?;

        let mut config = Self::new(output_dir.trim(), data_dir.trim())?;

        if let Some(path) = lookup("DATASETS_CATALOG").filter(|v| !v.trim().is_empty()) {
            config.datasets_catalog = PathBuf::from(path.trim());
        }
        if let Some(path) = lookup("MODELS_CATALOG").filter(|v| !v.trim().is_empty()) {
            config.models_catalog = PathBuf::from(path.trim());
        }
        if let Some(path) = lookup("FOUNDATION_MODEL_DIR").filter(|v| !v.trim().is_empty()) {
            config.foundation_model_dir = PathBuf::from(path.trim());
        }
        if let Some(raw) = lookup("FORECAST_ACCELERATOR").filter(|v| !v.trim().is_empty()) {
            let acc = Accelerator::from_tag(&raw).ok_or_else(|| {
                AppError::new(
                    ErrorKind::Config,
                    format!("FORECAST_ACCELERATOR must be one of cpu, gpu, mps (got '{raw}')."),
                )
            })?;
            config.accelerator_override = Some(acc);
        }

        Ok(config)
    }

    /// Directory holding result records.
    pub fn metrics_root(&self) -> PathBuf {
        self.output_dir.join("error_metrics")
    }

    /// Directory shared by neural trial logs.
    pub fn trial_log_root(&self) -> PathBuf {
        self.output_dir.join("lightning_logs")
    }
}

fn require_absolute(name: &str, path: PathBuf) -> Result<PathBuf, AppError> {
    if !Path::is_absolute(&path) {
        return Err(AppError::new(
            ErrorKind::Config,
            format!("{name} must be an absolute path (got '{}').", path.display()),
        ));
    }
    Ok(path)
}
