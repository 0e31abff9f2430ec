//! Typed search-space configuration for the neural-auto family.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Neural constructor refs understood by the model catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeuralArch {
    DeepAr,
    Nbeats,
    Nhits,
    DLinear,
    NLinear,
    Tide,
    VanillaTransformer,
}

impl NeuralArch {
    pub const ALL: [NeuralArch; 7] = [
        NeuralArch::DeepAr,
        NeuralArch::Nbeats,
        NeuralArch::Nhits,
        NeuralArch::DLinear,
        NeuralArch::NLinear,
        NeuralArch::Tide,
        NeuralArch::VanillaTransformer,
    ];

    pub fn from_ref(constructor_ref: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.constructor_ref().eq_ignore_ascii_case(constructor_ref.trim()))
    }

    pub fn constructor_ref(self) -> &'static str {
        match self {
            NeuralArch::DeepAr => "AutoDeepAR",
            NeuralArch::Nbeats => "AutoNBEATS",
            NeuralArch::Nhits => "AutoNHITS",
            NeuralArch::DLinear => "AutoDLinear",
            NeuralArch::NLinear => "AutoNLinear",
            NeuralArch::Tide => "AutoTiDE",
            NeuralArch::VanillaTransformer => "AutoVanillaTransformer",
        }
    }

    /// Probabilistic heads are trained on a likelihood and must not see
    /// min-max scaled targets.
    pub fn is_probabilistic(self) -> bool {
        matches!(self, NeuralArch::DeepAr)
    }

    fn default_max_steps(self) -> Vec<usize> {
        match self {
            NeuralArch::DeepAr | NeuralArch::VanillaTransformer => vec![300, 500],
            NeuralArch::DLinear | NeuralArch::NLinear => vec![200, 400],
            NeuralArch::Nbeats | NeuralArch::Nhits | NeuralArch::Tide => vec![300, 600],
        }
    }

    fn default_depth(self) -> (usize, usize) {
        match self {
            NeuralArch::DLinear | NeuralArch::NLinear => (1, 1),
            NeuralArch::DeepAr | NeuralArch::VanillaTransformer => (1, 2),
            NeuralArch::Nbeats | NeuralArch::Nhits | NeuralArch::Tide => (1, 3),
        }
    }

    fn default_width(self) -> (usize, usize) {
        match self {
            NeuralArch::DLinear | NeuralArch::NLinear => (1, 1),
            NeuralArch::VanillaTransformer => (8, 32),
            NeuralArch::DeepAr => (16, 64),
            NeuralArch::Nbeats | NeuralArch::Nhits | NeuralArch::Tide => (32, 128),
        }
    }
}

impl fmt::Display for NeuralArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.constructor_ref())
    }
}

/// Per-window input normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalerKind {
    Standard,
    Robust,
    #[serde(rename = "minmax")]
    MinMax,
}

/// Search space and budget of one neural catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NeuralConfig {
    pub arch: NeuralArch,
    /// Lookback lengths; empty means "derive from seasonality".
    pub input_size_choices: Vec<usize>,
    pub lr_range: (f64, f64),
    pub max_steps_choices: Vec<usize>,
    pub scaler_choices: Vec<ScalerKind>,
    pub depth_range: (usize, usize),
    pub width_range: (usize, usize),
    pub dropout_range: (f64, f64),
    pub batch_size_choices: Vec<usize>,
    pub num_samples: usize,
    /// Wall-clock budget after which no new trials are proposed.
    pub budget_seconds: Option<f64>,
    /// Validation points per entity; `None` means `min(horizon, n / 5)`.
    pub val_size: Option<usize>,
    /// Validation checks without improvement before a trial stops.
    pub early_stop_patience: usize,
    pub val_check_steps: usize,
}

impl NeuralConfig {
    pub fn new(arch: NeuralArch) -> Self {
        let scaler_choices = if arch.is_probabilistic() {
            vec![ScalerKind::Standard, ScalerKind::Robust]
        } else {
            vec![ScalerKind::Standard, ScalerKind::Robust, ScalerKind::MinMax]
        };
        Self {
            arch,
            input_size_choices: Vec::new(),
            lr_range: (1e-4, 1e-2),
            max_steps_choices: arch.default_max_steps(),
            scaler_choices,
            depth_range: arch.default_depth(),
            width_range: arch.default_width(),
            dropout_range: (0.0, 0.3),
            batch_size_choices: vec![32, 64, 128],
            num_samples: 10,
            budget_seconds: None,
            val_size: None,
            early_stop_patience: 5,
            val_check_steps: 50,
        }
    }

    /// Check internal consistency; returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        let (lo, hi) = self.lr_range;
        if !(lo > 0.0 && hi >= lo && hi.is_finite()) {
            return Err(format!("lr_range must satisfy 0 < lo <= hi (got {lo}, {hi})"));
        }
        if self.max_steps_choices.is_empty() || self.max_steps_choices.contains(&0) {
            return Err("max_steps_choices must be non-empty and positive".into());
        }
        if self.batch_size_choices.is_empty() || self.batch_size_choices.contains(&0) {
            return Err("batch_size_choices must be non-empty and positive".into());
        }
        if self.scaler_choices.is_empty() {
            return Err("scaler_choices must be non-empty".into());
        }
        if self.arch.is_probabilistic() && self.scaler_choices.contains(&ScalerKind::MinMax) {
            return Err(format!("{} does not support the minmax scaler", self.arch));
        }
        if self.depth_range.0 == 0 || self.depth_range.0 > self.depth_range.1 {
            return Err("depth_range must satisfy 1 <= lo <= hi".into());
        }
        if self.width_range.0 == 0 || self.width_range.0 > self.width_range.1 {
            return Err("width_range must satisfy 1 <= lo <= hi".into());
        }
        let (d_lo, d_hi) = self.dropout_range;
        if !(0.0..1.0).contains(&d_lo) || !(0.0..1.0).contains(&d_hi) || d_lo > d_hi {
            return Err("dropout_range must lie in [0, 1)".into());
        }
        if self.num_samples == 0 {
            return Err("num_samples must be positive".into());
        }
        if self.input_size_choices.contains(&0) {
            return Err("input_size_choices must be positive".into());
        }
        Ok(())
    }

    /// Debug runs cap training length and the number of trials.
    pub fn debug_capped(&self) -> Self {
        let mut out = self.clone();
        out.max_steps_choices = out.max_steps_choices.iter().map(|s| (*s).min(20)).collect();
        out.max_steps_choices.dedup();
        out.num_samples = out.num_samples.min(2);
        out.val_check_steps = out.val_check_steps.min(10);
        out
    }

    /// Lookback candidates for a dataset.
    pub fn input_sizes(&self, seasonality: usize) -> Vec<usize> {
        if !self.input_size_choices.is_empty() {
            return self.input_size_choices.clone();
        }
        let m = seasonality.max(1);
        let mut sizes: Vec<usize> = [1, 2, 4].iter().map(|k| (k * m).max(8)).collect();
        sizes.dedup();
        sizes
    }
}

/// One concrete configuration drawn from the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialParams {
    pub input_size: usize,
    pub learning_rate: f64,
    pub max_steps: usize,
    pub batch_size: usize,
    pub scaler: ScalerKind,
    pub depth: usize,
    pub width: usize,
    pub dropout: f64,
}
