//! Model catalog: flat TOML mapping from model key to entry.
//!
//! ```toml
//! [auto_arima]
//! family = "classical"
//! constructor_ref = "AutoARIMA"
//! display_name = "Auto ARIMA"
//! table_name = "ARIMA"
//! params = { max_p = 3, max_q = 3 }
//! ```
//!
//! Each entry's `params` are validated against its family's typed config.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::domain::Family;
use crate::error::{AppError, ErrorKind};
use crate::foundation::FoundationConfig;
use crate::models::{ClassicalConfig, ClassicalKind};
use crate::neural::{NeuralArch, NeuralConfig, ScalerKind};

/// Family-specific configuration of a model entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSpec {
    Classical(ClassicalConfig),
    Neural(NeuralConfig),
    Foundation(FoundationConfig),
}

impl ModelSpec {
    pub fn family(&self) -> Family {
        match self {
            ModelSpec::Classical(_) => Family::Classical,
            ModelSpec::Neural(_) => Family::NeuralAuto,
            ModelSpec::Foundation(_) => Family::Foundation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub key: String,
    pub display_name: String,
    pub table_name: String,
    pub constructor_ref: String,
    pub enabled: bool,
    pub spec: ModelSpec,
}

impl ModelDescriptor {
    pub fn family(&self) -> Family {
        self.spec.family()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelEntry {
    family: Family,
    constructor_ref: String,
    #[serde(default)]
    params: toml::Table,
    display_name: Option<String>,
    table_name: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ClassicalParams {
    season_length: Option<usize>,
    window: Option<usize>,
    retrain_each_step: Option<bool>,
    max_p: Option<usize>,
    max_q: Option<usize>,
    max_d: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct NeuralParams {
    input_size_choices: Option<Vec<usize>>,
    lr_range: Option<[f64; 2]>,
    max_steps_choices: Option<Vec<usize>>,
    scaler_choices: Option<Vec<ScalerKind>>,
    depth_range: Option<[usize; 2]>,
    width_range: Option<[usize; 2]>,
    dropout_range: Option<[f64; 2]>,
    batch_size_choices: Option<Vec<usize>>,
    num_samples: Option<usize>,
    budget_seconds: Option<f64>,
    val_size: Option<usize>,
    early_stop_patience: Option<usize>,
    val_check_steps: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FoundationParams {
    model_name: String,
    context_length: Option<usize>,
    batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: BTreeMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorKind::Config,
                format!("Failed to read model catalog {}: {e}", path.display()),
            )
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, AppError> {
        let doc: BTreeMap<String, ModelEntry> = toml::from_str(text)
            .map_err(|e| AppError::new(ErrorKind::Config, format!("Invalid model catalog: {e}")))?;

        let mut entries = BTreeMap::new();
        for (key, entry) in doc {
            let descriptor = build_descriptor(&key, entry)
                .map_err(|msg| AppError::new(ErrorKind::Config, format!("Model {key}: {msg}")))?;
            entries.insert(key, descriptor);
        }
        debug!(target: "registry", models = entries.len(), "model catalog loaded");
        Ok(Self { entries })
    }

    /// Look up a model by key (disabled entries still resolve).
    pub fn resolve(&self, key: &str) -> Result<&ModelDescriptor, AppError> {
        self.entries
            .get(key)
            .ok_or_else(|| AppError::new(ErrorKind::ModelNotRegistered, key.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.entries.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.entries.values().filter(|m| m.enabled)
    }
}

fn build_descriptor(key: &str, entry: ModelEntry) -> Result<ModelDescriptor, String> {
    let params = toml::Value::Table(entry.params);
    let spec = match entry.family {
        Family::Classical => {
            let kind = ClassicalKind::from_ref(&entry.constructor_ref)
                .ok_or_else(|| format!("unknown classical constructor '{}'", entry.constructor_ref))?;
            let p: ClassicalParams = params.try_into().map_err(|e| format!("invalid params: {e}"))?;
            let mut cfg = ClassicalConfig::new(kind);
            cfg.season_length = p.season_length;
            if let Some(w) = p.window {
                cfg.window = w;
            }
            if let Some(r) = p.retrain_each_step {
                cfg.retrain_each_step = r;
            }
            if let Some(v) = p.max_p {
                cfg.max_p = v;
            }
            if let Some(v) = p.max_q {
                cfg.max_q = v;
            }
            if let Some(v) = p.max_d {
                cfg.max_d = v;
            }
            if cfg.window == 0 || cfg.season_length == Some(0) {
                return Err("window and season_length must be positive".into());
            }
            ModelSpec::Classical(cfg)
        }
        Family::NeuralAuto => {
            let arch = NeuralArch::from_ref(&entry.constructor_ref)
                .ok_or_else(|| format!("unknown neural constructor '{}'", entry.constructor_ref))?;
            let p: NeuralParams = params.try_into().map_err(|e| format!("invalid params: {e}"))?;
            let mut cfg = NeuralConfig::new(arch);
            if let Some(v) = p.input_size_choices {
                cfg.input_size_choices = v;
            }
            if let Some([lo, hi]) = p.lr_range {
                cfg.lr_range = (lo, hi);
            }
            if let Some(v) = p.max_steps_choices {
                cfg.max_steps_choices = v;
            }
            if let Some(v) = p.scaler_choices {
                cfg.scaler_choices = v;
            }
            if let Some([lo, hi]) = p.depth_range {
                cfg.depth_range = (lo, hi);
            }
            if let Some([lo, hi]) = p.width_range {
                cfg.width_range = (lo, hi);
            }
            if let Some([lo, hi]) = p.dropout_range {
                cfg.dropout_range = (lo, hi);
            }
            if let Some(v) = p.batch_size_choices {
                cfg.batch_size_choices = v;
            }
            if let Some(v) = p.num_samples {
                cfg.num_samples = v;
            }
            cfg.budget_seconds = p.budget_seconds;
            cfg.val_size = p.val_size;
            if let Some(v) = p.early_stop_patience {
                cfg.early_stop_patience = v;
            }
            if let Some(v) = p.val_check_steps {
                cfg.val_check_steps = v.max(1);
            }
            cfg.validate()?;
            ModelSpec::Neural(cfg)
        }
        Family::Foundation => {
            let p: FoundationParams = params.try_into().map_err(|e| format!("invalid params: {e}"))?;
            let mut cfg = FoundationConfig::new(p.model_name);
            if let Some(v) = p.context_length {
                cfg.context_length = v;
            }
            if let Some(v) = p.batch_size {
                cfg.batch_size = v;
            }
            if cfg.context_length == 0 || cfg.batch_size == 0 {
                return Err("context_length and batch_size must be positive".into());
            }
            ModelSpec::Foundation(cfg)
        }
    };

    let display_name = entry.display_name.unwrap_or_else(|| key.to_string());
    let table_name = entry.table_name.unwrap_or_else(|| display_name.clone());
    Ok(ModelDescriptor {
        key: key.to_string(),
        display_name,
        table_name,
        constructor_ref: entry.constructor_ref,
        enabled: entry.enabled,
        spec,
    })
}
