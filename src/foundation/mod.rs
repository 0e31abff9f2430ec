//! Pretrained foundation checkpoints.
//!
//! A checkpoint is a directory holding `config.json` and `model.safetensors`.
//! Only the `mlp` architecture is understood: a stack of dense ReLU layers
//! over a mean-scaled context window followed by a linear head.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, ErrorKind};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Catalog parameters of a foundation entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundationConfig {
    /// Checkpoint directory name under the checkpoint root, or an absolute path.
    pub model_name: String,
    pub context_length: usize,
    /// Entities per inference call.
    pub batch_size: usize,
}

impl FoundationConfig {
    pub fn new(model_name: String) -> Self {
        Self {
            model_name,
            context_length: 64,
            batch_size: 256,
        }
    }

    pub fn checkpoint_dir(&self, root: &Path) -> PathBuf {
        let name = Path::new(&self.model_name);
        if name.is_absolute() {
            name.to_path_buf()
        } else {
            root.join(name)
        }
    }
}

/// `config.json` of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub architecture: String,
    pub context_length: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
}

fn fit_err(msg: impl Into<String>) -> AppError {
    AppError::new(ErrorKind::ModelFitFailure, msg)
}

/// A loaded checkpoint ready for inference.
#[derive(Debug)]
pub struct FoundationModel {
    config: CheckpointConfig,
    layers: Vec<(Tensor, Tensor)>,
    head: (Tensor, Tensor),
    device: Device,
}

impl FoundationModel {
    /// Load the checkpoint in `dir` onto `device`.
    pub fn load(dir: &Path, device: &Device) -> Result<Self, AppError> {
        let config_path = dir.join(CONFIG_FILE);
        let text = std::fs::read_to_string(&config_path)
            .map_err(|e| fit_err(format!("Failed to read {}: {e}", config_path.display())))?;
        let config: CheckpointConfig = serde_json::from_str(&text)
            .map_err(|e| fit_err(format!("Invalid checkpoint config {}: {e}", config_path.display())))?;
        if config.architecture != "mlp" {
            return Err(fit_err(format!(
                "Unsupported checkpoint architecture '{}'",
                config.architecture
            )));
        }
        if config.context_length == 0 {
            return Err(fit_err("Checkpoint context_length must be positive"));
        }

        let weights_path = dir.join(WEIGHTS_FILE);
        let mut tensors = candle_core::safetensors::load(&weights_path, device)
            .map_err(|e| fit_err(format!("Failed to load {}: {e}", weights_path.display())))?;

        let mut take = |name: String, shape: &[usize]| -> Result<Tensor, AppError> {
            let t = tensors
                .remove(&name)
                .ok_or_else(|| fit_err(format!("Checkpoint is missing tensor {name}")))?;
            if t.dims() != shape {
                return Err(fit_err(format!(
                    "Tensor {name} has shape {:?}, expected {shape:?}",
                    t.dims()
                )));
            }
            t.to_dtype(DType::F32)
                .map_err(|e| fit_err(format!("Tensor {name}: {e}")))
        };

        let mut layers = Vec::with_capacity(config.num_layers);
        let mut width = config.context_length;
        for i in 0..config.num_layers {
            let w = take(format!("layers.{i}.weight"), &[width, config.hidden_size])?;
            let b = take(format!("layers.{i}.bias"), &[config.hidden_size])?;
            layers.push((w, b));
            width = config.hidden_size;
        }
        let head = (
            take("head.weight".to_string(), &[width, 1])?,
            take("head.bias".to_string(), &[1])?,
        );

        debug!(
            target: "foundation",
            dir = %dir.display(),
            context = config.context_length,
            layers = config.num_layers,
            "checkpoint loaded"
        );
        Ok(Self {
            config,
            layers,
            head,
            device: device.clone(),
        })
    }

    pub fn context_length(&self) -> usize {
        self.config.context_length
    }

    /// One-step predictions for a batch of histories.
    pub fn predict(&self, histories: &[&[f64]]) -> Result<Vec<f64>, String> {
        if histories.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = self.config.context_length;
        let mut flat = Vec::with_capacity(histories.len() * ctx);
        let mut scales = Vec::with_capacity(histories.len());
        for history in histories {
            let window = context_window(history, ctx).ok_or("empty history")?;
            let scale = mean_abs_scale(&window);
            flat.extend(window.iter().map(|v| (v / scale) as f32));
            scales.push(scale);
        }

        let out = self.forward(flat, histories.len()).map_err(|e| e.to_string())?;
        Ok(out
            .into_iter()
            .zip(scales)
            .map(|(y, s)| f64::from(y) * s)
            .collect())
    }

    fn forward(&self, flat: Vec<f32>, batch: usize) -> candle_core::Result<Vec<f32>> {
        let mut h = Tensor::from_vec(flat, (batch, self.config.context_length), &self.device)?;
        for (w, b) in &self.layers {
            h = h.matmul(w)?.broadcast_add(b)?.relu()?;
        }
        let (w, b) = &self.head;
        h.matmul(w)?.broadcast_add(b)?.flatten_all()?.to_vec1::<f32>()
    }
}

/// Last `len` values of `history`, left-padded with its first value.
pub fn context_window(history: &[f64], len: usize) -> Option<Vec<f64>> {
    let first = *history.first()?;
    let tail = &history[history.len().saturating_sub(len)..];
    let mut out = vec![first; len - tail.len()];
    out.extend_from_slice(tail);
    Some(out)
}

/// Instance scale: mean absolute value, or 1 for an all-zero window.
fn mean_abs_scale(window: &[f64]) -> f64 {
    let s = window.iter().map(|v| v.abs()).sum::<f64>() / window.len().max(1) as f64;
    if s > 0.0 && s.is_finite() { s } else { 1.0 }
}

/// Write an `mlp` checkpoint.
pub fn save_checkpoint(
    dir: &Path,
    config: &CheckpointConfig,
    tensors: &HashMap<String, Tensor>,
) -> Result<(), AppError> {
    let io = |e: &dyn std::fmt::Display| AppError::new(ErrorKind::Io, format!("Failed to write checkpoint {}: {e}", dir.display()));
    std::fs::create_dir_all(dir).map_err(|e| io(&e))?;
    let json = serde_json::to_string_pretty(config).map_err(|e| io(&e))?;
    std::fs::write(dir.join(CONFIG_FILE), json).map_err(|e| io(&e))?;
    candle_core::safetensors::save(tensors, dir.join(WEIGHTS_FILE)).map_err(|e| io(&e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Head weights that copy the last context value: a naive forecaster.
    fn naive_checkpoint(dir: &Path, ctx: usize) {
        let mut head = vec![0f32; ctx];
        head[ctx - 1] = 1.0;
        let mut tensors = HashMap::new();
        tensors.insert(
            "head.weight".to_string(),
            Tensor::from_vec(head, (ctx, 1), &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "head.bias".to_string(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
        );
        let config = CheckpointConfig {
            architecture: "mlp".into(),
            context_length: ctx,
            hidden_size: 4,
            num_layers: 0,
        };
        save_checkpoint(dir, &config, &tensors).unwrap();
    }

    #[test]
    fn naive_checkpoint_repeats_last_value() {
        let dir = tempdir().unwrap();
        naive_checkpoint(dir.path(), 8);
        let model = FoundationModel::load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(model.context_length(), 8);

        let a = [1.0, 2.0, 3.0];
        let b: Vec<f64> = (0..20).map(|t| 100.0 - t as f64).collect();
        let out = model.predict(&[&a[..], b.as_slice()]).unwrap();
        assert!((out[0] - 3.0).abs() < 1e-4);
        assert!((out[1] - 81.0).abs() < 1e-3);
    }

    #[test]
    fn hidden_layers_are_applied() {
        let dir = tempdir().unwrap();
        let ctx = 2;
        let mut tensors = HashMap::new();
        // Identity hidden layer, head sums both inputs.
        tensors.insert(
            "layers.0.weight".to_string(),
            Tensor::from_vec(vec![1f32, 0., 0., 1.], (2, 2), &Device::Cpu).unwrap(),
        );
        tensors.insert("layers.0.bias".to_string(), Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());
        tensors.insert(
            "head.weight".to_string(),
            Tensor::from_vec(vec![1f32, 1.], (2, 1), &Device::Cpu).unwrap(),
        );
        tensors.insert("head.bias".to_string(), Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        let config = CheckpointConfig {
            architecture: "mlp".into(),
            context_length: ctx,
            hidden_size: 2,
            num_layers: 1,
        };
        save_checkpoint(dir.path(), &config, &tensors).unwrap();

        let model = FoundationModel::load(dir.path(), &Device::Cpu).unwrap();
        let out = model.predict(&[&[2.0, 4.0][..]]).unwrap();
        assert!((out[0] - 6.0).abs() < 1e-4);
    }

    #[test]
    fn broken_checkpoints_fail_to_load() {
        let dir = tempdir().unwrap();
        let err = FoundationModel::load(dir.path(), &Device::Cpu).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelFitFailure);

        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"architecture":"lstm","context_length":4,"hidden_size":2,"num_layers":1}"#,
        )
        .unwrap();
        let err = FoundationModel::load(dir.path(), &Device::Cpu).unwrap_err();
        assert!(err.message().contains("lstm"));
    }

    #[test]
    fn context_is_left_padded() {
        assert_eq!(context_window(&[5.0, 6.0], 4).unwrap(), vec![5.0, 5.0, 5.0, 6.0]);
        assert_eq!(context_window(&[1.0, 2.0, 3.0], 2).unwrap(), vec![2.0, 3.0]);
        assert!(context_window(&[], 3).is_none());
    }

    #[test]
    fn relative_model_names_resolve_under_root() {
        let cfg = FoundationConfig::new("tiny".into());
        assert_eq!(cfg.checkpoint_dir(Path::new("/ckpt")), PathBuf::from("/ckpt/tiny"));
        let cfg = FoundationConfig::new("/abs/model".into());
        assert_eq!(cfg.checkpoint_dir(Path::new("/ckpt")), PathBuf::from("/abs/model"));
    }
}
