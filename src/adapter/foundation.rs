//! Foundation adapter: zero-shot inference from a pretrained checkpoint.

use tracing::info;

use super::{Adapter, FitContext, rolling_batched};
use crate::cv::{CvPlan, EntityFailure, MAX_CV_WINDOWS_FOUNDATION};
use crate::domain::{Family, Series};
use crate::error::{AppError, ErrorKind};
use crate::foundation::{FoundationConfig, FoundationModel};
use crate::preprocess::{Splits, TrainSeries};

pub struct FoundationAdapter {
    config: FoundationConfig,
    model: Option<FoundationModel>,
}

impl FoundationAdapter {
    pub fn new(config: FoundationConfig) -> Self {
        Self { config, model: None }
    }

    /// Roll every entity, `batch_size` entities per inference call.
    fn roll(&self, train: &[&TrainSeries], test: &[&Series]) -> Vec<Result<Vec<f64>, EntityFailure>> {
        let Some(model) = &self.model else {
            return test
                .iter()
                .map(|t| Err(EntityFailure::forecast(&t.entity_id, "checkpoint not loaded")))
                .collect();
        };
        let batch = self.config.batch_size.max(1);
        train
            .chunks(batch)
            .zip(test.chunks(batch))
            .flat_map(|(tr, te)| rolling_batched(tr, te, |histories| model.predict(histories)))
            .collect()
    }
}

impl Adapter for FoundationAdapter {
    fn family(&self) -> Family {
        Family::Foundation
    }

    fn max_cv_windows(&self) -> usize {
        MAX_CV_WINDOWS_FOUNDATION
    }

    /// Load the checkpoint. Nothing is trained.
    fn fit(&mut self, _splits: &Splits, ctx: &FitContext<'_>) -> Result<(), AppError> {
        let dir = self.config.checkpoint_dir(&ctx.run.foundation_model_dir);
        let model = FoundationModel::load(&dir, &ctx.hardware.device())?;
        if model.context_length() != self.config.context_length {
            return Err(AppError::new(
                ErrorKind::Config,
                format!(
                    "Model '{}' declares context_length {} but checkpoint {} uses {}",
                    ctx.model_key,
                    self.config.context_length,
                    dir.display(),
                    model.context_length()
                ),
            ));
        }
        info!(
            target: "foundation",
            model = ctx.model_key,
            checkpoint = %dir.display(),
            accelerator = %ctx.hardware.accelerator,
            "checkpoint ready"
        );
        self.model = Some(model);
        Ok(())
    }

    fn forecast_one_step_rolling(
        &mut self,
        train: &TrainSeries,
        test: &Series,
        _plan: &CvPlan,
    ) -> Result<Vec<f64>, EntityFailure> {
        self.roll(&[train], &[test])
            .pop()
            .unwrap_or_else(|| Err(EntityFailure::forecast(&test.entity_id, "no prediction produced")))
    }

    fn forecast_panel(&mut self, splits: &Splits, _plan: &CvPlan) -> Vec<Result<Vec<f64>, EntityFailure>> {
        let train: Vec<&TrainSeries> = splits.train.iter().collect();
        let test: Vec<&Series> = splits.test.iter().collect();
        self.roll(&train, &test)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use candle_core::{DType, Device, Tensor};
    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::*;
    use crate::config::RunConfig;
    use crate::domain::{DatasetDescriptor, Frequency, GroupTag};
    use crate::foundation::{CheckpointConfig, save_checkpoint};
    use crate::hardware::probe_with;
    use crate::preprocess::PreprocessReport;

    fn last_value_checkpoint(dir: &Path, ctx: usize) {
        let mut head = vec![0f32; ctx];
        head[ctx - 1] = 1.0;
        let mut tensors = HashMap::new();
        tensors.insert(
            "head.weight".to_string(),
            Tensor::from_vec(head, (ctx, 1), &Device::Cpu).unwrap(),
        );
        tensors.insert("head.bias".to_string(), Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        let config = CheckpointConfig {
            architecture: "mlp".into(),
            context_length: ctx,
            hidden_size: 1,
            num_layers: 0,
        };
        save_checkpoint(dir, &config, &tensors).unwrap();
    }

    fn dataset() -> DatasetDescriptor {
        DatasetDescriptor {
            name: "ftsfr_tiny".into(),
            module: "tiny".into(),
            panel_path: "/unused.parquet".into(),
            frequency: Frequency::M,
            seasonality: 12,
            group: GroupTag::Other,
            description: String::new(),
            table_display_name: "Tiny".into(),
            short_name: "tiny".into(),
            is_balanced: true,
            required_data_sources: Vec::new(),
        }
    }

    fn splits() -> Splits {
        let d = |m| NaiveDate::from_ymd_opt(2020, m, 1).unwrap();
        let mut test = Series::new("a");
        test.push(d(4), Some(4.0));
        test.push(d(5), Some(5.0));
        Splits {
            frequency: Frequency::M,
            seasonality: 12,
            horizon: 2,
            train: vec![TrainSeries {
                entity_id: "a".into(),
                timestamps: vec![d(1), d(2), d(3)],
                values: vec![1.0, 2.0, 3.0],
            }],
            test: vec![test],
            report: PreprocessReport::default(),
        }
    }

    #[test]
    fn context_length_must_match_the_checkpoint() {
        let root = tempdir().unwrap();
        last_value_checkpoint(&root.path().join("tiny-mlp"), 8);
        let mut run = RunConfig::new(root.path(), root.path()).unwrap();
        run.foundation_model_dir = root.path().to_path_buf();
        let hardware = probe_with(2, 0, false, None);
        let ds = dataset();
        let ctx = FitContext {
            dataset: &ds,
            model_key: "tiny",
            hardware: &hardware,
            run: &run,
            debug: false,
            seed: 1,
        };
        let s = splits();

        let mut cfg = FoundationConfig::new("tiny-mlp".into());
        let mut mismatched = FoundationAdapter::new(cfg.clone());
        let err = mismatched.fit(&s, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        cfg.context_length = 8;
        let mut adapter = FoundationAdapter::new(cfg);
        adapter.fit(&s, &ctx).unwrap();
        let plan = CvPlan::new(MAX_CV_WINDOWS_FOUNDATION, 2).unwrap();
        let out = adapter.forecast_panel(&s, &plan);
        let preds = out[0].as_ref().unwrap();
        assert!((preds[0] - 3.0).abs() < 1e-4);
        assert!((preds[1] - 4.0).abs() < 1e-4);
    }
}
