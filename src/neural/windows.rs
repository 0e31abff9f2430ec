//! Training windows and tensor batches.

use candle_core::{Device, Tensor};
use rand::Rng;
use rand::rngs::StdRng;

use super::ScalerKind;
use super::scaler::Scaler;

/// Last `input_size` values of `history`, left-padded with its first value.
///
/// The mask is 1 for observed positions and 0 for padding.
pub fn context(history: &[f64], input_size: usize) -> Option<(Vec<f64>, Vec<f64>)> {
    let first = *history.first()?;
    let tail = &history[history.len().saturating_sub(input_size)..];
    let pad = input_size - tail.len();
    let mut values = vec![first; pad];
    values.extend_from_slice(tail);
    let mut mask = vec![0.0; pad];
    mask.extend(std::iter::repeat_n(1.0, tail.len()));
    Some((values, mask))
}

/// Window positions over a set of entity histories.
///
/// A position `(entity, t)` predicts `series[entity][t]` from everything
/// before it. Positions from `fit_end` onwards are held out for validation.
#[derive(Debug, Clone)]
pub struct WindowSet {
    pub series: Vec<Vec<f64>>,
    pub train: Vec<(usize, usize)>,
    pub validation: Vec<(usize, usize)>,
}

impl WindowSet {
    /// Hold out the last `val_size` points of every entity (capped at a fifth
    /// of its length). `val_size == 0` trains on everything.
    pub fn new(series: Vec<Vec<f64>>, val_size: usize) -> Self {
        let mut train = Vec::new();
        let mut validation = Vec::new();
        for (e, s) in series.iter().enumerate() {
            let n = s.len();
            let hold = val_size.min(n / 5);
            let fit_end = n - hold;
            train.extend((1..fit_end).map(|t| (e, t)));
            validation.extend((fit_end.max(1)..n).map(|t| (e, t)));
        }
        Self {
            series,
            train,
            validation,
        }
    }

    pub fn sample_train(&self, batch_size: usize, rng: &mut StdRng) -> Vec<(usize, usize)> {
        if self.train.is_empty() {
            return Vec::new();
        }
        (0..batch_size)
            .map(|_| self.train[rng.gen_range(0..self.train.len())])
            .collect()
    }

    pub fn history(&self, (e, t): (usize, usize)) -> &[f64] {
        &self.series[e][..t]
    }

    pub fn target(&self, (e, t): (usize, usize)) -> f64 {
        self.series[e][t]
    }
}

/// Scaled tensors for one forward pass.
#[derive(Debug)]
pub struct Batch {
    /// `[batch, input_size]`
    pub x: Tensor,
    /// `[batch, input_size]`, 1 for observed positions.
    pub mask: Tensor,
    /// `[batch]`, present when targets were supplied.
    pub y: Option<Tensor>,
    pub scalers: Vec<Scaler>,
}

impl Batch {
    /// Build a batch from `(history, target)` rows.
    pub fn build(
        rows: &[(&[f64], Option<f64>)],
        input_size: usize,
        scaler: ScalerKind,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let b = rows.len();
        let mut xs = Vec::with_capacity(b * input_size);
        let mut ms = Vec::with_capacity(b * input_size);
        let mut ys = Vec::with_capacity(b);
        let mut scalers = Vec::with_capacity(b);
        for (history, target) in rows {
            let (values, mask) = context(history, input_size)
                .ok_or_else(|| candle_core::Error::Msg("empty history".into()))?;
            let observed: Vec<f64> = values
                .iter()
                .zip(&mask)
                .filter(|(_, m)| **m > 0.0)
                .map(|(v, _)| *v)
                .collect();
            let s = Scaler::fit(scaler, &observed);
            xs.extend(values.iter().map(|v| s.apply(*v) as f32));
            ms.extend(mask.iter().map(|m| *m as f32));
            if let Some(y) = target {
                ys.push(s.apply(*y) as f32);
            }
            scalers.push(s);
        }
        let x = Tensor::from_vec(xs, (b, input_size), device)?;
        let mask = Tensor::from_vec(ms, (b, input_size), device)?;
        let y = if ys.len() == b && b > 0 {
            Some(Tensor::from_vec(ys, b, device)?)
        } else {
            None
        };
        Ok(Self { x, mask, y, scalers })
    }

    pub fn from_positions(
        set: &WindowSet,
        positions: &[(usize, usize)],
        input_size: usize,
        scaler: ScalerKind,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let rows: Vec<(&[f64], Option<f64>)> = positions
            .iter()
            .map(|p| (set.history(*p), Some(set.target(*p))))
            .collect();
        Self::build(&rows, input_size, scaler, device)
    }

    /// Map scaled predictions back to the original units.
    pub fn unscale(&self, scaled: &[f32]) -> Vec<f64> {
        scaled
            .iter()
            .zip(&self.scalers)
            .map(|(z, s)| s.invert(f64::from(*z)))
            .collect()
    }
}
