//! Per-window normalisation.

use crate::math::{mad, mean, median, std_dev};

use super::ScalerKind;

const MIN_SCALE: f64 = 1e-8;

/// Affine map `x -> (x - shift) / scale` fitted on one input window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaler {
    pub shift: f64,
    pub scale: f64,
}

impl Scaler {
    pub const IDENTITY: Scaler = Scaler { shift: 0.0, scale: 1.0 };

    pub fn fit(kind: ScalerKind, window: &[f64]) -> Self {
        let (shift, scale) = match kind {
            ScalerKind::Standard => (
                mean(window).unwrap_or(0.0),
                population_std(window).unwrap_or(1.0),
            ),
            ScalerKind::Robust => (median(window).unwrap_or(0.0), mad(window).unwrap_or(1.0)),
            ScalerKind::MinMax => {
                let lo = window.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if lo.is_finite() && hi.is_finite() {
                    (lo, hi - lo)
                } else {
                    (0.0, 1.0)
                }
            }
        };
        let scale = if scale.is_finite() && scale > MIN_SCALE { scale } else { 1.0 };
        Self { shift, scale }
    }

    pub fn apply(&self, x: f64) -> f64 {
        (x - self.shift) / self.scale
    }

    pub fn invert(&self, z: f64) -> f64 {
        z * self.scale + self.shift
    }
}

fn population_std(x: &[f64]) -> Option<f64> {
    let n = x.len();
    let sd = std_dev(x)?;
    Some(sd * (((n - 1) as f64) / n as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalers_invert_cleanly() {
        let w = [2.0, 4.0, 6.0, 8.0, 100.0];
        for kind in [ScalerKind::Standard, ScalerKind::Robust, ScalerKind::MinMax] {
            let s = Scaler::fit(kind, &w);
            for x in w {
                assert!((s.invert(s.apply(x)) - x).abs() < 1e-9);
            }
        }
        let mm = Scaler::fit(ScalerKind::MinMax, &w);
        assert_eq!(mm.apply(2.0), 0.0);
        assert_eq!(mm.apply(100.0), 1.0);
    }

    #[test]
    fn flat_windows_keep_unit_scale() {
        let s = Scaler::fit(ScalerKind::Standard, &[3.0, 3.0, 3.0]);
        assert_eq!(s.scale, 1.0);
        assert_eq!(s.apply(3.0), 0.0);
        let r = Scaler::fit(ScalerKind::Robust, &[1.0]);
        assert_eq!(r.scale, 1.0);
    }
}
