//! Descriptive statistics over `f64` slices.

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(x: &[f64]) -> Option<f64> {
    if x.is_empty() {
        return None;
    }
    Some(x.iter().sum::<f64>() / x.len() as f64)
}

/// Sample standard deviation (`n - 1` denominator); `None` below two points.
pub fn std_dev(x: &[f64]) -> Option<f64> {
    if x.len() < 2 {
        return None;
    }
    let m = mean(x)?;
    let ss: f64 = x.iter().map(|v| (v - m) * (v - m)).sum();
    Some((ss / (x.len() as f64 - 1.0)).sqrt())
}

/// Median; `None` for an empty slice.
pub fn median(x: &[f64]) -> Option<f64> {
    if x.is_empty() {
        return None;
    }
    let mut sorted = x.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    } else {
        Some(sorted[mid])
    }
}

/// Median absolute deviation around the median.
pub fn mad(x: &[f64]) -> Option<f64> {
    let med = median(x)?;
    let dev: Vec<f64> = x.iter().map(|v| (v - med).abs()).collect();
    median(&dev)
}

/// Lag-`lag` differences `x[t] - x[t - lag]`.
pub fn diff(x: &[f64], lag: usize) -> Vec<f64> {
    if lag == 0 || x.len() <= lag {
        return Vec::new();
    }
    (lag..x.len()).map(|t| x[t] - x[t - lag]).collect()
}

/// Sample autocorrelation at `lag`.
pub fn acf(x: &[f64], lag: usize) -> Option<f64> {
    if lag == 0 || x.len() <= lag {
        return None;
    }
    let m = mean(x)?;
    let denom: f64 = x.iter().map(|v| (v - m) * (v - m)).sum();
    if denom <= 0.0 {
        return None;
    }
    let num: f64 = (lag..x.len()).map(|t| (x[t] - m) * (x[t - lag] - m)).sum();
    Some(num / denom)
}

/// Abramowitz–Stegun approximation of the error function.
pub fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

pub fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_and_scale() {
        let x = [1.0, 2.0, 3.0, 4.0, 100.0];
        assert_eq!(mean(&x), Some(22.0));
        assert_eq!(median(&x), Some(3.0));
        assert_eq!(mad(&x), Some(1.0));
        assert!((std_dev(&[1.0, 3.0]).unwrap() - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), Some(2.5));
        assert!(mean(&[]).is_none());
    }

    #[test]
    fn acf_of_alternating_series_is_negative() {
        let x: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!(acf(&x, 1).unwrap() < -0.9);
        assert!(acf(&x, 2).unwrap() > 0.9);
        assert_eq!(diff(&[1.0, 4.0, 9.0], 1), vec![3.0, 5.0]);
    }

    #[test]
    fn normal_cdf_is_symmetric() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((normal_cdf(-1.0) + normal_cdf(1.0) - 1.0).abs() < 1e-7);
    }
}
