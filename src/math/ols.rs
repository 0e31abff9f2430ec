//! Ordinary least squares via SVD.
//!
//! The ARIMA estimator and the Theta drift both reduce to small regressions
//! of the form
//!
//! ```text
//! minimize Σ (y_i - x_i^T β)^2
//! ```
//!
//! with a handful of columns and a few hundred rows. SVD handles tall and
//! nearly collinear designs (long AR lags on smooth series) without panicking.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Progressively looser singular-value cutoffs.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Coefficients and residual sum of squares of a regression.
#[derive(Debug, Clone)]
pub struct OlsFit {
    pub beta: Vec<f64>,
    pub sse: f64,
    pub residuals: Vec<f64>,
}

/// Fit `y ~ rows` where each row is one observation's regressors.
pub fn ols(rows: &[Vec<f64>], y: &[f64]) -> Option<OlsFit> {
    let n = rows.len();
    if n == 0 || n != y.len() {
        return None;
    }
    let k = rows[0].len();
    if k == 0 || n < k || rows.iter().any(|r| r.len() != k) {
        return None;
    }

    let x = DMatrix::from_fn(n, k, |i, j| rows[i][j]);
    let yv = DVector::from_column_slice(y);
    let beta = solve_least_squares(&x, &yv)?;

    let fitted = &x * &beta;
    let residuals: Vec<f64> = yv.iter().zip(fitted.iter()).map(|(a, b)| a - b).collect();
    let sse = residuals.iter().map(|r| r * r).sum();
    Some(OlsFit {
        beta: beta.iter().copied().collect(),
        sse,
        residuals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_recovers_line() {
        // y = 2 + 3x on x = [0, 1, 2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn ols_reports_residuals() {
        let rows = vec![vec![1.0, 0.0], vec![1.0, 1.0], vec![1.0, 2.0], vec![1.0, 3.0]];
        let y = [1.0, 2.0, 2.0, 4.0];
        let fit = ols(&rows, &y).unwrap();
        assert_eq!(fit.residuals.len(), 4);
        assert!(fit.residuals.iter().sum::<f64>().abs() < 1e-9);
        assert!(fit.sse > 0.0);

        assert!(ols(&rows[..1], &y[..1]).is_none());
    }
}
