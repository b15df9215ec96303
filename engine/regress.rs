//! # Confounder Residualization
//!
//! Ordinary least squares of a response on an intercept plus a confounder
//! matrix, keeping only the unexplained remainder. The design `[1 | C]` is
//! checked for rank deficiency before it is factored: collinear confounders are
//! reported as an error instead of being resolved by a pseudo-inverse, which
//! would silently produce residuals against an arbitrary subspace.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::{QR, SVD};
use thiserror::Error;

/// Largest condition number of the column-normalized design that is still
/// treated as full rank.
pub const DEFAULT_MAX_CONDITION_NUMBER: f64 = 1e10;

/// Errors raised while fitting a response on a confounder matrix.
#[derive(Error, Debug)]
pub enum RegressionError {
    #[error(
        "Regression on {confounders} confounders needs at least {required} samples, but only {found} were supplied."
    )]
    InsufficientSamples {
        found: usize,
        required: usize,
        confounders: usize,
    },

    #[error(
        "Non-finite values (NaN or Infinity) were found in the {0}. Incomplete rows must be removed before regression."
    )]
    NonFiniteInput(&'static str),

    #[error(
        "The confounder matrix is rank-deficient (condition number {condition_number:.3e}). Remove duplicate, constant or collinear confounders."
    )]
    CollinearConfounders { condition_number: f64 },

    #[error("The response has {response} rows but the confounder matrix has {confounders} rows.")]
    DimensionMismatch { response: usize, confounders: usize },

    #[error("A decomposition of the design matrix failed: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

impl RegressionError {
    /// Stable identifier used in result tables.
    pub fn code(&self) -> &'static str {
        match self {
            RegressionError::InsufficientSamples { .. } => "InsufficientSamples",
            RegressionError::NonFiniteInput(_) => "NonFiniteInput",
            RegressionError::CollinearConfounders { .. } => "CollinearConfounders",
            RegressionError::DimensionMismatch { .. } => "DimensionMismatch",
            RegressionError::LinalgError(_) => "LinalgFailure",
        }
    }
}

/// An orthonormal basis for the column space of `[1 | C]`.
///
/// Factoring once lets any number of responses be residualized against the
/// same confounders, which is how both genes of a pair are adjusted.
#[derive(Debug, Clone)]
pub struct ConfounderProjection {
    /// `None` when there are no confounders: residualization reduces to centering.
    basis: Option<Array2<f64>>,
    n_samples: usize,
    n_confounders: usize,
    condition_number: f64,
}

impl ConfounderProjection {
    /// Validates and factors the confounder matrix `c` (n × k).
    pub fn new(
        c: ArrayView2<f64>,
        max_condition_number: f64,
    ) -> Result<Self, RegressionError> {
        let (n, k) = c.dim();
        if n < k + 2 {
            return Err(RegressionError::InsufficientSamples {
                found: n,
                required: k + 2,
                confounders: k,
            });
        }
        if c.iter().any(|v| !v.is_finite()) {
            return Err(RegressionError::NonFiniteInput("confounder matrix"));
        }

        if k == 0 {
            return Ok(Self {
                basis: None,
                n_samples: n,
                n_confounders: 0,
                condition_number: 1.0,
            });
        }

        let design = normalized_design(c);
        let condition_number = singular_value_ratio(&design)?;
        if !(condition_number <= max_condition_number) {
            log::debug!(
                "Rejecting {k} confounders over {n} samples: condition number {condition_number:.3e} exceeds {max_condition_number:.3e}"
            );
            return Err(RegressionError::CollinearConfounders { condition_number });
        }

        // Only the leading k + 1 columns span the design, whatever shape of Q
        // the backend hands back.
        let q = design.qr()?.0;
        let basis = q.slice(s![.., ..k + 1]).to_owned();

        Ok(Self {
            basis: Some(basis),
            n_samples: n,
            n_confounders: k,
            condition_number,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_confounders(&self) -> usize {
        self.n_confounders
    }

    pub fn condition_number(&self) -> f64 {
        self.condition_number
    }

    /// Returns `y - ŷ`, where `ŷ` is the least-squares fit of `y` on the design.
    pub fn residuals(&self, y: ArrayView1<f64>) -> Result<Array1<f64>, RegressionError> {
        if y.len() != self.n_samples {
            return Err(RegressionError::DimensionMismatch {
                response: y.len(),
                confounders: self.n_samples,
            });
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(RegressionError::NonFiniteInput("response vector"));
        }

        match &self.basis {
            None => {
                let mean = y.mean().unwrap_or(0.0);
                Ok(y.mapv(|v| v - mean))
            }
            Some(q) => {
                let coefficients = q.t().dot(&y);
                let fitted = q.dot(&coefficients);
                Ok(&y - &fitted)
            }
        }
    }
}

/// Residuals of `y` after an OLS fit on an intercept plus the columns of `c`.
pub fn residualize(
    y: ArrayView1<f64>,
    c: ArrayView2<f64>,
) -> Result<Array1<f64>, RegressionError> {
    if y.len() != c.nrows() {
        return Err(RegressionError::DimensionMismatch {
            response: y.len(),
            confounders: c.nrows(),
        });
    }
    ConfounderProjection::new(c, DEFAULT_MAX_CONDITION_NUMBER)?.residuals(y)
}

/// Condition number of the column-normalized design `[1 | c]`.
///
/// Infinite when a column is identically zero or the design is singular.
pub fn design_condition_number(c: ArrayView2<f64>) -> Result<f64, RegressionError> {
    if c.iter().any(|v| !v.is_finite()) {
        return Err(RegressionError::NonFiniteInput("confounder matrix"));
    }
    if c.ncols() == 0 {
        return Ok(1.0);
    }
    singular_value_ratio(&normalized_design(c))
}

/// Builds `[1 | c]` with every column scaled to unit Euclidean norm, so the
/// condition number reflects collinearity rather than differences in scale.
fn normalized_design(c: ArrayView2<f64>) -> Array2<f64> {
    let (n, k) = c.dim();
    let mut design = Array2::<f64>::ones((n, k + 1));
    design.slice_mut(s![.., 1..]).assign(&c);

    for mut column in design.axis_iter_mut(Axis(1)) {
        let norm = column.dot(&column).sqrt();
        if norm > 0.0 {
            column.mapv_inplace(|v| v / norm);
        }
    }
    design
}

fn singular_value_ratio(design: &Array2<f64>) -> Result<f64, RegressionError> {
    let singular_values = design.svd(false, false)?.1;
    let max_sv = singular_values.iter().fold(0.0_f64, |max, &v| max.max(v));
    let min_sv = singular_values
        .iter()
        .fold(f64::INFINITY, |min, &v| min.min(v));

    if !(min_sv > 0.0) || !max_sv.is_finite() {
        return Ok(f64::INFINITY);
    }
    Ok(max_sv / min_sv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};

    fn confounders(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |(i, j)| {
            let t = i as f64;
            if j == 0 { (t * 0.37).sin() } else { (t * 0.11).cos() + 0.05 * t }
        })
    }

    #[test]
    fn residuals_are_orthogonal_to_every_confounder() {
        let n = 40;
        let c = confounders(n);
        let y = Array::from_shape_fn(n, |i| 2.0 * c[[i, 0]] - c[[i, 1]] + (i as f64 * 1.7).sin());

        let residuals = residualize(y.view(), c.view()).unwrap();

        assert_abs_diff_eq!(residuals.sum(), 0.0, epsilon = 1e-9);
        for column in c.columns() {
            assert_abs_diff_eq!(residuals.dot(&column), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn exact_linear_response_leaves_no_residual() {
        let n = 25;
        let c = confounders(n);
        let y = Array::from_shape_fn(n, |i| 3.0 + 0.5 * c[[i, 0]] + 4.0 * c[[i, 1]]);
        let residuals = residualize(y.view(), c.view()).unwrap();
        assert!(residuals.iter().all(|r| r.abs() < 1e-9));
    }

    #[test]
    fn empty_confounder_set_centers_the_response() {
        let y = array![1.0, 2.0, 3.0, 4.0, 10.0];
        let c = Array2::<f64>::zeros((5, 0));
        let residuals = residualize(y.view(), c.view()).unwrap();
        assert_eq!(residuals, array![-3.0, -2.0, -1.0, 0.0, 6.0]);
    }

    #[test]
    fn duplicate_confounders_are_rejected() {
        let n = 20;
        let base = confounders(n);
        let mut c = Array2::zeros((n, 3));
        c.slice_mut(s![.., 0..2]).assign(&base);
        c.column_mut(2).assign(&base.column(0));

        let y = Array::linspace(0.0, 1.0, n);
        match residualize(y.view(), c.view()) {
            Err(RegressionError::CollinearConfounders { condition_number }) => {
                assert!(condition_number > DEFAULT_MAX_CONDITION_NUMBER);
            }
            other => panic!("expected CollinearConfounders, got {other:?}"),
        }
    }

    #[test]
    fn constant_confounder_is_collinear_with_the_intercept() {
        let n = 15;
        let mut c = Array2::from_elem((n, 2), 5.0);
        c.column_mut(1).assign(&Array::linspace(-1.0, 1.0, n));
        let y = Array::linspace(0.0, 3.0, n);

        let err = residualize(y.view(), c.view()).unwrap_err();
        assert_eq!(err.code(), "CollinearConfounders");
    }

    #[test]
    fn too_few_samples_for_the_confounder_count() {
        let c = Array2::from_shape_vec((3, 2), vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let y = array![1.0, 2.0, 3.0];
        match residualize(y.view(), c.view()) {
            Err(RegressionError::InsufficientSamples {
                found,
                required,
                confounders,
            }) => {
                assert_eq!((found, required, confounders), (3, 4, 2));
            }
            other => panic!("expected InsufficientSamples, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_values_are_not_zero_filled() {
        let n = 12;
        let mut c = confounders(n);
        c[[4, 1]] = f64::NAN;
        let y = Array::linspace(0.0, 1.0, n);
        assert!(matches!(
            residualize(y.view(), c.view()),
            Err(RegressionError::NonFiniteInput(_))
        ));

        let c = confounders(n);
        let mut y = Array::linspace(0.0, 1.0, n);
        y[3] = f64::INFINITY;
        assert!(matches!(
            residualize(y.view(), c.view()),
            Err(RegressionError::NonFiniteInput(_))
        ));
    }

    #[test]
    fn projection_is_reusable_across_responses() {
        let n = 30;
        let c = confounders(n);
        let projection = ConfounderProjection::new(c.view(), DEFAULT_MAX_CONDITION_NUMBER).unwrap();
        assert_eq!(projection.n_confounders(), 2);
        assert!(projection.condition_number() >= 1.0);

        let a = Array::from_shape_fn(n, |i| (i as f64).sqrt());
        let b = Array::from_shape_fn(n, |i| (i as f64 * 0.3).cos());
        let ra = projection.residuals(a.view()).unwrap();
        let rb = projection.residuals(b.view()).unwrap();
        let expected_a = residualize(a.view(), c.view()).unwrap();
        let expected_b = residualize(b.view(), c.view()).unwrap();
        for i in 0..n {
            assert_abs_diff_eq!(ra[i], expected_a[i], epsilon = 1e-12);
            assert_abs_diff_eq!(rb[i], expected_b[i], epsilon = 1e-12);
        }

        let short = array![1.0, 2.0];
        assert!(matches!(
            projection.residuals(short.view()),
            Err(RegressionError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn condition_number_of_well_and_ill_posed_designs() {
        let c = confounders(50);
        let good = design_condition_number(c.view()).unwrap();
        assert!(good.is_finite() && good < 1e3, "got {good}");

        let zero = Array2::<f64>::zeros((10, 1));
        assert!(design_condition_number(zero.view()).unwrap().is_infinite());
    }
}
