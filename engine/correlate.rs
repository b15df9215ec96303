//! # Partial Correlation
//!
//! Both variables are residualized against the same confounder set and the
//! residuals are correlated. The Pearson p-value uses a Student-t reference with
//! `n - k - 2` degrees of freedom, `k` being the number of confounder columns.
//! A Spearman rank correlation of the residuals is reported alongside the
//! Pearson estimate, tested with the usual `n - 2` rank approximation.

use crate::regress::{ConfounderProjection, DEFAULT_MAX_CONDITION_NUMBER, RegressionError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use thiserror::Error;

/// Residual variance below this fraction of the original variance is treated
/// as fully explained by the confounders.
const ZERO_VARIANCE_TOLERANCE: f64 = 1e-10;

/// Minimum sample floor applied after incomplete rows are dropped.
pub const DEFAULT_MIN_SAMPLES: usize = 10;

#[derive(Error, Debug)]
pub enum CorrelationError {
    #[error(
        "Only {found} complete samples remain after removing missing values; at least {required} are required."
    )]
    InsufficientData { found: usize, required: usize },

    #[error(
        "The confounders explain all of the variance of {variable}; its residuals are constant and no correlation can be computed."
    )]
    ZeroResidualVariance { variable: &'static str },

    #[error("Input lengths differ: x has {x}, y has {y}, the confounder matrix has {confounders} rows.")]
    LengthMismatch {
        x: usize,
        y: usize,
        confounders: usize,
    },

    #[error(transparent)]
    Regression(#[from] RegressionError),
}

impl CorrelationError {
    /// Stable identifier used in result tables.
    pub fn code(&self) -> &'static str {
        match self {
            CorrelationError::InsufficientData { .. } => "InsufficientData",
            CorrelationError::ZeroResidualVariance { .. } => "ZeroResidualVariance",
            CorrelationError::LengthMismatch { .. } => "LengthMismatch",
            CorrelationError::Regression(inner) => inner.code(),
        }
    }
}

/// Settings shared by every correlation computed in a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationOptions {
    pub min_samples: usize,
    pub max_condition_number: f64,
    /// Also compute the Spearman companion statistic.
    pub spearman: bool,
}

impl Default for CorrelationOptions {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            max_condition_number: DEFAULT_MAX_CONDITION_NUMBER,
            spearman: true,
        }
    }
}

/// A correlation coefficient with its two-sided p-value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEstimate {
    pub r: f64,
    pub p_value: f64,
    pub degrees_of_freedom: usize,
}

/// Output of [`partial_correlation`].
#[derive(Debug, Clone, PartialEq)]
pub struct PartialCorrelation {
    pub pearson: CorrelationEstimate,
    pub spearman: Option<CorrelationEstimate>,
    /// Samples left after incomplete rows were removed.
    pub n_samples: usize,
    pub n_confounders: usize,
}

/// Rows of `(x, y, C)` in which every value is finite.
#[derive(Debug, Clone)]
pub struct CompleteCases {
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub confounders: Array2<f64>,
}

impl CompleteCases {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Drops every row with a non-finite value in `x`, `y`, or any confounder.
pub fn complete_cases(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    c: ArrayView2<f64>,
) -> Result<CompleteCases, CorrelationError> {
    check_lengths(x, y, c)?;
    let keep: Vec<usize> = (0..x.len())
        .filter(|&i| {
            x[i].is_finite() && y[i].is_finite() && c.row(i).iter().all(|v| v.is_finite())
        })
        .collect();

    Ok(CompleteCases {
        x: x.select(Axis(0), &keep),
        y: y.select(Axis(0), &keep),
        confounders: c.select(Axis(0), &keep),
    })
}

/// Partial correlation of `x` and `y` given the confounder columns of `c`.
///
/// Incomplete rows are removed first; the remaining sample count must reach
/// `options.min_samples`. With zero confounder columns this is the ordinary
/// (simple) correlation with `n - 2` degrees of freedom.
pub fn partial_correlation(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    c: ArrayView2<f64>,
    options: &CorrelationOptions,
) -> Result<PartialCorrelation, CorrelationError> {
    let cases = complete_cases(x, y, c)?;
    let n = cases.len();
    if n < options.min_samples {
        return Err(CorrelationError::InsufficientData {
            found: n,
            required: options.min_samples,
        });
    }

    let k = c.ncols();
    let (rx, ry) = residual_pair(
        cases.x.view(),
        cases.y.view(),
        cases.confounders.view(),
        options.max_condition_number,
    )?;

    let degrees_of_freedom = n.checked_sub(k + 2).filter(|&df| df > 0).ok_or(
        RegressionError::InsufficientSamples {
            found: n,
            required: k + 3,
            confounders: k,
        },
    )?;

    let r = pearson(rx.view(), ry.view())
        .ok_or(CorrelationError::ZeroResidualVariance { variable: "x" })?;
    let pearson_estimate = CorrelationEstimate {
        r,
        p_value: correlation_p_value(r, degrees_of_freedom),
        degrees_of_freedom,
    };

    let spearman_estimate = if options.spearman {
        spearman(rx.view(), ry.view()).map(|rho| CorrelationEstimate {
            r: rho,
            p_value: correlation_p_value(rho, n - 2),
            degrees_of_freedom: n - 2,
        })
    } else {
        None
    };

    Ok(PartialCorrelation {
        pearson: pearson_estimate,
        spearman: spearman_estimate,
        n_samples: n,
        n_confounders: k,
    })
}

/// Unadjusted correlation of `x` and `y`.
pub fn simple_correlation(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    options: &CorrelationOptions,
) -> Result<PartialCorrelation, CorrelationError> {
    let none = Array2::<f64>::zeros((x.len(), 0));
    partial_correlation(x, y, none.view(), options)
}

/// Pearson correlation of the residuals only, for data already known to be
/// complete. This is the statistic each bootstrap trial recomputes.
pub fn partial_pearson_r(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    c: ArrayView2<f64>,
    max_condition_number: f64,
) -> Result<f64, CorrelationError> {
    check_lengths(x, y, c)?;
    let (rx, ry) = residual_pair(x, y, c, max_condition_number)?;
    pearson(rx.view(), ry.view()).ok_or(CorrelationError::ZeroResidualVariance { variable: "x" })
}

fn residual_pair(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    c: ArrayView2<f64>,
    max_condition_number: f64,
) -> Result<(Array1<f64>, Array1<f64>), CorrelationError> {
    let projection = ConfounderProjection::new(c, max_condition_number)?;
    let rx = projection.residuals(x)?;
    ensure_residual_variance(x, rx.view(), "x")?;
    let ry = projection.residuals(y)?;
    ensure_residual_variance(y, ry.view(), "y")?;
    Ok((rx, ry))
}

fn ensure_residual_variance(
    original: ArrayView1<f64>,
    residuals: ArrayView1<f64>,
    variable: &'static str,
) -> Result<(), CorrelationError> {
    let mean = original.mean().unwrap_or(0.0);
    let total: f64 = original.iter().map(|v| (v - mean).powi(2)).sum();
    let remaining: f64 = residuals.iter().map(|v| v * v).sum();

    if !(total > 0.0) || remaining <= ZERO_VARIANCE_TOLERANCE * total {
        return Err(CorrelationError::ZeroResidualVariance { variable });
    }
    Ok(())
}

fn check_lengths(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    c: ArrayView2<f64>,
) -> Result<(), CorrelationError> {
    if x.len() != y.len() || x.len() != c.nrows() {
        return Err(CorrelationError::LengthMismatch {
            x: x.len(),
            y: y.len(),
            confounders: c.nrows(),
        });
    }
    Ok(())
}

/// Sample Pearson correlation. `None` when either input has zero variance or
/// fewer than two values.
pub fn pearson(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<f64> {
    let n = x.len();
    if n < 2 || n != y.len() {
        return None;
    }
    let mean_x = x.mean()?;
    let mean_y = y.mean()?;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (&a, &b) in x.iter().zip(y.iter()) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }

    if !(sxx > 0.0 && syy > 0.0) {
        return None;
    }
    Some((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

/// Spearman rank correlation with average ranks for ties.
pub fn spearman(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<f64> {
    if x.len() != y.len() {
        return None;
    }
    let rx = average_ranks(x);
    let ry = average_ranks(y);
    pearson(rx.view(), ry.view())
}

/// 1-based ranks; tied values share the mean of the ranks they span.
pub fn average_ranks(values: ArrayView1<f64>) -> Array1<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = Array1::zeros(n);
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Positions start..end hold ranks start + 1 ..= end.
        let shared = (start + end + 1) as f64 / 2.0;
        for &index in &order[start..end] {
            ranks[index] = shared;
        }
        start = end;
    }
    ranks
}

/// Two-sided p-value for a correlation coefficient under the null of zero
/// correlation, using `t = r * sqrt(df / (1 - r^2))`.
pub fn correlation_p_value(r: f64, degrees_of_freedom: usize) -> f64 {
    if degrees_of_freedom == 0 || !r.is_finite() {
        return f64::NAN;
    }
    if r.abs() >= 1.0 {
        return 0.0;
    }

    let df = degrees_of_freedom as f64;
    let t = r * (df / (1.0 - r * r)).sqrt();
    match StudentsT::new(0.0, 1.0, df) {
        Ok(distribution) => (2.0 * distribution.sf(t.abs())).min(1.0),
        Err(e) => {
            log::warn!("Student-t reference with {df} degrees of freedom is invalid: {e}");
            f64::NAN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};

    #[test]
    fn perfectly_correlated_vectors_without_confounders() {
        let x = Array::from_iter((1..=10).map(f64::from));
        let y = x.mapv(|v| 2.0 * v);
        let result = simple_correlation(x.view(), y.view(), &CorrelationOptions::default()).unwrap();

        assert_abs_diff_eq!(result.pearson.r, 1.0, epsilon = 1e-12);
        assert!(result.pearson.p_value < 1e-12);
        assert_eq!(result.pearson.degrees_of_freedom, 8);
        assert_eq!(result.n_samples, 10);
        assert_eq!(result.n_confounders, 0);
    }

    #[test]
    fn confounder_identical_to_x_removes_all_its_variance() {
        let x = Array::from_iter((1..=10).map(f64::from));
        let y = x.mapv(|v| 2.0 * v);
        let c = x.clone().insert_axis(Axis(1));

        let err = partial_correlation(x.view(), y.view(), c.view(), &CorrelationOptions::default())
            .unwrap_err();
        assert!(
            matches!(err, CorrelationError::ZeroResidualVariance { variable: "x" }),
            "got {err:?}"
        );
        assert_eq!(err.code(), "ZeroResidualVariance");
    }

    #[test]
    fn empty_confounder_set_matches_plain_pearson() {
        let x = array![0.3, 1.9, 2.2, 3.8, 4.1, 5.7, 6.0, 7.4, 8.8, 9.1, 10.5, 11.0];
        let y = array![1.1, 0.4, 2.9, 2.5, 5.0, 4.4, 7.3, 6.1, 8.0, 9.9, 9.2, 12.4];
        let none = Array2::<f64>::zeros((x.len(), 0));

        let partial =
            partial_correlation(x.view(), y.view(), none.view(), &CorrelationOptions::default())
                .unwrap();
        let plain = pearson(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(partial.pearson.r, plain, epsilon = 1e-12);
    }

    #[test]
    fn degrees_of_freedom_subtract_the_confounders() {
        let n = 30;
        let c = Array2::from_shape_fn((n, 3), |(i, j)| ((i * (j + 2)) as f64 * 0.31).sin());
        let x = Array::from_shape_fn(n, |i| (i as f64 * 0.7).cos() + c[[i, 0]]);
        let y = Array::from_shape_fn(n, |i| (i as f64 * 0.45).sin() + 0.2 * x[i]);

        let result =
            partial_correlation(x.view(), y.view(), c.view(), &CorrelationOptions::default())
                .unwrap();
        assert_eq!(result.pearson.degrees_of_freedom, n - 3 - 2);

        let expected = correlation_p_value(result.pearson.r, n - 5);
        assert_abs_diff_eq!(result.pearson.p_value, expected, epsilon = 1e-15);
        assert!(result.pearson.p_value != correlation_p_value(result.pearson.r, n - 2));

        let rank = result.spearman.unwrap();
        assert_eq!(rank.degrees_of_freedom, n - 2);
        assert_abs_diff_eq!(rank.p_value, correlation_p_value(rank.r, n - 2), epsilon = 1e-15);
    }

    #[test]
    fn incomplete_rows_are_dropped_before_the_sample_floor() {
        let mut x = Array::from_iter((0..12).map(|i| i as f64));
        let y = Array::from_iter((0..12).map(|i| (i as f64 * 1.3).sin()));
        x[2] = f64::NAN;
        x[7] = f64::NAN;
        x[9] = f64::NAN;

        let err = simple_correlation(x.view(), y.view(), &CorrelationOptions::default()).unwrap_err();
        match err {
            CorrelationError::InsufficientData { found, required } => {
                assert_eq!((found, required), (9, 10));
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }

        let relaxed = CorrelationOptions {
            min_samples: 5,
            ..CorrelationOptions::default()
        };
        let result = simple_correlation(x.view(), y.view(), &relaxed).unwrap();
        assert_eq!(result.n_samples, 9);
    }

    #[test]
    fn average_ranks_share_ties() {
        let ranks = average_ranks(array![10.0, 20.0, 10.0, 30.0, 20.0, 20.0].view());
        assert_eq!(ranks, array![1.5, 4.0, 1.5, 6.0, 4.0, 4.0]);
    }

    #[test]
    fn spearman_is_one_for_monotone_relationships() {
        let x = Array::from_iter((1..=15).map(f64::from));
        let y = x.mapv(|v| v.powi(3));
        assert_abs_diff_eq!(spearman(x.view(), y.view()).unwrap(), 1.0, epsilon = 1e-12);
        assert!(pearson(x.view(), y.view()).unwrap() < 1.0);
    }

    #[test]
    fn p_value_reference_points() {
        assert_eq!(correlation_p_value(1.0, 8), 0.0);
        assert_abs_diff_eq!(correlation_p_value(0.0, 8), 1.0, epsilon = 1e-12);
        assert!(correlation_p_value(0.5, 0).is_nan());

        // r = 0.6 with 10 df gives t = 2.3717, two-sided p = 0.0392.
        assert_abs_diff_eq!(correlation_p_value(0.6, 10), 0.0392, epsilon = 2e-4);
    }

    #[test]
    fn constant_input_has_no_correlation() {
        let x = Array1::from_elem(12, 3.0);
        let y = Array::from_iter((0..12).map(|i| i as f64));
        assert!(pearson(x.view(), y.view()).is_none());
        assert!(matches!(
            simple_correlation(x.view(), y.view(), &CorrelationOptions::default()),
            Err(CorrelationError::ZeroResidualVariance { variable: "x" })
        ));
    }

    #[test]
    fn length_mismatch_is_reported() {
        let x = array![1.0, 2.0, 3.0];
        let y = array![1.0, 2.0];
        assert!(matches!(
            simple_correlation(x.view(), y.view(), &CorrelationOptions::default()),
            Err(CorrelationError::LengthMismatch { .. })
        ));
    }
}
