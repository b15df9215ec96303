//! Pre-run checks of covariate sets: how the confounders correlate with each
//! other and whether the design they form is close to singular.

use crate::config::EngineConfig;
use crate::correlate::pearson;
use crate::data::{ConfounderTable, DataError, SampleAlignment, prepare_confounders};
use crate::regress::design_condition_number;
use crate::types::CovariateSet;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// Pairs correlated beyond this magnitude are listed as near-duplicates.
pub const HIGH_CORRELATION: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateDiagnostics {
    pub name: String,
    /// Confounders kept after preparation, in matrix order.
    pub confounders: Vec<String>,
    pub dropped: Vec<(String, String)>,
    /// Aligned samples with every kept confounder observed.
    pub n_complete: usize,
    /// Pearson correlations between kept confounders over complete samples.
    pub correlation: Array2<f64>,
    pub highly_correlated: Vec<(String, String, f64)>,
    /// `None` when too few complete samples remain to judge.
    pub condition_number: Option<f64>,
    pub collinear: bool,
}

pub fn diagnose_covariate_set(
    alignment: &SampleAlignment,
    table: &ConfounderTable,
    set: &CovariateSet,
    config: &EngineConfig,
) -> Result<CovariateDiagnostics, DataError> {
    let raw = alignment.confounder_matrix(table, &set.confounders)?;
    let prepared = prepare_confounders(
        &raw,
        &set.confounders,
        config.drop_degenerate_confounders,
        config.standardize_confounders,
    );

    let complete: Vec<usize> = prepared
        .matrix
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().all(|v| v.is_finite()))
        .map(|(i, _)| i)
        .collect();
    let matrix = prepared.matrix.select(Axis(0), &complete);
    let k = matrix.ncols();

    let correlation = Array2::from_shape_fn((k, k), |(a, b)| {
        if a == b {
            1.0
        } else {
            pearson(matrix.column(a), matrix.column(b)).unwrap_or(f64::NAN)
        }
    });

    let mut highly_correlated = Vec::new();
    for a in 0..k {
        for b in (a + 1)..k {
            let r = correlation[[a, b]];
            if r.abs() >= HIGH_CORRELATION {
                highly_correlated.push((prepared.names[a].clone(), prepared.names[b].clone(), r));
            }
        }
    }

    let condition_number = if complete.len() >= k + 2 {
        match design_condition_number(matrix.view()) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Condition number of covariate set '{}' is unavailable: {e}", set.name);
                None
            }
        }
    } else {
        None
    };
    let collinear = condition_number.is_some_and(|value| !(value <= config.max_condition_number));

    if collinear {
        log::warn!(
            "Covariate set '{}' is collinear (condition number {:.3e}); every unit using it will be skipped",
            set.name,
            condition_number.unwrap_or(f64::INFINITY)
        );
    }

    Ok(CovariateDiagnostics {
        name: set.name.clone(),
        confounders: prepared.names,
        dropped: prepared.dropped,
        n_complete: complete.len(),
        correlation,
        highly_correlated,
        condition_number,
        collinear,
    })
}

/// Diagnoses every configured covariate set, skipping sets whose confounders
/// are missing from the table.
pub fn diagnose_all(
    alignment: &SampleAlignment,
    table: &ConfounderTable,
    config: &EngineConfig,
) -> Vec<CovariateDiagnostics> {
    config
        .covariate_sets
        .iter()
        .filter_map(|set| {
            let set = CovariateSet {
                name: set.name.clone(),
                confounders: set.confounders.clone(),
            };
            match diagnose_covariate_set(alignment, table, &set, config) {
                Ok(report) => Some(report),
                Err(e) => {
                    log::warn!("Cannot diagnose covariate set '{}': {e}", set.name);
                    None
                }
            }
        })
        .collect()
}
