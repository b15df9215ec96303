//! Result tables and run summaries.
//!
//! Results are written as a tab-separated table with one row per unit;
//! skipped units keep their key columns and carry the failure stage and reason
//! instead of statistics. The run summary is a JSON document.

use crate::batch::BatchReport;
use crate::config::EngineConfig;
use crate::types::{PairOutcome, PartialCorrelationResult, SkippedPair};
use ahash::AHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const RESULTS_FILE: &str = "partial_correlation_results.tsv";
pub const SUMMARY_FILE: &str = "partial_correlation_summary.json";
pub const COMPARISON_FILE: &str = "partial_correlation_comparison.tsv";

const CONFOUNDER_SEPARATOR: &str = ";";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to read or write a results table: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Failed to write the JSON summary: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// One line of the results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub gene1: String,
    pub gene2: String,
    pub covariate_set: String,
    /// `ok` or `skipped`.
    pub status: String,
    pub n_samples: Option<usize>,
    pub n_adjusted: Option<usize>,
    pub n_confounders: Option<usize>,
    pub simple_r: Option<f64>,
    pub simple_p: Option<f64>,
    pub partial_r: Option<f64>,
    pub partial_p: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub attenuation_pct: Option<f64>,
    pub simple_spearman_rho: Option<f64>,
    pub simple_spearman_p: Option<f64>,
    pub partial_spearman_rho: Option<f64>,
    pub partial_spearman_p: Option<f64>,
    pub confidence_level: Option<f64>,
    pub bootstrap_requested: Option<usize>,
    pub bootstrap_completed: Option<usize>,
    pub bootstrap_succeeded: Option<usize>,
    pub bootstrap_degraded: Option<bool>,
    pub simple_ci_lower: Option<f64>,
    pub simple_ci_upper: Option<f64>,
    pub confounders_used: Option<String>,
    pub failed_stage: Option<String>,
    pub reason_code: Option<String>,
    pub reason: Option<String>,
}

impl ResultRow {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    fn completed(result: &PartialCorrelationResult) -> Self {
        Self {
            gene1: result.gene1.clone(),
            gene2: result.gene2.clone(),
            covariate_set: result.covariate_set.clone(),
            status: "ok".to_string(),
            n_samples: Some(result.n_samples),
            n_adjusted: Some(result.n_adjusted),
            n_confounders: Some(result.n_confounders),
            simple_r: Some(result.simple.r),
            simple_p: Some(result.simple.p_value),
            partial_r: Some(result.partial.r),
            partial_p: Some(result.partial.p_value),
            ci_lower: Some(result.interval.lower),
            ci_upper: Some(result.interval.upper),
            attenuation_pct: Some(result.attenuation_pct),
            simple_spearman_rho: result.simple_spearman.map(|s| s.r),
            simple_spearman_p: result.simple_spearman.map(|s| s.p_value),
            partial_spearman_rho: result.partial_spearman.map(|s| s.r),
            partial_spearman_p: result.partial_spearman.map(|s| s.p_value),
            confidence_level: Some(result.interval.level),
            bootstrap_requested: Some(result.interval.requested),
            bootstrap_completed: Some(result.interval.completed),
            bootstrap_succeeded: Some(result.interval.succeeded),
            bootstrap_degraded: Some(result.interval.degraded),
            simple_ci_lower: result.simple_interval.map(|ci| ci.lower),
            simple_ci_upper: result.simple_interval.map(|ci| ci.upper),
            confounders_used: Some(result.confounders_used.iter().join(CONFOUNDER_SEPARATOR)),
            failed_stage: None,
            reason_code: None,
            reason: None,
        }
    }

    fn skipped(skipped: &SkippedPair) -> Self {
        Self {
            gene1: skipped.gene1.clone(),
            gene2: skipped.gene2.clone(),
            covariate_set: skipped.covariate_set.clone(),
            status: "skipped".to_string(),
            n_samples: None,
            n_adjusted: None,
            n_confounders: None,
            simple_r: None,
            simple_p: None,
            partial_r: None,
            partial_p: None,
            ci_lower: None,
            ci_upper: None,
            attenuation_pct: None,
            simple_spearman_rho: None,
            simple_spearman_p: None,
            partial_spearman_rho: None,
            partial_spearman_p: None,
            confidence_level: None,
            bootstrap_requested: None,
            bootstrap_completed: None,
            bootstrap_succeeded: None,
            bootstrap_degraded: None,
            simple_ci_lower: None,
            simple_ci_upper: None,
            confounders_used: None,
            failed_stage: Some(skipped.stage.as_str().to_string()),
            reason_code: Some(skipped.reason_code.clone()),
            reason: Some(skipped.reason.clone()),
        }
    }
}

impl From<&PairOutcome> for ResultRow {
    fn from(outcome: &PairOutcome) -> Self {
        match outcome {
            PairOutcome::Completed(result) => ResultRow::completed(result),
            PairOutcome::Skipped(skipped) => ResultRow::skipped(skipped),
        }
    }
}

pub fn write_results(path: &Path, outcomes: &[PairOutcome]) -> Result<(), OutputError> {
    let rows: Vec<ResultRow> = outcomes.iter().map(ResultRow::from).collect();
    write_rows(path, &rows)
}

pub fn read_results(path: &Path) -> Result<Vec<ResultRow>, OutputError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    let rows = reader.deserialize().collect::<Result<Vec<ResultRow>, _>>()?;
    Ok(rows)
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), OutputError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Run metadata written next to the results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub version: String,
    pub expression_samples: usize,
    pub confounder_samples: usize,
    pub aligned_samples: usize,
    pub units: usize,
    pub completed: usize,
    pub skipped: usize,
    pub threads: usize,
    pub trial_count: usize,
    pub confidence_level: f64,
    pub random_seed: u64,
    pub elapsed_seconds: f64,
    pub units_per_second: f64,
    pub trials_per_second: f64,
    /// Confounders used by each covariate set after preparation.
    pub covariate_sets: BTreeMap<String, Vec<String>>,
    /// Skip counts by reason code.
    pub skip_reasons: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn new(
        report: &BatchReport,
        config: &EngineConfig,
        expression_samples: usize,
        confounder_samples: usize,
    ) -> Self {
        let seconds = report.elapsed.as_secs_f64();
        let rate = |count: usize| {
            if seconds > 0.0 {
                count as f64 / seconds
            } else {
                0.0
            }
        };
        let trials_run: usize = report
            .outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                PairOutcome::Completed(result) => Some(
                    result.interval.completed
                        + result.simple_interval.map_or(0, |ci| ci.completed),
                ),
                PairOutcome::Skipped(_) => None,
            })
            .sum();
        let skip_reasons = report
            .outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                PairOutcome::Skipped(skipped) => Some(skipped.reason_code.clone()),
                PairOutcome::Completed(_) => None,
            })
            .counts()
            .into_iter()
            .collect();

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            expression_samples,
            confounder_samples,
            aligned_samples: report.aligned_samples,
            units: report.outcomes.len(),
            completed: report.completed(),
            skipped: report.skipped(),
            threads: report.threads,
            trial_count: config.trial_count,
            confidence_level: config.confidence_level,
            random_seed: config.random_seed,
            elapsed_seconds: seconds,
            units_per_second: rate(report.outcomes.len()),
            trials_per_second: rate(trials_run),
            covariate_sets: report.confounders_by_set.iter().cloned().collect(),
            skip_reasons,
        }
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), OutputError> {
    write_json(path, summary)
}

/// Pretty-printed JSON with a trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), OutputError> {
    let mut file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

/// A unit present in both a baseline and a current results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub gene1: String,
    pub gene2: String,
    pub covariate_set: String,
    pub baseline_status: String,
    pub current_status: String,
    pub baseline_partial_r: Option<f64>,
    pub current_partial_r: Option<f64>,
    /// `current - baseline`, when both have a partial correlation.
    pub r_difference: Option<f64>,
    pub baseline_attenuation_pct: Option<f64>,
    pub current_attenuation_pct: Option<f64>,
}

/// Inner join on `(gene1, gene2, covariate_set)`, in `current` order.
pub fn compare_results(baseline: &[ResultRow], current: &[ResultRow]) -> Vec<ComparisonRow> {
    let index: AHashMap<(&str, &str, &str), &ResultRow> = baseline
        .iter()
        .map(|row| {
            (
                (row.gene1.as_str(), row.gene2.as_str(), row.covariate_set.as_str()),
                row,
            )
        })
        .collect();

    current
        .iter()
        .filter_map(|now| {
            let key = (now.gene1.as_str(), now.gene2.as_str(), now.covariate_set.as_str());
            let before = index.get(&key)?;
            let r_difference = match (before.partial_r, now.partial_r) {
                (Some(old), Some(new)) => Some(new - old),
                _ => None,
            };
            Some(ComparisonRow {
                gene1: now.gene1.clone(),
                gene2: now.gene2.clone(),
                covariate_set: now.covariate_set.clone(),
                baseline_status: before.status.clone(),
                current_status: now.status.clone(),
                baseline_partial_r: before.partial_r,
                current_partial_r: now.partial_r,
                r_difference,
                baseline_attenuation_pct: before.attenuation_pct,
                current_attenuation_pct: now.attenuation_pct,
            })
        })
        .collect()
}

pub fn write_comparison(path: &Path, rows: &[ComparisonRow]) -> Result<(), OutputError> {
    write_rows(path, rows)
}
