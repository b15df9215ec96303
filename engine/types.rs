//! Domain types shared by the batch runner, the output writers and the CLI.

use crate::bootstrap::ConfidenceInterval;
use crate::correlate::CorrelationEstimate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named list of confounder columns to adjust for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovariateSet {
    pub name: String,
    pub confounders: Vec<String>,
}

/// One unit of work: an ordered gene pair adjusted for one covariate set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenePair {
    pub gene1: String,
    pub gene2: String,
    pub covariate_set: CovariateSet,
}

impl GenePair {
    pub fn label(&self) -> String {
        format!("{}-{} [{}]", self.gene1, self.gene2, self.covariate_set.name)
    }
}

/// Lifecycle of a unit inside the batch runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStage {
    Pending,
    ComputingSimple,
    ComputingPartial,
    ComputingBootstrap,
    Done,
    Failed,
}

impl PairStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairStage::Pending => "pending",
            PairStage::ComputingSimple => "computing_simple",
            PairStage::ComputingPartial => "computing_partial",
            PairStage::ComputingBootstrap => "computing_bootstrap",
            PairStage::Done => "done",
            PairStage::Failed => "failed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: PairStage) -> bool {
        use PairStage::*;
        matches!(
            (self, next),
            (Pending, ComputingSimple)
                | (ComputingSimple, ComputingPartial)
                | (ComputingPartial, ComputingBootstrap)
                | (ComputingBootstrap, Done)
                | (ComputingSimple | ComputingPartial | ComputingBootstrap, Failed)
        )
    }
}

impl fmt::Display for PairStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything computed for a unit that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialCorrelationResult {
    pub gene1: String,
    pub gene2: String,
    pub covariate_set: String,
    /// Samples with both genes observed.
    pub n_samples: usize,
    /// Samples left once confounder gaps were also removed.
    pub n_adjusted: usize,
    pub n_confounders: usize,
    pub confounders_used: Vec<String>,
    pub simple: CorrelationEstimate,
    pub partial: CorrelationEstimate,
    pub simple_spearman: Option<CorrelationEstimate>,
    pub partial_spearman: Option<CorrelationEstimate>,
    pub interval: ConfidenceInterval,
    pub simple_interval: Option<ConfidenceInterval>,
    pub attenuation_pct: f64,
}

/// A unit that could not be completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPair {
    pub gene1: String,
    pub gene2: String,
    pub covariate_set: String,
    /// The stage that was running when the unit failed.
    pub stage: PairStage,
    pub reason_code: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Completed(PartialCorrelationResult),
    Skipped(SkippedPair),
}

impl PairOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PairOutcome::Completed(_))
    }

    pub fn key(&self) -> (&str, &str, &str) {
        match self {
            PairOutcome::Completed(r) => (&r.gene1, &r.gene2, &r.covariate_set),
            PairOutcome::Skipped(s) => (&s.gene1, &s.gene2, &s.covariate_set),
        }
    }
}

/// Percentage drop in correlation magnitude after adjustment.
///
/// Zero when the unadjusted correlation is exactly zero. Negative values mean
/// adjustment strengthened the association.
pub fn attenuation_pct(simple_r: f64, partial_r: f64) -> f64 {
    if simple_r == 0.0 {
        return 0.0;
    }
    (simple_r.abs() - partial_r.abs()) / simple_r.abs() * 100.0
}
