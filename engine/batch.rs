//! # Pair Batch Runner
//!
//! Drives every configured unit (gene pair × covariate set) through
//! simple correlation, partial correlation and the bootstrap interval. Units
//! are processed one after another in configuration order; the bootstrap
//! inside each unit is the parallel stage.
//!
//! A failing unit never stops the batch. Its error is turned into a
//! [`SkippedPair`] that records the stage it failed in, so the output always
//! has exactly one row per unit.

use crate::bootstrap::{BootstrapError, BootstrapResampler, ParallelBootstrapEngine};
use crate::config::{ConfigError, EngineConfig};
use crate::correlate::{
    CorrelationError, CorrelationOptions, complete_cases, partial_correlation, simple_correlation,
};
use crate::data::{
    ConfounderTable, DataError, ExpressionTable, PreparedConfounders, SampleAlignment,
    prepare_confounders,
};
use crate::types::{
    CovariateSet, GenePair, PairOutcome, PairStage, PartialCorrelationResult, SkippedPair,
    attenuation_pct,
};
use ahash::AHashMap;
use indicatif::ProgressBar;
use ndarray::{Array1, Array2};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a single unit could not be completed.
#[derive(Error, Debug)]
pub enum PairError {
    #[error("Gene '{gene}' has no expression column '{column}'.")]
    MissingGene { gene: String, column: String },

    #[error("Confounder '{0}' is not a column of the confounder table.")]
    MissingConfounder(String),

    #[error("Confounder table could not be read for this set: {0}")]
    ConfounderData(String),

    #[error("Every confounder of covariate set '{0}' was dropped as degenerate.")]
    NoUsableConfounders(String),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}

impl PairError {
    pub fn code(&self) -> &'static str {
        match self {
            PairError::MissingGene { .. } => "MissingGene",
            PairError::MissingConfounder(_) => "MissingConfounder",
            PairError::ConfounderData(_) => "ConfounderData",
            PairError::NoUsableConfounders(_) => "NoUsableConfounders",
            PairError::Correlation(inner) => inner.code(),
            PairError::Bootstrap(inner) => inner.code(),
        }
    }
}

/// Problems that stop a batch before any unit runs.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not start the bootstrap engine: {0}")]
    Bootstrap(#[from] BootstrapError),
}

/// Tracks one unit through its lifecycle.
#[derive(Debug)]
struct StageTracker<'p> {
    pair: &'p GenePair,
    stage: PairStage,
}

impl<'p> StageTracker<'p> {
    fn new(pair: &'p GenePair) -> Self {
        Self {
            pair,
            stage: PairStage::Pending,
        }
    }

    fn advance(&mut self, next: PairStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal transition {} -> {}",
            self.stage,
            next
        );
        log::debug!("{}: {} -> {}", self.pair.label(), self.stage, next);
        self.stage = next;
    }

    /// Records the failure and returns the skipped row for it.
    fn fail(mut self, error: PairError) -> SkippedPair {
        let failed_in = self.stage;
        self.advance(PairStage::Failed);
        log::warn!(
            "Skipping {} during {}: {}",
            self.pair.label(),
            failed_in,
            error
        );
        SkippedPair {
            gene1: self.pair.gene1.clone(),
            gene2: self.pair.gene2.clone(),
            covariate_set: self.pair.covariate_set.name.clone(),
            stage: failed_in,
            reason_code: error.code().to_string(),
            reason: error.to_string(),
        }
    }
}

/// All outcomes of a batch plus run-level figures.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub outcomes: Vec<PairOutcome>,
    pub aligned_samples: usize,
    pub threads: usize,
    pub elapsed: Duration,
    /// Confounders actually used per covariate set, after degenerate columns
    /// were dropped.
    pub confounders_by_set: Vec<(String, Vec<String>)>,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_completed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.completed()
    }
}

/// Why a covariate set could not be gathered from the confounder table.
#[derive(Debug, Clone)]
enum SetFailure {
    MissingConfounder(String),
    Unreadable(String),
}

impl From<DataError> for SetFailure {
    fn from(error: DataError) -> Self {
        match error {
            DataError::ColumnNotFound(name) => SetFailure::MissingConfounder(name),
            other => SetFailure::Unreadable(other.to_string()),
        }
    }
}

impl From<&SetFailure> for PairError {
    fn from(failure: &SetFailure) -> Self {
        match failure {
            SetFailure::MissingConfounder(name) => PairError::MissingConfounder(name.clone()),
            SetFailure::Unreadable(reason) => PairError::ConfounderData(reason.clone()),
        }
    }
}

/// Confounders gathered and prepared for one covariate set, shared by every
/// unit that uses the set.
type PreparedSet = Result<PreparedConfounders, SetFailure>;

pub struct PairBatchRunner<'a> {
    config: &'a EngineConfig,
    expression: &'a ExpressionTable,
    confounders: &'a ConfounderTable,
    alignment: SampleAlignment,
    options: CorrelationOptions,
    engine: ParallelBootstrapEngine,
    progress: Option<ProgressBar>,
}

impl<'a> PairBatchRunner<'a> {
    /// Validates the configuration and aligns the two tables.
    pub fn new(
        config: &'a EngineConfig,
        expression: &'a ExpressionTable,
        confounders: &'a ConfounderTable,
    ) -> Result<Self, BatchError> {
        config.validate()?;
        let engine = ParallelBootstrapEngine::with_threads(config.threads, config.bootstrap_settings())?;
        Ok(Self {
            config,
            expression,
            confounders,
            alignment: SampleAlignment::new(expression, confounders),
            options: config.correlation_options(),
            engine,
            progress: None,
        })
    }

    /// Ticks `bar` once per finished unit.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn alignment(&self) -> &SampleAlignment {
        &self.alignment
    }

    pub fn threads(&self) -> usize {
        self.engine.threads()
    }

    pub fn run(&self) -> BatchReport {
        let started = Instant::now();
        let units = self.config.units();
        log::info!(
            "Running {} units over {} aligned samples with {} bootstrap trials on {} threads",
            units.len(),
            self.alignment.len(),
            self.engine.settings().trial_count,
            self.engine.threads()
        );

        let mut prepared: AHashMap<String, PreparedSet> = AHashMap::new();
        let mut confounders_by_set = Vec::new();
        let mut outcomes = Vec::with_capacity(units.len());

        for pair in &units {
            let set = &pair.covariate_set;
            let entry = prepared.entry(set.name.clone()).or_insert_with(|| {
                let prepared = self.prepare_set(set);
                if let Ok(ready) = &prepared {
                    confounders_by_set.push((set.name.clone(), ready.names.clone()));
                }
                prepared
            });

            if let Some(bar) = &self.progress {
                bar.set_message(pair.label());
            }
            let outcome = self.run_prepared(pair, entry);
            if let Some(bar) = &self.progress {
                bar.inc(1);
            }
            outcomes.push(outcome);
        }

        if let Some(bar) = &self.progress {
            bar.finish_with_message("done");
        }

        let report = BatchReport {
            outcomes,
            aligned_samples: self.alignment.len(),
            threads: self.engine.threads(),
            elapsed: started.elapsed(),
            confounders_by_set,
        };
        log::info!(
            "Batch finished in {:.2}s: {} completed, {} skipped",
            report.elapsed.as_secs_f64(),
            report.completed(),
            report.skipped()
        );
        report
    }

    /// Runs a single unit from scratch.
    pub fn run_pair(&self, pair: &GenePair) -> PairOutcome {
        let prepared = self.prepare_set(&pair.covariate_set);
        self.run_prepared(pair, &prepared)
    }

    fn prepare_set(&self, set: &CovariateSet) -> PreparedSet {
        let matrix = self
            .alignment
            .confounder_matrix(self.confounders, &set.confounders)?;
        Ok(prepare_confounders(
            &matrix,
            &set.confounders,
            self.config.drop_degenerate_confounders,
            self.config.standardize_confounders,
        ))
    }

    fn run_prepared(&self, pair: &GenePair, prepared: &PreparedSet) -> PairOutcome {
        let mut tracker = StageTracker::new(pair);
        match self.compute(pair, prepared, &mut tracker) {
            Ok(result) => {
                tracker.advance(PairStage::Done);
                log::info!(
                    "{}: simple r = {:.4}, partial r = {:.4} [{:.4}, {:.4}], attenuation {:.1}%",
                    pair.label(),
                    result.simple.r,
                    result.partial.r,
                    result.interval.lower,
                    result.interval.upper,
                    result.attenuation_pct
                );
                PairOutcome::Completed(result)
            }
            Err(error) => PairOutcome::Skipped(tracker.fail(error)),
        }
    }

    fn gene_column(&self, gene: &str) -> Result<Array1<f64>, PairError> {
        let column = self.config.resolve_gene(gene);
        self.alignment
            .expression_column(self.expression, column)
            .ok_or_else(|| PairError::MissingGene {
                gene: gene.to_string(),
                column: column.to_string(),
            })
    }

    fn compute(
        &self,
        pair: &GenePair,
        prepared: &PreparedSet,
        tracker: &mut StageTracker<'_>,
    ) -> Result<PartialCorrelationResult, PairError> {
        tracker.advance(PairStage::ComputingSimple);
        let x = self.gene_column(&pair.gene1)?;
        let y = self.gene_column(&pair.gene2)?;
        let simple = simple_correlation(x.view(), y.view(), &self.options)?;

        tracker.advance(PairStage::ComputingPartial);
        let confounders = prepared
            .as_ref()
            .map_err(PairError::from)?;
        if confounders.names.is_empty() {
            return Err(PairError::NoUsableConfounders(pair.covariate_set.name.clone()));
        }
        let partial = partial_correlation(
            x.view(),
            y.view(),
            confounders.matrix.view(),
            &self.options,
        )?;

        tracker.advance(PairStage::ComputingBootstrap);
        let cases = complete_cases(x.view(), y.view(), confounders.matrix.view())?;
        let resampler = BootstrapResampler::new(
            cases.x.view(),
            cases.y.view(),
            cases.confounders.view(),
            self.options.max_condition_number,
        )?;
        let interval = self.engine.confidence_interval(&resampler)?;

        let simple_interval = if self.config.bootstrap_simple {
            let none = Array2::<f64>::zeros((x.len(), 0));
            let pairs = complete_cases(x.view(), y.view(), none.view())?;
            let resampler = BootstrapResampler::new(
                pairs.x.view(),
                pairs.y.view(),
                pairs.confounders.view(),
                self.options.max_condition_number,
            )?;
            Some(self.engine.confidence_interval(&resampler)?)
        } else {
            None
        };

        Ok(PartialCorrelationResult {
            gene1: pair.gene1.clone(),
            gene2: pair.gene2.clone(),
            covariate_set: pair.covariate_set.name.clone(),
            n_samples: simple.n_samples,
            n_adjusted: partial.n_samples,
            n_confounders: partial.n_confounders,
            confounders_used: confounders.names.clone(),
            attenuation_pct: attenuation_pct(simple.pearson.r, partial.pearson.r),
            simple: simple.pearson,
            partial: partial.pearson,
            simple_spearman: simple.spearman,
            partial_spearman: partial.spearman,
            interval,
            simple_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CovariateSetConfig, PairConfig};
    use crate::data::NumericTable;

    fn tables(n: usize) -> (ExpressionTable, ConfounderTable) {
        let ids: Vec<String> = (0..n).map(|i| format!("S{i}")).collect();
        let immune: Vec<f64> = (0..n).map(|i| (i as f64 * 0.83).sin()).collect();
        let purity: Vec<f64> = (0..n).map(|i| (i as f64 * 0.29).cos()).collect();
        let a: Vec<f64> = (0..n)
            .map(|i| immune[i] + 0.3 * (i as f64 * 1.9).sin())
            .collect();
        let b: Vec<f64> = (0..n)
            .map(|i| immune[i] - 0.4 * purity[i] + 0.3 * (i as f64 * 2.3).cos())
            .collect();

        let expression =
            NumericTable::from_columns(ids.clone(), vec![("A".into(), a), ("B".into(), b)]).unwrap();
        let confounders = NumericTable::from_columns(
            ids,
            vec![
                ("immune".into(), immune),
                ("purity".into(), purity),
                ("flat".into(), vec![1.0; n]),
            ],
        )
        .unwrap();
        (expression, confounders)
    }

    fn config(sets: Vec<(&str, Vec<&str>)>, pairs: Vec<(&str, &str)>) -> EngineConfig {
        EngineConfig {
            trial_count: 60,
            threads: Some(2),
            covariate_sets: sets
                .into_iter()
                .map(|(name, confounders)| CovariateSetConfig {
                    name: name.to_string(),
                    confounders: confounders.into_iter().map(String::from).collect(),
                })
                .collect(),
            pairs: pairs
                .into_iter()
                .map(|(gene1, gene2)| PairConfig {
                    gene1: gene1.to_string(),
                    gene2: gene2.to_string(),
                    covariate_sets: None,
                })
                .collect(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn adjustment_for_the_shared_driver_attenuates_the_correlation() {
        let (expression, confounders) = tables(80);
        let config = config(vec![("immune", vec!["immune", "purity"])], vec![("A", "B")]);
        let runner = PairBatchRunner::new(&config, &expression, &confounders).unwrap();
        let report = runner.run();

        assert_eq!(report.completed(), 1);
        let PairOutcome::Completed(result) = &report.outcomes[0] else {
            panic!("unit was skipped: {:?}", report.outcomes[0]);
        };
        assert!(result.simple.r > 0.5);
        assert!(result.partial.r.abs() < result.simple.r.abs());
        assert!(result.attenuation_pct > 0.0);
        assert_eq!((result.n_samples, result.n_adjusted, result.n_confounders), (80, 80, 2));
        assert_eq!(result.partial.degrees_of_freedom, 76);
        assert_eq!(result.interval.requested, 60);
        assert!(result.simple_interval.is_none());
        assert_eq!(report.confounders_by_set[0].1, vec!["immune", "purity"]);
    }

    #[test]
    fn missing_confounder_skips_in_the_partial_stage() {
        let (expression, confounders) = tables(40);
        let config = config(vec![("bad", vec!["immune", "stromal"])], vec![("A", "B")]);
        let runner = PairBatchRunner::new(&config, &expression, &confounders).unwrap();
        let outcome = runner.run_pair(&config.units()[0]);

        let PairOutcome::Skipped(skipped) = outcome else {
            panic!("expected a skipped unit");
        };
        assert_eq!(skipped.reason_code, "MissingConfounder");
        assert_eq!(skipped.stage, PairStage::ComputingPartial);
        assert!(skipped.reason.contains("stromal"));
    }

    #[test]
    fn set_failures_keep_the_missing_column_name() {
        let missing = SetFailure::from(DataError::ColumnNotFound("Neutrophil".into()));
        let error = PairError::from(&missing);
        assert_eq!(error.code(), "MissingConfounder");
        assert_eq!(
            error.to_string(),
            "Confounder 'Neutrophil' is not a column of the confounder table."
        );

        let unreadable = SetFailure::from(DataError::DuplicateColumn("Macrophage".into()));
        let error = PairError::from(&unreadable);
        assert_eq!(error.code(), "ConfounderData");
        assert!(error.to_string().contains("Macrophage"));
    }

    #[test]
    fn degenerate_only_set_is_reported() {
        let (expression, confounders) = tables(40);
        let config = config(vec![("flat", vec!["flat"])], vec![("A", "B")]);
        let runner = PairBatchRunner::new(&config, &expression, &confounders).unwrap();
        let report = runner.run();
        let PairOutcome::Skipped(skipped) = &report.outcomes[0] else {
            panic!("expected a skipped unit");
        };
        assert_eq!(skipped.reason_code, "NoUsableConfounders");
    }

    #[test]
    fn simple_interval_is_optional() {
        let (expression, confounders) = tables(50);
        let mut config = config(vec![("immune", vec!["immune"])], vec![("A", "B")]);
        config.bootstrap_simple = true;
        let runner = PairBatchRunner::new(&config, &expression, &confounders).unwrap();
        let PairOutcome::Completed(result) = runner.run_pair(&config.units()[0]) else {
            panic!("expected a completed unit");
        };
        let ci = result.simple_interval.unwrap();
        assert!(ci.contains(result.simple.r));
    }

    #[test]
    fn invalid_configuration_is_fatal() {
        let (expression, confounders) = tables(20);
        let config = config(vec![("immune", vec!["immune"])], vec![]);
        assert!(matches!(
            PairBatchRunner::new(&config, &expression, &confounders),
            Err(BatchError::Config(ConfigError::NoPairs))
        ));
    }
}
