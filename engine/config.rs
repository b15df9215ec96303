//! # Run Configuration
//!
//! A run is described by a TOML file: bootstrap and correlation settings,
//! named covariate sets, the gene pairs to analyse and an optional alias table
//! from gene symbols to expression column ids. Every setting has a default so
//! a minimal file only lists `pairs` and `covariate_sets`.
//!
//! Configuration problems are fatal and are reported by [`EngineConfig::validate`]
//! before any data is touched.

use crate::bootstrap::{
    BootstrapSettings, DEFAULT_CONFIDENCE_LEVEL, DEFAULT_MIN_SUCCESS_FRACTION,
    DEFAULT_RANDOM_SEED, DEFAULT_TRIAL_COUNT,
};
use crate::correlate::{CorrelationOptions, DEFAULT_MIN_SAMPLES};
use crate::regress::DEFAULT_MAX_CONDITION_NUMBER;
use crate::types::{CovariateSet, GenePair};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Below this many samples a regression on even one confounder is meaningless.
const MIN_ALLOWED_SAMPLES: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write the configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse the TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize the configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("No gene pairs are configured. Add at least one [[pairs]] entry.")]
    NoPairs,

    #[error("No covariate sets are configured. Add at least one [[covariate_sets]] entry.")]
    NoCovariateSets,

    #[error("trial_count must be at least 1.")]
    ZeroTrialCount,

    #[error("confidence_level must lie strictly between 0 and 1, got {0}.")]
    InvalidConfidenceLevel(f64),

    #[error("min_success_fraction must lie in (0, 1], got {0}.")]
    InvalidSuccessFraction(f64),

    #[error("timeout_seconds must be a positive, representable number of seconds, got {0}.")]
    InvalidTimeout(f64),

    #[error("min_samples must be at least {MIN_ALLOWED_SAMPLES}, got {0}.")]
    MinSamplesTooSmall(usize),

    #[error("max_condition_number must be greater than 1, got {0}.")]
    InvalidConditionLimit(f64),

    #[error("threads must be at least 1 when set.")]
    ZeroThreads,

    #[error("sample_id_columns must name at least one column.")]
    NoSampleIdColumns,

    #[error("Covariate set '{0}' is defined more than once.")]
    DuplicateCovariateSet(String),

    #[error("Covariate set '{0}' lists no confounders.")]
    EmptyCovariateSet(String),

    #[error("Pair {gene1}-{gene2} refers to unknown covariate set '{set}'.")]
    UnknownCovariateSet {
        gene1: String,
        gene2: String,
        set: String,
    },

    #[error("Pair {0}-{0} correlates a gene with itself.")]
    SelfPair(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateSetConfig {
    pub name: String,
    pub confounders: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    pub gene1: String,
    pub gene2: String,
    /// Covariate sets to adjust for; every configured set when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariate_sets: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_trial_count")]
    pub trial_count: usize,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    /// Worker threads for the bootstrap; every logical CPU when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    #[serde(default = "default_min_success_fraction")]
    pub min_success_fraction: f64,
    #[serde(default = "default_max_condition_number")]
    pub max_condition_number: f64,
    #[serde(default = "default_true")]
    pub standardize_confounders: bool,
    #[serde(default = "default_true")]
    pub drop_degenerate_confounders: bool,
    #[serde(default = "default_true")]
    pub spearman: bool,
    /// Also bootstrap an interval for the unadjusted correlation.
    #[serde(default)]
    pub bootstrap_simple: bool,
    #[serde(default = "default_sample_id_columns")]
    pub sample_id_columns: Vec<String>,
    /// Gene symbol → expression column id.
    #[serde(default)]
    pub gene_aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub covariate_sets: Vec<CovariateSetConfig>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

fn default_trial_count() -> usize {
    DEFAULT_TRIAL_COUNT
}

fn default_confidence_level() -> f64 {
    DEFAULT_CONFIDENCE_LEVEL
}

fn default_min_samples() -> usize {
    DEFAULT_MIN_SAMPLES
}

fn default_random_seed() -> u64 {
    DEFAULT_RANDOM_SEED
}

fn default_min_success_fraction() -> f64 {
    DEFAULT_MIN_SUCCESS_FRACTION
}

fn default_max_condition_number() -> f64 {
    DEFAULT_MAX_CONDITION_NUMBER
}

fn default_true() -> bool {
    true
}

fn default_sample_id_columns() -> Vec<String> {
    vec!["sample_id".to_string(), "ID".to_string()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trial_count: default_trial_count(),
            confidence_level: default_confidence_level(),
            min_samples: default_min_samples(),
            timeout_seconds: None,
            random_seed: default_random_seed(),
            threads: None,
            min_success_fraction: default_min_success_fraction(),
            max_condition_number: default_max_condition_number(),
            standardize_confounders: true,
            drop_degenerate_confounders: true,
            spearman: true,
            bootstrap_simple: false,
            sample_id_columns: default_sample_id_columns(),
            gene_aliases: BTreeMap::new(),
            covariate_sets: Vec::new(),
            pairs: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Reads a TOML file. The result is not validated yet.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trial_count == 0 {
            return Err(ConfigError::ZeroTrialCount);
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(ConfigError::InvalidConfidenceLevel(self.confidence_level));
        }
        if !(self.min_success_fraction > 0.0 && self.min_success_fraction <= 1.0) {
            return Err(ConfigError::InvalidSuccessFraction(self.min_success_fraction));
        }
        if let Some(seconds) = self.timeout_seconds {
            if !(seconds > 0.0) || Duration::try_from_secs_f64(seconds).is_err() {
                return Err(ConfigError::InvalidTimeout(seconds));
            }
        }
        if self.min_samples < MIN_ALLOWED_SAMPLES {
            return Err(ConfigError::MinSamplesTooSmall(self.min_samples));
        }
        if !(self.max_condition_number > 1.0) {
            return Err(ConfigError::InvalidConditionLimit(self.max_condition_number));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::ZeroThreads);
        }
        if self.sample_id_columns.is_empty() {
            return Err(ConfigError::NoSampleIdColumns);
        }

        if self.covariate_sets.is_empty() {
            return Err(ConfigError::NoCovariateSets);
        }
        let mut names = AHashSet::new();
        for set in &self.covariate_sets {
            if !names.insert(set.name.as_str()) {
                return Err(ConfigError::DuplicateCovariateSet(set.name.clone()));
            }
            if set.confounders.is_empty() {
                return Err(ConfigError::EmptyCovariateSet(set.name.clone()));
            }
        }

        if self.pairs.is_empty() {
            return Err(ConfigError::NoPairs);
        }
        for pair in &self.pairs {
            if pair.gene1 == pair.gene2 {
                return Err(ConfigError::SelfPair(pair.gene1.clone()));
            }
            for set in pair.covariate_sets.iter().flatten() {
                if !names.contains(set.as_str()) {
                    return Err(ConfigError::UnknownCovariateSet {
                        gene1: pair.gene1.clone(),
                        gene2: pair.gene2.clone(),
                        set: set.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Expands pairs × covariate sets into units, in configuration order.
    pub fn units(&self) -> Vec<GenePair> {
        let mut units = Vec::new();
        for pair in &self.pairs {
            let selected = self.covariate_sets.iter().filter(|set| {
                pair.covariate_sets
                    .as_ref()
                    .is_none_or(|wanted| wanted.contains(&set.name))
            });
            for set in selected {
                units.push(GenePair {
                    gene1: pair.gene1.clone(),
                    gene2: pair.gene2.clone(),
                    covariate_set: CovariateSet {
                        name: set.name.clone(),
                        confounders: set.confounders.clone(),
                    },
                });
            }
        }
        units
    }

    pub fn bootstrap_settings(&self) -> BootstrapSettings {
        BootstrapSettings {
            trial_count: self.trial_count,
            confidence_level: self.confidence_level,
            base_seed: self.random_seed,
            min_success_fraction: self.min_success_fraction,
            timeout: self
                .timeout_seconds
                .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok()),
        }
    }

    pub fn correlation_options(&self) -> CorrelationOptions {
        CorrelationOptions {
            min_samples: self.min_samples,
            max_condition_number: self.max_condition_number,
            spearman: self.spearman,
        }
    }

    /// The expression column that holds `gene`.
    pub fn resolve_gene<'a>(&'a self, gene: &'a str) -> &'a str {
        self.gene_aliases
            .get(gene)
            .map(String::as_str)
            .unwrap_or(gene)
    }

    /// Every expression column the configured pairs need, deduplicated.
    pub fn required_gene_columns(&self) -> Vec<String> {
        let mut seen = AHashSet::new();
        self.pairs
            .iter()
            .flat_map(|pair| [pair.gene1.as_str(), pair.gene2.as_str()])
            .map(|gene| self.resolve_gene(gene).to_string())
            .filter(|column| seen.insert(column.clone()))
            .collect()
    }

    /// Every confounder column named by any covariate set, deduplicated.
    pub fn required_confounders(&self) -> Vec<String> {
        let mut seen = AHashSet::new();
        self.covariate_sets
            .iter()
            .flat_map(|set| set.confounders.iter())
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    /// A starting configuration for the PD-L1 regulator study: five gene
    /// pairs adjusted for TIMER2.0 immune infiltration estimates.
    pub fn study_template() -> Self {
        let strings = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let pair = |gene1: &str, gene2: &str| PairConfig {
            gene1: gene1.to_string(),
            gene2: gene2.to_string(),
            covariate_sets: None,
        };

        let gene_aliases = [
            ("CD274", "ENSG00000120217"),
            ("CMTM6", "ENSG00000091317"),
            ("STUB1", "ENSG00000103266"),
            ("HIP1R", "ENSG00000107018"),
            ("SQSTM1", "ENSG00000161011"),
        ]
        .into_iter()
        .map(|(symbol, id)| (symbol.to_string(), id.to_string()))
        .collect();

        Self {
            timeout_seconds: Some(600.0),
            gene_aliases,
            covariate_sets: vec![
                CovariateSetConfig {
                    name: "cell_fractions".to_string(),
                    confounders: strings(&[
                        "B_cell",
                        "T_cell.CD4",
                        "T_cell.CD8",
                        "Neutrophil",
                        "Macrophage",
                        "Myeloid.dendritic",
                    ]),
                },
                CovariateSetConfig {
                    name: "immune_scores".to_string(),
                    confounders: strings(&["T_cell_score", "Myeloid_score", "GEP_score"]),
                },
            ],
            pairs: vec![
                pair("CMTM6", "STUB1"),
                pair("CMTM6", "SQSTM1"),
                pair("STUB1", "SQSTM1"),
                pair("HIP1R", "SQSTM1"),
                pair("HIP1R", "STUB1"),
            ],
            ..Self::default()
        }
    }
}
