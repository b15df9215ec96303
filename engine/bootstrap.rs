//! # Bootstrap Confidence Intervals
//!
//! A percentile bootstrap around the partial correlation. Every trial owns its
//! random stream: trial `i` is seeded with `base_seed + i` (wrapping), so the
//! set of trial values depends only on the base seed and the data, never on
//! scheduling. Trials run on a [`TrialPool`] and come back keyed by index.

use crate::correlate::{CorrelationError, partial_pearson_r};
use crate::pool::{PoolError, TrialPool};
use ndarray::{ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_TRIAL_COUNT: usize = 1000;
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;
pub const DEFAULT_MIN_SUCCESS_FRACTION: f64 = 0.5;
pub const DEFAULT_RANDOM_SEED: u64 = 42;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(
        "Only {succeeded} of {completed} completed bootstrap trials produced a finite statistic ({requested} requested); at least {required_fraction} of completed trials must succeed."
    )]
    InsufficientBootstrapTrials {
        succeeded: usize,
        completed: usize,
        requested: usize,
        required_fraction: f64,
    },

    #[error("The bootstrap sample is invalid: {0}")]
    InvalidSample(#[from] CorrelationError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl BootstrapError {
    pub fn code(&self) -> &'static str {
        match self {
            BootstrapError::InsufficientBootstrapTrials { .. } => "InsufficientBootstrapTrials",
            BootstrapError::InvalidSample(inner) => inner.code(),
            BootstrapError::Pool(_) => "PoolFailure",
        }
    }
}

/// Seed for trial `index` of a run started from `base_seed`.
pub fn trial_seed(base_seed: u64, index: usize) -> u64 {
    base_seed.wrapping_add(index as u64)
}

/// One resample: the drawn row indices and the statistic they produced.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapSample {
    pub seed: u64,
    pub indices: Vec<usize>,
    /// `None` when the resample was degenerate.
    pub statistic: Option<f64>,
}

/// Draws resamples of complete `(x, y, C)` data and recomputes the partial
/// correlation on each. Holds borrowed views only, so one resampler is shared
/// by every worker.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapResampler<'a> {
    x: ArrayView1<'a, f64>,
    y: ArrayView1<'a, f64>,
    confounders: ArrayView2<'a, f64>,
    max_condition_number: f64,
}

impl<'a> BootstrapResampler<'a> {
    /// The inputs must already be aligned and free of missing values.
    pub fn new(
        x: ArrayView1<'a, f64>,
        y: ArrayView1<'a, f64>,
        confounders: ArrayView2<'a, f64>,
        max_condition_number: f64,
    ) -> Result<Self, BootstrapError> {
        if x.len() != y.len() || x.len() != confounders.nrows() {
            return Err(CorrelationError::LengthMismatch {
                x: x.len(),
                y: y.len(),
                confounders: confounders.nrows(),
            }
            .into());
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(CorrelationError::Regression(
                crate::regress::RegressionError::NonFiniteInput("bootstrap sample"),
            )
            .into());
        }
        Ok(Self {
            x,
            y,
            confounders,
            max_condition_number,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.x.len()
    }

    /// `n` row indices drawn uniformly with replacement.
    pub fn draw_indices(&self, seed: u64) -> Vec<usize> {
        let n = self.n_samples();
        if n == 0 {
            return Vec::new();
        }
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(0..n)).collect()
    }

    /// Partial correlation over the given rows.
    pub fn statistic_for(&self, indices: &[usize]) -> Result<f64, CorrelationError> {
        let x = self.x.select(Axis(0), indices);
        let y = self.y.select(Axis(0), indices);
        let c = self.confounders.select(Axis(0), indices);
        partial_pearson_r(x.view(), y.view(), c.view(), self.max_condition_number)
    }

    pub fn resample(&self, seed: u64) -> BootstrapSample {
        let indices = self.draw_indices(seed);
        let statistic = match self.statistic_for(&indices) {
            Ok(r) => Some(r),
            Err(e) => {
                log::trace!("bootstrap trial with seed {seed} failed: {e}");
                None
            }
        };
        BootstrapSample {
            seed,
            indices,
            statistic,
        }
    }

    /// The statistic of one trial, or NaN when the resample is degenerate.
    pub fn trial(&self, seed: u64) -> f64 {
        self.resample(seed).statistic.unwrap_or(f64::NAN)
    }
}

/// Knobs of a bootstrap run.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapSettings {
    pub trial_count: usize,
    pub confidence_level: f64,
    pub base_seed: u64,
    /// Fraction of completed trials that must yield a finite statistic.
    pub min_success_fraction: f64,
    pub timeout: Option<Duration>,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            trial_count: DEFAULT_TRIAL_COUNT,
            confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            base_seed: DEFAULT_RANDOM_SEED,
            min_success_fraction: DEFAULT_MIN_SUCCESS_FRACTION,
            timeout: None,
        }
    }
}

/// Raw trial values of one run, in trial-index order.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSet {
    /// One entry per completed trial; NaN marks a failed trial.
    pub values: Vec<f64>,
    pub requested: usize,
    pub timed_out: bool,
}

impl TrialSet {
    pub fn completed(&self) -> usize {
        self.values.len()
    }

    pub fn succeeded(&self) -> usize {
        self.values.iter().filter(|v| v.is_finite()).count()
    }

    /// Finite values, ascending.
    pub fn sorted_finite(&self) -> Vec<f64> {
        let mut finite: Vec<f64> = self.values.iter().copied().filter(|v| v.is_finite()).collect();
        finite.sort_by(f64::total_cmp);
        finite
    }
}

/// A percentile interval plus the bookkeeping needed to judge it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
    pub requested: usize,
    pub completed: usize,
    pub succeeded: usize,
    /// Set when the timeout cut the run short.
    pub degraded: bool,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

pub struct ParallelBootstrapEngine {
    pool: TrialPool,
    settings: BootstrapSettings,
}

impl ParallelBootstrapEngine {
    pub fn new(pool: TrialPool, settings: BootstrapSettings) -> Self {
        Self { pool, settings }
    }

    /// Builds its own pool; `threads == None` uses every logical CPU.
    pub fn with_threads(
        threads: Option<usize>,
        settings: BootstrapSettings,
    ) -> Result<Self, BootstrapError> {
        let pool = match threads {
            Some(n) => TrialPool::new(n)?,
            None => TrialPool::with_available_parallelism()?,
        };
        Ok(Self::new(pool, settings))
    }

    pub fn settings(&self) -> &BootstrapSettings {
        &self.settings
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    /// Runs up to `trial_count` trials, stopping early at the timeout.
    pub fn run_trials(&self, resampler: &BootstrapResampler<'_>) -> TrialSet {
        let started = Instant::now();
        let deadline = self
            .settings
            .timeout
            .and_then(|limit| started.checked_add(limit));
        let base_seed = self.settings.base_seed;

        let run = self.pool.run_indexed(self.settings.trial_count, deadline, |index| {
            resampler.trial(trial_seed(base_seed, index))
        });

        if run.timed_out {
            log::warn!(
                "Bootstrap timed out after {:.2}s: {} of {} trials completed, {} abandoned",
                started.elapsed().as_secs_f64(),
                run.completed(),
                run.requested,
                run.abandoned()
            );
        } else {
            log::debug!(
                "{} bootstrap trials over {} samples finished in {:.3}s on {} threads",
                run.requested,
                resampler.n_samples(),
                started.elapsed().as_secs_f64(),
                self.pool.threads()
            );
        }

        TrialSet {
            values: run.results.into_iter().map(|(_, value)| value).collect(),
            requested: run.requested,
            timed_out: run.timed_out,
        }
    }

    /// Turns a trial set into a percentile interval.
    pub fn summarize(&self, trials: &TrialSet) -> Result<ConfidenceInterval, BootstrapError> {
        let completed = trials.completed();
        let sorted = trials.sorted_finite();
        let succeeded = sorted.len();
        let required = self.settings.min_success_fraction * completed as f64;

        if completed == 0 || succeeded == 0 || (succeeded as f64) < required {
            return Err(BootstrapError::InsufficientBootstrapTrials {
                succeeded,
                completed,
                requested: trials.requested,
                required_fraction: self.settings.min_success_fraction,
            });
        }

        let alpha = 1.0 - self.settings.confidence_level;
        Ok(ConfidenceInterval {
            lower: percentile(&sorted, alpha / 2.0),
            upper: percentile(&sorted, 1.0 - alpha / 2.0),
            level: self.settings.confidence_level,
            requested: trials.requested,
            completed,
            succeeded,
            degraded: trials.timed_out,
        })
    }

    pub fn confidence_interval(
        &self,
        resampler: &BootstrapResampler<'_>,
    ) -> Result<ConfidenceInterval, BootstrapError> {
        let trials = self.run_trials(resampler);
        self.summarize(&trials)
    }
}

/// Quantile `q` of ascending `sorted` values with linear interpolation
/// between order statistics.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let position = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let below = position.floor() as usize;
            let above = position.ceil() as usize;
            let weight = position - below as f64;
            sorted[below] + (sorted[above] - sorted[below]) * weight
        }
    }
}
