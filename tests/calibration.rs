//! Coverage of the percentile interval when the true partial correlation is
//! zero: x and y depend on shared confounders only.

use ndarray::{Array1, Array2};
use parcor::bootstrap::{BootstrapResampler, BootstrapSettings, ParallelBootstrapEngine};
use parcor::correlate::{CorrelationOptions, partial_correlation};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

const DATASETS: usize = 400;
const TRIALS: usize = 200;
const SAMPLES: usize = 60;

fn null_dataset(rng: &mut StdRng) -> (Array1<f64>, Array1<f64>, Array2<f64>) {
    let normal = Normal::new(0.0, 1.0).unwrap();
    let c = Array2::from_shape_fn((SAMPLES, 2), |_| normal.sample(&mut *rng));
    let x = Array1::from_shape_fn(SAMPLES, |i| {
        0.9 * c[[i, 0]] + 0.4 * c[[i, 1]] + normal.sample(&mut *rng)
    });
    let y = Array1::from_shape_fn(SAMPLES, |i| {
        0.8 * c[[i, 0]] + 0.5 * c[[i, 1]] + normal.sample(&mut *rng)
    });
    (x, y, c)
}

#[test]
fn ninety_five_percent_interval_covers_zero() {
    let mut rng = StdRng::seed_from_u64(20240501);
    let engine = ParallelBootstrapEngine::with_threads(
        None,
        BootstrapSettings {
            trial_count: TRIALS,
            ..BootstrapSettings::default()
        },
    )
    .unwrap();

    let mut covered = 0;
    let mut simple_significant = 0;
    for _ in 0..DATASETS {
        let (x, y, c) = null_dataset(&mut rng);
        let resampler = BootstrapResampler::new(x.view(), y.view(), c.view(), 1e10).unwrap();
        let ci = engine.confidence_interval(&resampler).unwrap();
        if ci.contains(0.0) {
            covered += 1;
        }

        let none = Array2::<f64>::zeros((SAMPLES, 0));
        let simple =
            partial_correlation(x.view(), y.view(), none.view(), &CorrelationOptions::default())
                .unwrap();
        if simple.pearson.p_value < 0.05 {
            simple_significant += 1;
        }
    }

    let coverage = covered as f64 / DATASETS as f64;
    assert!(coverage >= 0.90, "coverage {coverage:.3} is well below 0.95");
    // The unadjusted correlation is confounded, so it is usually "significant".
    assert!(simple_significant > DATASETS / 2, "{simple_significant} significant");
}
