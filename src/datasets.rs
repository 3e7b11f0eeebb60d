use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::matrices::Matrix;

/// Seeded blobs, one per class, for demos and tests.
///
/// Class `c` is centred on `±4` along axis `c % n_features` (sign flips every
/// `n_features` classes) with uniform noise in `[-1, 1)` on every axis, so classes are
/// linearly separable as long as `n_classes <= 2 * n_features`. Labels cycle through
/// the classes row by row.
pub fn make_classification(
    n_samples: usize,
    n_features: usize,
    n_classes: usize,
    seed: u64,
) -> (Matrix<f32>, Vec<i64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_classes = n_classes.max(1);
    let n_features = n_features.max(1);

    let mut data = Matrix::<f32>::new(n_samples, n_features);
    let mut labels = Vec::with_capacity(n_samples);
    for i in 0..n_samples {
        let class = i % n_classes;
        let axis = class % n_features;
        let sign = if (class / n_features) % 2 == 0 { 4.0 } else { -4.0 };
        for j in 0..n_features {
            let centre = if j == axis { sign } else { 0.0 };
            data.data[i * n_features + j] = centre + rng.random_range(-1.0..1.0);
        }
        labels.push(class as i64);
    }
    (data, labels)
}
