use rand::prelude::*;
use rand::rngs::StdRng;

/// Deterministic synthetic metric series for benchmarking the intensity
/// and selection paths.
pub fn generate_series(len: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed); // Deterministic for consistent benchmarks
    (0..len).map(|_| rng.gen_range(0.1..120.0)).collect()
}

/// Candidate node counts 1..=count paired with modeled intensities.
pub fn generate_candidates(count: u64, seed: u64) -> Vec<(u64, f64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=count)
        .map(|nodes| (nodes, rng.gen_range(0.1..40.0)))
        .collect()
}
