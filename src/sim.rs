//! This module generates synthetic count tracks to assess the model.
//! Usually, it would not be used in real applications.
use crate::data::{ChromSpan, CountMatrix, Dataset, Design};
use rand::Rng;

/// Draw one negative binomial count by inverting the CDF with the pmf
/// recurrence. Fine for test-sized means; a huge `phi` is effectively a
/// Poisson draw.
pub fn sample_nb<R: Rng>(rng: &mut R, mu: f64, phi: f64) -> u32 {
    let u: f64 = rng.gen();
    let ratio = mu / (mu + phi);
    let mut pmf = (phi / (mu + phi)).powf(phi);
    let mut cdf = pmf;
    let mut y = 0u32;
    while u > cdf && y < 1_000_000 {
        pmf *= (y as f64 + phi) / (y as f64 + 1.0) * ratio;
        y += 1;
        cdf += pmf;
    }
    y
}

/// A flat single-chromosome track: every window of every sample drawn
/// from NB(mu, phi).
pub fn flat_dataset<R: Rng, S: AsRef<str>>(
    rng: &mut R,
    windows: usize,
    design_labels: &[(S, u32)],
    mu: f64,
    phi: f64,
) -> Dataset {
    let design = Design::new(design_labels).unwrap();
    let samples = design.n_samples();
    let counts: Vec<u32> = (0..windows * samples)
        .map(|_| sample_nb(rng, mu, phi))
        .collect();
    let spans = vec![ChromSpan::new("chr1", 0, windows)];
    let counts = CountMatrix::new(counts, samples, spans).unwrap();
    Dataset::new(counts, design).unwrap()
}

/// A single-chromosome track with one enriched span: windows inside
/// `region` have their mean multiplied by `fold` for the samples whose
/// condition index is in `enriched_conditions`.
pub fn enriched_dataset<R: Rng, S: AsRef<str>>(
    rng: &mut R,
    windows: usize,
    design_labels: &[(S, u32)],
    baseline_mu: f64,
    phi: f64,
    region: std::ops::Range<usize>,
    fold: f64,
    enriched_conditions: &[usize],
) -> Dataset {
    let design = Design::new(design_labels).unwrap();
    let samples = design.n_samples();
    let mut counts = Vec::with_capacity(windows * samples);
    for window in 0..windows {
        for sample in 0..samples {
            let elevated = region.contains(&window)
                && enriched_conditions.contains(&design.condition_of(sample));
            let mu = if elevated {
                baseline_mu * fold
            } else {
                baseline_mu
            };
            counts.push(sample_nb(rng, mu, phi));
        }
    }
    let spans = vec![ChromSpan::new("chr1", 0, windows)];
    let counts = CountMatrix::new(counts, samples, spans).unwrap();
    Dataset::new(counts, design).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    #[test]
    fn nb_samples_match_their_moments() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(42);
        let (mu, phi) = (15.0, 3.0);
        let n = 20000;
        let draws: Vec<f64> = (0..n).map(|_| sample_nb(&mut rng, mu, phi) as f64).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((mean - mu).abs() < 0.3, "mean {}", mean);
        let expected_var = mu * (1.0 + mu / phi);
        assert!(
            (var - expected_var).abs() / expected_var < 0.1,
            "var {} vs {}",
            var,
            expected_var
        );
    }

    #[test]
    fn enriched_dataset_elevates_the_right_samples() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(1);
        let labels = [("a", 1), ("a", 2), ("b", 1), ("b", 2)];
        let data = enriched_dataset(&mut rng, 200, &labels, 10.0, 1e6, 50..100, 5.0, &[0]);
        let mean_in = |sample: usize, range: std::ops::Range<usize>| -> f64 {
            let total: u32 = range.clone().map(|w| data.counts().get(w, sample)).sum();
            total as f64 / range.len() as f64
        };
        assert!(mean_in(0, 50..100) > 3.0 * mean_in(0, 100..150));
        assert!(mean_in(2, 50..100) < 1.5 * mean_in(2, 100..150));
    }
}
