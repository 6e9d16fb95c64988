//! Seeding the EM loop. The orchestrator only requires the contract
//! below: initial parameters for both roles plus initial per-window
//! posteriors. [`QuantileSplit`] is the built-in heuristic; callers with
//! a better idea (k-means, an earlier fit) implement [`Initializer`].
use crate::data::{Dataset, RealMatrix};
use crate::em::Distribution;
use crate::emission::{EmissionParams, MAX_DISPERSION, MIN_DISPERSION};
use crate::error::Result;
use crate::model::ParamTable;

/// What the orchestrator needs before the first E-step.
#[derive(Debug, Clone)]
pub struct InitialFit {
    pub params: ParamTable,
    /// Windows x states soft assignment.
    pub posteriors: RealMatrix,
}

pub trait Initializer {
    fn initialize(
        &self,
        dataset: &Dataset,
        n_states: usize,
        distribution: Distribution,
    ) -> Result<InitialFit>;
}

/// Rank windows by their mean offset-corrected count, split at an upper
/// quantile, and moment-match an NB on each side. Deterministic and
/// dependency-free; good enough to anchor which state is background.
#[derive(Debug, Clone)]
pub struct QuantileSplit {
    /// Windows above this quantile seed the enrichment side.
    pub quantile: f64,
}

impl Default for QuantileSplit {
    fn default() -> Self {
        Self { quantile: 0.75 }
    }
}

impl QuantileSplit {
    /// Moment-matched (intercept, dispersion) of one side of the split.
    /// Var = mu * (1 + mu / phi) gives phi = mu^2 / (var - mu); at or
    /// under the Poisson variance the dispersion is pinned high.
    fn moments(values: &[f64]) -> (f64, f64) {
        let n = values.len().max(1) as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let mean = mean.max(1e-3);
        let phi = if var > mean * 1.001 {
            (mean * mean / (var - mean)).clamp(MIN_DISPERSION, MAX_DISPERSION)
        } else {
            1e4
        };
        (mean.ln(), phi)
    }
}

impl Initializer for QuantileSplit {
    fn initialize(
        &self,
        dataset: &Dataset,
        n_states: usize,
        distribution: Distribution,
    ) -> Result<InitialFit> {
        let t = dataset.windows();
        let s = dataset.samples();
        let counts = dataset.counts();
        let offsets = dataset.offsets();
        // Mean offset-corrected count per window.
        let corrected: Vec<Vec<f64>> = (0..t)
            .map(|w| {
                (0..s)
                    .map(|j| counts.get(w, j) as f64 / offsets.get(w, j).exp())
                    .collect()
            })
            .collect();
        let means: Vec<f64> = corrected
            .iter()
            .map(|row| row.iter().sum::<f64>() / s as f64)
            .collect();
        let mut sorted = means.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let cut = ((self.quantile * (t - 1) as f64).round() as usize).min(t - 1);
        let threshold = sorted[cut];
        let mut low = vec![];
        let mut high = vec![];
        for (w, &m) in means.iter().enumerate() {
            if m <= threshold {
                low.extend_from_slice(&corrected[w]);
            } else {
                high.extend_from_slice(&corrected[w]);
            }
        }
        let (bg_intercept, bg_phi) = Self::moments(&low);
        let (mut en_intercept, en_phi) = if high.is_empty() {
            (bg_intercept, bg_phi)
        } else {
            Self::moments(&high)
        };
        // Keep the roles ordered even on featureless data.
        if en_intercept < bg_intercept + 0.5 {
            en_intercept = bg_intercept + 2f64.ln();
        }
        let n_covariates = usize::from(dataset.control().is_some());
        let background = match distribution {
            Distribution::Nb => EmissionParams::nb(bg_intercept, bg_phi, n_covariates),
            Distribution::Zinb => EmissionParams::zinb(bg_intercept, bg_phi, -2.0, n_covariates),
        };
        let enrichment = EmissionParams::nb(en_intercept, en_phi, n_covariates);
        let mut posteriors = RealMatrix::zeros(t, n_states);
        for (w, &m) in means.iter().enumerate() {
            let row = posteriors_for(m > threshold, n_states);
            posteriors.row_mut(w).copy_from_slice(&row);
        }
        Ok(InitialFit {
            params: ParamTable::new(background, enrichment),
            posteriors,
        })
    }
}

fn posteriors_for(enriched: bool, n_states: usize) -> Vec<f64> {
    match (n_states, enriched) {
        (2, false) => vec![0.9, 0.1],
        (2, true) => vec![0.1, 0.9],
        (3, false) => vec![0.9, 0.05, 0.05],
        (3, true) => vec![0.1, 0.45, 0.45],
        _ => vec![1.0 / n_states as f64; n_states],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    #[test]
    fn quantile_split_orders_the_roles() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(5);
        let labels = [("x", 1), ("x", 2)];
        let data =
            crate::sim::enriched_dataset(&mut rng, 200, &labels, 10.0, 5.0, 120..160, 6.0, &[0]);
        let init = QuantileSplit::default()
            .initialize(&data, 2, Distribution::Nb)
            .unwrap();
        let bg = init.params.background();
        let en = init.params.enrichment();
        assert!(bg.coef[0] < en.coef[0]);
        assert!((bg.coef[0] - 10f64.ln()).abs() < 0.5, "bg {}", bg.coef[0]);
        assert_eq!(init.posteriors.rows(), 200);
        assert_eq!(init.posteriors.cols(), 2);
        for w in 0..200 {
            let total: f64 = init.posteriors.row(w).iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
        // The elevated span seeds the enrichment side.
        assert!(init.posteriors.get(140, 1) > 0.5);
        assert!(init.posteriors.get(20, 0) > 0.5);
    }

    #[test]
    fn zinb_seed_carries_a_zero_inflation_intercept() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(6);
        let data = crate::sim::flat_dataset(&mut rng, 100, &[("x", 1)], 5.0, 2.0);
        let init = QuantileSplit::default()
            .initialize(&data, 3, Distribution::Zinb)
            .unwrap();
        assert!(init.params.background().zero_infl.is_some());
        assert!(init.params.enrichment().zero_infl.is_none());
        assert_eq!(init.posteriors.cols(), 3);
    }
}
