//! A hidden Markov model engine to detect regions of read enrichment
//! ("peaks") from epigenomic count data.
//!
//! The crate covers two modes. *Consensus* calling fits a two-state HMM
//! (background/enrichment) to one condition with replicates. *Differential*
//! calling fits a three-state HMM whose middle state is a mixture over all
//! combinatorial enrichment patterns across conditions (2^G - 2 components
//! for G conditions); low-weight components are pruned away during EM.
//!
//! Inputs are in-memory matrices: a window-by-sample count matrix with
//! chromosome spans, log-scale offsets, and a design table. Reading
//! alignments, normalization, and peak extraction from the posteriors are
//! the caller's business. The entry points are [`fit_consensus`] and
//! [`fit_differential`]; both return a [`FitReport`] with the posterior
//! probabilities, fitted parameters, and the run's diagnostics.
pub mod data;
pub mod em;
pub mod emission;
pub mod error;
pub mod forward_backward;
pub mod init;
pub mod mixture;
pub mod model;
pub mod sim;

pub use data::{ChromSpan, CountMatrix, Dataset, Design, RealMatrix};
pub use em::{Config, Distribution, FitReport, PruneEvent};
pub use emission::EmissionParams;
pub use error::{Error, Result};
pub use init::{InitialFit, Initializer, QuantileSplit};
pub use mixture::{MixtureSet, PatternComponent};
pub use model::{
    fit_consensus, fit_consensus_with, fit_differential, fit_differential_with, Mode, ParamTable,
    Role,
};

/// Stand-in for the logarithm of zero. Deep enough that `exp` underflows
/// to zero while sums of a few of them stay finite.
pub(crate) const EP: f64 = -1e18;

pub(crate) fn logsumexp(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return EP;
    }
    let max = xs.iter().fold(f64::MIN, |m, &x| m.max(x));
    if max <= EP {
        return EP;
    }
    xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln() + max
}

pub(crate) fn logsumexp2(x: f64, y: f64) -> f64 {
    let (big, small) = if x < y { (y, x) } else { (x, y) };
    if big <= EP {
        return EP;
    }
    big + (small - big).exp().ln_1p()
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn logsumexp_agrees_with_direct_sum() {
        let xs = [-1.0f64, -2.0, -0.5];
        let direct: f64 = xs.iter().map(|x| x.exp()).sum::<f64>().ln();
        assert!((logsumexp(&xs) - direct).abs() < 1e-12);
        assert!((logsumexp2(xs[0], xs[1]) - (xs[0].exp() + xs[1].exp()).ln()).abs() < 1e-12);
    }
    #[test]
    fn logsumexp_handles_log_zero() {
        assert!(logsumexp(&[EP, EP]) <= EP);
        assert!((logsumexp(&[EP, -1.0]) - (-1.0)).abs() < 1e-9);
        assert!((logsumexp2(EP, -1.0) - (-1.0)).abs() < 1e-9);
    }
}
