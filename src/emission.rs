//! Per-state count likelihoods and their weighted GLM fits.
//!
//! Emissions are negative binomial with mean `mu = exp(x . beta + o)` and
//! variance `mu * (1 + mu / phi)`; `phi` is the size parameter, so a LARGE
//! `phi` means LOW overdispersion. The background state may instead carry a
//! zero-inflated negative binomial whose zero mass has probability
//! `rho = logistic(alpha + o)`.
//!
//! Fitting is iteratively reweighted least squares with posterior
//! responsibilities as case weights, alternated with a Newton step for the
//! dispersion on the log scale. Hitting the iteration cap is reported in
//! the [`FitStatus`], never raised: the last iterate is kept and EM moves on.
use serde::{Deserialize, Serialize};
use statrs::function::gamma::{digamma, ln_gamma};

pub const MIN_DISPERSION: f64 = 1e-2;
pub const MAX_DISPERSION: f64 = 1e8;
const MIN_MU: f64 = 1e-8;
// Clamp on the linear predictor; exp(30) is far beyond any window count.
const MAX_ETA: f64 = 30.0;
const MIN_PROB: f64 = 1e-12;

/// Emission parameters of one role (background or enrichment): an
/// intercept-led coefficient vector, the dispersion, and the optional
/// zero-inflation intercept on the logit scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionParams {
    pub coef: Vec<f64>,
    pub dispersion: f64,
    pub zero_infl: Option<f64>,
}

impl EmissionParams {
    pub fn nb(intercept: f64, dispersion: f64, n_covariates: usize) -> Self {
        let mut coef = vec![0f64; 1 + n_covariates];
        coef[0] = intercept;
        Self {
            coef,
            dispersion,
            zero_infl: None,
        }
    }
    pub fn zinb(intercept: f64, dispersion: f64, alpha: f64, n_covariates: usize) -> Self {
        let mut params = Self::nb(intercept, dispersion, n_covariates);
        params.zero_infl = Some(alpha);
        params
    }
    /// Number of free parameters, for BIC bookkeeping.
    pub fn n_free(&self) -> usize {
        self.coef.len() + 1 + usize::from(self.zero_infl.is_some())
    }
    fn eta(&self, offset: f64, covariate: Option<f64>) -> f64 {
        let mut eta = self.coef[0] + offset;
        if let Some(c) = covariate {
            eta += self.coef[1] * c;
        }
        eta.clamp(-MAX_ETA, MAX_ETA)
    }
    pub fn mean(&self, offset: f64, covariate: Option<f64>) -> f64 {
        self.eta(offset, covariate).exp().max(MIN_MU)
    }
    /// Log density of one count under this role.
    pub fn log_density(&self, y: u32, offset: f64, covariate: Option<f64>) -> f64 {
        let mu = self.mean(offset, covariate);
        match self.zero_infl {
            None => nb_logpmf(y as f64, mu, self.dispersion),
            Some(alpha) => {
                let rho = logistic(alpha + offset);
                zinb_logpmf(y as f64, mu, self.dispersion, rho)
            }
        }
    }
}

impl std::fmt::Display for EmissionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let coef: Vec<_> = self.coef.iter().map(|x| format!("{:.4}", x)).collect();
        write!(f, "beta:[{}]\tphi:{:.4}", coef.join(","), self.dispersion)?;
        if let Some(alpha) = self.zero_infl {
            write!(f, "\talpha:{:.4}", alpha)?;
        }
        Ok(())
    }
}

pub fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Negative binomial log pmf with Var = mu * (1 + mu / phi).
pub fn nb_logpmf(y: f64, mu: f64, phi: f64) -> f64 {
    ln_gamma(y + phi) - ln_gamma(phi) - ln_gamma(y + 1.0)
        + phi * (phi / (phi + mu)).ln()
        + y * (mu / (phi + mu)).ln()
}

/// Zero-inflated negative binomial log pmf: point mass `rho` at zero
/// mixed with an NB of weight `1 - rho`.
pub fn zinb_logpmf(y: f64, mu: f64, phi: f64, rho: f64) -> f64 {
    let rho = rho.clamp(MIN_PROB, 1.0 - MIN_PROB);
    let nb = nb_logpmf(y, mu, phi);
    if y == 0.0 {
        crate::logsumexp2(rho.ln(), (1.0 - rho).ln() + nb)
    } else {
        (1.0 - rho).ln() + nb
    }
}

/// Posterior probability that a count is a structural zero. Non-zero
/// counts cannot be.
pub fn zero_mass_responsibility(y: u32, mu: f64, phi: f64, rho: f64) -> f64 {
    if y > 0 {
        return 0.0;
    }
    let rho = rho.clamp(MIN_PROB, 1.0 - MIN_PROB);
    let nb0 = nb_logpmf(0.0, mu, phi).exp();
    rho / (rho + (1.0 - rho) * nb0)
}

/// Outcome flags of one regression fit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FitStatus {
    pub converged: bool,
    pub iterations: usize,
}

#[derive(Debug, Clone)]
pub struct GlmFit {
    pub params: EmissionParams,
    pub status: FitStatus,
}

/// One pooled regression input: one observation per (window, sample)
/// pair, flattened row-major, with posterior responsibilities as weights.
#[derive(Debug, Clone, Copy)]
pub struct GlmData<'a> {
    pub y: &'a [f64],
    pub offsets: &'a [f64],
    pub covariate: Option<&'a [f64]>,
    pub weights: &'a [f64],
}

impl<'a> GlmData<'a> {
    fn len(&self) -> usize {
        self.y.len()
    }
    fn cov(&self, i: usize) -> Option<f64> {
        self.covariate.map(|c| c[i])
    }
}

/// Weighted NB regression: alternate one IRLS step for the coefficients
/// with one Newton step for the dispersion until both settle.
pub fn fit_weighted_nb(
    data: &GlmData,
    start: &EmissionParams,
    max_iters: usize,
    tol: f64,
) -> GlmFit {
    let n_coef = 1 + usize::from(data.covariate.is_some());
    let mut coef = start.coef.clone();
    coef.resize(n_coef, 0.0);
    let mut phi = start.dispersion.clamp(MIN_DISPERSION, MAX_DISPERSION);
    let mut converged = false;
    let mut iterations = 0;
    for it in 1..=max_iters {
        iterations = it;
        let coef_old = coef.clone();
        let phi_old = phi;
        irls_step(&mut coef, phi, data);
        phi = dispersion_step(&coef, phi, data);
        let delta_coef = coef
            .iter()
            .zip(coef_old.iter())
            .map(|(new, old)| (new - old).abs() / (old.abs() + 1.0))
            .fold(0f64, f64::max);
        let delta_phi = (phi - phi_old).abs() / (phi_old.abs() + 1.0);
        if delta_coef.max(delta_phi) < tol {
            converged = true;
            break;
        }
    }
    if !converged {
        log::debug!(
            "weighted NB fit hit the iteration cap ({} steps, beta0 {:.4}, phi {:.4})",
            max_iters,
            coef[0],
            phi
        );
    }
    GlmFit {
        params: EmissionParams {
            coef,
            dispersion: phi,
            zero_infl: None,
        },
        status: FitStatus {
            converged,
            iterations,
        },
    }
}

/// One weighted least squares step on the working response. The design is
/// at most [1, control], so the normal equations are 2x2.
fn irls_step(coef: &mut [f64], phi: f64, data: &GlmData) {
    let (mut s11, mut s1c, mut scc) = (0f64, 0f64, 0f64);
    let (mut t1, mut tc) = (0f64, 0f64);
    for i in 0..data.len() {
        let w = data.weights[i];
        if w <= 0.0 {
            continue;
        }
        let o = data.offsets[i];
        let c = data.cov(i);
        let mut eta = coef[0] + o;
        if let Some(c) = c {
            eta += coef[1] * c;
        }
        eta = eta.clamp(-MAX_ETA, MAX_ETA);
        let mu = eta.exp().max(MIN_MU);
        // Working weight of the NB log link: w * mu / (1 + mu / phi).
        let ww = w * mu / (1.0 + mu / phi);
        let z = (eta - o) + (data.y[i] - mu) / mu;
        s11 += ww;
        t1 += ww * z;
        if let Some(c) = c {
            s1c += ww * c;
            scc += ww * c * c;
            tc += ww * z * c;
        }
    }
    if coef.len() == 1 {
        if s11 > 0.0 {
            coef[0] = t1 / s11;
        }
    } else {
        let det = s11 * scc - s1c * s1c;
        if det.abs() > 1e-12 && s11 > 0.0 {
            coef[0] = (scc * t1 - s1c * tc) / det;
            coef[1] = (s11 * tc - s1c * t1) / det;
        } else if s11 > 0.0 {
            // Degenerate covariate; fall back to intercept-only.
            coef[0] = t1 / s11;
            coef[1] = 0.0;
        }
    }
}

/// One guarded Newton step for the dispersion on the log scale, holding
/// the coefficients fixed.
fn dispersion_step(coef: &[f64], phi: f64, data: &GlmData) -> f64 {
    let theta = phi.ln();
    let grad_at = |theta: f64| -> f64 {
        let phi = theta.exp().clamp(MIN_DISPERSION, MAX_DISPERSION);
        let mut grad = 0f64;
        for i in 0..data.len() {
            let w = data.weights[i];
            if w <= 0.0 {
                continue;
            }
            let mut eta = coef[0] + data.offsets[i];
            if let Some(c) = data.cov(i) {
                eta += coef[1] * c;
            }
            let mu = eta.clamp(-MAX_ETA, MAX_ETA).exp().max(MIN_MU);
            let y = data.y[i];
            grad += w
                * (digamma(y + phi) - digamma(phi) + (phi / (phi + mu)).ln() + 1.0
                    - (y + phi) / (phi + mu));
        }
        // Chain rule for the log-scale parametrization.
        grad * phi
    };
    let grad = grad_at(theta);
    let delta = 1e-4;
    let hess = (grad_at(theta + delta) - grad_at(theta - delta)) / (2.0 * delta);
    let step = if hess.is_finite() && hess < -1e-10 {
        (-grad / hess).clamp(-2.0, 2.0)
    } else {
        // Wrong curvature; take a short ascent step instead.
        0.5 * grad.signum()
    };
    (theta + step).exp().clamp(MIN_DISPERSION, MAX_DISPERSION)
}

/// Weighted logistic regression for the zero-inflation intercept, with
/// the offset entering the logit. Returns the fitted intercept.
pub fn fit_weighted_logistic(
    z: &[f64],
    offsets: &[f64],
    weights: &[f64],
    start: f64,
    max_iters: usize,
    tol: f64,
) -> (f64, FitStatus) {
    let mut alpha = start;
    let mut converged = false;
    let mut iterations = 0;
    for it in 1..=max_iters {
        iterations = it;
        let (mut score, mut info) = (0f64, 0f64);
        for i in 0..z.len() {
            let w = weights[i];
            if w <= 0.0 {
                continue;
            }
            let p = logistic(alpha + offsets[i]).clamp(MIN_PROB, 1.0 - MIN_PROB);
            score += w * (z[i] - p);
            info += w * p * (1.0 - p);
        }
        if info <= 1e-12 {
            break;
        }
        let step = (score / info).clamp(-5.0, 5.0);
        alpha = (alpha + step).clamp(-20.0, 20.0);
        if step.abs() < tol {
            converged = true;
            break;
        }
    }
    (
        alpha,
        FitStatus {
            converged,
            iterations,
        },
    )
}

/// Weighted ZINB regression: a small EM of its own. Zero counts are split
/// between the point mass and the NB, the zero-mass intercept is fit by
/// logistic IRLS, and the NB part is refit with deflated weights.
pub fn fit_weighted_zinb(
    data: &GlmData,
    start: &EmissionParams,
    max_iters: usize,
    tol: f64,
) -> GlmFit {
    let mut nb = EmissionParams {
        coef: start.coef.clone(),
        dispersion: start.dispersion.clamp(MIN_DISPERSION, MAX_DISPERSION),
        zero_infl: None,
    };
    let mut alpha = start.zero_infl.unwrap_or(-2.0);
    let mut converged = false;
    let mut iterations = 0;
    let n = data.len();
    let mut resp = vec![0f64; n];
    let mut deflated = vec![0f64; n];
    for it in 1..=max_iters {
        iterations = it;
        let coef_old = nb.coef.clone();
        let phi_old = nb.dispersion;
        let alpha_old = alpha;
        for i in 0..n {
            let mu = nb.mean(data.offsets[i], data.cov(i));
            let rho = logistic(alpha + data.offsets[i]);
            resp[i] = zero_mass_responsibility(data.y[i] as u32, mu, nb.dispersion, rho);
            deflated[i] = data.weights[i] * (1.0 - resp[i]);
        }
        let (new_alpha, _) =
            fit_weighted_logistic(&resp, data.offsets, data.weights, alpha, max_iters, tol);
        alpha = new_alpha;
        let nb_data = GlmData {
            weights: &deflated,
            ..*data
        };
        let refit = fit_weighted_nb(&nb_data, &nb, max_iters, tol);
        nb = refit.params;
        let delta_coef = nb
            .coef
            .iter()
            .zip(coef_old.iter())
            .map(|(new, old)| (new - old).abs() / (old.abs() + 1.0))
            .fold(0f64, f64::max);
        let delta_phi = (nb.dispersion - phi_old).abs() / (phi_old.abs() + 1.0);
        let delta_alpha = (alpha - alpha_old).abs() / (alpha_old.abs() + 1.0);
        if delta_coef.max(delta_phi).max(delta_alpha) < tol {
            converged = true;
            break;
        }
    }
    if !converged {
        log::debug!(
            "weighted ZINB fit hit the iteration cap ({} steps, alpha {:.4})",
            max_iters,
            alpha
        );
    }
    GlmFit {
        params: EmissionParams {
            coef: nb.coef,
            dispersion: nb.dispersion,
            zero_infl: Some(alpha),
        },
        status: FitStatus {
            converged,
            iterations,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;
    use statrs::distribution::{Discrete, NegativeBinomial};

    #[test]
    fn nb_logpmf_matches_statrs() {
        let (mu, phi) = (7.3, 2.5);
        let p = phi / (phi + mu);
        let reference = NegativeBinomial::new(phi, p).unwrap();
        for y in [0u64, 1, 2, 5, 20, 100] {
            let ours = nb_logpmf(y as f64, mu, phi);
            let theirs = reference.ln_pmf(y);
            assert!(
                (ours - theirs).abs() < 1e-9,
                "y={}: {} vs {}",
                y,
                ours,
                theirs
            );
        }
    }

    #[test]
    fn zinb_logpmf_normalizes() {
        let (mu, phi, rho) = (4.0, 3.0, 0.3);
        let total: f64 = (0..2000)
            .map(|y| zinb_logpmf(y as f64, mu, phi, rho).exp())
            .sum();
        assert!((total - 1.0).abs() < 1e-8, "total {}", total);
        // Zero inflation only inflates zero.
        assert!(zinb_logpmf(0.0, mu, phi, rho) > nb_logpmf(0.0, mu, phi));
        assert!(zinb_logpmf(3.0, mu, phi, rho) < nb_logpmf(3.0, mu, phi));
    }

    #[test]
    fn zero_mass_responsibility_bounds() {
        assert_eq!(zero_mass_responsibility(3, 5.0, 2.0, 0.4), 0.0);
        let r = zero_mass_responsibility(0, 5.0, 2.0, 0.4);
        assert!(0.0 < r && r < 1.0);
        // A large mean makes an NB zero implausible, so the point mass wins.
        let r = zero_mass_responsibility(0, 500.0, 100.0, 0.1);
        assert!(r > 0.99);
    }

    #[test]
    fn irls_recovers_intercept_and_dispersion() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(7);
        let (mu, phi) = (12.0, 4.0);
        let n = 4000;
        let y: Vec<f64> = (0..n)
            .map(|_| crate::sim::sample_nb(&mut rng, mu, phi) as f64)
            .collect();
        let offsets = vec![0f64; n];
        let weights = vec![1f64; n];
        let data = GlmData {
            y: &y,
            offsets: &offsets,
            covariate: None,
            weights: &weights,
        };
        let start = EmissionParams::nb(0.0, 1.0, 0);
        let fit = fit_weighted_nb(&data, &start, 100, 1e-8);
        assert!(fit.status.converged);
        assert!(
            (fit.params.coef[0] - mu.ln()).abs() < 0.05,
            "intercept {}",
            fit.params.coef[0]
        );
        assert!(
            (fit.params.dispersion.ln() - phi.ln()).abs() < 0.35,
            "dispersion {}",
            fit.params.dispersion
        );
    }

    #[test]
    fn irls_honors_case_weights() {
        // Half the observations come from a higher mean but carry zero
        // weight; the fit must ignore them.
        let mut rng = Xoshiro256StarStar::seed_from_u64(11);
        let n = 2000;
        let mut y = vec![];
        let mut weights = vec![];
        for i in 0..n {
            let mu = if i % 2 == 0 { 8.0 } else { 60.0 };
            y.push(crate::sim::sample_nb(&mut rng, mu, 5.0) as f64);
            weights.push(if i % 2 == 0 { 1.0 } else { 0.0 });
        }
        let offsets = vec![0f64; n];
        let data = GlmData {
            y: &y,
            offsets: &offsets,
            covariate: None,
            weights: &weights,
        };
        let fit = fit_weighted_nb(&data, &EmissionParams::nb(0.0, 1.0, 0), 100, 1e-8);
        assert!((fit.params.coef[0] - 8f64.ln()).abs() < 0.1);
    }

    #[test]
    fn logistic_fit_recovers_rate() {
        // 30% structural zeros, no offset: alpha should land near logit(0.3).
        let n = 5000;
        let z: Vec<f64> = (0..n).map(|i| if i % 10 < 3 { 1.0 } else { 0.0 }).collect();
        let offsets = vec![0f64; n];
        let weights = vec![1f64; n];
        let (alpha, status) = fit_weighted_logistic(&z, &offsets, &weights, 0.0, 100, 1e-10);
        assert!(status.converged);
        let target = (0.3f64 / 0.7).ln();
        assert!((alpha - target).abs() < 1e-6, "alpha {}", alpha);
    }

    #[test]
    fn zinb_fit_finds_zero_inflation() {
        let mut rng = Xoshiro256StarStar::seed_from_u64(3);
        let (mu, phi, rho) = (10.0, 5.0, 0.25);
        let n = 4000;
        let y: Vec<f64> = (0..n)
            .map(|_| {
                if rand::Rng::gen::<f64>(&mut rng) < rho {
                    0.0
                } else {
                    crate::sim::sample_nb(&mut rng, mu, phi) as f64
                }
            })
            .collect();
        let offsets = vec![0f64; n];
        let weights = vec![1f64; n];
        let data = GlmData {
            y: &y,
            offsets: &offsets,
            covariate: None,
            weights: &weights,
        };
        let start = EmissionParams::zinb(0.0, 1.0, 0.0, 0);
        let fit = fit_weighted_zinb(&data, &start, 100, 1e-8);
        let alpha = fit.params.zero_infl.unwrap();
        let target = (rho / (1.0 - rho)).ln();
        assert!((alpha - target).abs() < 0.3, "alpha {}", alpha);
        assert!((fit.params.coef[0] - mu.ln()).abs() < 0.1);
    }
}
