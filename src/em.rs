//! The EM orchestrator: alternate forward-backward inference with GLM
//! refits and transition updates until the log-likelihood settles.
//!
//! Two guards keep the loop honest. M-step updates that would *decrease*
//! the log-likelihood are rejected block by block until monotonicity is
//! restored (reverting every block reproduces the previous iterate, so
//! the invariant always holds). And when pruning is enabled, at most one
//! mixture component is removed per iteration, the smallest one sitting
//! below the threshold, after which EM warm-restarts from the current
//! parameters.
use crate::data::{Dataset, RealMatrix};
use crate::emission::{fit_weighted_nb, fit_weighted_zinb, GlmData};
use crate::error::{Error, Result};
use crate::forward_backward;
use crate::model::{Hmm, Mode, ParamTable, Role};
use crate::{logsumexp, EP};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// Minimum required improvement on the likelihood. The exact value only
// matters for telling numerical wobble from a genuine regression.
const MIN_UP: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    /// Negative binomial background.
    Nb,
    /// Zero-inflated negative binomial background.
    Zinb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub max_iters: usize,
    /// Relative log-likelihood change that counts as converged.
    pub tolerance: f64,
    /// Mixture components below this weight get pruned; `None` disables
    /// pruning altogether.
    pub pruning_threshold: Option<f64>,
    pub distribution: Distribution,
    /// Log per-iteration progress at info level.
    pub verbose: bool,
    pub glm_max_iters: usize,
    pub glm_tolerance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iters: 100,
            tolerance: 1e-4,
            pruning_threshold: Some(1e-3),
            distribution: Distribution::Nb,
            verbose: false,
            glm_max_iters: 50,
            glm_tolerance: 1e-6,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_iters == 0 {
            return Err(Error::InvalidConfig("max_iters must be at least 1".into()));
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(Error::InvalidConfig("tolerance must be positive".into()));
        }
        if let Some(threshold) = self.pruning_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(Error::InvalidConfig(format!(
                    "pruning threshold {} is outside [0, 1]",
                    threshold
                )));
            }
        }
        if self.glm_max_iters == 0 || !(self.glm_tolerance > 0.0) {
            return Err(Error::InvalidConfig(
                "GLM iteration cap and tolerance must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// One component removal, for the caller's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneEvent {
    pub iteration: usize,
    /// Arena index of the removed component; indices stay stable.
    pub component: usize,
    pub pattern: u32,
    /// Its mixing proportion at removal time.
    pub weight: f64,
    /// Log-likelihood and BIC of the model right after removal.
    pub loglik: f64,
    pub bic: f64,
}

/// Everything a fit produces. Posteriors and parameters are final; the
/// diagnostics say how much to trust them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    pub mode: Mode,
    pub n_states: usize,
    pub params: ParamTable,
    pub mixture: Option<crate::mixture::MixtureSet>,
    pub transition: Vec<f64>,
    pub initial: Vec<f64>,
    /// Windows x states posterior probabilities; rows sum to one.
    pub posteriors: RealMatrix,
    /// Windows x components posterior, conditional on the differential
    /// state; pruned components hold zero. Differential mode only.
    pub component_posteriors: Option<RealMatrix>,
    pub loglik: f64,
    pub loglik_trace: Vec<f64>,
    pub iterations: usize,
    /// False when the iteration cap was reached before the tolerance.
    /// The estimates are still the best available.
    pub converged: bool,
    pub prune_events: Vec<PruneEvent>,
    /// M-step updates rejected for decreasing the likelihood.
    pub rejected_updates: usize,
    /// Per-role GLM fits that hit their iteration cap.
    pub glm_failures: usize,
}

impl FitReport {
    pub fn bic(&self) -> f64 {
        let n = self.posteriors.rows().max(1);
        -2.0 * self.loglik + self.n_free() as f64 * (n as f64).ln()
    }
    fn n_free(&self) -> usize {
        let s = self.n_states;
        let mut p = self.params.background().n_free()
            + self.params.enrichment().n_free()
            + s * (s - 1)
            + (s - 1);
        if let Some(mix) = &self.mixture {
            p += mix.n_live().saturating_sub(1);
        }
        p
    }
}

/// Flattened per-(window, sample) regression inputs; constant across
/// iterations, so built once.
struct GlmPool {
    y: Vec<f64>,
    offsets: Vec<f64>,
    covariate: Option<Vec<f64>>,
}

impl GlmPool {
    fn build(dataset: &Dataset) -> Self {
        let t = dataset.windows();
        let counts = dataset.counts();
        let mut y = Vec::with_capacity(t * dataset.samples());
        for w in 0..t {
            y.extend(counts.row(w).iter().map(|&c| c as f64));
        }
        Self {
            y,
            offsets: dataset.offsets().values().to_vec(),
            covariate: dataset.control().map(|m| m.values().to_vec()),
        }
    }
}

/// The E-step's output: posteriors plus the sufficient statistics the
/// M-step consumes.
struct EStep {
    loglik: f64,
    post: RealMatrix,
    comp_post: Option<RealMatrix>,
    trans_counts: Vec<f64>,
    first_post: Vec<f64>,
}

fn safe_ln(x: f64) -> f64 {
    if x > 0.0 {
        x.ln()
    } else {
        EP
    }
}

/// Full E-step: role densities per (window, sample), state emissions
/// (the differential state marginalizes its mixture), then forward-
/// backward per chromosome.
fn compute_estep(dataset: &Dataset, hmm: &Hmm) -> EStep {
    let t = dataset.windows();
    let ns = dataset.samples();
    let s = hmm.n_states;
    let counts = dataset.counts();
    let offsets = dataset.offsets();
    let control = dataset.control();
    let bg = hmm.params.background();
    let en = hmm.params.enrichment();
    let mut bdens = RealMatrix::zeros(t, ns);
    let mut edens = RealMatrix::zeros(t, ns);
    bdens
        .values_mut()
        .par_chunks_mut(ns)
        .zip(edens.values_mut().par_chunks_mut(ns))
        .enumerate()
        .for_each(|(w, (brow, erow))| {
            for j in 0..ns {
                let y = counts.get(w, j);
                let o = offsets.get(w, j);
                let c = control.map(|m| m.get(w, j));
                brow[j] = bg.log_density(y, o, c);
                erow[j] = en.log_density(y, o, c);
            }
        });
    let mut log_emit = RealMatrix::zeros(t, s);
    let mut comp_post = None;
    match hmm.mixture.as_ref() {
        None => {
            log_emit
                .values_mut()
                .par_chunks_mut(s)
                .enumerate()
                .for_each(|(w, row)| {
                    row[0] = bdens.row(w).iter().sum();
                    row[1] = edens.row(w).iter().sum();
                });
        }
        Some(mix) => {
            let g = mix.n_conditions();
            let k_arena = mix.len();
            let cond_of: Vec<usize> = (0..ns).map(|j| dataset.design().condition_of(j)).collect();
            let mut cp = RealMatrix::zeros(t, k_arena);
            log_emit
                .values_mut()
                .par_chunks_mut(s)
                .zip(cp.values_mut().par_chunks_mut(k_arena))
                .enumerate()
                .for_each(|(w, (srow, crow))| {
                    let brow = bdens.row(w);
                    let erow = edens.row(w);
                    // Per-condition partial sums; every component is a
                    // selection among these.
                    let mut bc = vec![0f64; g];
                    let mut ec = vec![0f64; g];
                    for j in 0..ns {
                        bc[cond_of[j]] += brow[j];
                        ec[cond_of[j]] += erow[j];
                    }
                    srow[0] = bc.iter().sum();
                    srow[2] = ec.iter().sum();
                    let mut lp = vec![EP; k_arena];
                    for (k, comp) in mix.live() {
                        let mut v = safe_ln(comp.weight);
                        for c in 0..g {
                            v += if comp.enriches(c) { ec[c] } else { bc[c] };
                        }
                        lp[k] = v;
                    }
                    let total = logsumexp(&lp);
                    srow[1] = total;
                    for (slot, &v) in crow.iter_mut().zip(lp.iter()) {
                        *slot = if v <= EP { 0.0 } else { (v - total).exp() };
                    }
                });
            comp_post = Some(cp);
        }
    }
    let log_trans: Vec<f64> = hmm.transition.iter().map(|&x| safe_ln(x)).collect();
    let log_init: Vec<f64> = hmm.initial.iter().map(|&x| safe_ln(x)).collect();
    let mut post = RealMatrix::zeros(t, s);
    let stats = forward_backward::run_chromosomes(
        &log_emit,
        counts.spans(),
        &log_trans,
        &log_init,
        &mut post,
    );
    EStep {
        loglik: stats.loglik,
        post,
        comp_post,
        trans_counts: stats.trans_counts,
        first_post: stats.first_post,
    }
}

/// Per-(window, sample) case weights of each role. In differential mode
/// the middle state splits between the roles according to the sample's
/// condition and the conditional component posteriors.
fn role_weights(hmm: &Hmm, estep: &EStep, cond_of: &[usize]) -> (Vec<f64>, Vec<f64>) {
    let t = estep.post.rows();
    let ns = cond_of.len();
    let mut wb = vec![0f64; t * ns];
    let mut we = vec![0f64; t * ns];
    match (hmm.mixture.as_ref(), estep.comp_post.as_ref()) {
        (None, _) => {
            for w in 0..t {
                let p0 = estep.post.get(w, 0);
                let p1 = estep.post.get(w, 1);
                for j in 0..ns {
                    wb[w * ns + j] = p0;
                    we[w * ns + j] = p1;
                }
            }
        }
        (Some(mix), Some(cp)) => {
            let g = mix.n_conditions();
            for w in 0..t {
                let crow = cp.row(w);
                let mut enriched_share = vec![0f64; g];
                for (k, comp) in mix.live() {
                    for (c, share) in enriched_share.iter_mut().enumerate() {
                        if comp.enriches(c) {
                            *share += crow[k];
                        }
                    }
                }
                let p0 = estep.post.get(w, 0);
                let p1 = estep.post.get(w, 1);
                let p2 = estep.post.get(w, 2);
                for j in 0..ns {
                    let share = enriched_share[cond_of[j]].clamp(0.0, 1.0);
                    wb[w * ns + j] = p0 + p1 * (1.0 - share);
                    we[w * ns + j] = p2 + p1 * share;
                }
            }
        }
        _ => unreachable!("differential E-step always carries component posteriors"),
    }
    (wb, we)
}

/// M-step: Baum-Welch chain updates, mixture proportions, then the two
/// shared GLM refits side by side. Returns how many fits hit their cap.
fn m_step(
    hmm: &mut Hmm,
    config: &Config,
    pool: &GlmPool,
    estep: &EStep,
    cond_of: &[usize],
) -> usize {
    let s = hmm.n_states;
    for from in 0..s {
        let row = &estep.trans_counts[from * s..(from + 1) * s];
        let total: f64 = row.iter().sum();
        if total > 0.0 {
            for to in 0..s {
                hmm.transition[from * s + to] = row[to] / total;
            }
        }
    }
    let total: f64 = estep.first_post.iter().sum();
    if total > 0.0 {
        for (slot, &x) in hmm.initial.iter_mut().zip(estep.first_post.iter()) {
            *slot = x / total;
        }
    }
    if let (Some(mix), Some(cp)) = (hmm.mixture.as_mut(), estep.comp_post.as_ref()) {
        let mut numer = vec![0f64; mix.len()];
        let mut denom = 0f64;
        for w in 0..estep.post.rows() {
            let p1 = estep.post.get(w, 1);
            denom += p1;
            for (slot, &c) in numer.iter_mut().zip(cp.row(w).iter()) {
                *slot += p1 * c;
            }
        }
        if denom > 1e-12 {
            let live: Vec<usize> = mix.live().map(|(k, _)| k).collect();
            for k in live {
                mix.set_weight(k, numer[k] / denom);
            }
            mix.renormalize();
        }
    }
    let (wb, we) = role_weights(hmm, estep, cond_of);
    let bg_start = hmm.params.background().clone();
    let en_start = hmm.params.enrichment().clone();
    let covariate = pool.covariate.as_deref();
    let bg_data = GlmData {
        y: &pool.y,
        offsets: &pool.offsets,
        covariate,
        weights: &wb,
    };
    let en_data = GlmData {
        y: &pool.y,
        offsets: &pool.offsets,
        covariate,
        weights: &we,
    };
    let (bg_fit, en_fit) = rayon::join(
        || match config.distribution {
            Distribution::Nb => {
                fit_weighted_nb(&bg_data, &bg_start, config.glm_max_iters, config.glm_tolerance)
            }
            Distribution::Zinb => {
                fit_weighted_zinb(&bg_data, &bg_start, config.glm_max_iters, config.glm_tolerance)
            }
        },
        || fit_weighted_nb(&en_data, &en_start, config.glm_max_iters, config.glm_tolerance),
    );
    let mut failures = 0;
    for (fit, role) in [(&bg_fit, "background"), (&en_fit, "enrichment")] {
        if !fit.status.converged {
            failures += 1;
            log::warn!(
                "{} GLM hit its iteration cap after {} steps; keeping the last iterate",
                role,
                fit.status.iterations
            );
        }
    }
    *hmm.params.get_mut(Role::Background) = bg_fit.params;
    *hmm.params.get_mut(Role::Enrichment) = en_fit.params;
    failures
}

const BLOCK_NAMES: [&str; 5] = [
    "mixture weights",
    "transition matrix",
    "zero inflation",
    "enrichment GLM",
    "background GLM",
];

fn revert_block(hmm: &mut Hmm, prev: &Hmm, block: usize) {
    match block {
        0 => hmm.mixture = prev.mixture.clone(),
        1 => {
            hmm.transition = prev.transition.clone();
            hmm.initial = prev.initial.clone();
        }
        2 => {
            hmm.params.get_mut(Role::Background).zero_infl = prev.params.background().zero_infl
        }
        3 => *hmm.params.get_mut(Role::Enrichment) = prev.params.enrichment().clone(),
        4 => *hmm.params.get_mut(Role::Background) = prev.params.background().clone(),
        _ => unreachable!(),
    }
}

fn n_free(hmm: &Hmm) -> usize {
    let s = hmm.n_states;
    let mut p = hmm.params.background().n_free()
        + hmm.params.enrichment().n_free()
        + s * (s - 1)
        + (s - 1);
    if let Some(mix) = &hmm.mixture {
        p += mix.n_live().saturating_sub(1);
    }
    p
}

fn bic_of(hmm: &Hmm, loglik: f64, n_windows: usize) -> f64 {
    -2.0 * loglik + n_free(hmm) as f64 * (n_windows.max(1) as f64).ln()
}

/// The full EM loop. Configuration is validated by the caller; nothing
/// in here is fatal.
pub(crate) fn run(dataset: &Dataset, config: &Config, mut hmm: Hmm) -> FitReport {
    let t = dataset.windows();
    let pool = GlmPool::build(dataset);
    let cond_of: Vec<usize> = (0..dataset.samples())
        .map(|j| dataset.design().condition_of(j))
        .collect();
    let mut estep = compute_estep(dataset, &hmm);
    let mut trace = vec![estep.loglik];
    let mut converged = false;
    let mut rejected_updates = 0;
    let mut glm_failures = 0;
    let mut prune_events = vec![];
    let mut iterations = 0;
    for it in 1..=config.max_iters {
        iterations = it;
        let prev_loglik = estep.loglik;
        let prev_hmm = hmm.clone();
        glm_failures += m_step(&mut hmm, config, &pool, &estep, &cond_of);
        let mut next = compute_estep(dataset, &hmm);
        if next.loglik + MIN_UP < prev_loglik {
            rejected_updates += 1;
            log::warn!(
                "iteration {}: log-likelihood fell from {:.4} to {:.4}; rejecting updates",
                it,
                prev_loglik,
                next.loglik
            );
            for (block, name) in BLOCK_NAMES.iter().enumerate() {
                revert_block(&mut hmm, &prev_hmm, block);
                next = compute_estep(dataset, &hmm);
                if next.loglik + MIN_UP >= prev_loglik {
                    log::debug!("iteration {}: recovered after reverting {}", it, name);
                    break;
                }
            }
        }
        estep = next;
        trace.push(estep.loglik);
        if config.verbose {
            log::info!("EM iteration {}: log-likelihood {:.6}", it, estep.loglik);
        }
        let pruned = match (config.pruning_threshold, hmm.mixture.as_mut()) {
            (Some(threshold), Some(mix)) => mix.prune_smallest(threshold),
            _ => None,
        };
        if let Some((component, weight)) = pruned {
            let pattern = hmm.mixture.as_ref().unwrap().components()[component].pattern;
            // Warm restart: recompute under the reduced mixture and skip
            // the convergence check for this iteration.
            estep = compute_estep(dataset, &hmm);
            let bic = bic_of(&hmm, estep.loglik, t);
            if config.verbose {
                log::info!(
                    "iteration {}: pruned component {} (pattern {:#b}, pi {:.5}); BIC {:.2}",
                    it,
                    component,
                    pattern,
                    weight,
                    bic
                );
            }
            prune_events.push(PruneEvent {
                iteration: it,
                component,
                pattern,
                weight,
                loglik: estep.loglik,
                bic,
            });
            continue;
        }
        let denom = prev_loglik.abs().max(1.0);
        if (estep.loglik - prev_loglik).abs() / denom < config.tolerance {
            converged = true;
            break;
        }
    }
    if !converged {
        log::warn!(
            "EM stopped at the iteration cap ({}) without meeting the tolerance",
            config.max_iters
        );
    }
    FitReport {
        mode: hmm.mode,
        n_states: hmm.n_states,
        loglik: estep.loglik,
        params: hmm.params,
        mixture: hmm.mixture,
        transition: hmm.transition,
        initial: hmm.initial,
        posteriors: estep.post,
        component_posteriors: estep.comp_post,
        loglik_trace: trace,
        iterations,
        converged,
        prune_events,
        rejected_updates,
        glm_failures,
    }
}
