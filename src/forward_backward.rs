//! Log-space forward-backward recursions over the genomic windows of one
//! chromosome, and the fan-out that runs every chromosome in parallel.
//!
//! Chromosomes are independent: no transition crosses a boundary, each
//! starts from the initial distribution. Everything is computed in log
//! space; genome-scale tracks easily underflow otherwise.
use crate::data::{ChromSpan, RealMatrix};
use crate::{logsumexp, EP};
use rayon::prelude::*;

/// Sufficient statistics of one E-step, merged across chromosomes before
/// the M-step touches anything.
#[derive(Debug, Clone)]
pub(crate) struct ChromStats {
    pub loglik: f64,
    /// Expected transition counts, row-major from-state x to-state.
    pub trans_counts: Vec<f64>,
    /// Summed posterior of the first window of each chromosome.
    pub first_post: Vec<f64>,
}

impl ChromStats {
    pub fn zeros(n_states: usize) -> Self {
        Self {
            loglik: 0f64,
            trans_counts: vec![0f64; n_states * n_states],
            first_post: vec![0f64; n_states],
        }
    }
    pub fn merge(&mut self, other: &Self) {
        self.loglik += other.loglik;
        self.trans_counts
            .iter_mut()
            .zip(other.trans_counts.iter())
            .for_each(|(x, y)| *x += y);
        self.first_post
            .iter_mut()
            .zip(other.first_post.iter())
            .for_each(|(x, y)| *x += y);
    }
}

/// Forward-backward over one chromosome. `log_emit` is row-major windows
/// x states for this chromosome only; posteriors land in `post` (same
/// shape), normalized per window.
pub(crate) fn forward_backward(
    log_emit: &[f64],
    n_states: usize,
    log_trans: &[f64],
    log_init: &[f64],
    post: &mut [f64],
) -> ChromStats {
    let s = n_states;
    assert!(!log_emit.is_empty() && log_emit.len() % s == 0);
    assert_eq!(post.len(), log_emit.len());
    let t_len = log_emit.len() / s;
    let mut fwd = vec![EP; t_len * s];
    let mut bwd = vec![0f64; t_len * s];
    let mut tmp = vec![EP; s];
    for state in 0..s {
        fwd[state] = log_init[state] + log_emit[state];
    }
    for t in 1..t_len {
        for to in 0..s {
            for (from, slot) in tmp.iter_mut().enumerate() {
                *slot = fwd[(t - 1) * s + from] + log_trans[from * s + to];
            }
            fwd[t * s + to] = logsumexp(&tmp) + log_emit[t * s + to];
        }
    }
    let loglik = logsumexp(&fwd[(t_len - 1) * s..]);
    for t in (0..t_len - 1).rev() {
        for from in 0..s {
            for (to, slot) in tmp.iter_mut().enumerate() {
                *slot = log_trans[from * s + to] + log_emit[(t + 1) * s + to] + bwd[(t + 1) * s + to];
            }
            bwd[t * s + from] = logsumexp(&tmp);
        }
    }
    for t in 0..t_len {
        let row = &mut post[t * s..(t + 1) * s];
        for state in 0..s {
            row[state] = (fwd[t * s + state] + bwd[t * s + state] - loglik).exp();
        }
        let total: f64 = row.iter().sum();
        if total > 0.0 {
            row.iter_mut().for_each(|x| *x /= total);
        }
    }
    let mut stats = ChromStats::zeros(s);
    stats.loglik = loglik;
    stats.first_post.copy_from_slice(&post[..s]);
    for t in 0..t_len - 1 {
        for from in 0..s {
            for to in 0..s {
                let lp = fwd[t * s + from]
                    + log_trans[from * s + to]
                    + log_emit[(t + 1) * s + to]
                    + bwd[(t + 1) * s + to]
                    - loglik;
                stats.trans_counts[from * s + to] += lp.exp();
            }
        }
    }
    stats
}

/// Run forward-backward on every chromosome in parallel and merge the
/// sufficient statistics. Posterior rows are written in place; the
/// reduce is the join barrier before the M-step.
pub(crate) fn run_chromosomes(
    log_emit: &RealMatrix,
    spans: &[ChromSpan],
    log_trans: &[f64],
    log_init: &[f64],
    post: &mut RealMatrix,
) -> ChromStats {
    let s = log_emit.cols();
    assert_eq!(post.cols(), s);
    assert_eq!(post.rows(), log_emit.rows());
    let mut chunks = Vec::with_capacity(spans.len());
    let mut rest = post.values_mut();
    for span in spans {
        let (chunk, tail) = rest.split_at_mut(span.len() * s);
        chunks.push(chunk);
        rest = tail;
    }
    spans
        .par_iter()
        .zip(chunks.into_par_iter())
        .map(|(span, chunk)| {
            let emit = &log_emit.values()[span.start * s..span.end * s];
            forward_backward(emit, s, log_trans, log_init, chunk)
        })
        .reduce(
            || ChromStats::zeros(s),
            |mut acc, stats| {
                acc.merge(&stats);
                acc
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ChromSpan;

    fn ln_all(xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|x| x.ln()).collect()
    }

    /// Total likelihood by summing over every state path explicitly.
    fn brute_force_loglik(
        log_emit: &[f64],
        s: usize,
        log_trans: &[f64],
        log_init: &[f64],
    ) -> f64 {
        let t_len = log_emit.len() / s;
        let n_paths = s.pow(t_len as u32);
        let mut terms = vec![];
        for mut code in 0..n_paths {
            let mut path = vec![];
            for _ in 0..t_len {
                path.push(code % s);
                code /= s;
            }
            let mut lp = log_init[path[0]] + log_emit[path[0]];
            for t in 1..t_len {
                lp += log_trans[path[t - 1] * s + path[t]] + log_emit[t * s + path[t]];
            }
            terms.push(lp);
        }
        crate::logsumexp(&terms)
    }

    #[test]
    fn matches_brute_force_enumeration() {
        let s = 2;
        let log_trans = ln_all(&[0.9, 0.1, 0.2, 0.8]);
        let log_init = ln_all(&[0.6, 0.4]);
        let log_emit = ln_all(&[0.5, 0.1, 0.2, 0.6, 0.4, 0.4, 0.1, 0.9]);
        let mut post = vec![0f64; log_emit.len()];
        let stats = forward_backward(&log_emit, s, &log_trans, &log_init, &mut post);
        let brute = brute_force_loglik(&log_emit, s, &log_trans, &log_init);
        assert!((stats.loglik - brute).abs() < 1e-10);
        for row in post.chunks_exact(s) {
            let total: f64 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
        // Expected transition counts total T - 1.
        let total: f64 = stats.trans_counts.iter().sum();
        assert!((total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn posterior_follows_a_dominant_emission() {
        let s = 2;
        let log_trans = ln_all(&[0.5, 0.5, 0.5, 0.5]);
        let log_init = ln_all(&[0.5, 0.5]);
        // With flat transitions the posterior is driven by the emissions.
        let log_emit = ln_all(&[0.99, 0.01, 0.01, 0.99, 0.99, 0.01]);
        let mut post = vec![0f64; log_emit.len()];
        forward_backward(&log_emit, s, &log_trans, &log_init, &mut post);
        assert!(post[0] > 0.95);
        assert!(post[3] > 0.95);
        assert!(post[4] > 0.95);
    }

    #[test]
    fn chromosomes_do_not_leak_into_each_other() {
        let s = 2;
        let log_trans = ln_all(&[0.99, 0.01, 0.01, 0.99]);
        let log_init = ln_all(&[0.5, 0.5]);
        // One chromosome pinned to state 0, the other to state 1; sticky
        // transitions must not carry state 0 across the boundary.
        let values = ln_all(&[0.9, 0.1, 0.9, 0.1, 0.1, 0.9, 0.1, 0.9]);
        let log_emit = RealMatrix::from_vec(values, s).unwrap();
        let spans = vec![ChromSpan::new("chr1", 0, 2), ChromSpan::new("chr2", 2, 4)];
        let mut post = RealMatrix::zeros(4, s);
        let stats = run_chromosomes(&log_emit, &spans, &log_trans, &log_init, &mut post);
        assert!(post.get(1, 0) > 0.8);
        assert!(post.get(2, 1) > 0.8);
        // First-window posteriors are summed over both chromosomes.
        let total: f64 = stats.first_post.iter().sum();
        assert!((total - 2.0).abs() < 1e-9);
        // And the merged log-likelihood equals the sum of the parts.
        let mut lone = vec![0f64; 4];
        let a = forward_backward(&log_emit.values()[..4], s, &log_trans, &log_init, &mut lone);
        let b = forward_backward(&log_emit.values()[4..], s, &log_trans, &log_init, &mut lone);
        assert!((stats.loglik - (a.loglik + b.loglik)).abs() < 1e-9);
    }
}
