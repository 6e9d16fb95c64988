//! Model assembly: pick the topology the design calls for, wire the
//! shared emission parameters, seed everything from the initializer, and
//! hand off to the EM orchestrator.
use crate::data::{ChromSpan, Dataset, RealMatrix};
use crate::em::{self, Config, Distribution, FitReport};
use crate::emission::EmissionParams;
use crate::error::{Error, Result};
use crate::init::{Initializer, QuantileSplit};
use crate::mixture::MixtureSet;
use serde::{Deserialize, Serialize};

/// Which of the two shared parameter sets a sample is using at a given
/// state or mixture pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Background,
    Enrichment,
}

/// The role -> parameters indirection. Top-level states and every mixture
/// component look their parameters up here, so a single refit updates all
/// usages at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTable {
    background: EmissionParams,
    enrichment: EmissionParams,
}

impl ParamTable {
    pub fn new(background: EmissionParams, enrichment: EmissionParams) -> Self {
        Self {
            background,
            enrichment,
        }
    }
    pub fn get(&self, role: Role) -> &EmissionParams {
        match role {
            Role::Background => &self.background,
            Role::Enrichment => &self.enrichment,
        }
    }
    pub(crate) fn get_mut(&mut self, role: Role) -> &mut EmissionParams {
        match role {
            Role::Background => &mut self.background,
            Role::Enrichment => &mut self.enrichment,
        }
    }
    pub fn background(&self) -> &EmissionParams {
        self.get(Role::Background)
    }
    pub fn enrichment(&self) -> &EmissionParams {
        self.get(Role::Enrichment)
    }
}

impl std::fmt::Display for ParamTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "background: {}", self.background)?;
        write!(f, "enrichment: {}", self.enrichment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Consensus,
    Differential,
}

impl Mode {
    pub fn n_states(self) -> usize {
        match self {
            Mode::Consensus => 2,
            Mode::Differential => 3,
        }
    }
}

/// The assembled model the EM loop mutates: shared emission parameters,
/// the mixture arena (differential only), and the chain parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Hmm {
    pub mode: Mode,
    pub n_states: usize,
    pub params: ParamTable,
    pub mixture: Option<MixtureSet>,
    /// Row-stochastic, row-major from-state x to-state.
    pub transition: Vec<f64>,
    pub initial: Vec<f64>,
}

/// Consensus peak calling with the default quantile-split initializer.
pub fn fit_consensus(dataset: &Dataset, config: &Config) -> Result<FitReport> {
    fit_consensus_with(dataset, config, &QuantileSplit::default())
}

pub fn fit_consensus_with(
    dataset: &Dataset,
    config: &Config,
    initializer: &dyn Initializer,
) -> Result<FitReport> {
    config.validate()?;
    let hmm = assemble(dataset, config, Mode::Consensus, initializer)?;
    Ok(em::run(dataset, config, hmm))
}

/// Differential peak calling across two or more conditions with the
/// default quantile-split initializer.
pub fn fit_differential(dataset: &Dataset, config: &Config) -> Result<FitReport> {
    fit_differential_with(dataset, config, &QuantileSplit::default())
}

pub fn fit_differential_with(
    dataset: &Dataset,
    config: &Config,
    initializer: &dyn Initializer,
) -> Result<FitReport> {
    config.validate()?;
    let hmm = assemble(dataset, config, Mode::Differential, initializer)?;
    Ok(em::run(dataset, config, hmm))
}

fn assemble(
    dataset: &Dataset,
    config: &Config,
    mode: Mode,
    initializer: &dyn Initializer,
) -> Result<Hmm> {
    let g = dataset.design().n_conditions();
    let mixture = match mode {
        Mode::Consensus => None,
        Mode::Differential => {
            if g < 2 {
                return Err(Error::TooFewConditions(g));
            }
            if g > 16 {
                return Err(Error::InvalidConfig(format!(
                    "{} conditions would need {} mixture components",
                    g,
                    (1u64 << g) - 2
                )));
            }
            Some(MixtureSet::enumerate(g))
        }
    };
    let n_states = mode.n_states();
    let seed = initializer.initialize(dataset, n_states, config.distribution)?;
    if seed.posteriors.rows() != dataset.windows() || seed.posteriors.cols() != n_states {
        return Err(Error::DimensionMismatch {
            context: "Initializer::initialize",
            unit: "posterior cells",
            expected: dataset.windows() * n_states,
            found: seed.posteriors.rows() * seed.posteriors.cols(),
        });
    }
    let mut params = seed.params;
    coerce_roles(&mut params, dataset, config.distribution)?;
    let (transition, initial) =
        chain_from_posteriors(&seed.posteriors, dataset.counts().spans(), n_states);
    Ok(Hmm {
        mode,
        n_states,
        params,
        mixture,
        transition,
        initial,
    })
}

/// Make the seeded parameters fit the requested topology: coefficient
/// length matches the covariate, zero inflation sits on the background
/// role exactly when ZINB was asked for.
fn coerce_roles(
    params: &mut ParamTable,
    dataset: &Dataset,
    distribution: Distribution,
) -> Result<()> {
    let n_coef = 1 + usize::from(dataset.control().is_some());
    for role in [Role::Background, Role::Enrichment] {
        let p = params.get_mut(role);
        if p.coef.is_empty() {
            return Err(Error::InvalidConfig(
                "initializer produced an empty coefficient vector".into(),
            ));
        }
        p.coef.resize(n_coef, 0.0);
        p.dispersion = p
            .dispersion
            .clamp(crate::emission::MIN_DISPERSION, crate::emission::MAX_DISPERSION);
    }
    params.get_mut(Role::Enrichment).zero_infl = None;
    let background = params.get_mut(Role::Background);
    background.zero_infl = match distribution {
        Distribution::Nb => None,
        Distribution::Zinb => Some(background.zero_infl.unwrap_or(-2.0)),
    };
    Ok(())
}

/// Seed the chain from the initializer's posteriors: hard-label each
/// window, count transitions with a pseudocount, and normalize.
fn chain_from_posteriors(
    posteriors: &RealMatrix,
    spans: &[ChromSpan],
    n_states: usize,
) -> (Vec<f64>, Vec<f64>) {
    let s = n_states;
    let argmax = |row: &[f64]| -> usize {
        row.iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap_or(0)
    };
    let mut trans = vec![1f64; s * s];
    let mut initial = vec![0.5f64; s];
    for span in spans {
        let mut prev = argmax(posteriors.row(span.start));
        initial[prev] += 1.0;
        for window in span.start + 1..span.end {
            let label = argmax(posteriors.row(window));
            trans[prev * s + label] += 1.0;
            prev = label;
        }
    }
    for row in trans.chunks_exact_mut(s) {
        let total: f64 = row.iter().sum();
        row.iter_mut().for_each(|x| *x /= total);
    }
    let total: f64 = initial.iter().sum();
    initial.iter_mut().for_each(|x| *x /= total);
    (trans, initial)
}
