//! The combinatorial mixture nested inside the differential state.
//!
//! Each component is one non-trivial subset of the conditions, encoded as
//! a bitmask: bit c set means condition c uses the enrichment parameters,
//! clear means background. Components live in a fixed arena with a live
//! flag so that indices stay stable across pruning for logging and for
//! the reported posterior matrix; pruned components never come back.
use crate::data::Design;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternComponent {
    /// Bitmask over condition indices; bit set = enriched.
    pub pattern: u32,
    /// Mixing proportion; live components sum to one.
    pub weight: f64,
    pub live: bool,
}

impl PatternComponent {
    pub fn enriches(&self, condition: usize) -> bool {
        self.pattern >> condition & 1 == 1
    }
    /// Human-readable pattern, e.g. "treatA+treatC".
    pub fn label(&self, design: &Design) -> String {
        let names: Vec<_> = (0..design.n_conditions())
            .filter(|&c| self.enriches(c))
            .map(|c| design.condition_name(c))
            .collect();
        names.join("+")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureSet {
    components: Vec<PatternComponent>,
    n_conditions: usize,
}

impl MixtureSet {
    /// All non-empty, non-full condition subsets, in ascending bitmask
    /// order, with uniform starting weights. 2^G - 2 of them.
    pub fn enumerate(n_conditions: usize) -> Self {
        assert!((2..=20).contains(&n_conditions));
        let full = (1u32 << n_conditions) - 1;
        let uniform = 1.0 / (full - 1) as f64;
        let components = (1..full)
            .map(|pattern| PatternComponent {
                pattern,
                weight: uniform,
                live: true,
            })
            .collect();
        Self {
            components,
            n_conditions,
        }
    }
    /// Arena size, pruned components included.
    pub fn len(&self) -> usize {
        self.components.len()
    }
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
    pub fn n_conditions(&self) -> usize {
        self.n_conditions
    }
    pub fn n_live(&self) -> usize {
        self.components.iter().filter(|c| c.live).count()
    }
    pub fn components(&self) -> &[PatternComponent] {
        &self.components
    }
    pub fn live(&self) -> impl Iterator<Item = (usize, &PatternComponent)> {
        self.components
            .iter()
            .enumerate()
            .filter(|(_, c)| c.live)
    }
    pub(crate) fn set_weight(&mut self, index: usize, weight: f64) {
        debug_assert!(self.components[index].live);
        self.components[index].weight = weight;
    }
    /// Rescale live weights to sum to one.
    pub(crate) fn renormalize(&mut self) {
        let total: f64 = self.live().map(|(_, c)| c.weight).sum();
        if total <= 0.0 {
            let n = self.n_live().max(1);
            let uniform = 1.0 / n as f64;
            for c in self.components.iter_mut().filter(|c| c.live) {
                c.weight = uniform;
            }
        } else {
            for c in self.components.iter_mut().filter(|c| c.live) {
                c.weight /= total;
            }
        }
    }
    /// Smallest live weight and its arena index.
    pub fn min_live(&self) -> Option<(usize, f64)> {
        self.live()
            .map(|(k, c)| (k, c.weight))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
    }
    /// Remove the single smallest live component if it falls below the
    /// threshold, then renormalize. Removing down to one component is the
    /// degenerate end of pruning, so a lone survivor is left alone.
    pub(crate) fn prune_smallest(&mut self, threshold: f64) -> Option<(usize, f64)> {
        if self.n_live() <= 1 {
            return None;
        }
        let (index, weight) = self.min_live()?;
        if weight >= threshold {
            return None;
        }
        self.components[index].live = false;
        self.components[index].weight = 0.0;
        self.renormalize();
        Some((index, weight))
    }
}

impl std::fmt::Display for MixtureSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (k, c) in self.live() {
            writeln!(f, "component {}: pattern {:#b}, pi {:.4}", k, c.pattern, c.weight)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_conditions_make_six_components() {
        let mix = MixtureSet::enumerate(3);
        assert_eq!(mix.len(), 6);
        assert_eq!(mix.n_live(), 6);
        let total: f64 = mix.live().map(|(_, c)| c.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
        // Patterns are every mask except 0 and 0b111.
        let patterns: Vec<u32> = mix.components().iter().map(|c| c.pattern).collect();
        assert_eq!(patterns, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn pattern_roles_follow_the_bitmask() {
        let mix = MixtureSet::enumerate(2);
        let only_first = &mix.components()[0];
        assert!(only_first.enriches(0));
        assert!(!only_first.enriches(1));
        let design = Design::new(&[("a", 1), ("b", 1)]).unwrap();
        assert_eq!(only_first.label(&design), "a");
    }

    #[test]
    fn pruning_removes_exactly_the_smallest() {
        let mut mix = MixtureSet::enumerate(3);
        let weights = [0.4, 0.3, 0.15, 0.1, 0.03, 0.02];
        for (k, w) in weights.iter().enumerate() {
            mix.set_weight(k, *w);
        }
        // Two components are below threshold, but one check removes one.
        let (removed, weight) = mix.prune_smallest(0.05).unwrap();
        assert_eq!(removed, 5);
        assert!((weight - 0.02).abs() < 1e-12);
        assert_eq!(mix.n_live(), 5);
        let total: f64 = mix.live().map(|(_, c)| c.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(!mix.components()[5].live);
        // The next check catches the runner-up.
        let (removed, _) = mix.prune_smallest(0.05).unwrap();
        assert_eq!(removed, 4);
    }

    #[test]
    fn pruning_stops_above_threshold_and_at_one_survivor() {
        let mut mix = MixtureSet::enumerate(2);
        assert!(mix.prune_smallest(0.3).is_none());
        mix.set_weight(0, 0.99);
        mix.set_weight(1, 0.01);
        assert!(mix.prune_smallest(0.05).is_some());
        assert_eq!(mix.n_live(), 1);
        // A lone survivor is never pruned, whatever the threshold.
        assert!(mix.prune_smallest(1.0).is_none());
        assert_eq!(mix.n_live(), 1);
    }
}
