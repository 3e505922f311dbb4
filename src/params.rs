use anyhow::{Result, bail};

/// Whether the descend-gate of a best-first search requires both conditions
/// (failure budget and likelihood margin) or either one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRule {
    Strict,
    Relaxed,
}

impl StopRule {
    pub fn allows(self, within_failures: bool, within_lh: bool) -> bool {
        match self {
            StopRule::Strict => within_failures && within_lh,
            StopRule::Relaxed => within_failures || within_lh,
        }
    }
}

/// Numeric thresholds governing the search, threaded explicitly through every
/// public operation.
#[derive(Debug, Clone)]
pub struct Params {
    /// Weight of a concrete mismatch vs one ambiguous site in the initial
    /// taxon ordering.
    pub hamming_weight: f64,
    /// Probabilities below this are treated as zero in ambiguous vectors.
    pub threshold_prob: f64,
    /// Absolute floor for deciding a recomputed list differs from its cache.
    pub thresh_diff_update: f64,
    /// Fold-change floor for the same decision.
    pub thresh_diff_fold_update: f64,

    pub min_blength_factor: f64,
    pub max_blength_factor: f64,
    pub min_blength_mid_factor: f64,

    pub failure_limit_sample: u32,
    pub failure_limit_subtree: u32,
    pub failure_limit_subtree_short_search: u32,
    pub thresh_log_lh_sample: f64,
    pub thresh_log_lh_subtree: f64,
    pub thresh_log_lh_subtree_short_search: f64,
    pub thresh_log_lh_failure: f64,
    pub stop_rule_sample: StopRule,
    pub stop_rule_subtree: StopRule,
    pub stop_rule_subtree_short_search: StopRule,

    /// Placements between consecutive pseudocount-based rate re-estimations.
    pub mutation_update_period: u32,
    pub thresh_placement_cost: f64,
    pub thresh_placement_cost_short_search: f64,
    /// A full SPR pass improving the tree by less than this ends the search.
    pub thresh_entire_tree_improvement: f64,
    /// Cap on alternating SPR / branch-length rounds.
    pub max_improvement_rounds: u32,

    pub progress: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            hamming_weight: 1000.0,
            threshold_prob: 1e-8,
            thresh_diff_update: 1e-7,
            thresh_diff_fold_update: 1.001,
            min_blength_factor: 0.2,
            max_blength_factor: 40.0,
            min_blength_mid_factor: 4.1,
            failure_limit_sample: 5,
            failure_limit_subtree: 4,
            failure_limit_subtree_short_search: 1,
            thresh_log_lh_sample: 200.0,
            thresh_log_lh_subtree: 160.0,
            thresh_log_lh_subtree_short_search: 40.0,
            thresh_log_lh_failure: 0.01,
            stop_rule_sample: StopRule::Relaxed,
            stop_rule_subtree: StopRule::Relaxed,
            stop_rule_subtree_short_search: StopRule::Strict,
            mutation_update_period: 25,
            thresh_placement_cost: -1e-5,
            thresh_placement_cost_short_search: -1.0,
            thresh_entire_tree_improvement: 1.0,
            max_improvement_rounds: 5,
            progress: true,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<()> {
        if self.hamming_weight < 0.0 {
            bail!("hamming weight must be >= 0");
        }
        if self.threshold_prob <= 0.0 {
            bail!("probability threshold must be > 0");
        }
        if self.min_blength_factor <= 0.0 || self.max_blength_factor <= self.min_blength_factor {
            bail!("branch length factors must satisfy 0 < min < max");
        }
        if self.mutation_update_period == 0 {
            bail!("mutation update period must be > 0");
        }
        Ok(())
    }

    /// Branch-length bounds derived from the genome length.
    pub fn blength_thresholds(&self, genome_length: usize) -> BlengthThresholds {
        let inv_len = 1.0 / genome_length as f64;
        let min_blength = self.min_blength_factor * inv_len;
        BlengthThresholds {
            default_blength: inv_len,
            min_blength,
            max_blength: self.max_blength_factor * inv_len,
            min_blength_mid: self.min_blength_mid_factor * inv_len,
            min_blength_sensitivity: min_blength * 1e-5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlengthThresholds {
    pub default_blength: f64,
    pub min_blength: f64,
    pub max_blength: f64,
    pub min_blength_mid: f64,
    pub min_blength_sensitivity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_valid() {
        Params::default().validate().expect("defaults must validate");
    }

    #[test]
    fn thresholds_scale_with_genome_length() {
        let t = Params::default().blength_thresholds(1000);
        assert_eq!(t.default_blength, 1e-3);
        assert!(t.min_blength < t.default_blength);
        assert!(t.max_blength > t.default_blength);
        assert!(t.min_blength_mid > t.default_blength);
    }

    #[test]
    fn stop_rules_gate_as_configured() {
        assert!(StopRule::Relaxed.allows(false, true));
        assert!(!StopRule::Strict.allows(false, true));
        assert!(StopRule::Strict.allows(true, true));
    }
}
