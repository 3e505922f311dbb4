//! Placement cost evaluation.
//!
//! Both functions walk the shared segments of a parent-side list and a
//! candidate list and accumulate the log-likelihood difference of attaching
//! the candidate at branch length `blength`, relative to not attaching it.
//! The sample variant is used while building the tree (the candidate is a
//! leaf's compressed diff, so its ambiguous vectors are soft one-hots and the
//! dominant-entry shortcut applies); the subtree variant is used by SPR moves
//! and always takes full inner products.

use crate::model::SubstModel;
use crate::region::{RegionList, RegionType, next_shared_segment};
use crate::utils::{
    LOG_MAX_POSITIVE, MAX_POSITIVE, MIN_CARRY_OVER, MIN_NEGATIVE, MIN_POSITIVE, dot,
};

struct CostAcc {
    lh_cost: f64,
    factor: f64,
}

impl CostAcc {
    fn new() -> Self {
        Self {
            lh_cost: 0.0,
            factor: 1.0,
        }
    }

    /// Rescale the running product before it underflows. Returns false when
    /// the product is already indistinguishable from zero.
    #[inline]
    fn rescue(&mut self) -> bool {
        if self.factor <= MIN_CARRY_OVER {
            if self.factor < MIN_POSITIVE {
                return false;
            }
            self.factor *= MAX_POSITIVE;
            self.lh_cost -= LOG_MAX_POSITIVE;
        }
        true
    }

    fn finish(self) -> f64 {
        self.lh_cost + self.factor.ln()
    }
}

/// Cost of appending a new sample below `parent` (an upper view: a node's
/// total or mid-branch list) at branch length `blength`.
pub fn sample_placement_cost<const S: usize>(
    parent: &RegionList<S>,
    sample: &RegionList<S>,
    blength: f64,
    ref_seq: &[u8],
    model: &SubstModel<S>,
) -> f64 {
    let genome_length = ref_seq.len();
    let blength = blength.max(0.0);
    let a = parent.regions();
    let b = sample.regions();
    let (mut ia, mut ib, mut pos) = (0usize, 0usize, 0usize);
    let mut acc = CostAcc::new();

    while pos < genome_length {
        let end = next_shared_segment(pos, a, b, &mut ia, &mut ib);
        let r1 = &a[ia];
        let r2 = &b[ib];
        if r1.kind.is_gap() || r2.kind.is_gap() {
            pos = end + 1;
            continue;
        }

        match (r1.kind.is_concrete(), r2.kind) {
            // parent R/state vs sample identical R/state
            (true, _) if r2.kind.is_concrete() && r1.kind == r2.kind => {
                let total = blength
                    + r1.plength_to_node.unwrap_or(0.0)
                    + r1.plength_to_root.unwrap_or(0.0);
                match r1.kind {
                    RegionType::Ref => acc.lh_cost += total * model.span_rate(pos, end),
                    RegionType::State(s) => acc.lh_cost += model.diagonal[s as usize] * total,
                    _ => unreachable!(),
                }
            }
            (true, RegionType::Ambiguous) => {
                let s1 = r1.kind.resolve(ref_seq[end]);
                let lh2 = r2.lh();
                if let Some(pr) = r1.plength_to_root {
                    let p2n = r1.plength_to_node.unwrap_or(0.0);
                    let b_root = blength + pr;
                    if lh2[s1 as usize] > 0.1 {
                        acc.lh_cost += model.diagonal[s1 as usize] * (b_root + p2n);
                    } else {
                        let mut tot = 0.0;
                        for i in 0..S {
                            let through_root = model.freq_weighted_transposed[s1 as usize][i] * p2n
                                + if i == s1 as usize { model.freqs[i] } else { 0.0 };
                            let onward = dot(&model.mutation[i], lh2);
                            tot += through_root * b_root * onward
                                + if lh2[i] > 0.1 { through_root } else { 0.0 };
                        }
                        acc.factor *= tot * model.inv_freqs[s1 as usize];
                    }
                } else {
                    let total = blength + r1.plength_to_node.unwrap_or(0.0);
                    if lh2[s1 as usize] > 0.1 {
                        acc.lh_cost += model.diagonal[s1 as usize] * total;
                    } else {
                        acc.factor *= dot(model.q_row(s1), lh2) * total;
                    }
                }
            }
            (true, _) => {
                // parent R/state vs a different sample state
                let s1 = r1.kind.resolve(ref_seq[end]);
                let s2 = r2.kind.resolve(ref_seq[end]);
                if let Some(pr) = r1.plength_to_root {
                    let p2n = r1.plength_to_node.unwrap_or(0.0);
                    let down = model.mutation[s1 as usize][s2 as usize]
                        * (blength + pr)
                        * (1.0 + model.diagonal[s1 as usize] * p2n);
                    let up = model.flux_ratio[s2 as usize][s1 as usize]
                        * p2n
                        * (1.0 + model.diagonal[s2 as usize] * (blength + pr));
                    acc.factor *= down + up;
                } else {
                    let total = blength + r1.plength_to_node.unwrap_or(0.0);
                    acc.factor *= model.mutation[s1 as usize][s2 as usize] * total;
                }
            }
            (false, RegionType::Ambiguous) => {
                let lh1 = r1.lh();
                let lh2 = r2.lh();
                let total = r1.total_plength_with(blength);
                let mut tot = 0.0;
                for i in 0..S {
                    let onward = total * dot(&model.mutation[i], lh2);
                    tot += (onward + if lh2[i] > 0.1 { 1.0 } else { 0.0 }) * lh1[i];
                }
                acc.factor *= tot;
            }
            (false, _) => {
                // parent ambiguous vs sample R/state
                let lh1 = r1.lh();
                let s2 = r2.kind.resolve(ref_seq[end]);
                let total = r1.total_plength_with(blength);
                let toward = dot(model.qt_row(s2), lh1);
                acc.factor *= lh1[s2 as usize] + total * toward;
            }
        }

        if !acc.rescue() {
            return MIN_NEGATIVE;
        }
        pos = end + 1;
    }
    acc.finish()
}

/// Cost of attaching an entire subtree (its full lower list) below `parent`
/// at branch length `blength`. `blength < 0` means a zero-length attachment.
pub fn subtree_placement_cost<const S: usize>(
    parent: &RegionList<S>,
    subtree: &RegionList<S>,
    blength: f64,
    ref_seq: &[u8],
    model: &SubstModel<S>,
) -> f64 {
    let genome_length = ref_seq.len();
    let a = parent.regions();
    let b = subtree.regions();
    let (mut ia, mut ib, mut pos) = (0usize, 0usize, 0usize);
    let mut acc = CostAcc::new();

    while pos < genome_length {
        let end = next_shared_segment(pos, a, b, &mut ia, &mut ib);
        let r1 = &a[ia];
        let r2 = &b[ib];
        if r1.kind.is_gap() || r2.kind.is_gap() {
            pos = end + 1;
            continue;
        }

        // total length from the parent-side observation down to the subtree
        let mut total = match (r1.plength_to_root, r1.plength_to_node) {
            (Some(pr), _) => pr + blength.max(0.0),
            (None, Some(pn)) => pn + blength.max(0.0),
            (None, None) => blength,
        };
        if let Some(pn2) = r2.plength_to_node {
            total = total.max(0.0) + pn2;
        }

        match (r1.kind.is_concrete(), r2.kind) {
            (true, _) if r2.kind.is_concrete() && r1.kind == r2.kind => {
                let mut total = total;
                if r1.plength_to_root.is_some() {
                    total += r1.plength_to_node.unwrap_or(0.0);
                }
                if total > 0.0 {
                    match r1.kind {
                        RegionType::Ref => acc.lh_cost += total * model.span_rate(pos, end),
                        RegionType::State(s) => acc.lh_cost += model.diagonal[s as usize] * total,
                        _ => unreachable!(),
                    }
                }
            }
            (true, RegionType::Ambiguous) => {
                let s1 = r1.kind.resolve(ref_seq[end]);
                let lh2 = r2.lh();
                if r1.plength_to_root.is_some() {
                    let p2n = r1.plength_to_node.unwrap_or(0.0);
                    let mut tot = 0.0;
                    for i in 0..S {
                        let through_root = model.freq_weighted_transposed[s1 as usize][i] * p2n
                            + if i == s1 as usize { model.freqs[i] } else { 0.0 };
                        let onward = if total > 0.0 {
                            total * dot(&model.mutation[i], lh2)
                        } else {
                            0.0
                        };
                        tot += through_root * (lh2[i] + onward);
                    }
                    acc.factor *= tot * model.inv_freqs[s1 as usize];
                } else {
                    let onward = if total > 0.0 {
                        total * dot(model.q_row(s1), lh2)
                    } else {
                        0.0
                    };
                    acc.factor *= onward + lh2[s1 as usize];
                }
            }
            (true, _) => {
                let s1 = r1.kind.resolve(ref_seq[end]);
                let s2 = r2.kind.resolve(ref_seq[end]);
                if r1.plength_to_root.is_some() {
                    let p2n = r1.plength_to_node.unwrap_or(0.0);
                    if total > 0.0 {
                        let down = model.mutation[s1 as usize][s2 as usize]
                            * total
                            * (1.0 + model.diagonal[s1 as usize] * p2n);
                        let up = model.flux_ratio[s2 as usize][s1 as usize]
                            * p2n
                            * (1.0 + model.diagonal[s2 as usize] * total);
                        acc.factor *= down + up;
                    } else {
                        acc.factor *= model.flux_ratio[s2 as usize][s1 as usize] * p2n;
                    }
                } else if total > 0.0 {
                    acc.factor *= model.mutation[s1 as usize][s2 as usize] * total;
                } else {
                    return MIN_NEGATIVE;
                }
            }
            (false, RegionType::Ambiguous) => {
                let lh1 = r1.lh();
                let lh2 = r2.lh();
                if total > 0.0 {
                    let mut tot = 0.0;
                    for i in 0..S {
                        tot += lh1[i] * (lh2[i] + total * dot(&model.mutation[i], lh2));
                    }
                    acc.factor *= tot;
                } else {
                    acc.factor *= dot(lh1, lh2);
                }
            }
            (false, _) => {
                let lh1 = r1.lh();
                let s2 = r2.kind.resolve(ref_seq[end]);
                if total > 0.0 {
                    acc.factor *= lh1[s2 as usize] + total * dot(model.qt_row(s2), lh1);
                } else {
                    acc.factor *= lh1[s2 as usize];
                }
            }
        }

        if !acc.rescue() {
            return MIN_NEGATIVE;
        }
        pos = end + 1;
    }
    acc.finish()
}

/// Halve the candidate branch length while doing so keeps improving the cost.
/// Returns true when a shorter length won.
pub fn try_shorter_lengths(
    cost: impl Fn(f64) -> f64,
    best_blength: &mut f64,
    best_lh: &mut f64,
    short_thresh: f64,
) -> bool {
    let mut found = false;
    let mut new_blength = *best_blength;
    while *best_blength > short_thresh {
        new_blength *= 0.5;
        let placement_cost = cost(new_blength);
        if placement_cost > *best_lh {
            *best_lh = placement_cost;
            *best_blength = new_blength;
            found = true;
        } else {
            break;
        }
    }
    found
}

/// Double the candidate branch length while doing so keeps improving the cost.
pub fn try_longer_lengths(
    cost: impl Fn(f64) -> f64,
    best_blength: &mut f64,
    best_lh: &mut f64,
    long_thresh: f64,
) {
    let mut new_blength = *best_blength;
    while *best_blength < long_thresh {
        new_blength += new_blength;
        let placement_cost = cost(new_blength);
        if placement_cost > *best_lh {
            *best_lh = placement_cost;
            *best_blength = new_blength;
        } else {
            break;
        }
    }
}

/// Full new-branch length search: shorter halvings, longer doublings when the
/// halvings fail, and a final zero-length check. A best length `<= 0` means
/// "attach with no branch".
pub fn estimate_new_branch_length(
    cost: impl Fn(f64) -> f64,
    start_lh: f64,
    best_blength: &mut f64,
    long_thresh: f64,
    short_thresh: f64,
) {
    let mut best_lh = start_lh;
    let found = try_shorter_lengths(&cost, best_blength, &mut best_lh, short_thresh);
    if !found {
        try_longer_lengths(&cost, best_blength, &mut best_lh, long_thresh);
    }
    if *best_blength < short_thresh {
        let zero_lh = cost(0.0);
        if zero_lh > best_lh {
            *best_blength = -1.0;
        }
    }
}
