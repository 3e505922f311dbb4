//! Branch-length estimation from analytic derivatives.
//!
//! Over one branch, each shared segment contributes either a linear term k·t
//! to the log-likelihood (matching concrete states) or a term log(a + b·t)
//! (mixed cases). One walk collects the linear coefficient sum and, for every
//! log term, the ratio a/b; the optimum then solves
//! K + Σ_j 1/(c_j + t) = 0 by bracketed bisection.

use crate::model::SubstModel;
use crate::params::BlengthThresholds;
use crate::region::{Region, RegionList, RegionType, next_shared_segment};
use crate::utils::dot;

/// Σ_j 1/(c_j + t).
fn derivative(coefficients: &[f64], t: f64) -> f64 {
    coefficients.iter().map(|c| 1.0 / (c + t)).sum()
}

/// Estimate the length of the branch between a parent upper-lower view and a
/// child lower list. Returns a length `<= 0` when the optimum is a zero-length
/// branch, and the configured cap when the likelihood keeps growing with t.
pub fn estimate_branch_length<const S: usize>(
    parent: &RegionList<S>,
    child: &RegionList<S>,
    ref_seq: &[u8],
    model: &SubstModel<S>,
    thresholds: &BlengthThresholds,
) -> f64 {
    let genome_length = ref_seq.len();
    let a = parent.regions();
    let b = child.regions();
    let (mut ia, mut ib, mut pos) = (0usize, 0usize, 0usize);

    let mut linear = 0.0f64;
    let mut coefficients =
        Vec::with_capacity(parent.count_shared_segments(child, genome_length).min(64));

    while pos < genome_length {
        let end = next_shared_segment(pos, a, b, &mut ia, &mut ib);
        let r1 = &a[ia];
        let r2 = &b[ib];
        if r1.kind.is_gap() || r2.kind.is_gap() {
            pos = end + 1;
            continue;
        }

        // constant offset already accumulated on either side of the branch
        let mut offset = r1
            .plength_to_root
            .or(r1.plength_to_node)
            .unwrap_or(0.0);
        if let Some(pn2) = r2.plength_to_node {
            offset += pn2;
        }

        match (r1.kind, r2.kind) {
            (RegionType::Ref, RegionType::Ref) => linear += model.span_rate(pos, end),
            (k1, k2) if k1.is_concrete() && k1 == k2 => {
                let s = k1.resolve(ref_seq[end]);
                linear += model.diagonal[s as usize];
            }
            (k1, RegionType::Ambiguous) if k1.is_concrete() => {
                concrete_vs_ambiguous(r1, r2, offset, ref_seq[end], model, &mut linear, &mut coefficients);
            }
            (RegionType::Ambiguous, _) => {
                ambiguous_vs_any(r1, r2, offset, ref_seq[end], model, &mut linear, &mut coefficients);
            }
            _ => {
                // two different concrete states
                concrete_vs_concrete(r1, r2, offset, ref_seq[end], model, &mut coefficients);
            }
        }
        pos = end + 1;
    }

    solve(linear, &coefficients, thresholds)
}

/// Parent concrete (possibly root-crossed), child ambiguous: the log term's
/// value and slope at t = 0.
fn concrete_vs_ambiguous<const S: usize>(
    r1: &Region<S>,
    r2: &Region<S>,
    offset: f64,
    ref_state: u8,
    model: &SubstModel<S>,
    linear: &mut f64,
    coefficients: &mut Vec<f64>,
) {
    let s1 = r1.kind.resolve(ref_state);
    let lh2 = r2.lh();
    let mut coeff0;
    let mut coeff1 = 0.0;

    if r1.plength_to_root.is_some() {
        // through_root already carries the π weighting, so the bracket sums
        // are the finished value and slope at t = 0
        let p2n = r1.plength_to_node.unwrap_or(0.0);
        coeff0 = 0.0;
        for i in 0..S {
            let through_root = model.freq_weighted_transposed[s1 as usize][i] * p2n
                + if i == s1 as usize { model.freqs[i] } else { 0.0 };
            coeff0 += through_root * lh2[i];
            coeff1 += through_root * dot(&model.mutation[i], lh2);
        }
    } else {
        coeff0 = lh2[s1 as usize];
        coeff1 = dot(model.q_row(s1), lh2);
    }

    if offset > 0.0 {
        coeff0 += coeff1 * offset;
    }
    if coeff1 < 0.0 {
        *linear += coeff1 / coeff0;
    } else {
        coefficients.push(coeff0 / coeff1);
    }
}

/// Parent ambiguous, child ambiguous or concrete.
fn ambiguous_vs_any<const S: usize>(
    r1: &Region<S>,
    r2: &Region<S>,
    offset: f64,
    ref_state: u8,
    model: &SubstModel<S>,
    linear: &mut f64,
    coefficients: &mut Vec<f64>,
) {
    let lh1 = r1.lh();
    let mut coeff0 = 0.0;
    let mut coeff1 = 0.0;

    if r2.kind == RegionType::Ambiguous {
        let lh2 = r2.lh();
        for i in 0..S {
            coeff0 += lh1[i] * lh2[i];
            coeff1 += lh1[i] * dot(&model.mutation[i], lh2);
        }
    } else {
        let s2 = r2.kind.resolve(ref_state);
        coeff0 = lh1[s2 as usize];
        coeff1 = dot(model.qt_row(s2), lh1);
    }

    if offset > 0.0 {
        coeff0 += coeff1 * offset;
    }
    if coeff1 < 0.0 {
        *linear += coeff1 / coeff0;
    } else {
        coefficients.push(coeff0 / coeff1);
    }
}

/// Two different concrete states: a pure log(q·t) term, possibly shifted by
/// the root-crossing correction.
fn concrete_vs_concrete<const S: usize>(
    r1: &Region<S>,
    r2: &Region<S>,
    offset: f64,
    ref_state: u8,
    model: &SubstModel<S>,
    coefficients: &mut Vec<f64>,
) {
    let s1 = r1.kind.resolve(ref_state);
    let s2 = r2.kind.resolve(ref_state);

    if r1.plength_to_root.is_some() {
        let p2n = r1.plength_to_node.unwrap_or(0.0);
        let coeff1 = model.freqs[s1 as usize] * model.mutation[s1 as usize][s2 as usize];
        let mut coeff0 =
            model.freqs[s2 as usize] * model.mutation[s2 as usize][s1 as usize] * p2n;
        if offset > 0.0 {
            coeff0 += coeff1 * offset;
        }
        coefficients.push(coeff0 / coeff1);
    } else {
        coefficients.push(if offset > 0.0 { offset } else { 0.0 });
    }
}

/// Root-find ℓ'(t) = K + Σ 1/(c_j + t) = 0 for t ≥ 0.
fn solve(linear: f64, coefficients: &[f64], thresholds: &BlengthThresholds) -> f64 {
    let target = -linear;
    if coefficients.is_empty() {
        return -1.0;
    }
    if target <= 0.0 {
        // derivative is positive for every t: saturate at the cap
        return thresholds.max_blength;
    }
    let sensitivity = thresholds.min_blength_sensitivity;
    let min_c = coefficients.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_c = coefficients
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);

    let n_over_target = coefficients.len() as f64 / target;
    let mut t_down = n_over_target - min_c;
    if t_down <= 0.0 {
        return 0.0;
    }
    let mut t_up = n_over_target - max_c;
    if t_up < 0.0 {
        t_up = if min_c > 0.0 { 0.0 } else { sensitivity };
    }
    let derivative_up = derivative(coefficients, t_up);
    if derivative_up < target - sensitivity && t_up == 0.0 {
        return 0.0;
    }

    while t_down - t_up > sensitivity {
        let t_mid = 0.5 * (t_up + t_down);
        if derivative(coefficients, t_mid) > target {
            t_up = t_mid;
        } else {
            t_down = t_mid;
        }
    }
    t_up
}
