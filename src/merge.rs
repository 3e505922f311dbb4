//! Merge kernels combining two region lists across a branch.
//!
//! `merge_upper_lower` joins a parent-side (upper) view with a child-side
//! (lower) view; `merge_two_lowers` joins two child-side views and can return
//! the log-likelihood contribution of the join in the same pass. Both use the
//! linearized transition approximation exp(Qt) ≈ I + Qt, which is what makes
//! single-pass run-length merging possible for closely related sequences.
//!
//! A `None` result is a null merge: the operands contradict each other across
//! a zero total distance. Callers recover per the zero-length repair policy.

use crate::model::SubstModel;
use crate::region::{Region, RegionList, RegionType, next_shared_segment};
use crate::utils::{LOG_MAX_POSITIVE, MAX_POSITIVE, MIN_CARRY_OVER, MIN_NEGATIVE, normalize_by};

/// out[i] = prior[i] + t · Σ_j rows[i][j] · prior[j]; plain copy when t ≤ 0.
#[inline]
fn evolve_rows<const S: usize>(rows: &[[f64; S]; S], prior: &[f64; S], t: f64) -> [f64; S] {
    let mut out = *prior;
    if t > 0.0 {
        for i in 0..S {
            out[i] += t * crate::utils::dot(&rows[i], prior);
        }
    }
    out
}

/// out[i] = π_i · (prior[i] + t · Σ_j q_ij · prior[j]); returns (out, Σ out).
#[inline]
fn mix_with_root<const S: usize>(
    model: &SubstModel<S>,
    prior: &[f64; S],
    t: f64,
) -> ([f64; S], f64) {
    let mut out = evolve_rows(&model.mutation, prior, t);
    let mut sum = 0.0;
    for i in 0..S {
        out[i] *= model.freqs[i];
        sum += out[i];
    }
    (out, sum)
}

/// lh[i] *= other[i] + t · Σ_j q_ij · other[j]; returns the new sum.
#[inline]
fn mult_evolve<const S: usize>(
    lh: &mut [f64; S],
    other: &[f64; S],
    model: &SubstModel<S>,
    t: f64,
) -> f64 {
    let evolved = evolve_rows(&model.mutation, other, t);
    let mut sum = 0.0;
    for i in 0..S {
        lh[i] *= evolved[i];
        sum += lh[i];
    }
    sum
}

/// lh[i] *= δ_{i,state} + t · row[i]; returns the new sum.
#[inline]
fn mult_by_state<const S: usize>(lh: &mut [f64; S], state: u8, row: &[f64; S], t: f64) -> f64 {
    let mut sum = 0.0;
    for i in 0..S {
        let indicator = if i == state as usize { 1.0 } else { 0.0 };
        lh[i] *= indicator + t * row[i];
        sum += lh[i];
    }
    sum
}

/// Keep only `state` in `lh`, returning the surviving mass.
#[inline]
fn restrict_to_state<const S: usize>(lh: &mut [f64; S], state: u8) -> f64 {
    let kept = lh[state as usize];
    *lh = [0.0; S];
    lh[state as usize] = kept;
    kept
}

/// out[i] = δ_{i,state} + t · row[i].
#[inline]
fn one_hot_evolved<const S: usize>(state: u8, row: &[f64; S], t: f64) -> [f64; S] {
    let mut out = [0.0; S];
    for i in 0..S {
        out[i] = t * row[i];
    }
    out[state as usize] += 1.0;
    out
}

#[inline]
fn normalized_kind(kind: RegionType) -> RegionType {
    if kind.is_gap() { RegionType::Gap } else { kind }
}

/// Merge a parent-side (upper) list across `upper_blength` with a child-side
/// (lower) list across `lower_blength` into the composite view at the join.
pub fn merge_upper_lower<const S: usize>(
    upper: &RegionList<S>,
    upper_blength: f64,
    lower: &RegionList<S>,
    lower_blength: f64,
    ref_seq: &[u8],
    model: &SubstModel<S>,
    threshold_prob: f64,
) -> Option<RegionList<S>> {
    let genome_length = ref_seq.len();
    let a = upper.regions();
    let b = lower.regions();
    let mut out = RegionList::with_capacity(upper.count_shared_segments(lower, genome_length));
    let (mut ia, mut ib, mut pos) = (0usize, 0usize, 0usize);

    while pos < genome_length {
        let end = next_shared_segment(pos, a, b, &mut ia, &mut ib);
        let r1 = &a[ia];
        let r2 = &b[ib];
        let k1 = normalized_kind(r1.kind);
        let k2 = normalized_kind(r2.kind);

        match (k1, k2) {
            (RegionType::Gap, RegionType::Gap) => out.0.push(Region::new(RegionType::Gap, end)),
            (RegionType::Gap, RegionType::Ambiguous) => {
                // nothing above constrains this run: mix the child posterior
                // with the root frequencies
                let total = r2.total_plength_with(lower_blength).max(0.0);
                let (mut lh, sum) = mix_with_root(model, r2.lh(), total);
                normalize_by(&mut lh, sum);
                out.0.push(Region::ambiguous(end, Box::new(lh)));
            }
            (RegionType::Gap, _) => {
                let (p2n, p2r) = match r2.plength_to_node {
                    Some(p) => (Some(p + lower_blength.max(0.0)), Some(0.0)),
                    None if lower_blength > 0.0 => (Some(lower_blength), Some(0.0)),
                    None => (None, None),
                };
                out.push_coalescing(r2.kind, p2n, p2r, end, threshold_prob);
            }
            (RegionType::Ambiguous, RegionType::Gap) => {
                let total = match r1.plength_to_node {
                    Some(p) => p + upper_blength.max(0.0),
                    None => upper_blength,
                };
                if total > 0.0 {
                    let mut lh = evolve_rows(&model.transposed, r1.lh(), total);
                    let sum: f64 = lh.iter().sum();
                    normalize_by(&mut lh, sum);
                    out.0.push(Region::ambiguous(end, Box::new(lh)));
                } else {
                    out.0.push(Region::ambiguous(end, Box::new(*r1.lh())));
                }
            }
            (_, RegionType::Gap) => {
                let (p2n, p2r) = match (r1.plength_to_root, r1.plength_to_node) {
                    (Some(pr), pn) => (pn, Some(pr + upper_blength.max(0.0))),
                    (None, Some(pn)) => (Some(pn + upper_blength.max(0.0)), None),
                    (None, None) if upper_blength > 0.0 => (Some(upper_blength), None),
                    (None, None) => (None, None),
                };
                out.push_coalescing(r1.kind, p2n, p2r, end, threshold_prob);
            }
            _ if k1 == k2 && k1.is_concrete() => {
                out.push_coalescing(k1, None, None, end, threshold_prob);
            }
            _ => {
                let total1 = match r1.plength_to_node {
                    Some(p) => {
                        let mut t = p + upper_blength.max(0.0);
                        if k1 != RegionType::Ambiguous {
                            t += r1.plength_to_root.unwrap_or(0.0);
                        }
                        t
                    }
                    None => upper_blength,
                };
                let total2 = r2.total_plength_with(lower_blength);

                // zero total distance forces the output onto the concrete side
                if k2.is_concrete() && total2 <= 0.0 {
                    if k1.is_concrete() && total1 <= 0.0 {
                        return None;
                    }
                    out.push_coalescing(k2, None, None, end, threshold_prob);
                } else if k1.is_concrete() && total1 <= 0.0 {
                    out.push_coalescing(k1, None, None, end, threshold_prob);
                } else if k1 == RegionType::Ambiguous {
                    merge_ambiguous_any_upper(
                        r1, r2, total1, total2, end, ref_seq, model, threshold_prob, &mut out,
                    )?;
                } else {
                    merge_concrete_any_upper(
                        r1,
                        r2,
                        total1,
                        total2,
                        upper_blength,
                        end,
                        ref_seq,
                        model,
                        threshold_prob,
                        &mut out,
                    )?;
                }
            }
        }
        pos = end + 1;
    }
    Some(out)
}

/// Upper side is ambiguous; lower side is ambiguous or concrete.
#[allow(clippy::too_many_arguments)]
fn merge_ambiguous_any_upper<const S: usize>(
    r1: &Region<S>,
    r2: &Region<S>,
    total1: f64,
    total2: f64,
    end: usize,
    ref_seq: &[u8],
    model: &SubstModel<S>,
    threshold_prob: f64,
    out: &mut RegionList<S>,
) -> Option<()> {
    let mut lh = if total1 > 0.0 {
        evolve_rows(&model.transposed, r1.lh(), total1)
    } else {
        *r1.lh()
    };

    let sum = if normalized_kind(r2.kind) == RegionType::Ambiguous {
        mult_evolve(&mut lh, r2.lh(), model, total2)
    } else {
        let s2 = r2.kind.resolve(ref_seq[end]);
        if total2 > 0.0 {
            mult_by_state(&mut lh, s2, model.qt_row(s2), total2)
        } else {
            restrict_to_state(&mut lh, s2)
        }
    };
    if !(sum > 0.0) {
        return None;
    }
    normalize_by(&mut lh, sum);
    out.push_simplified(end, Box::new(lh), ref_seq[end], threshold_prob);
    Some(())
}

/// Upper side is concrete; lower side is ambiguous or a different concrete.
#[allow(clippy::too_many_arguments)]
fn merge_concrete_any_upper<const S: usize>(
    r1: &Region<S>,
    r2: &Region<S>,
    total1: f64,
    total2: f64,
    upper_blength: f64,
    end: usize,
    ref_seq: &[u8],
    model: &SubstModel<S>,
    threshold_prob: f64,
    out: &mut RegionList<S>,
) -> Option<()> {
    let s1 = r1.kind.resolve(ref_seq[end]);

    let mut lh = if let Some(pr) = r1.plength_to_root {
        // the observation passed through the root: seed with π, account for
        // the stretch from the observation to the root, then come back down
        let length_to_root = pr + upper_blength.max(0.0);
        let mut root_vec = model.freqs;
        mult_by_state(
            &mut root_vec,
            s1,
            model.qt_row(s1),
            r1.plength_to_node.unwrap_or(0.0),
        );
        evolve_rows(&model.transposed, &root_vec, length_to_root)
    } else if total1 > 0.0 {
        one_hot_evolved(s1, model.q_row(s1), total1)
    } else {
        let mut lh = [0.0; S];
        lh[s1 as usize] = 1.0;
        lh
    };

    let sum = if normalized_kind(r2.kind) == RegionType::Ambiguous {
        mult_evolve(&mut lh, r2.lh(), model, total2)
    } else {
        let s2 = r2.kind.resolve(ref_seq[end]);
        if total2 > 0.0 {
            mult_by_state(&mut lh, s2, model.qt_row(s2), total2)
        } else {
            restrict_to_state(&mut lh, s2)
        }
    };
    if !(sum > 0.0) {
        return None;
    }
    normalize_by(&mut lh, sum);
    out.push_simplified(end, Box::new(lh), ref_seq[end], threshold_prob);
    Some(())
}

/// Merge two child-side lists meeting at a node. Returns the merged list and,
/// when `want_log_lh` is set, the log-likelihood contribution of the join
/// (0.0 otherwise). `None` signals a null merge.
pub fn merge_two_lowers<const S: usize>(
    lower1: &RegionList<S>,
    blength1: f64,
    lower2: &RegionList<S>,
    blength2: f64,
    ref_seq: &[u8],
    model: &SubstModel<S>,
    threshold_prob: f64,
    want_log_lh: bool,
) -> Option<(RegionList<S>, f64)> {
    let genome_length = ref_seq.len();
    let a = lower1.regions();
    let b = lower2.regions();
    let mut out = RegionList::with_capacity(lower1.count_shared_segments(lower2, genome_length));
    let (mut ia, mut ib, mut pos) = (0usize, 0usize, 0usize);
    let mut log_lh = 0.0f64;
    let mut factor = 1.0f64;

    while pos < genome_length {
        let end = next_shared_segment(pos, a, b, &mut ia, &mut ib);
        let r1 = &a[ia];
        let r2 = &b[ib];
        let k1 = normalized_kind(r1.kind);
        let k2 = normalized_kind(r2.kind);

        if k1 == RegionType::Gap && k2 == RegionType::Gap {
            out.0.push(Region::new(RegionType::Gap, end));
        } else if k1 == RegionType::Gap {
            push_lower_through_gap(r2, blength2, end, threshold_prob, &mut out);
        } else if k2 == RegionType::Gap {
            push_lower_through_gap(r1, blength1, end, threshold_prob, &mut out);
        } else {
            let total1 = r1.total_plength_with(blength1);
            let total2 = r2.total_plength_with(blength2);

            if k1 == k2 && k1.is_concrete() {
                out.push_coalescing(k1, None, None, end, threshold_prob);
                if want_log_lh {
                    let t = total1.max(0.0) + total2.max(0.0);
                    match k1 {
                        RegionType::Ref => log_lh += t * model.span_rate(pos, end),
                        RegionType::State(s) => log_lh += model.diagonal[s as usize] * t,
                        _ => unreachable!(),
                    }
                }
            } else if k1.is_concrete() && k2.is_concrete() && total1 <= 0.0 && total2 <= 0.0 {
                // different states across zero distance
                return None;
            } else {
                let mut lh = if k1 == RegionType::Ambiguous {
                    if total1 > 0.0 {
                        evolve_rows(&model.mutation, r1.lh(), total1)
                    } else {
                        *r1.lh()
                    }
                } else {
                    let s1 = r1.kind.resolve(ref_seq[end]);
                    if total1 > 0.0 {
                        one_hot_evolved(s1, model.qt_row(s1), total1)
                    } else {
                        let mut lh = [0.0; S];
                        lh[s1 as usize] = 1.0;
                        lh
                    }
                };

                if k2 == RegionType::Ambiguous {
                    let sum = mult_evolve(&mut lh, r2.lh(), model, total2);
                    if !(sum > 0.0) {
                        return None;
                    }
                    normalize_by(&mut lh, sum);
                    out.push_simplified(end, Box::new(lh), ref_seq[end], threshold_prob);
                    factor *= sum;
                } else {
                    let s2 = r2.kind.resolve(ref_seq[end]);
                    if total2 > 0.0 {
                        let sum = mult_by_state(&mut lh, s2, model.qt_row(s2), total2);
                        if !(sum > 0.0) {
                            return None;
                        }
                        normalize_by(&mut lh, sum);
                        out.push_simplified(end, Box::new(lh), ref_seq[end], threshold_prob);
                        factor *= sum;
                    } else {
                        let kept = lh[s2 as usize];
                        if !(kept > 0.0) {
                            return None;
                        }
                        out.push_coalescing(r2.kind, None, None, end, threshold_prob);
                        factor *= kept;
                    }
                }
                if factor <= MIN_CARRY_OVER {
                    factor *= MAX_POSITIVE;
                    log_lh -= LOG_MAX_POSITIVE;
                }
            }
        }
        pos = end + 1;
    }

    let log_lh = if want_log_lh { log_lh + factor.ln() } else { 0.0 };
    Some((out, log_lh))
}

/// One side of a two-lowers merge is a gap: the other side passes through with
/// its observation distance stretched by the incident branch.
fn push_lower_through_gap<const S: usize>(
    r: &Region<S>,
    blength: f64,
    end: usize,
    threshold_prob: f64,
    out: &mut RegionList<S>,
) {
    let p2n = match r.plength_to_node {
        Some(p) if blength > 0.0 => Some(p + blength),
        Some(p) => Some(p),
        None if blength > 0.0 => Some(blength),
        None => None,
    };
    if normalized_kind(r.kind) == RegionType::Ambiguous {
        let mut region = Region::ambiguous(end, Box::new(*r.lh()));
        region.plength_to_node = p2n;
        out.0.push(region);
    } else {
        out.push_coalescing(r.kind, p2n, None, end, threshold_prob);
    }
}

/// The root's view of its own lower list: every informative run is mixed with
/// the root frequencies, concrete runs pick up the root-mixing marker.
pub fn total_lh_at_root<const S: usize>(
    lower: &RegionList<S>,
    model: &SubstModel<S>,
    blength: f64,
) -> RegionList<S> {
    let mut out = RegionList::with_capacity(lower.len());
    for r in lower.regions() {
        match normalized_kind(r.kind) {
            RegionType::Gap => {
                out.0.push(Region::with_plengths(
                    r.kind,
                    r.end,
                    r.plength_to_node,
                    r.plength_to_root,
                ));
            }
            RegionType::Ambiguous => {
                let total = r.total_plength_with(blength).max(0.0);
                let (mut lh, sum) = mix_with_root(model, r.lh(), total);
                normalize_by(&mut lh, sum);
                let mut region = Region::ambiguous(r.end, Box::new(lh));
                region.plength_to_node = r.plength_to_node;
                region.plength_to_root = r.plength_to_root;
                out.0.push(region);
            }
            _ => {
                let (p2n, p2r) = match r.plength_to_node {
                    Some(p) => (Some(p + blength.max(0.0)), Some(0.0)),
                    None if blength > 0.0 => (Some(blength), Some(0.0)),
                    None => (None, None),
                };
                out.0.push(Region::with_plengths(r.kind, r.end, p2n, p2r));
            }
        }
    }
    out
}

/// log P(lower | model) with the list viewed at the root.
pub fn absolute_lh_at_root<const S: usize>(lower: &RegionList<S>, model: &SubstModel<S>) -> f64 {
    let mut log_lh = 0.0f64;
    let mut factor = 1.0f64;
    let mut start = 0usize;

    for r in lower.regions() {
        match normalized_kind(r.kind) {
            RegionType::Ref => {
                for i in 0..S {
                    log_lh += model.log_freqs[i] * model.span_base(start, r.end, i) as f64;
                }
            }
            RegionType::State(s) => log_lh += model.log_freqs[s as usize],
            RegionType::Ambiguous => {
                factor *= crate::utils::dot(r.lh(), &model.freqs);
                if factor <= MIN_CARRY_OVER {
                    if factor <= 0.0 {
                        return MIN_NEGATIVE;
                    }
                    factor *= MAX_POSITIVE;
                    log_lh -= LOG_MAX_POSITIVE;
                }
            }
            RegionType::Gap => {}
            _ => unreachable!(),
        }
        start = r.end + 1;
    }
    log_lh + factor.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelKind;

    fn model(ref_seq: &[u8]) -> SubstModel<4> {
        SubstModel::new(ModelKind::Unrest, ref_seq).expect("model init failed")
    }

    fn all_ref(genome_length: usize) -> RegionList<4> {
        RegionList(vec![Region::new(RegionType::Ref, genome_length - 1)])
    }

    #[test]
    fn identical_lowers_merge_into_reference() {
        let ref_seq = [0u8, 1, 2, 3, 0, 1];
        let m = model(&ref_seq);
        let a = all_ref(6);
        let b = all_ref(6);
        let (merged, log_lh) =
            merge_two_lowers(&a, 1e-3, &b, 1e-3, &ref_seq, &m, 1e-8, true).expect("merge failed");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.regions()[0].kind, RegionType::Ref);
        // both children sit on positive branches, so staying identical costs
        let expected = 2e-3 * m.span_rate(0, 5);
        assert!((log_lh - expected).abs() < 1e-12);
    }

    #[test]
    fn two_lowers_is_symmetric() {
        let ref_seq = [0u8, 1, 2, 3, 0, 1, 2, 3];
        let m = model(&ref_seq);
        let a: RegionList<4> = RegionList(vec![
            Region::new(RegionType::State(2), 0),
            Region::new(RegionType::Ref, 7),
        ]);
        let b: RegionList<4> = RegionList(vec![
            Region::new(RegionType::Ref, 4),
            Region::new(RegionType::Gap, 6),
            Region::new(RegionType::Ref, 7),
        ]);
        let (ab, lh_ab) =
            merge_two_lowers(&a, 2e-3, &b, 1e-3, &ref_seq, &m, 1e-8, true).expect("merge failed");
        let (ba, lh_ba) =
            merge_two_lowers(&b, 1e-3, &a, 2e-3, &ref_seq, &m, 1e-8, true).expect("merge failed");
        assert_eq!(ab, ba);
        assert!((lh_ab - lh_ba).abs() < 1e-12);
    }

    #[test]
    fn conflicting_states_at_zero_distance_null_merge() {
        let ref_seq = [0u8, 1, 2, 3];
        let m = model(&ref_seq);
        let a: RegionList<4> = RegionList(vec![
            Region::new(RegionType::State(1), 0),
            Region::new(RegionType::Ref, 3),
        ]);
        let b: RegionList<4> = RegionList(vec![
            Region::new(RegionType::State(2), 0),
            Region::new(RegionType::Ref, 3),
        ]);
        assert!(merge_two_lowers(&a, 0.0, &b, 0.0, &ref_seq, &m, 1e-8, false).is_none());
        // any positive distance resolves the conflict
        assert!(merge_two_lowers(&a, 1e-3, &b, 0.0, &ref_seq, &m, 1e-8, false).is_some());
    }

    #[test]
    fn gap_side_passes_the_other_through() {
        let ref_seq = [0u8, 1, 2, 3];
        let m = model(&ref_seq);
        let a: RegionList<4> = RegionList(vec![Region::new(RegionType::Gap, 3)]);
        let b: RegionList<4> = RegionList(vec![
            Region::new(RegionType::State(3), 0),
            Region::new(RegionType::Ref, 3),
        ]);
        let (merged, _) =
            merge_two_lowers(&a, 0.0, &b, 5e-4, &ref_seq, &m, 1e-8, false).expect("merge failed");
        assert_eq!(merged.regions()[0].kind, RegionType::State(3));
        assert_eq!(merged.regions()[0].plength_to_node, Some(5e-4));
        assert_eq!(merged.regions()[1].kind, RegionType::Ref);
    }

    #[test]
    fn upper_lower_zero_distance_keeps_concrete_side() {
        let ref_seq = [0u8, 1, 2, 3];
        let m = model(&ref_seq);
        let upper = total_lh_at_root(&all_ref(4), &m, 0.0);
        let mut lower = all_ref(4);
        lower.0 = vec![
            Region::new(RegionType::State(2), 0),
            Region::new(RegionType::Ref, 3),
        ];
        let merged =
            merge_upper_lower(&upper, 1e-3, &lower, 0.0, &ref_seq, &m, 1e-8).expect("merge failed");
        assert_eq!(merged.regions()[0].kind, RegionType::State(2));
    }

    #[test]
    fn upper_lower_produces_ambiguity_on_positive_branches() {
        let ref_seq = [0u8, 1, 2, 3];
        let m = model(&ref_seq);
        let upper = total_lh_at_root(&all_ref(4), &m, 0.0);
        let lower: RegionList<4> = RegionList(vec![
            Region::new(RegionType::State(2), 0),
            Region::new(RegionType::Ref, 3),
        ]);
        let merged =
            merge_upper_lower(&upper, 1e-3, &lower, 1e-3, &ref_seq, &m, 1e-8).expect("merge failed");
        let first = &merged.regions()[0];
        assert_eq!(first.kind, RegionType::Ambiguous);
        let lh = first.lh();
        let sum: f64 = lh.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        // the mutation could sit above or below the join, so the mass splits
        // between the reference state and the observed one
        assert!(lh[0] > 0.2 && lh[2] > 0.2);
        assert!(lh[0] + lh[2] > 0.99);
    }

    #[test]
    fn upper_gap_mixes_child_ambiguity_with_root_freqs() {
        let ref_seq = [0u8, 0, 0, 0];
        let m = model(&ref_seq);
        let upper: RegionList<4> = RegionList(vec![Region::new(RegionType::Gap, 3)]);
        let lower: RegionList<4> = RegionList(vec![
            Region::ambiguous(0, Box::new([0.5, 0.5, 0.0, 0.0])),
            Region::new(RegionType::Ref, 3),
        ]);
        let merged =
            merge_upper_lower(&upper, 0.0, &lower, 0.0, &ref_seq, &m, 1e-8).expect("merge failed");
        let first = &merged.regions()[0];
        assert_eq!(first.kind, RegionType::Ambiguous);
        // the reference is all state 0, so π_0 dominates and tips the balance
        assert!(first.lh()[0] > first.lh()[1]);
    }

    #[test]
    fn absolute_root_likelihood_sums_log_frequencies() {
        let ref_seq = [0u8, 1, 2, 3, 0];
        let m = model(&ref_seq);
        let lower = all_ref(5);
        let expected: f64 = ref_seq.iter().map(|&s| m.log_freqs[s as usize]).sum();
        let got = absolute_lh_at_root(&lower, &m);
        assert!((got - expected).abs() < 1e-12);
    }

    #[test]
    fn root_total_marks_concrete_runs() {
        let ref_seq = [0u8, 1, 2, 3];
        let m = model(&ref_seq);
        let total = total_lh_at_root(&all_ref(4), &m, 1e-3);
        let r = &total.regions()[0];
        assert_eq!(r.plength_to_node, Some(1e-3));
        assert_eq!(r.plength_to_root, Some(0.0));
    }

    #[test]
    fn merge_respects_list_invariants() {
        let ref_seq = [0u8, 1, 2, 3, 0, 1, 2, 3];
        let m = model(&ref_seq);
        let a: RegionList<4> = RegionList(vec![
            Region::new(RegionType::Gap, 1),
            Region::new(RegionType::State(0), 2),
            Region::new(RegionType::Ref, 7),
        ]);
        let b: RegionList<4> = RegionList(vec![
            Region::ambiguous(0, Box::new([0.5, 0.5, 0.0, 0.0])),
            Region::new(RegionType::Ref, 7),
        ]);
        let (merged, _) =
            merge_two_lowers(&a, 1e-3, &b, 1e-3, &ref_seq, &m, 1e-8, false).expect("merge failed");
        merged.check_invariants(8).expect("merged list invariants");
    }
}
