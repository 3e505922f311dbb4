//! Run-length encoded per-edge likelihood vectors.
//!
//! A genome of length L is covered by an ordered list of regions, each ending
//! at an inclusive 0-based position. Most regions are `Ref` runs (identical to
//! the reference), so lists stay short no matter how long the genome is; every
//! merge and cost evaluation walks the shared segments of two lists instead of
//! the genome.

/// Per-site classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    /// Identical to the reference over the whole run.
    Ref,
    /// Unsequenced / unknown.
    Gap,
    /// Deleted. Kept distinct from `Gap` in storage so diff files round-trip,
    /// but inference treats the two identically.
    Del,
    /// Ambiguous, with an explicit per-state probability vector.
    Ambiguous,
    /// A single concrete state over the whole run.
    State(u8),
}

impl RegionType {
    /// True for `Gap` and `Del`: both carry no information.
    #[inline]
    pub fn is_gap(self) -> bool {
        matches!(self, RegionType::Gap | RegionType::Del)
    }

    /// True for `Ref` or a concrete state.
    #[inline]
    pub fn is_concrete(self) -> bool {
        matches!(self, RegionType::Ref | RegionType::State(_))
    }

    /// Resolve `Ref` against the reference state at the site in question.
    #[inline]
    pub fn resolve(self, ref_state: u8) -> u8 {
        match self {
            RegionType::Ref => ref_state,
            RegionType::State(s) => s,
            _ => unreachable!("resolve called on a non-concrete region"),
        }
    }
}

/// One run in a region list.
///
/// `plength_to_node` is extra branch length between the observation and the
/// node bearing this list; `plength_to_root` additionally marks runs whose
/// observation was propagated through the root (`Some(0.0)` is the marker for
/// "root-mixed, no extra length" and is distinct from `None`).
#[derive(Debug, Clone, PartialEq)]
pub struct Region<const S: usize> {
    pub kind: RegionType,
    /// Inclusive 0-based end of the run.
    pub end: usize,
    pub plength_to_node: Option<f64>,
    pub plength_to_root: Option<f64>,
    pub likelihood: Option<Box<[f64; S]>>,
}

impl<const S: usize> Region<S> {
    pub fn new(kind: RegionType, end: usize) -> Self {
        Self {
            kind,
            end,
            plength_to_node: None,
            plength_to_root: None,
            likelihood: None,
        }
    }

    pub fn with_plengths(
        kind: RegionType,
        end: usize,
        plength_to_node: Option<f64>,
        plength_to_root: Option<f64>,
    ) -> Self {
        Self {
            kind,
            end,
            plength_to_node,
            plength_to_root,
            likelihood: None,
        }
    }

    pub fn ambiguous(end: usize, likelihood: Box<[f64; S]>) -> Self {
        Self {
            kind: RegionType::Ambiguous,
            end,
            plength_to_node: None,
            plength_to_root: None,
            likelihood: Some(likelihood),
        }
    }

    #[inline]
    pub fn lh(&self) -> &[f64; S] {
        self.likelihood
            .as_deref()
            .expect("ambiguous region without likelihood vector")
    }

    /// Observation-to-node length folded with an incident branch length.
    #[inline]
    pub fn total_plength_with(&self, branch: f64) -> f64 {
        match self.plength_to_node {
            Some(p) => p + branch.max(0.0),
            None => branch,
        }
    }
}

/// Result of comparing two lists for informativeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsumption {
    /// The first list determines everything the second does (ties included).
    FirstMoreInformative,
    /// The second list strictly subsumes the first.
    SecondMoreInformative,
    /// Each list constrains sites the other leaves open.
    Incomparable,
}

/// An ordered run list covering positions `0..genome_length` exactly once.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionList<const S: usize>(pub Vec<Region<S>>);

/// Advance both lists to the run covering `pos` and return the inclusive end
/// of the largest segment `[pos..=end]` covered by a single run in each list.
#[inline]
pub fn next_shared_segment<const S: usize>(
    pos: usize,
    a: &[Region<S>],
    b: &[Region<S>],
    ia: &mut usize,
    ib: &mut usize,
) -> usize {
    while a[*ia].end < pos {
        *ia += 1;
    }
    while b[*ib].end < pos {
        *ib += 1;
    }
    a[*ia].end.min(b[*ib].end)
}

#[inline]
fn plength_close(a: Option<f64>, b: Option<f64>, eps: f64) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => (x - y).abs() < eps,
        _ => false,
    }
}

impl<const S: usize> RegionList<S> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self(Vec::with_capacity(cap))
    }

    #[inline]
    pub fn regions(&self) -> &[Region<S>] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a run, extending the previous run instead when type and both
    /// plength annotations match within `eps`.
    pub fn push_coalescing(
        &mut self,
        kind: RegionType,
        plength_to_node: Option<f64>,
        plength_to_root: Option<f64>,
        end: usize,
        eps: f64,
    ) {
        if let Some(last) = self.0.last_mut() {
            if last.kind == kind
                && last.likelihood.is_none()
                && plength_close(last.plength_to_node, plength_to_node, eps)
                && plength_close(last.plength_to_root, plength_to_root, eps)
            {
                last.end = end;
                return;
            }
        }
        self.0
            .push(Region::with_plengths(kind, end, plength_to_node, plength_to_root));
    }

    /// Append a freshly normalized posterior, simplifying to a concrete run
    /// when one state carries essentially all the mass.
    pub fn push_simplified(
        &mut self,
        end: usize,
        lh: Box<[f64; S]>,
        ref_state: u8,
        threshold_prob: f64,
    ) {
        let mut argmax = 0usize;
        for i in 1..S {
            if lh[i] > lh[argmax] {
                argmax = i;
            }
        }
        if lh[argmax] > 1.0 - threshold_prob {
            let kind = if argmax as u8 == ref_state {
                RegionType::Ref
            } else {
                RegionType::State(argmax as u8)
            };
            self.push_coalescing(kind, None, None, end, threshold_prob);
        } else {
            self.0.push(Region::ambiguous(end, lh));
        }
    }

    /// Upper bound on the number of shared segments of `self` and `other`,
    /// used to pre-size merge outputs.
    pub fn count_shared_segments(&self, other: &RegionList<S>, genome_length: usize) -> usize {
        let a = self.regions();
        let b = other.regions();
        let (mut ia, mut ib, mut pos, mut count) = (0usize, 0usize, 0usize, 0usize);
        while pos < genome_length {
            let end = next_shared_segment(pos, a, b, &mut ia, &mut ib);
            count += 1;
            pos = end + 1;
        }
        count + 1
    }

    /// Decide whether `self` carries strictly more information than `other`
    /// (an exhaustive site-wise comparison; ties count toward the first list).
    pub fn compare_with_sample(&self, other: &RegionList<S>, genome_length: usize) -> Subsumption {
        let a = self.regions();
        let b = other.regions();
        let (mut ia, mut ib, mut pos) = (0usize, 0usize, 0usize);
        let mut first_more = false;
        let mut second_more = false;

        while pos < genome_length && !(first_more && second_more) {
            let end = next_shared_segment(pos, a, b, &mut ia, &mut ib);
            let r1 = &a[ia];
            let r2 = &b[ib];
            let k1 = if r1.kind.is_gap() { RegionType::Gap } else { r1.kind };
            let k2 = if r2.kind.is_gap() { RegionType::Gap } else { r2.kind };

            if k1 != k2 {
                if k1 == RegionType::Gap {
                    second_more = true;
                } else if k2 == RegionType::Gap {
                    first_more = true;
                } else if k1 == RegionType::Ambiguous {
                    second_more = true;
                } else if k2 == RegionType::Ambiguous {
                    first_more = true;
                } else {
                    first_more = true;
                    second_more = true;
                }
            } else if k1 == RegionType::Ambiguous {
                let lh1 = r1.lh();
                let lh2 = r2.lh();
                for i in 0..S {
                    if lh2[i] > 0.1 && lh1[i] < 0.1 {
                        first_more = true;
                    } else if lh1[i] > 0.1 && lh2[i] < 0.1 {
                        second_more = true;
                    }
                }
            }
            pos = end + 1;
        }

        match (first_more, second_more) {
            (true, true) => Subsumption::Incomparable,
            (false, true) => Subsumption::SecondMoreInformative,
            _ => Subsumption::FirstMoreInformative,
        }
    }

    /// True when a freshly computed list differs from this cached one beyond
    /// the configured absolute and fold-change floors.
    pub fn differs_from(
        &self,
        other: &RegionList<S>,
        genome_length: usize,
        threshold_prob: f64,
        thresh_diff_update: f64,
        thresh_diff_fold_update: f64,
    ) -> bool {
        if other.is_empty() {
            return true;
        }
        let a = self.regions();
        let b = other.regions();
        let (mut ia, mut ib, mut pos) = (0usize, 0usize, 0usize);

        while pos < genome_length {
            let end = next_shared_segment(pos, a, b, &mut ia, &mut ib);
            let r1 = &a[ia];
            let r2 = &b[ib];

            if r1.kind != r2.kind {
                return true;
            }
            if r1.kind.is_concrete() {
                if !plength_close(r1.plength_to_root, r2.plength_to_root, threshold_prob)
                    || !plength_close(r1.plength_to_node, r2.plength_to_node, threshold_prob)
                {
                    return true;
                }
            }
            if r1.kind == RegionType::Ambiguous {
                if !plength_close(r1.plength_to_node, r2.plength_to_node, threshold_prob) {
                    return true;
                }
                let lh1 = r1.lh();
                let lh2 = r2.lh();
                for i in 0..S {
                    let diff = (lh1[i] - lh2[i]).abs();
                    if diff > 0.0 {
                        if lh1[i] == 0.0 || lh2[i] == 0.0 {
                            return true;
                        }
                        if diff > thresh_diff_update
                            || (diff > threshold_prob
                                && (diff > thresh_diff_fold_update * lh1[i]
                                    || diff > thresh_diff_fold_update * lh2[i]))
                        {
                            return true;
                        }
                    }
                }
            }
            pos = end + 1;
        }
        false
    }

    /// Structural invariants: full cover, strictly increasing ends, likelihood
    /// vectors present exactly on ambiguous runs. Used by tests and debug
    /// assertions after mutating operations.
    pub fn check_invariants(&self, genome_length: usize) -> Result<(), String> {
        if self.is_empty() {
            return Err("empty region list".into());
        }
        let mut prev_end: Option<usize> = None;
        for r in self.regions() {
            if let Some(p) = prev_end {
                if r.end <= p {
                    return Err(format!("non-increasing run end {}", r.end));
                }
            }
            match r.kind {
                RegionType::Ambiguous => {
                    let lh = r
                        .likelihood
                        .as_deref()
                        .ok_or("ambiguous run without likelihood")?;
                    let max = lh.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    if !(max > 0.0) {
                        return Err("ambiguous run with non-positive maximum".into());
                    }
                    if lh.iter().any(|&x| x < 0.0) {
                        return Err("negative probability in ambiguous run".into());
                    }
                }
                _ => {
                    if r.likelihood.is_some() {
                        return Err("likelihood vector on a non-ambiguous run".into());
                    }
                }
            }
            if r.plength_to_root.is_some() && r.plength_to_node.is_none() {
                return Err("plength_to_root without plength_to_node".into());
            }
            prev_end = Some(r.end);
        }
        if prev_end != Some(genome_length - 1) {
            return Err(format!(
                "list ends at {:?}, expected {}",
                prev_end,
                genome_length - 1
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ref_list(genome_length: usize) -> RegionList<4> {
        RegionList(vec![Region::new(RegionType::Ref, genome_length - 1)])
    }

    #[test]
    fn segment_walk_covers_genome_once() {
        let a: RegionList<4> = RegionList(vec![
            Region::new(RegionType::Ref, 4),
            Region::new(RegionType::State(1), 5),
            Region::new(RegionType::Ref, 9),
        ]);
        let b: RegionList<4> = RegionList(vec![
            Region::new(RegionType::Gap, 2),
            Region::new(RegionType::Ref, 9),
        ]);
        let (mut ia, mut ib, mut pos) = (0, 0, 0);
        let mut ends = Vec::new();
        while pos < 10 {
            let end = next_shared_segment(pos, a.regions(), b.regions(), &mut ia, &mut ib);
            ends.push(end);
            pos = end + 1;
        }
        assert_eq!(ends, vec![2, 4, 5, 9]);
        assert_eq!(a.count_shared_segments(&b, 10), 5);
    }

    #[test]
    fn push_coalescing_extends_matching_runs() {
        let mut list: RegionList<4> = RegionList::new();
        list.push_coalescing(RegionType::Ref, None, None, 3, 1e-8);
        list.push_coalescing(RegionType::Ref, None, None, 7, 1e-8);
        assert_eq!(list.len(), 1);
        assert_eq!(list.regions()[0].end, 7);

        list.push_coalescing(RegionType::Ref, Some(0.1), None, 9, 1e-8);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn push_simplified_collapses_near_one_hot() {
        let mut list: RegionList<4> = RegionList::new();
        list.push_simplified(0, Box::new([1.0 - 1e-12, 1e-12, 0.0, 0.0]), 0, 1e-8);
        assert_eq!(list.regions()[0].kind, RegionType::Ref);

        let mut list: RegionList<4> = RegionList::new();
        list.push_simplified(0, Box::new([0.6, 0.4, 0.0, 0.0]), 0, 1e-8);
        assert_eq!(list.regions()[0].kind, RegionType::Ambiguous);
    }

    #[test]
    fn gap_makes_a_sample_less_informative() {
        let full = ref_list(10);
        let gappy: RegionList<4> = RegionList(vec![
            Region::new(RegionType::Gap, 4),
            Region::new(RegionType::Ref, 9),
        ]);
        assert_eq!(
            full.compare_with_sample(&gappy, 10),
            Subsumption::FirstMoreInformative
        );
        assert_eq!(
            gappy.compare_with_sample(&full, 10),
            Subsumption::SecondMoreInformative
        );
    }

    #[test]
    fn identical_lists_favor_the_first() {
        let a = ref_list(5);
        let b = ref_list(5);
        assert_eq!(a.compare_with_sample(&b, 5), Subsumption::FirstMoreInformative);
    }

    #[test]
    fn deletion_compares_like_a_gap() {
        let del: RegionList<4> = RegionList(vec![
            Region::new(RegionType::Del, 4),
            Region::new(RegionType::Ref, 9),
        ]);
        let gap: RegionList<4> = RegionList(vec![
            Region::new(RegionType::Gap, 4),
            Region::new(RegionType::Ref, 9),
        ]);
        assert_eq!(del.compare_with_sample(&gap, 10), Subsumption::FirstMoreInformative);
    }

    #[test]
    fn conflicting_states_are_incomparable() {
        let a: RegionList<4> = RegionList(vec![
            Region::new(RegionType::State(1), 0),
            Region::new(RegionType::Ref, 9),
        ]);
        let b: RegionList<4> = RegionList(vec![
            Region::new(RegionType::Ref, 8),
            Region::new(RegionType::State(2), 9),
        ]);
        assert_eq!(a.compare_with_sample(&b, 10), Subsumption::Incomparable);
    }

    #[test]
    fn differs_from_detects_type_and_plength_changes() {
        let a = ref_list(10);
        let mut b = ref_list(10);
        assert!(!a.differs_from(&b, 10, 1e-8, 1e-7, 1.001));
        b.0[0].plength_to_node = Some(0.5);
        assert!(a.differs_from(&b, 10, 1e-8, 1e-7, 1.001));
    }

    #[test]
    fn invariants_accept_well_formed_lists() {
        let list: RegionList<4> = RegionList(vec![
            Region::new(RegionType::Ref, 3),
            Region::ambiguous(4, Box::new([0.5, 0.5, 0.0, 0.0])),
            Region::new(RegionType::Ref, 9),
        ]);
        list.check_invariants(10).expect("list should be valid");
        assert!(list.check_invariants(11).is_err());
    }
}
