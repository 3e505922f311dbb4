use sprig::blength::estimate_branch_length;
use sprig::cost::{sample_placement_cost, subtree_placement_cost};
use sprig::merge::total_lh_at_root;
use sprig::model::{ModelKind, SubstModel};
use sprig::params::Params;
use sprig::region::{Region, RegionList, RegionType};

fn ref_seq(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 4) as u8).collect()
}

fn model(ref_seq: &[u8]) -> SubstModel<4> {
    SubstModel::new(ModelKind::Unrest, ref_seq).expect("model init failed")
}

fn all_ref(len: usize) -> RegionList<4> {
    RegionList(vec![Region::new(RegionType::Ref, len - 1)])
}

fn with_snps(len: usize, sites: &[(usize, u8)]) -> RegionList<4> {
    let mut regions = Vec::new();
    let mut next = 0usize;
    for &(pos, state) in sites {
        if pos > next {
            regions.push(Region::new(RegionType::Ref, pos - 1));
        }
        regions.push(Region::new(RegionType::State(state), pos));
        next = pos + 1;
    }
    if next < len {
        regions.push(Region::new(RegionType::Ref, len - 1));
    }
    RegionList(regions)
}

#[test]
fn zero_branch_lengths_never_produce_nan() {
    let r = ref_seq(40);
    let m = model(&r);
    let parent = total_lh_at_root(&all_ref(40), &m, 0.0);
    let candidates = [
        all_ref(40),
        with_snps(40, &[(3, 0)]),
        RegionList(vec![
            Region::ambiguous(0, Box::new([0.5, 0.5, 0.0, 0.0])),
            Region::new(RegionType::Ref, 39),
        ]),
        RegionList(vec![
            Region::new(RegionType::Gap, 19),
            Region::new(RegionType::Ref, 39),
        ]),
    ];
    for cand in &candidates {
        for b in [0.0, -1.0, 1e-9] {
            assert!(!sample_placement_cost(&parent, cand, b, &r, &m).is_nan());
            assert!(!subtree_placement_cost(&parent, cand, b, &r, &m).is_nan());
        }
    }
}

#[test]
fn saturated_branch_never_beats_the_optimum() {
    let r = ref_seq(60);
    let m = model(&r);
    let params = Params::default();
    let t = params.blength_thresholds(60);
    let parent = total_lh_at_root(&all_ref(60), &m, 0.0);
    let sample = with_snps(60, &[(7, 3)]);

    // scan a few lengths around the expected optimum of roughly one
    // substitution per genome
    let mut best = f64::NEG_INFINITY;
    for i in 1..=64 {
        let b = t.default_blength * i as f64 / 16.0;
        best = best.max(sample_placement_cost(&parent, &sample, b, &r, &m));
    }
    let saturated = sample_placement_cost(&parent, &sample, t.max_blength, &r, &m);
    assert!(saturated <= best, "{saturated} should not beat {best}");
}

#[test]
fn estimator_lands_near_the_scanned_optimum() {
    let r = ref_seq(80);
    let m = model(&r);
    let params = Params::default();
    let t = params.blength_thresholds(80);
    let parent = total_lh_at_root(&all_ref(80), &m, 0.0);
    let child = with_snps(80, &[(5, 3), (33, 0)]);

    let estimated = estimate_branch_length(&parent, &child, &r, &m, &t);
    assert!(estimated > 0.0);

    // the analytic optimum must be at least as good as a coarse scan
    let at_estimate = subtree_placement_cost(&parent, &child, estimated, &r, &m);
    for i in 1..=40 {
        let b = t.default_blength * i as f64 / 10.0;
        let scanned = subtree_placement_cost(&parent, &child, b, &r, &m);
        assert!(
            at_estimate >= scanned - 1e-6,
            "scan at {b} beat the estimate: {scanned} > {at_estimate}"
        );
    }
}

#[test]
fn identical_sequences_drive_the_estimate_to_zero() {
    let r = ref_seq(50);
    let m = model(&r);
    let params = Params::default();
    let t = params.blength_thresholds(50);
    let parent = total_lh_at_root(&all_ref(50), &m, 0.0);
    let estimated = estimate_branch_length(&parent, &all_ref(50), &r, &m, &t);
    assert!(estimated <= 0.0);
}

#[test]
fn gaps_make_the_branch_length_indifferent() {
    let r = ref_seq(30);
    let m = model(&r);
    let parent = total_lh_at_root(&all_ref(30), &m, 0.0);
    let gappy: RegionList<4> = RegionList(vec![Region::new(RegionType::Gap, 29)]);
    // a fully unsequenced sample costs nothing at any length
    for b in [0.0, 1e-4, 1e-2] {
        assert_eq!(sample_placement_cost(&parent, &gappy, b, &r, &m), 0.0);
    }
}
