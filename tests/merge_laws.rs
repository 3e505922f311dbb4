use sprig::merge::{absolute_lh_at_root, merge_two_lowers, merge_upper_lower, total_lh_at_root};
use sprig::model::{ModelKind, SubstModel};
use sprig::region::{Region, RegionList, RegionType};

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

fn ref_seq(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 4) as u8).collect()
}

fn model(ref_seq: &[u8]) -> SubstModel<4> {
    SubstModel::new(ModelKind::Unrest, ref_seq).expect("model init failed")
}

fn all_ref(len: usize) -> RegionList<4> {
    RegionList(vec![Region::new(RegionType::Ref, len - 1)])
}

fn with_snp(len: usize, pos: usize, state: u8) -> RegionList<4> {
    let mut regions = Vec::new();
    if pos > 0 {
        regions.push(Region::new(RegionType::Ref, pos - 1));
    }
    regions.push(Region::new(RegionType::State(state), pos));
    if pos + 1 < len {
        regions.push(Region::new(RegionType::Ref, len - 1));
    }
    RegionList(regions)
}

#[test]
fn merge_two_lowers_is_symmetric_in_its_arguments() {
    let r = ref_seq(24);
    let m = model(&r);
    let a = with_snp(24, 3, 3);
    let b: RegionList<4> = RegionList(vec![
        Region::new(RegionType::Gap, 7),
        Region::ambiguous(8, Box::new([0.5, 0.0, 0.5, 0.0])),
        Region::new(RegionType::Ref, 23),
    ]);

    let (ab, lh_ab) =
        merge_two_lowers(&a, 1e-3, &b, 3e-3, &r, &m, 1e-8, true).expect("merge failed");
    let (ba, lh_ba) =
        merge_two_lowers(&b, 3e-3, &a, 1e-3, &r, &m, 1e-8, true).expect("merge failed");
    assert_eq!(ab, ba);
    approx_eq(lh_ab, lh_ba, 1e-12);
}

#[test]
fn zero_length_upper_lower_merge_reproduces_the_lower() {
    // the polytomy attachment path relies on the upper total view combined
    // with the same lower across zero distances reproducing that lower
    let r = ref_seq(16);
    let m = model(&r);
    let lower = with_snp(16, 5, 0);
    let upper = total_lh_at_root(&lower, &m, 0.0);
    let merged = merge_upper_lower(&upper, 0.0, &lower, 0.0, &r, &m, 1e-8).expect("merge failed");
    assert_eq!(merged, lower);
}

#[test]
fn merged_lists_satisfy_the_region_invariants() {
    let r = ref_seq(32);
    let m = model(&r);
    let a: RegionList<4> = RegionList(vec![
        Region::new(RegionType::Del, 2),
        Region::new(RegionType::Ref, 15),
        Region::new(RegionType::State(1), 16),
        Region::new(RegionType::Ref, 31),
    ]);
    let b: RegionList<4> = RegionList(vec![
        Region::ambiguous(0, Box::new([0.25, 0.25, 0.25, 0.25])),
        Region::new(RegionType::Ref, 30),
        Region::new(RegionType::Gap, 31),
    ]);

    let (two, _) = merge_two_lowers(&a, 1e-3, &b, 1e-3, &r, &m, 1e-8, false).expect("two-lowers");
    two.check_invariants(32).expect("two-lowers invariants");

    let upper = total_lh_at_root(&a, &m, 1e-3);
    let ul = merge_upper_lower(&upper, 1e-3, &b, 1e-3, &r, &m, 1e-8).expect("upper-lower");
    ul.check_invariants(32).expect("upper-lower invariants");

    // ambiguous posteriors must stay normalized
    for list in [&two, &ul] {
        for region in list.regions() {
            if region.kind == RegionType::Ambiguous {
                let sum: f64 = region.lh().iter().sum();
                approx_eq(sum, 1.0, 1e-6);
                assert!(region.lh().iter().all(|&p| p >= 0.0));
            }
        }
    }
}

#[test]
fn absolute_root_likelihood_shifts_by_one_substitution() {
    let r = ref_seq(20);
    let m = model(&r);
    let baseline = absolute_lh_at_root(&all_ref(20), &m);
    let mutated = absolute_lh_at_root(&with_snp(20, 4, 2), &m);
    // site 4 carries ref state 0; swapping it for state 2 exchanges log freqs
    let expected = baseline - m.log_freqs[0] + m.log_freqs[2];
    approx_eq(mutated, expected, 1e-10);
}

#[test]
fn conflicting_lowers_at_zero_distance_are_rejected_not_fudged() {
    let r = ref_seq(8);
    let m = model(&r);
    let a = with_snp(8, 2, 3);
    let b = with_snp(8, 2, 0);
    assert!(merge_two_lowers(&a, 0.0, &b, 0.0, &r, &m, 1e-8, false).is_none());
    let (merged, _) =
        merge_two_lowers(&a, 1e-4, &b, 1e-4, &r, &m, 1e-8, false).expect("positive distance");
    assert_eq!(merged.regions()[1].kind, RegionType::Ambiguous);
}

#[test]
fn gap_and_deletion_contribute_identically_to_the_likelihood() {
    // stored distinctly for round-trips, but inference treats them the same
    let r = ref_seq(12);
    let m = model(&r);
    let gap: RegionList<4> = RegionList(vec![
        Region::new(RegionType::Gap, 3),
        Region::new(RegionType::Ref, 11),
    ]);
    let del: RegionList<4> = RegionList(vec![
        Region::new(RegionType::Del, 3),
        Region::new(RegionType::Ref, 11),
    ]);
    let other = with_snp(12, 6, 1);
    let (_, lh_gap) = merge_two_lowers(&gap, 1e-3, &other, 1e-3, &r, &m, 1e-8, true).unwrap();
    let (_, lh_del) = merge_two_lowers(&del, 1e-3, &other, 1e-3, &r, &m, 1e-8, true).unwrap();
    approx_eq(lh_gap, lh_del, 1e-15);
}
