use sprig::io::{Alignment, MutState, Mutation, SeqType, Taxon};
use sprig::merge::merge_two_lowers;
use sprig::model::{ModelKind, SubstModel};
use sprig::params::Params;
use sprig::place::place_sample;
use sprig::region::RegionType;
use sprig::tree::{LhContext, NodeKind, Tree};

fn snp(state: u8, position: usize) -> Mutation {
    Mutation {
        state: MutState::Concrete(state),
        position,
        length: 1,
    }
}

fn gap_run(position: usize, length: usize) -> Mutation {
    Mutation {
        state: MutState::Gap,
        position,
        length,
    }
}

fn alignment(ref_text: &str, taxa: Vec<(&str, Vec<Mutation>)>) -> Alignment {
    let ref_states =
        sprig::io::seqfile::states_from_ref(SeqType::Dna, "ref", ref_text).expect("bad reference");
    Alignment {
        seq_type: SeqType::Dna,
        ref_states,
        taxa: taxa
            .into_iter()
            .map(|(name, mutations)| Taxon {
                name: name.into(),
                mutations,
            })
            .collect(),
    }
}

/// Build a tree by stepwise placement in the alignment's taxon order.
fn build_tree<'a>(
    aln: &Alignment,
    model: &'a SubstModel<4>,
    params: &'a Params,
) -> (Tree<4>, usize) {
    let ctx = LhContext {
        ref_seq: &aln.ref_states,
        model,
        params,
        thresholds: params.blength_thresholds(aln.genome_length()),
    };
    let mut tree = Tree::new_single(0, aln.lower_list::<4>(0), &ctx);
    let mut minors = 0usize;
    for taxon in 1..aln.taxa.len() {
        let placement = place_sample(&mut tree, taxon, aln.lower_list::<4>(taxon), &ctx);
        if placement.new_leaf.is_none() {
            minors += 1;
        }
    }
    (tree, minors)
}

/// The cache coherence the search depends on: every internal lower equals a
/// fresh merge of its children, and every cached list is structurally valid.
fn assert_tree_invariants(tree: &Tree<4>, aln: &Alignment, model: &SubstModel<4>, params: &Params) {
    let genome_length = aln.genome_length();
    for (id, node) in tree.nodes.iter().enumerate() {
        // detached spare nodes keep stale state; skip anything unreachable
        if node.parent.is_none() && id != tree.root {
            continue;
        }
        node.lower
            .check_invariants(genome_length)
            .unwrap_or_else(|e| panic!("node {id} lower: {e}"));
        for (label, list) in [("mid", &node.mid_branch), ("total", &node.total)] {
            if let Some(list) = list {
                list.check_invariants(genome_length)
                    .unwrap_or_else(|e| panic!("node {id} {label}: {e}"));
                for region in list.regions() {
                    if region.kind == RegionType::Ambiguous {
                        let sum: f64 = region.lh().iter().sum();
                        assert!(
                            (sum - 1.0).abs() < 1e-6,
                            "node {id} {label} has unnormalized posterior (sum {sum})"
                        );
                    }
                }
            }
        }
        if let NodeKind::Internal { children, .. } = &node.kind {
            let [l, r] = *children;
            let (fresh, _) = merge_two_lowers(
                &tree.node(l).lower,
                tree.node(l).blength,
                &tree.node(r).lower,
                tree.node(r).blength,
                &aln.ref_states,
                model,
                params.threshold_prob,
                false,
            )
            .unwrap_or_else(|| panic!("node {id}: children produce a null merge"));
            assert!(
                !tree.node(id).lower.differs_from(
                    &fresh,
                    genome_length,
                    params.threshold_prob,
                    params.thresh_diff_update,
                    params.thresh_diff_fold_update,
                ),
                "node {id}: cached lower differs from a fresh merge of its children"
            );
        }
    }
}

#[test]
fn identical_taxon_becomes_a_minor_sibling() {
    let aln = alignment("ACGTACGTAC", vec![("t1", vec![]), ("t2", vec![])]);
    let model = SubstModel::new(ModelKind::Unrest, &aln.ref_states).unwrap();
    let params = Params::default();
    let (tree, minors) = build_tree(&aln, &model, &params);
    assert_eq!(minors, 1);
    // no internal node was created
    assert_eq!(tree.nodes.len(), 1);
    assert_eq!(tree.placed_taxa().len(), 2);
}

#[test]
fn gappy_taxon_is_absorbed_without_new_nodes() {
    let aln = alignment(
        "ACGTACGTAC",
        vec![("full", vec![]), ("gappy", vec![gap_run(0, 6)])],
    );
    let model = SubstModel::new(ModelKind::Unrest, &aln.ref_states).unwrap();
    let params = Params::default();
    let (tree, minors) = build_tree(&aln, &model, &params);
    assert_eq!(minors, 1);
    assert_eq!(tree.nodes.len(), 1);
}

#[test]
fn one_mutation_builds_a_two_leaf_cherry() {
    let aln = alignment(
        "ACGTACGTACGTACGTACGT",
        vec![("t1", vec![]), ("t2", vec![snp(1, 0)])],
    );
    let model = SubstModel::new(ModelKind::Unrest, &aln.ref_states).unwrap();
    let params = Params::default();
    let (tree, minors) = build_tree(&aln, &model, &params);
    assert_eq!(minors, 0);

    let root = tree.root;
    let children = tree.children(root).expect("root must be internal");
    assert!(tree.is_leaf(children[0]) && tree.is_leaf(children[1]));
    assert!(tree.node(children[0]).blength >= 0.0);
    assert!(tree.node(children[1]).blength >= 0.0);
    assert_tree_invariants(&tree, &aln, &model, &params);

    let ctx = LhContext {
        ref_seq: &aln.ref_states,
        model: &model,
        params: &params,
        thresholds: params.blength_thresholds(aln.genome_length()),
    };
    let lh = tree.total_log_likelihood(&ctx);
    assert!(lh.is_finite() && lh < 0.0);
}

#[test]
fn shared_mutation_clusters_incomparable_taxa() {
    // three taxa share one substitution but blind each other at different
    // sites, so none subsumes another and all get real leaves
    let aln = alignment(
        "ACGTACGTACGTACGTACGTACGTACGT",
        vec![
            ("backbone", vec![]),
            ("c1", vec![snp(1, 4), gap_run(8, 2)]),
            ("c2", vec![snp(1, 4), gap_run(12, 2)]),
            ("c3", vec![snp(1, 4), gap_run(16, 2)]),
        ],
    );
    let model = SubstModel::new(ModelKind::Unrest, &aln.ref_states).unwrap();
    let params = Params::default();
    let (tree, minors) = build_tree(&aln, &model, &params);
    assert_eq!(minors, 0);
    let mut placed = tree.placed_taxa();
    placed.sort_unstable();
    assert_eq!(placed, vec![0, 1, 2, 3]);
    assert_tree_invariants(&tree, &aln, &model, &params);
}

#[test]
fn placement_keeps_caches_coherent_across_many_taxa() {
    let taxa = vec![
        ("t0", vec![]),
        ("t1", vec![snp(3, 2)]),
        ("t2", vec![snp(3, 2), snp(0, 9)]),
        ("t3", vec![snp(1, 16)]),
        ("t4", vec![snp(1, 16), snp(2, 21), gap_run(0, 3)]),
        ("t5", vec![snp(3, 2), snp(0, 9), snp(3, 26)]),
        ("t6", vec![gap_run(20, 6)]),
    ];
    let aln = alignment("ACGTACGTACGTACGTACGTACGTACGT", taxa);
    let model = SubstModel::new(ModelKind::Unrest, &aln.ref_states).unwrap();
    let params = Params::default();
    let (tree, _) = build_tree(&aln, &model, &params);
    assert_tree_invariants(&tree, &aln, &model, &params);

    let ctx = LhContext {
        ref_seq: &aln.ref_states,
        model: &model,
        params: &params,
        thresholds: params.blength_thresholds(aln.genome_length()),
    };
    let lh = tree.total_log_likelihood(&ctx);
    assert!(lh.is_finite() && lh < 0.0);
}
