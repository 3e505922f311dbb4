//! Inference orchestration: order the taxa, build the tree by stepwise
//! placement with periodic model re-estimation, then alternate SPR passes and
//! branch-length optimization until the improvement per pass dies out.

use anyhow::{Result, bail};

use crate::io::newick::write_newick;
use crate::io::{Alignment, SeqType};
use crate::model::{ModelFile, ModelKind, SubstModel};
use crate::params::Params;
use crate::place::place_sample;
use crate::progress;
use crate::spr::{improve_entire_tree, optimize_branch_lengths};
use crate::tree::{LhContext, Tree};

#[derive(Debug)]
pub struct InferenceResult {
    pub newick: String,
    pub log_likelihood: f64,
    pub model: ModelFile,
    pub n_placed: usize,
    pub n_minor: usize,
}

/// Run the full inference, dispatching on the alphabet once at startup.
pub fn run_inference(
    aln: &Alignment,
    kind: ModelKind,
    params: &Params,
    multifurcating: bool,
) -> Result<InferenceResult> {
    params.validate()?;
    if aln.taxa.len() < 2 {
        bail!("inference needs at least 2 taxa");
    }
    match aln.seq_type {
        SeqType::Dna => infer::<4>(aln, kind, params, multifurcating),
        SeqType::Protein => infer::<20>(aln, kind, params, multifurcating),
        SeqType::Binary => infer::<2>(aln, kind, params, multifurcating),
    }
}

fn infer<const S: usize>(
    aln: &Alignment,
    kind: ModelKind,
    params: &Params,
    multifurcating: bool,
) -> Result<InferenceResult> {
    let ref_seq = &aln.ref_states;
    let thresholds = params.blength_thresholds(ref_seq.len());
    let mut model: SubstModel<S> = SubstModel::new(kind, ref_seq)?;

    // informative taxa first: the backbone they build guides everyone else
    let order = aln.divergence_order(params.hamming_weight);

    let mut tree = {
        let ctx = LhContext {
            ref_seq,
            model: &model,
            params,
            thresholds,
        };
        Tree::new_single(order[0], aln.lower_list::<S>(order[0]), &ctx)
    };

    let pb = progress::placement_bar(params.progress, (order.len() - 1) as u64);
    for &taxon in order.iter().skip(1) {
        let sample = aln.lower_list::<S>(taxon);
        let placement = {
            let ctx = LhContext {
                ref_seq,
                model: &model,
                params,
                thresholds,
            };
            place_sample(&mut tree, taxon, sample, &ctx)
        };

        if let Some(leaf) = placement.new_leaf {
            // mutations observed on the fresh edge feed the rate estimate;
            // root attachments carry no usable direction
            let parent_is_root = tree.node(leaf).parent.map(|(p, _)| p) == Some(tree.root);
            if !parent_is_root {
                if let Some(upper) = tree.view_for(leaf) {
                    let upper = upper.clone();
                    model.update_pseudo_count(&upper, &tree.node(leaf).lower, ref_seq);
                }
            }
            model.note_placement();
        }

        if model.due_for_update(params.mutation_update_period)
            && model.update_from_pseudocounts(ref_seq)
        {
            let ctx = LhContext {
                ref_seq,
                model: &model,
                params,
                thresholds,
            };
            tree.refresh_all(&ctx);
            tree.mark_outdated_all();
        }
        pb.inc(1);
    }
    pb.finish_with_message("all taxa attached");

    // final model update before the topology polishing rounds
    if model.update_from_pseudocounts(ref_seq) {
        let ctx = LhContext {
            ref_seq,
            model: &model,
            params,
            thresholds,
        };
        tree.refresh_all(&ctx);
    }
    tree.mark_outdated_all();

    for round in 0..params.max_improvement_rounds {
        let ctx = LhContext {
            ref_seq,
            model: &model,
            params,
            thresholds,
        };
        let improvement = improve_entire_tree(&mut tree, false, &ctx);
        tree.mark_outdated_all();
        let n_blengths = optimize_branch_lengths(&mut tree, &ctx);
        if params.progress {
            println!(
                "round {}: topology improvement {:.4}, {} branch lengths updated",
                round + 1,
                improvement,
                n_blengths
            );
        }
        if improvement < params.thresh_entire_tree_improvement {
            break;
        }
        tree.mark_outdated_all();
    }

    // short-range polish with tighter limits
    {
        let ctx = LhContext {
            ref_seq,
            model: &model,
            params,
            thresholds,
        };
        tree.mark_outdated_all();
        improve_entire_tree(&mut tree, true, &ctx);
        tree.refresh_all(&ctx);
    }

    let ctx = LhContext {
        ref_seq,
        model: &model,
        params,
        thresholds,
    };
    let log_likelihood = tree.total_log_likelihood(&ctx);
    let names: Vec<String> = aln.taxa.iter().map(|t| t.name.clone()).collect();
    let newick = write_newick(&tree, &names, multifurcating);

    let placed = tree.placed_taxa();
    let n_leaves = tree
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, crate::tree::NodeKind::Leaf { .. }))
        .count();
    Ok(InferenceResult {
        newick,
        log_likelihood,
        model: model.to_file(),
        n_placed: placed.len(),
        n_minor: placed.len() - n_leaves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MutState, Mutation, Taxon};

    fn aln(ref_seq: &str, taxa: Vec<(&str, Vec<Mutation>)>) -> Alignment {
        let ref_states =
            crate::io::seqfile::states_from_ref(SeqType::Dna, "ref", ref_seq).unwrap();
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

    #[test]
    fn two_identical_taxa_produce_a_cherry() {
        let mut params = Params::default();
        params.progress = false;
        let aln = aln("ACGTACGTAC", vec![("t1", vec![]), ("t2", vec![])]);
        let result = run_inference(&aln, ModelKind::Jc, &params, false).unwrap();
        assert_eq!(result.n_placed, 2);
        assert!(result.log_likelihood.is_finite());
        // identical taxa collapse into one leaf with a minor sibling
        assert_eq!(result.n_minor, 1);
        assert!(result.newick.contains("t1"));
        assert!(result.newick.contains("t2"));
    }

    #[test]
    fn snp_taxa_build_a_binary_tree() {
        let mut params = Params::default();
        params.progress = false;
        let snp = |state: u8, position: usize| Mutation {
            state: MutState::Concrete(state),
            position,
            length: 1,
        };
        let aln = aln(
            "ACGTACGTACGTACGTACGT",
            vec![
                ("t1", vec![]),
                ("t2", vec![snp(3, 0)]),
                ("t3", vec![snp(3, 0), snp(0, 5)]),
            ],
        );
        let result = run_inference(&aln, ModelKind::Unrest, &params, false).unwrap();
        assert_eq!(result.n_placed, 3);
        assert_eq!(result.n_minor, 0);
        assert!(result.log_likelihood < 0.0);
    }
}
