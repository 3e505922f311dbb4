//! Stepwise taxon placement.
//!
//! Each new taxon is placed by a best-first traversal from the root scoring
//! two attachment variants per candidate (mid-branch and on-node), followed by
//! a fine-tuning pass through polytomies, a branch-length sub-search for the
//! new edge, and the actual splice with a cache refresh wave.

use crate::cost::{estimate_new_branch_length, sample_placement_cost};
use crate::merge::{merge_two_lowers, merge_upper_lower, total_lh_at_root};
use crate::region::{RegionList, Subsumption};
use crate::tree::{ChildSlot, LhContext, NodeId, NodeKind, PhyloNode, RefreshTask, Tree};
use crate::utils::MIN_NEGATIVE;

#[derive(Debug)]
pub enum PlacementSearch {
    /// The sample is subsumed by an existing leaf.
    LessInformative(NodeId),
    Found {
        node: NodeId,
        lh_diff: f64,
        is_mid_branch: bool,
        best_up_lh_diff: f64,
        best_down_lh_diff: f64,
        best_child: Option<NodeId>,
    },
}

struct Candidate {
    node: NodeId,
    failures: u32,
    lh_diff: f64,
}

/// Best-first search for the attachment of a new sample.
pub fn seek_sample_placement<const S: usize>(
    tree: &Tree<S>,
    sample: &RegionList<S>,
    ctx: &LhContext<S>,
) -> PlacementSearch {
    let genome_length = ctx.ref_seq.len();
    let default_blength = ctx.thresholds.default_blength;

    let mut selected = tree.root;
    let mut best_lh_diff = MIN_NEGATIVE;
    let mut is_mid_branch = false;
    let mut best_up_lh_diff = MIN_NEGATIVE;
    let mut best_down_lh_diff = MIN_NEGATIVE;
    let mut best_child: Option<NodeId> = None;

    let mut stack = vec![Candidate {
        node: tree.root,
        failures: 0,
        lh_diff: MIN_NEGATIVE,
    }];

    while let Some(mut cand) = stack.pop() {
        let node = cand.node;

        // a leaf that already determines everything the sample does absorbs
        // it as a minor sibling; no new node is created
        if tree.is_leaf(node)
            && tree
                .node(node)
                .lower
                .compare_with_sample(sample, genome_length)
                == Subsumption::FirstMoreInformative
        {
            return PlacementSearch::LessInformative(node);
        }

        let blength = tree.node(node).blength;
        let mut lh_diff_mid_branch = MIN_NEGATIVE;

        if node != tree.root && blength > 0.0 {
            if let Some(mid) = &tree.node(node).mid_branch {
                lh_diff_mid_branch =
                    sample_placement_cost(mid, sample, default_blength, ctx.ref_seq, ctx.model);
                if lh_diff_mid_branch > best_lh_diff {
                    best_lh_diff = lh_diff_mid_branch;
                    selected = node;
                    cand.failures = 0;
                    is_mid_branch = true;
                }
            }
        }

        let lh_diff_at_node = if node == tree.root || blength > 0.0 {
            match &tree.node(node).total {
                Some(total) => {
                    let lh =
                        sample_placement_cost(total, sample, default_blength, ctx.ref_seq, ctx.model);
                    if lh > best_lh_diff {
                        best_lh_diff = lh;
                        selected = node;
                        cand.failures = 0;
                        is_mid_branch = false;
                        best_up_lh_diff = lh_diff_mid_branch;
                    } else if lh_diff_mid_branch >= best_lh_diff - ctx.params.threshold_prob {
                        best_up_lh_diff = cand.lh_diff;
                        best_down_lh_diff = lh;
                        best_child = Some(node);
                    } else if lh < cand.lh_diff - ctx.params.thresh_log_lh_failure {
                        cand.failures += 1;
                    }
                    lh
                }
                None => cand.lh_diff,
            }
        } else {
            cand.lh_diff
        };

        let within_failures = cand.failures < ctx.params.failure_limit_sample;
        let within_lh = lh_diff_at_node > best_lh_diff - ctx.params.thresh_log_lh_sample;
        if ctx.params.stop_rule_sample.allows(within_failures, within_lh) {
            if let Some([left, right]) = tree.children(node) {
                stack.push(Candidate {
                    node: left,
                    failures: cand.failures,
                    lh_diff: lh_diff_at_node,
                });
                stack.push(Candidate {
                    node: right,
                    failures: cand.failures,
                    lh_diff: lh_diff_at_node,
                });
            }
        }
    }

    // when the best hit is a node, refine through its (possibly polytomous)
    // children to find the best descendant branch
    best_down_lh_diff = MIN_NEGATIVE;
    best_child = None;
    if !is_mid_branch {
        finetune_at_node(
            tree,
            selected,
            sample,
            &mut best_down_lh_diff,
            &mut best_child,
            ctx,
        );
    }

    PlacementSearch::Found {
        node: selected,
        lh_diff: best_lh_diff,
        is_mid_branch,
        best_up_lh_diff,
        best_down_lh_diff,
        best_child,
    }
}

/// Walk through zero-length edges below `selected` and probe successively
/// higher attachment points along each positive child branch.
fn finetune_at_node<const S: usize>(
    tree: &Tree<S>,
    selected: NodeId,
    sample: &RegionList<S>,
    best_down_lh_diff: &mut f64,
    best_child: &mut Option<NodeId>,
    ctx: &LhContext<S>,
) {
    let default_blength = ctx.thresholds.default_blength;
    let mut stack: Vec<NodeId> = tree
        .children(selected)
        .map(|c| c.to_vec())
        .unwrap_or_default();

    while let Some(node) = stack.pop() {
        if tree.node(node).blength <= 0.0 {
            if let Some(children) = tree.children(node) {
                stack.extend(children);
            }
            continue;
        }
        let Some(upper) = tree.view_for(node) else {
            continue;
        };
        let Some(cached_mid) = &tree.node(node).mid_branch else {
            continue;
        };
        let lower = &tree.node(node).lower;
        let blength = tree.node(node).blength;

        let mut new_blength = blength * 0.5;
        let mut new_best_lh_mid_branch = MIN_NEGATIVE;
        let mut mid_regions = cached_mid.clone();
        loop {
            let lh = sample_placement_cost(
                &mid_regions,
                sample,
                default_blength,
                ctx.ref_seq,
                ctx.model,
            );
            if lh > new_best_lh_mid_branch {
                new_best_lh_mid_branch = lh;
            } else {
                break;
            }
            if new_blength <= ctx.thresholds.min_blength_mid {
                break;
            }
            new_blength *= 0.5;
            match merge_upper_lower(
                upper,
                new_blength,
                lower,
                blength - new_blength,
                ctx.ref_seq,
                ctx.model,
                ctx.params.threshold_prob,
            ) {
                Some(m) => mid_regions = m,
                None => break,
            }
        }

        if new_best_lh_mid_branch > *best_down_lh_diff {
            *best_down_lh_diff = new_best_lh_mid_branch;
            *best_child = Some(node);
        }
    }
}

/// Halve the attachment split along an existing branch while that improves
/// the placement cost; `best_regions` holds the winning merged view.
#[allow(clippy::too_many_arguments)]
pub fn try_shorter_branch_split<const S: usize>(
    current_blength: f64,
    best_regions: &mut RegionList<S>,
    sample: &RegionList<S>,
    upper: &RegionList<S>,
    lower: &RegionList<S>,
    best_split_lh: &mut f64,
    best_split: &mut f64,
    new_branch_length: f64,
    top_side: bool,
    cost: impl Fn(&RegionList<S>, &RegionList<S>, f64) -> f64,
    ctx: &LhContext<S>,
) -> bool {
    let mut found = false;
    let mut new_split = 0.5 * *best_split;
    while new_split > ctx.thresholds.min_blength {
        let (top, bottom) = if top_side {
            (new_split, current_blength - new_split)
        } else {
            (current_blength - new_split, new_split)
        };
        let Some(merged) = merge_upper_lower(
            upper,
            top,
            lower,
            bottom,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
        ) else {
            break;
        };
        let placement_cost = cost(&merged, sample, new_branch_length);
        if placement_cost > *best_split_lh {
            *best_split_lh = placement_cost;
            *best_split = new_split;
            *best_regions = merged;
            new_split *= 0.5;
            found = true;
        } else {
            break;
        }
    }
    found
}

/// Outcome of one placement; `new_leaf` is absent when the taxon was absorbed
/// as a minor sibling.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub new_leaf: Option<NodeId>,
}

/// Place one new taxon into the tree.
pub fn place_sample<const S: usize>(
    tree: &mut Tree<S>,
    taxon: usize,
    sample: RegionList<S>,
    ctx: &LhContext<S>,
) -> Placement {
    match seek_sample_placement(tree, &sample, ctx) {
        PlacementSearch::LessInformative(leaf) => {
            tree.record_minor_sibling(leaf, taxon);
            Placement { new_leaf: None }
        }
        PlacementSearch::Found {
            node,
            lh_diff,
            is_mid_branch,
            best_up_lh_diff,
            best_down_lh_diff,
            best_child,
        } => {
            let leaf = if is_mid_branch {
                place_sample_mid_branch(tree, node, taxon, sample, lh_diff, ctx)
            } else {
                place_sample_at_node(
                    tree,
                    node,
                    taxon,
                    sample,
                    lh_diff,
                    best_up_lh_diff,
                    best_down_lh_diff,
                    best_child,
                    ctx,
                )
            };
            Placement { new_leaf: Some(leaf) }
        }
    }
}

fn sample_cost_fn<'a, const S: usize>(
    ctx: &'a LhContext<'a, S>,
) -> impl Fn(&RegionList<S>, &RegionList<S>, f64) -> f64 + 'a {
    move |parent, sample, b| sample_placement_cost(parent, sample, b, ctx.ref_seq, ctx.model)
}

fn place_sample_mid_branch<const S: usize>(
    tree: &mut Tree<S>,
    selected: NodeId,
    taxon: usize,
    sample: RegionList<S>,
    lh_diff: f64,
    ctx: &LhContext<S>,
) -> NodeId {
    let upper = tree
        .view_for(selected)
        .expect("mid-branch placement below the root")
        .clone();
    let lower = tree.node(selected).lower.clone();
    let current_blength = tree.node(selected).blength;

    let mut best_split_lh = lh_diff;
    let mut best_split = 0.5 * current_blength;
    let mut best_regions = tree
        .node(selected)
        .mid_branch
        .clone()
        .expect("mid-branch placement needs a mid-branch cache");

    let found = try_shorter_branch_split(
        current_blength,
        &mut best_regions,
        &sample,
        &upper,
        &lower,
        &mut best_split_lh,
        &mut best_split,
        ctx.thresholds.default_blength,
        true,
        sample_cost_fn(ctx),
        ctx,
    );
    if !found {
        let found_other = try_shorter_branch_split(
            current_blength,
            &mut best_regions,
            &sample,
            &upper,
            &lower,
            &mut best_split_lh,
            &mut best_split,
            ctx.thresholds.default_blength,
            false,
            sample_cost_fn(ctx),
            ctx,
        );
        if found_other {
            best_split = current_blength - best_split;
        }
    }

    let mut best_blength = ctx.thresholds.default_blength;
    estimate_new_branch_length(
        |b| sample_placement_cost(&best_regions, &sample, b, ctx.ref_seq, ctx.model),
        best_split_lh,
        &mut best_blength,
        ctx.thresholds.max_blength,
        ctx.thresholds.min_blength,
    );

    connect_sample_to_branch(
        tree,
        taxon,
        sample,
        selected,
        best_split,
        current_blength - best_split,
        best_blength,
        best_regions,
        upper,
        ctx,
    )
}

#[allow(clippy::too_many_arguments)]
fn place_sample_at_node<const S: usize>(
    tree: &mut Tree<S>,
    selected: NodeId,
    taxon: usize,
    sample: RegionList<S>,
    best_lh_diff: f64,
    best_up_lh_diff: f64,
    best_down_lh_diff: f64,
    best_child: Option<NodeId>,
    ctx: &LhContext<S>,
) -> NodeId {
    let default_blength = ctx.thresholds.default_blength;

    // option 1: attach along the best descendant branch
    let mut best_child_lh = MIN_NEGATIVE;
    let mut best_child_split = 0.0;
    let mut best_child_regions: Option<RegionList<S>> = None;
    if let Some(child) = best_child {
        best_child_lh = best_down_lh_diff;
        best_child_split = 0.5 * tree.node(child).blength;
        if let (Some(upper), Some(mid)) = (tree.view_for(child), tree.node(child).mid_branch.as_ref())
        {
            let upper = upper.clone();
            let mut regions = mid.clone();
            let lower = tree.node(child).lower.clone();
            try_shorter_branch_split(
                tree.node(child).blength,
                &mut regions,
                &sample,
                &upper,
                &lower,
                &mut best_child_lh,
                &mut best_child_split,
                default_blength,
                true,
                sample_cost_fn(ctx),
                ctx,
            );
            best_child_regions = Some(regions);
        }
    }

    // option 2: attach above the selected node (or next to the root)
    let is_root = selected == tree.root;
    let mut best_parent_lh;
    let mut best_parent_split = 0.0;
    let mut best_root_blength = -1.0;
    let mut best_parent_regions: Option<RegionList<S>> = None;
    let mut old_root_lh = MIN_NEGATIVE;

    if is_root {
        old_root_lh = crate::merge::absolute_lh_at_root(&tree.node(selected).lower, ctx.model);
        let lower = tree.node(selected).lower.clone();
        let merged = merge_two_lowers(
            &lower,
            default_blength,
            &sample,
            default_blength,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
            true,
        );
        best_parent_lh = MIN_NEGATIVE;
        best_root_blength = default_blength;
        if let Some((regions, join_lh)) = merged {
            best_parent_lh = join_lh + crate::merge::absolute_lh_at_root(&regions, ctx.model);
            best_parent_regions = Some(regions);
            try_shorter_root_split(
                &lower,
                &sample,
                default_blength,
                &mut best_parent_regions,
                &mut best_root_blength,
                &mut best_parent_lh,
                ctx,
            );
        }
        best_parent_lh -= old_root_lh;
    } else {
        best_parent_lh = best_up_lh_diff;
        best_parent_split = 0.5 * tree.node(selected).blength;
        let upper = tree
            .view_for(selected)
            .expect("non-root node has an upper view")
            .clone();
        let lower = tree.node(selected).lower.clone();
        let mut regions = match tree.node(selected).mid_branch.clone() {
            Some(m) => m,
            None => upper.clone(),
        };
        try_shorter_branch_split(
            tree.node(selected).blength,
            &mut regions,
            &sample,
            &upper,
            &lower,
            &mut best_parent_lh,
            &mut best_parent_split,
            default_blength,
            false,
            sample_cost_fn(ctx),
            ctx,
        );
        best_parent_regions = Some(regions);
    }

    // pick among: below the best child, above the node, exactly at the node
    if best_child_lh >= best_parent_lh && best_child_lh >= best_lh_diff {
        let child = best_child.expect("best_child_lh was recorded");
        let upper = tree
            .view_for(child)
            .expect("descendant placement below the root")
            .clone();
        let regions = best_child_regions.expect("regions recorded with best_child_lh");
        let mut best_blength = default_blength;
        estimate_new_branch_length(
            |b| sample_placement_cost(&regions, &sample, b, ctx.ref_seq, ctx.model),
            best_child_lh,
            &mut best_blength,
            ctx.thresholds.max_blength,
            ctx.thresholds.min_blength,
        );
        let child_blength = tree.node(child).blength;
        connect_sample_to_branch(
            tree,
            taxon,
            sample,
            child,
            best_child_split,
            child_blength - best_child_split,
            best_blength,
            regions,
            upper,
            ctx,
        )
    } else {
        // placement exactly at the node makes the new parent part of a polytomy
        let at_node = best_lh_diff >= best_parent_lh;
        if at_node {
            best_root_blength = -1.0;
            best_parent_split = -1.0;
            best_parent_lh = best_lh_diff;
            best_parent_regions = if is_root {
                merge_two_lowers(
                    &tree.node(selected).lower,
                    0.0,
                    &sample,
                    default_blength,
                    ctx.ref_seq,
                    ctx.model,
                    ctx.params.threshold_prob,
                    false,
                )
                .map(|(r, _)| r)
            } else {
                tree.node(selected).total.clone()
            };
        }

        if is_root {
            let lower = tree.node(selected).lower.clone();
            let mut best_length2 = default_blength;
            let mut root_lh = best_parent_lh + old_root_lh;
            estimate_root_branch_length(
                &lower,
                &sample,
                best_root_blength,
                &mut best_parent_regions,
                &mut best_length2,
                &mut root_lh,
                ctx,
            );
            connect_sample_to_root(
                tree,
                taxon,
                sample,
                best_root_blength,
                best_length2,
                best_parent_regions,
                ctx,
            )
        } else {
            let upper = tree
                .view_for(selected)
                .expect("non-root node has an upper view")
                .clone();
            let regions = best_parent_regions
                .unwrap_or_else(|| upper.clone());
            let mut best_blength = default_blength;
            estimate_new_branch_length(
                |b| sample_placement_cost(&regions, &sample, b, ctx.ref_seq, ctx.model),
                best_parent_lh,
                &mut best_blength,
                ctx.thresholds.max_blength,
                ctx.thresholds.min_blength,
            );
            let selected_blength = tree.node(selected).blength;
            let (top_distance, down_distance) = if best_parent_split < 0.0 {
                // polytomy: the selected node keeps no branch of its own
                tree.node_mut(selected).total = None;
                tree.node_mut(selected).mid_branch = None;
                (selected_blength, 0.0)
            } else {
                (selected_blength - best_parent_split, best_parent_split)
            };
            connect_sample_to_branch(
                tree,
                taxon,
                sample,
                selected,
                top_distance,
                down_distance,
                best_blength,
                regions,
                upper,
                ctx,
            )
        }
    }
}

/// Halve the root-side branch while the root join keeps improving.
fn try_shorter_root_split<const S: usize>(
    lower: &RegionList<S>,
    sample: &RegionList<S>,
    fixed_blength: f64,
    best_regions: &mut Option<RegionList<S>>,
    best_root_blength: &mut f64,
    best_lh: &mut f64,
    ctx: &LhContext<S>,
) {
    let mut new_blength = 0.5 * *best_root_blength;
    while new_blength > ctx.thresholds.min_blength {
        let Some((regions, join_lh)) = merge_two_lowers(
            lower,
            new_blength,
            sample,
            fixed_blength,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
            true,
        ) else {
            break;
        };
        let root_lh = join_lh + crate::merge::absolute_lh_at_root(&regions, ctx.model);
        if root_lh > *best_lh {
            *best_lh = root_lh;
            *best_root_blength = new_blength;
            *best_regions = Some(regions);
            new_blength *= 0.5;
        } else {
            break;
        }
    }
}

/// Length search for the sample's own branch when attaching at the root:
/// shorter halvings, longer doublings, then a zero-length check.
pub fn estimate_root_branch_length<const S: usize>(
    lower: &RegionList<S>,
    sample: &RegionList<S>,
    root_blength: f64,
    best_regions: &mut Option<RegionList<S>>,
    best_length: &mut f64,
    best_lh: &mut f64,
    ctx: &LhContext<S>,
) {
    let eval = |b: f64| -> Option<(RegionList<S>, f64)> {
        merge_two_lowers(
            lower,
            root_blength,
            sample,
            b,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
            true,
        )
        .map(|(regions, join_lh)| {
            let lh = join_lh + crate::merge::absolute_lh_at_root(&regions, ctx.model);
            (regions, lh)
        })
    };

    let mut found_shorter = false;
    let mut new_blength = *best_length;
    while *best_length > ctx.thresholds.min_blength {
        new_blength *= 0.5;
        match eval(new_blength) {
            Some((regions, lh)) if lh > *best_lh => {
                *best_lh = lh;
                *best_length = new_blength;
                *best_regions = Some(regions);
                found_shorter = true;
            }
            _ => break,
        }
    }
    if !found_shorter {
        let mut new_blength = *best_length;
        while *best_length < ctx.thresholds.max_blength {
            new_blength += new_blength;
            match eval(new_blength) {
                Some((regions, lh)) if lh > *best_lh => {
                    *best_lh = lh;
                    *best_length = new_blength;
                    *best_regions = Some(regions);
                }
                _ => break,
            }
        }
    }
    if *best_length < ctx.thresholds.min_blength {
        if let Some((regions, lh)) = eval(0.0) {
            if lh > *best_lh {
                *best_length = -1.0;
                *best_regions = Some(regions);
            }
        }
    }
}

/// Splice a new leaf into the branch above `sibling`: a fresh internal node
/// takes the sibling's place, with the sibling below it and the leaf beside.
#[allow(clippy::too_many_arguments)]
pub fn connect_sample_to_branch<const S: usize>(
    tree: &mut Tree<S>,
    taxon: usize,
    sample: RegionList<S>,
    sibling: NodeId,
    top_distance: f64,
    down_distance: f64,
    new_blength: f64,
    view_for_leaf: RegionList<S>,
    upper: RegionList<S>,
    ctx: &LhContext<S>,
) -> NodeId {
    let new_blength = new_blength.max(0.0);
    let (parent, slot) = tree
        .node(sibling)
        .parent
        .expect("branch splice needs a parent edge");

    let leaf = tree.push_node(PhyloNode {
        parent: None,
        kind: NodeKind::Leaf {
            taxon,
            minor_siblings: Vec::new(),
        },
        blength: new_blength,
        lower: sample,
        mid_branch: None,
        total: None,
        outdated: true,
    });

    // view for the sibling excludes it: parent view across the new top edge
    // merged with the sample
    let view_for_sibling = merge_upper_lower(
        &upper,
        top_distance,
        &tree.node(leaf).lower,
        new_blength,
        ctx.ref_seq,
        ctx.model,
        ctx.params.threshold_prob,
    );
    let mut internal_lower = merge_two_lowers(
        &tree.node(sibling).lower,
        down_distance,
        &tree.node(leaf).lower,
        new_blength,
        ctx.ref_seq,
        ctx.model,
        ctx.params.threshold_prob,
        false,
    )
    .map(|(r, _)| r);
    let mut top_distance = top_distance;
    if internal_lower.is_none() {
        // degenerate zero-length state; grow the new branch and retry
        let grown = ctx.thresholds.min_blength;
        tree.node_mut(leaf).blength = grown;
        internal_lower = merge_two_lowers(
            &tree.node(sibling).lower,
            down_distance,
            &tree.node(leaf).lower,
            grown,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
            false,
        )
        .map(|(r, _)| r);
        if internal_lower.is_none() {
            top_distance = top_distance.max(ctx.thresholds.min_blength);
        }
    }

    let internal = tree.push_node(PhyloNode {
        parent: Some((parent, slot)),
        kind: NodeKind::Internal {
            children: [sibling, leaf],
            upper_left: view_for_sibling,
            upper_right: Some(view_for_leaf),
        },
        blength: top_distance,
        lower: internal_lower.unwrap_or_default(),
        mid_branch: None,
        total: None,
        outdated: true,
    });
    tree.replace_child(parent, slot, internal);
    tree.node_mut(sibling).parent = Some((internal, ChildSlot::Left));
    tree.node_mut(sibling).blength = down_distance;
    tree.node_mut(leaf).parent = Some((internal, ChildSlot::Right));

    // caches on the new internal node and the new leaf
    tree.node_mut(internal).mid_branch = merge_upper_lower(
        &upper,
        top_distance * 0.5,
        &tree.node(internal).lower,
        top_distance * 0.5,
        ctx.ref_seq,
        ctx.model,
        ctx.params.threshold_prob,
    );
    tree.node_mut(internal).total = merge_upper_lower(
        &upper,
        top_distance,
        &tree.node(internal).lower,
        0.0,
        ctx.ref_seq,
        ctx.model,
        ctx.params.threshold_prob,
    );
    if tree.node(leaf).blength > 0.0 {
        if let Some(view) = tree.view_for(leaf).cloned() {
            let b = tree.node(leaf).blength;
            tree.node_mut(leaf).total = merge_upper_lower(
                &view,
                b,
                &tree.node(leaf).lower,
                0.0,
                ctx.ref_seq,
                ctx.model,
                ctx.params.threshold_prob,
            );
            tree.node_mut(leaf).mid_branch = merge_upper_lower(
                &view,
                b * 0.5,
                &tree.node(leaf).lower,
                b * 0.5,
                ctx.ref_seq,
                ctx.model,
                ctx.params.threshold_prob,
            );
        }
    }

    tree.refresh(
        vec![
            RefreshTask::FromParent(sibling),
            RefreshTask::FromChild {
                parent,
                child: internal,
            },
        ],
        ctx,
    );
    leaf
}

/// Attach the new leaf as a sibling of the entire current tree, creating a
/// fresh root above both.
fn connect_sample_to_root<const S: usize>(
    tree: &mut Tree<S>,
    taxon: usize,
    sample: RegionList<S>,
    root_blength: f64,
    leaf_blength: f64,
    merged_lower: Option<RegionList<S>>,
    ctx: &LhContext<S>,
) -> NodeId {
    let old_root = tree.root;
    let root_blength = root_blength.max(0.0);
    let leaf_blength = leaf_blength.max(0.0);

    let leaf = tree.push_node(PhyloNode {
        parent: None,
        kind: NodeKind::Leaf {
            taxon,
            minor_siblings: Vec::new(),
        },
        blength: leaf_blength,
        lower: sample,
        mid_branch: None,
        total: None,
        outdated: true,
    });

    let lower = merged_lower.or_else(|| {
        merge_two_lowers(
            &tree.node(old_root).lower,
            root_blength,
            &tree.node(leaf).lower,
            leaf_blength,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
            false,
        )
        .map(|(r, _)| r)
    });

    let view_for_old_root =
        total_lh_at_root(&tree.node(leaf).lower, ctx.model, leaf_blength);
    let view_for_leaf =
        total_lh_at_root(&tree.node(old_root).lower, ctx.model, root_blength);

    let new_root = tree.push_node(PhyloNode {
        parent: None,
        kind: NodeKind::Internal {
            children: [old_root, leaf],
            upper_left: Some(view_for_old_root),
            upper_right: Some(view_for_leaf),
        },
        blength: 0.0,
        lower: lower.unwrap_or_default(),
        mid_branch: None,
        total: None,
        outdated: true,
    });
    tree.node_mut(old_root).parent = Some((new_root, ChildSlot::Left));
    tree.node_mut(old_root).blength = root_blength;
    tree.node_mut(leaf).parent = Some((new_root, ChildSlot::Right));
    tree.root = new_root;

    let total = total_lh_at_root(&tree.node(new_root).lower, ctx.model, 0.0);
    tree.node_mut(new_root).total = Some(total);

    if root_blength <= 0.0 {
        tree.node_mut(old_root).total = None;
        tree.node_mut(old_root).mid_branch = None;
    }
    if leaf_blength > 0.0 {
        if let Some(view) = tree.view_for(leaf).cloned() {
            tree.node_mut(leaf).total = merge_upper_lower(
                &view,
                leaf_blength,
                &tree.node(leaf).lower,
                0.0,
                ctx.ref_seq,
                ctx.model,
                ctx.params.threshold_prob,
            );
            tree.node_mut(leaf).mid_branch = merge_upper_lower(
                &view,
                leaf_blength * 0.5,
                &tree.node(leaf).lower,
                leaf_blength * 0.5,
                ctx.ref_seq,
                ctx.model,
                ctx.params.threshold_prob,
            );
        }
    }

    tree.refresh(vec![RefreshTask::FromParent(old_root)], ctx);
    leaf
}
