//! Subtree pruning and regrafting.
//!
//! Every outdated node is considered for re-placement: its current attachment
//! is scored, the branch length re-optimized, and a frontier search walks
//! outward from the original edge scoring mid-branch and on-node candidates.
//! While the frontier crosses the region whose caches would change if the
//! subtree were removed, the needed views are recomputed lazily; once a
//! recomputed view stops differing from the cache, the walk switches back to
//! cached lists.

use std::borrow::Cow;

use crate::blength::estimate_branch_length;
use crate::cost::{subtree_placement_cost, try_longer_lengths, try_shorter_lengths};
use crate::merge::{absolute_lh_at_root, merge_two_lowers, merge_upper_lower, total_lh_at_root};
use crate::region::RegionList;
use crate::tree::{ChildSlot, LhContext, NodeId, NodeKind, RefreshTask, Tree};
use crate::utils::MIN_NEGATIVE;

#[derive(Debug, Clone, Copy)]
struct SprBest {
    node: NodeId,
    lh_diff: f64,
    is_mid_branch: bool,
}

enum SprEntry<'t, const S: usize> {
    /// Moving from a parent into `node`: examine `node`'s upper branch and
    /// keep descending.
    Down {
        node: NodeId,
        incoming: Cow<'t, RegionList<S>>,
        branch: f64,
        needs_update: bool,
        lh: f64,
        failures: u32,
    },
    /// Crawling from `child` up into `parent`: examine `parent`'s position
    /// and upper branch with the child's (pruned) lower folded in.
    Up {
        parent: NodeId,
        child: NodeId,
        child_lower: Cow<'t, RegionList<S>>,
        branch: f64,
        needs_update: bool,
        lh: f64,
        failures: u32,
    },
}

/// Sum two possibly-zero branch lengths the way a pruned edge collapses.
fn combine_blengths(a: f64, b: f64) -> f64 {
    if a > 0.0 {
        if b > 0.0 { a + b } else { a }
    } else {
        b
    }
}

/// Highest node of the polytomy containing `node`.
fn polytomy_top<const S: usize>(tree: &Tree<S>, mut node: NodeId) -> NodeId {
    while node != tree.root && tree.node(node).blength <= 0.0 {
        match tree.node(node).parent {
            Some((p, _)) => node = p,
            None => break,
        }
    }
    node
}

/// Search for a better attachment edge for the subtree rooted at `pruned`,
/// scoring candidates as if the subtree had been removed from its current
/// position. Returns the best candidate found (possibly the current parent).
fn seek_subtree_placement<'t, const S: usize>(
    tree: &'t Tree<S>,
    pruned: NodeId,
    removed_blength: f64,
    initial_best: f64,
    short_range: bool,
    ctx: &LhContext<S>,
) -> SprBest {
    let (failure_limit, lh_thresh, stop_rule) = if short_range {
        (
            ctx.params.failure_limit_subtree_short_search,
            ctx.params.thresh_log_lh_subtree_short_search,
            ctx.params.stop_rule_subtree_short_search,
        )
    } else {
        (
            ctx.params.failure_limit_subtree,
            ctx.params.thresh_log_lh_subtree,
            ctx.params.stop_rule_subtree,
        )
    };

    let (parent, _) = tree.node(pruned).parent.expect("cannot re-place the root");
    let sibling = tree.sibling(pruned).expect("pruned node has a sibling");
    let moved = &tree.node(pruned).lower;
    let genome_length = ctx.ref_seq.len();

    let mut best = SprBest {
        node: parent,
        lh_diff: initial_best,
        is_mid_branch: false,
    };

    let mut stack: Vec<SprEntry<'t, S>> = Vec::new();
    if parent != tree.root {
        let combined = combine_blengths(tree.node(sibling).blength, tree.node(parent).blength);
        let (grandparent, _) = tree.node(parent).parent.expect("non-root parent");
        stack.push(SprEntry::Up {
            parent: grandparent,
            child: parent,
            child_lower: Cow::Borrowed(&tree.node(sibling).lower),
            branch: combined,
            needs_update: true,
            lh: initial_best,
            failures: 0,
        });
        if let Some(view) = tree.view_for(parent) {
            stack.push(SprEntry::Down {
                node: sibling,
                incoming: Cow::Borrowed(view),
                branch: combined,
                needs_update: true,
                lh: initial_best,
                failures: 0,
            });
        }
    } else if let Some([gc1, gc2]) = tree.children(sibling) {
        // the sibling will become the root; its children see root-mixed views
        stack.push(SprEntry::Down {
            node: gc1,
            incoming: Cow::Owned(total_lh_at_root(
                &tree.node(gc2).lower,
                ctx.model,
                tree.node(gc2).blength,
            )),
            branch: tree.node(gc1).blength,
            needs_update: true,
            lh: initial_best,
            failures: 0,
        });
        stack.push(SprEntry::Down {
            node: gc2,
            incoming: Cow::Owned(total_lh_at_root(
                &tree.node(gc1).lower,
                ctx.model,
                tree.node(gc1).blength,
            )),
            branch: tree.node(gc2).blength,
            needs_update: true,
            lh: initial_best,
            failures: 0,
        });
    }

    while let Some(entry) = stack.pop() {
        match entry {
            SprEntry::Down {
                node,
                incoming,
                branch,
                mut needs_update,
                lh: prev_lh,
                failures,
            } => {
                let mut failures = failures;
                let mut lh_at_node = prev_lh;
                if branch > 0.0 {
                    // mid-branch candidate, skipping the original attachment
                    let at_old_edge =
                        tree.node(node).parent.map(|(p, _)| p) == Some(parent);
                    if node != tree.root && !at_old_edge {
                        let mid: Option<Cow<RegionList<S>>> = if needs_update {
                            merge_upper_lower(
                                &incoming,
                                branch * 0.5,
                                &tree.node(node).lower,
                                branch * 0.5,
                                ctx.ref_seq,
                                ctx.model,
                                ctx.params.threshold_prob,
                            )
                            .map(Cow::Owned)
                        } else {
                            tree.node(node).mid_branch.as_ref().map(Cow::Borrowed)
                        };
                        let Some(mid) = mid else { continue };
                        let lh_mid = subtree_placement_cost(
                            &mid,
                            moved,
                            removed_blength,
                            ctx.ref_seq,
                            ctx.model,
                        );
                        if lh_mid > best.lh_diff {
                            best = SprBest {
                                node,
                                lh_diff: lh_mid,
                                is_mid_branch: true,
                            };
                            failures = 0;
                        }
                    }

                    // on-node candidate
                    let at: Option<Cow<RegionList<S>>> = if needs_update {
                        merge_upper_lower(
                            &incoming,
                            branch,
                            &tree.node(node).lower,
                            0.0,
                            ctx.ref_seq,
                            ctx.model,
                            ctx.params.threshold_prob,
                        )
                        .map(Cow::Owned)
                    } else {
                        tree.node(node).total.as_ref().map(Cow::Borrowed)
                    };
                    let Some(at) = at else { continue };
                    if needs_update {
                        if let Some(total) = &tree.node(node).total {
                            if !at.differs_from(
                                total,
                                genome_length,
                                ctx.params.threshold_prob,
                                ctx.params.thresh_diff_update,
                                ctx.params.thresh_diff_fold_update,
                            ) {
                                needs_update = false;
                            }
                        }
                    }
                    lh_at_node =
                        subtree_placement_cost(&at, moved, removed_blength, ctx.ref_seq, ctx.model);
                    if lh_at_node > best.lh_diff {
                        best = SprBest {
                            node,
                            lh_diff: lh_at_node,
                            is_mid_branch: false,
                        };
                        failures = 0;
                    } else if lh_at_node < prev_lh - ctx.params.thresh_log_lh_failure {
                        failures += 1;
                    }
                }

                let within_failures = failures <= failure_limit;
                let within_lh = lh_at_node > best.lh_diff - lh_thresh;
                if stop_rule.allows(within_failures, within_lh) {
                    if let Some([left, right]) = tree.children(node) {
                        for (child, other) in [(left, right), (right, left)] {
                            let inc: Option<Cow<RegionList<S>>> = if needs_update {
                                merge_upper_lower(
                                    &incoming,
                                    branch,
                                    &tree.node(other).lower,
                                    tree.node(other).blength,
                                    ctx.ref_seq,
                                    ctx.model,
                                    ctx.params.threshold_prob,
                                )
                                .map(Cow::Owned)
                            } else {
                                tree.view_for(child).map(Cow::Borrowed)
                            };
                            if let Some(inc) = inc {
                                stack.push(SprEntry::Down {
                                    node: child,
                                    incoming: inc,
                                    branch: tree.node(child).blength,
                                    needs_update,
                                    lh: lh_at_node,
                                    failures,
                                });
                            }
                        }
                    }
                }
            }
            SprEntry::Up {
                parent: at_node,
                child,
                child_lower,
                branch,
                mut needs_update,
                lh: prev_lh,
                failures,
            } => {
                let mut failures = failures;
                let other = match tree.children(at_node) {
                    Some([l, r]) => {
                        if l == child {
                            r
                        } else {
                            l
                        }
                    }
                    None => continue,
                };
                let node_blength = tree.node(at_node).blength;
                let is_root = at_node == tree.root;

                let mut lh_at_node = prev_lh;
                if node_blength > 0.0 || is_root {
                    let at: Option<Cow<RegionList<S>>> = if needs_update {
                        tree.view_for(child).and_then(|view| {
                            merge_upper_lower(
                                view,
                                0.0,
                                &child_lower,
                                branch,
                                ctx.ref_seq,
                                ctx.model,
                                ctx.params.threshold_prob,
                            )
                        })
                        .map(Cow::Owned)
                    } else {
                        tree.node(at_node).total.as_ref().map(Cow::Borrowed)
                    };
                    let Some(at) = at else { continue };
                    if needs_update {
                        if let Some(total) = &tree.node(at_node).total {
                            if !at.differs_from(
                                total,
                                genome_length,
                                ctx.params.threshold_prob,
                                ctx.params.thresh_diff_update,
                                ctx.params.thresh_diff_fold_update,
                            ) {
                                needs_update = false;
                            }
                        }
                    }
                    lh_at_node =
                        subtree_placement_cost(&at, moved, removed_blength, ctx.ref_seq, ctx.model);
                    if lh_at_node > best.lh_diff {
                        best = SprBest {
                            node: at_node,
                            lh_diff: lh_at_node,
                            is_mid_branch: false,
                        };
                        failures = 0;
                    } else if lh_at_node < prev_lh - ctx.params.thresh_log_lh_failure {
                        failures += 1;
                    }
                }

                // mid-branch candidate on the examined node's upper branch
                let mut bottom: Option<RegionList<S>> = None;
                if node_blength > 0.0 && !is_root {
                    let mid: Option<Cow<RegionList<S>>> = if needs_update {
                        let Some((b, _)) = merge_two_lowers(
                            &tree.node(other).lower,
                            tree.node(other).blength,
                            &child_lower,
                            branch,
                            ctx.ref_seq,
                            ctx.model,
                            ctx.params.threshold_prob,
                            false,
                        ) else {
                            continue;
                        };
                        let mid = tree.view_for(at_node).and_then(|view| {
                            merge_upper_lower(
                                view,
                                node_blength * 0.5,
                                &b,
                                node_blength * 0.5,
                                ctx.ref_seq,
                                ctx.model,
                                ctx.params.threshold_prob,
                            )
                        });
                        bottom = Some(b);
                        mid.map(Cow::Owned)
                    } else {
                        tree.node(at_node).mid_branch.as_ref().map(Cow::Borrowed)
                    };
                    let Some(mid) = mid else { continue };
                    let lh_mid = subtree_placement_cost(
                        &mid,
                        moved,
                        removed_blength,
                        ctx.ref_seq,
                        ctx.model,
                    );
                    if lh_mid > best.lh_diff {
                        best = SprBest {
                            node: at_node,
                            lh_diff: lh_mid,
                            is_mid_branch: true,
                        };
                        failures = 0;
                    }
                }

                let within_failures = failures <= failure_limit;
                let within_lh = lh_at_node > best.lh_diff - lh_thresh;
                if stop_rule.allows(within_failures, within_lh) {
                    if !is_root {
                        let inc: Option<Cow<RegionList<S>>> = if needs_update {
                            tree.view_for(at_node).and_then(|view| {
                                merge_upper_lower(
                                    view,
                                    node_blength,
                                    &child_lower,
                                    branch,
                                    ctx.ref_seq,
                                    ctx.model,
                                    ctx.params.threshold_prob,
                                )
                            })
                            .map(Cow::Owned)
                        } else {
                            tree.view_for(other).map(Cow::Borrowed)
                        };
                        let Some(inc) = inc else { continue };
                        stack.push(SprEntry::Down {
                            node: other,
                            incoming: inc,
                            branch: tree.node(other).blength,
                            needs_update,
                            lh: lh_at_node,
                            failures,
                        });

                        let bot: Cow<RegionList<S>> = if needs_update {
                            match bottom.take() {
                                Some(b) => Cow::Owned(b),
                                None => {
                                    let Some((b, _)) = merge_two_lowers(
                                        &tree.node(other).lower,
                                        tree.node(other).blength,
                                        &child_lower,
                                        branch,
                                        ctx.ref_seq,
                                        ctx.model,
                                        ctx.params.threshold_prob,
                                        false,
                                    ) else {
                                        continue;
                                    };
                                    Cow::Owned(b)
                                }
                            }
                        } else {
                            Cow::Borrowed(&tree.node(at_node).lower)
                        };
                        let (grand, _) =
                            tree.node(at_node).parent.expect("non-root has a parent");
                        stack.push(SprEntry::Up {
                            parent: grand,
                            child: at_node,
                            child_lower: bot,
                            branch: node_blength,
                            needs_update,
                            lh: lh_at_node,
                            failures,
                        });
                    } else {
                        let inc: Option<Cow<RegionList<S>>> = if needs_update {
                            Some(Cow::Owned(total_lh_at_root(
                                &child_lower,
                                ctx.model,
                                branch,
                            )))
                        } else {
                            tree.view_for(other).map(Cow::Borrowed)
                        };
                        if let Some(inc) = inc {
                            stack.push(SprEntry::Down {
                                node: other,
                                incoming: inc,
                                branch: tree.node(other).blength,
                                needs_update,
                                lh: lh_at_node,
                                failures,
                            });
                        }
                    }
                }
            }
        }
    }
    best
}

/// One SPR attempt for `node`. Returns the achieved improvement (0 when the
/// placement was already good or no better edge was found).
pub fn improve_subtree<const S: usize>(
    tree: &mut Tree<S>,
    node: NodeId,
    short_range: bool,
    ctx: &LhContext<S>,
) -> f64 {
    if node == tree.root {
        return 0.0;
    }
    let thresh_cost = if short_range {
        ctx.params.thresh_placement_cost_short_search
    } else {
        ctx.params.thresh_placement_cost
    };

    let Some(upper) = tree.view_for(node).cloned() else {
        return 0.0;
    };
    let lower = tree.node(node).lower.clone();
    let mut best_blength = tree.node(node).blength;
    let mut best_lh =
        subtree_placement_cost(&upper, &lower, best_blength, ctx.ref_seq, ctx.model);
    let mut blength_changed = false;

    if best_lh < thresh_cost {
        // the placement may just have a bad branch length
        let original_lh = best_lh;
        let zero_length = tree.node(node).blength <= 0.0;
        if zero_length {
            best_blength = ctx.thresholds.min_blength;
            best_lh =
                subtree_placement_cost(&upper, &lower, best_blength, ctx.ref_seq, ctx.model);
        }
        let cached_blength = best_blength;
        let cost =
            |b: f64| subtree_placement_cost(&upper, &lower, b, ctx.ref_seq, ctx.model);
        let found =
            try_shorter_lengths(cost, &mut best_blength, &mut best_lh, 2.0 * ctx.thresholds.min_blength);
        if !found {
            try_longer_lengths(
                cost,
                &mut best_blength,
                &mut best_lh,
                0.5 * ctx.thresholds.max_blength,
            );
        }
        if cached_blength != best_blength {
            blength_changed = true;
        }
        if zero_length && original_lh > best_lh {
            best_lh = original_lh;
        }
    }

    let mut total_improvement = 0.0;
    if best_lh < thresh_cost {
        let (parent, _) = tree.node(node).parent.expect("non-root has a parent");
        let best = seek_subtree_placement(tree, node, best_blength, best_lh, short_range, ctx);

        let mut topology_updated = false;
        if best.lh_diff + thresh_cost > best_lh && best.node != parent {
            let above_sibling = best.is_mid_branch
                && tree.node(best.node).parent.map(|(p, _)| p) == Some(parent);
            let same_polytomy = !best.is_mid_branch
                && polytomy_top(tree, best.node) == polytomy_top(tree, parent);
            if !above_sibling && !same_polytomy {
                total_improvement = best.lh_diff - best_lh;
                apply_spr(
                    tree,
                    node,
                    best.node,
                    best.is_mid_branch,
                    best_blength,
                    best.lh_diff,
                    ctx,
                );
                topology_updated = true;
            }
        }
        if !topology_updated && blength_changed {
            handle_blength_changed(tree, node, best_blength, ctx);
        }
    } else if blength_changed {
        handle_blength_changed(tree, node, best_blength, ctx);
    }
    total_improvement
}

fn handle_blength_changed<const S: usize>(
    tree: &mut Tree<S>,
    node: NodeId,
    best_blength: f64,
    ctx: &LhContext<S>,
) {
    tree.node_mut(node).blength = best_blength.max(0.0);
    let mut stack = vec![RefreshTask::FromParent(node)];
    if let Some((parent, _)) = tree.node(node).parent {
        stack.push(RefreshTask::FromChild {
            parent,
            child: node,
        });
    }
    tree.refresh(stack, ctx);
}

/// Detach `pruned` from its current edge and re-attach it at `best_node`.
fn apply_spr<const S: usize>(
    tree: &mut Tree<S>,
    pruned: NodeId,
    best_node: NodeId,
    is_mid_branch: bool,
    branch_length: f64,
    best_lh_diff: f64,
    ctx: &LhContext<S>,
) {
    let (old_parent, _) = tree.node(pruned).parent.expect("cannot prune the root");
    let sibling = tree.sibling(pruned).expect("pruned node has a sibling");

    // detach: the old parent drops out, grandparent adopts the sibling with
    // the two edge lengths summed
    if old_parent == tree.root {
        tree.node_mut(sibling).parent = None;
        tree.node_mut(sibling).blength = 0.0;
        tree.root = sibling;
        tree.node_mut(sibling).mid_branch = None;
        let total = total_lh_at_root(&tree.node(sibling).lower, ctx.model, 0.0);
        tree.node_mut(sibling).total = Some(total);
        if let Some([left, right]) = tree.children(sibling) {
            let view_left = total_lh_at_root(
                &tree.node(right).lower,
                ctx.model,
                tree.node(right).blength,
            );
            let view_right = total_lh_at_root(
                &tree.node(left).lower,
                ctx.model,
                tree.node(left).blength,
            );
            tree.set_view_for(left, view_left);
            tree.set_view_for(right, view_right);
            tree.refresh(
                vec![RefreshTask::FromParent(left), RefreshTask::FromParent(right)],
                ctx,
            );
        }
    } else {
        let (grandparent, slot) = tree.node(old_parent).parent.expect("non-root parent");
        let combined =
            combine_blengths(tree.node(sibling).blength, tree.node(old_parent).blength);
        tree.replace_child(grandparent, slot, sibling);
        tree.node_mut(sibling).blength = combined;
        tree.refresh(
            vec![
                RefreshTask::FromParent(sibling),
                RefreshTask::FromChild {
                    parent: grandparent,
                    child: sibling,
                },
            ],
            ctx,
        );
    }
    tree.node_mut(old_parent).parent = None;

    // re-graft, reusing the detached internal node
    if is_mid_branch && best_node != tree.root {
        place_subtree_mid_branch(tree, best_node, pruned, old_parent, branch_length, best_lh_diff, ctx);
    } else {
        place_subtree_at_node(tree, best_node, pruned, old_parent, branch_length, best_lh_diff, ctx);
    }
}

fn subtree_new_branch_search<const S: usize>(
    regions: &RegionList<S>,
    moved: &RegionList<S>,
    start_lh: f64,
    best_blength: &mut f64,
    long_thresh: f64,
    optional_check: bool,
    ctx: &LhContext<S>,
) {
    let cost =
        |b: f64| subtree_placement_cost(regions, moved, b, ctx.ref_seq, ctx.model);
    let mut best_lh = start_lh;
    if optional_check {
        *best_blength = ctx.thresholds.min_blength;
        best_lh = cost(*best_blength);
    }
    let found = try_shorter_lengths(cost, best_blength, &mut best_lh, ctx.thresholds.min_blength);
    if optional_check || !found {
        try_longer_lengths(cost, best_blength, &mut best_lh, long_thresh);
    }
    if *best_blength < 2.0 * ctx.thresholds.min_blength {
        let zero_lh = cost(0.0);
        if zero_lh > best_lh {
            *best_blength = -1.0;
        }
    }
}

fn place_subtree_mid_branch<const S: usize>(
    tree: &mut Tree<S>,
    selected: NodeId,
    pruned: NodeId,
    spare: NodeId,
    new_branch_length: f64,
    new_lh: f64,
    ctx: &LhContext<S>,
) {
    let upper = tree
        .view_for(selected)
        .expect("mid-branch graft below the root")
        .clone();
    let lower = tree.node(selected).lower.clone();
    let moved = tree.node(pruned).lower.clone();
    let current_blength = tree.node(selected).blength;

    let mut best_split_lh = new_lh;
    let mut best_split = 0.5 * current_blength;
    let mut best_regions = match tree.node(selected).mid_branch.clone() {
        Some(m) => m,
        None => upper.clone(),
    };
    let cost = |parent: &RegionList<S>, moved: &RegionList<S>, b: f64| {
        subtree_placement_cost(parent, moved, b, ctx.ref_seq, ctx.model)
    };
    let found = crate::place::try_shorter_branch_split(
        current_blength,
        &mut best_regions,
        &moved,
        &upper,
        &lower,
        &mut best_split_lh,
        &mut best_split,
        new_branch_length,
        true,
        cost,
        ctx,
    );
    if !found {
        let found_other = crate::place::try_shorter_branch_split(
            current_blength,
            &mut best_regions,
            &moved,
            &upper,
            &lower,
            &mut best_split_lh,
            &mut best_split,
            new_branch_length,
            false,
            cost,
            ctx,
        );
        if found_other {
            best_split = current_blength - best_split;
        }
    }

    let mut best_blength = new_branch_length;
    subtree_new_branch_search(
        &best_regions,
        &moved,
        best_split_lh,
        &mut best_blength,
        ctx.thresholds.max_blength,
        new_branch_length <= 0.0,
        ctx,
    );

    connect_subtree_to_branch(
        tree,
        pruned,
        spare,
        selected,
        best_split,
        current_blength - best_split,
        best_blength,
        Some(best_regions),
        upper,
        ctx,
    );
}

fn place_subtree_at_node<const S: usize>(
    tree: &mut Tree<S>,
    selected: NodeId,
    pruned: NodeId,
    spare: NodeId,
    new_branch_length: f64,
    new_lh: f64,
    ctx: &LhContext<S>,
) {
    let moved = tree.node(pruned).lower.clone();
    let default_blength = ctx.thresholds.default_blength;

    // fine-grained exploration through the polytomy below the selected node
    let mut best_down_lh_diff = MIN_NEGATIVE;
    let mut best_child: Option<NodeId> = None;
    let mut best_child_split = -1.0;
    let mut best_child_regions: Option<RegionList<S>> = None;
    handle_polytomy_place_subtree(
        tree,
        selected,
        &moved,
        new_branch_length,
        &mut best_down_lh_diff,
        &mut best_child,
        &mut best_child_split,
        &mut best_child_regions,
        ctx,
    );

    let mut best_child_lh = MIN_NEGATIVE;
    if let Some(child) = best_child {
        best_child_lh = best_down_lh_diff;
        if best_child_split < 0.0 {
            best_child_split = 0.5 * tree.node(child).blength;
        }
        if let Some(upper) = tree.view_for(child).cloned() {
            let lower = tree.node(child).lower.clone();
            let mut regions = best_child_regions
                .take()
                .or_else(|| tree.node(child).mid_branch.clone())
                .unwrap_or_else(|| upper.clone());
            crate::place::try_shorter_branch_split(
                tree.node(child).blength,
                &mut regions,
                &moved,
                &upper,
                &lower,
                &mut best_child_lh,
                &mut best_child_split,
                new_branch_length,
                true,
                |parent, moved, b| {
                    subtree_placement_cost(parent, moved, b, ctx.ref_seq, ctx.model)
                },
                ctx,
            );
            best_child_regions = Some(regions);
        }
    }

    let is_root = selected == tree.root;
    let mut best_parent_lh;
    let mut best_parent_split = 0.0;
    let mut best_root_blength = -1.0;
    let mut best_parent_regions: Option<RegionList<S>> = None;
    let mut old_root_lh = MIN_NEGATIVE;

    if is_root {
        old_root_lh = absolute_lh_at_root(&tree.node(selected).lower, ctx.model);
        let lower = tree.node(selected).lower.clone();
        best_parent_lh = MIN_NEGATIVE;
        best_root_blength = default_blength;
        if let Some((regions, join_lh)) = merge_two_lowers(
            &lower,
            default_blength,
            &moved,
            new_branch_length,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
            true,
        ) {
            best_parent_lh = join_lh + absolute_lh_at_root(&regions, ctx.model);
            best_parent_regions = Some(regions);
            let mut new_blength = 0.5 * best_root_blength;
            while new_blength > ctx.thresholds.min_blength {
                let Some((regions, join_lh)) = merge_two_lowers(
                    &lower,
                    new_blength,
                    &moved,
                    new_branch_length,
                    ctx.ref_seq,
                    ctx.model,
                    ctx.params.threshold_prob,
                    true,
                ) else {
                    break;
                };
                let root_lh = join_lh + absolute_lh_at_root(&regions, ctx.model);
                if root_lh > best_parent_lh {
                    best_parent_lh = root_lh;
                    best_root_blength = new_blength;
                    best_parent_regions = Some(regions);
                    new_blength *= 0.5;
                } else {
                    break;
                }
            }
        }
        best_parent_lh -= old_root_lh;
    } else {
        let upper = tree
            .view_for(selected)
            .expect("non-root node has an upper view")
            .clone();
        let lower = tree.node(selected).lower.clone();
        let mut regions = match tree.node(selected).mid_branch.clone() {
            Some(m) => m,
            None => upper.clone(),
        };
        best_parent_lh =
            subtree_placement_cost(&regions, &moved, new_branch_length, ctx.ref_seq, ctx.model);
        best_parent_split = 0.5 * tree.node(selected).blength;
        crate::place::try_shorter_branch_split(
            tree.node(selected).blength,
            &mut regions,
            &moved,
            &upper,
            &lower,
            &mut best_parent_lh,
            &mut best_parent_split,
            new_branch_length,
            false,
            |parent, moved, b| subtree_placement_cost(parent, moved, b, ctx.ref_seq, ctx.model),
            ctx,
        );
        best_parent_regions = Some(regions);
    }

    if best_child_lh >= best_parent_lh && best_child_lh >= new_lh {
        let child = best_child.expect("best_child_lh was recorded");
        let upper = tree
            .view_for(child)
            .expect("descendant graft below the root")
            .clone();
        let regions = best_child_regions.expect("regions recorded with best_child_lh");
        let mut best_blength = new_branch_length;
        subtree_new_branch_search(
            &regions,
            &moved,
            best_child_lh,
            &mut best_blength,
            ctx.thresholds.max_blength,
            new_branch_length <= 0.0,
            ctx,
        );
        let child_blength = tree.node(child).blength;
        connect_subtree_to_branch(
            tree,
            pruned,
            spare,
            child,
            best_child_split,
            child_blength - best_child_split,
            best_blength,
            Some(regions),
            upper,
            ctx,
        );
    } else {
        let at_node = new_lh >= best_parent_lh;
        if at_node {
            best_root_blength = -1.0;
            best_parent_split = -1.0;
            best_parent_lh = new_lh;
            best_parent_regions = if is_root {
                merge_two_lowers(
                    &tree.node(selected).lower,
                    0.0,
                    &moved,
                    new_branch_length,
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
            let mut best_length2 = new_branch_length;
            let mut root_lh = best_parent_lh + old_root_lh;
            crate::place::estimate_root_branch_length(
                &lower,
                &moved,
                best_root_blength,
                &mut best_parent_regions,
                &mut best_length2,
                &mut root_lh,
                ctx,
            );
            connect_subtree_to_root(
                tree,
                pruned,
                spare,
                best_root_blength,
                best_length2,
                best_parent_regions,
                ctx,
            );
        } else {
            let upper = tree
                .view_for(selected)
                .expect("non-root node has an upper view")
                .clone();
            let regions = best_parent_regions.unwrap_or_else(|| upper.clone());
            let mut best_blength = new_branch_length;
            subtree_new_branch_search(
                &regions,
                &moved,
                best_parent_lh,
                &mut best_blength,
                (new_branch_length * 10.0).max(ctx.thresholds.max_blength),
                new_branch_length <= 0.0,
                ctx,
            );
            let selected_blength = tree.node(selected).blength;
            let (top_distance, down_distance) = if best_parent_split <= 0.0 {
                tree.node_mut(selected).total = None;
                tree.node_mut(selected).mid_branch = None;
                (selected_blength, 0.0)
            } else {
                (selected_blength - best_parent_split, best_parent_split)
            };
            connect_subtree_to_branch(
                tree,
                pruned,
                spare,
                selected,
                top_distance,
                down_distance,
                best_blength,
                None,
                upper,
                ctx,
            );
        }
    }
}

/// Probe the polytomy below `selected` for a better descendant branch,
/// remembering the winning split and merged view.
#[allow(clippy::too_many_arguments)]
fn handle_polytomy_place_subtree<const S: usize>(
    tree: &Tree<S>,
    selected: NodeId,
    moved: &RegionList<S>,
    new_branch_length: f64,
    best_down_lh_diff: &mut f64,
    best_child: &mut Option<NodeId>,
    best_child_split: &mut f64,
    best_child_regions: &mut Option<RegionList<S>>,
    ctx: &LhContext<S>,
) {
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
        let Some(cached_mid) = tree.node(node).mid_branch.clone() else {
            continue;
        };
        let Some(upper) = tree.view_for(node) else {
            continue;
        };
        let lower = &tree.node(node).lower;
        let blength = tree.node(node).blength;

        let mut mid_regions = cached_mid;
        let mut split = 0.5 * blength;
        loop {
            let lh = subtree_placement_cost(
                &mid_regions,
                moved,
                new_branch_length,
                ctx.ref_seq,
                ctx.model,
            );
            if lh > *best_down_lh_diff {
                *best_down_lh_diff = lh;
                *best_child = Some(node);
                *best_child_split = split;
                *best_child_regions = Some(mid_regions.clone());
                split *= 0.5;
                if split <= 0.5 * ctx.thresholds.min_blength_mid {
                    break;
                }
                match merge_upper_lower(
                    upper,
                    split,
                    lower,
                    blength - split,
                    ctx.ref_seq,
                    ctx.model,
                    ctx.params.threshold_prob,
                ) {
                    Some(m) => mid_regions = m,
                    None => break,
                }
            } else {
                break;
            }
        }
    }
}

/// Wire the detached subtree (and its spare internal node) into the branch
/// above `sibling`.
#[allow(clippy::too_many_arguments)]
fn connect_subtree_to_branch<const S: usize>(
    tree: &mut Tree<S>,
    pruned: NodeId,
    spare: NodeId,
    sibling: NodeId,
    top_distance: f64,
    down_distance: f64,
    best_blength: f64,
    view_for_pruned: Option<RegionList<S>>,
    upper: RegionList<S>,
    ctx: &LhContext<S>,
) {
    let mut best_blength = best_blength.max(0.0);
    let (parent, slot) = tree
        .node(sibling)
        .parent
        .expect("graft target has a parent edge");

    tree.node_mut(spare).parent = Some((parent, slot));
    tree.node_mut(spare).blength = top_distance;
    tree.node_mut(spare).outdated = true;
    tree.replace_child(parent, slot, spare);
    tree.node_mut(sibling).parent = Some((spare, ChildSlot::Left));
    tree.node_mut(sibling).blength = down_distance;
    tree.node_mut(pruned).parent = Some((spare, ChildSlot::Right));
    tree.node_mut(pruned).blength = best_blength;

    let mut new_lower = merge_two_lowers(
        &tree.node(sibling).lower,
        down_distance,
        &tree.node(pruned).lower,
        best_blength,
        ctx.ref_seq,
        ctx.model,
        ctx.params.threshold_prob,
        false,
    )
    .map(|(r, _)| r);
    if new_lower.is_none() {
        eprintln!("warning: empty lower view while grafting; forcing minimum branch length");
        best_blength = ctx.thresholds.min_blength;
        tree.node_mut(pruned).blength = best_blength;
        new_lower = merge_two_lowers(
            &tree.node(sibling).lower,
            down_distance,
            &tree.node(pruned).lower,
            best_blength,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
            false,
        )
        .map(|(r, _)| r);
    }
    if let Some(lower) = new_lower {
        tree.node_mut(spare).lower = lower;
    }

    let view_for_pruned = view_for_pruned.or_else(|| {
        merge_upper_lower(
            &upper,
            top_distance,
            &tree.node(sibling).lower,
            down_distance,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
        )
    });
    let view_for_sibling = merge_upper_lower(
        &upper,
        top_distance,
        &tree.node(pruned).lower,
        best_blength,
        ctx.ref_seq,
        ctx.model,
        ctx.params.threshold_prob,
    );
    match &mut tree.node_mut(spare).kind {
        NodeKind::Internal {
            children,
            upper_left,
            upper_right,
        } => {
            *children = [sibling, pruned];
            *upper_left = view_for_sibling;
            *upper_right = view_for_pruned;
        }
        NodeKind::Leaf { .. } => unreachable!("spare node is internal"),
    }

    tree.node_mut(spare).mid_branch = merge_upper_lower(
        &upper,
        top_distance * 0.5,
        &tree.node(spare).lower,
        top_distance * 0.5,
        ctx.ref_seq,
        ctx.model,
        ctx.params.threshold_prob,
    );
    tree.node_mut(spare).total = merge_upper_lower(
        &upper,
        top_distance,
        &tree.node(spare).lower,
        0.0,
        ctx.ref_seq,
        ctx.model,
        ctx.params.threshold_prob,
    );

    tree.refresh(
        vec![
            RefreshTask::FromParent(sibling),
            RefreshTask::FromParent(pruned),
            RefreshTask::FromChild {
                parent,
                child: spare,
            },
        ],
        ctx,
    );
}

/// Re-root: the spare internal node becomes the new root with the old root
/// and the moved subtree as its children.
fn connect_subtree_to_root<const S: usize>(
    tree: &mut Tree<S>,
    pruned: NodeId,
    spare: NodeId,
    root_blength: f64,
    subtree_blength: f64,
    merged_lower: Option<RegionList<S>>,
    ctx: &LhContext<S>,
) {
    let old_root = tree.root;
    let root_blength = root_blength.max(0.0);
    let subtree_blength = subtree_blength.max(0.0);

    tree.node_mut(spare).parent = None;
    tree.node_mut(spare).blength = 0.0;
    tree.node_mut(spare).outdated = true;
    tree.node_mut(old_root).parent = Some((spare, ChildSlot::Left));
    tree.node_mut(old_root).blength = root_blength;
    tree.node_mut(pruned).parent = Some((spare, ChildSlot::Right));
    tree.node_mut(pruned).blength = subtree_blength;
    tree.root = spare;

    let lower = merged_lower.or_else(|| {
        merge_two_lowers(
            &tree.node(old_root).lower,
            root_blength,
            &tree.node(pruned).lower,
            subtree_blength,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
            false,
        )
        .map(|(r, _)| r)
    });
    if let Some(lower) = lower {
        tree.node_mut(spare).lower = lower;
    }

    let view_for_old_root =
        total_lh_at_root(&tree.node(pruned).lower, ctx.model, subtree_blength);
    let view_for_pruned =
        total_lh_at_root(&tree.node(old_root).lower, ctx.model, root_blength);
    match &mut tree.node_mut(spare).kind {
        NodeKind::Internal {
            children,
            upper_left,
            upper_right,
        } => {
            *children = [old_root, pruned];
            *upper_left = Some(view_for_old_root);
            *upper_right = Some(view_for_pruned);
        }
        NodeKind::Leaf { .. } => unreachable!("spare node is internal"),
    }
    tree.node_mut(spare).mid_branch = None;
    let total = total_lh_at_root(&tree.node(spare).lower, ctx.model, 0.0);
    tree.node_mut(spare).total = Some(total);

    if root_blength <= 0.0 {
        tree.node_mut(old_root).total = None;
        tree.node_mut(old_root).mid_branch = None;
    }

    tree.refresh(
        vec![
            RefreshTask::FromParent(old_root),
            RefreshTask::FromParent(pruned),
        ],
        ctx,
    );
}

/// One SPR pass over every outdated node. Returns the total improvement.
pub fn improve_entire_tree<const S: usize>(
    tree: &mut Tree<S>,
    short_range: bool,
    ctx: &LhContext<S>,
) -> f64 {
    let mut stack = vec![tree.root];
    let mut total_improvement = 0.0;
    let mut num_nodes = 0usize;
    while let Some(node) = stack.pop() {
        if let Some(children) = tree.children(node) {
            stack.extend(children);
        }
        if tree.node(node).outdated {
            tree.node_mut(node).outdated = false;
            total_improvement += improve_subtree(tree, node, short_range, ctx);
            num_nodes += 1;
            if ctx.params.progress && num_nodes % 1000 == 0 {
                println!("processed topology for {num_nodes} nodes");
            }
        }
    }
    total_improvement
}

/// One branch-length pass using the analytic estimator. Returns how many
/// branches changed.
pub fn optimize_branch_lengths<const S: usize>(tree: &mut Tree<S>, ctx: &LhContext<S>) -> usize {
    let mut stack: Vec<NodeId> = tree
        .children(tree.root)
        .map(|c| c.to_vec())
        .unwrap_or_default();
    let mut num_improvement = 0usize;

    while let Some(node) = stack.pop() {
        if let Some(children) = tree.children(node) {
            stack.extend(children);
        }
        if !tree.node(node).outdated {
            continue;
        }
        let Some(upper) = tree.view_for(node) else {
            continue;
        };
        let best_length = estimate_branch_length(
            upper,
            &tree.node(node).lower,
            ctx.ref_seq,
            ctx.model,
            &ctx.thresholds,
        );
        let current = tree.node(node).blength;
        if best_length > 0.0 || current > 0.0 {
            let diff_thresh = 0.01 * best_length;
            if best_length <= 0.0
                || current <= 0.0
                || current > best_length + diff_thresh
                || current < best_length - diff_thresh
            {
                handle_blength_changed(tree, node, best_length, ctx);
                num_improvement += 1;
            }
        }
    }
    num_improvement
}
