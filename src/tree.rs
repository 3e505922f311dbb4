//! Arena-based phylogeny with per-node likelihood caches.
//!
//! Nodes live in one contiguous vector and refer to each other by index, so
//! parent/child links stay cheap and bidirectional without shared ownership.
//! Each node caches the likelihood views the search needs: its `lower` list
//! (toward the leaves), a `mid_branch` and `total` view of its upper branch,
//! and, for internal nodes, the upper view each child sees (`upper_left` /
//! `upper_right`, the parent view merged with the *other* child).
//!
//! All cache maintenance goes through the LIFO refresh loop: an edit pushes
//! the touched nodes, and waves propagate outward only while a recomputed
//! list still differs from the cached one beyond the configured thresholds.

use crate::cost::sample_placement_cost;
use crate::merge::{merge_two_lowers, merge_upper_lower, total_lh_at_root};
use crate::model::SubstModel;
use crate::params::{BlengthThresholds, Params};
use crate::region::RegionList;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSlot {
    Left,
    Right,
}

/// Everything the likelihood machinery borrows together.
pub struct LhContext<'a, const S: usize> {
    pub ref_seq: &'a [u8],
    pub model: &'a SubstModel<S>,
    pub params: &'a Params,
    pub thresholds: BlengthThresholds,
}

#[derive(Debug, Clone)]
pub enum NodeKind<const S: usize> {
    Leaf {
        taxon: usize,
        /// Taxa strictly subsumed by this leaf; they never get own nodes.
        minor_siblings: Vec<usize>,
    },
    Internal {
        children: [NodeId; 2],
        /// Upper view seen by the left child (parent view ⊗ right child).
        upper_left: Option<RegionList<S>>,
        /// Upper view seen by the right child.
        upper_right: Option<RegionList<S>>,
    },
}

#[derive(Debug, Clone)]
pub struct PhyloNode<const S: usize> {
    pub parent: Option<(NodeId, ChildSlot)>,
    pub kind: NodeKind<S>,
    /// Length of the branch to the parent; `<= 0` marks a polytomy edge.
    pub blength: f64,
    pub lower: RegionList<S>,
    pub mid_branch: Option<RegionList<S>>,
    pub total: Option<RegionList<S>>,
    pub outdated: bool,
}

/// One pending cache update: either a node whose upper view changed, or a
/// parent one of whose children changed below.
#[derive(Debug, Clone, Copy)]
pub enum RefreshTask {
    FromParent(NodeId),
    FromChild { parent: NodeId, child: NodeId },
}

#[derive(Debug)]
pub struct Tree<const S: usize> {
    pub nodes: Vec<PhyloNode<S>>,
    pub root: NodeId,
    null_merge_warned: bool,
}

impl<const S: usize> Tree<S> {
    /// A tree holding a single placed taxon.
    pub fn new_single(taxon: usize, lower: RegionList<S>, ctx: &LhContext<S>) -> Self {
        let total = total_lh_at_root(&lower, ctx.model, 0.0);
        let node = PhyloNode {
            parent: None,
            kind: NodeKind::Leaf {
                taxon,
                minor_siblings: Vec::new(),
            },
            blength: 0.0,
            lower,
            mid_branch: None,
            total: Some(total),
            outdated: true,
        };
        Self {
            nodes: vec![node],
            root: 0,
            null_merge_warned: false,
        }
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &PhyloNode<S> {
        &self.nodes[id]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut PhyloNode<S> {
        &mut self.nodes[id]
    }

    pub fn push_node(&mut self, node: PhyloNode<S>) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    #[inline]
    pub fn is_leaf(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Leaf { .. })
    }

    #[inline]
    pub fn children(&self, id: NodeId) -> Option<[NodeId; 2]> {
        match &self.nodes[id].kind {
            NodeKind::Internal { children, .. } => Some(*children),
            NodeKind::Leaf { .. } => None,
        }
    }

    pub fn sibling(&self, id: NodeId) -> Option<NodeId> {
        let (parent, slot) = self.nodes[id].parent?;
        let children = self.children(parent)?;
        Some(match slot {
            ChildSlot::Left => children[1],
            ChildSlot::Right => children[0],
        })
    }

    /// The upper view the parent presents to `id`; `None` at the root or when
    /// the cache has not been built yet.
    pub fn view_for(&self, id: NodeId) -> Option<&RegionList<S>> {
        let (parent, slot) = self.nodes[id].parent?;
        match &self.nodes[parent].kind {
            NodeKind::Internal {
                upper_left,
                upper_right,
                ..
            } => match slot {
                ChildSlot::Left => upper_left.as_ref(),
                ChildSlot::Right => upper_right.as_ref(),
            },
            NodeKind::Leaf { .. } => None,
        }
    }

    pub fn set_view_for(&mut self, id: NodeId, view: RegionList<S>) {
        let (parent, slot) = self.nodes[id].parent.expect("root has no upper view");
        match &mut self.nodes[parent].kind {
            NodeKind::Internal {
                upper_left,
                upper_right,
                ..
            } => match slot {
                ChildSlot::Left => *upper_left = Some(view),
                ChildSlot::Right => *upper_right = Some(view),
            },
            NodeKind::Leaf { .. } => unreachable!("leaf parent"),
        }
    }

    pub fn replace_child(&mut self, parent: NodeId, slot: ChildSlot, new_child: NodeId) {
        match &mut self.nodes[parent].kind {
            NodeKind::Internal { children, .. } => match slot {
                ChildSlot::Left => children[0] = new_child,
                ChildSlot::Right => children[1] = new_child,
            },
            NodeKind::Leaf { .. } => unreachable!("leaf parent"),
        }
        self.nodes[new_child].parent = Some((parent, slot));
    }

    pub fn record_minor_sibling(&mut self, leaf: NodeId, taxon: usize) {
        match &mut self.nodes[leaf].kind {
            NodeKind::Leaf { minor_siblings, .. } => minor_siblings.push(taxon),
            NodeKind::Internal { .. } => unreachable!("minor sibling on internal node"),
        }
    }

    pub fn mark_outdated_all(&mut self) {
        for node in self.nodes.iter_mut() {
            node.outdated = true;
        }
    }

    /// Leaves in tree order together with their minor siblings.
    pub fn placed_taxa(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match &self.nodes[id].kind {
                NodeKind::Leaf {
                    taxon,
                    minor_siblings,
                } => {
                    out.push(*taxon);
                    out.extend(minor_siblings.iter().copied());
                }
                NodeKind::Internal { children, .. } => {
                    stack.push(children[0]);
                    stack.push(children[1]);
                }
            }
        }
        out
    }

    /// Drain the refresh stack, propagating cache updates outward until every
    /// recomputed list matches its cache within the difference thresholds.
    pub fn refresh(&mut self, mut stack: Vec<RefreshTask>, ctx: &LhContext<S>) {
        while let Some(task) = stack.pop() {
            match task {
                RefreshTask::FromParent(id) => self.refresh_from_parent(id, &mut stack, ctx),
                RefreshTask::FromChild { parent, child } => {
                    self.refresh_from_child(parent, child, &mut stack, ctx)
                }
            }
        }
    }

    fn refresh_from_parent(&mut self, id: NodeId, stack: &mut Vec<RefreshTask>, ctx: &LhContext<S>) {
        self.nodes[id].outdated = true;
        let Some(parent_upper) = self.view_for(id).cloned() else {
            return;
        };
        let blength = self.nodes[id].blength;

        if blength > 0.0 {
            let mid = merge_upper_lower(
                &parent_upper,
                blength * 0.5,
                &self.nodes[id].lower,
                blength * 0.5,
                ctx.ref_seq,
                ctx.model,
                ctx.params.threshold_prob,
            );
            let total = merge_upper_lower(
                &parent_upper,
                blength,
                &self.nodes[id].lower,
                0.0,
                ctx.ref_seq,
                ctx.model,
                ctx.params.threshold_prob,
            );
            match (mid, total) {
                (Some(mid), Some(total)) => {
                    self.nodes[id].mid_branch = Some(mid);
                    self.nodes[id].total = Some(total);
                }
                _ => {
                    self.handle_null_merge(id, blength <= 0.0, stack, ctx);
                    return;
                }
            }
        }

        let Some([left, right]) = self.children(id) else {
            return;
        };
        let b_left = self.nodes[left].blength;
        let b_right = self.nodes[right].blength;

        // the view a child sees is the parent view merged with its sibling
        let view_for_left = merge_upper_lower(
            &parent_upper,
            blength,
            &self.nodes[right].lower,
            b_right,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
        );
        let view_for_right = merge_upper_lower(
            &parent_upper,
            blength,
            &self.nodes[left].lower,
            b_left,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
        );
        let (Some(view_for_left), Some(view_for_right)) = (view_for_left, view_for_right) else {
            self.handle_null_merge(id, blength <= 0.0, stack, ctx);
            return;
        };

        self.install_view_if_different(id, left, view_for_left, stack, ctx);
        self.install_view_if_different(id, right, view_for_right, stack, ctx);
    }

    fn install_view_if_different(
        &mut self,
        _parent: NodeId,
        child: NodeId,
        new_view: RegionList<S>,
        stack: &mut Vec<RefreshTask>,
        ctx: &LhContext<S>,
    ) {
        let differs = match self.view_for(child) {
            Some(old) => old.differs_from(
                &new_view,
                ctx.ref_seq.len(),
                ctx.params.threshold_prob,
                ctx.params.thresh_diff_update,
                ctx.params.thresh_diff_fold_update,
            ),
            None => true,
        };
        if differs {
            self.set_view_for(child, new_view);
            stack.push(RefreshTask::FromParent(child));
        }
    }

    fn refresh_from_child(
        &mut self,
        parent: NodeId,
        child: NodeId,
        stack: &mut Vec<RefreshTask>,
        ctx: &LhContext<S>,
    ) {
        self.nodes[parent].outdated = true;
        let Some(other) = self.sibling(child) else {
            return;
        };
        let b_child = self.nodes[child].blength;
        let b_other = self.nodes[other].blength;

        let merged = merge_two_lowers(
            &self.nodes[other].lower,
            b_other,
            &self.nodes[child].lower,
            b_child,
            ctx.ref_seq,
            ctx.model,
            ctx.params.threshold_prob,
            false,
        );
        let Some((new_lower, _)) = merged else {
            self.handle_null_merge(child, b_child <= 0.0 && b_other <= 0.0, stack, ctx);
            return;
        };
        let old_lower = std::mem::replace(&mut self.nodes[parent].lower, new_lower);

        let is_root = parent == self.root;
        let p_blength = self.nodes[parent].blength;
        if p_blength > 0.0 || is_root {
            let total = if is_root {
                Some(total_lh_at_root(&self.nodes[parent].lower, ctx.model, 0.0))
            } else {
                self.view_for(parent).and_then(|upper| {
                    merge_upper_lower(
                        upper,
                        p_blength,
                        &self.nodes[parent].lower,
                        0.0,
                        ctx.ref_seq,
                        ctx.model,
                        ctx.params.threshold_prob,
                    )
                })
            };
            match total {
                Some(total) => self.nodes[parent].total = Some(total),
                None => {
                    self.handle_null_merge(parent, p_blength <= 0.0, stack, ctx);
                    return;
                }
            }
        }
        if p_blength > 0.0 && !is_root {
            let mid = self.view_for(parent).and_then(|upper| {
                merge_upper_lower(
                    upper,
                    p_blength * 0.5,
                    &self.nodes[parent].lower,
                    p_blength * 0.5,
                    ctx.ref_seq,
                    ctx.model,
                    ctx.params.threshold_prob,
                )
            });
            match mid {
                Some(mid) => self.nodes[parent].mid_branch = Some(mid),
                None => {
                    self.handle_null_merge(parent, p_blength <= 0.0, stack, ctx);
                    return;
                }
            }
        }

        // keep the wave moving upward only while the lower actually changed
        if !is_root
            && self.nodes[parent].lower.differs_from(
                &old_lower,
                ctx.ref_seq.len(),
                ctx.params.threshold_prob,
                ctx.params.thresh_diff_update,
                ctx.params.thresh_diff_fold_update,
            )
        {
            let (grandparent, _) = self.nodes[parent].parent.expect("non-root has a parent");
            stack.push(RefreshTask::FromChild {
                parent: grandparent,
                child: parent,
            });
        }

        // the sibling's upper view depends on the changed child's lower
        let new_view = if is_root {
            Some(total_lh_at_root(
                &self.nodes[child].lower,
                ctx.model,
                b_child,
            ))
        } else {
            self.view_for(parent).and_then(|upper| {
                merge_upper_lower(
                    upper,
                    p_blength,
                    &self.nodes[child].lower,
                    b_child,
                    ctx.ref_seq,
                    ctx.model,
                    ctx.params.threshold_prob,
                )
            })
        };
        match new_view {
            Some(view) => self.install_view_if_different(parent, other, view, stack, ctx),
            None => self.handle_null_merge(parent, p_blength <= 0.0 && b_child <= 0.0, stack, ctx),
        }
    }

    /// Null-merge recovery: a zero-length branch is re-estimated and grown; a
    /// positive-length branch is a precondition violation that is warned once
    /// and forced to the minimum length before retrying.
    fn handle_null_merge(
        &mut self,
        id: NodeId,
        zero_length: bool,
        stack: &mut Vec<RefreshTask>,
        ctx: &LhContext<S>,
    ) {
        if !zero_length && !self.null_merge_warned {
            eprintln!("warning: empty merge on a positive branch; forcing minimum length");
            self.null_merge_warned = true;
        }
        self.update_zero_blength(id, stack, ctx);
    }

    /// Grow a degenerate branch to its best supported length and requeue the
    /// caches on both of its ends.
    pub fn update_zero_blength(
        &mut self,
        id: NodeId,
        stack: &mut Vec<RefreshTask>,
        ctx: &LhContext<S>,
    ) {
        let Some(upper) = self.view_for(id) else {
            return;
        };
        let lower = &self.nodes[id].lower;
        let mut best_blength = ctx.thresholds.default_blength;
        let mut best_lh =
            sample_placement_cost(upper, lower, best_blength, ctx.ref_seq, ctx.model);

        let found_shorter = crate::cost::try_shorter_lengths(
            |b| sample_placement_cost(upper, lower, b, ctx.ref_seq, ctx.model),
            &mut best_blength,
            &mut best_lh,
            ctx.thresholds.min_blength,
        );
        if !found_shorter {
            crate::cost::try_longer_lengths(
                |b| sample_placement_cost(upper, lower, b, ctx.ref_seq, ctx.model),
                &mut best_blength,
                &mut best_lh,
                ctx.thresholds.max_blength,
            );
        }
        let new_blength = best_blength.max(ctx.thresholds.min_blength);
        let unchanged = (new_blength - self.nodes[id].blength).abs()
            < ctx.thresholds.min_blength_sensitivity;
        self.nodes[id].blength = new_blength;
        self.nodes[id].outdated = true;
        if unchanged {
            // the repair found nothing new; requeueing would spin forever
            return;
        }
        if let Some((parent, _)) = self.nodes[id].parent {
            self.nodes[parent].outdated = true;
            stack.push(RefreshTask::FromChild { parent, child: id });
        }
        stack.push(RefreshTask::FromParent(id));
    }

    /// Recompute every cache from scratch: all lower lists bottom-up, then
    /// all upper views, mid-branch and total lists top-down.
    pub fn refresh_all(&mut self, ctx: &LhContext<S>) {
        // bottom-up over an explicit post-order
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some([l, r]) = self.children(id) {
                stack.push(l);
                stack.push(r);
            }
        }
        for &id in order.iter().rev() {
            if let Some([l, r]) = self.children(id) {
                let merged = merge_two_lowers(
                    &self.nodes[l].lower,
                    self.nodes[l].blength,
                    &self.nodes[r].lower,
                    self.nodes[r].blength,
                    ctx.ref_seq,
                    ctx.model,
                    ctx.params.threshold_prob,
                    false,
                );
                if let Some((lower, _)) = merged {
                    self.nodes[id].lower = lower;
                } else {
                    // degenerate zero-length child; grow it and retry once
                    self.nodes[l].blength = self.nodes[l].blength.max(ctx.thresholds.min_blength);
                    if let Some((lower, _)) = merge_two_lowers(
                        &self.nodes[l].lower,
                        self.nodes[l].blength,
                        &self.nodes[r].lower,
                        self.nodes[r].blength,
                        ctx.ref_seq,
                        ctx.model,
                        ctx.params.threshold_prob,
                        false,
                    ) {
                        self.nodes[id].lower = lower;
                    }
                }
            }
        }

        // top-down over the recorded pre-order
        for &id in order.iter() {
            let is_root = id == self.root;
            if is_root {
                let total = total_lh_at_root(&self.nodes[id].lower, ctx.model, 0.0);
                self.nodes[id].total = Some(total);
                self.nodes[id].mid_branch = None;
            } else if let Some(upper) = self.view_for(id).cloned() {
                let blength = self.nodes[id].blength;
                self.nodes[id].total = merge_upper_lower(
                    &upper,
                    blength,
                    &self.nodes[id].lower,
                    0.0,
                    ctx.ref_seq,
                    ctx.model,
                    ctx.params.threshold_prob,
                );
                self.nodes[id].mid_branch = if blength > 0.0 {
                    merge_upper_lower(
                        &upper,
                        blength * 0.5,
                        &self.nodes[id].lower,
                        blength * 0.5,
                        ctx.ref_seq,
                        ctx.model,
                        ctx.params.threshold_prob,
                    )
                } else {
                    None
                };
            }

            if let Some([l, r]) = self.children(id) {
                let (view_l, view_r) = if is_root {
                    (
                        Some(total_lh_at_root(
                            &self.nodes[r].lower,
                            ctx.model,
                            self.nodes[r].blength,
                        )),
                        Some(total_lh_at_root(
                            &self.nodes[l].lower,
                            ctx.model,
                            self.nodes[l].blength,
                        )),
                    )
                } else {
                    let upper = self.view_for(id).cloned();
                    let blength = self.nodes[id].blength;
                    match upper {
                        Some(upper) => (
                            merge_upper_lower(
                                &upper,
                                blength,
                                &self.nodes[r].lower,
                                self.nodes[r].blength,
                                ctx.ref_seq,
                                ctx.model,
                                ctx.params.threshold_prob,
                            ),
                            merge_upper_lower(
                                &upper,
                                blength,
                                &self.nodes[l].lower,
                                self.nodes[l].blength,
                                ctx.ref_seq,
                                ctx.model,
                                ctx.params.threshold_prob,
                            ),
                        ),
                        None => (None, None),
                    }
                };
                if let Some(v) = view_l {
                    self.set_view_for(l, v);
                }
                if let Some(v) = view_r {
                    self.set_view_for(r, v);
                }
            }
        }
    }

    /// Total log-likelihood of the tree under the current model.
    pub fn total_log_likelihood(&self, ctx: &LhContext<S>) -> f64 {
        let mut log_lh = crate::merge::absolute_lh_at_root(&self.nodes[self.root].lower, ctx.model);
        // add the per-join contributions bottom-up
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some([l, r]) = self.children(id) {
                if let Some((_, join_lh)) = merge_two_lowers(
                    &self.nodes[l].lower,
                    self.nodes[l].blength,
                    &self.nodes[r].lower,
                    self.nodes[r].blength,
                    ctx.ref_seq,
                    ctx.model,
                    ctx.params.threshold_prob,
                    true,
                ) {
                    log_lh += join_lh;
                }
                stack.push(l);
                stack.push(r);
            }
        }
        log_lh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelKind;
    use crate::region::{Region, RegionType};

    fn ctx<'a>(ref_seq: &'a [u8], model: &'a SubstModel<4>, params: &'a Params) -> LhContext<'a, 4> {
        LhContext {
            ref_seq,
            model,
            params,
            thresholds: params.blength_thresholds(ref_seq.len()),
        }
    }

    fn all_ref(genome_length: usize) -> RegionList<4> {
        RegionList(vec![Region::new(RegionType::Ref, genome_length - 1)])
    }

    #[test]
    fn single_leaf_tree_has_root_total() {
        let ref_seq = [0u8, 1, 2, 3];
        let model = SubstModel::new(ModelKind::Unrest, &ref_seq).unwrap();
        let params = Params::default();
        let c = ctx(&ref_seq, &model, &params);
        let tree = Tree::new_single(0, all_ref(4), &c);
        assert!(tree.node(tree.root).total.is_some());
        assert_eq!(tree.placed_taxa(), vec![0]);
    }

    #[test]
    fn manual_cherry_refreshes_consistently() {
        let ref_seq: Vec<u8> = (0..20).map(|i| (i % 4) as u8).collect();
        let model = SubstModel::new(ModelKind::Unrest, &ref_seq).unwrap();
        let params = Params::default();
        let c = ctx(&ref_seq, &model, &params);
        let b = c.thresholds.default_blength;

        // build (taxon0:b, taxon1:b) by hand, then let refresh_all fill caches
        let mut tree = Tree::new_single(0, all_ref(20), &c);
        let leaf0 = tree.root;
        let mutated: RegionList<4> = RegionList(vec![
            Region::new(RegionType::State(2), 0),
            Region::new(RegionType::Ref, 19),
        ]);
        let leaf1 = tree.push_node(PhyloNode {
            parent: None,
            kind: NodeKind::Leaf {
                taxon: 1,
                minor_siblings: Vec::new(),
            },
            blength: b,
            lower: mutated,
            mid_branch: None,
            total: None,
            outdated: true,
        });
        let (lower_root, _) = merge_two_lowers(
            &tree.node(leaf0).lower,
            b,
            &tree.node(leaf1).lower,
            b,
            c.ref_seq,
            c.model,
            c.params.threshold_prob,
            false,
        )
        .unwrap();
        let root = tree.push_node(PhyloNode {
            parent: None,
            kind: NodeKind::Internal {
                children: [leaf0, leaf1],
                upper_left: None,
                upper_right: None,
            },
            blength: 0.0,
            lower: lower_root,
            mid_branch: None,
            total: None,
            outdated: true,
        });
        tree.nodes[leaf0].parent = Some((root, ChildSlot::Left));
        tree.nodes[leaf0].blength = b;
        tree.nodes[leaf1].parent = Some((root, ChildSlot::Right));
        tree.root = root;
        tree.refresh_all(&c);

        assert!(tree.node(root).total.is_some());
        assert!(tree.view_for(leaf0).is_some());
        assert!(tree.view_for(leaf1).is_some());
        assert!(tree.node(leaf0).mid_branch.is_some());

        // the cached lower must equal a fresh merge of the children
        let (fresh, _) = merge_two_lowers(
            &tree.node(leaf0).lower,
            b,
            &tree.node(leaf1).lower,
            b,
            c.ref_seq,
            c.model,
            c.params.threshold_prob,
            false,
        )
        .unwrap();
        assert_eq!(tree.node(root).lower, fresh);

        let lh = tree.total_log_likelihood(&c);
        assert!(lh.is_finite() && lh < 0.0);

        // a branch change propagates through the work stack without panicking
        tree.nodes[leaf1].blength = 2.0 * b;
        tree.refresh(
            vec![
                RefreshTask::FromChild {
                    parent: root,
                    child: leaf1,
                },
                RefreshTask::FromParent(leaf1),
            ],
            &c,
        );
        let (fresh2, _) = merge_two_lowers(
            &tree.node(leaf0).lower,
            b,
            &tree.node(leaf1).lower,
            2.0 * b,
            c.ref_seq,
            c.model,
            c.params.threshold_prob,
            false,
        )
        .unwrap();
        assert_eq!(tree.node(root).lower, fresh2);
    }
}
