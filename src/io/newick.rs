use crate::tree::{NodeId, NodeKind, Tree};
use crate::utils::format_blength;

/// Render the tree as rooted Newick. In multifurcating mode, internal edges
/// of length `<= 0` are collapsed so polytomies print as true multifurcations;
/// otherwise the tree prints fully binary with explicit zero lengths.
pub fn write_newick<const S: usize>(
    tree: &Tree<S>,
    names: &[String],
    multifurcating: bool,
) -> String {
    let mut out = String::new();
    write_node(tree, tree.root, names, multifurcating, &mut out);
    out.push(';');
    out
}

enum Step {
    Visit(NodeId),
    Text(&'static str),
    Close(NodeId),
}

fn write_node<const S: usize>(
    tree: &Tree<S>,
    start: NodeId,
    names: &[String],
    multifurcating: bool,
    out: &mut String,
) {
    let mut stack = vec![Step::Visit(start)];
    while let Some(step) = stack.pop() {
        match step {
            Step::Text(s) => out.push_str(s),
            Step::Visit(id) => match &tree.node(id).kind {
                NodeKind::Leaf {
                    taxon,
                    minor_siblings,
                } => {
                    write_leaf(*taxon, minor_siblings, names, out);
                    write_length(tree, id, out);
                }
                NodeKind::Internal { .. } => {
                    out.push('(');
                    stack.push(Step::Close(id));
                    let members = gathered_children(tree, id, multifurcating);
                    // children render left to right, so push in reverse
                    for (i, child) in members.into_iter().enumerate().rev() {
                        stack.push(Step::Visit(child));
                        if i > 0 {
                            stack.push(Step::Text(","));
                        }
                    }
                }
            },
            Step::Close(id) => {
                out.push(')');
                write_length(tree, id, out);
            }
        }
    }
}

/// The children to print for an internal node; in multifurcating mode,
/// zero-length internal children are flattened into their parent.
fn gathered_children<const S: usize>(
    tree: &Tree<S>,
    id: NodeId,
    multifurcating: bool,
) -> Vec<NodeId> {
    let Some(children) = tree.children(id) else {
        return Vec::new();
    };
    if !multifurcating {
        return children.to_vec();
    }
    let mut out = Vec::new();
    let mut stack: Vec<NodeId> = children.iter().rev().copied().collect();
    while let Some(child) = stack.pop() {
        match tree.children(child) {
            Some(grand) if tree.node(child).blength <= 0.0 => {
                for g in grand.iter().rev() {
                    stack.push(*g);
                }
            }
            _ => out.push(child),
        }
    }
    out
}

fn write_leaf(taxon: usize, minor_siblings: &[usize], names: &[String], out: &mut String) {
    let name = |i: usize| names.get(i).map(String::as_str).unwrap_or("unnamed");
    if minor_siblings.is_empty() {
        out.push_str(name(taxon));
    } else {
        // taxa indistinguishable from this leaf print as a zero-length fan
        out.push('(');
        out.push_str(name(taxon));
        out.push_str(":0");
        for &minor in minor_siblings {
            out.push(',');
            out.push_str(name(minor));
            out.push_str(":0");
        }
        out.push(')');
    }
}

fn write_length<const S: usize>(tree: &Tree<S>, id: NodeId, out: &mut String) {
    if id == tree.root {
        return;
    }
    out.push(':');
    out.push_str(&format_blength(tree.node(id).blength));
}
