//! # Reference Tree Topology
//!
//! Arena representation of an unrooted reference phylogeny read from Newick.
//!
//! The tree is stored with an arbitrary internal node as root so every other
//! node owns exactly one branch: the one towards its parent. Branches are
//! numbered by post-order of that child node, which gives the stable
//! `BranchIdx` used for a whole placement run and the `{n}` annotations of
//! the numbered Newick string.
//!
//! Parsing and writing are iterative, so deep (caterpillar) trees do not
//! exhaust the stack.

use std::fmt::Write as _;
use std::path::Path;

use crate::data::BranchIdx;
use crate::error::{EpaError, Result};

/// Node index into the tree arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeIdx(pub u32);

impl NodeIdx {
    pub fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
struct Node {
    label: Option<String>,
    parent: Option<NodeIdx>,
    children: Vec<NodeIdx>,
    /// Length of the branch to the parent (unused for the root)
    length: f64,
    branch: Option<BranchIdx>,
}

/// Unrooted reference tree
#[derive(Clone, Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeIdx,
    /// Child-side node of each branch
    branch_nodes: Vec<NodeIdx>,
    postorder: Vec<NodeIdx>,
}

/// Intermediate clade produced by the parser
#[derive(Debug, Default)]
struct Clade {
    label: Option<String>,
    length: Option<f64>,
    children: Vec<Clade>,
}

impl Tree {
    /// Read a Newick file
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EpaError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_newick(&text)
    }

    /// Parse a Newick string. A bifurcating root is dissolved so the result is unrooted.
    pub fn from_newick(newick: &str) -> Result<Self> {
        let root = parse_newick(newick)?;
        let root = unroot(root)?;
        Self::from_clade(root)
    }

    fn from_clade(root: Clade) -> Result<Self> {
        let mut nodes: Vec<Node> = Vec::new();
        // (clade, parent)
        let mut pending: Vec<(Clade, Option<NodeIdx>)> = vec![(root, None)];

        while let Some((clade, parent)) = pending.pop() {
            let idx = NodeIdx::new(nodes.len() as u32);
            let length = match (parent, clade.length) {
                (None, _) => 0.0,
                (Some(_), Some(len)) if len.is_finite() && len >= 0.0 => len,
                (Some(_), Some(len)) => {
                    return Err(EpaError::format(format!("invalid branch length {}", len)));
                }
                (Some(_), None) => {
                    return Err(EpaError::format(format!(
                        "branch above '{}' has no length",
                        clade.label.as_deref().unwrap_or("<inner node>")
                    )));
                }
            };
            nodes.push(Node {
                label: clade.label,
                parent,
                children: Vec::with_capacity(clade.children.len()),
                length,
                branch: None,
            });
            if let Some(p) = parent {
                nodes[p.as_usize()].children.push(idx);
            }
            // Reverse so children are visited (and stored) left to right
            for child in clade.children.into_iter().rev() {
                pending.push((child, Some(idx)));
            }
        }

        let mut tree = Self {
            nodes,
            root: NodeIdx::new(0),
            branch_nodes: Vec::new(),
            postorder: Vec::new(),
        };

        if tree.n_tips() < 3 {
            return Err(EpaError::format(format!(
                "reference tree needs at least 3 tips, found {}",
                tree.n_tips()
            )));
        }

        tree.postorder = tree.compute_postorder();
        for i in 0..tree.postorder.len() {
            let node = tree.postorder[i];
            if node != tree.root {
                let branch = BranchIdx::new(tree.branch_nodes.len() as u32);
                tree.nodes[node.as_usize()].branch = Some(branch);
                tree.branch_nodes.push(node);
            }
        }

        Ok(tree)
    }

    fn compute_postorder(&self) -> Vec<NodeIdx> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(NodeIdx, usize)> = vec![(self.root, 0)];
        while let Some((node, next_child)) = stack.pop() {
            let children = &self.nodes[node.as_usize()].children;
            if next_child < children.len() {
                stack.push((node, next_child + 1));
                stack.push((children[next_child], 0));
            } else {
                order.push(node);
            }
        }
        order
    }

    pub fn root(&self) -> NodeIdx {
        self.root
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_tips(&self) -> usize {
        self.nodes.iter().filter(|n| n.children.is_empty()).count()
    }

    pub fn n_branches(&self) -> usize {
        self.branch_nodes.len()
    }

    pub fn is_tip(&self, node: NodeIdx) -> bool {
        self.nodes[node.as_usize()].children.is_empty()
    }

    pub fn label(&self, node: NodeIdx) -> Option<&str> {
        self.nodes[node.as_usize()].label.as_deref()
    }

    pub fn parent(&self, node: NodeIdx) -> Option<NodeIdx> {
        self.nodes[node.as_usize()].parent
    }

    pub fn children(&self, node: NodeIdx) -> &[NodeIdx] {
        &self.nodes[node.as_usize()].children
    }

    /// Length of the branch between `node` and its parent
    pub fn length(&self, node: NodeIdx) -> f64 {
        self.nodes[node.as_usize()].length
    }

    /// Children before parents
    pub fn postorder(&self) -> &[NodeIdx] {
        &self.postorder
    }

    /// Parents before children
    pub fn preorder(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.postorder.iter().rev().copied()
    }

    /// Child-side node of a branch
    pub fn branch_node(&self, branch: BranchIdx) -> NodeIdx {
        self.branch_nodes[branch.as_usize()]
    }

    /// Branch above `node` (`None` for the root)
    pub fn node_branch(&self, node: NodeIdx) -> Option<BranchIdx> {
        self.nodes[node.as_usize()].branch
    }

    /// All branches in index order
    pub fn branches(&self) -> impl Iterator<Item = BranchIdx> {
        (0..self.branch_nodes.len() as u32).map(BranchIdx::new)
    }

    /// Tip nodes with their labels
    pub fn tips(&self) -> impl Iterator<Item = (NodeIdx, Option<&str>)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.children.is_empty())
            .map(|(i, n)| (NodeIdx::new(i as u32), n.label.as_deref()))
    }

    /// Newick string with every branch annotated by its index: `label:length{idx}`
    pub fn numbered_newick(&self) -> String {
        let mut out = String::new();
        // (node, next child to emit)
        let mut stack: Vec<(NodeIdx, usize)> = vec![(self.root, 0)];
        while let Some((node, next_child)) = stack.pop() {
            let n = &self.nodes[node.as_usize()];
            if next_child == 0 && !n.children.is_empty() {
                out.push('(');
            }
            if next_child < n.children.len() {
                if next_child > 0 {
                    out.push(',');
                }
                stack.push((node, next_child + 1));
                stack.push((n.children[next_child], 0));
                continue;
            }
            if !n.children.is_empty() {
                out.push(')');
            }
            if let Some(label) = &n.label {
                out.push_str(&escape_label(label));
            }
            if let Some(branch) = n.branch {
                let _ = write!(out, ":{}{{{}}}", n.length, branch.0);
            }
        }
        out.push(';');
        out
    }
}

fn escape_label(label: &str) -> String {
    if label.chars().any(|c| "():,;[]' \t".contains(c)) {
        format!("'{}'", label.replace('\'', "''"))
    } else {
        label.to_string()
    }
}

/// Iterative Newick parser producing a nested clade structure
fn parse_newick(text: &str) -> Result<Clade> {
    let bytes = text.as_bytes();
    let mut pos = 0usize;
    let mut line = 1usize;
    let mut open: Vec<Clade> = Vec::new();
    let mut current: Option<Clade> = None;
    let mut finished = false;

    while pos < bytes.len() && !finished {
        let c = bytes[pos];
        match c {
            b'\n' => {
                line += 1;
                pos += 1;
            }
            b' ' | b'\t' | b'\r' => pos += 1,
            b'[' => {
                let end = text[pos..]
                    .find(']')
                    .ok_or_else(|| EpaError::parse(line, "unterminated comment"))?;
                line += text[pos..pos + end].matches('\n').count();
                pos += end + 1;
            }
            b'(' => {
                if current.is_some() {
                    return Err(EpaError::parse(line, "unexpected '('"));
                }
                open.push(Clade::default());
                pos += 1;
            }
            b',' => {
                let node = current.take().unwrap_or_default();
                open.last_mut()
                    .ok_or_else(|| EpaError::parse(line, "',' outside of a clade"))?
                    .children
                    .push(node);
                pos += 1;
            }
            b')' => {
                let node = current.take().unwrap_or_default();
                let mut clade = open
                    .pop()
                    .ok_or_else(|| EpaError::parse(line, "unbalanced ')'"))?;
                clade.children.push(node);
                current = Some(clade);
                pos += 1;
            }
            b':' => {
                pos += 1;
                let start = pos;
                while pos < bytes.len() && !b"(),:;[ \t\r\n".contains(&bytes[pos]) {
                    pos += 1;
                }
                let value: f64 = text[start..pos].parse().map_err(|_| {
                    EpaError::parse(line, format!("invalid branch length '{}'", &text[start..pos]))
                })?;
                current.get_or_insert_with(Clade::default).length = Some(value);
            }
            b';' => {
                finished = true;
                pos += 1;
            }
            b'\'' => {
                let mut label = String::new();
                pos += 1;
                loop {
                    match bytes.get(pos) {
                        None => return Err(EpaError::parse(line, "unterminated quoted label")),
                        Some(b'\'') if bytes.get(pos + 1) == Some(&b'\'') => {
                            label.push('\'');
                            pos += 2;
                        }
                        Some(b'\'') => {
                            pos += 1;
                            break;
                        }
                        Some(_) => {
                            let ch = text[pos..].chars().next().unwrap_or('\0');
                            label.push(ch);
                            pos += ch.len_utf8();
                        }
                    }
                }
                set_label(&mut current, label, line)?;
            }
            _ => {
                let start = pos;
                while pos < bytes.len() && !b"(),:;[' \t\r\n".contains(&bytes[pos]) {
                    pos += 1;
                }
                set_label(&mut current, text[start..pos].to_string(), line)?;
            }
        }
    }

    if !open.is_empty() {
        return Err(EpaError::parse(line, "unbalanced '(' in Newick string"));
    }
    current.ok_or_else(|| EpaError::parse(line, "empty Newick string"))
}

fn set_label(current: &mut Option<Clade>, label: String, line: usize) -> Result<()> {
    let node = current.get_or_insert_with(Clade::default);
    if node.label.is_some() || node.length.is_some() {
        return Err(EpaError::parse(line, format!("unexpected label '{}'", label)));
    }
    node.label = Some(label);
    Ok(())
}

/// Dissolve a bifurcating root by merging its two branches into one
fn unroot(mut root: Clade) -> Result<Clade> {
    if root.children.len() != 2 {
        return Ok(root);
    }
    let pivot = match root.children.iter().position(|c| !c.children.is_empty()) {
        Some(i) => i,
        None => {
            return Err(EpaError::format(
                "reference tree needs at least 3 tips, found 2",
            ))
        }
    };
    let mut new_root = root.children.swap_remove(pivot);
    let mut other = root
        .children
        .pop()
        .ok_or_else(|| EpaError::format("malformed bifurcating root"))?;
    other.length = match (other.length, new_root.length) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    };
    new_root.length = None;
    new_root.children.push(other);
    Ok(new_root)
}
