//! # Reference Tree Likelihood State
//!
//! Couples the reference topology with the reference alignment and
//! precomputes, for every branch, the two conditional likelihood vectors that
//! face each other across it:
//!
//! - `down[n]`: the subtree below node `n` (post-order pass)
//! - `up[n]`: everything on the far side of the branch above `n`, i.e. the
//!   parent's vector computed without `n`'s subtree (pre-order pass)
//!
//! After construction the state is read-only, so any number of insertion
//! evaluations may borrow it concurrently.

use std::collections::HashMap;

use tracing::{debug, info_span};

use crate::data::{BranchIdx, Msa, NodeIdx, Tree};
use crate::error::{EpaError, Result};
use crate::model::parameters::{PMatrix, SubstitutionModel};
use crate::model::partition::{edge_loglikelihood, update_partials, ChildTerm, ClvBuffer, ClvView};

pub struct ReferenceTree {
    tree: Tree,
    model: SubstitutionModel,
    sites: usize,
    down: Vec<ClvBuffer>,
    up: Vec<ClvBuffer>,
    /// Transition matrix of the branch above each node
    pmatrices: Vec<PMatrix>,
    numbered_newick: String,
}

impl ReferenceTree {
    /// Link the tree's tips to alignment rows and precompute all branch CLVs.
    ///
    /// Every tip label must occur in `msa`; extra rows are ignored.
    pub fn new(tree: Tree, msa: &Msa, model: SubstitutionModel) -> Result<Self> {
        let _span = info_span!("reference_tree", tips = tree.n_tips(), sites = msa.num_sites()).entered();

        let sites = msa.num_sites();
        let rate_cats = model.n_rate_cats();
        let rows: HashMap<&str, &[u8]> = msa.iter().map(|s| (s.label(), s.sites())).collect();

        let n_nodes = tree.n_nodes();
        let mut down: Vec<ClvBuffer> = vec![ClvBuffer::default(); n_nodes];
        let mut up: Vec<ClvBuffer> = vec![ClvBuffer::default(); n_nodes];
        let pmatrices: Vec<PMatrix> = (0..n_nodes)
            .map(|i| model.prob_matrix(tree.length(NodeIdx::new(i as u32))))
            .collect();

        for &node in tree.postorder() {
            let idx = node.as_usize();
            if tree.is_tip(node) {
                let label = tree.label(node).ok_or_else(|| {
                    EpaError::format("reference tree contains an unlabelled tip")
                })?;
                let row = rows.get(label).ok_or_else(|| {
                    EpaError::format(format!(
                        "tip '{}' of the reference tree is missing from the reference alignment",
                        label
                    ))
                })?;
                down[idx] = ClvBuffer::from_tip(row, rate_cats)?;
            } else {
                let mut clv = ClvBuffer::new(sites, rate_cats);
                let terms: Vec<ChildTerm<'_>> = tree
                    .children(node)
                    .iter()
                    .map(|c| ChildTerm {
                        clv: down[c.as_usize()].view(),
                        pmatrix: &pmatrices[c.as_usize()],
                    })
                    .collect();
                update_partials(&mut clv, &terms)?;
                down[idx] = clv;
            }
        }

        for node in tree.preorder() {
            let Some(parent) = tree.parent(node) else {
                continue;
            };
            let mut terms: Vec<ChildTerm<'_>> = tree
                .children(parent)
                .iter()
                .filter(|&&sib| sib != node)
                .map(|s| ChildTerm {
                    clv: down[s.as_usize()].view(),
                    pmatrix: &pmatrices[s.as_usize()],
                })
                .collect();
            if tree.parent(parent).is_some() {
                terms.push(ChildTerm {
                    clv: up[parent.as_usize()].view(),
                    pmatrix: &pmatrices[parent.as_usize()],
                });
            }
            let mut clv = ClvBuffer::new(sites, rate_cats);
            update_partials(&mut clv, &terms)?;
            up[node.as_usize()] = clv;
        }

        let numbered_newick = tree.numbered_newick();
        let reference = Self {
            tree,
            model,
            sites,
            down,
            up,
            pmatrices,
            numbered_newick,
        };
        let loglik = reference.loglikelihood()?;
        debug!(branches = reference.n_branches(), loglik, "reference tree ready");
        Ok(reference)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn model(&self) -> &SubstitutionModel {
        &self.model
    }

    /// Site count every query must match
    pub fn sites(&self) -> usize {
        self.sites
    }

    pub fn n_branches(&self) -> usize {
        self.tree.n_branches()
    }

    pub fn branch_length(&self, branch: BranchIdx) -> f64 {
        self.tree.length(self.tree.branch_node(branch))
    }

    /// The two vectors adjacent to `branch`: (parent side, child side)
    pub fn branch_clvs(&self, branch: BranchIdx) -> (ClvView<'_>, ClvView<'_>) {
        let node = self.tree.branch_node(branch).as_usize();
        (self.up[node].view(), self.down[node].view())
    }

    pub fn branch_loglikelihood(&self, branch: BranchIdx) -> Result<f64> {
        let node = self.tree.branch_node(branch).as_usize();
        edge_loglikelihood(
            self.up[node].view(),
            self.down[node].view(),
            &self.pmatrices[node],
            &self.model,
        )
    }

    /// Log-likelihood of the reference alignment on the tree
    pub fn loglikelihood(&self) -> Result<f64> {
        self.branch_loglikelihood(BranchIdx::new(0))
    }

    /// Tree string with `{edge_num}` annotations
    pub fn numbered_newick(&self) -> &str {
        &self.numbered_newick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Tree, Msa) {
        let tree = Tree::from_newick("((a:0.1,b:0.2):0.05,(c:0.3,d:0.1):0.2,e:0.4);").unwrap();
        let mut msa = Msa::new();
        msa.append("a", b"ACGTACGTAA".to_vec()).unwrap();
        msa.append("b", b"ACGTACGTCA".to_vec()).unwrap();
        msa.append("c", b"ACCTAGGTAA".to_vec()).unwrap();
        msa.append("d", b"ACCTAGGTTA".to_vec()).unwrap();
        msa.append("e", b"TCGAAC-TAN".to_vec()).unwrap();
        msa.append("query", b"ACGTACGTAA".to_vec()).unwrap();
        (tree, msa)
    }

    #[test]
    fn test_every_branch_gives_the_same_likelihood() {
        let (tree, msa) = fixture();
        let model = SubstitutionModel::hky(2.0, [0.3, 0.2, 0.2, 0.3]).unwrap();
        let reference = ReferenceTree::new(tree, &msa, model).unwrap();
        let ll = reference.loglikelihood().unwrap();
        assert!(ll < 0.0);
        for b in reference.tree().branches() {
            let other = reference.branch_loglikelihood(b).unwrap();
            assert!((ll - other).abs() < 1e-9, "branch {:?}: {} vs {}", b, other, ll);
        }
    }

    #[test]
    fn test_missing_tip_is_a_format_error() {
        let (tree, mut msa) = fixture();
        let rows: Vec<_> = msa.iter().filter(|s| s.label() != "c").cloned().collect();
        msa = Msa::from_sequences(rows).unwrap();
        let err = ReferenceTree::new(tree, &msa, SubstitutionModel::jc69()).err().unwrap();
        assert!(matches!(err, EpaError::Format { .. }));
    }

    #[test]
    fn test_numbered_newick_is_exposed() {
        let (tree, msa) = fixture();
        let expected = tree.numbered_newick();
        let reference = ReferenceTree::new(tree, &msa, SubstitutionModel::jc69()).unwrap();
        assert_eq!(reference.numbered_newick(), expected);
        assert_eq!(reference.n_branches(), 7);
    }
}
