//! # Insertion Subtree
//!
//! Scores one query on one reference branch using a three-leaf tree:
//!
//! ```text
//!   parent side ──proximal── new ──distal── child side
//!                             │
//!                          pendant
//!                             │
//!                           query
//! ```
//!
//! The two outer vectors are borrowed from the `ReferenceTree` for the
//! lifetime `'a`; only the query tip and the new inner node are computed, in
//! the caller's `TinyWorkspace`. Borrowed vectors are never written, and no
//! state outlives the call regardless of how it returns.
//!
//! Without optimisation the split branch is halved and the pendant branch
//! gets the default length. With optimisation the three legs are refined by
//! coordinate ascent with Brent's method.

use crate::data::{BranchIdx, InsertionRecord, Sequence};
use crate::error::{EpaError, Result};
use crate::model::optimize::{brent_maximize, MAX_BRANCH_LENGTH, MIN_BRANCH_LENGTH};
use crate::model::partition::{edge_loglikelihood, update_partials, ChildTerm, ClvView};
use crate::model::reference::ReferenceTree;
use crate::utils::workspace::TinyWorkspace;

/// Starting pendant branch length, in substitutions per site
pub const DEFAULT_PENDANT_LENGTH: f64 = 0.1;

const MAX_ROUNDS: usize = 8;
const ROUND_EPSILON: f64 = 1e-4;
const BRENT_TOLERANCE: f64 = 1e-6;
const BRENT_MAX_ITER: usize = 64;

const PROXIMAL: usize = 0;
const DISTAL: usize = 1;
const PENDANT: usize = 2;

pub struct TinyTree<'a> {
    reference: &'a ReferenceTree,
    branch: BranchIdx,
    proximal: ClvView<'a>,
    distal: ClvView<'a>,
    branch_length: f64,
    optimize: bool,
    pendant_length: f64,
}

impl<'a> TinyTree<'a> {
    pub fn new(reference: &'a ReferenceTree, branch: BranchIdx, optimize: bool) -> Self {
        let (proximal, distal) = reference.branch_clvs(branch);
        Self {
            reference,
            branch,
            proximal,
            distal,
            branch_length: reference.branch_length(branch),
            optimize,
            pendant_length: DEFAULT_PENDANT_LENGTH,
        }
    }

    pub fn with_pendant_length(mut self, length: f64) -> Self {
        self.pendant_length = length;
        self
    }

    pub fn branch(&self) -> BranchIdx {
        self.branch
    }

    /// Insert `query` on this branch and score it
    pub fn place(&self, query: &Sequence, ws: &mut TinyWorkspace) -> Result<InsertionRecord> {
        let sites = self.reference.sites();
        if query.len() != sites {
            return Err(EpaError::format(format!(
                "query '{}' has {} sites, reference alignment has {}",
                query.label(),
                query.len(),
                sites
            )));
        }

        ws.resize(sites, self.reference.model().n_rate_cats());
        ws.tip.set_tip(query.sites())?;

        let half = self.branch_length / 2.0;
        let mut legs = [half, half, self.pendant_length];
        let mut loglik = self.evaluate(&legs, ws)?;

        if self.optimize {
            loglik = self.optimize_legs(&mut legs, loglik, ws)?;
        }

        Ok(InsertionRecord::new(
            self.branch,
            loglik,
            legs[PROXIMAL].min(legs[DISTAL]),
            legs[PENDANT],
        ))
    }

    /// Recompute the new inner node for the current split
    fn update_inner(&self, legs: &[f64; 3], ws: &mut TinyWorkspace) -> Result<()> {
        let model = self.reference.model();
        model.update_prob_matrix(&mut ws.proximal, legs[PROXIMAL]);
        model.update_prob_matrix(&mut ws.distal, legs[DISTAL]);
        update_partials(
            &mut ws.inner,
            &[
                ChildTerm {
                    clv: self.proximal,
                    pmatrix: &ws.proximal,
                },
                ChildTerm {
                    clv: self.distal,
                    pmatrix: &ws.distal,
                },
            ],
        )
    }

    /// Log-likelihood across the pendant branch, reusing the current inner node
    fn pendant_loglikelihood(&self, pendant: f64, ws: &mut TinyWorkspace) -> Result<f64> {
        let model = self.reference.model();
        model.update_prob_matrix(&mut ws.pendant, pendant);
        edge_loglikelihood(ws.inner.view(), ws.tip.view(), &ws.pendant, model)
    }

    fn evaluate(&self, legs: &[f64; 3], ws: &mut TinyWorkspace) -> Result<f64> {
        self.update_inner(legs, ws)?;
        self.pendant_loglikelihood(legs[PENDANT], ws)
    }

    /// Coordinate ascent over the three legs. Returns the final log-likelihood,
    /// which is never below `start`.
    fn optimize_legs(&self, legs: &mut [f64; 3], start: f64, ws: &mut TinyWorkspace) -> Result<f64> {
        let mut best = start;

        for _round in 0..MAX_ROUNDS {
            let round_start = best;

            for leg in [PROXIMAL, DISTAL] {
                let mut trial = *legs;
                let (x, fx) = brent_maximize(
                    |t| {
                        trial[leg] = t;
                        self.evaluate(&trial, ws)
                    },
                    MIN_BRANCH_LENGTH,
                    MAX_BRANCH_LENGTH,
                    legs[leg].max(MIN_BRANCH_LENGTH),
                    BRENT_TOLERANCE,
                    BRENT_MAX_ITER,
                )?;
                if fx >= best {
                    legs[leg] = x;
                    best = fx;
                }
            }

            self.update_inner(legs, ws)?;
            let (x, fx) = brent_maximize(
                |t| self.pendant_loglikelihood(t, ws),
                MIN_BRANCH_LENGTH,
                MAX_BRANCH_LENGTH,
                legs[PENDANT].max(MIN_BRANCH_LENGTH),
                BRENT_TOLERANCE,
                BRENT_MAX_ITER,
            )?;
            if fx >= best {
                legs[PENDANT] = x;
                best = fx;
            }

            if best - round_start < ROUND_EPSILON {
                break;
            }
        }

        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Msa, Tree};
    use crate::model::parameters::SubstitutionModel;

    fn reference() -> ReferenceTree {
        let tree = Tree::from_newick("((a:0.1,b:0.2):0.05,(c:0.3,d:0.1):0.2,e:0.4);").unwrap();
        let mut msa = Msa::new();
        msa.append("a", b"ACGTACGTAAACGTACGTAA".to_vec()).unwrap();
        msa.append("b", b"ACGTACGTCAACGTACTTAA".to_vec()).unwrap();
        msa.append("c", b"ACCTAGGTAAACGAACGTCC".to_vec()).unwrap();
        msa.append("d", b"ACCTAGGTTAACGAACGTCC".to_vec()).unwrap();
        msa.append("e", b"TCGAAC-TANTTGAACGGCC".to_vec()).unwrap();
        ReferenceTree::new(tree, &msa, SubstitutionModel::k80(2.0).unwrap()).unwrap()
    }

    #[test]
    fn test_heuristic_lengths() {
        let reference = reference();
        let mut ws = TinyWorkspace::minimal();
        let query = Sequence::new("q", b"ACGTACGTAAACGTACGTAA".to_vec());
        let branch = BranchIdx::new(1);
        let record = TinyTree::new(&reference, branch, false)
            .place(&query, &mut ws)
            .unwrap();
        assert_eq!(record.branch(), branch);
        assert!((record.distal_length() - reference.branch_length(branch) / 2.0).abs() < 1e-12);
        assert_eq!(record.pendant_length(), DEFAULT_PENDANT_LENGTH);
        assert!(record.likelihood() < 0.0);

        let custom = TinyTree::new(&reference, branch, false)
            .with_pendant_length(0.25)
            .place(&query, &mut ws)
            .unwrap();
        assert_eq!(custom.pendant_length(), 0.25);
    }

    #[test]
    fn test_optimisation_never_decreases_likelihood() {
        let reference = reference();
        let mut ws = TinyWorkspace::minimal();
        let query = Sequence::new("q", b"ACCTAGGTAAACGAACGTCA".to_vec());
        for branch in reference.tree().branches() {
            let heuristic = TinyTree::new(&reference, branch, false).place(&query, &mut ws).unwrap();
            let optimised = TinyTree::new(&reference, branch, true).place(&query, &mut ws).unwrap();
            assert!(optimised.likelihood() >= heuristic.likelihood() - 1e-9);
            assert!(optimised.pendant_length() >= MIN_BRANCH_LENGTH);
            assert!(optimised.distal_length() >= MIN_BRANCH_LENGTH);
        }
    }

    #[test]
    fn test_query_equal_to_tip_prefers_its_branch() {
        let reference = reference();
        let mut ws = TinyWorkspace::minimal();
        let query = Sequence::new("q", b"ACGTACGTAAACGTACGTAA".to_vec());
        let tip_a = reference
            .tree()
            .tips()
            .find(|(_, l)| *l == Some("a"))
            .map(|(n, _)| n)
            .unwrap();
        let branch_a = reference.tree().node_branch(tip_a).unwrap();

        let best = reference
            .tree()
            .branches()
            .map(|b| TinyTree::new(&reference, b, true).place(&query, &mut ws).unwrap())
            .max_by(|x, y| x.likelihood().total_cmp(&y.likelihood()))
            .unwrap();
        assert_eq!(best.branch(), branch_a);
    }

    #[test]
    fn test_length_mismatch_fails_before_evaluation() {
        let reference = reference();
        let mut ws = TinyWorkspace::minimal();
        let query = Sequence::new("short", b"ACGT".to_vec());
        let err = TinyTree::new(&reference, BranchIdx::new(0), true)
            .place(&query, &mut ws)
            .unwrap_err();
        assert!(matches!(err, EpaError::Format { .. }));
        // Workspace untouched
        assert_eq!(ws.tip.sites(), 0);
    }

    #[test]
    fn test_reference_state_is_unchanged() {
        let reference = reference();
        let before = reference.loglikelihood().unwrap();
        let mut ws = TinyWorkspace::minimal();
        let query = Sequence::new("q", b"TTTTACGTAAACGTACGTAA".to_vec());
        for branch in reference.tree().branches() {
            TinyTree::new(&reference, branch, true).place(&query, &mut ws).unwrap();
        }
        assert_eq!(reference.loglikelihood().unwrap(), before);
    }
}
