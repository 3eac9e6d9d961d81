//! # Model Module
//!
//! The likelihood engine and the statistics built on top of it.
//!
//! ## Components
//! - `parameters`: nucleotide substitution model and transition matrices
//! - `partition`: CLV storage and the SIMD likelihood kernels
//! - `reference`: reference tree with precomputed per-branch CLVs
//! - `tiny_tree`: three-leaf insertion subtree scoring one query on one branch
//! - `optimize`: Brent's method for branch-length refinement
//! - `aggregation`: likelihood weight ratios and placement filters
//!
//! ## Why Precompute Both Directions
//!
//! Scoring a query on a branch only needs the two vectors that face each
//! other across that branch. Computing the "down" vector of every node in one
//! post-order pass and the "up" vector in one pre-order pass makes both
//! available for all branches at the cost of two full traversals, after which
//! every (query, branch) evaluation is O(sites) and independent of tree size.

pub mod aggregation;
pub mod optimize;
pub mod parameters;
pub mod partition;
pub mod reference;
pub mod tiny_tree;

pub use parameters::{PMatrix, SubstitutionModel};
pub use reference::ReferenceTree;
pub use tiny_tree::{TinyTree, DEFAULT_PENDANT_LENGTH};
