//! # Data Module
//!
//! In-memory representations of alignments, reference trees and placement
//! results. This is the core "Model" layer.
//!
//! ## Design Philosophy
//! - **Zero-cost newtypes:** `BranchIdx` and `NodeIdx` prevent index bugs
//!   at compile time with no runtime overhead.
//! - **Arena trees:** tree nodes live in one `Vec` and refer to each other
//!   by index, so branch enumeration is a stable, allocation-free walk.

pub mod msa;
pub mod placement;
pub mod sequence;
pub mod tree;

// Re-export commonly used types
pub use msa::{CollapseGroups, Msa, MsaInfo};
pub use placement::{InsertionRecord, Placement, Sample};
pub use sequence::{Sequence, SiteRange};
pub use tree::{NodeIdx, Tree};

/// Stable branch (edge) index, `0..n_branches`, fixed for a placement run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[derive(serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode)]
pub struct BranchIdx(pub u32);

impl BranchIdx {
    pub fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for BranchIdx {
    fn from(idx: u32) -> Self {
        Self(idx)
    }
}

impl From<usize> for BranchIdx {
    fn from(idx: usize) -> Self {
        Self(idx as u32)
    }
}

impl From<BranchIdx> for usize {
    fn from(idx: BranchIdx) -> usize {
        idx.0 as usize
    }
}
