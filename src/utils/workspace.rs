//! # Workspace Pattern for Insertion Buffers
//!
//! Pre-allocated buffers for tiny-tree evaluations, so the per-branch hot
//! loop does not allocate.
//!
//! ## Design Philosophy
//! The reference tree is shared read-only between workers. Everything an
//! insertion writes (the query's tip vector, the new inner node and the three
//! transition matrices) lives in a `TinyWorkspace` owned by exactly one
//! worker and passed as `&mut` into each evaluation.

use crate::model::parameters::PMatrix;
use crate::model::partition::ClvBuffer;

/// Private scratch state of one placement worker
#[derive(Debug)]
pub struct TinyWorkspace {
    /// Tip vector of the query being placed
    pub tip: ClvBuffer,

    /// Vector of the new inner node joining the split branch halves
    pub inner: ClvBuffer,

    /// Transition matrix of the leg towards the parent-side node
    pub proximal: PMatrix,

    /// Transition matrix of the leg towards the child-side node
    pub distal: PMatrix,

    /// Transition matrix of the pendant branch
    pub pendant: PMatrix,
}

impl TinyWorkspace {
    pub fn new(sites: usize, rate_cats: usize) -> Self {
        Self {
            tip: ClvBuffer::new(sites, rate_cats),
            inner: ClvBuffer::new(sites, rate_cats),
            proximal: PMatrix::identity(rate_cats),
            distal: PMatrix::identity(rate_cats),
            pendant: PMatrix::identity(rate_cats),
        }
    }

    /// Create a minimal workspace; buffers grow on first use
    pub fn minimal() -> Self {
        Self::new(0, 1)
    }

    /// Resize buffers for new dimensions
    pub fn resize(&mut self, sites: usize, rate_cats: usize) {
        if self.tip.sites() != sites || self.tip.rate_cats() != rate_cats {
            self.tip.reset(sites, rate_cats);
            self.inner.reset(sites, rate_cats);
        }
        if self.proximal.rate_cats() != rate_cats {
            self.proximal = PMatrix::identity(rate_cats);
            self.distal = PMatrix::identity(rate_cats);
            self.pendant = PMatrix::identity(rate_cats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize() {
        let mut ws = TinyWorkspace::minimal();
        ws.resize(12, 4);
        assert_eq!(ws.tip.sites(), 12);
        assert_eq!(ws.inner.values().len(), 12 * 4 * 4);
        assert_eq!(ws.pendant.rate_cats(), 4);
        ws.resize(3, 4);
        assert_eq!(ws.inner.scaler().len(), 3);
    }
}
