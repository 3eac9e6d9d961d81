//! # Placement Results
//!
//! Per-branch insertion records, the per-query placement that collects them,
//! and the `Sample` that carries a batch of placements together with the
//! numbered reference tree.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::data::BranchIdx;
use crate::error::Result;

/// One evaluation of one query on one branch
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct InsertionRecord {
    branch: BranchIdx,
    likelihood: f64,
    /// Likelihood weight ratio; zero until aggregation runs
    lwr: f64,
    distal_length: f64,
    pendant_length: f64,
}

impl InsertionRecord {
    pub fn new(branch: BranchIdx, likelihood: f64, distal_length: f64, pendant_length: f64) -> Self {
        Self {
            branch,
            likelihood,
            lwr: 0.0,
            distal_length,
            pendant_length,
        }
    }

    pub fn branch(&self) -> BranchIdx {
        self.branch
    }

    pub fn likelihood(&self) -> f64 {
        self.likelihood
    }

    pub fn lwr(&self) -> f64 {
        self.lwr
    }

    pub fn set_lwr(&mut self, lwr: f64) {
        self.lwr = lwr;
    }

    pub fn distal_length(&self) -> f64 {
        self.distal_length
    }

    pub fn pendant_length(&self) -> f64 {
        self.pendant_length
    }
}

/// All insertion records of one query, in branch-index order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Placement {
    /// Position of the query in the input stream
    sequence_id: usize,
    /// First entry is the query's own label; collapsed duplicates follow
    labels: Vec<String>,
    records: Vec<InsertionRecord>,
}

impl Placement {
    pub fn new(sequence_id: usize, label: impl Into<String>, n_branches: usize) -> Self {
        Self {
            sequence_id,
            labels: vec![label.into()],
            records: Vec::with_capacity(n_branches),
        }
    }

    pub fn sequence_id(&self) -> usize {
        self.sequence_id
    }

    /// Primary label
    pub fn label(&self) -> &str {
        self.labels.first().map(String::as_str).unwrap_or("")
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn set_labels(&mut self, labels: Vec<String>) {
        if !labels.is_empty() {
            self.labels = labels;
        }
    }

    pub fn push(&mut self, record: InsertionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[InsertionRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut Vec<InsertionRecord> {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record with the highest likelihood weight ratio
    pub fn best(&self) -> Option<&InsertionRecord> {
        self.records
            .iter()
            .max_by(|a, b| a.lwr().total_cmp(&b.lwr()))
    }
}

/// Ordered set of placements for a batch of queries, tagged with the numbered tree
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Sample {
    newick: String,
    placements: Vec<Placement>,
}

impl Sample {
    pub fn new(newick: impl Into<String>) -> Self {
        Self {
            newick: newick.into(),
            placements: Vec::new(),
        }
    }

    pub fn with_capacity(newick: impl Into<String>, n: usize) -> Self {
        Self {
            newick: newick.into(),
            placements: Vec::with_capacity(n),
        }
    }

    /// Numbered Newick representation of the reference tree
    pub fn newick(&self) -> &str {
        &self.newick
    }

    pub fn push(&mut self, placement: Placement) {
        self.placements.push(placement);
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Placement> {
        self.placements.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Placement> {
        self.placements.iter_mut()
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Append all placements of `other`, preserving their order
    pub fn merge(&mut self, other: Sample) {
        if self.newick.is_empty() {
            self.newick = other.newick;
        }
        self.placements.extend(other.placements);
    }

    /// Restore stream order after merging batches that arrived out of order
    pub fn sort_by_sequence_id(&mut self) {
        self.placements.sort_by_key(Placement::sequence_id);
    }

    /// Opaque byte payload for message passing
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (sample, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(sample)
    }
}

impl<'a> IntoIterator for &'a Sample {
    type Item = &'a Placement;
    type IntoIter = std::slice::Iter<'a, Placement>;

    fn into_iter(self) -> Self::IntoIter {
        self.placements.iter()
    }
}

impl IntoIterator for Sample {
    type Item = Placement;
    type IntoIter = std::vec::IntoIter<Placement>;

    fn into_iter(self) -> Self::IntoIter {
        self.placements.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sample {
        let mut sample = Sample::new("((a:1{0},b:1{1}):1{2},c:1{3});");
        for q in 0..3 {
            let mut p = Placement::new(q, format!("q{}", q), 4);
            for b in 0..4u32 {
                p.push(InsertionRecord::new(BranchIdx::new(b), -10.0 - b as f64, 0.5, 0.1));
            }
            sample.push(p);
        }
        sample
    }

    #[test]
    fn test_bytes_roundtrip() {
        let original = sample();
        let bytes = original.to_bytes().unwrap();
        let decoded = Sample::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_corrupt_payload_is_an_error() {
        let bytes = sample().to_bytes().unwrap();
        assert!(Sample::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_merge_and_sort() {
        let mut a = sample();
        let mut b = Sample::new("");
        b.push(Placement::new(7, "late", 0));
        b.push(Placement::new(5, "early", 0));
        a.merge(b);
        a.sort_by_sequence_id();
        let ids: Vec<usize> = a.iter().map(Placement::sequence_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 5, 7]);
    }

    #[test]
    fn test_labels() {
        let mut p = Placement::new(0, "a", 1);
        assert_eq!(p.label(), "a");
        p.set_labels(vec![]);
        assert_eq!(p.label(), "a");
        p.set_labels(vec!["a".into(), "b".into()]);
        assert_eq!(p.labels().len(), 2);
    }
}
