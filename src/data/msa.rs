//! # Multiple Sequence Alignment
//!
//! Alignment container, the precomputed alignment summary (`MsaInfo`) used
//! by the streaming reader, and duplicate-row collapsing.

use std::collections::HashMap;

use bitvec::prelude::*;

use crate::data::placement::{Placement, Sample};
use crate::data::sequence::{get_valid_range, is_gap, Sequence, SiteRange};
use crate::error::{EpaError, Result};

/// Ordered collection of equal-length sequences
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Msa {
    sequences: Vec<Sequence>,
    sites: usize,
}

impl Msa {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            sequences: Vec::with_capacity(n),
            sites: 0,
        }
    }

    /// Build from sequences, rejecting rows of unequal length
    pub fn from_sequences(sequences: Vec<Sequence>) -> Result<Self> {
        let mut msa = Self::with_capacity(sequences.len());
        for seq in sequences {
            msa.push(seq)?;
        }
        Ok(msa)
    }

    /// Append a row. The first row fixes the site count.
    pub fn push(&mut self, sequence: Sequence) -> Result<()> {
        if self.sequences.is_empty() {
            self.sites = sequence.len();
        } else if sequence.len() != self.sites {
            return Err(EpaError::format(format!(
                "MSA does not contain equal size sequences: '{}' has {} sites, expected {}",
                sequence.label(),
                sequence.len(),
                self.sites
            )));
        }
        self.sequences.push(sequence);
        Ok(())
    }

    pub fn append(&mut self, label: impl Into<String>, sites: impl Into<Vec<u8>>) -> Result<()> {
        self.push(Sequence::new(label, sites))
    }

    pub fn num_sites(&self) -> usize {
        self.sites
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn clear(&mut self) {
        self.sequences.clear();
        self.sites = 0;
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sequence> {
        self.sequences.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&Sequence> {
        self.sequences.get(idx)
    }

    /// Remove the first `n` rows
    pub fn drain_front(&mut self, n: usize) {
        let n = n.min(self.sequences.len());
        self.sequences.drain(..n);
        if self.sequences.is_empty() {
            self.sites = 0;
        }
    }

    /// Move all rows of `other` to the end of this alignment
    pub fn extend(&mut self, other: Msa) -> Result<()> {
        for seq in other.sequences {
            self.push(seq)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Msa {
    type Item = &'a Sequence;
    type IntoIter = std::slice::Iter<'a, Sequence>;

    fn into_iter(self) -> Self::IntoIter {
        self.sequences.iter()
    }
}

/// Immutable summary of a query alignment, computed once before streaming
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsaInfo {
    sequences: usize,
    sites: usize,
    /// Bit set for columns that are a gap in every row
    gap_mask: BitVec<u64, Lsb0>,
}

impl MsaInfo {
    pub fn new(sequences: usize, sites: usize, gap_mask: BitVec<u64, Lsb0>) -> Result<Self> {
        if gap_mask.len() != sites {
            return Err(EpaError::invalid_input(format!(
                "gap mask covers {} columns, alignment has {} sites",
                gap_mask.len(),
                sites
            )));
        }
        Ok(Self {
            sequences,
            sites,
            gap_mask,
        })
    }

    /// Single pass over a sequence source: counts rows and builds the gap mask.
    pub fn scan<I>(sequences: I) -> Result<Self>
    where
        I: IntoIterator<Item = Result<Sequence>>,
    {
        let mut count = 0usize;
        let mut sites = 0usize;
        let mut gap_mask: BitVec<u64, Lsb0> = BitVec::new();

        for seq in sequences {
            let seq = seq?;
            if count == 0 {
                sites = seq.len();
                gap_mask = BitVec::repeat(true, sites);
            } else if seq.len() != sites {
                return Err(EpaError::format(format!(
                    "MSA file does not contain equal size sequences: '{}' has {} sites, expected {}",
                    seq.label(),
                    seq.len(),
                    sites
                )));
            }
            for (col, &symbol) in seq.sites().iter().enumerate() {
                if !is_gap(symbol) {
                    gap_mask.set(col, false);
                }
            }
            count += 1;
        }

        Ok(Self {
            sequences: count,
            sites,
            gap_mask,
        })
    }

    pub fn from_msa(msa: &Msa) -> Self {
        let sites = msa.num_sites();
        let mut gap_mask: BitVec<u64, Lsb0> = BitVec::repeat(!msa.is_empty(), sites);
        for seq in msa {
            for (col, &symbol) in seq.sites().iter().enumerate() {
                if !is_gap(symbol) {
                    gap_mask.set(col, false);
                }
            }
        }
        Self {
            sequences: msa.len(),
            sites,
            gap_mask,
        }
    }

    /// Same counts, but masking the columns that are all-gap in `reference`
    pub fn with_reference_mask(&self, reference: &MsaInfo) -> Result<Self> {
        Self::new(self.sequences, self.sites, reference.gap_mask.clone())
    }

    /// Apply the gap mask to every row of `msa`
    pub fn mask_msa(&self, msa: &Msa) -> Result<Msa> {
        let mut masked = Msa::with_capacity(msa.len());
        for seq in msa {
            masked.append(seq.label(), self.subset_sequence(seq.sites())?)?;
        }
        Ok(masked)
    }

    pub fn sequences(&self) -> usize {
        self.sequences
    }

    pub fn sites(&self) -> usize {
        self.sites
    }

    pub fn gap_mask(&self) -> &BitSlice<u64, Lsb0> {
        &self.gap_mask
    }

    /// Number of all-gap columns
    pub fn gap_count(&self) -> usize {
        self.gap_mask.count_ones()
    }

    /// Site count after premasking
    pub fn nongap_count(&self) -> usize {
        self.sites - self.gap_count()
    }

    /// Keep only the columns not flagged in the gap mask
    pub fn subset_sequence(&self, sites: &[u8]) -> Result<Vec<u8>> {
        if sites.len() != self.sites {
            return Err(EpaError::format(format!(
                "mask and sequence incompatible: sequence has {} sites, mask covers {}",
                sites.len(),
                self.sites
            )));
        }
        let result: Vec<u8> = sites
            .iter()
            .zip(self.gap_mask.iter().by_vals())
            .filter(|(_, masked)| !masked)
            .map(|(&s, _)| s)
            .collect();
        debug_assert_eq!(result.len(), self.nongap_count());
        Ok(result)
    }
}

/// Label groups produced by collapsing identical rows.
///
/// Each group is keyed by the position of the kept row in the collapsed
/// alignment and lists every original label (kept row first) in input order.
/// Placements map back to rows through `sequence_id - first_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollapseGroups {
    groups: HashMap<usize, Vec<String>>,
}

impl CollapseGroups {
    /// Original labels merged into kept row `row`, if it absorbed any duplicates
    pub fn members(&self, row: usize) -> Option<&[String]> {
        self.groups.get(&row).map(Vec::as_slice)
    }

    /// Number of rows that were removed
    pub fn n_collapsed(&self) -> usize {
        self.groups.values().map(|g| g.len() - 1).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn members_of(&self, placement: &Placement, first_id: usize) -> Option<&[String]> {
        placement
            .sequence_id()
            .checked_sub(first_id)
            .and_then(|row| self.members(row))
    }

    /// Attach all member labels to each placement of a sample whose first
    /// row was numbered `first_id`
    pub fn annotate(&self, sample: &mut Sample, first_id: usize) {
        for placement in sample.iter_mut() {
            if let Some(members) = self.members_of(placement, first_id) {
                placement.set_labels(members.to_vec());
            }
        }
    }

    /// One placement per original label, each carrying the kept row's records
    pub fn expand(&self, sample: &Sample, first_id: usize) -> Sample {
        let mut expanded = Sample::new(sample.newick());
        for placement in sample.iter() {
            match self.members_of(placement, first_id) {
                Some(members) => {
                    for label in members {
                        let mut copy = placement.clone();
                        copy.set_labels(vec![label.clone()]);
                        expanded.push(copy);
                    }
                }
                None => expanded.push(placement.clone()),
            }
        }
        expanded
    }
}

/// Merge rows that are identical across their valid ranges.
///
/// The first occurrence of each distinct row is kept, in its original order.
/// Rows without any data column collapse with each other.
pub fn find_collapse_equal_sequences(msa: &mut Msa) -> CollapseGroups {
    let sequences = std::mem::take(&mut msa.sequences);
    let sites = msa.sites;

    let mut first_seen: HashMap<(Option<SiteRange>, Vec<u8>), usize> = HashMap::new();
    let mut kept: Vec<Sequence> = Vec::with_capacity(sequences.len());
    let mut members: Vec<Vec<String>> = Vec::with_capacity(sequences.len());

    for seq in sequences {
        let range = get_valid_range(seq.sites());
        let core = match range {
            Some(r) => seq.sites()[r.first..=r.last].to_vec(),
            None => Vec::new(),
        };
        match first_seen.get(&(range, core.clone())) {
            Some(&k) => members[k].push(seq.label().to_string()),
            None => {
                first_seen.insert((range, core), kept.len());
                members.push(vec![seq.label().to_string()]);
                kept.push(seq);
            }
        }
    }

    msa.sequences = kept;
    msa.sites = if msa.sequences.is_empty() { 0 } else { sites };

    let groups = members
        .into_iter()
        .enumerate()
        .filter(|(_, m)| m.len() > 1)
        .collect();

    CollapseGroups { groups }
}
