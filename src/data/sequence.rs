//! # Sequence Definitions
//!
//! A labelled row of an alignment plus the site-range helpers used to
//! describe which columns of a row carry data.

use std::fmt;

/// Symbols treated as alignment gaps
pub const GAP_SYMBOLS: &[u8] = b"-.";

#[inline]
pub fn is_gap(symbol: u8) -> bool {
    GAP_SYMBOLS.contains(&symbol)
}

/// One aligned sequence: identifier plus its symbols (upper case ASCII)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Sequence {
    label: String,
    sites: Vec<u8>,
}

impl Sequence {
    /// Create a sequence, upper-casing the symbols
    pub fn new(label: impl Into<String>, sites: impl Into<Vec<u8>>) -> Self {
        let mut sites = sites.into();
        sites.make_ascii_uppercase();
        Self {
            label: label.into(),
            sites,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sites(&self) -> &[u8] {
        &self.sites
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Consume into (label, sites)
    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.label, self.sites)
    }

    /// True when every column is a gap
    pub fn is_all_gaps(&self) -> bool {
        self.sites.iter().all(|&s| is_gap(s))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ">{}\n{}", self.label, String::from_utf8_lossy(&self.sites))
    }
}

/// Inclusive column interval `[first, last]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteRange {
    pub first: usize,
    pub last: usize,
}

impl SiteRange {
    pub fn new(first: usize, last: usize) -> Self {
        debug_assert!(first <= last);
        Self { first, last }
    }

    /// Number of columns covered
    pub fn span(&self) -> usize {
        self.last - self.first + 1
    }

    pub fn contains(&self, column: usize) -> bool {
        column >= self.first && column <= self.last
    }
}

/// Smallest interval containing both `a` and `b`
pub fn superset(a: SiteRange, b: SiteRange) -> SiteRange {
    SiteRange {
        first: a.first.min(b.first),
        last: a.last.max(b.last),
    }
}

/// Inclusive interval spanning the first to the last non-gap column.
///
/// Returns `None` for a sequence made only of gaps.
pub fn get_valid_range(sequence: &[u8]) -> Option<SiteRange> {
    let first = sequence.iter().position(|&s| !is_gap(s))?;
    let last = sequence.iter().rposition(|&s| !is_gap(s))?;
    Some(SiteRange { first, last })
}
