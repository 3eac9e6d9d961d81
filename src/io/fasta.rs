//! # FASTA Alignment Input
//!
//! Aligned FASTA reading through `bio::io::fasta`. Paths ending in `.gz` are
//! decompressed on the fly. Symbols are upper-cased on read.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use bio::io::fasta;
use flate2::read::MultiGzDecoder;

use crate::data::{Msa, Sequence};
use crate::error::{EpaError, Result};

/// Boxed stream of sequences, movable into a prefetch thread
pub type SequenceSource = Box<dyn Iterator<Item = Result<Sequence>> + Send>;

fn open_raw(path: &Path) -> Result<Box<dyn Read + Send>> {
    if !path.exists() {
        return Err(EpaError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let file = File::open(path)?;
    let is_gzipped = path.extension().map(|e| e == "gz").unwrap_or(false);
    Ok(if is_gzipped {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    })
}

/// Iterator over the records of a FASTA file
pub struct FastaSource {
    records: fasta::Records<std::io::BufReader<Box<dyn Read + Send>>>,
    index: usize,
}

impl FastaSource {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = fasta::Reader::new(open_raw(path)?);
        Ok(Self {
            records: reader.records(),
            index: 0,
        })
    }

    /// Box as a generic sequence source
    pub fn boxed(self) -> SequenceSource {
        Box::new(self)
    }
}

impl Iterator for FastaSource {
    type Item = Result<Sequence>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        let index = self.index;
        self.index += 1;
        Some(
            record
                .map_err(|e| EpaError::format(format!("malformed FASTA record {}: {}", index, e)))
                .map(|r| Sequence::new(r.id(), r.seq())),
        )
    }
}

/// Load a whole alignment into memory, rejecting unequal row lengths
pub fn read_msa(path: &Path) -> Result<Msa> {
    let mut msa = Msa::new();
    for seq in FastaSource::open(path)? {
        msa.push(seq?)?;
    }
    if msa.is_empty() {
        return Err(EpaError::format(format!(
            "alignment '{}' contains no sequences",
            path.display()
        )));
    }
    Ok(msa)
}

/// Reference rows whose label is not in `exclude`, as a sequence source
pub fn rows_except(msa: &Msa, exclude: &HashSet<String>) -> SequenceSource {
    let rows: Vec<Sequence> = msa
        .iter()
        .filter(|s| !exclude.contains(s.label()))
        .cloned()
        .collect();
    Box::new(rows.into_iter().map(Ok))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const FASTA: &str = ">a\nacgt\nAC\n>b desc\nACGTTT\n>c\nAC-T-A\n";

    #[test]
    fn test_read_msa() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.fasta");
        std::fs::write(&path, FASTA).unwrap();
        let msa = read_msa(&path).unwrap();
        assert_eq!(msa.len(), 3);
        assert_eq!(msa.num_sites(), 6);
        assert_eq!(msa.get(0).unwrap().sites(), b"ACGTAC");
        assert_eq!(msa.get(1).unwrap().label(), "b");
    }

    #[test]
    fn test_read_gzipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.fasta.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(FASTA.as_bytes()).unwrap();
        enc.finish().unwrap();
        let labels: Vec<String> = FastaSource::open(&path)
            .unwrap()
            .map(|s| s.unwrap().label().to_string())
            .collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ragged_alignment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.fasta");
        std::fs::write(&path, ">a\nACGT\n>b\nACG\n").unwrap();
        assert!(matches!(read_msa(&path), Err(EpaError::Format { .. })));
    }

    #[test]
    fn test_missing_file() {
        let err = FastaSource::open(Path::new("/nonexistent/q.fasta")).err().unwrap();
        assert!(matches!(err, EpaError::FileNotFound { .. }));
    }

    #[test]
    fn test_rows_except() {
        let mut msa = Msa::new();
        msa.append("t1", b"AC".to_vec()).unwrap();
        msa.append("q1", b"AG".to_vec()).unwrap();
        let exclude: HashSet<String> = ["t1".to_string()].into_iter().collect();
        let rest: Vec<Sequence> = rows_except(&msa, &exclude).map(|s| s.unwrap()).collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].label(), "q1");
    }
}
