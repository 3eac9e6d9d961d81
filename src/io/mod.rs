//! # I/O Module
//!
//! File reading/writing boundaries. Converts between disk formats and the
//! in-memory `Msa`, `Tree` and `Sample` representations.
//!
//! - `fasta`: aligned FASTA input (plain or gzip)
//! - `streaming`: chunked, prefetching query reader
//! - `jplace`: placement file output

pub mod fasta;
pub mod jplace;
pub mod streaming;

pub use fasta::{read_msa, FastaSource, SequenceSource};
pub use jplace::{write_jplace, Jplace};
pub use streaming::{MsaStream, StreamingConfig};
