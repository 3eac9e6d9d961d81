//! # EPA Library
//!
//! Evolutionary placement of query sequences onto a fixed reference tree.
//!
//! ## Modules
//! - `config`: CLI argument parsing and validation
//! - `data`: alignments, trees and placement results
//! - `distributed`: worker allocation and message transport
//! - `error`: Error types and result aliases
//! - `io`: FASTA input, streaming query reader, jplace output
//! - `model`: likelihood engine, insertion subtree, LWR and filters
//! - `pipelines`: High-level workflow orchestration
//! - `utils`: telemetry, threading and per-worker workspaces

pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod io;
pub mod model;
pub mod pipelines;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use data::{BranchIdx, InsertionRecord, Msa, MsaInfo, Placement, Sample, Sequence, Tree};
pub use error::{EpaError, Result};
pub use io::{Jplace, MsaStream, StreamingConfig};
pub use model::{ReferenceTree, SubstitutionModel, TinyTree};
pub use pipelines::{DistributedPipeline, PlacementPipeline};
