//! # Pipeline Module
//!
//! High-level orchestration of placement runs. Coordinates I/O, the
//! likelihood engine, aggregation and (optionally) distribution.

pub mod distributed;
pub mod placement;

pub use distributed::DistributedPipeline;
pub use placement::{
    place_batch, AggregationSettings, PlacementPipeline, PlacementSettings,
};
