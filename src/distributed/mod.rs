//! # Distribution Layer
//!
//! Splitting the placement workload across cooperating workers.
//!
//! - `schedule`: turns measured per-stage costs into a worker allocation
//! - `transport`: byte-payload message passing and the `Sample` exchange

pub mod schedule;
pub mod transport;

pub use schedule::{solve, to_difficulty};
pub use transport::{receive_sample, send_sample, LocalTransport, Transport};

/// Message tags used between pipeline ranks
pub mod tags {
    /// Placed (raw) batch, placement worker to aggregation worker
    pub const PLACED: u32 = 1;
    /// Finalised batch, aggregation worker to collector
    pub const AGGREGATED: u32 = 2;
    /// Empty payload marking the end of a sender's output
    pub const FINISHED: u32 = 3;
}
