//! # Utilities Module
//!
//! Cross-cutting helpers that don't belong in domain-specific modules.
//!
//! - `telemetry`: progress counters and the heartbeat reporter
//! - `threading`: Rayon thread pool configuration
//! - `workspace`: per-worker scratch buffers for the insertion subtree

pub mod telemetry;
pub mod threading;
pub mod workspace;
