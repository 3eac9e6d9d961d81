//! # Threading Configuration
//!
//! Rayon pool setup for the placement engine.

use tracing::debug;

use crate::error::{EpaError, Result};

/// Create a configured thread pool. `0` means one thread per core.
pub fn build_thread_pool(n_threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .thread_name(|i| format!("epa-worker-{}", i))
        .build()
        .map_err(|e| EpaError::config(format!("Failed to create thread pool: {}", e)))
}

/// Size the global pool once per process. Later calls keep the existing pool.
pub fn init_global_pool(n_threads: Option<usize>) -> usize {
    let requested = n_threads.unwrap_or(0);
    match rayon::ThreadPoolBuilder::new()
        .num_threads(requested)
        .thread_name(|i| format!("epa-worker-{}", i))
        .build_global()
    {
        Ok(()) => debug!(threads = rayon::current_num_threads(), "global thread pool ready"),
        Err(e) => debug!("keeping existing global thread pool: {}", e),
    }
    rayon::current_num_threads()
}
