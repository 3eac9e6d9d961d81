//! # epa: Evolutionary Placement
//!
//! ```bash
//! # Queries in a separate alignment
//! epa tree.newick reference.fasta -q queries.fasta -o placements.jplace
//!
//! # Queries are the reference rows that are not tips of the tree
//! epa tree.newick combined.fasta --premask --filter-acc-lwr 0.99
//!
//! # Split the work over four workers, with profiling output
//! epa tree.newick reference.fasta -q queries.fasta --workers 4 --profile
//! ```

use std::time::Instant;

use epa::config::Config;
use epa::pipelines::{DistributedPipeline, PlacementPipeline};
use epa::utils::telemetry::{HeartbeatConfig, HeartbeatHandle, Stage, TelemetryBlackboard};
use epa::utils::threading::init_global_pool;
use epa::Result;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Span-close timings with uptime stamps
fn init_profiling() {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(false)
                .with_timer(fmt::time::uptime()),
        )
        .init();
}

/// Plain log lines filtered by `RUST_LOG` (default `info`)
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let start = Instant::now();
    let config = Config::parse_and_validate()?;

    if config.profile {
        init_profiling();
        eprintln!("=== Profiling enabled ===\n");
    } else {
        init_logging();
    }

    let n_threads = init_global_pool(config.threads);
    eprintln!("epa v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Threads: {}", n_threads);

    let telemetry = TelemetryBlackboard::new();
    let heartbeat = HeartbeatHandle::spawn(telemetry.clone(), HeartbeatConfig::default());

    let sample = if config.is_distributed() {
        eprintln!("Mode: distributed ({} workers)", config.workers.unwrap_or_default());
        DistributedPipeline::new(config, Some(telemetry.clone())).run()?
    } else {
        eprintln!("Mode: single node");
        PlacementPipeline::new(config, Some(telemetry.clone())).run()?
    };

    telemetry.set_stage(Stage::Complete);
    heartbeat.shutdown();

    eprintln!(
        "\nPlaced {} queries in {:.2}s",
        sample.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
