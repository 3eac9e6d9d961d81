//! # Telemetry Blackboard
//!
//! Progress tracking for placement runs. Workers bump atomic counters from
//! inside rayon iterators; a background heartbeat thread reads them and
//! reports to stderr.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Initializing = 0,
    LoadingData = 1,
    Calibrating = 2,
    Placing = 3,
    WritingOutput = 4,
    Complete = 5,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Initializing => "Initializing",
            Stage::LoadingData => "Loading Data",
            Stage::Calibrating => "Calibrating",
            Stage::Placing => "Placing",
            Stage::WritingOutput => "Writing Output",
            Stage::Complete => "Complete",
        }
    }

    fn from_u64(val: u64) -> Self {
        match val {
            0 => Stage::Initializing,
            1 => Stage::LoadingData,
            2 => Stage::Calibrating,
            3 => Stage::Placing,
            4 => Stage::WritingOutput,
            _ => Stage::Complete,
        }
    }
}

/// Shared progress counters.
///
/// Relaxed ordering throughout; the heartbeat only needs approximate values.
pub struct TelemetryBlackboard {
    stage: AtomicU64,
    batches: AtomicU64,
    queries_placed: AtomicU64,
    total_queries: AtomicU64,
    start_time: Instant,
    last_progress_nanos: AtomicU64,
    shutdown: AtomicBool,
}

impl TelemetryBlackboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u64, Ordering::Relaxed);
        self.touch_progress();
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        Stage::from_u64(self.stage.load(Ordering::Relaxed))
    }

    pub fn set_total_queries(&self, total: u64) {
        self.total_queries.store(total, Ordering::Relaxed);
    }

    /// Record one finished batch of `queries` placements
    #[inline]
    pub fn add_batch(&self, queries: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.queries_placed.fetch_add(queries, Ordering::Relaxed);
        self.touch_progress();
    }

    pub fn queries_placed(&self) -> u64 {
        self.queries_placed.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    #[inline]
    fn touch_progress(&self) {
        let elapsed = self.start_time.elapsed().as_nanos() as u64;
        self.last_progress_nanos.store(elapsed, Ordering::Relaxed);
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            stage: self.stage(),
            batches: self.batches(),
            queries_placed: self.queries_placed(),
            total_queries: self.total_queries.load(Ordering::Relaxed),
            elapsed_secs: self.elapsed_secs(),
            stalled_secs: (self.start_time.elapsed().as_nanos() as u64)
                .saturating_sub(self.last_progress_nanos.load(Ordering::Relaxed))
                / 1_000_000_000,
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Default for TelemetryBlackboard {
    fn default() -> Self {
        Self {
            stage: AtomicU64::new(Stage::Initializing as u64),
            batches: AtomicU64::new(0),
            queries_placed: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            start_time: Instant::now(),
            last_progress_nanos: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }
}

struct TelemetrySnapshot {
    stage: Stage,
    batches: u64,
    queries_placed: u64,
    total_queries: u64,
    elapsed_secs: f64,
    stalled_secs: u64,
}

impl TelemetrySnapshot {
    fn percent(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        (self.queries_placed as f64 / self.total_queries as f64 * 100.0).min(100.0)
    }
}

pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// Seconds without progress before a line is flagged as stalled
    pub stall_threshold_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stall_threshold_secs: 300,
        }
    }
}

pub struct HeartbeatHandle {
    handle: Option<JoinHandle<()>>,
    blackboard: Arc<TelemetryBlackboard>,
}

impl HeartbeatHandle {
    /// Start the heartbeat thread; runs without one if the spawn fails
    pub fn spawn(blackboard: Arc<TelemetryBlackboard>, config: HeartbeatConfig) -> Self {
        let bb = blackboard.clone();
        let is_tty = io::stderr().is_terminal();

        let handle = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || heartbeat_loop(bb, config, is_tty))
            .map_err(|e| warn!("heartbeat disabled: {}", e))
            .ok();

        Self { handle, blackboard }
    }

    pub fn shutdown(mut self) {
        self.blackboard.signal_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.blackboard.signal_shutdown();
    }
}

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor();
        format!("{:.0}m{:.0}s", mins, secs % 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

fn heartbeat_loop(bb: Arc<TelemetryBlackboard>, config: HeartbeatConfig, is_tty: bool) {
    let interval = Duration::from_secs(config.interval_secs);
    // Poll in short steps so shutdown is not delayed by a full interval
    let step = Duration::from_millis(200).min(interval);
    let mut last_queries = 0u64;
    let mut last_time = Instant::now();

    'outer: loop {
        let wake = Instant::now() + interval;
        while Instant::now() < wake {
            if bb.is_shutdown() {
                break 'outer;
            }
            thread::sleep(step);
        }

        let snap = bb.snapshot();
        let now = Instant::now();
        let dt = now.duration_since(last_time).as_secs_f64();
        let velocity = if dt > 0.1 {
            snap.queries_placed.saturating_sub(last_queries) as f64 / dt
        } else {
            0.0
        };
        last_queries = snap.queries_placed;
        last_time = now;

        let eta = if velocity > 0.0 && snap.total_queries > snap.queries_placed {
            format_duration((snap.total_queries - snap.queries_placed) as f64 / velocity)
        } else {
            "unknown".to_string()
        };
        let stalled = snap.stalled_secs > config.stall_threshold_secs;

        if is_tty {
            eprint!(
                "\r{:>5.1}% | {} | Q{}/{} B{} | {:.0} q/s | {} | ETA: {}{}    \x1b[K",
                snap.percent(),
                snap.stage.as_str(),
                snap.queries_placed,
                snap.total_queries,
                snap.batches,
                velocity,
                format_duration(snap.elapsed_secs),
                eta,
                if stalled { " [STALLED]" } else { "" }
            );
            let _ = io::stderr().flush();
        } else {
            eprintln!(
                "[HEARTBEAT] stage=\"{}\" queries={}/{} batches={} velocity={:.0}/s \
                 elapsed={:.0}s eta={} stalled={}",
                snap.stage.as_str(),
                snap.queries_placed,
                snap.total_queries,
                snap.batches,
                velocity,
                snap.elapsed_secs,
                eta,
                stalled
            );
        }
    }

    if is_tty {
        eprint!("\r\x1b[K");
        let _ = io::stderr().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip() {
        for stage in [
            Stage::Initializing,
            Stage::LoadingData,
            Stage::Calibrating,
            Stage::Placing,
            Stage::WritingOutput,
            Stage::Complete,
        ] {
            assert_eq!(Stage::from_u64(stage as u64), stage);
        }
    }

    #[test]
    fn test_counters() {
        let bb = TelemetryBlackboard::new();
        bb.set_stage(Stage::Placing);
        bb.set_total_queries(10);
        bb.add_batch(4);
        bb.add_batch(2);
        assert_eq!(bb.stage(), Stage::Placing);
        assert_eq!(bb.batches(), 2);
        assert_eq!(bb.queries_placed(), 6);
        assert!((bb.snapshot().percent() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_heartbeat_shutdown_is_prompt() {
        let bb = TelemetryBlackboard::new();
        let handle = HeartbeatHandle::spawn(bb, HeartbeatConfig::default());
        let start = Instant::now();
        handle.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30s");
        assert_eq!(format_duration(90.0), "1m30s");
        assert_eq!(format_duration(3661.0), "1.0h");
    }
}
