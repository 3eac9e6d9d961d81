//! # Distributed Pipeline
//!
//! Placement split across cooperating workers connected by a `Transport`.
//!
//! Ranks: `0` is the collector; `1..=P` place queries; `P+1..=N` compute
//! LWRs and filter. The split `P` / `N-P` comes from `solve` over stage
//! throughputs measured on a random calibration subset.
//!
//! Each placement worker streams a contiguous slice of the queries
//! (`skip_to_sequence` + `constrain`) and sends every placed batch to an
//! aggregation worker, chosen round-robin. Aggregation workers finalise the
//! batches and forward them to the collector, which restores query order.
//! Every sender ends its output with an empty `FINISHED` message, also on
//! failure, so no receiver waits forever.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, info_span, warn};

use crate::config::Config;
use crate::data::{Msa, Sample, Sequence};
use crate::distributed::transport::{status, status_error};
use crate::distributed::{
    receive_sample, send_sample, solve, tags, to_difficulty, LocalTransport, Transport,
};
use crate::error::Result;
use crate::io::{write_jplace, MsaStream, StreamingConfig};
use crate::pipelines::placement::{
    place_batch, place_collapsed, prepare, AggregationSettings, PlacementSettings, PreparedInputs,
};
use crate::utils::telemetry::{Stage, TelemetryBlackboard};

const COLLECTOR: usize = 0;

/// Pipeline stages in allocation order
const STAGES: usize = 2;

/// Split `workers` between placement and aggregation from per-query stage costs.
///
/// `solve` hands out units inversely to its input, so it is fed each stage's
/// relative throughput (`1 / cost`): the slow placement stage then receives
/// proportionally more workers and both stages drain batches at similar rates.
pub fn allocate_workers(place_cost: f64, aggregate_cost: f64, workers: usize) -> Result<(usize, usize)> {
    let mut throughput = vec![1.0 / place_cost.max(1e-9), 1.0 / aggregate_cost.max(1e-9)];
    to_difficulty(&mut throughput)?;
    let allocation = solve(STAGES, workers, &throughput)?;
    debug!(?throughput, ?allocation, "stage throughput");
    Ok((allocation[0], allocation[1]))
}

/// Even contiguous split of `total` items into `parts` `(start, len)` slices
pub fn split_evenly(total: usize, parts: usize) -> Vec<(usize, usize)> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let extra = total % parts;
    let mut start = 0;
    (0..parts)
        .map(|k| {
            let len = base + usize::from(k < extra);
            let slice = (start, len);
            start += len;
            slice
        })
        .collect()
}

pub struct DistributedPipeline {
    config: Config,
    telemetry: Option<Arc<TelemetryBlackboard>>,
}

impl DistributedPipeline {
    pub fn new(config: Config, telemetry: Option<Arc<TelemetryBlackboard>>) -> Self {
        Self { config, telemetry }
    }

    fn set_stage(&self, stage: Stage) {
        if let Some(t) = &self.telemetry {
            t.set_stage(stage);
        }
    }

    pub fn run(&mut self) -> Result<Sample> {
        let _span = info_span!("distributed_pipeline").entered();
        let workers = self.config.workers.unwrap_or(STAGES).max(STAGES);

        self.set_stage(Stage::LoadingData);
        let inputs = prepare(&self.config)?;
        let total = inputs.query_count(self.config.max_sequences);
        let placement = PlacementSettings::from_config(&self.config);
        let aggregation = AggregationSettings::from_config(&self.config);
        if let Some(t) = &self.telemetry {
            t.set_total_queries(total as u64);
        }

        self.set_stage(Stage::Calibrating);
        let (place_cost, aggregate_cost) = self.calibrate(&inputs, total, &placement, &aggregation)?;
        let (n_place, n_aggregate) = allocate_workers(place_cost, aggregate_cost, workers)?;
        info!(place_cost, aggregate_cost, n_place, n_aggregate, "worker allocation");

        self.set_stage(Stage::Placing);
        let mut ranks = LocalTransport::create(1 + workers);
        let mut collector = ranks.remove(0);
        let slices = split_evenly(total, n_place);
        let aggregators: Vec<usize> = (n_place + 1..=workers).collect();
        let streaming = self.config.streaming_config();
        let newick = inputs.reference.numbered_newick().to_string();

        let collected = thread::scope(|s| {
            let mut handles = Vec::with_capacity(workers);
            for (k, mut transport) in ranks.into_iter().enumerate() {
                let inputs = &inputs;
                let aggregators = &aggregators;
                let streaming = &streaming;
                if k < n_place {
                    let slice = slices[k];
                    handles.push(s.spawn(move || {
                        placement_worker(&mut transport, inputs, streaming, slice, aggregators, &placement)
                    }));
                } else {
                    handles.push(s.spawn(move || {
                        aggregation_worker(&mut transport, n_place, &aggregation)
                    }));
                }
            }

            let collected = collect(&mut collector, n_aggregate, &newick, self.telemetry.as_deref());
            let mut outcome = Ok(());
            for handle in handles {
                let result = handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e));
                if outcome.is_ok() {
                    outcome = result;
                }
            }
            outcome.and(collected)
        })?;

        let mut result = collected;
        result.sort_by_sequence_id();
        info!(placements = result.len(), "distributed placement finished");

        self.set_stage(Stage::WritingOutput);
        write_jplace(&self.config.out, &result, &self.config.invocation)?;
        Ok(result)
    }

    /// Time both stages on a random subset; returns seconds per query for
    /// placement and aggregation
    fn calibrate(
        &self,
        inputs: &PreparedInputs,
        total: usize,
        placement: &PlacementSettings,
        aggregation: &AggregationSettings,
    ) -> Result<(f64, f64)> {
        let _span = info_span!("calibrate").entered();
        let size = self.config.calibration_size.min(total);
        if size == 0 {
            return Ok((1.0, 1.0));
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut picks = rand::seq::index::sample(&mut rng, total, size).into_vec();
        picks.sort_unstable();

        let mut subset = Msa::with_capacity(size);
        let mut wanted = picks.into_iter().peekable();
        for (i, seq) in inputs.queries.open()?.enumerate() {
            let Some(&next) = wanted.peek() else {
                break;
            };
            let seq = seq?;
            if i == next {
                let seq = if self.config.premask {
                    let sites = inputs.query_info.subset_sequence(seq.sites())?;
                    Sequence::new(seq.label(), sites)
                } else {
                    seq
                };
                subset.push(seq)?;
                wanted.next();
            }
        }

        let start = Instant::now();
        let mut sample = place_batch(&inputs.reference, &subset, 0, placement)?;
        let place_cost = start.elapsed().as_secs_f64() / size as f64;

        let start = Instant::now();
        aggregation.apply(&mut sample)?;
        let aggregate_cost = start.elapsed().as_secs_f64() / size as f64;

        debug!(place_cost, aggregate_cost, queries = size, "calibration timings");
        Ok((place_cost, aggregate_cost))
    }
}

/// Tell every receiver in `targets` that this rank is done
fn finish<T: Transport + ?Sized>(transport: &mut T, targets: &[usize]) {
    for &target in targets {
        if let Err(e) = transport.send(target, tags::FINISHED, &[]) {
            warn!(rank = transport.rank(), target, "could not signal completion: {}", e);
        }
    }
}

fn placement_worker<T: Transport + ?Sized>(
    transport: &mut T,
    inputs: &PreparedInputs,
    streaming: &StreamingConfig,
    (start, len): (usize, usize),
    aggregators: &[usize],
    settings: &PlacementSettings,
) -> Result<()> {
    let _span = info_span!("placement_worker", rank = transport.rank(), start, len).entered();

    let mut work = || -> Result<()> {
        if len == 0 || aggregators.is_empty() {
            return Ok(());
        }
        let mut stream = MsaStream::new(inputs.queries.open()?, inputs.query_info.clone(), streaming)?;
        stream.skip_to_sequence(start)?;
        stream.constrain(len)?;

        let mut batch = Msa::new();
        let mut next = 0usize;
        loop {
            let first_id = stream.position();
            if stream.read_next(&mut batch, streaming.chunk_size)? == 0 {
                return Ok(());
            }
            let sample = place_collapsed(&inputs.reference, &mut batch, first_id, settings)?;
            let dest = aggregators[next % aggregators.len()];
            send_sample(transport, dest, tags::PLACED, &sample)?;
            next += 1;
        }
    };
    let result = work();
    finish(transport, aggregators);
    result
}

fn aggregation_worker<T: Transport + ?Sized>(
    transport: &mut T,
    n_senders: usize,
    settings: &AggregationSettings,
) -> Result<()> {
    let _span = info_span!("aggregation_worker", rank = transport.rank()).entered();

    let mut work = || -> Result<()> {
        let mut finished = 0;
        while finished < n_senders {
            let envelope = transport.probe(None, None)?;
            match envelope.tag {
                tags::FINISHED => {
                    transport.recv(envelope.source, tags::FINISHED, &mut [])?;
                    finished += 1;
                }
                tags::PLACED => {
                    let (_, mut sample) = receive_sample(transport, Some(envelope.source), tags::PLACED)?;
                    settings.apply(&mut sample)?;
                    send_sample(transport, COLLECTOR, tags::AGGREGATED, &sample)?;
                }
                _ => return Err(status_error(status::ERR_TAG)),
            }
        }
        Ok(())
    };
    let result = work();
    finish(transport, &[COLLECTOR]);
    result
}

fn collect<T: Transport + ?Sized>(
    transport: &mut T,
    n_senders: usize,
    newick: &str,
    telemetry: Option<&TelemetryBlackboard>,
) -> Result<Sample> {
    let mut result = Sample::new(newick);
    let mut finished = 0;
    while finished < n_senders {
        let envelope = transport.probe(None, None)?;
        match envelope.tag {
            tags::FINISHED => {
                transport.recv(envelope.source, tags::FINISHED, &mut [])?;
                finished += 1;
            }
            tags::AGGREGATED => {
                let (source, part) = receive_sample(transport, Some(envelope.source), tags::AGGREGATED)?;
                debug!(source, placements = part.len(), "collected batch");
                if let Some(t) = telemetry {
                    t.add_batch(part.len() as u64);
                }
                result.merge(part);
            }
            _ => return Err(status_error(status::ERR_TAG)),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_evenly() {
        assert_eq!(split_evenly(10, 3), vec![(0, 4), (4, 3), (7, 3)]);
        assert_eq!(split_evenly(2, 3), vec![(0, 1), (1, 1), (2, 0)]);
        assert!(split_evenly(5, 0).is_empty());
    }

    #[test]
    fn test_expensive_placement_gets_most_workers() {
        assert_eq!(allocate_workers(1000.0, 1.0, 8).unwrap(), (7, 1));
        assert_eq!(allocate_workers(1.0, 1.0, 8).unwrap(), (4, 4));
        assert_eq!(allocate_workers(4.0, 1.0, 7).unwrap(), (5, 2));
        assert_eq!(allocate_workers(0.0, 0.0, 2).unwrap(), (1, 1));
        assert!(allocate_workers(1.0, 1.0, 1).is_err());
    }

    #[test]
    fn test_aggregation_worker_forwards_and_finishes() {
        use crate::data::{BranchIdx, InsertionRecord, Placement};

        let mut ranks = LocalTransport::create(3);
        let mut placer = ranks.pop().unwrap();
        let mut aggregator = ranks.pop().unwrap();
        let mut collector = ranks.pop().unwrap();

        let mut sample = Sample::new("(a:1{0},b:1{1},c:1{2});");
        let mut p = Placement::new(0, "q", 3);
        p.push(InsertionRecord::new(BranchIdx::new(0), -1.0, 0.5, 0.1));
        p.push(InsertionRecord::new(BranchIdx::new(1), -5.0, 0.5, 0.1));
        sample.push(p);
        send_sample(&mut placer, 1, tags::PLACED, &sample).unwrap();
        finish(&mut placer, &[1]);

        let settings = AggregationSettings {
            acc_lwr: Some(0.5),
            ..Default::default()
        };
        aggregation_worker(&mut aggregator, 1, &settings).unwrap();

        let result = collect(&mut collector, 1, "(a:1{0},b:1{1},c:1{2});", None).unwrap();
        assert_eq!(result.len(), 1);
        let records = result.placements()[0].records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].branch(), BranchIdx::new(0));
        assert!(records[0].lwr() > 0.98);
    }
}
