//! # Placement Pipeline
//!
//! Single-node orchestration:
//! 1. **Load:** reference tree and alignment, build the `ReferenceTree`
//! 2. **Stream:** open the query alignment as a `MsaStream`
//! 3. **Per batch:** collapse duplicates, place every query on every branch,
//!    compute LWRs, apply the configured filters
//! 4. **Output:** merged `Sample` written as a jplace file
//!
//! The engine itself (`place_batch`) is shared with the distributed pipeline.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, info_span, instrument, warn};

use crate::config::Config;
use crate::data::msa::find_collapse_equal_sequences;
use crate::data::sequence::{get_valid_range, superset};
use crate::data::{BranchIdx, Msa, MsaInfo, Placement, Sample, Tree};
use crate::error::Result;
use crate::io::fasta::{read_msa, rows_except, FastaSource, SequenceSource};
use crate::io::{write_jplace, MsaStream};
use crate::model::aggregation::{
    compute_and_set_lwr, discard_bottom_x_percent, discard_by_accumulated_threshold,
    discard_by_support_threshold,
};
use crate::model::{ReferenceTree, TinyTree, DEFAULT_PENDANT_LENGTH};
use crate::utils::telemetry::{Stage, TelemetryBlackboard};
use crate::utils::workspace::TinyWorkspace;

/// How each insertion is scored
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlacementSettings {
    pub optimize: bool,
    pub pendant_length: f64,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            optimize: false,
            pendant_length: DEFAULT_PENDANT_LENGTH,
        }
    }
}

impl PlacementSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            optimize: config.optimize_branches,
            pendant_length: config.pendant_length,
        }
    }
}

/// LWR computation followed by the enabled filters
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AggregationSettings {
    pub min_lwr: Option<f64>,
    pub acc_lwr: Option<f64>,
    pub bottom_percent: Option<f64>,
}

impl AggregationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_lwr: config.filter_min_lwr,
            acc_lwr: config.filter_acc_lwr,
            bottom_percent: config.filter_bottom_percent,
        }
    }

    pub fn apply(&self, sample: &mut Sample) -> Result<()> {
        compute_and_set_lwr(sample);
        if let Some(thresh) = self.min_lwr {
            discard_by_support_threshold(sample, thresh)?;
        }
        if let Some(thresh) = self.acc_lwr {
            discard_by_accumulated_threshold(sample, thresh)?;
        }
        if let Some(x) = self.bottom_percent {
            discard_bottom_x_percent(sample, x)?;
        }
        Ok(())
    }
}

/// Place every query of `queries` on every branch.
///
/// Placement `i` gets sequence id `first_id + i`; records come out in branch
/// order. Either every query is placed or the call fails.
#[instrument(skip_all, fields(queries = queries.len()))]
pub fn place_batch(
    reference: &ReferenceTree,
    queries: &Msa,
    first_id: usize,
    settings: &PlacementSettings,
) -> Result<Sample> {
    let n_branches = reference.n_branches();
    let tiny_trees: Vec<TinyTree<'_>> = (0..n_branches)
        .map(|b| {
            TinyTree::new(reference, BranchIdx::from(b), settings.optimize)
                .with_pendant_length(settings.pendant_length)
        })
        .collect();

    let sites = reference.sites();
    let rate_cats = reference.model().n_rate_cats();

    let placements = queries
        .sequences()
        .par_iter()
        .enumerate()
        .map_init(
            || TinyWorkspace::new(sites, rate_cats),
            |ws, (i, query)| -> Result<Placement> {
                if query.is_all_gaps() {
                    warn!(query = query.label(), "query consists only of gaps");
                }
                let mut placement = Placement::new(first_id + i, query.label(), n_branches);
                for tiny in &tiny_trees {
                    placement.push(tiny.place(query, ws)?);
                }
                Ok(placement)
            },
        )
        .collect::<Result<Vec<_>>>()?;

    let mut sample = Sample::with_capacity(reference.numbered_newick(), placements.len());
    for placement in placements {
        sample.push(placement);
    }
    Ok(sample)
}

/// Collapse identical queries, place the survivors and attach every
/// collapsed label to its placement
pub fn place_collapsed(
    reference: &ReferenceTree,
    batch: &mut Msa,
    first_id: usize,
    settings: &PlacementSettings,
) -> Result<Sample> {
    let span = batch
        .iter()
        .filter_map(|s| get_valid_range(s.sites()))
        .reduce(superset);
    if let Some(span) = span {
        debug!(first = span.first, last = span.last, "batch column span");
    }

    let groups = find_collapse_equal_sequences(batch);
    if !groups.is_empty() {
        debug!(collapsed = groups.n_collapsed(), "merged duplicate queries");
    }
    let mut sample = place_batch(reference, batch, first_id, settings)?;
    groups.annotate(&mut sample, first_id);
    Ok(sample)
}

/// Where the queries come from
#[derive(Clone, Debug)]
pub enum QuerySource {
    File(PathBuf),
    /// Reference rows that are not tree tips
    ReferenceRows {
        msa: Arc<Msa>,
        tips: Arc<HashSet<String>>,
    },
}

impl QuerySource {
    /// A fresh source positioned at the first query
    pub fn open(&self) -> Result<SequenceSource> {
        match self {
            QuerySource::File(path) => Ok(FastaSource::open(path)?.boxed()),
            QuerySource::ReferenceRows { msa, tips } => Ok(rows_except(msa, tips)),
        }
    }
}

/// Everything loaded before streaming starts
pub struct PreparedInputs {
    pub reference: ReferenceTree,
    pub queries: QuerySource,
    /// Summary of the query alignment, carrying the reference gap mask when premasking
    pub query_info: MsaInfo,
}

impl PreparedInputs {
    /// Number of queries the stream will produce
    pub fn query_count(&self, max_sequences: Option<usize>) -> usize {
        let total = self.query_info.sequences();
        max_sequences.map_or(total, |m| m.min(total))
    }
}

/// Load tree, reference alignment and model; scan the queries
pub fn prepare(config: &Config) -> Result<PreparedInputs> {
    let _span = info_span!("prepare").entered();

    let tree = Tree::from_file(&config.tree)?;
    let reference_msa = read_msa(&config.reference_msa)?;
    let tips: HashSet<String> = tree
        .tips()
        .filter_map(|(_, label)| label.map(str::to_string))
        .collect();

    let tip_rows = Msa::from_sequences(
        reference_msa
            .iter()
            .filter(|s| tips.contains(s.label()))
            .cloned()
            .collect(),
    )?;
    let model = config.model(&tip_rows)?;
    info!(
        model = model.name(),
        tips = tree.n_tips(),
        branches = tree.n_branches(),
        sites = reference_msa.num_sites(),
        "loaded reference"
    );

    let reference_info = MsaInfo::from_msa(&tip_rows);
    let queries = match &config.query {
        Some(path) => QuerySource::File(path.clone()),
        None => QuerySource::ReferenceRows {
            msa: Arc::new(reference_msa),
            tips: Arc::new(tips),
        },
    };
    let mut query_info = MsaInfo::scan(queries.open()?)?;

    let reference = if config.premask {
        query_info = query_info.with_reference_mask(&reference_info)?;
        info!(
            masked = reference_info.gap_count(),
            kept = reference_info.nongap_count(),
            "premasking all-gap reference columns"
        );
        ReferenceTree::new(tree, &reference_info.mask_msa(&tip_rows)?, model)?
    } else {
        ReferenceTree::new(tree, &tip_rows, model)?
    };

    info!(queries = query_info.sequences(), "scanned query alignment");
    Ok(PreparedInputs {
        reference,
        queries,
        query_info,
    })
}

pub struct PlacementPipeline {
    config: Config,
    telemetry: Option<Arc<TelemetryBlackboard>>,
}

impl PlacementPipeline {
    pub fn new(config: Config, telemetry: Option<Arc<TelemetryBlackboard>>) -> Self {
        Self { config, telemetry }
    }

    fn set_stage(&self, stage: Stage) {
        if let Some(t) = &self.telemetry {
            t.set_stage(stage);
        }
    }

    /// Run the whole placement and write the jplace file. Returns the result.
    pub fn run(&mut self) -> Result<Sample> {
        let _span = info_span!("placement_pipeline").entered();

        self.set_stage(Stage::LoadingData);
        let inputs = prepare(&self.config)?;
        let settings = PlacementSettings::from_config(&self.config);
        let aggregation = AggregationSettings::from_config(&self.config);
        if let Some(t) = &self.telemetry {
            t.set_total_queries(inputs.query_count(self.config.max_sequences) as u64);
        }

        self.set_stage(Stage::Placing);
        let mut stream = MsaStream::new(
            inputs.queries.open()?,
            inputs.query_info.clone(),
            &self.config.streaming_config(),
        )?;

        let mut result = Sample::new(inputs.reference.numbered_newick());
        let mut batch = Msa::new();
        loop {
            let first_id = stream.position();
            let n = stream.read_next(&mut batch, self.config.chunk_size)?;
            if n == 0 {
                break;
            }
            let mut sample = place_collapsed(&inputs.reference, &mut batch, first_id, &settings)?;
            aggregation.apply(&mut sample)?;
            debug!(first_id, queries = n, placed = sample.len(), "batch done");
            result.merge(sample);
            if let Some(t) = &self.telemetry {
                t.add_batch(n as u64);
            }
        }
        info!(placements = result.len(), "placement finished");

        self.set_stage(Stage::WritingOutput);
        write_jplace(&self.config.out, &result, &self.config.invocation)?;
        info!(path = %self.config.out.display(), "wrote jplace");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubstitutionModel;

    fn reference() -> ReferenceTree {
        let tree = Tree::from_newick("((a:0.1,b:0.2):0.05,(c:0.3,d:0.1):0.2,e:0.4);").unwrap();
        let mut msa = Msa::new();
        msa.append("a", b"ACGTACGTAA".to_vec()).unwrap();
        msa.append("b", b"ACGTACGTTA".to_vec()).unwrap();
        msa.append("c", b"ACCTACCTAA".to_vec()).unwrap();
        msa.append("d", b"TCCTACCTAA".to_vec()).unwrap();
        msa.append("e", b"GGGTACCTAC".to_vec()).unwrap();
        ReferenceTree::new(tree, &msa, SubstitutionModel::jc69()).unwrap()
    }

    fn queries() -> Msa {
        let mut msa = Msa::new();
        msa.append("q1", b"ACGTACGTAA".to_vec()).unwrap();
        msa.append("q2", b"GGGTACCTAC".to_vec()).unwrap();
        msa.append("q3", b"ACGTACGTAA".to_vec()).unwrap();
        msa
    }

    #[test]
    fn test_one_record_per_branch_in_order() {
        let reference = reference();
        let sample = place_batch(&reference, &queries(), 10, &PlacementSettings::default()).unwrap();
        assert_eq!(sample.len(), 3);
        assert_eq!(sample.newick(), reference.numbered_newick());
        for (i, p) in sample.iter().enumerate() {
            assert_eq!(p.sequence_id(), 10 + i);
            assert_eq!(p.len(), reference.n_branches());
            for (b, r) in p.records().iter().enumerate() {
                assert_eq!(r.branch().as_usize(), b);
                assert!(r.likelihood().is_finite());
            }
        }
    }

    #[test]
    fn test_bad_query_fails_whole_batch() {
        let reference = reference();
        let mut msa = queries();
        msa.clear();
        msa.append("short", b"ACGT".to_vec()).unwrap();
        let err = place_batch(&reference, &msa, 0, &PlacementSettings::default()).unwrap_err();
        assert!(matches!(err, crate::error::EpaError::Format { .. }));
    }

    #[test]
    fn test_collapsed_duplicates_share_records() {
        let reference = reference();
        let mut batch = queries();
        let sample = place_collapsed(&reference, &mut batch, 0, &PlacementSettings::default()).unwrap();
        assert_eq!(sample.len(), 2);
        assert_eq!(sample.placements()[0].labels(), &["q1".to_string(), "q3".to_string()]);
    }

    #[test]
    fn test_expanded_duplicates_carry_identical_records() {
        let reference = reference();
        let mut batch = Msa::new();
        batch.append("x", b"--ACGTAC--".to_vec()).unwrap();
        batch.append("y", b"--ACGTAC--".to_vec()).unwrap();
        batch.append("z", b"GGGTACCTAC".to_vec()).unwrap();

        let groups = find_collapse_equal_sequences(&mut batch);
        assert_eq!(batch.len(), 2);
        let sample = place_batch(&reference, &batch, 5, &PlacementSettings::default()).unwrap();
        let expanded = groups.expand(&sample, 5);

        let labels: Vec<&str> = expanded.iter().map(|p| p.label()).collect();
        assert_eq!(labels, vec!["x", "y", "z"]);
        let (x, y) = (&expanded.placements()[0], &expanded.placements()[1]);
        assert_eq!(x.sequence_id(), y.sequence_id());
        assert_eq!(x.records(), y.records());
        assert_eq!(x.records().len(), reference.n_branches());
    }

    #[test]
    fn test_aggregation_settings() {
        let reference = reference();
        let mut sample = place_batch(&reference, &queries(), 0, &PlacementSettings::default()).unwrap();
        AggregationSettings::default().apply(&mut sample).unwrap();
        for p in sample.iter() {
            let total: f64 = p.records().iter().map(|r| r.lwr()).sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert_eq!(p.len(), reference.n_branches());
        }

        let filters = AggregationSettings {
            acc_lwr: Some(0.0),
            ..Default::default()
        };
        filters.apply(&mut sample).unwrap();
        assert!(sample.iter().all(|p| p.len() == 1));
    }
}
