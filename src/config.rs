//! # Configuration
//!
//! Command-line arguments (`clap` derive), their validation, and the
//! conversions into the settings objects used by the pipelines.
//!
//! ```bash
//! epa tree.newick reference.fasta -q queries.fasta -o placements.jplace --threads 8
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};

use crate::data::Msa;
use crate::error::{EpaError, Result};
use crate::io::StreamingConfig;
use crate::model::parameters::{empirical_frequencies, N_RATES, STATES};
use crate::model::{SubstitutionModel, DEFAULT_PENDANT_LENGTH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum ModelKind {
    Gtr,
    Jc69,
    K80,
    F81,
    Hky,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "epa", version, about = "Place query sequences onto a fixed reference tree")]
pub struct Config {
    /// Reference tree (Newick)
    pub tree: PathBuf,

    /// Reference alignment (FASTA, optionally gzipped)
    pub reference_msa: PathBuf,

    /// Query alignment; defaults to the reference rows that are not tree tips
    #[arg(short, long)]
    pub query: Option<PathBuf>,

    /// Re-optimise the three insertion branch lengths for every placement
    #[arg(short = 'b', long)]
    pub optimize_branches: bool,

    #[arg(short, long, value_enum, ignore_case = true, default_value = "GTR")]
    pub model: ModelKind,

    /// Base frequencies A,C,G,T (default: empirical from the reference)
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub base_freqs: Option<Vec<f64>>,

    /// GTR exchangeabilities AC,AG,AT,CG,CT,GT
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub subst_rates: Option<Vec<f64>>,

    /// Transition/transversion ratio for K80 and HKY
    #[arg(long, default_value_t = 2.0)]
    pub kappa: f64,

    /// Rate multipliers for among-site rate categories
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub rate_cats: Option<Vec<f64>>,

    /// Initial pendant branch length of a placement
    #[arg(long, default_value_t = DEFAULT_PENDANT_LENGTH)]
    pub pendant_length: f64,

    /// Output jplace file
    #[arg(short, long, default_value = "epa_result.jplace")]
    pub out: PathBuf,

    /// Queries per streamed batch
    #[arg(long, default_value_t = 5000)]
    pub chunk_size: usize,

    /// Stop after this many queries
    #[arg(long)]
    pub max_sequences: Option<usize>,

    /// Drop alignment columns that are gaps in every reference row
    #[arg(long)]
    pub premask: bool,

    /// Read query batches on the calling thread
    #[arg(long)]
    pub no_prefetch: bool,

    /// Keep the smallest set of placements whose LWR sum reaches this value
    #[arg(long)]
    pub filter_acc_lwr: Option<f64>,

    /// Drop placements with an LWR below this value
    #[arg(long)]
    pub filter_min_lwr: Option<f64>,

    /// Drop this percentage of each query's lowest-weight placements
    #[arg(long)]
    pub filter_bottom_percent: Option<f64>,

    /// Worker threads (default: all cores)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Cooperating workers; two or more enables the distributed pipeline
    #[arg(long)]
    pub workers: Option<usize>,

    /// Queries timed to estimate per-stage cost in distributed mode
    #[arg(long, default_value_t = 100)]
    pub calibration_size: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Hierarchical timing output via tracing spans
    #[arg(long)]
    pub profile: bool,

    /// Command line that produced this run, recorded in the output
    #[arg(skip)]
    pub invocation: String,
}

impl Config {
    /// Parse the process arguments and validate them
    pub fn parse_and_validate() -> Result<Self> {
        Self::from_args(std::env::args())
    }

    /// Parse an explicit argument list (first item is the program name)
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut config = match Self::try_parse_from(&args) {
            Ok(config) => config,
            Err(e) if is_display_request(&e) => e.exit(),
            Err(e) => return Err(EpaError::config(e.to_string())),
        };
        config.invocation = args.join(" ");
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        require_file(&self.tree)?;
        require_file(&self.reference_msa)?;
        if let Some(query) = &self.query {
            require_file(query)?;
        }

        if self.chunk_size == 0 {
            return Err(EpaError::config("--chunk-size must be positive"));
        }
        if !(self.pendant_length > 0.0) || !self.pendant_length.is_finite() {
            return Err(EpaError::config("--pendant-length must be positive"));
        }
        if !(self.kappa > 0.0) || !self.kappa.is_finite() {
            return Err(EpaError::config("--kappa must be positive"));
        }
        if let Some(x) = self.filter_bottom_percent {
            if !(0.0..100.0).contains(&x) {
                return Err(EpaError::config("--filter-bottom-percent must be in [0, 100)"));
            }
        }
        for (name, value) in [
            ("--filter-acc-lwr", self.filter_acc_lwr),
            ("--filter-min-lwr", self.filter_min_lwr),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(EpaError::config(format!("{} must be in [0, 1]", name)));
                }
            }
        }
        if self.workers == Some(0) {
            return Err(EpaError::config("--workers must be positive"));
        }
        if self.calibration_size == 0 {
            return Err(EpaError::config("--calibration-size must be positive"));
        }
        if let Some(freqs) = &self.base_freqs {
            if freqs.len() != STATES {
                return Err(EpaError::config(format!(
                    "--base-freqs needs {} values, got {}",
                    STATES,
                    freqs.len()
                )));
            }
        }
        if let Some(rates) = &self.subst_rates {
            if rates.len() != N_RATES {
                return Err(EpaError::config(format!(
                    "--subst-rates needs {} values, got {}",
                    N_RATES,
                    rates.len()
                )));
            }
        }
        Ok(())
    }

    /// Distributed pipeline requested
    pub fn is_distributed(&self) -> bool {
        self.workers.map_or(false, |w| w > 1)
    }

    pub fn streaming_config(&self) -> StreamingConfig {
        StreamingConfig {
            chunk_size: self.chunk_size,
            premask: self.premask,
            prefetch: !self.no_prefetch,
            max_read: self.max_sequences,
        }
    }

    /// Substitution model; missing base frequencies are estimated from `reference`
    pub fn model(&self, reference: &Msa) -> Result<SubstitutionModel> {
        let freqs = || -> Result<[f64; STATES]> {
            match &self.base_freqs {
                Some(f) => f.as_slice().try_into().map_err(|_| {
                    EpaError::config(format!("--base-freqs needs {} values", STATES))
                }),
                None => Ok(empirical_frequencies(reference)),
            }
        };

        let model = match self.model {
            ModelKind::Jc69 => SubstitutionModel::jc69(),
            ModelKind::K80 => SubstitutionModel::k80(self.kappa)?,
            ModelKind::F81 => SubstitutionModel::f81(freqs()?)?,
            ModelKind::Hky => SubstitutionModel::hky(self.kappa, freqs()?)?,
            ModelKind::Gtr => {
                let rates: [f64; N_RATES] = match &self.subst_rates {
                    Some(r) => r.as_slice().try_into().map_err(|_| {
                        EpaError::config(format!("--subst-rates needs {} values", N_RATES))
                    })?,
                    None => [1.0; N_RATES],
                };
                SubstitutionModel::gtr(freqs()?, rates)?
            }
        };

        match &self.rate_cats {
            Some(cats) => model.with_rate_categories(cats.clone()),
            None => Ok(model),
        }
    }
}

fn require_file(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(EpaError::FileNotFound {
            path: path.to_path_buf(),
        })
    }
}

/// `--help` and `--version` surface as parse errors but are successful exits
fn is_display_request(err: &clap::Error) -> bool {
    matches!(
        err.kind(),
        clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
    )
}
