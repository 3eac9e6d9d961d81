//! # Placement File Output
//!
//! Conversion of a `Sample` into a version 3 jplace document.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::{Placement, Sample};
use crate::error::{EpaError, Result};

pub const JPLACE_VERSION: u32 = 3;

pub const FIELDS: [&str; 5] = [
    "edge_num",
    "likelihood",
    "like_weight_ratio",
    "distal_length",
    "pendant_length",
];

/// `[edge_num, likelihood, like_weight_ratio, distal_length, pendant_length]`
pub type JplaceRow = (u32, f64, f64, f64, f64);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JplacePlacement {
    pub p: Vec<JplaceRow>,
    pub n: Vec<String>,
}

impl From<&Placement> for JplacePlacement {
    fn from(placement: &Placement) -> Self {
        Self {
            p: placement
                .records()
                .iter()
                .map(|r| {
                    (
                        r.branch().0,
                        r.likelihood(),
                        r.lwr(),
                        r.distal_length(),
                        r.pendant_length(),
                    )
                })
                .collect(),
            n: placement.labels().to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub invocation: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Jplace {
    pub tree: String,
    pub placements: Vec<JplacePlacement>,
    pub metadata: Metadata,
    pub version: u32,
    pub fields: Vec<String>,
}

impl Jplace {
    pub fn from_sample(sample: &Sample, invocation: &str) -> Self {
        Self {
            tree: sample.newick().to_string(),
            placements: sample.iter().map(JplacePlacement::from).collect(),
            metadata: Metadata {
                invocation: invocation.to_string(),
            },
            version: JPLACE_VERSION,
            fields: FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EpaError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let reader = std::io::BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Single placement as a jplace `{"p": ..., "n": ...}` object
pub fn placement_to_jplace_string(placement: &Placement) -> Result<String> {
    Ok(serde_json::to_string(&JplacePlacement::from(placement))?)
}

pub fn sample_to_jplace_string(sample: &Sample, invocation: &str) -> Result<String> {
    Ok(serde_json::to_string_pretty(&Jplace::from_sample(sample, invocation))?)
}

pub fn write_jplace(path: &Path, sample: &Sample, invocation: &str) -> Result<()> {
    Jplace::from_sample(sample, invocation).write(path)
}
