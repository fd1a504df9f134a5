//! Per-FOV result bookkeeping and the persistent YAML manifest.
//!
//! Workers never touch the index; they return value-typed [`FovData`] deltas
//! that the scheduler merges and persists (temp + rename) at batch
//! boundaries.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{Channels, Params};
use crate::error::{PipelineError, Result};
use crate::stack::write_atomic;

pub const MANIFEST_NAME: &str = "processing_results.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelArtifact {
    pub channel: usize,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FovStatus {
    Complete,
    Partial,
    Cancelled,
}

/// Artifacts produced for one FOV. Paths are relative to the output
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FovData {
    pub pc: Option<String>,
    pub fl: Vec<ChannelArtifact>,
    pub seg: Option<String>,
    pub seg_labeled: Option<String>,
    pub fl_background: Vec<ChannelArtifact>,
    pub traces_csv: Option<String>,
    pub status: FovStatus,
    pub warnings: Vec<String>,
}

impl Default for FovData {
    fn default() -> Self {
        FovData {
            pc: None,
            fl: Vec::new(),
            seg: None,
            seg_labeled: None,
            fl_background: Vec::new(),
            traces_csv: None,
            status: FovStatus::Partial,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultsIndex {
    pub project_path: String,
    pub basename: String,
    pub time_units: String,
    pub channels: Channels,
    pub params: Params,
    pub n_fov: usize,
    pub fov_data: BTreeMap<usize, FovData>,
}

impl ResultsIndex {
    pub fn new(
        project_path: String,
        basename: String,
        time_units: String,
        channels: Channels,
        params: Params,
        n_fov: usize,
    ) -> Self {
        ResultsIndex {
            project_path,
            basename,
            time_units,
            channels,
            params,
            n_fov,
            fov_data: BTreeMap::new(),
        }
    }

    /// Merge one worker delta; later deltas for the same FOV replace earlier
    /// ones.
    pub fn merge(&mut self, fov: usize, data: FovData) {
        self.fov_data.insert(fov, data);
    }

    /// Persist atomically; a reader never observes a torn manifest.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| PipelineError::Format(format!("manifest encode: {}", e)))?;
        write_atomic(path, text.as_bytes())
    }

    /// Load a previous manifest if one exists.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let index = serde_yaml::from_str(&text)
            .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
        Ok(Some(index))
    }
}
