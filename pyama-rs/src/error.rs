//! Error taxonomy for the processing pipeline.
//!
//! Stage functions return [`PipelineError`]; the scheduler attaches
//! `(fov, stage)` context and classifies each failure as run-fatal,
//! batch-fatal, or FOV-fatal.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid channel index, unknown feature, feature/channel-kind mismatch,
    /// or out-of-range parameter. Fatal to the run, raised before any stage.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// File open/read/write/rename failure. Fatal for the affected FOV.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Source file cannot be decoded or returned an unexpected shape.
    /// Fatal for the whole batch being copied.
    #[error("source format error: {0}")]
    Format(String),

    /// Internal stacks disagree on shape or dtype, usually a corrupted
    /// partial output from an earlier run. Fatal for the affected FOV.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Non-finite or unrepresentable values. Downgraded to a per-frame
    /// warning where a safe default exists.
    #[error("numeric error: {0}")]
    Numeric(String),

    /// Cooperative cancellation; turns the rest of the run into a clean stop.
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable kind tag recorded in the manifest and observer events.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Io { .. } => "io",
            PipelineError::Format(_) => "format",
            PipelineError::DimensionMismatch(_) => "dimension_mismatch",
            PipelineError::Numeric(_) => "numeric",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
