//! Run configuration: channel assignments, processing parameters, output
//! location. Built once before a run, validated against the source metadata
//! and the feature registry, then shared read-only.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::features::{FeatureKind, FeatureRegistry};
use crate::reader::SourceMetadata;

/// One source channel with the features to compute on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel: usize,
    pub features: Vec<String>,
}

/// Channel assignment: exactly one phase-contrast channel (segmentation and
/// tracking input), zero or more fluorescence channels (quantitation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channels {
    pub pc: ChannelConfig,
    pub fl: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Weight applied to the estimated background in `intensity_total`,
    /// clamped to [0, 1] at extraction time.
    pub background_weight: f64,
    /// Cells with fewer rows than this are dropped from the traces.
    pub min_trace_length: usize,
    /// Cells whose centroid ever comes closer than this to a frame edge are
    /// dropped from the traces.
    pub border_width_px: usize,
    /// Minimum pixel IoU for a frame-to-frame match.
    pub iou_min: f64,
    /// Disk radius of the morphological structuring element.
    pub seg_struct_size: usize,
    /// Opening/closing iteration count.
    pub seg_struct_iter: usize,
    /// Side of the local-statistics box filter (odd).
    pub seg_window: usize,
    /// Background tile side in pixels.
    pub bg_tile: usize,
    /// Fractional tile overlap in [0, 1).
    pub bg_overlap: f64,
    /// FOVs per batch.
    pub batch_size: usize,
    /// Worker threads for the processing phase; 0 means one per CPU.
    pub n_workers: usize,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            background_weight: 1.0,
            min_trace_length: 30,
            border_width_px: 10,
            iou_min: 0.1,
            seg_struct_size: 7,
            seg_struct_iter: 3,
            seg_window: 3,
            bg_tile: 64,
            bg_overlap: 0.5,
            batch_size: 4,
            n_workers: 0,
        }
    }
}

impl Params {
    pub fn effective_workers(&self) -> usize {
        if self.n_workers == 0 {
            num_cpus::get()
        } else {
            self.n_workers
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub output_dir: PathBuf,
    pub channels: Channels,
    pub params: Params,
    /// Unit label for the `time` column, e.g. "min".
    pub time_units: String,
}

impl ProcessingContext {
    /// Fail-closed validation run before any stage. Checks channel indices
    /// against the source, feature names against the registry, feature kind
    /// against channel kind, and parameter ranges.
    pub fn validate(&self, registry: &FeatureRegistry, meta: &SourceMetadata) -> Result<()> {
        let nc = meta.n_channels;
        let pc = &self.channels.pc;
        if pc.channel >= nc {
            return Err(PipelineError::Config(format!(
                "pc channel {} out of range (source has {} channels)",
                pc.channel, nc
            )));
        }
        check_features(registry, pc, FeatureKind::Phase)?;

        let mut seen = vec![pc.channel];
        for fl in &self.channels.fl {
            if fl.channel >= nc {
                return Err(PipelineError::Config(format!(
                    "fl channel {} out of range (source has {} channels)",
                    fl.channel, nc
                )));
            }
            if seen.contains(&fl.channel) {
                return Err(PipelineError::Config(format!(
                    "channel {} configured more than once",
                    fl.channel
                )));
            }
            seen.push(fl.channel);
            check_features(registry, fl, FeatureKind::Fluorescence)?;
        }

        let p = &self.params;
        if !(0.0..=1.0).contains(&p.background_weight) {
            return Err(PipelineError::Config(format!(
                "background_weight {} outside [0, 1]",
                p.background_weight
            )));
        }
        if p.iou_min <= 0.0 || p.iou_min > 1.0 {
            return Err(PipelineError::Config(format!(
                "iou_min {} outside (0, 1]",
                p.iou_min
            )));
        }
        if p.seg_window == 0 || p.seg_window % 2 == 0 {
            return Err(PipelineError::Config(format!(
                "seg_window {} must be odd and positive",
                p.seg_window
            )));
        }
        if p.bg_tile < 8 {
            return Err(PipelineError::Config(format!(
                "bg_tile {} too small (minimum 8)",
                p.bg_tile
            )));
        }
        if !(0.0..1.0).contains(&p.bg_overlap) {
            return Err(PipelineError::Config(format!(
                "bg_overlap {} outside [0, 1)",
                p.bg_overlap
            )));
        }
        if p.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be positive".into()));
        }
        Ok(())
    }
}

fn check_features(
    registry: &FeatureRegistry,
    cfg: &ChannelConfig,
    expected: FeatureKind,
) -> Result<()> {
    for name in &cfg.features {
        match registry.get(name) {
            None => {
                return Err(PipelineError::Config(format!(
                    "unknown feature {:?} on channel {}",
                    name, cfg.channel
                )))
            }
            Some((kind, _)) if kind != expected => {
                return Err(PipelineError::Config(format!(
                    "feature {:?} is a {} feature but channel {} is configured as {}",
                    name,
                    kind.name(),
                    cfg.channel,
                    expected.name()
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureRegistry;
    use crate::reader::SourceMetadata;

    fn meta(n_channels: usize) -> SourceMetadata {
        SourceMetadata {
            n_fovs: 1,
            n_frames: 4,
            n_channels,
            height: 32,
            width: 32,
            channel_names: (0..n_channels).map(|c| format!("ch{}", c)).collect(),
            time_units: "min".into(),
            time_points: None,
        }
    }

    fn ctx() -> ProcessingContext {
        ProcessingContext {
            output_dir: PathBuf::from("out"),
            channels: Channels {
                pc: ChannelConfig {
                    channel: 0,
                    features: vec!["area".into()],
                },
                fl: vec![ChannelConfig {
                    channel: 1,
                    features: vec!["intensity_total".into()],
                }],
            },
            params: Params::default(),
            time_units: "min".into(),
        }
    }

    #[test]
    fn accepts_default_configuration() {
        let registry = FeatureRegistry::builtin();
        assert!(ctx().validate(&registry, &meta(2)).is_ok());
    }

    #[test]
    fn rejects_out_of_range_channel() {
        let registry = FeatureRegistry::builtin();
        let err = ctx().validate(&registry, &meta(1)).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn rejects_unknown_feature() {
        let registry = FeatureRegistry::builtin();
        let mut c = ctx();
        c.channels.pc.features.push("perimeter".into());
        assert!(c.validate(&registry, &meta(2)).is_err());
    }

    #[test]
    fn rejects_feature_kind_mismatch() {
        let registry = FeatureRegistry::builtin();
        let mut c = ctx();
        // intensity_total is a fluorescence feature.
        c.channels.pc.features = vec!["intensity_total".into()];
        assert!(c.validate(&registry, &meta(2)).is_err());
    }

    #[test]
    fn rejects_bad_parameters() {
        let registry = FeatureRegistry::builtin();
        let mut c = ctx();
        c.params.background_weight = 1.5;
        assert!(c.validate(&registry, &meta(2)).is_err());
        let mut c = ctx();
        c.params.seg_window = 4;
        assert!(c.validate(&registry, &meta(2)).is_err());
        let mut c = ctx();
        c.params.iou_min = 0.0;
        assert!(c.validate(&registry, &meta(2)).is_err());
    }
}
