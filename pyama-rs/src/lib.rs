//! pyama-rs - batch single-cell trace extraction from time-lapse microscopy.
//!
//! Converts multi-FOV, multi-channel acquisitions into per-cell quantitative
//! traces through a five-stage per-FOV pipeline:
//!
//! Copy -> Segment -> BackgroundEstimate -> Track -> Extract
//!
//! driven by a batched two-tier scheduler: source reads are serialized per
//! batch, stages 2-5 run in parallel across the batch's FOVs, and batches
//! stream until the selected FOV range is exhausted. Outputs are
//! memory-mapped `.stack` arrays, one traces CSV per FOV, and a YAML
//! manifest of everything produced.
//!
//! # Example
//!
//! ```ignore
//! use pyama_rs::config::{ChannelConfig, Channels, Params, ProcessingContext};
//! use pyama_rs::observer::{CancelToken, NullObserver};
//! use pyama_rs::reader::open_source;
//! use pyama_rs::scheduler::run_pipeline;
//! use std::path::Path;
//!
//! let input = Path::new("experiment.nd2");
//! let mut reader = open_source(input)?;
//! let ctx = ProcessingContext {
//!     output_dir: "out".into(),
//!     channels: Channels {
//!         pc: ChannelConfig { channel: 0, features: vec!["area".into()] },
//!         fl: vec![ChannelConfig { channel: 1, features: vec!["intensity_total".into()] }],
//!     },
//!     params: Params::default(),
//!     time_units: "min".into(),
//! };
//! let fovs: Vec<usize> = (0..reader.metadata().n_fovs).collect();
//! let summary = run_pipeline(&mut *reader, input, &ctx, &fovs, &NullObserver, &CancelToken::new())?;
//! ```

pub mod background;
pub mod config;
pub mod error;
pub mod features;
pub mod observer;
pub mod ranges;
pub mod reader;
pub mod results;
pub mod scheduler;
pub mod segment;
pub mod stack;
pub mod track;

pub use config::{ChannelConfig, Channels, Params, ProcessingContext};
pub use error::PipelineError;
pub use observer::{CancelToken, Event, Observer, Stage};
pub use scheduler::{run_pipeline, RunSummary};
