//! Two-tier batch scheduler.
//!
//! FOVs are processed in contiguous batches: source reading is serialized
//! across the batch (the reader is not thread-safe), then stages 2-5 fan out
//! across the batch's FOVs on a bounded worker pool. Workers return
//! value-typed deltas; only the scheduler touches the results index, and the
//! manifest is persisted at every batch boundary.
//!
//! Resume is existence-based: a committed stack is reused when its dtype and
//! shape match, and an existing traces CSV makes the whole FOV a no-op.

use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;

use crate::background::{estimate_background_stack, BackgroundParams};
use crate::config::ProcessingContext;
use crate::error::{PipelineError, Result};
use crate::features::{extract_traces, ExtractParams, FeatureRegistry, FlChannelInputs};
use crate::observer::{CancelToken, Event, Observer, Stage};
use crate::reader::{source_basename, MicroscopyReader, SourceMetadata};
use crate::results::{ChannelArtifact, FovData, FovStatus, ResultsIndex, MANIFEST_NAME};
use crate::segment::{segment_stack, SegmentParams};
use crate::stack::{stack_path, traces_csv_path, Dtype, StackKind, StackRef, StackWriter};
use crate::track::{track_stack, TrackParams};

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub cancelled: bool,
}

impl RunSummary {
    /// CLI-equivalent exit code: 0 success, 4 cancelled, 5 partial.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            4
        } else if self.failed > 0 {
            5
        } else {
            0
        }
    }
}

enum CopyOutcome {
    Ready,
    Failed(PipelineError),
}

/// Run the pipeline over the selected FOVs. Returns `Err` only for run-level
/// failures (invalid configuration, manifest persistence); per-FOV and
/// per-batch failures are recorded in the manifest and the summary.
pub fn run_pipeline(
    reader: &mut dyn MicroscopyReader,
    input_path: &Path,
    ctx: &ProcessingContext,
    fovs: &[usize],
    observer: &dyn Observer,
    cancel: &CancelToken,
) -> Result<RunSummary> {
    let registry = FeatureRegistry::builtin();
    let meta = reader.metadata().clone();
    ctx.validate(&registry, &meta)?;
    for &fov in fovs {
        if fov >= meta.n_fovs {
            return Err(PipelineError::Config(format!(
                "fov {} out of range (source has {} fovs)",
                fov, meta.n_fovs
            )));
        }
    }

    let basename = source_basename(input_path);
    std::fs::create_dir_all(&ctx.output_dir)
        .map_err(|e| PipelineError::io(&ctx.output_dir, e))?;
    let manifest_path = ctx.output_dir.join(MANIFEST_NAME);

    let mut index = ResultsIndex::new(
        input_path.display().to_string(),
        basename.clone(),
        ctx.time_units.clone(),
        ctx.channels.clone(),
        ctx.params.clone(),
        meta.n_fovs,
    );
    if let Ok(Some(previous)) = ResultsIndex::load(&manifest_path) {
        index.fov_data = previous.fov_data;
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.params.effective_workers())
        .build()
        .map_err(|e| PipelineError::Config(format!("worker pool: {}", e)))?;

    let mut summary = RunSummary::default();
    let mut cancelled = false;

    for (batch_index, batch) in fovs.chunks(ctx.params.batch_size).enumerate() {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        observer.event(&Event::BatchStarted {
            index: batch_index,
            fovs: batch,
        });

        // Copy phase, serial over the batch.
        let mut outcomes: Vec<(usize, CopyOutcome)> = Vec::with_capacity(batch.len());
        let mut batch_format_error: Option<String> = None;
        for &fov in batch {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match copy_fov(reader, &meta, ctx, &basename, fov, observer, cancel) {
                Ok(()) => outcomes.push((fov, CopyOutcome::Ready)),
                Err(PipelineError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e @ PipelineError::Format(_)) => {
                    batch_format_error = Some(e.to_string());
                    break;
                }
                Err(e) => outcomes.push((fov, CopyOutcome::Failed(e))),
            }
        }

        if let Some(message) = batch_format_error {
            // A source decode failure poisons every FOV of the batch; later
            // batches still get their chance.
            observer.event(&Event::Warning {
                kind: "format",
                message: &message,
            });
            for &fov in batch {
                let mut data = FovData::default();
                data.warnings.push(format!("format: {}", message));
                index.merge(fov, data);
                summary.failed += 1;
                summary.warnings += 1;
            }
            index.save(&manifest_path)?;
            observer.event(&Event::BatchFinished { index: batch_index });
            continue;
        }

        if cancelled {
            for &fov in batch {
                let complete = index
                    .fov_data
                    .get(&fov)
                    .is_some_and(|d| d.status == FovStatus::Complete);
                if !complete {
                    let mut data = FovData::default();
                    data.status = FovStatus::Cancelled;
                    index.merge(fov, data);
                }
            }
            index.save(&manifest_path)?;
            break;
        }

        // Processing phase, parallel across the batch's FOVs.
        let deltas: Vec<(usize, FovData)> = pool.install(|| {
            outcomes
                .par_iter()
                .map(|(fov, outcome)| match outcome {
                    CopyOutcome::Ready => (
                        *fov,
                        process_fov(ctx, &registry, &meta, &basename, *fov, observer, cancel),
                    ),
                    CopyOutcome::Failed(e) => {
                        let mut data = FovData::default();
                        let message = format!("{}: {}", e.kind(), e);
                        observer.event(&Event::Warning {
                            kind: e.kind(),
                            message: &message,
                        });
                        data.warnings.push(message);
                        (*fov, data)
                    }
                })
                .collect()
        });

        for (fov, data) in deltas {
            match data.status {
                FovStatus::Complete => summary.completed += 1,
                FovStatus::Partial => summary.failed += 1,
                FovStatus::Cancelled => cancelled = true,
            }
            summary.warnings += data.warnings.len();
            index.merge(fov, data);
        }
        index.save(&manifest_path)?;
        observer.event(&Event::BatchFinished { index: batch_index });

        if cancelled {
            break;
        }
    }

    if index.fov_data.is_empty() || cancelled {
        index.save(&manifest_path)?;
    }
    summary.cancelled = cancelled || cancel.is_cancelled();
    Ok(summary)
}

/// Stream every configured channel of one FOV into committed raw stacks,
/// skipping channels whose stack already exists with the expected shape.
fn copy_fov(
    reader: &mut dyn MicroscopyReader,
    meta: &SourceMetadata,
    ctx: &ProcessingContext,
    basename: &str,
    fov: usize,
    observer: &dyn Observer,
    cancel: &CancelToken,
) -> Result<()> {
    if traces_csv_path(&ctx.output_dir, basename, fov).exists() {
        return Ok(());
    }
    let (t, h, w) = (meta.n_frames, meta.height, meta.width);
    let mut specs = vec![(StackKind::Pc, ctx.channels.pc.channel)];
    for fl in &ctx.channels.fl {
        specs.push((StackKind::Fl, fl.channel));
    }

    with_stage(observer, fov, Stage::Copy, || {
        let started = Instant::now();
        let mut copied = 0usize;
        for (kind, channel) in specs {
            let path = stack_path(&ctx.output_dir, basename, fov, kind, channel);
            if path.exists() {
                StackRef::open_expected(&path, kind.dtype(), t, h, w)?;
                continue;
            }
            let mut writer = StackWriter::create(&path, kind.dtype(), t, h, w)?;
            for frame in 0..t {
                cancel.checkpoint()?;
                let plane = reader.read_frame(fov, frame, channel)?;
                writer.put_frame_u16(frame, &plane)?;
            }
            writer.commit()?;
            copied += 1;
        }
        Ok(((), format!("{} stacks in {} ms", copied, started.elapsed().as_millis())))
    })
}

/// Run stages 2-5 for one FOV on a worker thread, returning the delta the
/// scheduler merges.
fn process_fov(
    ctx: &ProcessingContext,
    registry: &FeatureRegistry,
    meta: &SourceMetadata,
    basename: &str,
    fov: usize,
    observer: &dyn Observer,
    cancel: &CancelToken,
) -> FovData {
    let mut data = FovData::default();
    match run_stages(ctx, registry, meta, basename, fov, observer, cancel, &mut data) {
        Ok(()) => data.status = FovStatus::Complete,
        Err(PipelineError::Cancelled) => data.status = FovStatus::Cancelled,
        Err(e) => {
            data.status = FovStatus::Partial;
            let message = format!("{}: {}", e.kind(), e);
            observer.event(&Event::Warning {
                kind: e.kind(),
                message: &message,
            });
            data.warnings.push(message);
        }
    }
    data
}

#[allow(clippy::too_many_arguments)]
fn run_stages(
    ctx: &ProcessingContext,
    registry: &FeatureRegistry,
    meta: &SourceMetadata,
    basename: &str,
    fov: usize,
    observer: &dyn Observer,
    cancel: &CancelToken,
    data: &mut FovData,
) -> Result<()> {
    let (t, h, w) = (meta.n_frames, meta.height, meta.width);
    let out = ctx.output_dir.as_path();
    let pc_channel = ctx.channels.pc.channel;
    let rel = |p: &Path| -> String { p.strip_prefix(out).unwrap_or(p).display().to_string() };

    let pc_path = stack_path(out, basename, fov, StackKind::Pc, pc_channel);
    let seg_path = stack_path(out, basename, fov, StackKind::Seg, pc_channel);
    let labeled_path = stack_path(out, basename, fov, StackKind::SegLabeled, pc_channel);
    let csv_path = traces_csv_path(out, basename, fov);

    data.pc = Some(rel(&pc_path));
    for fl in &ctx.channels.fl {
        data.fl.push(ChannelArtifact {
            channel: fl.channel,
            path: rel(&stack_path(out, basename, fov, StackKind::Fl, fl.channel)),
        });
    }

    if csv_path.exists() {
        // Finished in a previous run: record whatever artifacts are present.
        if seg_path.exists() {
            data.seg = Some(rel(&seg_path));
        }
        if labeled_path.exists() {
            data.seg_labeled = Some(rel(&labeled_path));
        }
        for fl in &ctx.channels.fl {
            let bg_path = stack_path(out, basename, fov, StackKind::FlBackground, fl.channel);
            if bg_path.exists() {
                data.fl_background.push(ChannelArtifact {
                    channel: fl.channel,
                    path: rel(&bg_path),
                });
            }
        }
        data.traces_csv = Some(rel(&csv_path));
        return Ok(());
    }

    let pc_stack = StackRef::open_expected(&pc_path, Dtype::U16, t, h, w)?;

    let (seg_stack, seg_warnings) = with_stage(observer, fov, Stage::Segment, || {
        if seg_path.exists() {
            let s = StackRef::open_expected(&seg_path, Dtype::Bool, t, h, w)?;
            Ok(((s, Vec::new()), "cached".to_string()))
        } else {
            let started = Instant::now();
            let params = SegmentParams {
                window: ctx.params.seg_window,
                struct_size: ctx.params.seg_struct_size,
                iterations: ctx.params.seg_struct_iter,
            };
            let (s, warnings) = segment_stack(&pc_stack, &seg_path, &params, cancel)?;
            Ok(((s, warnings), format!("{} ms", started.elapsed().as_millis())))
        }
    })?;
    for msg in seg_warnings {
        data.warnings.push(format!("segment: {}", msg));
    }
    data.seg = Some(rel(&seg_path));

    let mut fl_stacks: Vec<(usize, StackRef, StackRef)> = Vec::new();
    for fl in &ctx.channels.fl {
        let fl_path = stack_path(out, basename, fov, StackKind::Fl, fl.channel);
        let fl_stack = StackRef::open_expected(&fl_path, Dtype::U16, t, h, w)?;
        let bg_path = stack_path(out, basename, fov, StackKind::FlBackground, fl.channel);
        let (bg_stack, bg_warnings) = with_stage(observer, fov, Stage::Background, || {
            if bg_path.exists() {
                let s = StackRef::open_expected(&bg_path, Dtype::F32, t, h, w)?;
                Ok(((s, Vec::new()), format!("ch {} cached", fl.channel)))
            } else {
                let started = Instant::now();
                let params = BackgroundParams {
                    tile: ctx.params.bg_tile,
                    overlap: ctx.params.bg_overlap,
                    ..BackgroundParams::default()
                };
                let (s, warnings) =
                    estimate_background_stack(&seg_stack, &fl_stack, &bg_path, &params, cancel)?;
                Ok((
                    (s, warnings),
                    format!("ch {} in {} ms", fl.channel, started.elapsed().as_millis()),
                ))
            }
        })?;
        for msg in bg_warnings {
            data.warnings.push(format!("background ch {}: {}", fl.channel, msg));
        }
        data.fl_background.push(ChannelArtifact {
            channel: fl.channel,
            path: rel(&bg_path),
        });
        fl_stacks.push((fl.channel, fl_stack, bg_stack));
    }

    let labeled_stack = with_stage(observer, fov, Stage::Track, || {
        if labeled_path.exists() {
            let s = StackRef::open_expected(&labeled_path, Dtype::U16Label, t, h, w)?;
            Ok((s, "cached".to_string()))
        } else {
            let started = Instant::now();
            let params = TrackParams {
                iou_min: ctx.params.iou_min,
                min_size: None,
                max_size: None,
            };
            let s = track_stack(&seg_stack, &labeled_path, &params, cancel)?;
            Ok((s, format!("{} ms", started.elapsed().as_millis())))
        }
    })?;
    data.seg_labeled = Some(rel(&labeled_path));

    let extract_summary = with_stage(observer, fov, Stage::Extract, || {
        let started = Instant::now();
        let fl_inputs: Vec<FlChannelInputs> = ctx
            .channels
            .fl
            .iter()
            .zip(&fl_stacks)
            .map(|(cfg, (channel, stack, background))| FlChannelInputs {
                channel: *channel,
                features: &cfg.features,
                stack,
                background: Some(background),
            })
            .collect();
        let params = ExtractParams {
            background_weight: ctx.params.background_weight,
            min_trace_length: ctx.params.min_trace_length,
            border_width_px: ctx.params.border_width_px,
        };
        let summary = extract_traces(
            fov,
            &labeled_stack,
            &pc_stack,
            pc_channel,
            &ctx.channels.pc.features,
            &fl_inputs,
            registry,
            &params,
            meta.time_points.as_deref(),
            &csv_path,
            cancel,
        )?;
        let message = format!(
            "{} cells, {} rows in {} ms",
            summary.cells,
            summary.rows,
            started.elapsed().as_millis()
        );
        Ok((summary, message))
    })?;
    for msg in extract_summary.warnings {
        data.warnings.push(format!("extract: {}", msg));
    }
    data.traces_csv = Some(rel(&csv_path));

    Ok(())
}

/// Bracket a stage with observer events; failures are reported with
/// `ok = false` before the error propagates.
fn with_stage<T>(
    observer: &dyn Observer,
    fov: usize,
    stage: Stage,
    f: impl FnOnce() -> Result<(T, String)>,
) -> Result<T> {
    observer.event(&Event::StageStarted { fov, stage });
    match f() {
        Ok((value, message)) => {
            observer.event(&Event::StageFinished {
                fov,
                stage,
                ok: true,
                message: &message,
            });
            Ok(value)
        }
        Err(e) => {
            let message = e.to_string();
            observer.event(&Event::StageFinished {
                fov,
                stage,
                ok: false,
                message: &message,
            });
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        let mut s = RunSummary::default();
        assert_eq!(s.exit_code(), 0);
        s.failed = 1;
        assert_eq!(s.exit_code(), 5);
        s.cancelled = true;
        assert_eq!(s.exit_code(), 4);
    }
}
