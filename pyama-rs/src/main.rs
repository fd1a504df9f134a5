use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use pyama_rs::config::{ChannelConfig, Channels, Params, ProcessingContext};
use pyama_rs::error::PipelineError;
use pyama_rs::observer::{CancelToken, Event, Observer};
use pyama_rs::ranges::parse_selection;
use pyama_rs::reader::open_source;
use pyama_rs::scheduler::run_pipeline;

#[derive(Parser)]
#[command(
    name = "pyama",
    about = "pyama CLI: batch single-cell trace extraction from time-lapse microscopy"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print source metadata (FOVs, frames, channels, dimensions)
    Info(InfoArgs),
    /// Run the processing pipeline over a FOV selection
    Process(ProcessArgs),
}

#[derive(Args, Clone)]
struct InfoArgs {
    /// Path to an .nd2 file or a TIFF folder tree
    #[arg(long)]
    input: String,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProgressMode {
    Json,
    Bar,
}

#[derive(Args, Clone)]
struct ProcessArgs {
    /// Path to an .nd2 file or a TIFF folder tree
    #[arg(long)]
    input: String,
    /// Output directory (stacks, traces CSVs, manifest)
    #[arg(long)]
    output: String,
    /// Phase-contrast channel index
    #[arg(long)]
    pc: usize,
    /// Fluorescence channel indices, comma-separated, e.g. "1,2"
    #[arg(long, default_value = "")]
    fl: String,
    /// FOVs to process: "all" or comma-separated indices/slices, e.g. "0:5, 10"
    #[arg(long, default_value = "all")]
    fov: String,
    /// Features computed on the phase channel
    #[arg(long, default_value = "area,aspect_ratio")]
    pc_features: String,
    /// Features computed on every fluorescence channel
    #[arg(long, default_value = "intensity_total")]
    fl_features: String,
    /// Background weight for intensity_total, in [0, 1]
    #[arg(long, default_value_t = 1.0)]
    background_weight: f64,
    /// Drop cells traced for fewer frames than this
    #[arg(long, default_value_t = 30)]
    min_trace_length: usize,
    /// Drop cells whose centroid comes this close to a frame edge
    #[arg(long, default_value_t = 10)]
    border_width: usize,
    /// Minimum pixel IoU for frame-to-frame matching
    #[arg(long, default_value_t = 0.1)]
    iou_min: f64,
    /// Disk radius of the morphological structuring element
    #[arg(long, default_value_t = 7)]
    seg_struct_size: usize,
    /// Morphological opening/closing iterations
    #[arg(long, default_value_t = 3)]
    seg_struct_iter: usize,
    /// Side of the local-statistics window (odd)
    #[arg(long, default_value_t = 3)]
    seg_window: usize,
    /// Background tile side in pixels
    #[arg(long, default_value_t = 64)]
    bg_tile: usize,
    /// Fractional background tile overlap, in [0, 1)
    #[arg(long, default_value_t = 0.5)]
    bg_overlap: f64,
    /// FOVs per batch
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
    /// Worker threads (0 = one per CPU)
    #[arg(long, default_value_t = 0)]
    workers: usize,
    /// Unit label for the time column
    #[arg(long, default_value = "min")]
    time_units: String,
    /// Progress reporting style
    #[arg(long, value_enum, default_value = "json")]
    progress: ProgressMode,
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Info(args) => run_info(args),
        Commands::Process(args) => run_process(args),
    };
    std::process::exit(code);
}

/// Map run-level errors onto the documented exit codes: 2 invalid config,
/// 3 I/O or source format failure.
fn exit_code_for(err: &PipelineError) -> i32 {
    match err {
        PipelineError::Config(_) => 2,
        PipelineError::Cancelled => 4,
        _ => 3,
    }
}

fn run_info(args: InfoArgs) -> i32 {
    let path = PathBuf::from(&args.input);
    let reader = match open_source(&path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {}", e);
            return exit_code_for(&e);
        }
    };
    let meta = reader.metadata();
    eprintln!("Source: {}", path.display());
    eprintln!(
        "  P={} T={} C={} ({}x{})",
        meta.n_fovs, meta.n_frames, meta.n_channels, meta.height, meta.width
    );
    eprintln!("  channels: {}", meta.channel_names.join(", "));
    eprintln!(
        "  time: {} ({})",
        match &meta.time_points {
            Some(tp) => format!("{} points", tp.len()),
            None => "frame index".to_string(),
        },
        meta.time_units
    );
    0
}

fn run_process(args: ProcessArgs) -> i32 {
    match process(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            match e.downcast_ref::<PipelineError>() {
                Some(pe) => exit_code_for(pe),
                None => 2,
            }
        }
    }
}

fn parse_channel_list(s: &str) -> anyhow::Result<Vec<usize>> {
    let mut out = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        out.push(part.parse().with_context(|| format!("bad channel {:?}", part))?);
    }
    Ok(out)
}

fn parse_feature_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

fn process(args: ProcessArgs) -> anyhow::Result<i32> {
    let input = PathBuf::from(&args.input);
    let mut reader = open_source(&input)?;
    let meta = reader.metadata().clone();

    let fovs = parse_selection(&args.fov, meta.n_fovs)
        .map_err(PipelineError::Config)
        .context("invalid --fov selection")?;

    let fl_features = parse_feature_list(&args.fl_features);
    let ctx = ProcessingContext {
        output_dir: PathBuf::from(&args.output),
        channels: Channels {
            pc: ChannelConfig {
                channel: args.pc,
                features: parse_feature_list(&args.pc_features),
            },
            fl: parse_channel_list(&args.fl)?
                .into_iter()
                .map(|channel| ChannelConfig {
                    channel,
                    features: fl_features.clone(),
                })
                .collect(),
        },
        params: Params {
            background_weight: args.background_weight,
            min_trace_length: args.min_trace_length,
            border_width_px: args.border_width,
            iou_min: args.iou_min,
            seg_struct_size: args.seg_struct_size,
            seg_struct_iter: args.seg_struct_iter,
            seg_window: args.seg_window,
            bg_tile: args.bg_tile,
            bg_overlap: args.bg_overlap,
            batch_size: args.batch_size,
            n_workers: args.workers,
        },
        time_units: args.time_units.clone(),
    };

    let stages_per_fov = 4 + ctx.channels.fl.len();
    let total = fovs.len() * stages_per_fov;
    let observer: Box<dyn Observer> = match args.progress {
        ProgressMode::Json => Box::new(JsonProgress::new(total)),
        ProgressMode::Bar => Box::new(BarProgress::new(total)),
    };

    let cancel = CancelToken::new();
    let summary = run_pipeline(&mut *reader, &input, &ctx, &fovs, observer.as_ref(), &cancel)?;

    eprintln!(
        "{} fovs complete, {} failed, {} warnings",
        summary.completed, summary.failed, summary.warnings
    );
    Ok(summary.exit_code())
}

/// JSON progress lines on stderr, the protocol desktop front-ends consume.
struct JsonProgress {
    total: usize,
    done: AtomicUsize,
}

impl JsonProgress {
    fn new(total: usize) -> Self {
        JsonProgress {
            total: total.max(1),
            done: AtomicUsize::new(0),
        }
    }

    fn emit(&self, prog: f64, msg: &str) {
        let _ = writeln!(
            io::stderr(),
            "{}",
            serde_json::json!({"progress": prog, "message": msg})
        );
        let _ = io::stderr().flush();
    }

    fn fraction(&self) -> f64 {
        self.done.load(Ordering::SeqCst) as f64 / self.total as f64
    }
}

impl Observer for JsonProgress {
    fn event(&self, event: &Event) {
        match event {
            Event::BatchStarted { index, fovs } => {
                self.emit(
                    self.fraction(),
                    &format!("batch {}: fovs {:?}", index, fovs),
                );
            }
            Event::StageFinished {
                fov,
                stage,
                ok,
                message,
            } => {
                let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
                let status = if *ok { "" } else { "FAILED " };
                self.emit(
                    (done as f64 / self.total as f64).min(1.0),
                    &format!("fov {} {}: {}{}", fov, stage.name(), status, message),
                );
            }
            Event::Warning { kind, message } => {
                self.emit(self.fraction(), &format!("warning ({}): {}", kind, message));
            }
            _ => {}
        }
    }
}

/// Interactive progress bar.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total.max(1) as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        BarProgress { bar }
    }
}

impl Observer for BarProgress {
    fn event(&self, event: &Event) {
        match event {
            Event::StageFinished {
                fov,
                stage,
                message,
                ..
            } => {
                self.bar.set_message(format!("fov {} {}: {}", fov, stage.name(), message));
                self.bar.inc(1);
            }
            Event::Warning { kind, message } => {
                self.bar.println(format!("warning ({}): {}", kind, message));
            }
            _ => {}
        }
    }
}
