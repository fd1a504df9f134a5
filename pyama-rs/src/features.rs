//! Feature registry and per-cell trace extraction.
//!
//! Features are pure functions of `(mask, image)` plus, for
//! `intensity_total`, the estimated background and its weight. The registry
//! is built once at startup; configuration validation fails closed on names
//! it does not contain.

use std::collections::BTreeMap;
use std::path::Path;

use crate::background::median_u16;
use crate::error::{PipelineError, Result};
use crate::observer::CancelToken;
use crate::stack::{check_same_shape, write_atomic, StackRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Phase,
    Fluorescence,
}

impl FeatureKind {
    pub fn name(self) -> &'static str {
        match self {
            FeatureKind::Phase => "phase",
            FeatureKind::Fluorescence => "fluorescence",
        }
    }
}

/// One cell in one frame, as seen by a feature function.
pub struct FeatureInput<'a> {
    /// Raster pixel indices of the cell mask.
    pub pixels: &'a [u32],
    /// Inclusive (y0, x0, y1, x1).
    pub bbox: [usize; 4],
    pub width: usize,
    pub image: &'a [u16],
    pub background: Option<&'a [f32]>,
    /// Clamped to [0, 1]; forced to 0 when `background` is absent.
    pub background_weight: f64,
}

pub type FeatureFn = fn(&FeatureInput) -> f64;

pub struct FeatureRegistry {
    map: BTreeMap<String, (FeatureKind, FeatureFn)>,
}

impl FeatureRegistry {
    pub fn empty() -> Self {
        FeatureRegistry {
            map: BTreeMap::new(),
        }
    }

    /// Registry with the builtin feature set.
    pub fn builtin() -> Self {
        let mut r = Self::empty();
        let defaults: [(&str, FeatureKind, FeatureFn); 7] = [
            ("area", FeatureKind::Phase, area),
            ("aspect_ratio", FeatureKind::Phase, aspect_ratio),
            ("intensity_total", FeatureKind::Fluorescence, intensity_total),
            ("intensity_mean", FeatureKind::Fluorescence, intensity_mean),
            ("intensity_max", FeatureKind::Fluorescence, intensity_max),
            ("intensity_median", FeatureKind::Fluorescence, intensity_median),
            ("intensity_std", FeatureKind::Fluorescence, intensity_std),
        ];
        for (name, kind, f) in defaults {
            r.register(name, kind, f).expect("builtin registry");
        }
        r
    }

    pub fn register(&mut self, name: &str, kind: FeatureKind, f: FeatureFn) -> Result<()> {
        if self.map.contains_key(name) {
            return Err(PipelineError::Config(format!(
                "feature {:?} registered twice",
                name
            )));
        }
        self.map.insert(name.to_string(), (kind, f));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<(FeatureKind, FeatureFn)> {
        self.map.get(name).copied()
    }
}

// ---------------------------------------------------------------------------
// Builtin features
// ---------------------------------------------------------------------------

fn area(input: &FeatureInput) -> f64 {
    input.pixels.len() as f64
}

fn aspect_ratio(input: &FeatureInput) -> f64 {
    let [y0, x0, y1, x1] = input.bbox;
    (x1 - x0 + 1) as f64 / (y1 - y0 + 1) as f64
}

/// `sum(image - w * background)` over the mask, accumulated in f64 in raster
/// order, emitted at f32 precision.
fn intensity_total(input: &FeatureInput) -> f64 {
    let w = match input.background {
        Some(_) => input.background_weight.clamp(0.0, 1.0),
        None => 0.0,
    };
    let mut sum = 0.0f64;
    for &p in input.pixels {
        let raw = f64::from(input.image[p as usize]);
        let bg = input
            .background
            .map_or(0.0, |b| f64::from(b[p as usize]));
        sum += raw - w * bg;
    }
    sum as f32 as f64
}

fn intensity_mean(input: &FeatureInput) -> f64 {
    let sum: f64 = input
        .pixels
        .iter()
        .map(|&p| f64::from(input.image[p as usize]))
        .sum();
    sum / input.pixels.len() as f64
}

fn intensity_max(input: &FeatureInput) -> f64 {
    input
        .pixels
        .iter()
        .map(|&p| input.image[p as usize])
        .max()
        .map_or(0.0, f64::from)
}

fn intensity_median(input: &FeatureInput) -> f64 {
    let mut values: Vec<u16> = input
        .pixels
        .iter()
        .map(|&p| input.image[p as usize])
        .collect();
    median_u16(&mut values)
}

fn intensity_std(input: &FeatureInput) -> f64 {
    let n = input.pixels.len() as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &p in input.pixels {
        let v = f64::from(input.image[p as usize]);
        sum += v;
        sum_sq += v * v;
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0).sqrt()
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

pub struct FlChannelInputs<'a> {
    pub channel: usize,
    pub features: &'a [String],
    pub stack: &'a StackRef,
    pub background: Option<&'a StackRef>,
}

#[derive(Debug, Clone)]
pub struct ExtractParams {
    pub background_weight: f64,
    pub min_trace_length: usize,
    pub border_width_px: usize,
}

#[derive(Debug)]
pub struct ExtractSummary {
    pub cells: usize,
    pub rows: usize,
    pub warnings: Vec<String>,
}

enum ColumnSource {
    Phase,
    Fl(usize),
}

struct Column {
    channel: usize,
    name: String,
    func: FeatureFn,
    source: ColumnSource,
}

struct Row {
    frame: usize,
    time: f64,
    cx: f64,
    cy: f64,
    bbox: [usize; 4],
    values: Vec<f64>,
}

/// Assemble, filter, and write the traces CSV for one FOV. The file is
/// written through a temp sibling and renamed, so its existence marks the
/// FOV as done.
#[allow(clippy::too_many_arguments)]
pub fn extract_traces(
    fov: usize,
    labeled: &StackRef,
    pc: &StackRef,
    pc_channel: usize,
    pc_features: &[String],
    fl: &[FlChannelInputs],
    registry: &FeatureRegistry,
    params: &ExtractParams,
    time_points: Option<&[f64]>,
    out_csv: &Path,
    cancel: &CancelToken,
) -> Result<ExtractSummary> {
    check_same_shape(labeled, pc)?;
    for input in fl {
        check_same_shape(labeled, input.stack)?;
        if let Some(bg) = input.background {
            check_same_shape(input.stack, bg)?;
        }
    }
    let (t, h, w) = labeled.shape();

    let mut columns = Vec::new();
    for name in pc_features {
        let (_, func) = registry
            .get(name)
            .ok_or_else(|| PipelineError::Config(format!("unknown feature {:?}", name)))?;
        columns.push(Column {
            channel: pc_channel,
            name: name.clone(),
            func,
            source: ColumnSource::Phase,
        });
    }
    for (idx, input) in fl.iter().enumerate() {
        for name in input.features {
            let (_, func) = registry
                .get(name)
                .ok_or_else(|| PipelineError::Config(format!("unknown feature {:?}", name)))?;
            columns.push(Column {
                channel: input.channel,
                name: name.clone(),
                func,
                source: ColumnSource::Fl(idx),
            });
        }
    }
    columns.sort_by(|a, b| a.channel.cmp(&b.channel).then(a.name.cmp(&b.name)));

    let mut traces: BTreeMap<u16, Vec<Row>> = BTreeMap::new();

    for frame in 0..t {
        cancel.checkpoint()?;
        let labels = labeled.frame_u16(frame)?;
        let pc_plane = pc.frame_u16(frame)?;
        let mut fl_planes: Vec<(Vec<u16>, Option<Vec<f32>>)> = Vec::with_capacity(fl.len());
        for input in fl {
            let plane = input.stack.frame_u16(frame)?;
            let bg = match input.background {
                Some(b) => Some(b.frame_f32(frame)?),
                None => None,
            };
            fl_planes.push((plane, bg));
        }

        let mut cells: BTreeMap<u16, Vec<u32>> = BTreeMap::new();
        for (i, &label) in labels.iter().enumerate() {
            if label > 0 {
                cells.entry(label).or_default().push(i as u32);
            }
        }

        let time = time_points
            .and_then(|tp| tp.get(frame).copied())
            .unwrap_or(frame as f64);

        for (cell, pixels) in cells {
            let mut bbox = [h, w, 0usize, 0usize];
            let mut sum_y = 0.0f64;
            let mut sum_x = 0.0f64;
            for &p in &pixels {
                let (y, x) = (p as usize / w, p as usize % w);
                bbox[0] = bbox[0].min(y);
                bbox[1] = bbox[1].min(x);
                bbox[2] = bbox[2].max(y);
                bbox[3] = bbox[3].max(x);
                sum_y += y as f64;
                sum_x += x as f64;
            }
            let n = pixels.len() as f64;

            let mut values = Vec::with_capacity(columns.len());
            for col in &columns {
                let (image, background): (&[u16], Option<&[f32]>) = match col.source {
                    ColumnSource::Phase => (&pc_plane, None),
                    ColumnSource::Fl(idx) => {
                        let (plane, bg) = &fl_planes[idx];
                        (plane, bg.as_deref())
                    }
                };
                let input = FeatureInput {
                    pixels: &pixels,
                    bbox,
                    width: w,
                    image,
                    background,
                    background_weight: params.background_weight,
                };
                values.push((col.func)(&input));
            }

            traces.entry(cell).or_default().push(Row {
                frame,
                time,
                cx: sum_x / n,
                cy: sum_y / n,
                bbox,
                values,
            });
        }
    }

    // Trace-level filters: minimum length, then border exclusion on the
    // centroid in any frame.
    let border = params.border_width_px as f64;
    traces.retain(|_, rows| rows.len() >= params.min_trace_length);
    traces.retain(|_, rows| {
        !rows.iter().any(|r| {
            r.cx < border
                || r.cy < border
                || r.cx > (w - 1) as f64 - border
                || r.cy > (h - 1) as f64 - border
        })
    });

    let mut warnings = Vec::new();
    if traces.is_empty() {
        warnings.push("no cells survived trace filtering".to_string());
    }

    let mut out = Vec::new();
    {
        let mut wtr = csv::Writer::from_writer(&mut out);
        let mut header = vec![
            "fov".to_string(),
            "cell".to_string(),
            "frame".to_string(),
            "time".to_string(),
            "good".to_string(),
            "position_x".to_string(),
            "position_y".to_string(),
            "bbox_x0".to_string(),
            "bbox_y0".to_string(),
            "bbox_x1".to_string(),
            "bbox_y1".to_string(),
        ];
        for col in &columns {
            header.push(format!("{}_ch_{}", col.name, col.channel));
        }
        wtr.write_record(&header)
            .map_err(|e| PipelineError::Format(format!("csv: {}", e)))?;

        let mut n_rows = 0usize;
        for (cell, rows) in &traces {
            for row in rows {
                let mut record = vec![
                    fov.to_string(),
                    cell.to_string(),
                    row.frame.to_string(),
                    format!("{:.6}", row.time),
                    "true".to_string(),
                    format!("{:.6}", row.cx),
                    format!("{:.6}", row.cy),
                    row.bbox[1].to_string(),
                    row.bbox[0].to_string(),
                    row.bbox[3].to_string(),
                    row.bbox[2].to_string(),
                ];
                for v in &row.values {
                    record.push(format!("{:.6}", v));
                }
                wtr.write_record(&record)
                    .map_err(|e| PipelineError::Format(format!("csv: {}", e)))?;
                n_rows += 1;
            }
        }
        wtr.flush().map_err(|e| PipelineError::io(out_csv, e))?;
        drop(wtr);

        write_atomic(out_csv, &out)?;
        Ok(ExtractSummary {
            cells: traces.len(),
            rows: n_rows,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{stack_path, Dtype, StackKind, StackWriter};
    use std::fs;

    const H: usize = 8;
    const W: usize = 8;
    const T: usize = 4;

    /// Two 2x2 cells (ids 1 and 2) at (2,2) and (2,5) in every frame.
    fn cell_mask() -> Vec<u16> {
        let mut plane = vec![0u16; H * W];
        for y in 2..4 {
            for x in 2..4 {
                plane[y * W + x] = 1;
            }
            for x in 5..7 {
                plane[y * W + x] = 2;
            }
        }
        plane
    }

    struct Fixture {
        labeled: StackRef,
        pc: StackRef,
        fl: StackRef,
        bg: StackRef,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let labels = cell_mask();

        let lp = stack_path(dir.path(), "t", 0, StackKind::SegLabeled, 0);
        let mut w = StackWriter::create(&lp, Dtype::U16Label, T, H, W).unwrap();
        for t in 0..T {
            w.put_frame_u16(t, &labels).unwrap();
        }
        let labeled = w.commit().unwrap();

        let pp = stack_path(dir.path(), "t", 0, StackKind::Pc, 0);
        let mut w = StackWriter::create(&pp, Dtype::U16, T, H, W).unwrap();
        for t in 0..T {
            w.put_frame_u16(t, &vec![1000u16; H * W]).unwrap();
        }
        let pc = w.commit().unwrap();

        // fl: 1500 inside cells, 500 outside
        let fl_plane: Vec<u16> = labels.iter().map(|&l| if l > 0 { 1500 } else { 500 }).collect();
        let fp = stack_path(dir.path(), "t", 0, StackKind::Fl, 1);
        let mut w = StackWriter::create(&fp, Dtype::U16, T, H, W).unwrap();
        for t in 0..T {
            w.put_frame_u16(t, &fl_plane).unwrap();
        }
        let fl = w.commit().unwrap();

        let bp = stack_path(dir.path(), "t", 0, StackKind::FlBackground, 1);
        let mut w = StackWriter::create(&bp, Dtype::F32, T, H, W).unwrap();
        for t in 0..T {
            w.put_frame_f32(t, &vec![500.0f32; H * W]).unwrap();
        }
        let bg = w.commit().unwrap();

        Fixture {
            labeled,
            pc,
            fl,
            bg,
            dir,
        }
    }

    fn run(fx: &Fixture, weight: f64, min_len: usize, border: usize) -> (Vec<String>, ExtractSummary) {
        let registry = FeatureRegistry::builtin();
        let out = fx.dir.path().join(format!(
            "traces_w{}_l{}_b{}.csv",
            (weight * 100.0) as u32,
            min_len,
            border
        ));
        let pc_features = vec!["area".to_string(), "aspect_ratio".to_string()];
        let fl_features = vec!["intensity_total".to_string()];
        let fl = [FlChannelInputs {
            channel: 1,
            features: &fl_features,
            stack: &fx.fl,
            background: Some(&fx.bg),
        }];
        let params = ExtractParams {
            background_weight: weight,
            min_trace_length: min_len,
            border_width_px: border,
        };
        let summary = extract_traces(
            0,
            &fx.labeled,
            &fx.pc,
            0,
            &pc_features,
            &fl,
            &registry,
            &params,
            None,
            &out,
            &CancelToken::new(),
        )
        .unwrap();
        let text = fs::read_to_string(&out).unwrap();
        (text.lines().map(String::from).collect(), summary)
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut r = FeatureRegistry::builtin();
        let err = r.register("area", FeatureKind::Phase, area).unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(r.get("nope").is_none());
    }

    #[test]
    fn two_cells_full_traces() {
        let fx = fixture();
        let (lines, summary) = run(&fx, 0.0, 1, 0);
        assert_eq!(summary.cells, 2);
        assert_eq!(summary.rows, 8);
        assert_eq!(
            lines[0],
            "fov,cell,frame,time,good,position_x,position_y,bbox_x0,bbox_y0,bbox_x1,bbox_y1,\
             area_ch_0,aspect_ratio_ch_0,intensity_total_ch_1"
        );
        // cell 1, frame 0: centroid (2.5, 2.5); weight 0 keeps raw sum
        assert_eq!(
            lines[1],
            "0,1,0,0.000000,true,2.500000,2.500000,2,2,3,3,4.000000,1.000000,6000.000000"
        );
        // cell 2 rows follow all of cell 1's
        assert!(lines[5].starts_with("0,2,0,"));
        assert!(lines[5].contains("5.500000,2.500000"));
    }

    #[test]
    fn background_weight_is_affine() {
        let fx = fixture();
        let (full, _) = run(&fx, 1.0, 1, 0);
        let (half, _) = run(&fx, 0.5, 1, 0);
        let (zero, _) = run(&fx, 0.0, 1, 0);
        let total = |line: &str| -> f64 {
            line.rsplit(',').next().unwrap().parse().unwrap()
        };
        assert_eq!(total(&full[1]), 4000.0); // 4 * (1500 - 500)
        assert_eq!(total(&half[1]), 5000.0); // 4 * (1500 - 250)
        assert_eq!(total(&zero[1]), 6000.0); // 4 * 1500
    }

    #[test]
    fn min_trace_length_filters_short_traces() {
        let fx = fixture();
        let (_, all) = run(&fx, 1.0, T, 0);
        assert_eq!(all.cells, 2);
        let (lines, none) = run(&fx, 1.0, T + 1, 0);
        assert_eq!(none.cells, 0);
        assert_eq!(none.rows, 0);
        assert_eq!(lines.len(), 1, "expected header-only CSV");
        assert_eq!(none.warnings.len(), 1);
    }

    #[test]
    fn border_filter_uses_centroid_distance() {
        // centroids at x = 2.5 and 5.5, y = 2.5: distance to the nearest
        // edge is 2.5. border 2 keeps both, border 3 drops both.
        let fx = fixture();
        let (_, kept) = run(&fx, 1.0, 1, 2);
        assert_eq!(kept.cells, 2);
        let (_, dropped) = run(&fx, 1.0, 1, 3);
        assert_eq!(dropped.cells, 0);
    }

    #[test]
    fn intensity_statistics() {
        let image: Vec<u16> = vec![10, 20, 30, 40];
        let pixels: Vec<u32> = vec![0, 1, 2, 3];
        let input = FeatureInput {
            pixels: &pixels,
            bbox: [0, 0, 1, 1],
            width: 2,
            image: &image,
            background: None,
            background_weight: 1.0,
        };
        assert_eq!(intensity_mean(&input), 25.0);
        assert_eq!(intensity_max(&input), 40.0);
        assert_eq!(intensity_median(&input), 25.0);
        assert!((intensity_std(&input) - 125.0f64.sqrt()).abs() < 1e-9);
        // no background stack: weight forced to zero
        assert_eq!(intensity_total(&input), 100.0);
    }
}
