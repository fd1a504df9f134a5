//! Tiled background estimation for fluorescence stacks.
//!
//! Per frame: the segmentation is dilated and excluded, medians are taken
//! over an overlapping tile grid, starved tiles are filled from their
//! nearest neighbor in tile coordinates, and the tile medians are lifted to
//! the pixel grid with a Catmull-Rom bicubic surface. Frames are independent
//! (no temporal smoothing); output is the estimated background itself,
//! subtraction happens at extraction.

use std::path::Path;

use crate::error::Result;
use crate::observer::CancelToken;
use crate::segment::{dilate, disk_offsets};
use crate::stack::{check_same_shape, Dtype, StackRef, StackWriter};

/// Tiles with fewer background pixels than this are interpolated instead.
const MIN_TILE_SAMPLES: usize = 8;

#[derive(Debug, Clone)]
pub struct BackgroundParams {
    /// Tile side in pixels.
    pub tile: usize,
    /// Fractional overlap between neighboring tiles, in [0, 1).
    pub overlap: f64,
    /// Disk radius used to dilate the segmentation before exclusion.
    pub dilation: usize,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        BackgroundParams {
            tile: 64,
            overlap: 0.5,
            dilation: 10,
        }
    }
}

/// Estimate the background of `fl` outside the (dilated) segmentation and
/// commit it as an f32 stack at `out_path`.
pub fn estimate_background_stack(
    seg: &StackRef,
    fl: &StackRef,
    out_path: &Path,
    params: &BackgroundParams,
    cancel: &CancelToken,
) -> Result<(StackRef, Vec<String>)> {
    check_same_shape(seg, fl)?;
    let (t, h, w) = fl.shape();
    let mut writer = StackWriter::create(out_path, Dtype::F32, t, h, w)?;
    let mut warnings = Vec::new();
    let offsets = disk_offsets(params.dilation);

    for frame in 0..t {
        cancel.checkpoint()?;
        let mask = seg.frame_bool(frame)?;
        let plane = fl.frame_u16(frame)?;
        if is_constant(&plane) {
            warnings.push(format!(
                "frame {}: constant fluorescence, background equals the constant",
                frame
            ));
        }
        let fg = dilate(&mask, h, w, &offsets);
        let surface = background_frame(&plane, &fg, h, w, params);
        writer.put_frame_f32(frame, &surface)?;
    }

    let stack = writer.commit()?;
    Ok((stack, warnings))
}

fn is_constant(plane: &[u16]) -> bool {
    plane.windows(2).all(|p| p[0] == p[1])
}

fn background_frame(
    plane: &[u16],
    fg: &[bool],
    h: usize,
    w: usize,
    params: &BackgroundParams,
) -> Vec<f32> {
    let stride = ((params.tile as f64) * (1.0 - params.overlap)).round().max(1.0) as usize;
    let rows = tile_spans(h, params.tile, stride);
    let cols = tile_spans(w, params.tile, stride);

    let mut grid: Vec<Option<f64>> = Vec::with_capacity(rows.len() * cols.len());
    let mut samples: Vec<u16> = Vec::new();
    for &(y0, y1) in &rows {
        for &(x0, x1) in &cols {
            samples.clear();
            for y in y0..y1 {
                for x in x0..x1 {
                    let i = y * w + x;
                    if !fg[i] {
                        samples.push(plane[i]);
                    }
                }
            }
            if samples.len() >= MIN_TILE_SAMPLES {
                grid.push(Some(median_u16(&mut samples)));
            } else {
                grid.push(None);
            }
        }
    }

    let filled = fill_missing_tiles(&grid, rows.len(), cols.len()).unwrap_or_else(|| {
        // Every tile starved: fall back to the frame-wide median.
        let mut all = plane.to_vec();
        vec![median_u16(&mut all); rows.len() * cols.len()]
    });

    let cys: Vec<f64> = rows.iter().map(|&(a, b)| (a + b - 1) as f64 / 2.0).collect();
    let cxs: Vec<f64> = cols.iter().map(|&(a, b)| (a + b - 1) as f64 / 2.0).collect();
    bicubic_surface(&filled, &cys, &cxs, h, w)
}

/// Overlapping tile spans `(start, end)` covering `0..len`; the final tile is
/// clipped to the frame edge.
fn tile_spans(len: usize, tile: usize, stride: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    loop {
        spans.push((start, (start + tile).min(len)));
        if start + tile >= len {
            break;
        }
        start += stride;
    }
    spans
}

/// Median with the two middle values averaged; deterministic via
/// `select_nth_unstable`.
pub(crate) fn median_u16(values: &mut [u16]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    values.select_nth_unstable(mid);
    let upper = values[mid];
    if values.len() % 2 == 1 {
        f64::from(upper)
    } else {
        let lower = *values[..mid].iter().max().unwrap();
        (f64::from(lower) + f64::from(upper)) / 2.0
    }
}

/// Nearest-neighbor fill in tile coordinates; ties resolve to the smaller
/// row, then the smaller column. `None` if every tile is missing.
fn fill_missing_tiles(grid: &[Option<f64>], gh: usize, gw: usize) -> Option<Vec<f64>> {
    if grid.iter().all(|v| v.is_none()) {
        return None;
    }
    let mut out = vec![0.0f64; gh * gw];
    for i in 0..gh {
        for j in 0..gw {
            out[i * gw + j] = match grid[i * gw + j] {
                Some(v) => v,
                None => {
                    let mut best = f64::NAN;
                    let mut best_d = usize::MAX;
                    for ni in 0..gh {
                        for nj in 0..gw {
                            if let Some(v) = grid[ni * gw + nj] {
                                let di = ni.abs_diff(i);
                                let dj = nj.abs_diff(j);
                                let d = di * di + dj * dj;
                                if d < best_d {
                                    best_d = d;
                                    best = v;
                                }
                            }
                        }
                    }
                    best
                }
            };
        }
    }
    Some(out)
}

fn catmull_rom_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        0.5 * (-t3 + 2.0 * t2 - t),
        0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
        0.5 * (-3.0 * t3 + 4.0 * t2 + t),
        0.5 * (t3 - t2),
    ]
}

struct AxisInterp {
    /// Left knot index per pixel.
    idx: Vec<usize>,
    weights: Vec<[f64; 4]>,
}

/// Map pixel coordinates onto the (possibly unevenly spaced) tile centers.
/// Outside the first/last center the surface is edge-clamped.
fn axis_interp(centers: &[f64], len: usize) -> AxisInterp {
    let g = centers.len();
    let mut idx = Vec::with_capacity(len);
    let mut weights = Vec::with_capacity(len);
    for p in 0..len {
        let p = p as f64;
        if g == 1 {
            idx.push(0);
            weights.push([0.0, 1.0, 0.0, 0.0]);
            continue;
        }
        let (j, t) = if p <= centers[0] {
            (0, 0.0)
        } else if p >= centers[g - 1] {
            (g - 2, 1.0)
        } else {
            let mut j = 0;
            while j + 2 < g && centers[j + 1] <= p {
                j += 1;
            }
            (j, (p - centers[j]) / (centers[j + 1] - centers[j]))
        };
        idx.push(j);
        weights.push(catmull_rom_weights(t));
    }
    AxisInterp { idx, weights }
}

fn bicubic_surface(grid: &[f64], cys: &[f64], cxs: &[f64], h: usize, w: usize) -> Vec<f32> {
    let (gh, gw) = (cys.len(), cxs.len());
    let ay = axis_interp(cys, h);
    let ax = axis_interp(cxs, w);
    let clamp = |v: isize, hi: usize| -> usize { v.clamp(0, hi as isize - 1) as usize };

    let mut out = vec![0.0f32; h * w];
    for y in 0..h {
        let iy = ay.idx[y] as isize;
        let wy = &ay.weights[y];
        for x in 0..w {
            let jx = ax.idx[x] as isize;
            let wx = &ax.weights[x];
            let mut acc = 0.0f64;
            for (a, &wya) in wy.iter().enumerate() {
                if wya == 0.0 {
                    continue;
                }
                let gy = clamp(iy - 1 + a as isize, gh);
                let mut row_acc = 0.0f64;
                for (b, &wxb) in wx.iter().enumerate() {
                    if wxb == 0.0 {
                        continue;
                    }
                    let gx = clamp(jx - 1 + b as isize, gw);
                    row_acc += wxb * grid[gy * gw + gx];
                }
                acc += wya * row_acc;
            }
            out[y * w + x] = acc.clamp(0.0, 65535.0) as f32;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{stack_path, StackKind};

    fn make_stacks(
        dir: &Path,
        fl_planes: &[Vec<u16>],
        seg_planes: &[Vec<bool>],
        h: usize,
        w: usize,
    ) -> (StackRef, StackRef) {
        let t = fl_planes.len();
        let seg_path = stack_path(dir, "t", 0, StackKind::Seg, 0);
        let mut sw = StackWriter::create(&seg_path, Dtype::Bool, t, h, w).unwrap();
        for (i, p) in seg_planes.iter().enumerate() {
            sw.put_frame_bool(i, p).unwrap();
        }
        let seg = sw.commit().unwrap();

        let fl_path = stack_path(dir, "t", 0, StackKind::Fl, 1);
        let mut fw = StackWriter::create(&fl_path, Dtype::U16, t, h, w).unwrap();
        for (i, p) in fl_planes.iter().enumerate() {
            fw.put_frame_u16(i, p).unwrap();
        }
        let fl = fw.commit().unwrap();
        (seg, fl)
    }

    fn params_small() -> BackgroundParams {
        BackgroundParams {
            tile: 8,
            overlap: 0.5,
            dilation: 1,
        }
    }

    #[test]
    fn constant_frame_yields_constant_background() {
        let dir = tempfile::tempdir().unwrap();
        let (h, w) = (16, 16);
        let (seg, fl) = make_stacks(
            dir.path(),
            &[vec![700u16; h * w]],
            &[vec![false; h * w]],
            h,
            w,
        );
        let out = stack_path(dir.path(), "t", 0, StackKind::FlBackground, 1);
        let (bg, warnings) =
            estimate_background_stack(&seg, &fl, &out, &params_small(), &CancelToken::new())
                .unwrap();
        assert_eq!(warnings.len(), 1);
        for v in bg.frame_f32(0).unwrap() {
            assert!((v - 700.0).abs() < 1e-3);
        }
    }

    #[test]
    fn all_foreground_falls_back_to_frame_median() {
        let dir = tempfile::tempdir().unwrap();
        let (h, w) = (16, 16);
        let mut plane = vec![100u16; h * w];
        // odd count of 900s so the frame median stays 100
        for i in 0..20 {
            plane[i] = 900;
        }
        let (seg, fl) = make_stacks(dir.path(), &[plane], &[vec![true; h * w]], h, w);
        let out = stack_path(dir.path(), "t", 0, StackKind::FlBackground, 1);
        let (bg, _) =
            estimate_background_stack(&seg, &fl, &out, &params_small(), &CancelToken::new())
                .unwrap();
        for v in bg.frame_f32(0).unwrap() {
            assert!((v - 100.0).abs() < 1e-3);
        }
    }

    #[test]
    fn masked_bright_region_does_not_leak_into_background() {
        let dir = tempfile::tempdir().unwrap();
        let (h, w) = (24, 24);
        let mut plane = vec![500u16; h * w];
        let mut mask = vec![false; h * w];
        for y in 4..12 {
            for x in 4..12 {
                plane[y * w + x] = 3000;
                mask[y * w + x] = true;
            }
        }
        let (seg, fl) = make_stacks(dir.path(), &[plane], &[mask], h, w);
        let out = stack_path(dir.path(), "t", 0, StackKind::FlBackground, 1);
        let (bg, _) =
            estimate_background_stack(&seg, &fl, &out, &params_small(), &CancelToken::new())
                .unwrap();
        for v in bg.frame_f32(0).unwrap() {
            assert!((v - 500.0).abs() < 1.0, "background {} leaked", v);
        }
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (seg, _) = make_stacks(
            dir.path(),
            &[vec![0u16; 64]],
            &[vec![false; 64]],
            8,
            8,
        );
        let fl_path = dir.path().join("other.stack");
        let mut fw = StackWriter::create(&fl_path, Dtype::U16, 1, 4, 4).unwrap();
        fw.put_frame_u16(0, &[0u16; 16]).unwrap();
        let fl = fw.commit().unwrap();
        let out = dir.path().join("bg.stack");
        let err = estimate_background_stack(
            &seg,
            &fl,
            &out,
            &params_small(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[test]
    fn tile_spans_cover_frame() {
        let spans = tile_spans(16, 8, 4);
        assert_eq!(spans, vec![(0, 8), (4, 12), (8, 16)]);
        let spans = tile_spans(6, 8, 4);
        assert_eq!(spans, vec![(0, 6)]);
    }

    #[test]
    fn nearest_tile_fill_prefers_smaller_row_then_col() {
        // 2x2 grid with one hole: equidistant donors resolve by row, then col.
        let grid = vec![None, Some(2.0), Some(3.0), None];
        let filled = fill_missing_tiles(&grid, 2, 2).unwrap();
        assert_eq!(filled, vec![2.0, 2.0, 3.0, 2.0]);
    }

    #[test]
    fn median_averages_even_counts() {
        let mut v = vec![1u16, 3, 5, 7];
        assert_eq!(median_u16(&mut v), 4.0);
        let mut v = vec![9u16, 1, 5];
        assert_eq!(median_u16(&mut v), 5.0);
    }
}
