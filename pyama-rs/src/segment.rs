//! LOG-STD segmentation: per-frame local-variance thresholding followed by
//! morphological cleanup. Frames are independent; the cancel token is polled
//! between frames.
//!
//! The threshold is the first local minimum of the 256-bin log-std histogram
//! after the principal mode (ties resolve to the lowest bin index).

use std::path::Path;

use crate::error::Result;
use crate::observer::CancelToken;
use crate::stack::{Dtype, StackRef, StackWriter};

#[derive(Debug, Clone)]
pub struct SegmentParams {
    /// Box filter side (odd).
    pub window: usize,
    /// Disk radius of the structuring element.
    pub struct_size: usize,
    /// Opening/closing iterations.
    pub iterations: usize,
}

/// Segment a phase-contrast stack into a committed bool stack at `out_path`.
/// Returns the stack and per-frame warnings (zero-variance frames produce an
/// all-false mask instead of failing).
pub fn segment_stack(
    pc: &StackRef,
    out_path: &Path,
    params: &SegmentParams,
    cancel: &CancelToken,
) -> Result<(StackRef, Vec<String>)> {
    let (t, h, w) = pc.shape();
    let mut writer = StackWriter::create(out_path, Dtype::Bool, t, h, w)?;
    let mut warnings = Vec::new();
    let offsets = disk_offsets(params.struct_size);

    for frame in 0..t {
        cancel.checkpoint()?;
        let plane = pc.frame_u16(frame)?;
        let (mask, degenerate) = segment_frame(&plane, h, w, params, &offsets);
        if degenerate {
            warnings.push(format!("frame {}: zero variance, mask left empty", frame));
        }
        writer.put_frame_bool(frame, &mask)?;
    }

    let stack = writer.commit()?;
    Ok((stack, warnings))
}

/// Returns the cleaned mask and whether the frame was degenerate (no pixel
/// with positive variance).
fn segment_frame(
    plane: &[u16],
    h: usize,
    w: usize,
    params: &SegmentParams,
    offsets: &[(i32, i32)],
) -> (Vec<bool>, bool) {
    let log_std = log_std_plane(plane, h, w, params.window);

    let mut finite_min = f64::INFINITY;
    let mut finite_max = f64::NEG_INFINITY;
    for &v in &log_std {
        if v.is_finite() {
            finite_min = finite_min.min(v);
            finite_max = finite_max.max(v);
        }
    }
    if !finite_min.is_finite() {
        return (vec![false; h * w], true);
    }

    let tau = histogram_threshold(&log_std, finite_min, finite_max);
    let mut mask: Vec<bool> = log_std.iter().map(|&v| v > tau).collect();

    fill_holes(&mut mask, h, w);
    if params.struct_size > 0 && params.iterations > 0 {
        mask = opening(&mask, h, w, offsets, params.iterations);
        mask = closing(&mask, h, w, offsets, params.iterations);
    }
    (mask, false)
}

/// `0.5 * ln(variance)` under a uniform box filter with replicate padding;
/// `-inf` where the variance is not positive.
fn log_std_plane(plane: &[u16], h: usize, w: usize, window: usize) -> Vec<f64> {
    let r = window / 2;
    let values: Vec<f64> = plane.iter().map(|&v| f64::from(v)).collect();
    let squares: Vec<f64> = plane.iter().map(|&v| f64::from(v) * f64::from(v)).collect();
    let s1 = box_sums(&values, h, w, r);
    let s2 = box_sums(&squares, h, w, r);
    let n = ((2 * r + 1) * (2 * r + 1)) as f64;

    let mut out = vec![f64::NEG_INFINITY; h * w];
    for i in 0..h * w {
        let mean = s1[i] / n;
        let var = s2[i] / n - mean * mean;
        if var > 0.0 {
            out[i] = 0.5 * var.ln();
        }
    }
    out
}

/// Sum over the `(2r+1)^2` window around each pixel, edge samples replicated.
/// Separable: horizontal pass, then vertical on the intermediate sums.
fn box_sums(src: &[f64], h: usize, w: usize, r: usize) -> Vec<f64> {
    let mut tmp = vec![0.0f64; h * w];
    let mut prefix = vec![0.0f64; w + 1];
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        for x in 0..w {
            prefix[x + 1] = prefix[x] + row[x];
        }
        for x in 0..w {
            let lo = x.saturating_sub(r);
            let hi = (x + r).min(w - 1);
            let clamp_left = r.saturating_sub(x) as f64;
            let clamp_right = (x + r).saturating_sub(w - 1) as f64;
            tmp[y * w + x] =
                prefix[hi + 1] - prefix[lo] + clamp_left * row[0] + clamp_right * row[w - 1];
        }
    }

    let mut out = vec![0.0f64; h * w];
    let mut col_prefix = vec![0.0f64; h + 1];
    for x in 0..w {
        for y in 0..h {
            col_prefix[y + 1] = col_prefix[y] + tmp[y * w + x];
        }
        let top = tmp[x];
        let bottom = tmp[(h - 1) * w + x];
        for y in 0..h {
            let lo = y.saturating_sub(r);
            let hi = (y + r).min(h - 1);
            let clamp_top = r.saturating_sub(y) as f64;
            let clamp_bottom = (y + r).saturating_sub(h - 1) as f64;
            out[y * w + x] =
                col_prefix[hi + 1] - col_prefix[lo] + clamp_top * top + clamp_bottom * bottom;
        }
    }
    out
}

/// First local histogram minimum after the principal mode, as a bin-center
/// value. Degenerate histograms (no interior minimum, or a single value)
/// threshold at the top, yielding an all-false mask.
fn histogram_threshold(log_std: &[f64], min: f64, max: f64) -> f64 {
    if max <= min {
        return max;
    }
    const BINS: usize = 256;
    let width = (max - min) / BINS as f64;
    let mut counts = [0u32; BINS];
    for &v in log_std {
        if v.is_finite() {
            let idx = (((v - min) / (max - min)) * BINS as f64) as usize;
            counts[idx.min(BINS - 1)] += 1;
        }
    }

    let mut principal = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c > counts[principal] {
            principal = i;
        }
    }

    for m in principal + 1..BINS - 1 {
        if counts[m] <= counts[m - 1] && counts[m] <= counts[m + 1] {
            return min + (m as f64 + 0.5) * width;
        }
    }
    max
}

// ---------------------------------------------------------------------------
// Morphology (shared with the background estimator)
// ---------------------------------------------------------------------------

/// Offsets of a filled disk of the given radius, including the center.
pub(crate) fn disk_offsets(radius: usize) -> Vec<(i32, i32)> {
    let r = radius as i32;
    let mut offs = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            if dy * dy + dx * dx <= r * r {
                offs.push((dy, dx));
            }
        }
    }
    offs
}

/// Binary erosion; out-of-bounds samples count as background.
pub(crate) fn erode(mask: &[bool], h: usize, w: usize, offsets: &[(i32, i32)]) -> Vec<bool> {
    let mut out = vec![false; h * w];
    for y in 0..h as i32 {
        for x in 0..w as i32 {
            let mut keep = true;
            for &(dy, dx) in offsets {
                let (ny, nx) = (y + dy, x + dx);
                if ny < 0 || nx < 0 || ny >= h as i32 || nx >= w as i32 {
                    keep = false;
                    break;
                }
                if !mask[(ny as usize) * w + nx as usize] {
                    keep = false;
                    break;
                }
            }
            out[(y as usize) * w + x as usize] = keep;
        }
    }
    out
}

/// Binary dilation; out-of-bounds samples count as background.
pub(crate) fn dilate(mask: &[bool], h: usize, w: usize, offsets: &[(i32, i32)]) -> Vec<bool> {
    let mut out = vec![false; h * w];
    for y in 0..h as i32 {
        for x in 0..w as i32 {
            let mut hit = false;
            for &(dy, dx) in offsets {
                let (ny, nx) = (y + dy, x + dx);
                if ny < 0 || nx < 0 || ny >= h as i32 || nx >= w as i32 {
                    continue;
                }
                if mask[(ny as usize) * w + nx as usize] {
                    hit = true;
                    break;
                }
            }
            out[(y as usize) * w + x as usize] = hit;
        }
    }
    out
}

fn opening(mask: &[bool], h: usize, w: usize, offsets: &[(i32, i32)], k: usize) -> Vec<bool> {
    let mut m = mask.to_vec();
    for _ in 0..k {
        m = erode(&m, h, w, offsets);
    }
    for _ in 0..k {
        m = dilate(&m, h, w, offsets);
    }
    m
}

fn closing(mask: &[bool], h: usize, w: usize, offsets: &[(i32, i32)], k: usize) -> Vec<bool> {
    let mut m = mask.to_vec();
    for _ in 0..k {
        m = dilate(&m, h, w, offsets);
    }
    for _ in 0..k {
        m = erode(&m, h, w, offsets);
    }
    m
}

/// Fill 4-connected background regions not reachable from the frame border.
pub(crate) fn fill_holes(mask: &mut [bool], h: usize, w: usize) {
    let mut reached = vec![false; h * w];
    let mut stack: Vec<usize> = Vec::new();

    for x in 0..w {
        for &i in &[x, (h - 1) * w + x] {
            if !mask[i] && !reached[i] {
                reached[i] = true;
                stack.push(i);
            }
        }
    }
    for y in 0..h {
        for &i in &[y * w, y * w + w - 1] {
            if !mask[i] && !reached[i] {
                reached[i] = true;
                stack.push(i);
            }
        }
    }

    while let Some(i) = stack.pop() {
        let (y, x) = (i / w, i % w);
        let mut push = |j: usize| {
            if !mask[j] && !reached[j] {
                reached[j] = true;
                stack.push(j);
            }
        };
        if y > 0 {
            push(i - w);
        }
        if y + 1 < h {
            push(i + w);
        }
        if x > 0 {
            push(i - 1);
        }
        if x + 1 < w {
            push(i + 1);
        }
    }

    for i in 0..h * w {
        if !mask[i] && !reached[i] {
            mask[i] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{stack_path, StackKind};

    #[test]
    fn threshold_splits_bimodal_values() {
        // 100 samples near 0, 50 near 1: principal mode low, first empty bin
        // right after it becomes the valley.
        let mut values = vec![0.0f64; 100];
        values.extend(std::iter::repeat(1.0).take(50));
        let tau = histogram_threshold(&values, 0.0, 1.0);
        assert!(tau > 0.0 && tau < 1.0);
        assert_eq!(values.iter().filter(|&&v| v > tau).count(), 50);
    }

    #[test]
    fn threshold_single_value_masks_nothing() {
        let values = vec![2.5f64; 9];
        let tau = histogram_threshold(&values, 2.5, 2.5);
        assert_eq!(values.iter().filter(|&&v| v > tau).count(), 0);
    }

    #[test]
    fn fill_holes_closes_enclosed_background() {
        // 5x5 ring with a one-pixel hole at the center.
        let w = 5;
        let mut mask = vec![false; 25];
        for y in 1..4 {
            for x in 1..4 {
                mask[y * w + x] = true;
            }
        }
        mask[2 * w + 2] = false;
        fill_holes(&mut mask, 5, 5);
        assert!(mask[2 * w + 2]);
        // border stays background
        assert!(!mask[0]);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 9);
    }

    #[test]
    fn erode_dilate_radius_one() {
        // 3x3 solid block in 5x5: erosion keeps the center, dilation restores
        // a plus-shaped superset.
        let w = 5;
        let mut mask = vec![false; 25];
        for y in 1..4 {
            for x in 1..4 {
                mask[y * w + x] = true;
            }
        }
        let offs = disk_offsets(1);
        let eroded = erode(&mask, 5, 5, &offs);
        assert_eq!(eroded.iter().filter(|&&m| m).count(), 1);
        assert!(eroded[2 * w + 2]);
        let restored = dilate(&eroded, 5, 5, &offs);
        assert!(restored[2 * w + 2] && restored[1 * w + 2] && restored[2 * w + 1]);
        assert!(!restored[0]);
    }

    #[test]
    fn box_sums_replicate_padding() {
        // Constant image: every window sums to n * value regardless of edges.
        let src = vec![2.0f64; 12];
        let sums = box_sums(&src, 3, 4, 1);
        for &s in &sums {
            assert!((s - 18.0).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_variance_frame_yields_empty_mask_and_warning() {
        let dir = tempfile::tempdir().unwrap();
        let pc_path = stack_path(dir.path(), "t", 0, StackKind::Pc, 0);
        let mut w = StackWriter::create(&pc_path, Dtype::U16, 1, 8, 8).unwrap();
        w.put_frame_u16(0, &[500u16; 64]).unwrap();
        let pc = w.commit().unwrap();

        let out = stack_path(dir.path(), "t", 0, StackKind::Seg, 0);
        let params = SegmentParams {
            window: 3,
            struct_size: 1,
            iterations: 1,
        };
        let (seg, warnings) =
            segment_stack(&pc, &out, &params, &CancelToken::new()).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(seg.frame_bool(0).unwrap().iter().all(|&m| !m));
    }

    #[test]
    fn textured_region_is_segmented() {
        // 16x16 frame: flat-ish background with mild gradient, strongly
        // textured 6x6 block. The block must end up in the mask, the far
        // corner must not.
        let (h, w) = (16, 16);
        let mut plane = vec![0u16; h * w];
        for y in 0..h {
            for x in 0..w {
                plane[y * w + x] = 100 + ((x * 7 + y * 13) % 5) as u16;
            }
        }
        for y in 5..11 {
            for x in 5..11 {
                plane[y * w + x] = if (x + y) % 2 == 0 { 1200 } else { 100 };
            }
        }
        let params = SegmentParams {
            window: 3,
            struct_size: 1,
            iterations: 1,
        };
        let offs = disk_offsets(params.struct_size);
        let (mask, degenerate) = segment_frame(&plane, h, w, &params, &offs);
        assert!(!degenerate);
        assert!(mask[7 * w + 7], "textured block center missing from mask");
        assert!(!mask[15 * w + 15], "background corner wrongly masked");
    }
}
