//! Source readers: random access to `(fov, t, channel)` frames.
//!
//! Readers are not assumed thread-safe; the scheduler serializes all reads.
//! Two backends ship: ND2 files via `nd2-rs`, and Micro-Manager-style TIFF
//! folder trees (`Pos{p}/img_channel..._position..._time..._z....tif`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use nd2_rs::Nd2File;
use regex::Regex;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct SourceMetadata {
    pub n_fovs: usize,
    pub n_frames: usize,
    pub n_channels: usize,
    pub height: usize,
    pub width: usize,
    pub channel_names: Vec<String>,
    pub time_units: String,
    /// Frame timestamps in minutes; `None` means the frame index is used.
    pub time_points: Option<Vec<f64>>,
}

pub trait MicroscopyReader {
    fn metadata(&self) -> &SourceMetadata;

    /// Read one plane as row-major `u16` of length `height * width`.
    fn read_frame(&mut self, fov: usize, t: usize, channel: usize) -> Result<Vec<u16>>;
}

/// Open a source by path: a directory is treated as a TIFF folder tree, a
/// `.nd2` file as an ND2 acquisition.
pub fn open_source(path: &Path) -> Result<Box<dyn MicroscopyReader>> {
    if path.is_dir() {
        return Ok(Box::new(TiffFolderReader::open(path)?));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("nd2") => Ok(Box::new(Nd2Reader::open(path)?)),
        _ => Err(PipelineError::Format(format!(
            "unsupported source {}: expected an .nd2 file or a TIFF folder",
            path.display()
        ))),
    }
}

/// Stem used for output file naming: file stem for files, directory name for
/// folder sources.
pub fn source_basename(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stack".to_string())
}

// ---------------------------------------------------------------------------
// ND2
// ---------------------------------------------------------------------------

pub struct Nd2Reader {
    file: Nd2File,
    meta: SourceMetadata,
}

impl Nd2Reader {
    pub fn open(path: &Path) -> Result<Self> {
        let display = path.to_string_lossy();
        let mut file = Nd2File::open(display.as_ref())
            .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
        let sizes = file
            .sizes()
            .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
        let n_fovs = *sizes.get("P").unwrap_or(&1);
        let n_frames = *sizes.get("T").unwrap_or(&1);
        let n_channels = *sizes.get("C").unwrap_or(&1);
        let height = *sizes.get("Y").unwrap_or(&1);
        let width = *sizes.get("X").unwrap_or(&1);
        let meta = SourceMetadata {
            n_fovs,
            n_frames,
            n_channels,
            height,
            width,
            channel_names: (0..n_channels).map(|c| format!("ch{}", c)).collect(),
            time_units: "min".to_string(),
            time_points: None,
        };
        Ok(Nd2Reader { file, meta })
    }
}

impl MicroscopyReader for Nd2Reader {
    fn metadata(&self) -> &SourceMetadata {
        &self.meta
    }

    fn read_frame(&mut self, fov: usize, t: usize, channel: usize) -> Result<Vec<u16>> {
        let plane = self
            .file
            .read_frame_2d(fov, t, channel, 0)
            .map_err(|e| {
                PipelineError::Format(format!(
                    "nd2 read (fov {}, t {}, ch {}): {}",
                    fov, t, channel, e
                ))
            })?;
        let expect = self.meta.height * self.meta.width;
        if plane.len() != expect {
            return Err(PipelineError::Format(format!(
                "nd2 frame (fov {}, t {}, ch {}) has {} pixels, expected {}",
                fov,
                t,
                channel,
                plane.len(),
                expect
            )));
        }
        Ok(plane)
    }
}

// ---------------------------------------------------------------------------
// TIFF folders
// ---------------------------------------------------------------------------

const TIFF_RE: &str = r"^img_channel(\d+)_position(\d+)_time(\d+)_z(\d+)\.tif$";
const POS_RE: &str = r"^Pos(\d+)$";

pub struct TiffFolderReader {
    /// Sorted position ids; the FOV index is the offset into this list.
    positions: Vec<u32>,
    /// Per FOV: `(channel, t)` to file path, z = 0 planes only.
    frames: Vec<HashMap<(usize, usize), PathBuf>>,
    meta: SourceMetadata,
}

impl TiffFolderReader {
    pub fn open(root: &Path) -> Result<Self> {
        let pos_re = Regex::new(POS_RE).expect("position regex");
        let tiff_re = Regex::new(TIFF_RE).expect("tiff regex");

        let mut positions: Vec<(u32, PathBuf)> = Vec::new();
        for entry in fs::read_dir(root).map_err(|e| PipelineError::io(root, e))? {
            let entry = entry.map_err(|e| PipelineError::io(root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(cap) = pos_re.captures(&name.to_string_lossy()) {
                let pos: u32 = cap[1]
                    .parse()
                    .map_err(|_| PipelineError::Format(format!("bad position dir {:?}", name)))?;
                positions.push((pos, entry.path()));
            }
        }
        if positions.is_empty() {
            return Err(PipelineError::Format(format!(
                "no Pos* directories under {}",
                root.display()
            )));
        }
        positions.sort_by_key(|(p, _)| *p);

        let mut frames: Vec<HashMap<(usize, usize), PathBuf>> = Vec::new();
        let mut n_frames = 0usize;
        let mut n_channels = 0usize;
        for (pos, dir) in &positions {
            let mut index = HashMap::new();
            for entry in fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
                let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let cap = match tiff_re.captures(&name) {
                    Some(c) => c,
                    None => continue,
                };
                let c: usize = cap[1].parse().unwrap_or(0);
                let file_pos: u32 = cap[2].parse().unwrap_or(0);
                let t: usize = cap[3].parse().unwrap_or(0);
                let z: usize = cap[4].parse().unwrap_or(0);
                if file_pos != *pos || z != 0 {
                    continue;
                }
                n_frames = n_frames.max(t + 1);
                n_channels = n_channels.max(c + 1);
                index.insert((c, t), entry.path());
            }
            if index.is_empty() {
                return Err(PipelineError::Format(format!(
                    "no frames found under {}",
                    dir.display()
                )));
            }
            frames.push(index);
        }

        let first = frames[0]
            .get(&(0, 0))
            .ok_or_else(|| PipelineError::Format("missing frame (ch 0, t 0)".to_string()))?;
        let (_, width, height) = decode_tiff(first)?;

        let meta = SourceMetadata {
            n_fovs: positions.len(),
            n_frames,
            n_channels,
            height,
            width,
            channel_names: (0..n_channels).map(|c| format!("ch{}", c)).collect(),
            time_units: "min".to_string(),
            time_points: None,
        };
        Ok(TiffFolderReader {
            positions: positions.into_iter().map(|(p, _)| p).collect(),
            frames,
            meta,
        })
    }

    pub fn position_id(&self, fov: usize) -> Option<u32> {
        self.positions.get(fov).copied()
    }
}

impl MicroscopyReader for TiffFolderReader {
    fn metadata(&self) -> &SourceMetadata {
        &self.meta
    }

    fn read_frame(&mut self, fov: usize, t: usize, channel: usize) -> Result<Vec<u16>> {
        let index = self.frames.get(fov).ok_or_else(|| {
            PipelineError::Format(format!("fov {} out of range", fov))
        })?;
        let path = index.get(&(channel, t)).ok_or_else(|| {
            PipelineError::Format(format!(
                "missing TIFF for (fov {}, t {}, ch {})",
                fov, t, channel
            ))
        })?;
        let (pixels, width, height) = decode_tiff(path)?;
        if width != self.meta.width || height != self.meta.height {
            return Err(PipelineError::Format(format!(
                "{}: {}x{} does not match source {}x{}",
                path.display(),
                width,
                height,
                self.meta.width,
                self.meta.height
            )));
        }
        Ok(pixels)
    }
}

/// Decode a grayscale TIFF as u16 (u8 planes widened). Returns (pixels, w, h).
fn decode_tiff(path: &Path) -> Result<(Vec<u16>, usize, usize)> {
    let file = fs::File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let mut decoder = tiff::decoder::Decoder::new(file)
        .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
    let (width, height) = decoder
        .dimensions()
        .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
    let image = decoder
        .read_image()
        .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
    let pixels = match image {
        tiff::decoder::DecodingResult::U16(v) => v,
        tiff::decoder::DecodingResult::U8(v) => v.into_iter().map(u16::from).collect(),
        _ => {
            return Err(PipelineError::Format(format!(
                "{}: unsupported TIFF pixel format (need u8 or u16)",
                path.display()
            )))
        }
    };
    Ok((pixels, width as usize, height as usize))
}
