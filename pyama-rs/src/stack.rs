//! On-disk `(T, H, W)` stacks: a 32-byte header followed by raw little-endian
//! planes, written through a temp file and atomically renamed on commit, read
//! back through a read-only memory map. A committed stack is complete by
//! construction; the scheduler uses bare existence as its resume marker.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::error::{PipelineError, Result};

pub const STACK_MAGIC: [u8; 8] = *b"PMAST1\0\0";
pub const HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    U16,
    Bool,
    F32,
    U16Label,
}

impl Dtype {
    pub fn tag(self) -> u8 {
        match self {
            Dtype::U16 => 1,
            Dtype::Bool => 2,
            Dtype::F32 => 3,
            Dtype::U16Label => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Dtype::U16),
            2 => Some(Dtype::Bool),
            3 => Some(Dtype::F32),
            4 => Some(Dtype::U16Label),
            _ => None,
        }
    }

    /// Bytes per pixel.
    pub fn size(self) -> usize {
        match self {
            Dtype::U16 | Dtype::U16Label => 2,
            Dtype::Bool => 1,
            Dtype::F32 => 4,
        }
    }
}

/// Stack kinds, in pipeline production order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Pc,
    Fl,
    Seg,
    FlBackground,
    SegLabeled,
}

impl StackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StackKind::Pc => "pc",
            StackKind::Fl => "fl",
            StackKind::Seg => "seg",
            StackKind::FlBackground => "fl_background",
            StackKind::SegLabeled => "seg_labeled",
        }
    }

    pub fn dtype(self) -> Dtype {
        match self {
            StackKind::Pc | StackKind::Fl => Dtype::U16,
            StackKind::Seg => Dtype::Bool,
            StackKind::FlBackground => Dtype::F32,
            StackKind::SegLabeled => Dtype::U16Label,
        }
    }
}

pub fn fov_dir(output_dir: &Path, fov: usize) -> PathBuf {
    output_dir.join(format!("fov_{:03}", fov))
}

pub fn stack_filename(basename: &str, fov: usize, kind: StackKind, channel: usize) -> String {
    format!(
        "{}_fov_{:03}_{}_ch_{}.stack",
        basename,
        fov,
        kind.as_str(),
        channel
    )
}

pub fn stack_path(
    output_dir: &Path,
    basename: &str,
    fov: usize,
    kind: StackKind,
    channel: usize,
) -> PathBuf {
    fov_dir(output_dir, fov).join(stack_filename(basename, fov, kind, channel))
}

pub fn traces_csv_path(output_dir: &Path, basename: &str, fov: usize) -> PathBuf {
    fov_dir(output_dir, fov).join(format!("{}_fov_{:03}_traces.csv", basename, fov))
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Exclusive writer for a new stack. Frames are written into a `.tmp`
/// sibling; `commit` flushes and renames. Dropping an uncommitted writer
/// destroys the temp file, so a partial stack never appears under the final
/// path.
#[derive(Debug)]
pub struct StackWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    mmap: MmapMut,
    dtype: Dtype,
    t: usize,
    h: usize,
    w: usize,
    committed: bool,
}

impl StackWriter {
    pub fn create(path: &Path, dtype: Dtype, t: usize, h: usize, w: usize) -> Result<Self> {
        if path.exists() {
            return Err(PipelineError::io(
                path,
                std::io::Error::new(ErrorKind::AlreadyExists, "stack already committed"),
            ));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let tmp_path = tmp_path_for(path);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| PipelineError::io(&tmp_path, e))?;
        let len = HEADER_LEN + t * h * w * dtype.size();
        file.set_len(len as u64)
            .map_err(|e| PipelineError::io(&tmp_path, e))?;
        let mut mmap =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| PipelineError::io(&tmp_path, e))?;

        let mut header = [0u8; HEADER_LEN];
        header[..8].copy_from_slice(&STACK_MAGIC);
        header[8] = dtype.tag();
        header[9] = 3; // rank
        header[12..16].copy_from_slice(&(t as u32).to_le_bytes());
        header[16..20].copy_from_slice(&(h as u32).to_le_bytes());
        header[20..24].copy_from_slice(&(w as u32).to_le_bytes());
        mmap[..HEADER_LEN].copy_from_slice(&header);

        Ok(StackWriter {
            path: path.to_path_buf(),
            tmp_path,
            mmap,
            dtype,
            t,
            h,
            w,
            committed: false,
        })
    }

    fn plane_slice(&mut self, t: usize, expect: Dtype) -> Result<&mut [u8]> {
        if self.dtype != expect {
            return Err(PipelineError::DimensionMismatch(format!(
                "stack {} holds {:?}, frame written as {:?}",
                self.path.display(),
                self.dtype,
                expect
            )));
        }
        if t >= self.t {
            return Err(PipelineError::DimensionMismatch(format!(
                "frame {} out of range (T = {})",
                t, self.t
            )));
        }
        let plane = self.h * self.w * self.dtype.size();
        let off = HEADER_LEN + t * plane;
        Ok(&mut self.mmap[off..off + plane])
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.h * self.w {
            return Err(PipelineError::DimensionMismatch(format!(
                "plane has {} pixels, stack expects {}",
                len,
                self.h * self.w
            )));
        }
        Ok(())
    }

    pub fn put_frame_u16(&mut self, t: usize, plane: &[u16]) -> Result<()> {
        self.check_len(plane.len())?;
        let expect = if self.dtype == Dtype::U16Label {
            Dtype::U16Label
        } else {
            Dtype::U16
        };
        let dst = self.plane_slice(t, expect)?;
        for (d, v) in dst.chunks_exact_mut(2).zip(plane) {
            d.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    pub fn put_frame_bool(&mut self, t: usize, plane: &[bool]) -> Result<()> {
        self.check_len(plane.len())?;
        let dst = self.plane_slice(t, Dtype::Bool)?;
        for (d, v) in dst.iter_mut().zip(plane) {
            *d = u8::from(*v);
        }
        Ok(())
    }

    pub fn put_frame_f32(&mut self, t: usize, plane: &[f32]) -> Result<()> {
        self.check_len(plane.len())?;
        let dst = self.plane_slice(t, Dtype::F32)?;
        for (d, v) in dst.chunks_exact_mut(4).zip(plane) {
            d.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    /// Flush and atomically publish under the final path.
    pub fn commit(mut self) -> Result<StackRef> {
        self.mmap
            .flush()
            .map_err(|e| PipelineError::io(&self.tmp_path, e))?;
        fs::rename(&self.tmp_path, &self.path).map_err(|e| PipelineError::io(&self.path, e))?;
        self.committed = true;
        StackRef::open(&self.path)
    }
}

impl Drop for StackWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Read-only, memory-mapped view of a committed stack.
#[derive(Debug)]
pub struct StackRef {
    path: PathBuf,
    mmap: Mmap,
    dtype: Dtype,
    t: usize,
    h: usize,
    w: usize,
}

impl StackRef {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).map_err(|e| PipelineError::io(path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| PipelineError::io(path, e))?;
        if mmap.len() < HEADER_LEN || mmap[..8] != STACK_MAGIC {
            return Err(PipelineError::Format(format!(
                "{} is not a stack file",
                path.display()
            )));
        }
        let dtype = Dtype::from_tag(mmap[8]).ok_or_else(|| {
            PipelineError::Format(format!("{}: unknown dtype tag {}", path.display(), mmap[8]))
        })?;
        if mmap[9] != 3 {
            return Err(PipelineError::Format(format!(
                "{}: unsupported rank {}",
                path.display(),
                mmap[9]
            )));
        }
        let t = u32::from_le_bytes(mmap[12..16].try_into().unwrap()) as usize;
        let h = u32::from_le_bytes(mmap[16..20].try_into().unwrap()) as usize;
        let w = u32::from_le_bytes(mmap[20..24].try_into().unwrap()) as usize;
        let expect = HEADER_LEN + t * h * w * dtype.size();
        if mmap.len() != expect {
            return Err(PipelineError::DimensionMismatch(format!(
                "{}: file is {} bytes, header implies {}",
                path.display(),
                mmap.len(),
                expect
            )));
        }
        Ok(StackRef {
            path: path.to_path_buf(),
            mmap,
            dtype,
            t,
            h,
            w,
        })
    }

    /// Open and verify dtype and shape against expectations; used by the
    /// resume checks before a stage output is reused.
    pub fn open_expected(
        path: &Path,
        dtype: Dtype,
        t: usize,
        h: usize,
        w: usize,
    ) -> Result<Self> {
        let stack = Self::open(path)?;
        if stack.dtype != dtype || (stack.t, stack.h, stack.w) != (t, h, w) {
            return Err(PipelineError::DimensionMismatch(format!(
                "{}: found {:?} ({}, {}, {}), expected {:?} ({}, {}, {})",
                path.display(),
                stack.dtype,
                stack.t,
                stack.h,
                stack.w,
                dtype,
                t,
                h,
                w
            )));
        }
        Ok(stack)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.t, self.h, self.w)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn raw(&self, t0: usize, t1: usize) -> Result<&[u8]> {
        if t0 > t1 || t1 > self.t {
            return Err(PipelineError::DimensionMismatch(format!(
                "frame range {}..{} out of range (T = {})",
                t0, t1, self.t
            )));
        }
        let plane = self.h * self.w * self.dtype.size();
        Ok(&self.mmap[HEADER_LEN + t0 * plane..HEADER_LEN + t1 * plane])
    }

    /// Raw little-endian bytes of frames `t0..t1`.
    pub fn range_bytes(&self, t0: usize, t1: usize) -> Result<&[u8]> {
        self.raw(t0, t1)
    }

    pub fn frame_u16(&self, t: usize) -> Result<Vec<u16>> {
        if self.dtype != Dtype::U16 && self.dtype != Dtype::U16Label {
            return Err(PipelineError::DimensionMismatch(format!(
                "{} holds {:?}, read as u16",
                self.path.display(),
                self.dtype
            )));
        }
        let raw = self.raw(t, t + 1)?;
        Ok(raw
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect())
    }

    pub fn frame_bool(&self, t: usize) -> Result<Vec<bool>> {
        if self.dtype != Dtype::Bool {
            return Err(PipelineError::DimensionMismatch(format!(
                "{} holds {:?}, read as bool",
                self.path.display(),
                self.dtype
            )));
        }
        let raw = self.raw(t, t + 1)?;
        Ok(raw.iter().map(|&b| b != 0).collect())
    }

    pub fn frame_f32(&self, t: usize) -> Result<Vec<f32>> {
        if self.dtype != Dtype::F32 {
            return Err(PipelineError::DimensionMismatch(format!(
                "{} holds {:?}, read as f32",
                self.path.display(),
                self.dtype
            )));
        }
        let raw = self.raw(t, t + 1)?;
        Ok(raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

/// Shape check between two stacks feeding the same stage.
pub fn check_same_shape(a: &StackRef, b: &StackRef) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(PipelineError::DimensionMismatch(format!(
            "{} is {:?} but {} is {:?}",
            a.path().display(),
            a.shape(),
            b.path().display(),
            b.shape()
        )));
    }
    Ok(())
}

/// Write a text file through a temp sibling and rename into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let tmp = tmp_path_for(path);
    let mut file = fs::File::create(&tmp).map_err(|e| PipelineError::io(&tmp, e))?;
    file.write_all(contents)
        .map_err(|e| PipelineError::io(&tmp, e))?;
    file.sync_all().map_err(|e| PipelineError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_u16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.stack");
        let mut w = StackWriter::create(&path, Dtype::U16, 2, 2, 3).unwrap();
        w.put_frame_u16(0, &[1, 2, 3, 4, 5, 6]).unwrap();
        w.put_frame_u16(1, &[7, 8, 9, 10, 11, 12]).unwrap();
        let r = w.commit().unwrap();
        assert_eq!(r.shape(), (2, 2, 3));
        assert_eq!(r.dtype(), Dtype::U16);
        assert_eq!(r.frame_u16(0).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(r.frame_u16(1).unwrap(), vec![7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn roundtrip_bool_and_f32() {
        let dir = tempfile::tempdir().unwrap();
        let pb = dir.path().join("b.stack");
        let mut w = StackWriter::create(&pb, Dtype::Bool, 1, 1, 4).unwrap();
        w.put_frame_bool(0, &[true, false, false, true]).unwrap();
        let r = w.commit().unwrap();
        assert_eq!(r.frame_bool(0).unwrap(), vec![true, false, false, true]);

        let pf = dir.path().join("c.stack");
        let mut w = StackWriter::create(&pf, Dtype::F32, 1, 2, 2).unwrap();
        w.put_frame_f32(0, &[0.5, -1.0, 3.25, 65535.0]).unwrap();
        let r = w.commit().unwrap();
        assert_eq!(r.frame_f32(0).unwrap(), vec![0.5, -1.0, 3.25, 65535.0]);
    }

    #[test]
    fn uncommitted_writer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.stack");
        {
            let mut w = StackWriter::create(&path, Dtype::U16, 1, 1, 1).unwrap();
            w.put_frame_u16(0, &[42]).unwrap();
            // dropped without commit
        }
        assert!(!path.exists());
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn create_over_committed_stack_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.stack");
        let mut w = StackWriter::create(&path, Dtype::U16, 1, 1, 1).unwrap();
        w.put_frame_u16(0, &[1]).unwrap();
        w.commit().unwrap();
        let err = StackWriter::create(&path, Dtype::U16, 1, 1, 1).unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn open_expected_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.stack");
        let mut w = StackWriter::create(&path, Dtype::Bool, 2, 4, 4).unwrap();
        w.put_frame_bool(0, &[false; 16]).unwrap();
        w.put_frame_bool(1, &[false; 16]).unwrap();
        w.commit().unwrap();
        assert!(StackRef::open_expected(&path, Dtype::Bool, 2, 4, 4).is_ok());
        let err = StackRef::open_expected(&path, Dtype::U16, 2, 4, 4).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
        let err = StackRef::open_expected(&path, Dtype::Bool, 3, 4, 4).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[test]
    fn bad_plane_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.stack");
        let mut w = StackWriter::create(&path, Dtype::U16, 1, 2, 2).unwrap();
        assert!(w.put_frame_u16(0, &[1, 2, 3]).is_err());
        assert!(w.put_frame_u16(1, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn naming_scheme() {
        assert_eq!(
            stack_filename("exp", 7, StackKind::FlBackground, 2),
            "exp_fov_007_fl_background_ch_2.stack"
        );
        assert_eq!(
            stack_filename("exp", 0, StackKind::Pc, 0),
            "exp_fov_000_pc_ch_0.stack"
        );
    }
}
