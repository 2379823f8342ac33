//! Sector-aligned block reads.
//!
//! Disk-resident code databases are read in whole sectors: every request's file offset,
//! length and destination buffer must be multiples of [`SECTOR_LEN`]. A batch of requests
//! is served either one after the other or spread over the rayon pool.
//!
//! ```
//! use quantscan::io::{AlignedBuffer, AlignedFileReader, AlignedRead, MemoryAlignedReader, SECTOR_LEN};
//!
//! let data: Vec<u8> = (0..4 * SECTOR_LEN).map(|i| (i / SECTOR_LEN) as u8).collect();
//! let reader = MemoryAlignedReader::new(data);
//! let mut buf = AlignedBuffer::zeroed(SECTOR_LEN);
//! let mut reqs = [AlignedRead::new(2 * SECTOR_LEN as u64, SECTOR_LEN, &mut buf)?];
//! reader.read(&mut reqs, false)?;
//! assert!(buf.iter().all(|&b| b == 2));
//! # Ok::<(), quantscan::QuantError>(())
//! ```

use std::fmt;
use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use rayon::prelude::*;

use crate::error::{QuantError, Result};

/// Sector size; offsets, lengths and buffers of every read are multiples of it.
pub const SECTOR_LEN: usize = 512;

#[derive(Clone, Copy)]
#[repr(C, align(512))]
struct Sector([u8; SECTOR_LEN]);

/// Heap storage starting on a sector boundary.
#[derive(Clone, Default)]
pub struct AlignedBuffer {
    sectors: Vec<Sector>,
    len: usize,
}

impl AlignedBuffer {
    /// `len` zero bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            sectors: vec![Sector([0; SECTOR_LEN]); len.div_ceil(SECTOR_LEN)],
            len,
        }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `sectors` holds at least `len` initialized bytes and `Sector` has no padding.
        unsafe { std::slice::from_raw_parts(self.sectors.as_ptr().cast::<u8>(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.sectors.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer").field("len", &self.len).finish()
    }
}

#[inline]
fn is_sector_aligned(x: u64) -> bool {
    x % SECTOR_LEN as u64 == 0
}

/// One read request: `len` bytes at file `offset` into `buf`.
#[derive(Debug)]
pub struct AlignedRead<'a> {
    offset: u64,
    len: usize,
    buf: &'a mut [u8],
}

impl<'a> AlignedRead<'a> {
    /// Validate and build a request; `buf` must hold at least `len` bytes.
    pub fn new(offset: u64, len: usize, buf: &'a mut [u8]) -> Result<Self> {
        if !is_sector_aligned(offset) {
            return Err(QuantError::Alignment(format!(
                "read offset {offset} is not a multiple of {SECTOR_LEN}"
            )));
        }
        if !is_sector_aligned(len as u64) {
            return Err(QuantError::Alignment(format!(
                "read length {len} is not a multiple of {SECTOR_LEN}"
            )));
        }
        if !is_sector_aligned(buf.as_ptr() as u64) {
            return Err(QuantError::Alignment(format!(
                "read buffer is not {SECTOR_LEN}-byte aligned"
            )));
        }
        if buf.len() < len {
            return Err(QuantError::InvalidInput(format!(
                "read buffer holds {} bytes, {len} requested",
                buf.len()
            )));
        }
        Ok(Self { offset, len, buf })
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Destination bytes.
    #[must_use]
    pub fn buf(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn dest(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

/// Source of sector-aligned block reads.
pub trait AlignedFileReader: Send + Sync {
    /// Attach to `path`. Blocking.
    fn open(&mut self, path: &Path) -> Result<()>;

    /// Release the source. Blocking.
    fn close(&mut self) -> Result<()>;

    /// Serve every request; with `async_io` requests run in parallel. Returns once all
    /// requests completed or one failed.
    fn read(&self, reqs: &mut [AlignedRead<'_>], async_io: bool) -> Result<()>;
}

fn serve<F>(reqs: &mut [AlignedRead<'_>], async_io: bool, f: F) -> Result<()>
where
    F: Fn(&mut AlignedRead<'_>) -> Result<()> + Send + Sync,
{
    if async_io {
        reqs.par_iter_mut().try_for_each(f)
    } else {
        reqs.iter_mut().try_for_each(f)
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        done += n;
    }
    Ok(())
}

/// Positional reads on a file.
#[derive(Debug, Default)]
pub struct FileAlignedReader {
    file: Option<File>,
}

impl FileAlignedReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reader already attached to `path`.
    pub fn open_path(path: &Path) -> Result<Self> {
        let mut r = Self::new();
        r.open(path)?;
        Ok(r)
    }
}

impl AlignedFileReader for FileAlignedReader {
    fn open(&mut self, path: &Path) -> Result<()> {
        self.file = Some(File::open(path)?);
        log::debug!("opened {} for aligned reads", path.display());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn read(&self, reqs: &mut [AlignedRead<'_>], async_io: bool) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| QuantError::Io("reader is not open".into()))?;
        serve(reqs, async_io, |r| {
            let offset = r.offset;
            read_at(file, r.dest(), offset).map_err(QuantError::from)
        })
    }
}

/// Reads served from an in-memory image.
#[derive(Debug, Clone, Default)]
pub struct MemoryAlignedReader {
    data: Option<Vec<u8>>,
}

impl MemoryAlignedReader {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: Some(data) }
    }
}

impl AlignedFileReader for MemoryAlignedReader {
    fn open(&mut self, path: &Path) -> Result<()> {
        self.data = Some(std::fs::read(path)?);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.data = None;
        Ok(())
    }

    fn read(&self, reqs: &mut [AlignedRead<'_>], async_io: bool) -> Result<()> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| QuantError::Io("reader is not open".into()))?;
        serve(reqs, async_io, |r| {
            let start = usize::try_from(r.offset)
                .map_err(|_| QuantError::Io(format!("offset {} out of range", r.offset)))?;
            let src = data.get(start..start + r.len).ok_or_else(|| {
                QuantError::Io(format!(
                    "read of {} bytes at {start} past end of {}-byte image",
                    r.len,
                    data.len()
                ))
            })?;
            r.dest().copy_from_slice(src);
            Ok(())
        })
    }
}
