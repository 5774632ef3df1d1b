use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{ForgeError, Result};

pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Raw positional access to a device, an image or a synthesized view.
///
/// This is the only way bytes enter the crate. Reads are all-or-nothing: a read that
/// crosses the end of the device fails with [`ForgeError::OutOfBounds`] instead of
/// returning a short buffer.
pub trait SectorReader: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Total addressable length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    fn read_sectors(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl<R: SectorReader + ?Sized> SectorReader for Box<R> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }

    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }
}

pub(crate) fn check_bounds(offset: u64, length: usize, device_len: u64) -> Result<()> {
    let end = offset.checked_add(length as u64);
    match end {
        Some(end) if end <= device_len => Ok(()),
        _ => Err(ForgeError::OutOfBounds {
            offset,
            length,
            device_len,
        }),
    }
}

/// A raw device (`\\.\PhysicalDrive0`, `\\.\C:`, `/dev/sda`) or an image file.
///
/// Raw Windows devices only accept sector-aligned transfers, so every read is widened
/// to sector boundaries and the requested slice is copied out.
pub struct FileReader {
    file: File,
    path: PathBuf,
    len: u64,
    sector_size: u32,
}

impl FileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let mut len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            // block devices report a zero metadata length
            len = file.seek(SeekFrom::End(0)).unwrap_or(0);
        }
        if len == 0 {
            debug!("length of {} is unknown, reads are not bounds checked", path.display());
            len = u64::MAX;
        }
        Ok(Self {
            file,
            path,
            len,
            sector_size: DEFAULT_SECTOR_SIZE,
        })
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        if sector_size.is_power_of_two() && sector_size >= DEFAULT_SECTOR_SIZE {
            self.sector_size = sector_size;
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SectorReader for FileReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        check_bounds(offset, buf.len(), self.len)?;

        let sector = self.sector_size as u64;
        let aligned_start = offset - offset % sector;
        let end = offset + buf.len() as u64;
        let aligned_end = end.div_ceil(sector) * sector;

        if aligned_start == offset && aligned_end == end {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(buf)?;
            return Ok(());
        }

        let mut scratch = vec![0u8; (aligned_end - aligned_start) as usize];
        self.file.seek(SeekFrom::Start(aligned_start))?;
        // the widened tail of an image file may run past its end
        let available = self.len.saturating_sub(aligned_start).min(scratch.len() as u64) as usize;
        self.file.read_exact(&mut scratch[..available])?;
        let skip = (offset - aligned_start) as usize;
        buf.copy_from_slice(&scratch[skip..skip + buf.len()]);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}

/// An in-memory image.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    data: Vec<u8>,
}

impl MemoryReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl SectorReader for MemoryReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A bounded byte window of an inner reader; how a partition becomes a volume.
pub struct WindowReader<R> {
    inner: R,
    base: u64,
    len: u64,
}

impl<R: SectorReader> WindowReader<R> {
    pub fn new(inner: R, base: u64, len: u64) -> Result<Self> {
        check_bounds(base, 0, inner.len())?;
        let available = inner.len() - base;
        if len > available {
            return Err(ForgeError::OutOfBounds {
                offset: base,
                length: usize::try_from(len).unwrap_or(usize::MAX),
                device_len: inner.len(),
            });
        }
        Ok(Self { inner, base, len })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: SectorReader> SectorReader for WindowReader<R> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.len)?;
        self.inner.read_at(self.base + offset, buf)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_reads_past_end_fail() {
        let mut reader = MemoryReader::new(vec![7u8; 1024]);
        assert_eq!(reader.read_sectors(512, 512).unwrap(), vec![7u8; 512]);
        let err = reader.read_sectors(1000, 100).unwrap_err();
        assert!(matches!(err, ForgeError::OutOfBounds { offset: 1000, .. }));
    }

    #[test]
    fn window_translates_offsets() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let mut window = WindowReader::new(MemoryReader::new(data), 1024, 2048).unwrap();
        let bytes = window.read_sectors(0, 4).unwrap();
        assert_eq!(bytes, vec![0, 1, 2, 3]);
        assert!(window.read_sectors(2046, 4).is_err());
        assert!(WindowReader::new(MemoryReader::new(vec![0; 100]), 50, 60).is_err());
    }

    #[test]
    fn file_reader_handles_unaligned_reads() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut reader = FileReader::open(tmp.path()).unwrap();
        assert_eq!(reader.len(), 2000);
        let bytes = reader.read_sectors(1990, 10).unwrap();
        assert_eq!(bytes, data[1990..2000].to_vec());
        let bytes = reader.read_sectors(300, 700).unwrap();
        assert_eq!(bytes, data[300..1000].to_vec());
        assert!(reader.read_sectors(1995, 10).is_err());
    }
}
