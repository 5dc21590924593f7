//! Memory-mapped segment realization.
//!
//! The segment file is mapped read-write; appends write straight into the
//! mapping and `force` flushes it. The OS page cache backs reads.

use super::{
    decode_header, encode_header, scan_data_end, Mode, Segment, SegmentMeta, DATA_START_POSITION,
    HEADER_SIZE, STORAGE_VERSION,
};
use crate::error::{Error, Result};
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::OpenOptions;
use std::path::Path;

/// A segment backed by a read-write memory mapping.
pub struct MappedSegment {
    meta: SegmentMeta,
    mmap: RwLock<MmapMut>,
}

impl MappedSegment {
    /// Creates a fresh segment file of `initial_size` bytes and maps it.
    pub fn create(seg_id: u16, path: &Path, initial_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(initial_size)?;

        // SAFETY: the file stays the same length for the mapping's lifetime
        // and is only accessed through this segment.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let now = super::current_time_millis();
        mmap[..HEADER_SIZE].copy_from_slice(&encode_header(now, STORAGE_VERSION));
        mmap.flush()?;

        Ok(Self {
            meta: SegmentMeta::new(
                seg_id,
                initial_size,
                Mode::ReadWrite,
                DATA_START_POSITION,
                now,
                STORAGE_VERSION,
            ),
            mmap: RwLock::new(mmap),
        })
    }

    /// Opens and maps an existing segment file.
    pub fn open(seg_id: u16, path: &Path, initial_size: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len != initial_size {
            return Err(Error::internal(format!(
                "segment file {} is {} bytes, expected {}",
                path.display(),
                file_len,
                initial_size
            )));
        }

        // SAFETY: as in `create`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&mmap[..HEADER_SIZE]);
        let (last_forced, version) = decode_header(&header);

        let segment = Self {
            meta: SegmentMeta::new(
                seg_id,
                initial_size,
                Mode::ReadWrite,
                DATA_START_POSITION,
                last_forced,
                version,
            ),
            mmap: RwLock::new(mmap),
        };
        let data_end = scan_data_end(&segment)?;
        segment.set_append_position(data_end);
        Ok(segment)
    }
}

impl Segment for MappedSegment {
    fn seg_id(&self) -> u16 {
        self.meta.seg_id()
    }

    fn mode(&self) -> Mode {
        self.meta.mode()
    }

    fn append(&self, data: &[u8]) -> Result<u32> {
        let mut mmap = self.mmap.write();
        let pos = self.meta.reserve(data.len())?;
        let start = pos as usize;
        mmap[start..start + 4].copy_from_slice(&(data.len() as u32).to_be_bytes());
        mmap[start + 4..start + 4 + data.len()].copy_from_slice(data);
        Ok(pos)
    }

    fn read_at(&self, offset: u32, dst: &mut [u8]) -> Result<()> {
        let end = offset as u64 + dst.len() as u64;
        if end > self.meta.initial_size() {
            return Err(Error::internal(format!(
                "read at {} of {} bytes runs past segment capacity",
                offset,
                dst.len()
            )));
        }
        let mmap = self.mmap.read();
        dst.copy_from_slice(&mmap[offset as usize..end as usize]);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        let mut mmap = self.mmap.write();
        let now = self.meta.touch_forced();
        mmap[..HEADER_SIZE].copy_from_slice(&encode_header(now, self.meta.storage_version()));
        mmap.flush()?;
        Ok(())
    }

    fn as_read_only(&self) -> Result<()> {
        if self.meta.mode() == Mode::ReadOnly {
            return Ok(());
        }
        self.force()?;
        self.meta.seal();
        Ok(())
    }

    fn free(&self) -> Result<()> {
        Ok(())
    }

    fn append_position(&self) -> u32 {
        self.meta.append_position()
    }

    fn set_append_position(&self, pos: u32) {
        self.meta.set_append_position(pos);
    }

    fn load_size(&self) -> u64 {
        self.meta.load_size()
    }

    fn initial_size(&self) -> u64 {
        self.meta.initial_size()
    }

    fn last_forced_time(&self) -> u64 {
        self.meta.last_forced_time()
    }

    fn storage_version(&self) -> u64 {
        self.meta.storage_version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let seg = MappedSegment::create(0, &dir.path().join("0.seg"), 1024).unwrap();

        let pos = seg.append(b"mapped bytes").unwrap();
        assert_eq!(seg.read_record(pos).unwrap(), b"mapped bytes");
    }

    #[test]
    fn test_force_then_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("2.seg");

        {
            let seg = MappedSegment::create(2, &path, 1024).unwrap();
            seg.append(b"first").unwrap();
            seg.append(b"second").unwrap();
            seg.force().unwrap();
        }

        let seg = MappedSegment::open(2, &path, 1024).unwrap();
        assert_eq!(seg.read_record(DATA_START_POSITION).unwrap(), b"first");
        assert_eq!(seg.append_position(), DATA_START_POSITION + 9 + 10);
    }

    #[test]
    fn test_overflow() {
        let dir = TempDir::new().unwrap();
        let seg = MappedSegment::create(0, &dir.path().join("0.seg"), 64).unwrap();

        seg.append(&[0xAB; 20]).unwrap();
        assert!(matches!(seg.append(&[0xCD; 20]), Err(Error::SegmentOverflow)));
    }
}
