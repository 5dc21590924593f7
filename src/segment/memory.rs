//! Memory-backed segment realization.
//!
//! The whole segment is mirrored in a heap buffer. Appends touch only the
//! buffer; `force` writes the not-yet-flushed span back to the file and
//! fsyncs. Reads never touch the disk.

use super::{
    decode_header, encode_header, scan_data_end, Mode, Segment, SegmentMeta, DATA_START_POSITION,
    HEADER_SIZE, STORAGE_VERSION,
};
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

/// A segment mirrored entirely in a heap buffer.
pub struct MemorySegment {
    meta: SegmentMeta,
    buf: RwLock<Box<[u8]>>,
    file: Mutex<File>,
    flushed_pos: AtomicU32,
}

impl MemorySegment {
    /// Creates a fresh segment file of `initial_size` bytes.
    pub fn create(seg_id: u16, path: &Path, initial_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(initial_size)?;

        let now = super::current_time_millis();
        let header = encode_header(now, STORAGE_VERSION);
        let mut buf = vec![0u8; initial_size as usize].into_boxed_slice();
        buf[..HEADER_SIZE].copy_from_slice(&header);

        let mut f = &file;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&header)?;
        file.sync_all()?;

        Ok(Self {
            meta: SegmentMeta::new(
                seg_id,
                initial_size,
                Mode::ReadWrite,
                DATA_START_POSITION,
                now,
                STORAGE_VERSION,
            ),
            buf: RwLock::new(buf),
            file: Mutex::new(file),
            flushed_pos: AtomicU32::new(DATA_START_POSITION),
        })
    }

    /// Opens an existing segment file, loading its contents into memory.
    ///
    /// The append position is left at the data start; the manager derives
    /// the real position by scanning and calls `set_append_position`.
    pub fn open(seg_id: u16, path: &Path, initial_size: u64) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len != initial_size {
            return Err(Error::internal(format!(
                "segment file {} is {} bytes, expected {}",
                path.display(),
                file_len,
                initial_size
            )));
        }

        let mut buf = vec![0u8; initial_size as usize].into_boxed_slice();
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&buf[..HEADER_SIZE]);
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
            buf: RwLock::new(buf),
            file: Mutex::new(file),
            flushed_pos: AtomicU32::new(DATA_START_POSITION),
        };
        let data_end = scan_data_end(&segment)?;
        segment.set_append_position(data_end);
        Ok(segment)
    }
}

impl Segment for MemorySegment {
    fn seg_id(&self) -> u16 {
        self.meta.seg_id()
    }

    fn mode(&self) -> Mode {
        self.meta.mode()
    }

    fn append(&self, data: &[u8]) -> Result<u32> {
        let mut buf = self.buf.write();
        let pos = self.meta.reserve(data.len())?;
        let start = pos as usize;
        buf[start..start + 4].copy_from_slice(&(data.len() as u32).to_be_bytes());
        buf[start + 4..start + 4 + data.len()].copy_from_slice(data);
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
        let buf = self.buf.read();
        dst.copy_from_slice(&buf[offset as usize..end as usize]);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        let mut buf = self.buf.write();
        let now = self.meta.touch_forced();
        buf[..HEADER_SIZE].copy_from_slice(&encode_header(now, self.meta.storage_version()));

        let flushed = self.flushed_pos.load(Ordering::Acquire);
        let append = self.meta.append_position();

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf[..HEADER_SIZE])?;
        if append > flushed {
            file.seek(SeekFrom::Start(flushed as u64))?;
            file.write_all(&buf[flushed as usize..append as usize])?;
        }
        file.sync_all()?;
        self.flushed_pos.store(append, Ordering::Release);
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
        self.flushed_pos.store(pos, Ordering::Release);
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
        let seg = MemorySegment::create(0, &dir.path().join("0.seg"), 1024).unwrap();

        let pos = seg.append(b"hello").unwrap();
        assert_eq!(pos, DATA_START_POSITION);
        assert_eq!(seg.read_record(pos).unwrap(), b"hello");
        assert_eq!(seg.load_size(), 9);
    }

    #[test]
    fn test_overflow() {
        let dir = TempDir::new().unwrap();
        let seg = MemorySegment::create(0, &dir.path().join("0.seg"), 64).unwrap();

        seg.append(&[0xAB; 20]).unwrap();
        assert!(matches!(seg.append(&[0xCD; 20]), Err(Error::SegmentOverflow)));
    }

    #[test]
    fn test_seal_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let seg = MemorySegment::create(0, &dir.path().join("0.seg"), 1024).unwrap();

        seg.append(b"x").unwrap();
        seg.as_read_only().unwrap();
        assert_eq!(seg.mode(), Mode::ReadOnly);
        assert!(matches!(seg.append(b"y"), Err(Error::SegmentReadOnly)));
    }

    #[test]
    fn test_force_then_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3.seg");

        let first_forced;
        {
            let seg = MemorySegment::create(3, &path, 1024).unwrap();
            seg.append(b"one").unwrap();
            seg.append(b"two-longer").unwrap();
            seg.force().unwrap();
            first_forced = seg.last_forced_time();
        }

        let seg = MemorySegment::open(3, &path, 1024).unwrap();
        assert_eq!(seg.seg_id(), 3);
        assert_eq!(seg.storage_version(), STORAGE_VERSION);
        assert_eq!(seg.last_forced_time(), first_forced);
        assert_eq!(seg.read_record(DATA_START_POSITION).unwrap(), b"one");
        assert_eq!(seg.read_record(DATA_START_POSITION + 7).unwrap(), b"two-longer");
        // Scan recovered the append position past both records.
        assert_eq!(seg.append_position(), DATA_START_POSITION + 7 + 14);
    }

    #[test]
    fn test_unforced_appends_not_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.seg");

        {
            let seg = MemorySegment::create(0, &path, 1024).unwrap();
            seg.append(b"durable").unwrap();
            seg.force().unwrap();
            seg.append(b"volatile").unwrap();
            // No force; the second record stays in memory only.
        }

        let seg = MemorySegment::open(0, &path, 1024).unwrap();
        assert_eq!(seg.read_record(DATA_START_POSITION).unwrap(), b"durable");
        assert_eq!(seg.append_position(), DATA_START_POSITION + 11);
    }
}
