//! File-backed segment realization.
//!
//! Appends accumulate in a bounded write buffer and drain to the OS file
//! when it fills; reads go through a dedicated read handle. With a
//! zero-sized buffer every append passes straight through to the file,
//! which is the "channel" flavour of this realization.

use super::{
    decode_header, encode_header, encode_record, scan_data_end, Mode, Segment, SegmentMeta,
    DATA_START_POSITION, HEADER_SIZE, STORAGE_VERSION,
};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

struct WriterState {
    file: File,
    /// Pending bytes not yet written to the file; starts at `flushed_pos`.
    buf: Vec<u8>,
    capacity: usize,
}

/// A segment whose appends go through a bounded write buffer to the file.
pub struct FileSegment {
    meta: SegmentMeta,
    writer: Mutex<WriterState>,
    reader: Mutex<File>,
    /// Everything below this position is in the OS file.
    flushed_pos: AtomicU32,
}

impl FileSegment {
    /// Creates a fresh segment file of `initial_size` bytes.
    ///
    /// `buffer_capacity` bounds the in-process write buffer; zero makes
    /// every append write through immediately.
    pub fn create(
        seg_id: u16,
        path: &Path,
        initial_size: u64,
        buffer_capacity: usize,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(initial_size)?;

        let now = super::current_time_millis();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(now, STORAGE_VERSION))?;
        file.sync_all()?;

        let reader = File::open(path)?;
        Ok(Self {
            meta: SegmentMeta::new(
                seg_id,
                initial_size,
                Mode::ReadWrite,
                DATA_START_POSITION,
                now,
                STORAGE_VERSION,
            ),
            writer: Mutex::new(WriterState { file, buf: Vec::new(), capacity: buffer_capacity }),
            reader: Mutex::new(reader),
            flushed_pos: AtomicU32::new(DATA_START_POSITION),
        })
    }

    /// Opens an existing segment file.
    pub fn open(
        seg_id: u16,
        path: &Path,
        initial_size: u64,
        buffer_capacity: usize,
    ) -> Result<Self> {
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

        let mut header = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let (last_forced, version) = decode_header(&header);

        let reader = File::open(path)?;
        let segment = Self {
            meta: SegmentMeta::new(
                seg_id,
                initial_size,
                Mode::ReadWrite,
                DATA_START_POSITION,
                last_forced,
                version,
            ),
            writer: Mutex::new(WriterState { file, buf: Vec::new(), capacity: buffer_capacity }),
            reader: Mutex::new(reader),
            flushed_pos: AtomicU32::new(DATA_START_POSITION),
        };
        let data_end = scan_data_end(&segment)?;
        segment.set_append_position(data_end);
        Ok(segment)
    }

    /// Drains the write buffer into the file. Caller holds the writer lock.
    fn drain_locked(&self, ws: &mut WriterState) -> Result<()> {
        if ws.buf.is_empty() {
            return Ok(());
        }
        let flushed = self.flushed_pos.load(Ordering::Acquire);
        ws.file.seek(SeekFrom::Start(flushed as u64))?;
        ws.file.write_all(&ws.buf)?;
        self.flushed_pos.store(flushed + ws.buf.len() as u32, Ordering::Release);
        ws.buf.clear();
        Ok(())
    }
}

impl Segment for FileSegment {
    fn seg_id(&self) -> u16 {
        self.meta.seg_id()
    }

    fn mode(&self) -> Mode {
        self.meta.mode()
    }

    fn append(&self, data: &[u8]) -> Result<u32> {
        let mut ws = self.writer.lock();
        let pos = self.meta.reserve(data.len())?;
        ws.buf.extend_from_slice(&encode_record(data));
        if ws.buf.len() >= ws.capacity {
            self.drain_locked(&mut ws)?;
        }
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
        if end > self.flushed_pos.load(Ordering::Acquire) as u64 {
            // The range still sits (partly) in the write buffer.
            let mut ws = self.writer.lock();
            self.drain_locked(&mut ws)?;
        }
        let mut reader = self.reader.lock();
        reader.seek(SeekFrom::Start(offset as u64))?;
        reader.read_exact(dst)?;
        Ok(())
    }

    fn force(&self) -> Result<()> {
        let mut ws = self.writer.lock();
        self.drain_locked(&mut ws)?;
        let now = self.meta.touch_forced();
        ws.file.seek(SeekFrom::Start(0))?;
        ws.file.write_all(&encode_header(now, self.meta.storage_version()))?;
        ws.file.sync_all()?;
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

impl Drop for FileSegment {
    fn drop(&mut self) {
        // Best effort drain on drop.
        let mut ws = self.writer.lock();
        if !ws.buf.is_empty() {
            let flushed = self.flushed_pos.load(Ordering::Acquire);
            if ws.file.seek(SeekFrom::Start(flushed as u64)).is_ok() {
                let buf = std::mem::take(&mut ws.buf);
                let _ = ws.file.write_all(&buf);
            }
        }
    }
}
