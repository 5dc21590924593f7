//! Append-only data segments.
//!
//! A segment is a fixed-size file holding length-prefixed blobs:
//!
//! ```text
//! [header: 32B]  lastForcedTime:u64 LE, storageVersion:u64 LE, reserved
//! [record]*      each record is [length:u32 BE][payload bytes]
//! [zeroed tail]  up to the fixed segment capacity
//! ```
//!
//! Segments are created read-write, filled by appends, sealed read-only on
//! rotation and eventually reclaimed by compaction. Four realizations exist
//! behind the [`Segment`] trait; all of them persist identical byte layouts
//! and are interchangeable.

pub mod file;
pub mod manager;
pub mod mapped;
pub mod memory;

pub use file::FileSegment;
pub use manager::SegmentManager;
pub use mapped::MappedSegment;
pub use memory::MemorySegment;

use crate::config::SegmentFactoryKind;
use crate::error::{Error, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version stamped into every segment header.
pub const STORAGE_VERSION: u64 = 1;

/// First byte position usable for records; the header owns everything
/// before it.
pub const DATA_START_POSITION: u32 = 32;

/// Size of the segment header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Bytes a record occupies beyond its payload (the length prefix).
pub const RECORD_OVERHEAD: u32 = 4;

/// Write-buffer capacity for the write-buffer segment realization.
pub const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Segment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Accepting appends.
    ReadWrite = 0,
    /// Sealed; bytes are immutable until the segment is reclaimed.
    ReadOnly = 1,
}

/// Contract shared by all segment realizations.
///
/// Appends come from the single writer; reads of already-published offsets
/// are safe concurrently with appends at later offsets.
pub trait Segment: Send + Sync {
    /// The segment id.
    fn seg_id(&self) -> u16;

    /// The current mode.
    fn mode(&self) -> Mode;

    /// Appends a length-prefixed record and returns its start offset.
    ///
    /// Fails with [`Error::SegmentOverflow`] when the remaining capacity
    /// cannot hold the record, and [`Error::SegmentReadOnly`] once sealed.
    fn append(&self, data: &[u8]) -> Result<u32>;

    /// Reads raw bytes at `offset` into `dst`.
    fn read_at(&self, offset: u32, dst: &mut [u8]) -> Result<()>;

    /// Durably persists all writes so far and updates the last-forced time.
    fn force(&self) -> Result<()>;

    /// Seals the segment; subsequent appends fail.
    fn as_read_only(&self) -> Result<()>;

    /// Releases any resources held beyond the file itself.
    fn free(&self) -> Result<()>;

    /// Current append position.
    fn append_position(&self) -> u32;

    /// Rewinds or advances the append position.
    ///
    /// Recovery-only: used when re-deriving the position of the resume
    /// segment after a crash.
    fn set_append_position(&self, pos: u32);

    /// Bytes of payload (live + dead) written so far, including prefixes.
    fn load_size(&self) -> u64;

    /// Fixed capacity in bytes.
    fn initial_size(&self) -> u64;

    /// Millisecond timestamp of the last force.
    fn last_forced_time(&self) -> u64;

    /// Storage format version read from the header.
    fn storage_version(&self) -> u64;

    /// `loadSize / initialSize`.
    fn load_factor(&self) -> f64 {
        self.load_size() as f64 / self.initial_size() as f64
    }

    /// Reads the length-prefixed record starting at `offset`.
    fn read_record(&self, offset: u32) -> Result<Vec<u8>> {
        let mut prefix = [0u8; 4];
        self.read_at(offset, &mut prefix)?;
        let length = u32::from_be_bytes(prefix);
        if offset as u64 + RECORD_OVERHEAD as u64 + length as u64 > self.initial_size() {
            return Err(Error::internal(format!(
                "record at {} runs past segment capacity",
                offset
            )));
        }
        let mut payload = vec![0u8; length as usize];
        self.read_at(offset + RECORD_OVERHEAD, &mut payload)?;
        Ok(payload)
    }
}

/// Mutable bookkeeping shared by all segment realizations.
pub(crate) struct SegmentMeta {
    seg_id: u16,
    initial_size: u64,
    mode: AtomicU8,
    append_pos: AtomicU32,
    load_size: AtomicU64,
    last_forced_time: AtomicU64,
    storage_version: u64,
}

impl SegmentMeta {
    pub(crate) fn new(
        seg_id: u16,
        initial_size: u64,
        mode: Mode,
        append_pos: u32,
        last_forced_time: u64,
        storage_version: u64,
    ) -> Self {
        let load = append_pos.saturating_sub(DATA_START_POSITION) as u64;
        Self {
            seg_id,
            initial_size,
            mode: AtomicU8::new(mode as u8),
            append_pos: AtomicU32::new(append_pos),
            load_size: AtomicU64::new(load),
            last_forced_time: AtomicU64::new(last_forced_time),
            storage_version,
        }
    }

    pub(crate) fn seg_id(&self) -> u16 {
        self.seg_id
    }

    pub(crate) fn initial_size(&self) -> u64 {
        self.initial_size
    }

    pub(crate) fn mode(&self) -> Mode {
        if self.mode.load(Ordering::Acquire) == Mode::ReadOnly as u8 {
            Mode::ReadOnly
        } else {
            Mode::ReadWrite
        }
    }

    pub(crate) fn seal(&self) {
        self.mode.store(Mode::ReadOnly as u8, Ordering::Release);
    }

    pub(crate) fn append_position(&self) -> u32 {
        self.append_pos.load(Ordering::Acquire)
    }

    pub(crate) fn set_append_position(&self, pos: u32) {
        self.append_pos.store(pos, Ordering::Release);
        self.load_size
            .store(pos.saturating_sub(DATA_START_POSITION) as u64, Ordering::Release);
    }

    pub(crate) fn load_size(&self) -> u64 {
        self.load_size.load(Ordering::Acquire)
    }

    pub(crate) fn last_forced_time(&self) -> u64 {
        self.last_forced_time.load(Ordering::Acquire)
    }

    pub(crate) fn touch_forced(&self) -> u64 {
        let now = current_time_millis();
        self.last_forced_time.store(now, Ordering::Release);
        now
    }

    pub(crate) fn storage_version(&self) -> u64 {
        self.storage_version
    }

    /// Reserves room for one record; returns its start offset.
    pub(crate) fn reserve(&self, payload_len: usize) -> Result<u32> {
        if self.mode() == Mode::ReadOnly {
            return Err(Error::SegmentReadOnly);
        }
        let pos = self.append_pos.load(Ordering::Acquire);
        let needed = RECORD_OVERHEAD as u64 + payload_len as u64;
        if pos as u64 + needed > self.initial_size {
            return Err(Error::SegmentOverflow);
        }
        self.append_pos.store(pos + needed as u32, Ordering::Release);
        self.load_size.fetch_add(needed, Ordering::AcqRel);
        Ok(pos)
    }
}

/// Encodes the 32-byte segment header.
pub(crate) fn encode_header(last_forced_time: u64, storage_version: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..8].copy_from_slice(&last_forced_time.to_le_bytes());
    header[8..16].copy_from_slice(&storage_version.to_le_bytes());
    header
}

/// Decodes `(lastForcedTime, storageVersion)` from a segment header.
pub(crate) fn decode_header(header: &[u8; HEADER_SIZE]) -> (u64, u64) {
    let last_forced = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let version = u64::from_le_bytes(header[8..16].try_into().unwrap());
    (last_forced, version)
}

/// Encodes one length-prefixed record.
pub(crate) fn encode_record(data: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(RECORD_OVERHEAD as usize + data.len());
    record.extend_from_slice(&(data.len() as u32).to_be_bytes());
    record.extend_from_slice(data);
    record
}

/// Milliseconds since the Unix epoch.
pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Generate a segment filename for a given segment id.
pub fn seg_filename(seg_id: u16) -> String {
    format!("{}.seg", seg_id)
}

/// Parse a segment filename to extract the segment id.
pub fn parse_seg_filename(filename: &str) -> Option<u16> {
    let name = filename.strip_suffix(".seg")?;
    name.parse().ok()
}

/// Walks length prefixes from the data start and returns the first position
/// that cannot hold another record: a zero prefix (untouched tail) or a
/// declared length running past the capacity ends the scan. Used to
/// re-derive the append position of a resume segment.
pub(crate) fn scan_data_end(segment: &dyn Segment) -> Result<u32> {
    let capacity = segment.initial_size();
    let mut pos = DATA_START_POSITION;
    let mut prefix = [0u8; 4];
    while (pos as u64) + RECORD_OVERHEAD as u64 <= capacity {
        segment.read_at(pos, &mut prefix)?;
        let length = u32::from_be_bytes(prefix);
        if length == 0 {
            break;
        }
        let end = pos as u64 + RECORD_OVERHEAD as u64 + length as u64;
        if end > capacity {
            break;
        }
        pos = end as u32;
    }
    Ok(pos)
}

/// Creates a fresh segment of the given realization.
pub fn create_segment(
    kind: SegmentFactoryKind,
    seg_id: u16,
    path: &Path,
    initial_size: u64,
) -> Result<Arc<dyn Segment>> {
    Ok(match kind {
        SegmentFactoryKind::Memory => Arc::new(MemorySegment::create(seg_id, path, initial_size)?),
        SegmentFactoryKind::WriteBuffer => {
            Arc::new(FileSegment::create(seg_id, path, initial_size, WRITE_BUFFER_SIZE)?)
        }
        SegmentFactoryKind::Channel => Arc::new(FileSegment::create(seg_id, path, initial_size, 0)?),
        SegmentFactoryKind::Mapped => Arc::new(MappedSegment::create(seg_id, path, initial_size)?),
    })
}

/// Opens an existing segment file of the given realization.
pub fn open_segment(
    kind: SegmentFactoryKind,
    seg_id: u16,
    path: &Path,
    initial_size: u64,
) -> Result<Arc<dyn Segment>> {
    let segment: Arc<dyn Segment> = match kind {
        SegmentFactoryKind::Memory => Arc::new(MemorySegment::open(seg_id, path, initial_size)?),
        SegmentFactoryKind::WriteBuffer => {
            Arc::new(FileSegment::open(seg_id, path, initial_size, WRITE_BUFFER_SIZE)?)
        }
        SegmentFactoryKind::Channel => Arc::new(FileSegment::open(seg_id, path, initial_size, 0)?),
        SegmentFactoryKind::Mapped => Arc::new(MappedSegment::open(seg_id, path, initial_size)?),
    };
    if segment.storage_version() != STORAGE_VERSION {
        return Err(Error::internal(format!(
            "segment {} has storage version {}, expected {}",
            seg_id,
            segment.storage_version(),
            STORAGE_VERSION
        )));
    }
    Ok(segment)
}
