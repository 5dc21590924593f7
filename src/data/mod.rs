//! The data array: random-access byte blobs addressed by integer index.
//!
//! `set_data` appends the payload to the current segment, then publishes
//! the new packed address through the address array's redo log. `get_data`
//! resolves the address and copies the payload back out of the owning
//! segment. Writes follow the single-writer contract; reads may run
//! concurrently with the writer.

pub mod checked;

pub use checked::CheckedDataArray;

use crate::address::{Address, MAX_DATA_LENGTH};
use crate::array::AddressArray;
use crate::compaction::Compactor;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::segment::{Segment, SegmentManager, RECORD_OVERHEAD};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

struct WriterState {
    /// Bytes still referenced by the address array, per segment.
    live_bytes: HashMap<u16, u64>,
    compactor: Compactor,
}

/// Crash-consistent blob storage over an address array and a segment set.
pub struct DataArray {
    address_array: AddressArray,
    segments: Arc<SegmentManager>,
    writer: Mutex<WriterState>,
}

impl DataArray {
    /// Opens the data array under `home_dir`.
    pub fn open(home_dir: &Path, config: &StoreConfig) -> Result<Self> {
        let address_array = AddressArray::open(
            home_dir,
            config.capacity,
            config.batch_size,
            config.max_entries,
            config.allow_watermark_rollback,
            config.discard_corrupt_tail,
        )?;
        let segments = Arc::new(SegmentManager::open(
            &home_dir.join("segs"),
            config.segment_factory_kind,
            config.segment_size_bytes(),
        )?);

        // A redo entry must never outlive its segment bytes: force the
        // current segment before any batch reaches disk.
        let force_segments = Arc::clone(&segments);
        address_array.set_persist_listener(Box::new(move || force_segments.force_current()));

        let live_bytes = rebuild_live_bytes(&address_array, &segments)?;
        let compactor =
            Compactor::new(config.segment_compact_factor, config.segment_compact_trigger);

        log::info!(
            "data array opened: capacity={} lwMark={} hwMark={}",
            address_array.length(),
            address_array.lw_mark(),
            address_array.hw_mark()
        );

        Ok(Self { address_array, segments, writer: Mutex::new(WriterState { live_bytes, compactor }) })
    }

    /// The number of addressable indexes.
    pub fn length(&self) -> u32 {
        self.address_array.length()
    }

    /// Resolves `index` to its record, if any.
    ///
    /// A stale address reads as no-data: one pointing at a missing
    /// segment, past the owning segment's data end, or at bytes whose
    /// length prefix disagrees with the address (a torn, never-forced
    /// tail).
    fn resolve(&self, index: u32) -> Result<Option<(Arc<dyn Segment>, Address)>> {
        let address = self.address_array.get(index)?;
        if address.is_null() {
            return Ok(None);
        }
        let Some(segment) = self.segments.get(address.seg_id()) else {
            return Ok(None);
        };
        let end = address.offset() as u64 + address.record_size();
        if end > segment.append_position() as u64 {
            return Ok(None);
        }
        let mut prefix = [0u8; 4];
        segment.read_at(address.offset(), &mut prefix)?;
        if u32::from_be_bytes(prefix) != address.data_length() as u32 {
            log::warn!(
                "index {} references a torn record in segment {}; treated as stale",
                index,
                address.seg_id()
            );
            return Ok(None);
        }
        Ok(Some((segment, address)))
    }

    /// Returns the payload stored at `index`, or `None`.
    pub fn get_data(&self, index: u32) -> Result<Option<Vec<u8>>> {
        let Some((segment, address)) = self.resolve(index)? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; address.data_length() as usize];
        segment.read_at(address.offset() + RECORD_OVERHEAD, &mut payload)?;
        Ok(Some(payload))
    }

    /// Copies the payload stored at `index` into `dst[offset..]`.
    ///
    /// Returns the number of bytes copied, or `None` for no-data.
    pub fn get_data_into(
        &self,
        index: u32,
        dst: &mut [u8],
        offset: usize,
    ) -> Result<Option<usize>> {
        let Some((segment, address)) = self.resolve(index)? else {
            return Ok(None);
        };
        let length = address.data_length() as usize;
        if offset + length > dst.len() {
            return Err(Error::invalid_argument(format!(
                "destination too small: need {} bytes at offset {}, have {}",
                length,
                offset,
                dst.len()
            )));
        }
        segment.read_at(
            address.offset() + RECORD_OVERHEAD,
            &mut dst[offset..offset + length],
        )?;
        Ok(Some(length))
    }

    /// Stores `data` at `index` under `scn`; `None` deletes.
    pub fn set_data(&self, index: u32, data: Option<&[u8]>, scn: u64) -> Result<()> {
        // Bounds check up front so deletes of bad indexes fail too.
        self.address_array.get(index)?;
        let mut writer = self.writer.lock();

        let new_address = match data {
            None => Address::NULL,
            Some(data) => {
                if data.len() > MAX_DATA_LENGTH {
                    return Err(Error::invalid_argument(format!(
                        "payload of {} bytes exceeds the {} byte record limit",
                        data.len(),
                        MAX_DATA_LENGTH
                    )));
                }
                self.append_with_rotation(&mut writer, data)?
            }
        };

        // Re-read the superseded address after any rotation-triggered
        // compaction, which may have republished it.
        let old = self.address_array.get(index)?;
        if !new_address.is_null() {
            *writer.live_bytes.entry(new_address.seg_id()).or_insert(0) +=
                new_address.record_size();
        }
        if let Err(e) = self.address_array.set(index, new_address, scn) {
            // The address was never published; undo the live accounting.
            if !new_address.is_null() {
                if let Some(bytes) = writer.live_bytes.get_mut(&new_address.seg_id()) {
                    *bytes = bytes.saturating_sub(new_address.record_size());
                }
            }
            return Err(e);
        }

        if !old.is_null() {
            if let Some(bytes) = writer.live_bytes.get_mut(&old.seg_id()) {
                *bytes = bytes.saturating_sub(old.record_size());
            }
        }
        Ok(())
    }

    /// Appends to the current segment, rotating once on overflow.
    fn append_with_rotation(&self, writer: &mut WriterState, data: &[u8]) -> Result<Address> {
        let current = self.segments.current();
        match current.append(data) {
            Ok(offset) => Ok(Address::pack(current.seg_id(), offset, data.len() as u16)),
            Err(Error::SegmentOverflow) | Err(Error::SegmentReadOnly) => {
                let fresh = self.segments.next_segment()?;
                self.maybe_compact(writer)?;
                match fresh.append(data) {
                    Ok(offset) => Ok(Address::pack(fresh.seg_id(), offset, data.len() as u16)),
                    Err(Error::SegmentOverflow) => Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("record of {} bytes larger than a fresh segment", data.len()),
                    ))),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// One bounded compaction step: drain the best candidate, if any.
    fn maybe_compact(&self, writer: &mut WriterState) -> Result<bool> {
        let WriterState { live_bytes, compactor } = writer;
        match compactor.pick_candidate(&self.segments.segments(), live_bytes) {
            Some(source) => {
                compactor.drain(&source, &self.address_array, &self.segments, live_bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drains one compaction candidate and reclaims any drained segments
    /// the low water mark has caught up with.
    pub fn compact(&self) -> Result<bool> {
        let mut writer = self.writer.lock();
        let drained = self.maybe_compact(&mut writer)?;
        writer.compactor.reclaim_eligible(self.address_array.lw_mark(), &self.segments)?;
        Ok(drained)
    }

    /// Forces the current segment, then flushes the redo log, advancing
    /// LWM to HWM. Reclaims drained segments the new LWM covers.
    pub fn sync(&self) -> Result<()> {
        self.segments.force_current()?;
        self.address_array.sync()?;
        let mut writer = self.writer.lock();
        writer.compactor.reclaim_eligible(self.address_array.lw_mark(), &self.segments)?;
        Ok(())
    }

    /// Forces the current segment only; no watermark movement.
    pub fn persist(&self) -> Result<()> {
        self.segments.force_current()
    }

    /// Zeros the address array, drops the redo log and all segments.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.address_array.clear()?;
        self.segments.clear()?;
        writer.live_bytes.clear();
        writer.compactor.reset();
        Ok(())
    }

    /// The high water mark.
    pub fn hw_mark(&self) -> u64 {
        self.address_array.hw_mark()
    }

    /// The low water mark.
    pub fn lw_mark(&self) -> u64 {
        self.address_array.lw_mark()
    }

    /// Synchronizes the high water mark to `scn`.
    pub fn save_hw_mark(&self, scn: u64) -> Result<()> {
        self.address_array.save_hw_mark(scn)
    }
}

/// Sweeps the address array rebuilding the per-segment live-byte counts.
///
/// The resume segment's append position is bumped to cover recovered
/// addresses whose records verify beyond the raw scan boundary (possible
/// when an empty record stopped the scan early). A record verifies when
/// its on-disk length prefix matches the address; a torn tail never does,
/// so those addresses stay stale.
fn rebuild_live_bytes(
    address_array: &AddressArray,
    segments: &SegmentManager,
) -> Result<HashMap<u16, u64>> {
    let current = segments.current();
    let mut live_bytes: HashMap<u16, u64> = HashMap::new();
    let mut current_end = current.append_position() as u64;
    let mut prefix = [0u8; 4];

    for index in 0..address_array.length() {
        let address = address_array.get(index)?;
        if address.is_null() {
            continue;
        }
        let Some(segment) = segments.get(address.seg_id()) else {
            log::warn!(
                "index {} references missing segment {}; treated as stale",
                index,
                address.seg_id()
            );
            continue;
        };
        let end = address.offset() as u64 + address.record_size();
        if segment.seg_id() == current.seg_id() {
            if end > segment.initial_size() {
                continue;
            }
            segment.read_at(address.offset(), &mut prefix)?;
            if u32::from_be_bytes(prefix) != address.data_length() as u32 {
                continue;
            }
            current_end = current_end.max(end);
        } else if end > segment.append_position() as u64 {
            // Stale tail of a torn write; reads will see no-data.
            continue;
        }
        *live_bytes.entry(address.seg_id()).or_insert(0) += address.record_size();
    }

    if current_end > current.append_position() as u64 {
        current.set_append_position(current_end as u32);
    }
    Ok(live_bytes)
}
