//! The persistent address array.
//!
//! A fixed-length array of packed 64-bit addresses, held in memory as
//! atomic slots for lock-free reads and persisted through `indexes.dat`
//! plus a redo log of batched updates. One writer mutates the array; any
//! number of readers may call [`AddressArray::get`] concurrently.
//!
//! ## Recovery
//!
//! On open the slots are loaded from `indexes.dat`, then every valid
//! `.redo` file is replayed in ascending SCN order for records above the
//! durable low water mark. The replayed updates are consolidated back into
//! `indexes.dat` so the store always starts with an empty redo directory
//! and `LWM == HWM`.

pub mod entry;
pub mod entry_manager;
pub mod file;

pub use entry::{EntryBatch, EntryKind, EntryRecord};
pub use entry_manager::EntryManager;
pub use file::ArrayFile;

use crate::address::Address;
use crate::error::{Error, Result};
use entry_manager::scan_redo_files;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

struct Inner {
    entry_manager: EntryManager,
    array_file: ArrayFile,
}

/// A fixed-length persistent array of addresses.
///
/// Reads are lock-free; mutations follow the single-writer contract.
pub struct AddressArray {
    slots: Box<[AtomicU64]>,
    inner: Mutex<Inner>,
    allow_watermark_rollback: bool,
}

impl AddressArray {
    /// Opens (or creates) the address array under `home_dir`, running
    /// redo-log recovery.
    pub fn open(
        home_dir: &Path,
        length: u32,
        batch_size: usize,
        max_entries: usize,
        allow_watermark_rollback: bool,
        discard_corrupt_tail: bool,
    ) -> Result<Self> {
        let mut array_file = ArrayFile::open(&home_dir.join("indexes.dat"), length)?;
        let values = array_file.load()?;
        let file_lwm = array_file.lwm_scn();

        let slots: Box<[AtomicU64]> =
            values.into_iter().map(AtomicU64::new).collect::<Vec<_>>().into_boxed_slice();

        // Replay redo files above the durable low water mark.
        let mut max_scn = array_file.hwm_scn().max(file_lwm);
        let mut replayed = Vec::new();
        for (path, min_scn, _, _) in scan_redo_files(home_dir)? {
            let bytes = fs::read(&path)?;
            let batch = match EntryBatch::decode(&bytes) {
                Ok(batch) => batch,
                Err(err) => {
                    if discard_corrupt_tail && min_scn > file_lwm {
                        log::warn!(
                            "discarding corrupt redo file {} above lwm {}: {}",
                            path.display(),
                            file_lwm,
                            err
                        );
                        fs::remove_file(&path)?;
                        continue;
                    }
                    return Err(err);
                }
            };
            for record in &batch.records {
                if record.scn > file_lwm {
                    if record.index as usize >= slots.len() {
                        return Err(Error::redo_corrupted(format!(
                            "redo record index {} out of range",
                            record.index
                        )));
                    }
                    slots[record.index as usize].store(record.new_address, Ordering::Release);
                    max_scn = max_scn.max(record.scn);
                }
            }
            replayed.push((path, batch));
        }

        // Consolidate replayed updates into indexes.dat so recovery is a
        // clean slate: no redo files, both watermarks at max_scn.
        if !replayed.is_empty() {
            for (_, batch) in &replayed {
                for record in &batch.records {
                    if record.scn > file_lwm {
                        array_file.write_address(record.index, record.new_address)?;
                    }
                }
            }
            array_file.set_water_marks(max_scn, max_scn)?;
            array_file.force()?;
            for (path, _) in &replayed {
                fs::remove_file(path)?;
            }
            log::info!(
                "recovered {} redo batch(es), watermarks at {}",
                replayed.len(),
                max_scn
            );
        } else if array_file.hwm_scn() != max_scn || array_file.lwm_scn() != max_scn {
            array_file.set_water_marks(max_scn, max_scn)?;
            array_file.force()?;
        }

        let entry_manager = EntryManager::new(home_dir, batch_size, max_entries, max_scn, max_scn);
        Ok(Self {
            slots,
            inner: Mutex::new(Inner { entry_manager, array_file }),
            allow_watermark_rollback,
        })
    }

    /// Registers a callback invoked before any redo batch is persisted.
    pub fn set_persist_listener(&self, listener: entry_manager::PersistListener) {
        self.inner.lock().entry_manager.set_persist_listener(listener);
    }

    /// The array length.
    pub fn length(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Lock-free read of one address slot.
    pub fn get(&self, index: u32) -> Result<Address> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or(Error::IndexOutOfRange { index, length: self.length() })?;
        Ok(Address::from_raw(slot.load(Ordering::Acquire)))
    }

    /// Writer mutation: publishes `address` at `index` under `scn`.
    pub fn set(&self, index: u32, address: Address, scn: u64) -> Result<()> {
        self.set_with_kind(index, address, scn, EntryKind::Normal)
    }

    /// Compactor mutation: like [`AddressArray::set`] but flagged as
    /// originating from a segment copy.
    pub fn set_compaction_address(&self, index: u32, address: Address, scn: u64) -> Result<()> {
        self.set_with_kind(index, address, scn, EntryKind::Compaction)
    }

    fn set_with_kind(&self, index: u32, address: Address, scn: u64, kind: EntryKind) -> Result<()> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or(Error::IndexOutOfRange { index, length: self.length() })?;

        let mut inner = self.inner.lock();
        let old = slot.load(Ordering::Acquire);
        slot.store(address.raw(), Ordering::Release);
        let Inner { entry_manager, array_file } = &mut *inner;
        entry_manager.add(array_file, index, address.raw(), old, scn, kind)
    }

    /// Flushes all pending redo batches and advances LWM to HWM.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Inner { entry_manager, array_file } = &mut *inner;
        entry_manager.sync(array_file)
    }

    /// Synchronizes the high water mark to `scn`.
    ///
    /// A value above the HWM is recorded via a no-op write at index 0.
    /// A value below the LWM retreats both watermarks, which is only legal
    /// when the store was opened with watermark rollback enabled.
    pub fn save_hw_mark(&self, scn: u64) -> Result<()> {
        let hwm = self.hw_mark();
        if scn > hwm {
            let current = self.get(0)?;
            self.set(0, current, scn)
        } else if scn > 0 && scn < self.lw_mark() {
            if !self.allow_watermark_rollback {
                return Err(Error::invalid_argument(format!(
                    "watermark rollback to {} is disabled",
                    scn
                )));
            }
            let mut inner = self.inner.lock();
            let Inner { entry_manager, array_file } = &mut *inner;
            entry_manager.sync(array_file)?;
            entry_manager.set_water_marks(scn, scn);
            array_file.set_water_marks(scn, scn)?;
            array_file.force()?;
            Ok(())
        } else {
            Ok(())
        }
    }

    /// Zeros every slot, drops the redo log and resets `indexes.dat`.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Release);
        }
        let Inner { entry_manager, array_file } = &mut *inner;
        entry_manager.clear()?;
        array_file.reset(entry_manager.lw_mark())
    }

    /// The high water mark.
    pub fn hw_mark(&self) -> u64 {
        self.inner.lock().entry_manager.hw_mark()
    }

    /// The low water mark.
    pub fn lw_mark(&self) -> u64 {
        self.inner.lock().entry_manager.lw_mark()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_array(dir: &Path, length: u32, batch_size: usize, max_entries: usize) -> AddressArray {
        AddressArray::open(dir, length, batch_size, max_entries, false, false).unwrap()
    }

    #[test]
    fn test_set_get() {
        let dir = TempDir::new().unwrap();
        let array = open_array(dir.path(), 8, 100, 5);

        let addr = Address::pack(1, 64, 10);
        array.set(3, addr, 1).unwrap();
        assert_eq!(array.get(3).unwrap(), addr);
        assert!(array.get(7).unwrap().is_null());
        assert_eq!(array.hw_mark(), 1);
        assert_eq!(array.lw_mark(), 0);
    }

    #[test]
    fn test_index_out_of_range() {
        let dir = TempDir::new().unwrap();
        let array = open_array(dir.path(), 8, 100, 5);

        assert!(matches!(
            array.get(8),
            Err(Error::IndexOutOfRange { index: 8, length: 8 })
        ));
        assert!(array.set(8, Address::pack(0, 32, 1), 1).is_err());
    }

    #[test]
    fn test_sync_advances_lwm() {
        let dir = TempDir::new().unwrap();
        let array = open_array(dir.path(), 8, 100, 5);

        array.set(0, Address::pack(0, 32, 1), 1).unwrap();
        array.set(1, Address::pack(0, 37, 2), 2).unwrap();
        array.sync().unwrap();
        assert_eq!(array.lw_mark(), 2);
        assert_eq!(array.hw_mark(), 2);
    }

    #[test]
    fn test_reopen_recovers_synced_state() {
        let dir = TempDir::new().unwrap();
        let addr_a = Address::pack(0, 32, 1);
        let addr_b = Address::pack(0, 37, 2);

        {
            let array = open_array(dir.path(), 8, 100, 5);
            array.set(0, addr_a, 1).unwrap();
            array.set(1, addr_b, 2).unwrap();
            array.sync().unwrap();
        }

        let array = open_array(dir.path(), 8, 100, 5);
        assert_eq!(array.get(0).unwrap(), addr_a);
        assert_eq!(array.get(1).unwrap(), addr_b);
        assert_eq!(array.lw_mark(), 2);
        assert_eq!(array.hw_mark(), 2);
    }

    #[test]
    fn test_reopen_replays_sealed_but_unapplied_batches() {
        let dir = TempDir::new().unwrap();
        let addr = Address::pack(0, 32, 5);

        {
            // batch_size 2, max_entries 100: two writes seal one batch to
            // disk but never apply it into indexes.dat.
            let array = open_array(dir.path(), 8, 2, 100);
            array.set(4, Address::pack(0, 32, 1), 1).unwrap();
            array.set(4, addr, 2).unwrap();
            assert_eq!(array.lw_mark(), 0);
            // Dropped without sync: the redo file is the only durable copy.
        }
        assert_eq!(scan_redo_files(dir.path()).unwrap().len(), 1);

        let array = open_array(dir.path(), 8, 2, 100);
        assert_eq!(array.get(4).unwrap(), addr);
        assert_eq!(array.lw_mark(), 2);
        assert_eq!(array.hw_mark(), 2);
        // Recovery consolidated the redo file away.
        assert_eq!(scan_redo_files(dir.path()).unwrap().len(), 0);
    }

    #[test]
    fn test_capacity_mismatch_on_reopen() {
        let dir = TempDir::new().unwrap();
        open_array(dir.path(), 8, 100, 5);

        let result = AddressArray::open(dir.path(), 16, 100, 5, false, false);
        assert!(matches!(result, Err(Error::CapacityMismatch { .. })));
    }

    #[test]
    fn test_corrupt_redo_aborts_open() {
        let dir = TempDir::new().unwrap();
        {
            let array = open_array(dir.path(), 8, 2, 100);
            array.set(0, Address::pack(0, 32, 1), 1).unwrap();
            array.set(1, Address::pack(0, 37, 1), 1).unwrap();
        }
        let files = scan_redo_files(dir.path()).unwrap();
        let path = files[0].0.clone();
        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 10] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let result = AddressArray::open(dir.path(), 8, 2, 100, false, false);
        assert!(matches!(result, Err(Error::RedoCorrupted(_))));

        // Opting in discards the corrupt tail instead.
        let array = AddressArray::open(dir.path(), 8, 2, 100, false, true).unwrap();
        assert!(array.get(0).unwrap().is_null());
    }

    #[test]
    fn test_save_hw_mark_advances() {
        let dir = TempDir::new().unwrap();
        let array = open_array(dir.path(), 8, 100, 5);

        array.set(0, Address::pack(0, 32, 1), 3).unwrap();
        array.save_hw_mark(10).unwrap();
        assert_eq!(array.hw_mark(), 10);
        // The slot value is untouched by the no-op write.
        assert_eq!(array.get(0).unwrap(), Address::pack(0, 32, 1));
    }

    #[test]
    fn test_save_hw_mark_rollback_gated() {
        let dir = TempDir::new().unwrap();
        {
            let array = open_array(dir.path(), 8, 100, 5);
            array.set(0, Address::pack(0, 32, 1), 5).unwrap();
            array.sync().unwrap();
            assert!(array.save_hw_mark(2).is_err());
        }

        let array = AddressArray::open(dir.path(), 8, 100, 5, true, false).unwrap();
        array.save_hw_mark(2).unwrap();
        assert_eq!(array.hw_mark(), 2);
        assert_eq!(array.lw_mark(), 2);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let array = open_array(dir.path(), 8, 2, 100);

        array.set(0, Address::pack(0, 32, 1), 1).unwrap();
        array.set(1, Address::pack(0, 37, 1), 2).unwrap();
        array.set(2, Address::pack(0, 42, 1), 3).unwrap();
        array.clear().unwrap();

        for i in 0..8 {
            assert!(array.get(i).unwrap().is_null());
        }
        assert_eq!(scan_redo_files(dir.path()).unwrap().len(), 0);
        assert_eq!(array.lw_mark(), array.hw_mark());
    }
}
