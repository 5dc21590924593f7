//! Redo-batch lifecycle management.
//!
//! The entry manager accumulates address updates into in-progress batches
//! (one per flavour), seals a batch to a `.redo` file when it reaches the
//! configured size and, once enough sealed batches pile up, applies them
//! all into `indexes.dat` in ascending SCN order and prunes the files.
//! The low water mark advances exactly at that apply point.

use super::entry::{entry_filename, parse_entry_filename, EntryBatch, EntryKind, EntryRecord};
use super::file::ArrayFile;
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

struct SealedBatch {
    batch: EntryBatch,
    path: PathBuf,
}

/// Callback invoked before a redo batch is persisted.
///
/// The data array registers one to force the current segment first, so a
/// durable redo entry never references bytes that have not reached disk.
pub type PersistListener = Box<dyn Fn() -> Result<()> + Send>;

/// Manages the ring of in-progress and sealed redo batches.
pub struct EntryManager {
    dir: PathBuf,
    batch_size: usize,
    max_entries: usize,
    current_normal: EntryBatch,
    current_compaction: EntryBatch,
    sealed: Vec<SealedBatch>,
    hwm_scn: u64,
    lwm_scn: u64,
    persist_listener: Option<PersistListener>,
}

impl EntryManager {
    /// Creates a manager writing redo files into `dir`.
    pub fn new(
        dir: &Path,
        batch_size: usize,
        max_entries: usize,
        lwm_scn: u64,
        hwm_scn: u64,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            batch_size,
            max_entries,
            current_normal: EntryBatch::new(EntryKind::Normal),
            current_compaction: EntryBatch::new(EntryKind::Compaction),
            sealed: Vec::new(),
            hwm_scn,
            lwm_scn,
            persist_listener: None,
        }
    }

    /// Registers the before-persist callback.
    pub fn set_persist_listener(&mut self, listener: PersistListener) {
        self.persist_listener = Some(listener);
    }

    /// The high water mark: largest SCN accepted so far.
    pub fn hw_mark(&self) -> u64 {
        self.hwm_scn
    }

    /// The low water mark: largest SCN durably merged into `indexes.dat`.
    pub fn lw_mark(&self) -> u64 {
        self.lwm_scn
    }

    /// Forces both watermarks to a given value (recovery/rollback only).
    pub fn set_water_marks(&mut self, lwm_scn: u64, hwm_scn: u64) {
        self.lwm_scn = lwm_scn;
        self.hwm_scn = hwm_scn;
    }

    /// Logs one address update, rotating and applying batches as needed.
    pub fn add(
        &mut self,
        array_file: &mut ArrayFile,
        index: u32,
        new_address: u64,
        old_address: u64,
        scn: u64,
        kind: EntryKind,
    ) -> Result<()> {
        self.hwm_scn = self.hwm_scn.max(scn);

        let record = EntryRecord { index, new_address, old_address, scn };
        let filled = match kind {
            EntryKind::Normal => {
                self.current_normal.records.push(record);
                self.current_normal.records.len()
            }
            EntryKind::Compaction => {
                self.current_compaction.records.push(record);
                self.current_compaction.records.len()
            }
        };

        if filled >= self.batch_size {
            self.seal(array_file, kind)?;
        }
        if self.sealed.len() >= self.max_entries {
            self.apply_and_prune(array_file)?;
        }
        Ok(())
    }

    /// Seals the in-progress batch of `kind`: write + force a redo file.
    fn seal(&mut self, array_file: &mut ArrayFile, kind: EntryKind) -> Result<()> {
        let batch = match kind {
            EntryKind::Normal => {
                std::mem::replace(&mut self.current_normal, EntryBatch::new(EntryKind::Normal))
            }
            EntryKind::Compaction => std::mem::replace(
                &mut self.current_compaction,
                EntryBatch::new(EntryKind::Compaction),
            ),
        };
        if batch.records.is_empty() {
            return Ok(());
        }

        // Segment bytes first, redo entry second.
        if let Some(listener) = &self.persist_listener {
            listener()?;
        }

        let path = self.dir.join(entry_filename(batch.min_scn(), batch.max_scn(), kind));
        if path.exists() {
            // A sealed batch with the identical SCN range is still pending;
            // drain it so the name becomes free again.
            self.apply_and_prune(array_file)?;
            if path.exists() {
                return Err(Error::internal(format!(
                    "redo file {} already exists",
                    path.display()
                )));
            }
        }

        let encoded = batch.encode();
        let mut file = File::create(&path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        self.sealed.push(SealedBatch { batch, path });
        Ok(())
    }

    /// Applies every sealed batch into `indexes.dat`, forces it, deletes
    /// the files and advances the low water mark.
    fn apply_and_prune(&mut self, array_file: &mut ArrayFile) -> Result<()> {
        if self.sealed.is_empty() {
            return Ok(());
        }
        self.sealed.sort_by_key(|s| s.batch.min_scn());

        let mut applied_scn = self.lwm_scn;
        for sealed in &self.sealed {
            for record in &sealed.batch.records {
                array_file.write_address(record.index, record.new_address)?;
            }
            applied_scn = applied_scn.max(sealed.batch.max_scn());
        }
        array_file.set_water_marks(applied_scn, self.hwm_scn)?;
        array_file.force()?;

        for sealed in &self.sealed {
            fs::remove_file(&sealed.path)?;
        }
        let applied = self.sealed.len();
        self.sealed.clear();
        self.lwm_scn = applied_scn;

        log::info!("applied {} redo batch(es), lwm advanced to {}", applied, applied_scn);
        Ok(())
    }

    /// Flushes every pending update and advances the low water mark to the
    /// high water mark.
    pub fn sync(&mut self, array_file: &mut ArrayFile) -> Result<()> {
        self.seal(array_file, EntryKind::Normal)?;
        self.seal(array_file, EntryKind::Compaction)?;
        self.apply_and_prune(array_file)?;

        if self.lwm_scn != self.hwm_scn {
            self.lwm_scn = self.hwm_scn;
            array_file.set_water_marks(self.lwm_scn, self.hwm_scn)?;
            array_file.force()?;
        }
        Ok(())
    }

    /// Drops all pending batches and removes every redo file.
    ///
    /// The high water mark is retained; the low water mark catches up to it
    /// because nothing remains unapplied.
    pub fn clear(&mut self) -> Result<()> {
        self.current_normal = EntryBatch::new(EntryKind::Normal);
        self.current_compaction = EntryBatch::new(EntryKind::Compaction);
        self.sealed.clear();
        for (path, ..) in scan_redo_files(&self.dir)? {
            fs::remove_file(path)?;
        }
        self.lwm_scn = self.hwm_scn;
        Ok(())
    }
}

/// Enumerates the `.redo` files under `dir`, sorted by ascending min SCN.
pub fn scan_redo_files(dir: &Path) -> Result<Vec<(PathBuf, u64, u64, EntryKind)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((min_scn, max_scn, kind)) = parse_entry_filename(name) else { continue };
        files.push((entry.path(), min_scn, max_scn, kind));
    }
    files.sort_by_key(|&(_, min_scn, max_scn, _)| (min_scn, max_scn));
    Ok(files)
}
