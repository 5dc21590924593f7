//! # krati - A Persistent Hash-Indexed Key-Value Storage Core
//!
//! krati is a log-structured storage core for write-heavy workloads with
//! single-writer/multi-reader access inside one process. Byte blobs are
//! addressed by integer index; every write carries a caller-supplied SCN
//! (system change number) used for watermarking and crash recovery.
//!
//! ## Architecture
//!
//! The store consists of several cooperating components:
//!
//! - **Segments**: fixed-size append-only files holding length-prefixed blobs
//! - **Address Array**: a fixed-length persistent array of packed addresses
//! - **Redo Log**: batched, CRC-protected address updates for recovery
//! - **Data Array**: glues the two into random-access blob storage
//! - **Compactor**: drains low-load segments so they can be reclaimed
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use krati::{Store, StoreConfig};
//!
//! # fn main() -> Result<(), krati::Error> {
//! // Open or create a store with 1024 addressable indexes.
//! let config = StoreConfig::new(1024).segment_file_size_mb(32);
//! let store = Store::open("./data", config)?;
//!
//! // Write operations carry a monotone SCN.
//! store.set(0, b"value0", 1)?;
//! store.set(1, b"value1", 2)?;
//!
//! // Read operations.
//! if let Some(value) = store.get(0)? {
//!     println!("Found: {:?}", value);
//! }
//!
//! // Durability point: everything up to SCN 2 is recoverable.
//! store.sync()?;
//!
//! store.delete(0, 3)?;
//! store.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod address;
pub mod array;
pub mod compaction;
pub mod config;
pub mod data;
pub mod error;
pub mod segment;

// Re-exports
pub use address::Address;
pub use config::{SegmentFactoryKind, StoreConfig};
pub use error::{Error, Result};

use data::{CheckedDataArray, DataArray};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

enum DataLayer {
    Plain(DataArray),
    Checked(CheckedDataArray),
}

/// The store handle.
///
/// # Thread Safety
///
/// `Store` can be shared across threads via `Arc<Store>`. Reads may run
/// concurrently with each other and with the writer; mutating operations
/// (`set`, `delete`, `sync`, `save_hw_mark`, `clear`, `compact`, `close`)
/// must all be issued from a single writer thread.
pub struct Store {
    data: DataLayer,
    closed: AtomicBool,
}

impl Store {
    /// Opens a store under `home_dir`, creating it if missing and running
    /// crash recovery otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the on-disk
    /// capacity disagrees with `config.capacity`, a redo file fails
    /// validation, or any file cannot be opened. Partially opened files
    /// are released before the error propagates.
    pub fn open<P: AsRef<Path>>(home_dir: P, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(home_dir.as_ref())?;

        let data = if config.checked {
            DataLayer::Checked(CheckedDataArray::open(home_dir.as_ref(), &config)?)
        } else {
            DataLayer::Plain(DataArray::open(home_dir.as_ref(), &config)?)
        };

        Ok(Self { data, closed: AtomicBool::new(false) })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    /// Returns the payload stored at `index`, or `None`.
    pub fn get(&self, index: u32) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        match &self.data {
            DataLayer::Plain(data) => data.get_data(index),
            DataLayer::Checked(data) => data.get_data(index),
        }
    }

    /// Copies the payload stored at `index` into `dst[offset..]`.
    ///
    /// Returns the number of bytes copied, or `None` for no-data.
    pub fn get_into(&self, index: u32, dst: &mut [u8], offset: usize) -> Result<Option<usize>> {
        self.check_open()?;
        match &self.data {
            DataLayer::Plain(data) => data.get_data_into(index, dst, offset),
            DataLayer::Checked(data) => data.get_data_into(index, dst, offset),
        }
    }

    /// Stores `data` at `index` under `scn`.
    pub fn set(&self, index: u32, data: &[u8], scn: u64) -> Result<()> {
        self.check_open()?;
        match &self.data {
            DataLayer::Plain(inner) => inner.set_data(index, Some(data), scn),
            DataLayer::Checked(inner) => inner.set_data(index, Some(data), scn),
        }
    }

    /// Deletes the payload at `index` under `scn`.
    pub fn delete(&self, index: u32, scn: u64) -> Result<()> {
        self.check_open()?;
        match &self.data {
            DataLayer::Plain(data) => data.set_data(index, None, scn),
            DataLayer::Checked(data) => data.set_data(index, None, scn),
        }
    }

    /// Forces the current segment and flushes the redo log; afterwards
    /// everything up to the high water mark is durable and
    /// `lw_mark() == hw_mark()`.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        log::info!("store prior-sync: lwMark={} hwMark={}", self.lw_mark()?, self.hw_mark()?);
        match &self.data {
            DataLayer::Plain(data) => data.sync(),
            DataLayer::Checked(data) => data.sync(),
        }
    }

    /// Forces the current segment only; the watermarks do not move.
    pub fn persist(&self) -> Result<()> {
        self.check_open()?;
        match &self.data {
            DataLayer::Plain(data) => data.persist(),
            DataLayer::Checked(data) => data.persist(),
        }
    }

    /// Runs one bounded compaction step; returns whether a segment was
    /// drained.
    pub fn compact(&self) -> Result<bool> {
        self.check_open()?;
        match &self.data {
            DataLayer::Plain(data) => data.compact(),
            DataLayer::Checked(data) => data.compact(),
        }
    }

    /// Removes every payload and truncates the redo log.
    pub fn clear(&self) -> Result<()> {
        self.check_open()?;
        match &self.data {
            DataLayer::Plain(data) => data.clear(),
            DataLayer::Checked(data) => data.clear(),
        }
    }

    /// The number of addressable indexes.
    pub fn capacity(&self) -> Result<u32> {
        self.check_open()?;
        Ok(match &self.data {
            DataLayer::Plain(data) => data.length(),
            DataLayer::Checked(data) => data.length(),
        })
    }

    /// The high water mark: largest SCN accepted so far.
    pub fn hw_mark(&self) -> Result<u64> {
        self.check_open()?;
        Ok(match &self.data {
            DataLayer::Plain(data) => data.hw_mark(),
            DataLayer::Checked(data) => data.hw_mark(),
        })
    }

    /// The low water mark: largest SCN guaranteed durable in the address
    /// file.
    pub fn lw_mark(&self) -> Result<u64> {
        self.check_open()?;
        Ok(match &self.data {
            DataLayer::Plain(data) => data.lw_mark(),
            DataLayer::Checked(data) => data.lw_mark(),
        })
    }

    /// Synchronizes the high water mark to `scn`.
    ///
    /// A value above the HWM advances it via a no-op write; a value below
    /// the LWM retreats both watermarks and requires
    /// [`StoreConfig::allow_watermark_rollback`].
    pub fn save_hw_mark(&self, scn: u64) -> Result<()> {
        self.check_open()?;
        match &self.data {
            DataLayer::Plain(data) => data.save_hw_mark(scn),
            DataLayer::Checked(data) => data.save_hw_mark(scn),
        }
    }

    /// Flushes all pending state and refuses further operations.
    ///
    /// Idempotent; a second close is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = match &self.data {
            DataLayer::Plain(data) => data.sync(),
            DataLayer::Checked(data) => data.sync(),
        };
        if let Err(e) = &result {
            log::error!("close failed to flush pending state: {}", e);
        }
        result
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best effort flush on drop.
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> StoreConfig {
        StoreConfig::new(8).segment_file_size_mb(1)
    }

    #[test]
    fn test_open_set_get() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), small_config()).unwrap();

        store.set(0, b"hello", 1).unwrap();
        assert_eq!(store.get(0).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.capacity().unwrap(), 8);
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), small_config()).unwrap();

        store.set(0, b"x", 1).unwrap();
        store.close().unwrap();
        // Idempotent close.
        store.close().unwrap();

        assert!(matches!(store.get(0), Err(Error::StoreClosed)));
        assert!(matches!(store.set(0, b"y", 2), Err(Error::StoreClosed)));
        assert!(matches!(store.sync(), Err(Error::StoreClosed)));
        assert!(matches!(store.hw_mark(), Err(Error::StoreClosed)));
        assert!(matches!(store.capacity(), Err(Error::StoreClosed)));
    }

    #[test]
    fn test_close_flushes() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path(), small_config()).unwrap();
            store.set(3, b"durable", 9).unwrap();
            store.close().unwrap();
        }

        let store = Store::open(dir.path(), small_config()).unwrap();
        assert_eq!(store.get(3).unwrap(), Some(b"durable".to_vec()));
        assert_eq!(store.lw_mark().unwrap(), 9);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(Store::open(dir.path(), StoreConfig::new(0)).is_err());
    }

    #[test]
    fn test_checked_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), small_config().checked(true)).unwrap();

        store.set(1, b"checked", 1).unwrap();
        assert_eq!(store.get(1).unwrap(), Some(b"checked".to_vec()));
    }
}
