//! Checksummed data array.
//!
//! Wraps the plain data array so that every stored payload carries an
//! Adler-32 trailer:
//!
//! ```text
//! [length: u32 BE][payload bytes][adler32: u32 LE]
//! ```
//!
//! Reads validate the trailer and strip it; a mismatch surfaces as
//! [`Error::DataCorrupted`] without affecting other records.

use super::DataArray;
use crate::address::MAX_DATA_LENGTH;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use adler::adler32_slice;
use std::path::Path;

/// Trailer size appended to every payload.
const CHECKSUM_SIZE: usize = 4;

/// A data array with per-record Adler-32 payload protection.
pub struct CheckedDataArray {
    inner: DataArray,
}

impl CheckedDataArray {
    /// Opens a checked data array under `home_dir`.
    pub fn open(home_dir: &Path, config: &StoreConfig) -> Result<Self> {
        Ok(Self { inner: DataArray::open(home_dir, config)? })
    }

    /// The number of addressable indexes.
    pub fn length(&self) -> u32 {
        self.inner.length()
    }

    /// Returns the verified payload stored at `index`, or `None`.
    pub fn get_data(&self, index: u32) -> Result<Option<Vec<u8>>> {
        let Some(mut stored) = self.inner.get_data(index)? else {
            return Ok(None);
        };
        let payload_len = self.verify(index, &stored)?;
        stored.truncate(payload_len);
        Ok(Some(stored))
    }

    /// Copies the verified payload stored at `index` into `dst[offset..]`.
    pub fn get_data_into(
        &self,
        index: u32,
        dst: &mut [u8],
        offset: usize,
    ) -> Result<Option<usize>> {
        let Some(stored) = self.inner.get_data(index)? else {
            return Ok(None);
        };
        let payload_len = self.verify(index, &stored)?;
        if offset + payload_len > dst.len() {
            return Err(Error::invalid_argument(format!(
                "destination too small: need {} bytes at offset {}, have {}",
                payload_len,
                offset,
                dst.len()
            )));
        }
        dst[offset..offset + payload_len].copy_from_slice(&stored[..payload_len]);
        Ok(Some(payload_len))
    }

    fn verify(&self, index: u32, stored: &[u8]) -> Result<usize> {
        if stored.len() < CHECKSUM_SIZE {
            return Err(Error::internal(format!(
                "checked record at index {} is only {} bytes",
                index,
                stored.len()
            )));
        }
        let payload_len = stored.len() - CHECKSUM_SIZE;
        let expected = adler32_slice(&stored[..payload_len]);
        let actual = u32::from_le_bytes(stored[payload_len..].try_into().unwrap());
        if expected != actual {
            return Err(Error::DataCorrupted { expected, actual });
        }
        Ok(payload_len)
    }

    /// Stores `data` at `index` with a checksum trailer; `None` deletes.
    pub fn set_data(&self, index: u32, data: Option<&[u8]>, scn: u64) -> Result<()> {
        match data {
            None => self.inner.set_data(index, None, scn),
            Some(data) => {
                if data.len() > MAX_DATA_LENGTH - CHECKSUM_SIZE {
                    return Err(Error::invalid_argument(format!(
                        "payload of {} bytes exceeds the {} byte checked record limit",
                        data.len(),
                        MAX_DATA_LENGTH - CHECKSUM_SIZE
                    )));
                }
                let mut framed = Vec::with_capacity(data.len() + CHECKSUM_SIZE);
                framed.extend_from_slice(data);
                framed.extend_from_slice(&adler32_slice(data).to_le_bytes());
                self.inner.set_data(index, Some(&framed), scn)
            }
        }
    }

    /// Forces the current segment and flushes the redo log.
    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    /// Forces the current segment only.
    pub fn persist(&self) -> Result<()> {
        self.inner.persist()
    }

    /// Zeros the array and drops all segments.
    pub fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    /// One bounded compaction step.
    pub fn compact(&self) -> Result<bool> {
        self.inner.compact()
    }

    /// The high water mark.
    pub fn hw_mark(&self) -> u64 {
        self.inner.hw_mark()
    }

    /// The low water mark.
    pub fn lw_mark(&self) -> u64 {
        self.inner.lw_mark()
    }

    /// Synchronizes the high water mark to `scn`.
    pub fn save_hw_mark(&self, scn: u64) -> Result<()> {
        self.inner.save_hw_mark(scn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> StoreConfig {
        StoreConfig::new(16).segment_file_size_mb(1).checked(true)
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let data = CheckedDataArray::open(dir.path(), &small_config()).unwrap();

        data.set_data(0, Some(b"guarded"), 1).unwrap();
        assert_eq!(data.get_data(0).unwrap(), Some(b"guarded".to_vec()));
        assert_eq!(data.get_data(1).unwrap(), None);
    }

    #[test]
    fn test_get_data_into_strips_trailer() {
        let dir = TempDir::new().unwrap();
        let data = CheckedDataArray::open(dir.path(), &small_config()).unwrap();

        data.set_data(2, Some(b"abc"), 1).unwrap();
        let mut dst = [0u8; 8];
        assert_eq!(data.get_data_into(2, &mut dst, 0).unwrap(), Some(3));
        assert_eq!(&dst[..3], b"abc");
    }

    #[test]
    fn test_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let data = CheckedDataArray::open(dir.path(), &small_config()).unwrap();

        data.set_data(0, Some(b"intact"), 1).unwrap();
        // Store bytes that never went through the checksum framing; the
        // trailer the reader sees cannot match.
        data.inner.set_data(1, Some(b"damaged bytes"), 2).unwrap();

        assert!(matches!(data.get_data(1), Err(Error::DataCorrupted { .. })));
        // Other records are unaffected.
        assert_eq!(data.get_data(0).unwrap(), Some(b"intact".to_vec()));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let data = CheckedDataArray::open(dir.path(), &small_config()).unwrap();

        data.set_data(0, Some(b"x"), 1).unwrap();
        data.set_data(0, None, 2).unwrap();
        assert_eq!(data.get_data(0).unwrap(), None);
    }

    #[test]
    fn test_checked_record_limit() {
        let dir = TempDir::new().unwrap();
        let data = CheckedDataArray::open(dir.path(), &small_config()).unwrap();

        let oversized = vec![0u8; MAX_DATA_LENGTH - CHECKSUM_SIZE + 1];
        assert!(data.set_data(0, Some(&oversized), 1).is_err());

        let max = vec![0u8; MAX_DATA_LENGTH - CHECKSUM_SIZE];
        data.set_data(0, Some(&max), 2).unwrap();
        assert_eq!(data.get_data(0).unwrap().unwrap().len(), max.len());
    }
}
