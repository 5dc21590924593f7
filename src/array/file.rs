//! The persistent address file `indexes.dat`.
//!
//! Layout (little-endian):
//!
//! ```text
//! [magic: u64 = "KRATIDX1"]
//! [version: u32]
//! [length: u32]          // number of address slots
//! [lwmScn: u64]          // low water mark
//! [hwmScn: u64]          // high water mark
//! [N * 8 bytes]          // address slots
//! ```
//!
//! The file reflects address writes only up to the low water mark; redo
//! entry files carry everything between the two marks.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Magic number for `indexes.dat` ("KRATIDX1" on disk).
pub const ARRAY_FILE_MAGIC: u64 = 0x3158_4449_5441_524B;

/// Address-file format version.
pub const ARRAY_FILE_VERSION: u32 = 1;

/// Size of the `indexes.dat` header in bytes.
pub const ARRAY_FILE_HEADER_SIZE: u64 = 32;

/// The on-disk address array with its watermark header.
pub struct ArrayFile {
    file: File,
    length: u32,
    lwm_scn: u64,
    hwm_scn: u64,
}

impl ArrayFile {
    /// Opens or creates `indexes.dat` for `length` slots.
    ///
    /// Fails with [`Error::CapacityMismatch`] when an existing file was
    /// created for a different length.
    pub fn open(path: &Path, length: u32) -> Result<Self> {
        if path.exists() {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let mut header = [0u8; ARRAY_FILE_HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;

            let magic = u64::from_le_bytes(header[0..8].try_into().unwrap());
            if magic != ARRAY_FILE_MAGIC {
                return Err(Error::redo_corrupted(format!(
                    "indexes.dat has bad magic {:#x}",
                    magic
                )));
            }
            let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
            if version != ARRAY_FILE_VERSION {
                return Err(Error::redo_corrupted(format!(
                    "indexes.dat has version {}, expected {}",
                    version, ARRAY_FILE_VERSION
                )));
            }
            let stored_length = u32::from_le_bytes(header[12..16].try_into().unwrap());
            if stored_length != length {
                return Err(Error::CapacityMismatch { expected: length, actual: stored_length });
            }
            let lwm_scn = u64::from_le_bytes(header[16..24].try_into().unwrap());
            let hwm_scn = u64::from_le_bytes(header[24..32].try_into().unwrap());

            Ok(Self { file, length, lwm_scn, hwm_scn })
        } else {
            let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
            file.set_len(ARRAY_FILE_HEADER_SIZE + length as u64 * 8)?;
            let mut array_file = Self { file, length, lwm_scn: 0, hwm_scn: 0 };
            array_file.write_header()?;
            array_file.force()?;
            Ok(array_file)
        }
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; ARRAY_FILE_HEADER_SIZE as usize];
        header[0..8].copy_from_slice(&ARRAY_FILE_MAGIC.to_le_bytes());
        header[8..12].copy_from_slice(&ARRAY_FILE_VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&self.length.to_le_bytes());
        header[16..24].copy_from_slice(&self.lwm_scn.to_le_bytes());
        header[24..32].copy_from_slice(&self.hwm_scn.to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    /// Reads all address slots into a vector.
    pub fn load(&mut self) -> Result<Vec<u64>> {
        let mut body = vec![0u8; self.length as usize * 8];
        self.file.seek(SeekFrom::Start(ARRAY_FILE_HEADER_SIZE))?;
        self.file.read_exact(&mut body)?;
        Ok(body
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect())
    }

    /// Writes one address slot in place.
    pub fn write_address(&mut self, index: u32, value: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(ARRAY_FILE_HEADER_SIZE + index as u64 * 8))?;
        self.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// Rewrites the watermark header fields.
    pub fn set_water_marks(&mut self, lwm_scn: u64, hwm_scn: u64) -> Result<()> {
        self.lwm_scn = lwm_scn;
        self.hwm_scn = hwm_scn;
        self.write_header()
    }

    /// Durably persists the file.
    pub fn force(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Zeroes every slot and resets the watermarks.
    pub fn reset(&mut self, lwm_scn: u64) -> Result<()> {
        let zeros = vec![0u8; self.length as usize * 8];
        self.file.seek(SeekFrom::Start(ARRAY_FILE_HEADER_SIZE))?;
        self.file.write_all(&zeros)?;
        self.set_water_marks(lwm_scn, lwm_scn)?;
        self.force()
    }

    /// The number of slots.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// The durable low water mark.
    pub fn lwm_scn(&self) -> u64 {
        self.lwm_scn
    }

    /// The high water mark at last header write.
    pub fn hwm_scn(&self) -> u64 {
        self.hwm_scn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexes.dat");

        {
            let mut file = ArrayFile::open(&path, 16).unwrap();
            assert_eq!(file.length(), 16);
            assert_eq!(file.lwm_scn(), 0);
            file.write_address(3, 0xDEAD_BEEF).unwrap();
            file.set_water_marks(5, 9).unwrap();
            file.force().unwrap();
        }

        let mut file = ArrayFile::open(&path, 16).unwrap();
        assert_eq!(file.lwm_scn(), 5);
        assert_eq!(file.hwm_scn(), 9);
        let values = file.load().unwrap();
        assert_eq!(values.len(), 16);
        assert_eq!(values[3], 0xDEAD_BEEF);
        assert_eq!(values[0], 0);
    }

    #[test]
    fn test_capacity_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexes.dat");

        ArrayFile::open(&path, 16).unwrap();
        let result = ArrayFile::open(&path, 32);
        assert!(matches!(
            result,
            Err(Error::CapacityMismatch { expected: 32, actual: 16 })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexes.dat");

        std::fs::write(&path, vec![0xFF; 64]).unwrap();
        assert!(matches!(ArrayFile::open(&path, 4), Err(Error::RedoCorrupted(_))));
    }

    #[test]
    fn test_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexes.dat");

        let mut file = ArrayFile::open(&path, 8).unwrap();
        file.write_address(2, 42).unwrap();
        file.set_water_marks(7, 7).unwrap();
        file.reset(7).unwrap();

        assert_eq!(file.load().unwrap(), vec![0; 8]);
        assert_eq!(file.lwm_scn(), 7);
        assert_eq!(file.hwm_scn(), 7);
    }
}
