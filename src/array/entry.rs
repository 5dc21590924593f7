//! Redo-entry batch format.
//!
//! Every address-array mutation is logged into the current redo batch;
//! sealed batches are persisted to uniquely-named `.redo` files:
//!
//! ```text
//! header:  magic:u64 "KRATILOG", version:u16, kind:u8, count:u32,
//!          minScn:u64, maxScn:u64          (little-endian)
//! body:    count records
//!            normal:     [index:u32][newAddress:u64][oldAddress:u64][scn:u64]
//!            compaction: [index:u32][newAddress:u64][scn:u64]
//! trailer: CRC32 over the body
//! ```

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;

/// Magic number for redo-entry files ("KRATILOG" on disk).
pub const ENTRY_MAGIC: u64 = 0x474F_4C49_5441_524B;

/// Redo-entry format version.
pub const ENTRY_FORMAT_VERSION: u16 = 1;

/// Size of the entry-file header in bytes.
pub const ENTRY_HEADER_SIZE: usize = 31;

/// The flavour of a redo batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// A writer update; records the superseded address as well.
    Normal = 0,
    /// An update issued by the compactor while copying a record.
    Compaction = 1,
}

impl EntryKind {
    /// Convert from u8 to EntryKind
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EntryKind::Normal),
            1 => Ok(EntryKind::Compaction),
            _ => Err(Error::redo_corrupted(format!("invalid entry kind: {}", value))),
        }
    }

    /// Bytes one record of this kind occupies in the body.
    pub fn record_size(self) -> usize {
        match self {
            EntryKind::Normal => 28,
            EntryKind::Compaction => 20,
        }
    }
}

/// One logged address update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRecord {
    /// The mutated array index.
    pub index: u32,
    /// The address written.
    pub new_address: u64,
    /// The address superseded (zero in compaction batches).
    pub old_address: u64,
    /// The SCN supplied with the write.
    pub scn: u64,
}

/// An SCN-ordered batch of address updates.
#[derive(Debug, Clone)]
pub struct EntryBatch {
    /// The batch flavour.
    pub kind: EntryKind,
    /// The logged updates, non-decreasing in SCN.
    pub records: Vec<EntryRecord>,
}

impl EntryBatch {
    /// Creates an empty batch of the given kind.
    pub fn new(kind: EntryKind) -> Self {
        Self { kind, records: Vec::new() }
    }

    /// The smallest SCN in the batch.
    pub fn min_scn(&self) -> u64 {
        self.records.first().map(|r| r.scn).unwrap_or(0)
    }

    /// The largest SCN in the batch.
    pub fn max_scn(&self) -> u64 {
        self.records.last().map(|r| r.scn).unwrap_or(0)
    }

    /// Encodes the batch into file bytes.
    pub fn encode(&self) -> Vec<u8> {
        let record_size = self.kind.record_size();
        let mut buf =
            BytesMut::with_capacity(ENTRY_HEADER_SIZE + self.records.len() * record_size + 4);

        buf.put_u64_le(ENTRY_MAGIC);
        buf.put_u16_le(ENTRY_FORMAT_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.records.len() as u32);
        buf.put_u64_le(self.min_scn());
        buf.put_u64_le(self.max_scn());

        let mut body = BytesMut::with_capacity(self.records.len() * record_size);
        for record in &self.records {
            body.put_u32_le(record.index);
            body.put_u64_le(record.new_address);
            if self.kind == EntryKind::Normal {
                body.put_u64_le(record.old_address);
            }
            body.put_u64_le(record.scn);
        }

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        buf.extend_from_slice(&body);
        buf.put_u32_le(checksum);
        buf.to_vec()
    }

    /// Decodes a batch from file bytes, validating magic, version and CRC.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_HEADER_SIZE + 4 {
            return Err(Error::redo_corrupted(format!(
                "entry file too short: {} bytes",
                data.len()
            )));
        }

        let magic = data.get_u64_le();
        if magic != ENTRY_MAGIC {
            return Err(Error::redo_corrupted(format!("bad entry magic {:#x}", magic)));
        }
        let version = data.get_u16_le();
        if version != ENTRY_FORMAT_VERSION {
            return Err(Error::redo_corrupted(format!(
                "entry version {}, expected {}",
                version, ENTRY_FORMAT_VERSION
            )));
        }
        let kind = EntryKind::from_u8(data.get_u8())?;
        let count = data.get_u32_le() as usize;
        let min_scn = data.get_u64_le();
        let max_scn = data.get_u64_le();

        let body_size = count * kind.record_size();
        if data.len() != body_size + 4 {
            return Err(Error::redo_corrupted(format!(
                "entry body: expected {} bytes, got {}",
                body_size + 4,
                data.len()
            )));
        }

        let mut hasher = Hasher::new();
        hasher.update(&data[..body_size]);
        let expected = hasher.finalize();

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let index = data.get_u32_le();
            let new_address = data.get_u64_le();
            let old_address = if kind == EntryKind::Normal { data.get_u64_le() } else { 0 };
            let scn = data.get_u64_le();
            records.push(EntryRecord { index, new_address, old_address, scn });
        }

        let checksum = data.get_u32_le();
        if checksum != expected {
            return Err(Error::redo_corrupted(format!(
                "entry CRC mismatch: expected {:#x}, got {:#x}",
                expected, checksum
            )));
        }

        let batch = Self { kind, records };
        if batch.min_scn() != min_scn || batch.max_scn() != max_scn {
            return Err(Error::redo_corrupted("entry SCN range disagrees with header"));
        }
        Ok(batch)
    }
}

/// Generate a redo filename for a sealed batch.
pub fn entry_filename(min_scn: u64, max_scn: u64, kind: EntryKind) -> String {
    format!("entry_{}_{}_{}.redo", min_scn, max_scn, kind as u8)
}

/// Parse a redo filename into `(minScn, maxScn, kind)`.
pub fn parse_entry_filename(filename: &str) -> Option<(u64, u64, EntryKind)> {
    let name = filename.strip_suffix(".redo")?.strip_prefix("entry_")?;
    let mut parts = name.split('_');
    let min_scn = parts.next()?.parse().ok()?;
    let max_scn = parts.next()?.parse().ok()?;
    let kind = EntryKind::from_u8(parts.next()?.parse().ok()?).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((min_scn, max_scn, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch(kind: EntryKind) -> EntryBatch {
        let mut batch = EntryBatch::new(kind);
        batch.records.push(EntryRecord { index: 0, new_address: 100, old_address: 0, scn: 1 });
        batch.records.push(EntryRecord { index: 5, new_address: 200, old_address: 100, scn: 2 });
        batch.records.push(EntryRecord { index: 0, new_address: 300, old_address: 100, scn: 2 });
        batch
    }

    #[test]
    fn test_encode_decode_normal() {
        let batch = sample_batch(EntryKind::Normal);
        let encoded = batch.encode();
        assert_eq!(encoded.len(), ENTRY_HEADER_SIZE + 3 * 28 + 4);

        let decoded = EntryBatch::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, EntryKind::Normal);
        assert_eq!(decoded.records, batch.records);
        assert_eq!(decoded.min_scn(), 1);
        assert_eq!(decoded.max_scn(), 2);
    }

    #[test]
    fn test_encode_decode_compaction() {
        let mut batch = sample_batch(EntryKind::Compaction);
        // Compaction batches carry no old address.
        for record in &mut batch.records {
            record.old_address = 0;
        }
        let encoded = batch.encode();
        assert_eq!(encoded.len(), ENTRY_HEADER_SIZE + 3 * 20 + 4);

        let decoded = EntryBatch::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, EntryKind::Compaction);
        assert_eq!(decoded.records, batch.records);
    }

    #[test]
    fn test_crc_validation() {
        let batch = sample_batch(EntryKind::Normal);
        let mut encoded = batch.encode();
        encoded[ENTRY_HEADER_SIZE + 3] ^= 0xFF;

        assert!(matches!(EntryBatch::decode(&encoded), Err(Error::RedoCorrupted(_))));
    }

    #[test]
    fn test_bad_magic() {
        let batch = sample_batch(EntryKind::Normal);
        let mut encoded = batch.encode();
        encoded[0] ^= 0xFF;
        assert!(matches!(EntryBatch::decode(&encoded), Err(Error::RedoCorrupted(_))));
    }

    #[test]
    fn test_empty_batch_round_trip() {
        let batch = EntryBatch::new(EntryKind::Normal);
        let decoded = EntryBatch::decode(&batch.encode()).unwrap();
        assert!(decoded.records.is_empty());
    }

    #[test]
    fn test_entry_filename() {
        assert_eq!(entry_filename(1, 99, EntryKind::Normal), "entry_1_99_0.redo");
        assert_eq!(entry_filename(100, 100, EntryKind::Compaction), "entry_100_100_1.redo");
    }

    #[test]
    fn test_parse_entry_filename() {
        assert_eq!(parse_entry_filename("entry_1_99_0.redo"), Some((1, 99, EntryKind::Normal)));
        assert_eq!(
            parse_entry_filename("entry_100_100_1.redo"),
            Some((100, 100, EntryKind::Compaction))
        );
        assert_eq!(parse_entry_filename("indexes.dat"), None);
        assert_eq!(parse_entry_filename("entry_1_99.redo"), None);
        assert_eq!(parse_entry_filename("entry_1_99_7.redo"), None);
        assert_eq!(parse_entry_filename("entry_1_99_0_extra.redo"), None);
    }
}
