//! Configuration for opening a store.

use crate::address;
use crate::error::{Error, Result};

/// Configuration for opening a [`Store`](crate::Store).
///
/// `capacity` is required; everything else carries the defaults below.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of addressable indexes. Fixed for the lifetime of the store.
    pub capacity: u32,

    /// Segment file size in MB.
    /// Default: 256
    pub segment_file_size_mb: u32,

    /// Number of address updates per redo-entry batch.
    /// Default: 10_000
    pub batch_size: usize,

    /// Number of sealed redo batches accumulated before they are applied
    /// into `indexes.dat` and pruned.
    /// Default: 5
    pub max_entries: usize,

    /// Live-byte ratio below which a sealed segment becomes a compaction
    /// candidate.
    /// Default: 0.5
    pub segment_compact_factor: f64,

    /// Minimum load factor before a segment is considered for compaction
    /// at all.
    /// Default: 0.1
    pub segment_compact_trigger: f64,

    /// Apply an Adler-32 checksum trailer to every payload.
    /// Default: false
    pub checked: bool,

    /// Which segment realization to use.
    /// Default: SegmentFactoryKind::Memory
    pub segment_factory_kind: SegmentFactoryKind,

    /// Permit `save_hw_mark` to retreat the watermarks. Rollback is a
    /// testing hook; leave this off in production.
    /// Default: false
    pub allow_watermark_rollback: bool,

    /// Discard a CRC-invalid redo file during recovery when it lies
    /// entirely above the durable low water mark, instead of refusing to
    /// open.
    /// Default: false
    pub discard_corrupt_tail: bool,
}

/// Segment realizations selectable at open time.
///
/// All four persist identical byte layouts and are interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFactoryKind {
    /// Entire segment mirrored in a heap buffer, flushed on force.
    Memory,
    /// Appends pass through a bounded write buffer into the OS file.
    WriteBuffer,
    /// Appends go straight to the file handle, no intermediate buffer.
    Channel,
    /// Segment file memory-mapped read-write.
    Mapped,
}

impl StoreConfig {
    /// Creates a configuration for a store of `capacity` indexes with
    /// default values for everything else.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            segment_file_size_mb: 256,
            batch_size: 10_000,
            max_entries: 5,
            segment_compact_factor: 0.5,
            segment_compact_trigger: 0.1,
            checked: false,
            segment_factory_kind: SegmentFactoryKind::Memory,
            allow_watermark_rollback: false,
            discard_corrupt_tail: false,
        }
    }

    /// Sets the segment file size in MB.
    pub fn segment_file_size_mb(mut self, mb: u32) -> Self {
        self.segment_file_size_mb = mb;
        self
    }

    /// Sets the redo-entry batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the number of sealed batches held before apply-and-prune.
    pub fn max_entries(mut self, count: usize) -> Self {
        self.max_entries = count;
        self
    }

    /// Sets the live-byte ratio threshold for compaction candidates.
    pub fn segment_compact_factor(mut self, factor: f64) -> Self {
        self.segment_compact_factor = factor;
        self
    }

    /// Sets the minimum load factor before compaction is considered.
    pub fn segment_compact_trigger(mut self, trigger: f64) -> Self {
        self.segment_compact_trigger = trigger;
        self
    }

    /// Enables or disables payload checksums.
    pub fn checked(mut self, value: bool) -> Self {
        self.checked = value;
        self
    }

    /// Selects the segment realization.
    pub fn segment_factory_kind(mut self, kind: SegmentFactoryKind) -> Self {
        self.segment_factory_kind = kind;
        self
    }

    /// Permits `save_hw_mark` to retreat the watermarks.
    pub fn allow_watermark_rollback(mut self, value: bool) -> Self {
        self.allow_watermark_rollback = value;
        self
    }

    /// Tolerates a corrupt redo tail during recovery.
    pub fn discard_corrupt_tail(mut self, value: bool) -> Self {
        self.discard_corrupt_tail = value;
        self
    }

    /// Segment capacity in bytes.
    pub fn segment_size_bytes(&self) -> u64 {
        self.segment_file_size_mb as u64 * 1024 * 1024
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::invalid_argument("capacity must be > 0"));
        }
        if self.segment_file_size_mb == 0 {
            return Err(Error::invalid_argument("segment_file_size_mb must be > 0"));
        }
        // Every byte offset inside a segment must fit the address layout.
        if self.segment_size_bytes() > address::MAX_OFFSET {
            return Err(Error::invalid_argument(format!(
                "segment_file_size_mb {} exceeds the addressable offset range",
                self.segment_file_size_mb
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_argument("batch_size must be > 0"));
        }
        if self.max_entries == 0 {
            return Err(Error::invalid_argument("max_entries must be > 0"));
        }
        if self.segment_compact_factor <= 0.0 || self.segment_compact_factor >= 1.0 {
            return Err(Error::invalid_argument(
                "segment_compact_factor must be between 0 and 1",
            ));
        }
        if self.segment_compact_trigger < 0.0 || self.segment_compact_trigger >= 1.0 {
            return Err(Error::invalid_argument(
                "segment_compact_trigger must be between 0 and 1",
            ));
        }
        Ok(())
    }
}
