//! Segment compaction.
//!
//! Compaction drains sealed segments whose live-byte ratio has fallen
//! below the configured factor: every record still referenced by the
//! address array is copied into a target segment and its address is
//! republished through the redo log with the compaction flag. The drained
//! source segment is reclaimed only after the low water mark has passed
//! the drain's highest SCN, so a crash at any point leaves the source
//! authoritative.
//!
//! The compactor runs cooperatively on the writer thread; one drain is
//! bounded by the size of a single source segment.

use crate::address::Address;
use crate::array::AddressArray;
use crate::error::{Error, Result};
use crate::segment::{Segment, SegmentManager, Mode, DATA_START_POSITION, RECORD_OVERHEAD};
use std::collections::HashMap;
use std::sync::Arc;

struct PendingReclaim {
    seg_id: u16,
    /// The source may be freed once LWM reaches this SCN.
    required_lwm: u64,
}

/// Drains low-load segments and tracks deferred reclaims.
pub struct Compactor {
    compact_factor: f64,
    compact_trigger: f64,
    target: Option<Arc<dyn Segment>>,
    pending: Vec<PendingReclaim>,
}

impl Compactor {
    /// Creates a compactor with the configured thresholds.
    pub fn new(compact_factor: f64, compact_trigger: f64) -> Self {
        Self { compact_factor, compact_trigger, target: None, pending: Vec::new() }
    }

    /// Picks the sealed segment with the lowest live ratio among those
    /// loaded past the trigger and below the live-ratio factor.
    ///
    /// Segments already drained (pending reclaim) and the compactor's own
    /// target are never candidates.
    pub fn pick_candidate(
        &self,
        segments: &[Arc<dyn Segment>],
        live_bytes: &HashMap<u16, u64>,
    ) -> Option<Arc<dyn Segment>> {
        let mut best: Option<(f64, &Arc<dyn Segment>)> = None;
        for segment in segments {
            if segment.mode() != Mode::ReadOnly {
                continue;
            }
            let seg_id = segment.seg_id();
            if self.pending.iter().any(|p| p.seg_id == seg_id) {
                continue;
            }
            if let Some(target) = &self.target {
                if target.seg_id() == seg_id {
                    continue;
                }
            }
            if segment.load_factor() <= self.compact_trigger {
                continue;
            }
            let load = segment.load_size();
            if load == 0 {
                continue;
            }
            let live = live_bytes.get(&seg_id).copied().unwrap_or(0);
            let ratio = live as f64 / load as f64;
            if ratio >= self.compact_factor {
                continue;
            }
            if best.map_or(true, |(best_ratio, _)| ratio < best_ratio) {
                best = Some((ratio, segment));
            }
        }
        best.map(|(_, segment)| segment.clone())
    }

    /// Copies every live record out of `source` and republishes its
    /// address, then queues the source for deferred reclaim.
    pub fn drain(
        &mut self,
        source: &Arc<dyn Segment>,
        address_array: &AddressArray,
        segments: &SegmentManager,
        live_bytes: &mut HashMap<u16, u64>,
    ) -> Result<()> {
        let source_id = source.seg_id();

        // Reverse map: offset -> owning index, one sweep of the array.
        let mut owners: HashMap<u32, (u32, Address)> = HashMap::new();
        for index in 0..address_array.length() {
            let address = address_array.get(index)?;
            if !address.is_null() && address.seg_id() == source_id {
                owners.insert(address.offset(), (index, address));
            }
        }

        // Copy live records front-to-back, publishing each under a fresh
        // SCN just above the high water mark.
        let mut copies: Vec<(u32, Address)> = Vec::new();
        let data_end = source.append_position();
        let mut pos = DATA_START_POSITION;
        let mut prefix = [0u8; 4];
        while (pos as u64) + RECORD_OVERHEAD as u64 <= data_end as u64 {
            source.read_at(pos, &mut prefix)?;
            let length = u32::from_be_bytes(prefix);
            let next = pos as u64 + RECORD_OVERHEAD as u64 + length as u64;
            if next > data_end as u64 {
                break;
            }
            if let Some(&(index, address)) = owners.get(&pos) {
                // Skip records superseded since the sweep.
                if address_array.get(index)? == address {
                    let payload = source.read_record(pos)?;
                    let new_address = self.copy_record(&payload, segments)?;
                    live_bytes
                        .entry(new_address.seg_id())
                        .and_modify(|bytes| *bytes += new_address.record_size())
                        .or_insert(new_address.record_size());
                    copies.push((index, new_address));
                }
            }
            pos = next as u32;
        }

        // Copied bytes must be durable before their addresses can reach
        // the redo log.
        if let Some(target) = &self.target {
            target.force()?;
        }

        let mut max_scn = address_array.hw_mark();
        for (index, new_address) in copies {
            let scn = address_array.hw_mark() + 1;
            address_array.set_compaction_address(index, new_address, scn)?;
            max_scn = max_scn.max(scn);
        }

        live_bytes.remove(&source_id);
        self.pending.push(PendingReclaim { seg_id: source_id, required_lwm: max_scn });
        log::info!(
            "drained segment {}: reclaim deferred until lwm >= {}",
            source_id,
            max_scn
        );
        Ok(())
    }

    /// Appends one payload to the target segment, rolling to a fresh
    /// target when full.
    fn copy_record(&mut self, payload: &[u8], segments: &SegmentManager) -> Result<Address> {
        let target = match &self.target {
            Some(target) => target.clone(),
            None => {
                let fresh = segments.allocate_segment()?;
                self.target = Some(fresh.clone());
                fresh
            }
        };
        match target.append(payload) {
            Ok(offset) => Ok(Address::pack(target.seg_id(), offset, payload.len() as u16)),
            Err(Error::SegmentOverflow) => {
                target.as_read_only()?;
                let fresh = segments.allocate_segment()?;
                let offset = fresh.append(payload)?;
                let address = Address::pack(fresh.seg_id(), offset, payload.len() as u16);
                self.target = Some(fresh);
                Ok(address)
            }
            Err(e) => Err(e),
        }
    }

    /// Frees every drained segment whose required LWM has been reached.
    pub fn reclaim_eligible(&mut self, lwm: u64, segments: &SegmentManager) -> Result<usize> {
        let mut freed = 0;
        let mut remaining = Vec::new();
        for pending in self.pending.drain(..) {
            if pending.required_lwm <= lwm {
                segments.free_segment(pending.seg_id)?;
                freed += 1;
            } else {
                remaining.push(pending);
            }
        }
        self.pending = remaining;
        Ok(freed)
    }

    /// Forgets all compaction state (used by `clear`).
    pub fn reset(&mut self) {
        self.target = None;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentFactoryKind;
    use tempfile::TempDir;

    const SEG_SIZE: u64 = 1024;

    fn open_parts(dir: &std::path::Path) -> (AddressArray, SegmentManager) {
        let address_array = AddressArray::open(dir, 16, 1000, 5, false, false).unwrap();
        let segments =
            SegmentManager::open(&dir.join("segs"), SegmentFactoryKind::Memory, SEG_SIZE).unwrap();
        (address_array, segments)
    }

    /// Writes `count` records into the current segment and publishes them.
    fn fill(
        address_array: &AddressArray,
        segments: &SegmentManager,
        live_bytes: &mut HashMap<u16, u64>,
        start_index: u32,
        count: u32,
        scn0: u64,
    ) {
        let current = segments.current();
        for k in 0..count {
            let payload = vec![b'a' + (k % 26) as u8; 100];
            let offset = current.append(&payload).unwrap();
            let address = Address::pack(current.seg_id(), offset, 100);
            address_array.set(start_index + k, address, scn0 + k as u64).unwrap();
            *live_bytes.entry(current.seg_id()).or_insert(0) += address.record_size();
        }
    }

    #[test]
    fn test_pick_candidate_ignores_writable_and_loaded_segments() {
        let dir = TempDir::new().unwrap();
        let (address_array, segments) = open_parts(dir.path());
        let mut live_bytes = HashMap::new();

        fill(&address_array, &segments, &mut live_bytes, 0, 8, 1);
        let compactor = Compactor::new(0.5, 0.1);

        // Current segment is writable: not a candidate.
        assert!(compactor.pick_candidate(&segments.segments(), &live_bytes).is_none());

        // Sealed but fully live: still not a candidate.
        segments.next_segment().unwrap();
        assert!(compactor.pick_candidate(&segments.segments(), &live_bytes).is_none());
    }

    #[test]
    fn test_drain_copies_live_records_and_defers_reclaim() {
        let dir = TempDir::new().unwrap();
        let (address_array, segments) = open_parts(dir.path());
        let mut live_bytes = HashMap::new();
        let mut compactor = Compactor::new(0.5, 0.1);

        fill(&address_array, &segments, &mut live_bytes, 0, 8, 1);
        let source = segments.current();
        segments.next_segment().unwrap();

        // Supersede six of the eight records so the live ratio drops.
        let current = segments.current();
        for index in 0..6u32 {
            let payload = vec![b'z'; 100];
            let offset = current.append(&payload).unwrap();
            let address = Address::pack(current.seg_id(), offset, 100);
            let old = address_array.get(index).unwrap();
            address_array.set(index, address, 100 + index as u64).unwrap();
            *live_bytes.entry(current.seg_id()).or_insert(0) += address.record_size();
            *live_bytes.get_mut(&old.seg_id()).unwrap() -= old.record_size();
        }

        let candidate = compactor.pick_candidate(&segments.segments(), &live_bytes).unwrap();
        assert_eq!(candidate.seg_id(), source.seg_id());

        let before_6 = address_array.get(6).unwrap();
        compactor.drain(&candidate, &address_array, &segments, &mut live_bytes).unwrap();

        // The two survivors moved off the source segment.
        let after_6 = address_array.get(6).unwrap();
        let after_7 = address_array.get(7).unwrap();
        assert_ne!(after_6, before_6);
        assert_ne!(after_6.seg_id(), source.seg_id());
        assert_ne!(after_7.seg_id(), source.seg_id());

        // Source not reclaimed yet: the compaction SCNs are above the LWM.
        assert!(segments.get(source.seg_id()).is_some());
        assert_eq!(compactor.reclaim_eligible(address_array.lw_mark(), &segments).unwrap(), 0);

        // After a sync the LWM covers the drain and the source goes away.
        address_array.sync().unwrap();
        assert_eq!(compactor.reclaim_eligible(address_array.lw_mark(), &segments).unwrap(), 1);
        assert!(segments.get(source.seg_id()).is_none());

        // The copied payloads survive.
        let seg = segments.get(after_6.seg_id()).unwrap();
        assert_eq!(seg.read_record(after_6.offset()).unwrap(), vec![b'g'; 100]);
        assert_eq!(seg.read_record(after_7.offset()).unwrap(), vec![b'h'; 100]);
    }

    #[test]
    fn test_drain_skips_superseded_records() {
        let dir = TempDir::new().unwrap();
        let (address_array, segments) = open_parts(dir.path());
        let mut live_bytes = HashMap::new();
        let mut compactor = Compactor::new(0.9, 0.01);

        fill(&address_array, &segments, &mut live_bytes, 0, 3, 1);
        let source = segments.current();
        segments.next_segment().unwrap();

        // Delete one record outright.
        let old = address_array.get(1).unwrap();
        address_array.set(1, Address::NULL, 10).unwrap();
        *live_bytes.get_mut(&old.seg_id()).unwrap() -= old.record_size();

        compactor.drain(&source, &address_array, &segments, &mut live_bytes).unwrap();
        assert!(address_array.get(1).unwrap().is_null());
        assert_ne!(address_array.get(0).unwrap().seg_id(), source.seg_id());
        assert_ne!(address_array.get(2).unwrap().seg_id(), source.seg_id());
    }
}
