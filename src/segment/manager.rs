//! Segment manager.
//!
//! Owns the `segs/` directory: allocates the writable current segment,
//! looks up sealed segments for reads, hands fresh target segments to the
//! compactor and reclaims drained ones. On open it scans the directory,
//! validates segment headers and resumes the most recently forced segment
//! that still has room.

use super::{create_segment, open_segment, parse_seg_filename, seg_filename, Segment};
use crate::config::SegmentFactoryKind;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct ManagerState {
    segments: BTreeMap<u16, Arc<dyn Segment>>,
    current: Arc<dyn Segment>,
}

/// Manages the set of segment files under one directory.
pub struct SegmentManager {
    dir: PathBuf,
    kind: SegmentFactoryKind,
    segment_size: u64,
    state: RwLock<ManagerState>,
}

impl SegmentManager {
    /// Opens the manager over `dir`, creating the directory if needed.
    ///
    /// Existing segments are opened read-only except for the resume
    /// target: the segment with the largest last-forced time that still
    /// has room. A brand new segment is allocated when none qualifies.
    pub fn open(dir: &Path, kind: SegmentFactoryKind, segment_size: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut segments: BTreeMap<u16, Arc<dyn Segment>> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(seg_id) = parse_seg_filename(name) else { continue };
            let segment = open_segment(kind, seg_id, &entry.path(), segment_size)?;
            segments.insert(seg_id, segment);
        }

        // Resume the most recently forced segment that still has room.
        let resume_id = segments
            .values()
            .filter(|s| (s.append_position() as u64) < s.initial_size())
            .max_by_key(|s| s.last_forced_time())
            .map(|s| s.seg_id());

        for segment in segments.values() {
            if Some(segment.seg_id()) != resume_id {
                segment.as_read_only()?;
            }
        }

        let current = match resume_id {
            Some(id) => segments.get(&id).cloned().ok_or_else(|| {
                Error::internal(format!("resume segment {} vanished during open", id))
            })?,
            None => {
                let id = smallest_free_id(&segments)?;
                let segment = create_segment(kind, id, &dir.join(seg_filename(id)), segment_size)?;
                segments.insert(id, segment.clone());
                segment
            }
        };

        log::info!(
            "segment manager opened: {} segment(s), current={}, dir={}",
            segments.len(),
            current.seg_id(),
            dir.display()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            kind,
            segment_size,
            state: RwLock::new(ManagerState { segments, current }),
        })
    }

    /// The writable current segment.
    pub fn current(&self) -> Arc<dyn Segment> {
        self.state.read().current.clone()
    }

    /// Looks up a segment by id.
    pub fn get(&self, seg_id: u16) -> Option<Arc<dyn Segment>> {
        self.state.read().segments.get(&seg_id).cloned()
    }

    /// Snapshot of all managed segments.
    pub fn segments(&self) -> Vec<Arc<dyn Segment>> {
        self.state.read().segments.values().cloned().collect()
    }

    /// Seals the current segment and makes a freshly allocated one current.
    pub fn next_segment(&self) -> Result<Arc<dyn Segment>> {
        let mut state = self.state.write();
        state.current.as_read_only()?;
        let id = smallest_free_id(&state.segments)?;
        let segment =
            create_segment(self.kind, id, &self.dir.join(seg_filename(id)), self.segment_size)?;
        state.segments.insert(id, segment.clone());
        state.current = segment.clone();
        log::info!("rotated to segment {}", id);
        Ok(segment)
    }

    /// Allocates a writable segment that is not the writer's current.
    ///
    /// Used by the compactor for its copy target.
    pub fn allocate_segment(&self) -> Result<Arc<dyn Segment>> {
        let mut state = self.state.write();
        let id = smallest_free_id(&state.segments)?;
        let segment =
            create_segment(self.kind, id, &self.dir.join(seg_filename(id)), self.segment_size)?;
        state.segments.insert(id, segment.clone());
        Ok(segment)
    }

    /// Releases a segment and unlinks its file.
    ///
    /// Only legal once the caller has established that no live address
    /// references the segment.
    pub fn free_segment(&self, seg_id: u16) -> Result<()> {
        let segment = {
            let mut state = self.state.write();
            if state.current.seg_id() == seg_id {
                return Err(Error::invalid_argument(format!(
                    "cannot free current segment {}",
                    seg_id
                )));
            }
            state.segments.remove(&seg_id)
        };
        match segment {
            Some(segment) => {
                segment.free()?;
                fs::remove_file(self.dir.join(seg_filename(seg_id)))?;
                log::info!("freed segment {}", seg_id);
                Ok(())
            }
            None => Err(Error::invalid_argument(format!("unknown segment {}", seg_id))),
        }
    }

    /// Forces the current segment.
    pub fn force_current(&self) -> Result<()> {
        self.current().force()
    }

    /// Drops every segment and recreates a single empty current segment.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        let ids: Vec<u16> = state.segments.keys().copied().collect();
        for id in ids {
            state.segments.remove(&id);
            fs::remove_file(self.dir.join(seg_filename(id)))?;
        }
        let segment =
            create_segment(self.kind, 0, &self.dir.join(seg_filename(0)), self.segment_size)?;
        state.segments.insert(0, segment.clone());
        state.current = segment;
        Ok(())
    }

    /// Segment capacity in bytes.
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }
}

fn smallest_free_id(segments: &BTreeMap<u16, Arc<dyn Segment>>) -> Result<u16> {
    let mut candidate: u16 = 0;
    for &id in segments.keys() {
        if id > candidate {
            return Ok(candidate);
        }
        candidate = match candidate.checked_add(1) {
            Some(next) => next,
            None => return Err(Error::OutOfSegments),
        };
    }
    Ok(candidate)
}
