//! The store manifest: a small append-only file recording where each Raft
//! group's durable state lives in its WAL, along with the region catalog.
//!
//! Records are framed like WAL records (length, checksum, bincode payload).
//! The manifest is replayed in full on open, later records superseding earlier
//! ones. Once enough superseded records accumulate, the manifest is compacted
//! by writing the live state to a temporary file and renaming it into place.

use super::wal::{read_frames, write_frame};
use crate::encoding::{self, Value as _};
use crate::error::Result;
use crate::region::{RegionId, RegionMeta};
use crate::errinput;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Compact the manifest once it contains this many superseded records.
const COMPACT_THRESHOLD: usize = 4096;

/// The durable state of a Raft group's log, as recorded in the manifest. All
/// fields are monotonically non-decreasing, and the pointer is only advanced
/// after the corresponding WAL record has been durably written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLogPointer {
    /// The Raft group, i.e. the region ID.
    pub group_id: u64,
    /// The WAL position just past the last persisted record.
    pub segment: u64,
    pub offset: u64,
    /// The last index applied to the state machine, and its term.
    pub applied_index: u64,
    pub applied_term: u64,
    /// The index and term of the last applied snapshot, if any.
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    /// Entries at or below this index have been compacted away.
    pub truncated_index: u64,
    pub truncated_term: u64,
    /// The last persisted commit index.
    pub committed: u64,
    /// The WAL segment containing the truncation point. Segments before it
    /// can be garbage collected.
    pub segment_index: u64,
}

impl encoding::Value for RaftLogPointer {}

impl RaftLogPointer {
    /// Returns the first field that regressed in other compared to self, if any.
    pub(crate) fn regression(&self, other: &RaftLogPointer) -> Option<&'static str> {
        if (other.segment, other.offset) < (self.segment, self.offset) {
            Some("position")
        } else if other.applied_index < self.applied_index {
            Some("applied_index")
        } else if other.snapshot_index < self.snapshot_index {
            Some("snapshot_index")
        } else if other.truncated_index < self.truncated_index {
            Some("truncated_index")
        } else if other.committed < self.committed {
            Some("committed")
        } else if other.segment_index < self.segment_index {
            Some("segment_index")
        } else {
            None
        }
    }
}

/// A manifest record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Record {
    /// A Raft log pointer update.
    Pointer(RaftLogPointer),
    /// Removes a Raft group's pointer, when its peer is destroyed.
    RemoveGroup(u64),
    /// A region catalog update.
    Region(RegionMeta),
    /// Removes a region from the catalog.
    RemoveRegion(RegionId),
}

impl encoding::Value for Record {}

/// The store manifest. Shared by all Raft groups on the store and the region
/// catalog, so it is internally synchronized.
pub struct Manifest {
    path: PathBuf,
    sync: bool,
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    pointers: HashMap<u64, RaftLogPointer>,
    regions: BTreeMap<RegionId, RegionMeta>,
    /// The number of records in the file that have been superseded.
    garbage: usize,
}

impl Manifest {
    /// Opens the manifest at the given path, creating it if necessary.
    pub fn open(path: &Path, sync: bool) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut pointers = HashMap::new();
        let mut regions = BTreeMap::new();
        let mut garbage = 0;
        if path.exists() {
            let (frames, valid) = read_frames(path)?;
            let len = std::fs::metadata(path)?.len();
            if valid < len {
                warn!("Truncating torn manifest tail from {len} to {valid} bytes");
                OpenOptions::new().write(true).open(path)?.set_len(valid)?;
            }
            for frame in frames {
                let superseded = match Record::decode(&frame)? {
                    Record::Pointer(p) => pointers.insert(p.group_id, p).is_some(),
                    Record::RemoveGroup(id) => pointers.remove(&id).is_some(),
                    Record::Region(region) => regions.insert(region.id, region).is_some(),
                    Record::RemoveRegion(id) => regions.remove(&id).is_some(),
                };
                if superseded {
                    garbage += 1;
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(
            "Opened manifest {} with {} groups and {} regions",
            path.display(),
            pointers.len(),
            regions.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            sync,
            inner: Mutex::new(Inner { file, pointers, regions, garbage }),
        })
    }

    /// Returns the pointer for a Raft group, if any.
    pub fn pointer(&self, group_id: u64) -> Result<Option<RaftLogPointer>> {
        Ok(self.inner.lock()?.pointers.get(&group_id).copied())
    }

    /// Records a new pointer for a Raft group. Errors if any field regresses.
    pub fn set_pointer(&self, pointer: RaftLogPointer) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if let Some(current) = inner.pointers.get(&pointer.group_id) {
            if current == &pointer {
                return Ok(());
            }
            if let Some(field) = current.regression(&pointer) {
                return errinput!(
                    "raft log pointer {field} regressed for group {}: {current:?} -> {pointer:?}",
                    pointer.group_id
                );
            }
        }
        self.append(&mut inner, Record::Pointer(pointer))?;
        if inner.pointers.insert(pointer.group_id, pointer).is_some() {
            inner.garbage += 1;
        }
        self.maybe_compact(&mut inner)
    }

    /// Removes the pointer for a Raft group.
    pub fn remove_group(&self, group_id: u64) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.pointers.remove(&group_id).is_none() {
            return Ok(());
        }
        self.append(&mut inner, Record::RemoveGroup(group_id))?;
        inner.garbage += 2;
        self.maybe_compact(&mut inner)
    }

    /// Returns all regions in the catalog.
    pub fn regions(&self) -> Result<Vec<RegionMeta>> {
        Ok(self.inner.lock()?.regions.values().cloned().collect())
    }

    /// Persists a region in the catalog.
    pub fn put_region(&self, region: &RegionMeta) -> Result<()> {
        let mut inner = self.inner.lock()?;
        self.append(&mut inner, Record::Region(region.clone()))?;
        if inner.regions.insert(region.id, region.clone()).is_some() {
            inner.garbage += 1;
        }
        self.maybe_compact(&mut inner)
    }

    /// Removes a region from the catalog.
    pub fn remove_region(&self, id: RegionId) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.regions.remove(&id).is_none() {
            return Ok(());
        }
        self.append(&mut inner, Record::RemoveRegion(id))?;
        inner.garbage += 2;
        self.maybe_compact(&mut inner)
    }

    /// Appends a record to the manifest file.
    fn append(&self, inner: &mut Inner, record: Record) -> Result<()> {
        write_frame(&mut inner.file, &record.encode()?)?;
        if self.sync {
            inner.file.sync_data()?;
        }
        Ok(())
    }

    /// Rewrites the manifest with only live records, if enough garbage has
    /// accumulated.
    fn maybe_compact(&self, inner: &mut Inner) -> Result<()> {
        if inner.garbage < COMPACT_THRESHOLD {
            return Ok(());
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        for pointer in inner.pointers.values() {
            write_frame(&mut file, &Record::Pointer(*pointer).encode()?)?;
        }
        for region in inner.regions.values() {
            write_frame(&mut file, &Record::Region(region.clone()).encode()?)?;
        }
        file.flush()?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        inner.file = OpenOptions::new().append(true).open(&self.path)?;
        debug!("Compacted manifest, dropping {} superseded records", inner.garbage);
        inner.garbage = 0;
        Ok(())
    }
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::PeerMeta;
    use pretty_assertions::assert_eq;

    #[test]
    fn pointers_and_regions_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("MANIFEST");
        let manifest = Manifest::open(&path, false)?;

        let p1 = RaftLogPointer {
            group_id: 1,
            segment: 1,
            offset: 100,
            applied_index: 5,
            ..Default::default()
        };
        let p2 = RaftLogPointer { group_id: 2, segment: 1, offset: 10, ..Default::default() };
        manifest.set_pointer(p1)?;
        manifest.set_pointer(p2)?;
        let p1 = RaftLogPointer { offset: 200, applied_index: 7, ..p1 };
        manifest.set_pointer(p1)?;
        manifest.remove_group(2)?;

        let region = RegionMeta::new(1, vec![], vec![], vec![PeerMeta { store_id: 1, peer_id: 1 }]);
        manifest.put_region(&region)?;
        manifest.put_region(&RegionMeta::new(2, vec![], vec![], vec![]))?;
        manifest.remove_region(2)?;
        drop(manifest);

        let manifest = Manifest::open(&path, false)?;
        assert_eq!(manifest.pointer(1)?, Some(p1));
        assert_eq!(manifest.pointer(2)?, None);
        assert_eq!(manifest.regions()?, vec![region]);
        Ok(())
    }

    #[test]
    fn pointer_regression_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = Manifest::open(&dir.path().join("MANIFEST"), false)?;
        let p = RaftLogPointer {
            group_id: 1,
            segment: 2,
            offset: 50,
            applied_index: 9,
            ..Default::default()
        };
        manifest.set_pointer(p)?;
        assert!(manifest.set_pointer(RaftLogPointer { offset: 40, ..p }).is_err());
        assert!(manifest.set_pointer(RaftLogPointer { applied_index: 8, offset: 60, ..p }).is_err());
        manifest.set_pointer(RaftLogPointer { segment: 3, offset: 0, ..p })?;
        assert_eq!(manifest.pointer(1)?.map(|p| p.segment), Some(3));
        Ok(())
    }

    #[test]
    fn compaction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("MANIFEST");
        let manifest = Manifest::open(&path, false)?;
        let mut p = RaftLogPointer { group_id: 1, segment: 1, ..Default::default() };
        for offset in 1..=COMPACT_THRESHOLD as u64 + 10 {
            p.offset = offset;
            manifest.set_pointer(p)?;
        }
        let len = std::fs::metadata(&path)?.len();
        assert!(len < 100 * 20, "manifest not compacted: {len} bytes");
        drop(manifest);

        let manifest = Manifest::open(&path, false)?;
        assert_eq!(manifest.pointer(1)?, Some(p));
        Ok(())
    }
}
