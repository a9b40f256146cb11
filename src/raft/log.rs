use super::manifest::{Manifest, RaftLogPointer};
use super::wal::{Position, Wal};
use crate::encoding::{self, Value as _};
use crate::errdata;
use crate::error::{Error, Result};

use log::{debug, error, info};
use prost::Message as _;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage, RaftState};
use raft::{Storage as _, StorageError};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The log index and term of the initial snapshot of a bootstrapped group.
/// Starting above zero ensures that peers created on demand with an empty log
/// always receive a snapshot (carrying the region metadata) before any
/// entries, rather than being caught up entry by entry from index 1.
pub const INIT_INDEX: u64 = 5;
pub const INIT_TERM: u64 = 5;

/// Builds a state machine snapshot for a group, returning the applied index
/// it was taken at along with the snapshot data.
pub type SnapshotBuilder = Arc<dyn Fn() -> Result<(u64, Vec<u8>)> + Send + Sync>;

/// A WAL record. Raft protobuf types are stored in their protobuf encoding.
#[derive(Debug, Serialize, Deserialize)]
enum Record {
    /// Appended entries, replacing any existing entries at or after the first
    /// entry's index.
    Entries(Vec<ByteBuf>),
    /// A new hard state.
    HardState { term: u64, vote: u64, commit: u64 },
    /// A new membership configuration.
    ConfState(ByteBuf),
    /// An applied snapshot's metadata. The data lives in the state machine.
    Snapshot { index: u64, term: u64, conf_state: ByteBuf },
    /// The state machine's applied index.
    Applied { index: u64, term: u64 },
    /// Entries at or below index were compacted away.
    Compact { index: u64, term: u64 },
    /// A full copy of the non-entry state, written before removing old
    /// segments so that they are no longer needed for recovery.
    Checkpoint {
        hard_state: (u64, u64, u64),
        conf_state: ByteBuf,
        snapshot: (u64, u64),
        applied: (u64, u64),
        truncated: (u64, u64),
        segment_index: u64,
    },
}

impl encoding::Value for Record {}

/// Durable storage for a single Raft group's log, hard state and snapshot
/// metadata, implementing the raft::Storage contract.
///
/// Every mutation is first appended to the group's WAL, then applied to the
/// in-memory log cache (a MemStorage), and finally recorded in the store
/// manifest as an advanced RaftLogPointer. On open, the WAL is replayed to
/// rebuild the cache and the pointer, which may be behind the WAL if the
/// process crashed between the WAL write and the manifest update.
pub struct RaftLogStore {
    group_id: u64,
    dir: PathBuf,
    wal: Wal,
    mem: MemStorage,
    manifest: Arc<Manifest>,
    /// The current pointer. The manifest may lag behind it only under the
    /// pointer failpoint.
    pointer: RaftLogPointer,
    /// The WAL segment of each entry batch, keyed by its first index. Used to
    /// find the segment containing the truncation point.
    batch_segments: BTreeMap<u64, u64>,
    /// Segments before this one have been removed.
    gc_segment: u64,
    snapshot_builder: Option<SnapshotBuilder>,
    /// Whether a batch is open: pointer updates and WAL fsyncs are deferred
    /// until commit_batch().
    batching: bool,
    /// Whether the pointer has advanced past the manifest in the open batch.
    dirty: bool,
    /// Whether segment removal was deferred by the open batch.
    gc_pending: bool,
    /// Failpoint: skip manifest pointer updates.
    fail_pointer_updates: bool,
    /// Failpoint: fail all WAL writes.
    fail_writes: bool,
}

/// State reconstructed by replaying the WAL.
#[derive(Default)]
struct Replay {
    entries: BTreeMap<u64, Entry>,
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: (u64, u64),
    applied: (u64, u64),
    truncated: (u64, u64),
    segment_index: u64,
    batch_segments: BTreeMap<u64, u64>,
    end: Option<Position>,
}

impl Replay {
    fn apply(&mut self, record: Record, end: Position) -> Result<()> {
        match record {
            Record::Entries(batch) => {
                let batch = batch
                    .iter()
                    .map(|b| Entry::decode(b.as_slice()))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if let Some(first) = batch.first().map(|e| e.index) {
                    self.entries.split_off(&first);
                    self.batch_segments.split_off(&first);
                    self.batch_segments.insert(first, end.segment);
                    self.entries.extend(batch.into_iter().map(|e| (e.index, e)));
                }
            }
            Record::HardState { term, vote, commit } => {
                self.hard_state = hard_state(term, vote, commit);
            }
            Record::ConfState(cs) => self.conf_state = ConfState::decode(cs.as_slice())?,
            Record::Snapshot { index, term, conf_state } => {
                self.snapshot = (index, term);
                self.truncated = self.truncated.max((index, term));
                self.conf_state = ConfState::decode(conf_state.as_slice())?;
                self.entries = self.entries.split_off(&(index + 1));
                self.batch_segments.clear();
                self.segment_index = self.segment_index.max(end.segment);
                self.hard_state.term = self.hard_state.term.max(term);
                self.hard_state.commit = self.hard_state.commit.max(index);
            }
            Record::Applied { index, term } => self.applied = self.applied.max((index, term)),
            Record::Compact { index, term } => {
                self.truncated = self.truncated.max((index, term));
                self.segment_index =
                    self.segment_index.max(batch_segment(&self.batch_segments, index, end.segment));
            }
            Record::Checkpoint { hard_state: hs, conf_state, snapshot, applied, truncated, segment_index } => {
                self.hard_state = hard_state(hs.0, hs.1, hs.2);
                self.conf_state = ConfState::decode(conf_state.as_slice())?;
                self.snapshot = self.snapshot.max(snapshot);
                self.applied = self.applied.max(applied);
                self.truncated = self.truncated.max(truncated);
                self.segment_index = self.segment_index.max(segment_index);
            }
        }
        self.end = Some(end);
        Ok(())
    }
}

/// Builds a hard state.
fn hard_state(term: u64, vote: u64, commit: u64) -> HardState {
    let mut hs = HardState::default();
    hs.term = term;
    hs.vote = vote;
    hs.commit = commit;
    hs
}

/// Returns the segment of the entry batch containing the given index, or the
/// fallback if it isn't known.
fn batch_segment(batch_segments: &BTreeMap<u64, u64>, index: u64, fallback: u64) -> u64 {
    batch_segments.range(..=index).next_back().map(|(_, s)| *s).unwrap_or(fallback)
}

/// Converts a crate error into a Raft storage error.
fn storage_error(err: Error) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(err)))
}

impl RaftLogStore {
    /// Opens the log for a group in the given directory, replaying its WAL
    /// and reconciling the manifest pointer.
    pub fn open(
        group_id: u64,
        dir: &Path,
        manifest: Arc<Manifest>,
        segment_size: u64,
        sync: bool,
    ) -> Result<Self> {
        let (wal, frames) = Wal::open(dir, segment_size, sync)?;
        let mut replay = Replay::default();
        for frame in frames {
            replay.apply(Record::decode(&frame.data)?, frame.end)?;
        }

        // Rebuild the in-memory log. Compacted entries and snapshots are
        // represented as a MemStorage snapshot at the truncation point.
        let mem = MemStorage::new();
        {
            let mut core = mem.wl();
            let (base_index, base_term) = replay.truncated.max(replay.snapshot);
            if base_index > 0 {
                let mut snapshot = Snapshot::default();
                let metadata = snapshot.mut_metadata();
                metadata.index = base_index;
                metadata.term = base_term;
                metadata.set_conf_state(replay.conf_state.clone());
                core.apply_snapshot(snapshot)?;
            }
            let entries: Vec<Entry> = replay.entries.split_off(&(base_index + 1)).into_values().collect();
            for (i, entry) in entries.iter().enumerate() {
                if entry.index != base_index + 1 + i as u64 {
                    return errdata!(
                        "gap in raft log for group {group_id}: expected index {}, found {}",
                        base_index + 1 + i as u64,
                        entry.index
                    );
                }
            }
            core.append(&entries)?;
            core.set_hardstate(replay.hard_state.clone());
            core.set_conf_state(replay.conf_state.clone());
        }

        let end = replay.end.unwrap_or_else(|| wal.position());
        let pointer = RaftLogPointer {
            group_id,
            segment: end.segment,
            offset: end.offset,
            applied_index: replay.applied.0,
            applied_term: replay.applied.1,
            snapshot_index: replay.snapshot.0,
            snapshot_term: replay.snapshot.1,
            truncated_index: replay.truncated.0,
            truncated_term: replay.truncated.1,
            committed: replay.hard_state.commit,
            segment_index: replay.segment_index,
        };

        // Reconcile the manifest pointer with the replayed WAL. The pointer can
        // only lag behind the WAL, never lead it.
        match manifest.pointer(group_id)? {
            Some(stored) if stored == pointer => {}
            Some(stored) => {
                if let Some(field) = stored.regression(&pointer) {
                    error!("Manifest pointer {stored:?} for group {group_id} is ahead of WAL {pointer:?}");
                    return errdata!("manifest pointer {field} for group {group_id} is ahead of its WAL");
                }
                info!(
                    "Recovered raft log pointer for group {group_id} from WAL: applied {} -> {}",
                    stored.applied_index, pointer.applied_index
                );
                manifest.set_pointer(pointer)?;
            }
            None => manifest.set_pointer(pointer)?,
        }
        debug!("Opened raft log for group {group_id}: {pointer:?}");

        Ok(Self {
            group_id,
            dir: dir.to_path_buf(),
            wal,
            mem,
            manifest,
            pointer,
            batch_segments: replay.batch_segments,
            gc_segment: 0,
            snapshot_builder: None,
            batching: false,
            dirty: false,
            gc_pending: false,
            fail_pointer_updates: false,
            fail_writes: false,
        })
    }

    /// Removes a group's WAL directory and manifest pointer, e.g. when its
    /// peer is destroyed.
    pub fn destroy(group_id: u64, dir: &Path, manifest: &Manifest) -> Result<()> {
        manifest.remove_group(group_id)?;
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        info!("Destroyed raft log for group {group_id}");
        Ok(())
    }

    /// Returns true if the log has never been written, i.e. the group has no
    /// entries, snapshot or configuration.
    pub fn is_empty(&self) -> Result<bool> {
        let state = self.mem.initial_state()?;
        Ok(self.pointer.offset == 0
            && self.pointer.segment <= 1
            && state.conf_state.voters.is_empty()
            && self.last_index()? == 0)
    }

    /// Initializes a new group with the given voters, as an initial snapshot
    /// at INIT_INDEX.
    pub fn bootstrap(&mut self, voters: Vec<u64>) -> Result<()> {
        if !self.is_empty()? {
            return errdata!("raft log for group {} is already initialized", self.group_id);
        }
        let mut snapshot = Snapshot::default();
        let metadata = snapshot.mut_metadata();
        metadata.index = INIT_INDEX;
        metadata.term = INIT_TERM;
        metadata.set_conf_state(ConfState::from((voters, vec![])));
        self.apply_snapshot(&snapshot)?;
        self.set_applied(INIT_INDEX, INIT_TERM)
    }

    /// Sets the state machine snapshot builder.
    pub fn set_snapshot_builder(&mut self, builder: SnapshotBuilder) {
        self.snapshot_builder = Some(builder);
    }

    /// Failpoint: when enabled, WAL records are written but the manifest
    /// pointer is not advanced, modelling a crash between the two.
    #[doc(hidden)]
    pub fn set_fail_pointer_updates(&mut self, fail: bool) {
        self.fail_pointer_updates = fail;
    }

    /// Failpoint: when enabled, all WAL writes fail with an IO error.
    #[doc(hidden)]
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Opens a write batch. Until commit_batch(), WAL records are written
    /// without fsync and the manifest pointer is not advanced, so that a
    /// single Raft Ready costs one fsync and one pointer update.
    pub fn begin_batch(&mut self) {
        self.batching = true;
        self.wal.defer_sync(true);
    }

    /// Fsyncs the WAL records written so far in the batch. Raft messages
    /// that depend on persisted state may be sent afterwards.
    pub fn sync(&mut self) -> Result<()> {
        self.wal.sync()
    }

    /// Commits the open batch: fsyncs the WAL, advances the manifest pointer
    /// once, and removes WAL segments made obsolete during the batch.
    pub fn commit_batch(&mut self) -> Result<()> {
        if !self.batching {
            return Ok(());
        }
        self.wal.sync()?;
        self.wal.defer_sync(false);
        self.batching = false;
        if std::mem::take(&mut self.dirty) && !self.fail_pointer_updates {
            self.manifest.set_pointer(self.pointer)?;
        }
        if std::mem::take(&mut self.gc_pending) {
            self.maybe_gc()?;
        }
        Ok(())
    }

    /// Returns the group ID.
    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    /// Returns the current pointer.
    pub fn pointer(&self) -> RaftLogPointer {
        self.pointer
    }

    /// Returns the current hard state.
    pub fn hard_state(&self) -> HardState {
        self.mem.rl().hard_state().clone()
    }

    /// Returns the current membership configuration.
    pub fn conf_state(&self) -> Result<ConfState> {
        Ok(self.mem.initial_state()?.conf_state)
    }

    /// Returns the first index in the log.
    pub fn first_index(&self) -> Result<u64> {
        Ok(raft::Storage::first_index(&self.mem)?)
    }

    /// Returns the last index in the log.
    pub fn last_index(&self) -> Result<u64> {
        Ok(raft::Storage::last_index(&self.mem)?)
    }

    /// Appends entries, replacing any conflicting suffix.
    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let batch = entries.iter().map(|e| ByteBuf::from(e.encode_to_vec())).collect();
        let end = self.write(Record::Entries(batch))?;
        self.mem.wl().append(entries)?;
        self.batch_segments.split_off(&first.index);
        self.batch_segments.insert(first.index, end.segment);
        self.advance(end, |_| {})
    }

    /// Persists a new hard state.
    pub fn set_hard_state(&mut self, hs: &HardState) -> Result<()> {
        let end = self.write(Record::HardState { term: hs.term, vote: hs.vote, commit: hs.commit })?;
        self.mem.wl().set_hardstate(hs.clone());
        self.advance(end, |p| p.committed = p.committed.max(hs.commit))
    }

    /// Persists a new commit index, keeping the rest of the hard state.
    pub fn set_commit(&mut self, commit: u64) -> Result<()> {
        let mut hs = self.hard_state();
        if hs.commit == commit {
            return Ok(());
        }
        hs.commit = commit;
        self.set_hard_state(&hs)
    }

    /// Persists a new membership configuration.
    pub fn set_conf_state(&mut self, cs: &ConfState) -> Result<()> {
        let end = self.write(Record::ConfState(cs.encode_to_vec().into()))?;
        self.mem.wl().set_conf_state(cs.clone());
        self.advance(end, |_| {})
    }

    /// Applies a snapshot received from the leader, discarding all entries up
    /// to its index. Only the metadata is persisted here: the caller restores
    /// the data into the state machine.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let metadata = snapshot.get_metadata();
        let (index, term) = (metadata.index, metadata.term);
        let end = self.write(Record::Snapshot {
            index,
            term,
            conf_state: metadata.get_conf_state().encode_to_vec().into(),
        })?;
        let mut meta_only = Snapshot::default();
        meta_only.set_metadata(metadata.clone());
        self.mem.wl().apply_snapshot(meta_only)?;
        self.batch_segments.clear();
        info!("Applied snapshot at index {index} term {term} to raft log for group {}", self.group_id);
        self.advance(end, |p| {
            p.snapshot_index = index;
            p.snapshot_term = term;
            if index >= p.truncated_index {
                p.truncated_index = index;
                p.truncated_term = term;
            }
            p.committed = p.committed.max(index);
            p.segment_index = p.segment_index.max(end.segment);
        })?;
        self.maybe_gc()
    }

    /// Records the state machine's applied index.
    pub fn set_applied(&mut self, index: u64, term: u64) -> Result<()> {
        if index <= self.pointer.applied_index {
            return Ok(());
        }
        let end = self.write(Record::Applied { index, term })?;
        self.advance(end, |p| {
            p.applied_index = index;
            p.applied_term = term;
        })
    }

    /// Compacts the log, retaining the last `retain` entries up to `applied`.
    /// Returns whether anything was compacted. The caller must cap `applied`
    /// below the index of any in-flight snapshot whose follower still needs
    /// the following entries.
    pub fn maybe_compact(&mut self, applied: u64, retain: u64) -> Result<bool> {
        let Some(compact_to) = applied.checked_sub(retain) else {
            return Ok(false);
        };
        if compact_to <= self.pointer.truncated_index || compact_to >= self.last_index()? {
            return Ok(false);
        }
        let term = raft::Storage::term(&self.mem, compact_to)?;
        let end = self.write(Record::Compact { index: compact_to, term })?;
        self.mem.wl().compact(compact_to + 1)?;
        let segment = batch_segment(&self.batch_segments, compact_to, end.segment);
        // Batches entirely below the truncation point are no longer needed.
        let mut keep = self.batch_segments.split_off(&(compact_to + 1));
        if let Some((&first, &batch)) = self.batch_segments.iter().next_back() {
            keep.insert(first, batch);
        }
        self.batch_segments = keep;
        debug!("Compacted raft log for group {} up to index {compact_to}", self.group_id);
        self.advance(end, |p| {
            p.truncated_index = compact_to;
            p.truncated_term = term;
            p.segment_index = p.segment_index.max(segment);
        })?;
        self.maybe_gc()?;
        Ok(true)
    }

    /// Removes WAL segments before the truncation point's segment, after
    /// checkpointing all non-entry state into the current segment.
    fn maybe_gc(&mut self) -> Result<()> {
        // The checkpoint must be durable before segments are removed.
        if self.batching {
            self.gc_pending = true;
            return Ok(());
        }
        let segment_index = self.pointer.segment_index;
        if segment_index <= self.gc_segment.max(1) {
            return Ok(());
        }
        let hs = self.hard_state();
        let end = self.write(Record::Checkpoint {
            hard_state: (hs.term, hs.vote, hs.commit),
            conf_state: self.conf_state()?.encode_to_vec().into(),
            snapshot: (self.pointer.snapshot_index, self.pointer.snapshot_term),
            applied: (self.pointer.applied_index, self.pointer.applied_term),
            truncated: (self.pointer.truncated_index, self.pointer.truncated_term),
            segment_index,
        })?;
        self.advance(end, |_| {})?;
        self.wal.remove_segments_before(segment_index.min(end.segment))?;
        self.gc_segment = segment_index;
        Ok(())
    }

    /// Appends a record to the WAL.
    fn write(&mut self, record: Record) -> Result<Position> {
        if self.fail_writes {
            return Err(Error::IO(format!("injected write failure in raft log for group {}", self.group_id)));
        }
        self.wal.append(&record.encode()?)
    }

    /// Advances the pointer past a written record and persists it to the
    /// manifest, unless a batch is open or the failpoint is enabled.
    fn advance(&mut self, end: Position, update: impl FnOnce(&mut RaftLogPointer)) -> Result<()> {
        let mut pointer = self.pointer;
        pointer.segment = end.segment;
        pointer.offset = end.offset;
        update(&mut pointer);
        if self.batching {
            self.dirty = true;
        } else if !self.fail_pointer_updates {
            self.manifest.set_pointer(pointer)?;
        }
        self.pointer = pointer;
        Ok(())
    }
}

impl raft::Storage for RaftLogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == self.pointer.truncated_index && idx > 0 {
            return Ok(self.pointer.truncated_term);
        }
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    /// Builds a snapshot of the state machine at its applied index.
    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let Some(builder) = &self.snapshot_builder else {
            return Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable));
        };
        let (index, data) = builder().map_err(storage_error)?;
        if index == 0 || index < request_index {
            return Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable));
        }
        let term = match index == self.pointer.applied_index {
            true => self.pointer.applied_term,
            false => raft::Storage::term(self, index)?,
        };
        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let metadata = snapshot.mut_metadata();
        metadata.index = index;
        metadata.term = term;
        metadata.set_conf_state(self.mem.initial_state()?.conf_state);
        debug!(
            "Built snapshot for group {} at index {index} term {term} for peer {to}",
            self.group_id
        );
        Ok(snapshot)
    }
}

impl std::fmt::Debug for RaftLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftLogStore")
            .field("group_id", &self.group_id)
            .field("dir", &self.dir)
            .field("pointer", &self.pointer)
            .finish()
    }
}
