use crate::error::Result;
use crate::region::RegionMeta;

use raft::prelude::{Entry, Snapshot};

/// A Raft-managed state machine for a single region. Raft itself does not
/// care what the state machine does: it hands over committed entries in log
/// order, and asks for snapshots to catch up lagging or new peers.
///
/// Since entries are applied identically across all replicas, application
/// must be deterministic. Any non-deterministic failure (e.g. an IO error)
/// must be returned as an error, which aborts the Ready cycle without
/// advancing Raft. Deterministic command failures (e.g. a stale epoch) are
/// results, not errors, and are delivered to the proposer in-band.
pub trait State: Send + Sync {
    /// Returns the last applied index. This must correspond to the current
    /// state of the state machine, since it determines the next entry to apply.
    fn applied_index(&self) -> Result<u64>;

    /// Applies a committed entry. All entry types are passed, including
    /// membership changes (already applied to Raft by the peer) and empty
    /// leader no-ops, so that the applied index stays current. Returns the
    /// updated region metadata if the entry changed it, e.g. a split.
    fn apply(&self, region: &RegionMeta, entry: &Entry) -> Result<Option<RegionMeta>>;

    /// Builds a snapshot of the current state, returning the applied index it
    /// was taken at and the snapshot data.
    fn snapshot(&self) -> Result<(u64, Vec<u8>)>;

    /// Replaces the state with the given snapshot, returning the region
    /// metadata it carried.
    fn restore(&self, snapshot: &Snapshot) -> Result<RegionMeta>;
}
