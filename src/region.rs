//! Region metadata. A region is a contiguous, half-open key range replicated
//! by one Raft group. Each store hosts at most one peer of a region.

use crate::encoding;

use serde::{Deserialize, Serialize};

/// A region ID. Also used as the Raft group ID.
pub type RegionId = u64;

/// A store (node) ID.
pub type StoreId = u64;

/// A peer ID, i.e. the Raft node ID of a region replica. Unique across all
/// regions and stores.
pub type PeerId = u64;

/// A region epoch, versioning a region's key range and membership. Commands
/// carry the epoch they were routed with, and are rejected if it is stale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch {
    /// Incremented on every split and merge.
    pub version: u64,
    /// Incremented for every applied membership change.
    pub conf_ver: u64,
}

impl Epoch {
    /// Returns whether this epoch is older than the other in either dimension.
    pub fn is_stale(&self, other: &Epoch) -> bool {
        self.version < other.version || self.conf_ver < other.conf_ver
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}/c{}", self.version, self.conf_ver)
    }
}

/// A region replica: the store hosting it and its Raft peer ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerMeta {
    pub store_id: StoreId,
    pub peer_id: PeerId,
}

impl encoding::Value for PeerMeta {}

/// The lifecycle state of a region on a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionState {
    /// The region was created but its local peer hasn't started yet.
    New,
    /// The region's local peer is running.
    Running,
    /// The region is fenced for a merge into the target region, prepared at
    /// the given log index of the region. It accepts no further commands.
    Merging { target: RegionId, index: u64 },
    /// The local peer is being removed.
    Removing,
    /// The local peer was removed. Messages for it are ignored.
    Tombstone,
}

/// Region metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMeta {
    pub id: RegionId,
    /// The inclusive start key. Empty means unbounded.
    #[serde(with = "serde_bytes")]
    pub start_key: Vec<u8>,
    /// The exclusive end key. Empty means unbounded.
    #[serde(with = "serde_bytes")]
    pub end_key: Vec<u8>,
    pub epoch: Epoch,
    pub peers: Vec<PeerMeta>,
    pub state: RegionState,
}

impl encoding::Value for RegionMeta {}

impl RegionMeta {
    /// Creates a new region covering [start_key, end_key).
    pub fn new(id: RegionId, start_key: Vec<u8>, end_key: Vec<u8>, peers: Vec<PeerMeta>) -> Self {
        Self {
            id,
            start_key,
            end_key,
            epoch: Epoch { version: 1, conf_ver: 1 },
            peers,
            state: RegionState::New,
        }
    }

    /// Returns whether the region contains the given key.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Returns whether the key lies strictly inside the region, i.e. is a
    /// valid split point that leaves both halves non-empty.
    pub fn is_valid_split_key(&self, key: &[u8]) -> bool {
        !key.is_empty() && key > self.start_key.as_slice() && self.contains(key)
    }

    /// Returns whether the region is fenced for a merge.
    pub fn is_merging(&self) -> bool {
        matches!(self.state, RegionState::Merging { .. })
    }

    /// Returns the local peer of the region on the given store, if any.
    pub fn peer_on_store(&self, store_id: StoreId) -> Option<&PeerMeta> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    /// Returns the peer with the given peer ID, if any.
    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerMeta> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    /// Returns the peer IDs of all voters.
    pub fn voters(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.peer_id).collect()
    }

    /// Returns the region's key range, for storage engine scans.
    pub fn key_range(&self) -> crate::storage::KeyRange {
        crate::storage::key_range(&self.start_key, &self.end_key)
    }
}

impl std::fmt::Display for RegionMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "region {} [{}, {}) epoch {}",
            self.id,
            self.start_key.escape_ascii(),
            self.end_key.escape_ascii(),
            self.epoch
        )
    }
}
