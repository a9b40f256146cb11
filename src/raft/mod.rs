//! Raft replication for regions. Each region is an independent Raft group,
//! replicated by one peer on each of the region's stores.
//!
//! The consensus algorithm itself (elections, log matching, membership
//! changes) is provided by the raft crate's RawNode. This module provides
//! everything around it:
//!
//! * RaftLogStore: durable storage for a group's log, hard state and snapshot
//!   metadata, implementing raft::Storage. Backed by a per-group segmented
//!   write-ahead log (Wal) and a store-wide Manifest recording a
//!   RaftLogPointer per group, which is used to recover the group's state.
//!
//! * Peer: drives a RawNode for one region. All inputs (ticks, messages,
//!   proposals) drain the resulting Ready synchronously: persist the
//!   snapshot, entries and hard state, send messages, apply committed entries
//!   to the State, and compact the log. The log writes of a Ready are
//!   batched into one WAL fsync and one manifest pointer update.
//!
//! * Transport: delivers RaftMessages between stores, either in-process
//!   (LocalTransport) or over TCP (TcpTransport).
//!
//! RECOVERY
//! ========
//!
//! Every RaftLogStore mutation is appended to the WAL before it is applied
//! in memory, and only then is the manifest pointer advanced. A crash
//! between the WAL write and the manifest update leaves the pointer behind
//! the WAL. On restart, the WAL is replayed in full and the pointer is
//! reconstructed from it, so nothing written to the WAL is lost. A torn
//! record at the end of the WAL (a short write or a checksum mismatch) is
//! truncated away.
//!
//! Once the log is compacted, or a snapshot is applied, the WAL segments
//! before the one containing the truncation point are no longer needed. A
//! checkpoint record re-logs all non-entry state (hard state, membership,
//! snapshot metadata) into the current segment, and the old segments are
//! removed.
//!
//! SNAPSHOTS
//! =========
//!
//! New regions start from an initial snapshot at INIT_INDEX rather than an
//! empty log. A peer created on demand for a region it doesn't know yet
//! (e.g. when added to the region by a membership change) has an empty log,
//! and thus always receives a snapshot carrying the region metadata before
//! any entries. Outbound snapshots are cached and resent every few ticks until
//! the follower acknowledges them, since a message accepted by the transport
//! may still be lost.

mod log;
mod manifest;
mod peer;
mod state;
mod transport;
mod wal;

pub use self::log::{RaftLogStore, SnapshotBuilder, INIT_INDEX, INIT_TERM};
pub use manifest::{Manifest, RaftLogPointer};
pub use peer::{ConfChangeEvent, ConfChangeHandler, Peer, PeerStatus, SnapshotSlot};
pub use state::State;
pub use transport::{LocalTransport, RaftMessage, TcpTransport, Transport};
pub use wal::{Position, Wal};

pub use ::raft::prelude::ConfChangeType;
pub use ::raft::SnapshotStatus;

/// Raft peer options.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// The number of ticks without a leader heartbeat before a follower
    /// campaigns.
    pub election_tick: usize,
    /// The number of ticks between leader heartbeats.
    pub heartbeat_tick: usize,
    /// The number of applied entries to retain when compacting the log.
    pub log_retain: u64,
    /// The maximum number of in-flight append messages per follower.
    pub max_inflight_msgs: usize,
    /// The maximum size of a single append message.
    pub max_size_per_msg: u64,
    /// The number of ticks to wait for a follower to acknowledge a snapshot
    /// before resending it.
    pub snapshot_resend_ticks: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            election_tick: 10,
            heartbeat_tick: 3,
            log_retain: 4096,
            max_inflight_msgs: 256,
            max_size_per_msg: 1 << 20,
            snapshot_resend_ticks: 10,
        }
    }
}
