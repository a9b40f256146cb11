use super::log::RaftLogStore;
use super::transport::{RaftMessage, Transport};
use super::{Options, State};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::region::{PeerId, PeerMeta, RegionId, RegionMeta, StoreId};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use prost::Message as _;
use raft::prelude::{
    ConfChange, ConfChangeSingle, ConfChangeType, ConfChangeV2, Config, Entry, EntryType, Message,
    MessageType, RawNode,
};
use raft::storage::GetEntriesContext;
use raft::{SnapshotStatus, StateRole, Storage as _};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// A membership change applied to a region, surfaced to the store.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfChangeEvent {
    pub region_id: RegionId,
    /// The local peer applying the change.
    pub peer_id: PeerId,
    /// The region after the change, with updated peers and conf_ver.
    pub region: RegionMeta,
    pub changes: Vec<(ConfChangeType, PeerMeta)>,
    pub index: u64,
    pub term: u64,
}

/// Called when a membership change is applied. Errors abort the Ready cycle.
pub type ConfChangeHandler = Arc<dyn Fn(&ConfChangeEvent) -> Result<()> + Send + Sync>;

/// Tracks an outbound snapshot to a follower, so it can be resent until the
/// follower acknowledges it. A successful send only means the message was
/// handed to the transport, not that the follower received it.
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotSlot {
    Empty,
    Pending {
        message: Message,
        /// Ticks since the last send attempt. The snapshot is resent when this
        /// reaches the resend interval.
        ticks: usize,
    },
}

impl SnapshotSlot {
    /// Returns the index of the pending snapshot, if any.
    fn index(&self) -> Option<u64> {
        match self {
            Self::Empty => None,
            Self::Pending { message, .. } => Some(message.get_snapshot().get_metadata().index),
        }
    }
}

/// A peer status snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerStatus {
    pub region_id: RegionId,
    pub peer_id: PeerId,
    pub is_leader: bool,
    /// The known leader, or 0 if none.
    pub leader: PeerId,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub pending_snapshots: usize,
}

/// The mutable peer state, guarded by the peer's mutex.
struct Node {
    raw: RawNode<RaftLogStore>,
    applied: u64,
    /// Outbound snapshots by follower peer ID.
    snapshot_slots: HashMap<PeerId, SnapshotSlot>,
    /// Read-index waiters by request context.
    read_waiters: HashMap<Vec<u8>, Sender<Result<u64>>>,
    /// Confirmed read indexes, waiting for the applied index to catch up.
    pending_reads: Vec<(u64, Vec<u8>)>,
    next_read: u64,
    /// Waiters for all peers to have replicated up to an index.
    replication_waiters: Vec<(u64, Sender<()>)>,
    /// Peers learned from inbound messages, for peers that are not (yet) in
    /// the local region metadata.
    peer_cache: HashMap<PeerId, PeerMeta>,
}

/// A Raft peer: the local replica of a region. Wraps a raft::RawNode, and
/// drives it by persisting Ready state to the RaftLogStore, sending messages
/// via the Transport and applying committed entries to the State.
///
/// All inputs (tick, step, propose, campaign, etc.) take the peer mutex and
/// drain all Ready state before returning, so Raft makes progress
/// synchronously with the caller.
pub struct Peer {
    region_id: RegionId,
    peer_id: PeerId,
    store_id: StoreId,
    node: Mutex<Node>,
    region: RwLock<RegionMeta>,
    state: Arc<dyn State>,
    transport: Arc<dyn Transport>,
    conf_change_handler: Option<ConfChangeHandler>,
    log_retain: u64,
    snapshot_resend_ticks: usize,
    stopped: AtomicBool,
    /// Set when a Ready cycle failed. The peer is stopped, and must be
    /// replaced by reopening its log.
    failed: AtomicBool,
}

impl Peer {
    /// Creates a new peer. The log must either be bootstrapped, have existing
    /// state, or be empty for an uninitialized peer awaiting a snapshot.
    pub fn new(
        store_id: StoreId,
        peer_id: PeerId,
        region: RegionMeta,
        mut log: RaftLogStore,
        state: Arc<dyn State>,
        transport: Arc<dyn Transport>,
        opts: &Options,
    ) -> Result<Self> {
        let snapshot_state = state.clone();
        log.set_snapshot_builder(Arc::new(move || snapshot_state.snapshot()));

        // The state machine may lag the log (e.g. an in-memory engine after a
        // restart), but Raft can't replay compacted entries.
        let commit = log.hard_state().commit;
        let first = log.first_index()?.saturating_sub(1);
        let mut applied = state.applied_index()?;
        if applied < first {
            warn!("Region {} applied index {applied} is below log start {first}", region.id);
            applied = first;
        }
        let applied = applied.min(commit);

        let mut config = Config {
            id: peer_id,
            election_tick: opts.election_tick,
            heartbeat_tick: opts.heartbeat_tick,
            max_size_per_msg: opts.max_size_per_msg,
            max_inflight_msgs: opts.max_inflight_msgs,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        if applied > 0 {
            config.applied = applied;
        }
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let raw = RawNode::new(&config, log, &logger)?;
        debug!("Started peer {peer_id} of {region} on store {store_id} at applied index {applied}");

        Ok(Self {
            region_id: region.id,
            peer_id,
            store_id,
            node: Mutex::new(Node {
                raw,
                applied,
                snapshot_slots: HashMap::new(),
                read_waiters: HashMap::new(),
                pending_reads: Vec::new(),
                next_read: 1,
                replication_waiters: Vec::new(),
                peer_cache: HashMap::new(),
            }),
            region: RwLock::new(region),
            state,
            transport,
            conf_change_handler: None,
            log_retain: opts.log_retain,
            snapshot_resend_ticks: opts.snapshot_resend_ticks.max(1),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        })
    }

    /// Sets the membership change handler.
    pub fn set_conf_change_handler(&mut self, handler: ConfChangeHandler) {
        self.conf_change_handler = Some(handler);
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Returns the peer's metadata.
    pub fn meta(&self) -> PeerMeta {
        PeerMeta { store_id: self.store_id, peer_id: self.peer_id }
    }

    /// Returns a copy of the current region metadata.
    pub fn region(&self) -> Result<RegionMeta> {
        Ok(self.region.read()?.clone())
    }

    /// Replaces the region metadata, e.g. after a split or merge.
    pub fn set_region(&self, region: RegionMeta) -> Result<()> {
        *self.region.write()? = region;
        Ok(())
    }

    /// Returns whether the peer has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns whether the peer failed processing a Ready. A failed peer is
    /// also stopped.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Stops the peer. Later inputs fail with Error::Abort. Can be called
    /// from within the peer's own apply path.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Stopping peer {} of region {}", self.peer_id, self.region_id);
        }
        // Abort waiters, unless the node is busy (i.e. we're being stopped
        // from within a Ready cycle).
        if let Ok(mut node) = self.node.try_lock() {
            Self::abort_waiters(&mut node);
        }
    }

    /// Returns whether the peer is currently the leader.
    pub fn is_leader(&self) -> Result<bool> {
        Ok(self.node.lock()?.raw.raft.state == StateRole::Leader)
    }

    /// Returns the known leader peer, if any.
    pub fn leader(&self) -> Result<Option<PeerMeta>> {
        let node = self.node.lock()?;
        let leader = node.raw.raft.leader_id;
        if leader == 0 {
            return Ok(None);
        }
        let region = self.region.read()?;
        Ok(region.peer(leader).copied().or_else(|| node.peer_cache.get(&leader).copied()))
    }

    /// Returns the peer status.
    pub fn status(&self) -> Result<PeerStatus> {
        let node = self.node.lock()?;
        let raft = &node.raw.raft;
        Ok(PeerStatus {
            region_id: self.region_id,
            peer_id: self.peer_id,
            is_leader: raft.state == StateRole::Leader,
            leader: raft.leader_id,
            term: raft.term,
            commit_index: raft.raft_log.committed,
            applied_index: node.applied,
            first_index: raft.raft_log.first_index(),
            last_index: raft.raft_log.last_index(),
            pending_snapshots: node.snapshot_slots.values().filter(|s| s.index().is_some()).count(),
        })
    }

    /// Advances the logical clock by one tick, and resends snapshots that
    /// haven't been acknowledged within the resend interval.
    pub fn tick(&self) -> Result<()> {
        let mut node = self.lock()?;
        node.raw.tick();
        let mut resend = Vec::new();
        for slot in node.snapshot_slots.values_mut() {
            if let SnapshotSlot::Pending { message, ticks } = slot {
                *ticks += 1;
                if *ticks >= self.snapshot_resend_ticks {
                    *ticks = 0;
                    resend.push(message.clone());
                }
            }
        }
        for message in resend {
            debug!("Resending snapshot to peer {} of region {}", message.to, self.region_id);
            self.send(&mut node, message)?;
        }
        self.handle_ready(&mut node)
    }

    /// Steps an inbound Raft message.
    pub fn step(&self, message: RaftMessage) -> Result<()> {
        let mut node = self.lock()?;
        let from = message.from_peer;
        if from.peer_id != 0 {
            node.peer_cache.insert(from.peer_id, from);
        }
        let msg = message.message;
        if msg.msg_type() == MessageType::MsgAppendResponse && !msg.reject {
            if let Some(slot) = node.snapshot_slots.get_mut(&msg.from) {
                if slot.index().is_some_and(|index| msg.index >= index) {
                    debug!("Peer {} of region {} caught up after snapshot", msg.from, self.region_id);
                    *slot = SnapshotSlot::Empty;
                }
            }
        }
        match node.raw.step(msg) {
            Ok(()) => {}
            Err(err @ (raft::Error::StepPeerNotFound | raft::Error::StepLocalMsg)) => {
                debug!("Peer {} of region {} ignoring message: {err}", self.peer_id, self.region_id);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        self.handle_ready(&mut node)
    }

    /// Proposes a command. This only appends it to the Raft log: the result
    /// is delivered when the entry is applied.
    pub fn propose(&self, data: Vec<u8>) -> Result<()> {
        let mut node = self.lock()?;
        node.raw.propose(vec![], data)?;
        self.handle_ready(&mut node)
    }

    /// Proposes an entry on the leader, calling on_append with the log index
    /// and term it will be appended at before anything is applied. Returns
    /// false without proposing if the peer is not the leader.
    pub fn propose_entry(&self, data: Vec<u8>, on_append: impl FnOnce(u64, u64) -> Result<()>) -> Result<bool> {
        let mut node = self.lock()?;
        let Some((index, term)) = Self::next_position(&node) else {
            return Ok(false);
        };
        on_append(index, term)?;
        node.raw.propose(vec![], data)?;
        self.handle_ready(&mut node)?;
        Ok(true)
    }

    /// Proposes a membership change. The peer metadata is carried in the
    /// change context, for the region metadata update on apply.
    pub fn propose_conf_change(&self, changes: Vec<(ConfChangeType, PeerMeta)>) -> Result<()> {
        let cc = Self::conf_change(changes)?;
        let mut node = self.lock()?;
        node.raw.propose_conf_change(vec![], cc)?;
        self.handle_ready(&mut node)
    }

    /// Like propose_entry, for a membership change. If another change is
    /// still pending, Raft appends an empty entry in its place.
    pub fn propose_conf_change_entry(
        &self,
        changes: Vec<(ConfChangeType, PeerMeta)>,
        on_append: impl FnOnce(u64, u64) -> Result<()>,
    ) -> Result<bool> {
        let cc = Self::conf_change(changes)?;
        let mut node = self.lock()?;
        let Some((index, term)) = Self::next_position(&node) else {
            return Ok(false);
        };
        on_append(index, term)?;
        node.raw.propose_conf_change(vec![], cc)?;
        self.handle_ready(&mut node)?;
        Ok(true)
    }

    /// Returns the log position of the next leader proposal, or None if the
    /// peer is not the leader.
    fn next_position(node: &Node) -> Option<(u64, u64)> {
        let raft = &node.raw.raft;
        (raft.state == StateRole::Leader).then(|| (raft.raft_log.last_index() + 1, raft.term))
    }

    /// Builds a membership change.
    fn conf_change(changes: Vec<(ConfChangeType, PeerMeta)>) -> Result<ConfChangeV2> {
        let mut cc = ConfChangeV2::default();
        cc.changes = changes
            .iter()
            .map(|(kind, peer)| {
                let mut change = ConfChangeSingle::default();
                change.set_change_type(*kind);
                change.node_id = peer.peer_id;
                change
            })
            .collect();
        let peers: Vec<PeerMeta> = changes.into_iter().map(|(_, peer)| peer).collect();
        cc.context = peers.encode()?.into();
        Ok(cc)
    }

    /// Starts an election.
    pub fn campaign(&self) -> Result<()> {
        let mut node = self.lock()?;
        node.raw.campaign()?;
        self.handle_ready(&mut node)
    }

    /// Transfers leadership to the given peer.
    pub fn transfer_leader(&self, peer_id: PeerId) -> Result<()> {
        let mut node = self.lock()?;
        node.raw.transfer_leader(peer_id);
        self.handle_ready(&mut node)
    }

    /// Requests a read index, returning a channel that receives the index
    /// once leadership has been confirmed and the local state machine has
    /// applied up to it. The channel is dropped if leadership changes.
    pub fn read_index(&self) -> Result<Receiver<Result<u64>>> {
        let mut node = self.lock()?;
        let ctx = [self.peer_id.to_be_bytes(), node.next_read.to_be_bytes()].concat();
        node.next_read += 1;
        let (tx, rx) = crossbeam::channel::bounded(1);
        node.read_waiters.insert(ctx.clone(), tx);
        node.raw.read_index(ctx);
        self.handle_ready(&mut node)?;
        Ok(rx)
    }

    /// Returns a channel that receives once every peer of the region has
    /// persisted the log up to the given index. Only the leader tracks
    /// replication: the channel is dropped if the peer is or stops being a
    /// follower.
    pub fn wait_replicated(&self, index: u64) -> Result<Receiver<()>> {
        let mut node = self.lock()?;
        let (tx, rx) = crossbeam::channel::bounded(1);
        if node.raw.raft.state == StateRole::Leader {
            node.replication_waiters.push((index, tx));
            Self::release_replication(&mut node);
        }
        Ok(rx)
    }

    /// Applies the local log up to the given index, without waiting for Raft
    /// to hand over the entries. The entries must be committed by the
    /// region, which the caller guarantees. Used to catch up a merge source
    /// before it is merged into its target. Returns the applied index.
    pub fn catch_up(&self, index: u64) -> Result<u64> {
        let mut node = self.lock()?;
        if node.applied >= index {
            return Ok(node.applied);
        }
        let store = node.raw.store();
        let last = store.last_index()?;
        if last < index {
            return Err(Error::InvalidData(format!(
                "peer {} of region {} can't catch up to index {index}, log ends at {last}",
                self.peer_id, self.region_id
            )));
        }
        let entries = store.entries(node.applied + 1, index + 1, None, GetEntriesContext::empty(false))?;
        debug!("Catching up peer {} of region {} to index {index}", self.peer_id, self.region_id);
        self.apply(&mut node, entries)?;
        Ok(node.applied)
    }

    /// Reports the outcome of a snapshot send to a follower.
    pub fn report_snapshot(&self, peer_id: PeerId, status: SnapshotStatus) -> Result<()> {
        let mut node = self.lock()?;
        node.snapshot_slots.insert(peer_id, SnapshotSlot::Empty);
        node.raw.report_snapshot(peer_id, status);
        self.handle_ready(&mut node)
    }

    /// Failpoint: skip manifest pointer updates for this peer's log.
    #[doc(hidden)]
    pub fn fail_pointer_updates(&self, fail: bool) -> Result<()> {
        self.node.lock()?.raw.mut_store().set_fail_pointer_updates(fail);
        Ok(())
    }

    /// Failpoint: fail all writes to this peer's log.
    #[doc(hidden)]
    pub fn fail_log_writes(&self, fail: bool) -> Result<()> {
        self.node.lock()?.raw.mut_store().set_fail_writes(fail);
        Ok(())
    }

    /// Locks the node, unless the peer has been stopped.
    fn lock(&self) -> Result<MutexGuard<'_, Node>> {
        if self.is_stopped() {
            return Err(Error::Abort);
        }
        let node = self.node.lock()?;
        if self.is_stopped() {
            return Err(Error::Abort);
        }
        Ok(node)
    }

    /// Drains all Ready state. A failure leaves the Ready unacknowledged and
    /// the in-memory Raft state ahead of the log, so the peer is marked
    /// failed and stopped. The store replaces it with a new peer recovered
    /// from the log.
    fn handle_ready(&self, node: &mut Node) -> Result<()> {
        while node.raw.has_ready() && !self.is_stopped() {
            if let Err(err) = self.process_ready(node) {
                error!("Peer {} of region {} failed: {err}", self.peer_id, self.region_id);
                self.failed.store(true, Ordering::SeqCst);
                self.stopped.store(true, Ordering::SeqCst);
                Self::abort_waiters(node);
                return Err(err);
            }
        }
        Self::release_replication(node);
        Ok(())
    }

    /// Drops all waiters, disconnecting their channels.
    fn abort_waiters(node: &mut Node) {
        node.read_waiters.clear();
        node.pending_reads.clear();
        node.replication_waiters.clear();
    }

    /// Processes a single Ready. Log writes are batched, so the Ready costs
    /// a single WAL fsync before persisted messages are sent, and a single
    /// manifest pointer update at the end.
    fn process_ready(&self, node: &mut Node) -> Result<()> {
        let mut ready = node.raw.ready();

        if let Some(ss) = ready.ss() {
            if ss.raft_state == StateRole::Leader {
                info!("Peer {} became leader of region {}", self.peer_id, self.region_id);
            }
            // Read requests are dropped by Raft on leader changes.
            Self::abort_waiters(node);
        }
        for read in ready.take_read_states() {
            node.pending_reads.push((read.index, read.request_ctx));
        }

        // Persist the snapshot, entries and hard state, in that order. The
        // snapshot first, since it resets the log and commit index.
        node.raw.mut_store().begin_batch();
        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            let (index, term) = (snapshot.get_metadata().index, snapshot.get_metadata().term);
            node.raw.mut_store().apply_snapshot(&snapshot)?;
            let region = self.state.restore(&snapshot)?;
            info!("Restored {region} from snapshot at index {index} on peer {}", self.peer_id);
            for peer in &region.peers {
                node.peer_cache.insert(peer.peer_id, *peer);
            }
            self.set_region(region)?;
            node.raw.mut_store().set_applied(index, term)?;
            node.applied = index;
        }
        if !ready.entries().is_empty() {
            node.raw.mut_store().append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            node.raw.mut_store().set_hard_state(hs)?;
        }

        // Leader appends may be sent before the local write is durable.
        self.send_all(node, ready.take_messages())?;
        node.raw.mut_store().sync()?;
        self.apply(node, ready.take_committed_entries())?;
        if self.is_stopped() {
            return Ok(());
        }
        self.send_all(node, ready.take_persisted_messages())?;

        let mut light = node.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            node.raw.mut_store().set_commit(commit)?;
        }
        self.send_all(node, light.take_messages())?;
        self.apply(node, light.take_committed_entries())?;
        if self.is_stopped() {
            return Ok(());
        }
        node.raw.advance_apply();

        self.release_reads(node);
        self.maybe_compact(node)?;
        node.raw.mut_store().commit_batch()
    }

    /// Applies committed entries. Entries already applied by catch_up() are
    /// skipped.
    fn apply(&self, node: &mut Node, entries: Vec<Entry>) -> Result<()> {
        let Some(last) = entries.last().map(|e| (e.index, e.term)) else {
            return Ok(());
        };
        for entry in entries {
            if entry.index <= node.applied {
                continue;
            }
            match entry.entry_type() {
                EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => {
                    self.apply_conf_change(node, &entry)?;
                    if self.is_stopped() {
                        return Ok(());
                    }
                }
                EntryType::EntryNormal => {}
            }
            let region = self.region()?;
            if let Some(region) = self.state.apply(&region, &entry)? {
                self.set_region(region)?;
            }
            node.applied = entry.index;
        }
        node.raw.mut_store().set_applied(last.0, last.1)
    }

    /// Applies a membership change to Raft and the region metadata.
    fn apply_conf_change(&self, node: &mut Node, entry: &Entry) -> Result<()> {
        let cc = match entry.entry_type() {
            EntryType::EntryConfChange => {
                let v1 = ConfChange::decode(&entry.data[..])?;
                let mut change = ConfChangeSingle::default();
                change.set_change_type(v1.change_type());
                change.node_id = v1.node_id;
                let mut cc = ConfChangeV2::default();
                cc.changes = vec![change];
                cc.context = v1.context;
                cc
            }
            _ => ConfChangeV2::decode(&entry.data[..])?,
        };
        let cs = node.raw.apply_conf_change(&cc)?;
        node.raw.mut_store().set_conf_state(&cs)?;
        // Leaving a joint configuration carries no changes.
        if cc.changes.is_empty() {
            return Ok(());
        }

        let peers = Vec::<PeerMeta>::decode(&cc.context[..])?;
        let mut region = self.region()?;
        let mut changes = Vec::with_capacity(peers.len());
        for (change, peer) in cc.changes.iter().zip(peers) {
            let kind = change.change_type();
            match kind {
                ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                    if region.peer(peer.peer_id).is_none() {
                        region.peers.push(peer);
                    }
                    node.peer_cache.insert(peer.peer_id, peer);
                }
                ConfChangeType::RemoveNode => {
                    region.peers.retain(|p| p.peer_id != peer.peer_id);
                    node.snapshot_slots.remove(&peer.peer_id);
                }
            }
            changes.push((kind, peer));
        }
        region.epoch.conf_ver += changes.len() as u64;
        info!("Applied membership change {changes:?} to {region} at index {}", entry.index);

        let event = ConfChangeEvent {
            region_id: self.region_id,
            peer_id: self.peer_id,
            region: region.clone(),
            changes,
            index: entry.index,
            term: entry.term,
        };
        self.set_region(region)?;
        if let Some(handler) = &self.conf_change_handler {
            handler(&event)?;
        }
        Ok(())
    }

    /// Sends outbound messages.
    fn send_all(&self, node: &mut Node, messages: Vec<Message>) -> Result<()> {
        for message in messages {
            self.send(node, message)?;
        }
        Ok(())
    }

    /// Sends an outbound message, caching snapshots for resending. Send
    /// failures are reported to Raft as an unreachable peer.
    fn send(&self, node: &mut Node, message: Message) -> Result<()> {
        let to = message.to;
        let is_snapshot = message.msg_type() == MessageType::MsgSnapshot;
        let (to_peer, region_epoch) = {
            let region = self.region.read()?;
            (region.peer(to).copied().or_else(|| node.peer_cache.get(&to).copied()), region.epoch)
        };
        let Some(to_peer) = to_peer else {
            debug!("Dropping message to unknown peer {to} of region {}", self.region_id);
            return Ok(());
        };
        if is_snapshot {
            node.snapshot_slots.insert(to, SnapshotSlot::Pending { message: message.clone(), ticks: 0 });
        }
        let message = RaftMessage {
            region_id: self.region_id,
            from_peer: self.meta(),
            to_peer,
            region_epoch,
            message,
        };
        if let Err(err) = self.transport.send(message) {
            debug!("Failed sending to peer {to} of region {}: {err}", self.region_id);
            node.raw.report_unreachable(to);
            // Resend a failed snapshot on the next tick.
            if let Some(SnapshotSlot::Pending { ticks, .. }) = node.snapshot_slots.get_mut(&to) {
                *ticks = self.snapshot_resend_ticks;
            }
        }
        Ok(())
    }

    /// Releases replication waiters whose index all peers have persisted.
    fn release_replication(node: &mut Node) {
        if node.replication_waiters.is_empty() {
            return;
        }
        let matched = node.raw.raft.prs().iter().map(|(_, pr)| pr.matched).min().unwrap_or(0);
        node.replication_waiters.retain(|(index, tx)| {
            if *index > matched {
                return true;
            }
            let _ = tx.send(());
            false
        });
    }

    /// Releases read waiters whose read index has been applied.
    fn release_reads(&self, node: &mut Node) {
        let applied = node.applied;
        let waiters = &mut node.read_waiters;
        node.pending_reads.retain(|(index, ctx)| {
            if *index > applied {
                return true;
            }
            if let Some(tx) = waiters.remove(ctx) {
                // The receiver may have timed out and gone away.
                let _ = tx.send(Ok(*index));
            }
            false
        });
    }

    /// Compacts the log, keeping entries needed after pending snapshots.
    fn maybe_compact(&self, node: &mut Node) -> Result<()> {
        let cap = node.snapshot_slots.values().filter_map(SnapshotSlot::index).fold(node.applied, u64::min);
        node.raw.mut_store().maybe_compact(cap, self.log_retain)?;
        Ok(())
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("region_id", &self.region_id)
            .field("peer_id", &self.peer_id)
            .field("store_id", &self.store_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::manifest::Manifest;
    use super::super::transport::LocalTransport;
    use super::*;
    use crate::encoding;
    use crossbeam::channel::TryRecvError;
    use pretty_assertions::assert_eq;
    use raft::prelude::Snapshot;
    use serde::{Deserialize, Serialize};
    use std::cell::Cell;
    use std::time::Duration;

    /// A state machine recording applied command payloads.
    #[derive(Default)]
    struct TestState {
        inner: Mutex<Applied>,
    }

    #[derive(Clone, Default, Serialize, Deserialize)]
    struct Applied {
        index: u64,
        commands: Vec<Vec<u8>>,
        region: Option<RegionMeta>,
    }

    impl encoding::Value for Applied {}

    impl TestState {
        fn commands(&self) -> Vec<Vec<u8>> {
            self.inner.lock().expect("poisoned").commands.clone()
        }
    }

    impl State for TestState {
        fn applied_index(&self) -> Result<u64> {
            Ok(self.inner.lock()?.index)
        }

        fn apply(&self, region: &RegionMeta, entry: &Entry) -> Result<Option<RegionMeta>> {
            let mut inner = self.inner.lock()?;
            inner.index = entry.index;
            inner.region = Some(region.clone());
            if entry.entry_type() == EntryType::EntryNormal && !entry.data.is_empty() {
                inner.commands.push(entry.data.to_vec());
            }
            Ok(None)
        }

        fn snapshot(&self) -> Result<(u64, Vec<u8>)> {
            let inner = self.inner.lock()?;
            Ok((inner.index, inner.encode()?))
        }

        fn restore(&self, snapshot: &Snapshot) -> Result<RegionMeta> {
            let applied = Applied::decode(&snapshot.data[..])?;
            let region = applied.region.clone().ok_or(Error::InvalidData("no region".into()))?;
            *self.inner.lock()? = applied;
            Ok(region)
        }
    }

    /// A cluster of peers for a single region, connected by a local
    /// transport and pumped manually.
    struct Cluster {
        dir: tempfile::TempDir,
        transport: LocalTransport,
        peers: HashMap<PeerId, (Arc<Peer>, Arc<TestState>, Receiver<RaftMessage>)>,
        events: Arc<Mutex<Vec<ConfChangeEvent>>>,
        options: Options,
    }

    impl Cluster {
        /// Creates a cluster with voters 1..=size, where peer N lives on store N.
        fn new(size: u64) -> Result<Self> {
            Self::with_options(size, Options::default())
        }

        /// Creates a cluster using the given peer options.
        fn with_options(size: u64, options: Options) -> Result<Self> {
            let mut cluster = Self {
                dir: tempfile::tempdir()?,
                transport: LocalTransport::new(),
                peers: HashMap::new(),
                events: Arc::new(Mutex::new(Vec::new())),
                options,
            };
            let peers: Vec<PeerMeta> = (1..=size).map(|id| PeerMeta { store_id: id, peer_id: id }).collect();
            let region = RegionMeta::new(1, vec![], vec![], peers);
            for id in 1..=size {
                cluster.add(id, region.clone(), true)?;
            }
            Ok(cluster)
        }

        /// Adds a peer, either bootstrapped or uninitialized.
        fn add(&mut self, id: PeerId, region: RegionMeta, bootstrap: bool) -> Result<()> {
            // Each peer lives on its own store, with its own manifest.
            let path = self.dir.path().join(format!("store{id}"));
            let manifest = Arc::new(Manifest::open(&path.join("MANIFEST"), false)?);
            let mut log = RaftLogStore::open(1, &path.join("raft-1"), manifest, 1 << 20, false)?;
            if bootstrap {
                log.bootstrap(region.voters())?;
            }
            let state = Arc::new(TestState::default());
            state.inner.lock()?.region = Some(region.clone());
            if bootstrap {
                state.inner.lock()?.index = super::super::log::INIT_INDEX;
            }
            let rx = self.transport.register(id)?;
            let mut peer =
                Peer::new(id, id, region, log, state.clone(), Arc::new(self.transport.clone()), &self.options)?;
            let events = self.events.clone();
            peer.set_conf_change_handler(Arc::new(move |event| {
                events.lock()?.push(event.clone());
                Ok(())
            }));
            self.peers.insert(id, (Arc::new(peer), state, rx));
            Ok(())
        }

        fn peer(&self, id: PeerId) -> &Arc<Peer> {
            &self.peers[&id].0
        }

        fn commands(&self, id: PeerId) -> Vec<Vec<u8>> {
            self.peers[&id].1.commands()
        }

        /// Delivers messages until the cluster is quiescent.
        fn pump(&self) -> Result<()> {
            self.pump_dropping(|_| false)
        }

        /// Like pump(), but loses messages matching the predicate.
        fn pump_dropping(&self, lose: impl Fn(&RaftMessage) -> bool) -> Result<()> {
            loop {
                let mut delivered = false;
                for (peer, _, rx) in self.peers.values() {
                    while let Ok(message) = rx.try_recv() {
                        delivered = true;
                        if lose(&message) {
                            continue;
                        }
                        match peer.step(message) {
                            Ok(()) | Err(Error::Abort) => {}
                            Err(err) => return Err(err),
                        }
                    }
                }
                if !delivered {
                    return Ok(());
                }
            }
        }

        /// Elects the given peer as leader.
        fn elect(&self, id: PeerId) -> Result<()> {
            self.peer(id).campaign()?;
            self.pump()?;
            assert!(self.peer(id).is_leader()?);
            Ok(())
        }

        /// Ticks a peer the given number of times, pumping after each tick.
        fn tick(&self, id: PeerId, ticks: usize, lose: impl Fn(&RaftMessage) -> bool) -> Result<()> {
            for _ in 0..ticks {
                self.peer(id).tick()?;
                self.pump_dropping(&lose)?;
            }
            Ok(())
        }

        /// Adds an uninitialized peer 4 to a 3-peer cluster led by peer 1.
        /// Messages are delivered via pump_dropping() with the given
        /// predicate.
        fn add_fourth(&mut self, lose: impl Fn(&RaftMessage) -> bool) -> Result<()> {
            self.add(4, RegionMeta::new(1, vec![], vec![], vec![]), false)?;
            self.peer(1).propose_conf_change(vec![(ConfChangeType::AddNode, PeerMeta { store_id: 4, peer_id: 4 })])?;
            self.pump_dropping(&lose)?;
            self.tick(1, self.options.heartbeat_tick, &lose)
        }
    }

    fn is_snapshot(message: &RaftMessage) -> bool {
        message.message.msg_type() == MessageType::MsgSnapshot
    }

    #[test]
    fn single_peer() -> Result<()> {
        let cluster = Cluster::new(1)?;
        cluster.elect(1)?;
        cluster.peer(1).propose(b"a".to_vec())?;
        cluster.peer(1).propose(b"b".to_vec())?;
        assert_eq!(cluster.commands(1), vec![b"a".to_vec(), b"b".to_vec()]);

        let status = cluster.peer(1).status()?;
        assert!(status.is_leader);
        assert_eq!(status.leader, 1);
        assert_eq!(status.applied_index, status.commit_index);
        Ok(())
    }

    #[test]
    fn replication() -> Result<()> {
        let cluster = Cluster::new(3)?;
        cluster.elect(1)?;
        assert_eq!(cluster.peer(2).leader()?, Some(PeerMeta { store_id: 1, peer_id: 1 }));

        cluster.peer(1).propose(b"a".to_vec())?;
        cluster.pump()?;
        // Followers learn about the commit in the next heartbeat or append.
        cluster.peer(1).propose(b"b".to_vec())?;
        cluster.pump()?;
        assert_eq!(cluster.commands(1), vec![b"a".to_vec(), b"b".to_vec()]);
        for _ in 0..Options::default().heartbeat_tick {
            cluster.peer(1).tick()?;
        }
        cluster.pump()?;
        assert_eq!(cluster.commands(2), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(cluster.commands(3), vec![b"a".to_vec(), b"b".to_vec()]);

        // Proposals on followers are forwarded to the leader.
        cluster.peer(3).propose(b"c".to_vec())?;
        cluster.pump()?;
        assert_eq!(cluster.commands(1).last(), Some(&b"c".to_vec()));
        Ok(())
    }

    #[test]
    fn read_index() -> Result<()> {
        let cluster = Cluster::new(3)?;
        cluster.elect(1)?;
        cluster.peer(1).propose(b"a".to_vec())?;
        cluster.pump()?;

        let rx = cluster.peer(1).read_index()?;
        cluster.pump()?;
        let index = rx.recv_timeout(Duration::from_secs(1))??;
        assert_eq!(index, cluster.peer(1).status()?.commit_index);
        Ok(())
    }

    #[test]
    fn add_peer_via_snapshot() -> Result<()> {
        let mut cluster = Cluster::new(3)?;
        cluster.elect(1)?;
        cluster.peer(1).propose(b"a".to_vec())?;
        cluster.pump()?;

        // Peer 4 starts uninitialized, with no region metadata or log.
        let new = PeerMeta { store_id: 4, peer_id: 4 };
        cluster.add(4, RegionMeta::new(1, vec![], vec![], vec![]), false)?;
        cluster.peer(1).propose_conf_change(vec![(ConfChangeType::AddNode, new)])?;
        cluster.pump()?;
        for _ in 0..Options::default().heartbeat_tick {
            cluster.peer(1).tick()?;
        }
        cluster.pump()?;

        let region = cluster.peer(1).region()?;
        assert_eq!(region.epoch.conf_ver, 2);
        assert_eq!(region.voters(), vec![1, 2, 3, 4]);
        assert_eq!(cluster.peer(4).region()?.voters(), vec![1, 2, 3, 4]);
        assert_eq!(cluster.commands(4), vec![b"a".to_vec()]);

        let events = cluster.events.lock()?.clone();
        let leader_event = events.iter().find(|e| e.peer_id == 1).expect("no event on leader");
        assert_eq!(leader_event.changes, vec![(ConfChangeType::AddNode, new)]);
        assert_eq!(leader_event.region, region);

        // The new peer takes part in replication.
        cluster.peer(1).propose(b"b".to_vec())?;
        cluster.pump()?;
        for _ in 0..Options::default().heartbeat_tick {
            cluster.peer(1).tick()?;
        }
        cluster.pump()?;
        assert_eq!(cluster.commands(4), vec![b"a".to_vec(), b"b".to_vec()]);
        Ok(())
    }

    #[test]
    fn stopped_peer_aborts() -> Result<()> {
        let cluster = Cluster::new(1)?;
        cluster.elect(1)?;
        cluster.peer(1).stop();
        assert_eq!(cluster.peer(1).propose(b"a".to_vec()), Err(Error::Abort));
        assert_eq!(cluster.peer(1).tick(), Err(Error::Abort));
        Ok(())
    }

    #[test]
    fn snapshot_resent_after_loss() -> Result<()> {
        let mut cluster = Cluster::new(3)?;
        cluster.elect(1)?;
        cluster.peer(1).propose(b"a".to_vec())?;
        cluster.pump()?;

        // The snapshot initializing peer 4 is lost in transit.
        let lost = Cell::new(0);
        cluster.add_fourth(|message| {
            if is_snapshot(message) {
                lost.set(lost.get() + 1);
            }
            is_snapshot(message)
        })?;
        assert!(lost.get() > 0);
        assert_eq!(cluster.commands(4), Vec::<Vec<u8>>::new());
        assert_eq!(cluster.peer(1).status()?.pending_snapshots, 1);

        // It's resent once the resend interval has passed without an
        // acknowledgement.
        cluster.tick(1, cluster.options.snapshot_resend_ticks, |_| false)?;
        assert_eq!(cluster.commands(4), vec![b"a".to_vec()]);
        assert_eq!(cluster.peer(4).region()?.voters(), vec![1, 2, 3, 4]);
        assert_eq!(cluster.peer(1).status()?.pending_snapshots, 0);
        Ok(())
    }

    #[test]
    fn compaction_keeps_entries_after_pending_snapshot() -> Result<()> {
        let options = Options { log_retain: 2, ..Options::default() };
        let mut cluster = Cluster::with_options(3, options)?;
        cluster.elect(1)?;
        cluster.peer(1).propose(b"a".to_vec())?;
        cluster.pump()?;

        let snapshot_index = Cell::new(0);
        let lose_snapshot = |message: &RaftMessage| {
            if is_snapshot(message) {
                snapshot_index.set(message.message.get_snapshot().get_metadata().index);
            }
            is_snapshot(message)
        };
        cluster.add_fourth(&lose_snapshot)?;
        let index = snapshot_index.get();
        assert!(index > 0);

        // While the snapshot is pending, the log after it is retained even
        // though the retention limit is exceeded.
        for i in 0..5 {
            cluster.peer(1).propose(vec![b'b', i])?;
            cluster.pump_dropping(&lose_snapshot)?;
        }
        let status = cluster.peer(1).status()?;
        assert_eq!(status.pending_snapshots, 1);
        assert!(status.applied_index >= index + 5, "applied {} snapshot {index}", status.applied_index);
        assert!(status.first_index <= index + 1, "first {} snapshot {index}", status.first_index);

        // Once peer 4 catches up from the resent snapshot and the retained
        // entries, compaction resumes.
        cluster.tick(1, cluster.options.snapshot_resend_ticks, |_| false)?;
        cluster.peer(1).propose(b"c".to_vec())?;
        cluster.pump()?;
        cluster.tick(1, cluster.options.heartbeat_tick, |_| false)?;
        let status = cluster.peer(1).status()?;
        assert_eq!(status.pending_snapshots, 0);
        assert!(status.first_index > index + 1, "first {} snapshot {index}", status.first_index);
        assert_eq!(cluster.commands(4).last(), Some(&b"c".to_vec()));
        assert_eq!(cluster.commands(4).len(), cluster.commands(1).len());
        Ok(())
    }

    #[test]
    fn partitioned_leader_drops_reads() -> Result<()> {
        let cluster = Cluster::new(3)?;
        cluster.elect(1)?;
        cluster.peer(1).propose(b"a".to_vec())?;
        cluster.pump()?;

        // An isolated leader can't confirm its leadership for a read.
        cluster.transport.isolate(1)?;
        let rx = cluster.peer(1).read_index()?;
        cluster.pump()?;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        // Once it notices the lost quorum and steps down, the read is
        // dropped. Meanwhile, the majority elects a new leader.
        for _ in 0..3 * cluster.options.election_tick {
            for id in 1..=3 {
                cluster.peer(id).tick()?;
            }
            cluster.pump()?;
        }
        assert!(!cluster.peer(1).is_leader()?);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));

        // The new leader serves reads.
        let leader = cluster.peer(2).status()?.leader;
        assert!([2, 3].contains(&leader), "unexpected leader {leader}");
        let rx = cluster.peer(leader).read_index()?;
        cluster.pump()?;
        assert_eq!(rx.recv_timeout(Duration::from_secs(1))??, cluster.peer(leader).status()?.commit_index);
        Ok(())
    }
}
