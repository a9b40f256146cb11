use super::command::{AdminCommand, RaftCmdRequest, RegionError, RegionResult, Response};
use super::Store;
use crate::error::{Error, Result};
use crate::raft::{ConfChangeEvent, ConfChangeType, RaftLogStore};
use crate::region::{PeerId, PeerMeta, RegionId, RegionMeta, RegionState, StoreId};
use crate::{errdata, errinput};

use itertools::Itertools as _;
use log::{info, warn};

impl Store {
    /// Splits a region at the child's start key. The parent keeps the left
    /// half and the child takes the right half, both at the parent's epoch
    /// version plus one. The child's local peer is started. If that fails,
    /// the parent is rolled back.
    ///
    /// Called when applying a split on every replica. If a peer for the child
    /// already exists, it was created by an inbound message before the split
    /// applied here: an initialized one (restored from a snapshot) is kept,
    /// an uninitialized one is replaced.
    pub fn split_region(&self, parent_id: RegionId, mut child: RegionMeta) -> Result<(RegionMeta, RegionMeta)> {
        let Some(original) = self.region_meta_by_id(parent_id)? else {
            return errinput!("region {parent_id} not found");
        };
        if !original.is_valid_split_key(&child.start_key) {
            return errinput!("invalid split key {} for {original}", child.start_key.escape_ascii());
        }
        let Some(local) = child.peer_on_store(self.id()).copied() else {
            return errinput!("split child {} has no peer on store {}", child.id, self.id());
        };

        let mut parent = original.clone();
        child.end_key = std::mem::replace(&mut parent.end_key, child.start_key.clone());
        parent.epoch.version += 1;
        child.epoch = parent.epoch;
        child.state = RegionState::New;

        self.update_region(parent.clone(), true)?;
        let parent_peer = self.peer(parent_id)?;
        if let Some(peer) = &parent_peer {
            peer.set_region(parent.clone())?;
        }
        if let Err(err) = self.start_split_child(&child, local) {
            warn!("Failed to start split child {child}, rolling back {parent}: {err}");
            self.update_region(original.clone(), true)?;
            if let Some(peer) = &parent_peer {
                peer.set_region(original)?;
            }
            return Err(err);
        }
        info!("Split {parent} and {child}");
        let child = self.region_meta_by_id(child.id)?.unwrap_or(child);
        Ok((parent, child))
    }

    /// Starts the local peer of a split child.
    fn start_split_child(&self, child: &RegionMeta, local: PeerMeta) -> Result<()> {
        if let Some(existing) = self.peer(child.id)? {
            if !existing.region()?.peers.is_empty() {
                info!("Split child {} already initialized", child.id);
                return Ok(());
            }
            self.stop_peer(child.id)?;
            self.inner.catalog.write()?.remove(child.id);
            RaftLogStore::destroy(child.id, &self.inner.config.raft_dir(child.id), &self.inner.manifest)?;
        }
        self.start_peer(child.clone(), local, true)?;
        Ok(())
    }

    /// Merges the fenced source region into the adjacent target region: the
    /// target takes over the source's key range at an epoch version above
    /// both, and the source is tombstoned and its local peer destroyed.
    ///
    /// Called when applying a merge on the target's replicas. The local
    /// source peer first applies its log up to the fence at source_index,
    /// which every source replica has persisted before the merge was
    /// proposed. The source data is then in the shared engine, so nothing is
    /// moved.
    pub(super) fn merge_region(
        &self,
        target: &RegionMeta,
        source_id: RegionId,
        source_index: u64,
    ) -> Result<RegionResult<RegionMeta>> {
        let source = self.region_meta_by_id(source_id)?.filter(|r| r.state != RegionState::Tombstone);
        if source.is_none() {
            return Ok(Err(RegionError::RegionNotFound { region_id: source_id }));
        }
        let Some(source_peer) = self.peer(source_id)? else {
            return errdata!("no local peer for merge source region {source_id}");
        };
        source_peer.catch_up(source_index)?;
        let Some(mut source) = self.region_meta_by_id(source_id)? else {
            return Ok(Err(RegionError::RegionNotFound { region_id: source_id }));
        };
        let fence = RegionState::Merging { target: target.id, index: source_index };
        if source.state != fence {
            warn!("Merge source {source} is not fenced for region {} at index {source_index}", target.id);
            return Ok(Err(RegionError::EpochNotMatch { current_regions: vec![target.clone(), source] }));
        }
        let mut merged = target.clone();
        if !target.end_key.is_empty() && target.end_key == source.start_key {
            merged.end_key = source.end_key.clone();
        } else if !target.start_key.is_empty() && source.end_key == target.start_key {
            merged.start_key = source.start_key.clone();
        } else {
            return Ok(Err(RegionError::EpochNotMatch { current_regions: vec![target.clone(), source] }));
        }
        merged.epoch.version = target.epoch.version.max(source.epoch.version) + 1;
        merged.state = RegionState::Running;

        self.update_region(merged.clone(), true)?;
        self.destroy_peer(source_id)?;
        source.state = RegionState::Tombstone;
        self.update_region(source.clone(), true)?;
        info!("Merged {source} into {merged}");
        Ok(Ok(merged))
    }

    /// Proposes a split of a region at the given key, allocating IDs for the
    /// new region and its peers. On success, returns the parent and child,
    /// and campaigns the local child peer so that it doesn't have to wait for
    /// an election timeout.
    pub fn propose_split(&self, region_id: RegionId, split_key: Vec<u8>) -> Result<RegionResult<Vec<RegionMeta>>> {
        let Some(parent) = self.region_meta_by_id(region_id)? else {
            return Ok(Err(RegionError::RegionNotFound { region_id }));
        };
        if !parent.is_valid_split_key(&split_key) {
            return errinput!("invalid split key {} for {parent}", split_key.escape_ascii());
        }
        let placement = &self.inner.placement;
        let child_id = placement.alloc_id()?;
        let peers = parent
            .peers
            .iter()
            .map(|p| Ok(PeerMeta { store_id: p.store_id, peer_id: placement.alloc_id()? }))
            .collect::<Result<Vec<_>>>()?;
        let child = RegionMeta::new(child_id, split_key.clone(), parent.end_key.clone(), peers);
        let admin = AdminCommand::Split { parent_region_id: region_id, split_key, child };
        let regions = match self.propose_command(RaftCmdRequest::admin(region_id, parent.epoch, admin))? {
            Ok(responses) => admin_regions(responses)?,
            Err(err) => return Ok(Err(err)),
        };
        if let Some(peer) = self.peer(child_id)? {
            peer.campaign()?;
        }
        Ok(Ok(regions))
    }

    /// Proposes a merge of the source region into the adjacent target
    /// region. Both must be replicated on the same stores, with their local
    /// peers as leaders. The merge runs in two steps:
    ///
    /// 1. PrepareMerge through the source's log fences the source: from then
    ///    on it rejects all commands. If the source is already fenced for the
    ///    target by an earlier attempt, that fence is reused.
    /// 2. Once every source replica has persisted the log up to the fence,
    ///    Merge through the target's log extends the target.
    ///
    /// If the merge definitely failed (the source replicas didn't catch up
    /// in time, or the target rejected the merge), the fence is lifted via
    /// RollbackMerge. A timed out merge may still apply, so the fence stays
    /// and the merge can be retried.
    pub fn propose_merge(&self, target_id: RegionId, source_id: RegionId) -> Result<RegionResult<RegionMeta>> {
        let (Some(target), Some(source)) = (self.region_meta_by_id(target_id)?, self.region_meta_by_id(source_id)?)
        else {
            return Ok(Err(RegionError::RegionNotFound { region_id: target_id }));
        };
        let adjacent = (!target.end_key.is_empty() && target.end_key == source.start_key)
            || (!target.start_key.is_empty() && source.end_key == target.start_key);
        if !adjacent {
            return errinput!("{source} is not adjacent to {target}");
        }
        let stores = |r: &RegionMeta| r.peers.iter().map(|p| p.store_id).sorted().collect::<Vec<StoreId>>();
        if stores(&target) != stores(&source) {
            return errinput!("{source} and {target} are not on the same stores");
        }
        let (Some(source_peer), Some(target_peer)) = (self.peer(source_id)?, self.peer(target_id)?) else {
            return Ok(Err(RegionError::RegionNotFound { region_id: source_id }));
        };
        if !source_peer.is_leader()? {
            return Ok(Err(RegionError::NotLeader { region_id: source_id, leader: source_peer.leader()? }));
        }
        if !target_peer.is_leader()? {
            return Ok(Err(RegionError::NotLeader { region_id: target_id, leader: target_peer.leader()? }));
        }

        let index = match source.state {
            RegionState::Merging { target, index } if target == target_id => index,
            RegionState::Merging { target, .. } => return errinput!("{source} is merging into region {target}"),
            _ => {
                let admin = AdminCommand::PrepareMerge { source_region_id: source_id, target_region_id: target_id };
                let fenced = match self.propose_command(RaftCmdRequest::admin(source_id, source.epoch, admin))? {
                    Ok(responses) => admin_region(responses, source_id)?,
                    Err(err) => return Ok(Err(err)),
                };
                match fenced.state {
                    RegionState::Merging { index, .. } => index,
                    _ => return errdata!("{fenced} not fenced for merge"),
                }
            }
        };

        let replicated = source_peer.wait_replicated(index)?;
        if replicated.recv_timeout(self.inner.config.proposal_timeout()).is_err() {
            warn!("Replicas of region {source_id} did not reach merge fence at index {index}");
            self.rollback_merge(source_id)?;
            return Err(Error::Timeout);
        }

        let Some(target) = self.region_meta_by_id(target_id)? else {
            return Ok(Err(RegionError::RegionNotFound { region_id: target_id }));
        };
        let admin =
            AdminCommand::Merge { target_region_id: target_id, source_region_id: source_id, source_index: index };
        match self.propose_command(RaftCmdRequest::admin(target_id, target.epoch, admin))? {
            Ok(responses) => Ok(Ok(admin_region(responses, target_id)?)),
            Err(err) => {
                warn!("Merge of region {source_id} into {target_id} rejected: {err}");
                self.rollback_merge(source_id)?;
                Ok(Err(err))
            }
        }
    }

    /// Lifts the merge fence of a source region, if it's still fenced and
    /// the local peer leads it. Failures are logged: the fence stays, and a
    /// retried merge reuses it.
    pub(super) fn rollback_merge(&self, source_id: RegionId) -> Result<()> {
        let Some(source) = self.region_meta_by_id(source_id)?.filter(RegionMeta::is_merging) else {
            return Ok(());
        };
        let admin = AdminCommand::RollbackMerge { source_region_id: source_id };
        match self.propose_command(RaftCmdRequest::admin(source_id, source.epoch, admin)) {
            Ok(Ok(_)) => info!("Lifted merge fence of region {source_id}"),
            Ok(Err(err)) => warn!("Failed to lift merge fence of region {source_id}: {err}"),
            Err(err) => warn!("Failed to lift merge fence of region {source_id}: {err}"),
        }
        Ok(())
    }

    /// Adds a peer for the region on the given store, waiting until the
    /// local peer has applied the change. The new peer is created on the
    /// target store when it receives the first message, and initialized by a
    /// snapshot.
    pub fn propose_add_peer(&self, region_id: RegionId, store_id: StoreId) -> Result<RegionResult<RegionMeta>> {
        let Some(region) = self.region_meta_by_id(region_id)? else {
            return Ok(Err(RegionError::RegionNotFound { region_id }));
        };
        if region.peer_on_store(store_id).is_some() {
            return errinput!("{region} already has a peer on store {store_id}");
        }
        let new = PeerMeta { store_id, peer_id: self.inner.placement.alloc_id()? };
        self.propose_conf_change(&region, vec![(ConfChangeType::AddNode, new)])
    }

    /// Removes a peer from the region, waiting until the local peer has
    /// applied the change. Removing the local peer tombstones the region on
    /// this store.
    pub fn propose_remove_peer(&self, region_id: RegionId, peer_id: PeerId) -> Result<RegionResult<RegionMeta>> {
        let Some(region) = self.region_meta_by_id(region_id)? else {
            return Ok(Err(RegionError::RegionNotFound { region_id }));
        };
        let Some(peer) = region.peer(peer_id).copied() else {
            return errinput!("{region} has no peer {peer_id}");
        };
        self.propose_conf_change(&region, vec![(ConfChangeType::RemoveNode, peer)])
    }

    /// Proposes a membership change at the local leader, and waits for the
    /// local peer to apply it. Returns the changed region.
    fn propose_conf_change(
        &self,
        region: &RegionMeta,
        changes: Vec<(ConfChangeType, PeerMeta)>,
    ) -> Result<RegionResult<RegionMeta>> {
        if region.state != RegionState::Running {
            return Ok(Err(RegionError::EpochNotMatch { current_regions: vec![region.clone()] }));
        }
        let peer = self.local_peer(region.id)?;
        info!("Proposing membership change {changes:?} for region {}", region.id);
        let mut registered = None;
        let proposed = peer.propose_conf_change_entry(changes, |index, term| {
            registered = Some((index, self.inner.pipeline.register_entry(region.id, index, term)?));
            Ok(())
        });
        match self.wait_entry(&peer, proposed, registered)? {
            Ok(responses) => Ok(Ok(admin_region(responses, region.id)?)),
            Err(err) => Ok(Err(err)),
        }
    }

    /// Transfers region leadership to the given peer. Returns once the
    /// transfer has been initiated.
    pub fn transfer_leader(&self, region_id: RegionId, peer_id: PeerId) -> Result<RegionResult<()>> {
        let Some(peer) = self.peer(region_id)? else {
            return Ok(Err(RegionError::RegionNotFound { region_id }));
        };
        if peer.region()?.peer(peer_id).is_none() {
            return errinput!("region {region_id} has no peer {peer_id}");
        }
        if !peer.is_leader()? {
            return Ok(Err(RegionError::NotLeader { region_id, leader: peer.leader()? }));
        }
        info!("Transferring leadership of region {region_id} to peer {peer_id}");
        peer.transfer_leader(peer_id)?;
        Ok(Ok(()))
    }

    /// Handles an applied membership change: persists the new region
    /// metadata, and tombstones the region if the local peer was removed.
    /// Runs within the peer's apply path.
    pub(super) fn on_conf_change(&self, event: &ConfChangeEvent) -> Result<()> {
        let mut region = event.region.clone();
        let result = Ok(vec![Response::Admin(vec![region.clone()])]);
        self.inner.pipeline.complete_entry(region.id, event.index, event.term, result)?;
        if region.peer(event.peer_id).is_some() {
            if !region.is_merging() {
                region.state = RegionState::Running;
            }
            return self.update_region(region, true);
        }
        info!("Peer {} removed from {region}, destroying it", event.peer_id);
        region.state = RegionState::Removing;
        self.update_region(region.clone(), true)?;
        self.destroy_peer(region.id)?;
        region.state = RegionState::Tombstone;
        self.update_region(region, true)
    }
}

/// Extracts the regions of an admin response.
fn admin_regions(responses: Vec<Response>) -> Result<Vec<RegionMeta>> {
    match responses.into_iter().next() {
        Some(Response::Admin(regions)) => Ok(regions),
        response => errdata!("unexpected admin response {response:?}"),
    }
}

/// Extracts the given region of an admin response.
fn admin_region(responses: Vec<Response>, region_id: RegionId) -> Result<RegionMeta> {
    match admin_regions(responses)?.into_iter().find(|r| r.id == region_id) {
        Some(region) => Ok(region),
        None => errdata!("admin response has no region {region_id}"),
    }
}
