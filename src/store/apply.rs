use super::command::{AdminCommand, Payload, RaftCmdRequest, RawRecord, RegionError, Request, Response};
use super::{Inner, Store};
use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};
use crate::mvcc::Mvcc;
use crate::raft::State;
use crate::region::{Epoch, PeerId, RegionId, RegionMeta, RegionState};
use crate::storage::{key_range, ColumnFamily, Engine, KeyRange};

use log::{debug, info};
use raft::prelude::{Entry, EntryType, Snapshot};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::ops::Bound;
use std::sync::Weak;

/// Unversioned key prefix for region applied indexes.
const APPLIED_PREFIX: u8 = b'm';

/// Unversioned key prefix for raw (non-transactional) records.
const RAW_PREFIX: u8 = b'r';

/// Returns the unversioned key holding a region's applied index.
fn applied_key(region_id: RegionId) -> Vec<u8> {
    let mut key = vec![APPLIED_PREFIX];
    key.extend_from_slice(&region_id.to_be_bytes());
    key
}

/// Returns the unversioned key of a raw record.
pub(super) fn raw_key(key: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(key.len() + 1);
    raw.push(RAW_PREFIX);
    raw.extend_from_slice(key);
    raw
}

/// Returns the unversioned key range of raw records in a region.
fn raw_range(region: &RegionMeta) -> KeyRange {
    let end = match region.end_key.is_empty() {
        true => Bound::Excluded(vec![RAW_PREFIX + 1]),
        false => Bound::Excluded(raw_key(&region.end_key)),
    };
    (Bound::Included(raw_key(&region.start_key)), end)
}

/// Reads a region's applied index from the engine.
fn load_applied(engine: &mut dyn Engine, region_id: RegionId) -> Result<u64> {
    match engine.get_unversioned(&applied_key(region_id))? {
        Some(bytes) => Ok(u64::from_be_bytes(bytes.as_slice().try_into()?)),
        None => Ok(0),
    }
}

/// A region snapshot: the region's metadata and all of its data.
#[derive(Debug, Serialize, Deserialize)]
struct RegionSnapshot {
    region: RegionMeta,
    applied_index: u64,
    /// Versioned entries as (column family, key, version, value).
    entries: Vec<(ColumnFamily, ByteBuf, u64, ByteBuf)>,
    /// Raw records as (key, value), with the raw prefix stripped.
    raw: Vec<(ByteBuf, ByteBuf)>,
}

impl encoding::Value for RegionSnapshot {}

/// Applies a region's committed entries to the store's shared engine. All
/// regions share one engine, each owning the data in its key range. The
/// applied index is kept in the engine alongside the data.
pub(super) struct Applier {
    region_id: RegionId,
    peer_id: PeerId,
    store: Weak<Inner>,
}

impl Applier {
    pub(super) fn new(region_id: RegionId, peer_id: PeerId, store: Weak<Inner>) -> Self {
        Self { region_id, peer_id, store }
    }

    fn store(&self) -> Result<Store> {
        let inner = self.store.upgrade().ok_or(Error::Abort)?;
        Ok(Store { inner })
    }

    /// Sets the applied index, e.g. to the initial index of a bootstrapped
    /// region.
    pub(super) fn set_applied_index(&self, index: u64) -> Result<()> {
        let store = self.store()?;
        let mut engine = store.inner.engine.lock()?;
        engine.set_unversioned(&applied_key(self.region_id), index.to_be_bytes().to_vec())
    }

    /// Applies a transactional command at the given log index, returning the
    /// updated region if the command changed it. The result is delivered to
    /// the proposer if it was proposed by the local peer during this run of
    /// the store.
    fn apply_command(
        &self,
        store: &Store,
        region: &RegionMeta,
        command: RaftCmdRequest,
        index: u64,
    ) -> Result<Option<RegionMeta>> {
        let RaftCmdRequest { header, requests, admin } = command;
        let mut changed = None;
        let result = match admin {
            Some(admin) => match Self::check_admin(region, header.region_epoch, &admin) {
                Err(err) => Err(err),
                Ok(()) => match self.apply_admin(store, region, admin, index)? {
                    Ok(regions) => {
                        changed = regions.iter().find(|r| r.id == region.id).cloned();
                        Ok(vec![Response::Admin(regions)])
                    }
                    Err(err) => Err(err),
                },
            },
            None => match Self::check_requests(store, region, header.region_epoch, &requests)? {
                Err(err) => Err(err),
                Ok(()) => Ok(requests
                    .into_iter()
                    .map(|request| execute(&store.inner.mvcc, region, request))
                    .collect::<Result<_>>()?),
            },
        };
        if let Err(err) = &result {
            debug!("Command {} on {region} failed: {err}", header.request_id);
        }
        if header.peer_id == self.peer_id {
            store.inner.pipeline.complete(header.incarnation, header.request_id, result)?;
        }
        Ok(changed)
    }

    /// Checks that an admin command's epoch matches the region, and that the
    /// region is in a state that allows it. The region may have changed since
    /// the command was proposed. Only a merge rollback is allowed while the
    /// region is fenced for a merge.
    fn check_admin(
        region: &RegionMeta,
        epoch: Epoch,
        admin: &AdminCommand,
    ) -> std::result::Result<(), RegionError> {
        let stale = || Err(RegionError::EpochNotMatch { current_regions: vec![region.clone()] });
        if epoch != region.epoch {
            return stale();
        }
        match admin {
            AdminCommand::RollbackMerge { .. } if !region.is_merging() => stale(),
            AdminCommand::RollbackMerge { .. } => Ok(()),
            _ if region.state != RegionState::Running => stale(),
            AdminCommand::Split { split_key, child, .. }
                if !region.is_valid_split_key(split_key) || child.start_key != *split_key =>
            {
                stale()
            }
            _ => Ok(()),
        }
    }

    /// Checks that a data command's keys still belong to the region, i.e. no
    /// split or merge was applied since it was proposed, and that the region
    /// isn't fenced for a merge. Membership changes don't affect data, so
    /// only the epoch version is compared.
    fn check_requests(
        store: &Store,
        region: &RegionMeta,
        epoch: Epoch,
        requests: &[Request],
    ) -> Result<std::result::Result<(), RegionError>> {
        if region.is_merging() {
            return Ok(Err(RegionError::EpochNotMatch { current_regions: vec![region.clone()] }));
        }
        let in_range = requests.iter().flat_map(Request::keys).all(|key| region.contains(key));
        if epoch.version == region.epoch.version && in_range {
            return Ok(Ok(()));
        }
        let keys: Vec<&[u8]> = requests.iter().flat_map(Request::keys).collect();
        Ok(Err(RegionError::EpochNotMatch { current_regions: store.current_regions(region, &keys)? }))
    }

    fn apply_admin(
        &self,
        store: &Store,
        region: &RegionMeta,
        admin: AdminCommand,
        index: u64,
    ) -> Result<std::result::Result<Vec<RegionMeta>, RegionError>> {
        match admin {
            AdminCommand::Split { parent_region_id, split_key: _, child } => {
                if parent_region_id != region.id {
                    return Ok(Err(RegionError::RegionNotFound { region_id: parent_region_id }));
                }
                let (parent, child) = store.split_region(parent_region_id, child)?;
                Ok(Ok(vec![parent, child]))
            }
            AdminCommand::PrepareMerge { source_region_id, target_region_id } => {
                if source_region_id != region.id {
                    return Ok(Err(RegionError::RegionNotFound { region_id: source_region_id }));
                }
                let mut source = region.clone();
                source.epoch.version += 1;
                source.state = RegionState::Merging { target: target_region_id, index };
                store.update_region(source.clone(), true)?;
                info!("Fenced {source} for merge into region {target_region_id} at index {index}");
                Ok(Ok(vec![source]))
            }
            AdminCommand::RollbackMerge { source_region_id } => {
                if source_region_id != region.id {
                    return Ok(Err(RegionError::RegionNotFound { region_id: source_region_id }));
                }
                let mut source = region.clone();
                source.epoch.version += 1;
                source.state = RegionState::Running;
                store.update_region(source.clone(), true)?;
                info!("Rolled back merge of {source}");
                Ok(Ok(vec![source]))
            }
            AdminCommand::Merge { target_region_id, source_region_id, source_index } => {
                if target_region_id != region.id {
                    return Ok(Err(RegionError::RegionNotFound { region_id: target_region_id }));
                }
                Ok(store.merge_region(region, source_region_id, source_index)?.map(|target| vec![target]))
            }
        }
    }

    /// Applies a raw record. An empty value deletes the key.
    fn apply_raw(&self, store: &Store, record: RawRecord) -> Result<()> {
        let mut engine = store.inner.engine.lock()?;
        match record.value.is_empty() {
            true => engine.delete_unversioned(&raw_key(&record.key)),
            false => engine.set_unversioned(&raw_key(&record.key), record.value),
        }
    }
}

impl State for Applier {
    fn applied_index(&self) -> Result<u64> {
        let store = self.store()?;
        let mut engine = store.inner.engine.lock()?;
        load_applied(&mut *engine, self.region_id)
    }

    fn apply(&self, region: &RegionMeta, entry: &Entry) -> Result<Option<RegionMeta>> {
        let store = self.store()?;
        let pipeline = &store.inner.pipeline;
        let fenced = || Err(RegionError::EpochNotMatch { current_regions: vec![region.clone()] });
        let mut changed = None;
        // Membership changes have already been applied by the peer.
        if entry.entry_type() == EntryType::EntryNormal {
            match Payload::decode(&entry.data)? {
                // A membership change proposed while another is pending is
                // replaced by an empty entry.
                Payload::Noop => {
                    pipeline.complete_entry(self.region_id, entry.index, entry.term, fenced())?;
                }
                Payload::Raw(_) if region.is_merging() => {
                    pipeline.complete_entry(self.region_id, entry.index, entry.term, fenced())?;
                }
                Payload::Raw(record) => {
                    self.apply_raw(&store, record)?;
                    pipeline.complete_entry(self.region_id, entry.index, entry.term, Ok(vec![]))?;
                }
                Payload::Command(command) => changed = self.apply_command(&store, region, command, entry.index)?,
            }
        }
        // The region may have been merged away or removed while applying.
        if store.region_meta_by_id(self.region_id)?.is_some_and(|r| r.state == RegionState::Tombstone) {
            return Ok(None);
        }
        store.inner.engine.lock()?.set_unversioned(&applied_key(self.region_id), entry.index.to_be_bytes().to_vec())?;
        Ok(changed)
    }

    fn snapshot(&self) -> Result<(u64, Vec<u8>)> {
        let store = self.store()?;
        let Some(region) = store.region_meta_by_id(self.region_id)? else {
            return Err(Error::InvalidData(format!("unknown region {}", self.region_id)));
        };
        let mut engine = store.inner.engine.lock()?;
        let applied_index = load_applied(&mut *engine, self.region_id)?;
        let mut entries = Vec::new();
        for cf in ColumnFamily::ALL {
            let mut scan = engine.scan(cf, region.key_range());
            while let Some((key, version, value)) = scan.next().transpose()? {
                entries.push((cf, ByteBuf::from(key), version, ByteBuf::from(value)));
            }
        }
        let raw = engine
            .scan_unversioned(raw_range(&region))
            .map(|r| r.map(|(key, value)| (ByteBuf::from(key[1..].to_vec()), ByteBuf::from(value))))
            .collect::<Result<Vec<_>>>()?;
        drop(engine);

        debug!("Built snapshot of {region} with {} entries at index {applied_index}", entries.len());
        let snapshot = RegionSnapshot { region, applied_index, entries, raw };
        Ok((applied_index, snapshot.encode()?))
    }

    fn restore(&self, snapshot: &Snapshot) -> Result<RegionMeta> {
        let store = self.store()?;
        let RegionSnapshot { mut region, entries, raw, .. } = RegionSnapshot::decode(&snapshot.data)?;
        let index = snapshot.get_metadata().index;
        {
            let mut engine = store.inner.engine.lock()?;
            for cf in ColumnFamily::ALL {
                engine.delete_range(cf, region.key_range())?;
            }
            let stale: Vec<Vec<u8>> = engine
                .scan_unversioned(raw_range(&region))
                .map(|r| r.map(|(key, _)| key))
                .collect::<Result<_>>()?;
            for key in stale {
                engine.delete_unversioned(&key)?;
            }
            for (cf, key, version, value) in entries {
                engine.set(cf, &key, version, value.into_vec())?;
            }
            for (key, value) in raw {
                engine.set_unversioned(&raw_key(&key), value.into_vec())?;
            }
            engine.set_unversioned(&applied_key(self.region_id), index.to_be_bytes().to_vec())?;
        }
        info!("Restored {region} on peer {} at index {index}", self.peer_id);
        if !region.is_merging() {
            region.state = RegionState::Running;
        }
        store.update_region(region.clone(), true)?;
        Ok(region)
    }
}

/// Executes a request against the transaction engine, within the region.
pub(super) fn execute<E: Engine + ?Sized>(mvcc: &Mvcc<E>, region: &RegionMeta, request: Request) -> Result<Response> {
    let to_vecs = |keys: Vec<ByteBuf>| -> Vec<Vec<u8>> { keys.into_iter().map(ByteBuf::into_vec).collect() };
    Ok(match request {
        Request::Get { key, read_ts } => {
            Response::Get(mvcc.get(&key, read_ts)?.map(|value| value.map(ByteBuf::from)))
        }
        Request::BatchGet { keys, read_ts } => Response::BatchGet(mvcc.batch_get(&to_vecs(keys), read_ts)?),
        Request::Scan { start_key, end_key, limit, read_ts, key_only } => {
            Response::Scan(mvcc.scan(clip_range(region, &start_key, &end_key), limit, read_ts, key_only)?)
        }
        Request::Prewrite { mutations, primary, start_ts, lock_ttl, min_commit_ts } => {
            Response::Prewrite(mvcc.prewrite(&mutations, &primary, start_ts, lock_ttl, min_commit_ts)?)
        }
        Request::Commit { keys, start_ts, commit_ts } => {
            Response::Commit(mvcc.commit(&to_vecs(keys), start_ts, commit_ts)?)
        }
        Request::BatchRollback { keys, start_ts } => {
            Response::BatchRollback(mvcc.batch_rollback(&to_vecs(keys), start_ts)?)
        }
        Request::ResolveLock { keys, start_ts, commit_ts } => {
            Response::ResolveLock(mvcc.resolve_lock(region.key_range(), &to_vecs(keys), start_ts, commit_ts)?)
        }
        Request::CheckTxnStatus { primary, lock_ts, current_ts, caller_start_ts, rollback_if_not_exist } => {
            Response::CheckTxnStatus(mvcc.check_txn_status(
                &primary,
                lock_ts,
                current_ts,
                caller_start_ts,
                rollback_if_not_exist,
            )?)
        }
    })
}

/// Clips a scan range [start, end) to the region, where an empty end is
/// unbounded.
fn clip_range(region: &RegionMeta, start: &[u8], end: &[u8]) -> KeyRange {
    let start = start.max(region.start_key.as_slice());
    let end = match (end.is_empty(), region.end_key.is_empty()) {
        (true, _) => region.end_key.as_slice(),
        (false, true) => end,
        (false, false) => end.min(region.end_key.as_slice()),
    };
    if !end.is_empty() && start >= end {
        return (Bound::Excluded(start.to_vec()), Bound::Excluded(start.to_vec()));
    }
    key_range(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::PeerMeta;

    fn region(start: &[u8], end: &[u8]) -> RegionMeta {
        RegionMeta::new(1, start.to_vec(), end.to_vec(), vec![PeerMeta { store_id: 1, peer_id: 1 }])
    }

    #[test]
    fn clip_ranges() {
        let bounded = region(b"b", b"d");
        assert_eq!(clip_range(&bounded, b"", b""), key_range(b"b", b"d"));
        assert_eq!(clip_range(&bounded, b"c", b"z"), key_range(b"c", b"d"));
        assert_eq!(clip_range(&bounded, b"a", b"c"), key_range(b"b", b"c"));
        let (start, end) = clip_range(&bounded, b"x", b"z");
        assert_eq!(start, end);

        let unbounded = region(b"m", b"");
        assert_eq!(clip_range(&unbounded, b"a", b""), key_range(b"m", b""));
        assert_eq!(clip_range(&unbounded, b"n", b"p"), key_range(b"n", b"p"));
    }

    #[test]
    fn raw_ranges() {
        assert_eq!(raw_range(&region(b"", b"")), (Bound::Included(vec![b'r']), Bound::Excluded(vec![b's'])));
        assert_eq!(
            raw_range(&region(b"a", b"c")),
            (Bound::Included(b"ra".to_vec()), Bound::Excluded(b"rc".to_vec()))
        );
        assert_ne!(applied_key(1)[0], RAW_PREFIX);
    }
}
