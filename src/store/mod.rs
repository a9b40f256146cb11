//! The store: a node hosting the local peers of many regions.
//!
//! The store owns the region catalog (metadata for every region with a local
//! peer, persisted in the manifest), starts and stops peers, routes inbound
//! Raft messages to them, and serves client commands:
//!
//! * Writes (prewrite, commit, etc.) are validated against the catalog
//!   (region, epoch, leadership, key range), proposed through the region's
//!   Raft log, and answered once the local peer applies them. The
//!   CommandPipeline tracks the waiting proposals.
//!
//! * Reads are validated likewise, then served from the local engine after a
//!   read index barrier confirms leadership and waits for the apply to catch
//!   up, without going through the log.
//!
//! Committed entries are applied by an Applier per region, which executes
//! the commands against the MVCC transaction engine. All regions share the
//! store's storage engine, each owning the data in its key range.
//!
//! Admin operations change the region layout: splits and merges are
//! proposed as admin commands through the region's log and applied on every
//! replica, while membership changes use Raft configuration changes. Each
//! bumps the region epoch, so that commands routed with an older layout are
//! rejected.
//!
//! Background loops tick the peers, report heartbeats to the placement
//! service and apply the scheduling operations it plans.
//!
//! LOCKING
//! =======
//!
//! A peer's mutex is held while it applies entries, and the apply path takes
//! the catalog and peer map locks. The catalog and peer map locks must thus
//! never be held while calling into a peer: clone the peer (or region) and
//! release the lock first.

mod admin;
mod apply;
mod catalog;
mod command;
mod config;
mod heartbeat;
mod pipeline;
mod placement;
mod scheduler;

pub use catalog::Catalog;
pub use command::{
    encode_command, encode_raw, AdminCommand, CmdHeader, CmdResult, Payload, RaftCmdRequest, RawRecord,
    RegionError, RegionResult, Request, Response, COMMAND_MARKER,
};
pub use config::Config;
pub use heartbeat::{PlacementObserver, RegionObserver};
pub use pipeline::{CommandPipeline, ProposalKey};
pub use placement::{
    ClusterView, LeaderBalance, LocalPlacement, Placement, Planner, RegionHeartbeat, StoreHeartbeat, Strategy,
    TSO_LOGICAL_BITS,
};
pub use scheduler::{Operation, OperationKind, OperationScheduler};

use crate::error::{Error, Result};
use crate::mvcc::{LatchManager, Mvcc};
use crate::raft::{Manifest, Peer, RaftLogStore, RaftMessage, Transport, INIT_INDEX};
use crate::region::{PeerMeta, RegionId, RegionMeta, RegionState, StoreId};
use crate::storage::Engine;
use crate::{errdata, errinput};

use apply::Applier;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

/// Builds a peer for a region on the store, either bootstrapped with the
/// region's initial state or uninitialized. Injectable, e.g. to observe or
/// fail peer creation in tests.
pub type PeerBuilder = Arc<dyn Fn(&Store, &RegionMeta, PeerMeta, bool) -> Result<Peer> + Send + Sync>;

/// A store. Cheap to clone: clones share the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    engine: Arc<Mutex<dyn Engine>>,
    mvcc: Mvcc<dyn Engine>,
    manifest: Arc<Manifest>,
    catalog: RwLock<Catalog>,
    peers: RwLock<HashMap<RegionId, Arc<Peer>>>,
    pipeline: CommandPipeline,
    transport: Arc<dyn Transport>,
    placement: Arc<dyn Placement>,
    scheduler: OperationScheduler,
    observers: RwLock<Vec<Arc<dyn RegionObserver>>>,
    peer_builder: RwLock<Option<PeerBuilder>>,
    /// Dropped to stop the background threads.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Store {
    /// Opens a store, loading the region catalog from the manifest and
    /// starting the local peers of all live regions. The engine must retain
    /// the data of earlier runs for regions to resume where they left off.
    pub fn open(
        config: Config,
        engine: Arc<Mutex<dyn Engine>>,
        transport: Arc<dyn Transport>,
        placement: Arc<dyn Placement>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let manifest = Arc::new(Manifest::open(&config.manifest_path(), config.sync)?);
        let mut catalog = Catalog::new();
        for region in manifest.regions()? {
            catalog.insert(region);
        }

        let latches = Arc::new(LatchManager::new(config.latch_stripes));
        let scheduler =
            OperationScheduler::new(config.operation_queue, config.operation_burst, config.operation_cooldown());
        let store = Self {
            inner: Arc::new(Inner {
                mvcc: Mvcc::new(engine.clone(), latches),
                engine,
                manifest,
                catalog: RwLock::new(catalog),
                peers: RwLock::new(HashMap::new()),
                pipeline: CommandPipeline::new(),
                transport,
                placement: placement.clone(),
                scheduler,
                observers: RwLock::new(vec![Arc::new(PlacementObserver::new(placement))]),
                peer_builder: RwLock::new(None),
                shutdown_tx: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
                config,
            }),
        };

        let store_id = store.id();
        let regions: Vec<RegionMeta> = store.inner.catalog.read()?.iter().cloned().collect();
        for region in regions {
            if region.state == RegionState::Tombstone {
                continue;
            }
            match region.peer_on_store(store_id).copied() {
                Some(peer) => {
                    store.start_peer(region, peer, false)?;
                }
                None => warn!("Store {store_id} has no peer in {region}, ignoring"),
            }
        }
        info!("Opened store {store_id} with {} regions", store.inner.peers.read()?.len());
        Ok(store)
    }

    /// Returns the store ID.
    pub fn id(&self) -> StoreId {
        self.inner.config.store_id
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the placement service.
    pub fn placement(&self) -> &Arc<dyn Placement> {
        &self.inner.placement
    }

    /// Replaces the peer builder.
    pub fn set_peer_builder(&self, builder: PeerBuilder) -> Result<()> {
        *self.inner.peer_builder.write()? = Some(builder);
        Ok(())
    }

    /// Adds a region observer, notified of all catalog updates.
    pub fn add_observer(&self, observer: Arc<dyn RegionObserver>) -> Result<()> {
        self.inner.observers.write()?.push(observer);
        Ok(())
    }

    /// Bootstraps a new region with a local peer, e.g. the initial region of
    /// a new cluster. Does nothing if the region already exists.
    pub fn bootstrap(&self, region: RegionMeta) -> Result<()> {
        if self.region_meta_by_id(region.id)?.is_some() {
            debug!("Region {} already bootstrapped", region.id);
            return Ok(());
        }
        let Some(peer) = region.peer_on_store(self.id()).copied() else {
            return errinput!("{region} has no peer on store {}", self.id());
        };
        info!("Bootstrapping {region}");
        self.start_peer(region, peer, true)?;
        Ok(())
    }

    /// Builds a peer with the default builder: opens the region's Raft log,
    /// bootstrapping it if requested and still empty.
    pub fn build_peer(&self, region: &RegionMeta, peer: PeerMeta, bootstrap: bool) -> Result<Peer> {
        let config = &self.inner.config;
        let mut log = RaftLogStore::open(
            region.id,
            &config.raft_dir(region.id),
            self.inner.manifest.clone(),
            config.wal_segment_size,
            config.sync,
        )?;
        let applier = Arc::new(Applier::new(region.id, peer.peer_id, Arc::downgrade(&self.inner)));
        if bootstrap && log.is_empty()? {
            log.bootstrap(region.voters())?;
            applier.set_applied_index(INIT_INDEX)?;
        }
        let mut peer = Peer::new(
            self.id(),
            peer.peer_id,
            region.clone(),
            log,
            applier,
            self.inner.transport.clone(),
            &config.raft_options(),
        )?;
        let store = Arc::downgrade(&self.inner);
        peer.set_conf_change_handler(Arc::new(move |event| {
            let inner = store.upgrade().ok_or(Error::Abort)?;
            Store { inner }.on_conf_change(event)
        }));
        Ok(peer)
    }

    /// Starts a local peer for a region. Initialized regions (with peers) are
    /// marked running, unless fenced for a merge, and persisted.
    /// Uninitialized ones are only kept in memory until a snapshot
    /// initializes them.
    pub fn start_peer(&self, mut region: RegionMeta, peer: PeerMeta, bootstrap: bool) -> Result<Arc<Peer>> {
        if peer.store_id != self.id() {
            return errinput!("peer {} belongs to store {}, not {}", peer.peer_id, peer.store_id, self.id());
        }
        if self.inner.peers.read()?.contains_key(&region.id) {
            return errinput!("region {} already has a local peer", region.id);
        }
        let builder = self.inner.peer_builder.read()?.clone();
        let new = match builder {
            Some(builder) => builder(self, &region, peer, bootstrap)?,
            None => self.build_peer(&region, peer, bootstrap)?,
        };
        let new = Arc::new(new);
        if region.peers.is_empty() {
            self.inner.catalog.write()?.insert(region.clone());
        } else {
            if !region.is_merging() {
                region.state = RegionState::Running;
            }
            self.update_region(region.clone(), true)?;
        }
        self.inner.peers.write()?.insert(region.id, new.clone());
        debug!("Started peer {} of {region} on store {}", peer.peer_id, self.id());
        Ok(new)
    }

    /// Stops and removes a local peer. Pending proposals are aborted.
    pub fn stop_peer(&self, region_id: RegionId) -> Result<Option<Arc<Peer>>> {
        let peer = self.inner.peers.write()?.remove(&region_id);
        if let Some(peer) = &peer {
            peer.stop();
            let aborted = self.inner.pipeline.abort_region(region_id)?;
            if aborted > 0 {
                debug!("Aborted {aborted} proposals for region {region_id}");
            }
        }
        Ok(peer)
    }

    /// Replaces a failed peer with a new one recovered from the region's Raft
    /// log. Does nothing if the peer was already replaced or removed.
    fn restart_peer(&self, failed: &Arc<Peer>) -> Result<()> {
        let region_id = failed.region_id();
        {
            let mut peers = self.inner.peers.write()?;
            if !peers.get(&region_id).is_some_and(|current| Arc::ptr_eq(current, failed)) {
                return Ok(());
            }
            peers.remove(&region_id);
        }
        self.inner.pipeline.abort_region(region_id)?;
        let Some(region) = self.region_meta_by_id(region_id)?.filter(|r| r.state != RegionState::Tombstone) else {
            return Ok(());
        };
        warn!("Restarting failed peer {} of {region}", failed.peer_id());
        self.start_peer(region, failed.meta(), false)?;
        Ok(())
    }

    /// Stops a local peer and destroys its Raft log.
    fn destroy_peer(&self, region_id: RegionId) -> Result<()> {
        self.stop_peer(region_id)?;
        RaftLogStore::destroy(region_id, &self.inner.config.raft_dir(region_id), &self.inner.manifest)
    }

    /// Returns a local peer.
    pub fn peer(&self, region_id: RegionId) -> Result<Option<Arc<Peer>>> {
        Ok(self.inner.peers.read()?.get(&region_id).cloned())
    }

    /// Returns all local peers.
    pub fn peers(&self) -> Result<Vec<Arc<Peer>>> {
        Ok(self.inner.peers.read()?.values().cloned().collect())
    }

    /// Returns a region's metadata.
    pub fn region_meta_by_id(&self, region_id: RegionId) -> Result<Option<RegionMeta>> {
        Ok(self.inner.catalog.read()?.get(region_id).cloned())
    }

    /// Returns the region containing the key, if it's hosted here.
    pub fn region_for_key(&self, key: &[u8]) -> Result<Option<RegionMeta>> {
        Ok(self.inner.catalog.read()?.region_for_key(key).cloned())
    }

    /// Returns all regions in the catalog, including tombstones, by ID.
    pub fn regions(&self) -> Result<Vec<RegionMeta>> {
        let mut regions: Vec<RegionMeta> = self.inner.catalog.read()?.iter().cloned().collect();
        regions.sort_by_key(|r| r.id);
        Ok(regions)
    }

    /// Returns the largest region or peer ID in the catalog, e.g. to seed an
    /// ID allocator after a restart.
    pub fn max_id(&self) -> Result<u64> {
        let catalog = self.inner.catalog.read()?;
        let ids = catalog.iter().flat_map(|r| std::iter::once(r.id).chain(r.peers.iter().map(|p| p.peer_id)));
        Ok(ids.max().unwrap_or(0))
    }

    /// Inserts or replaces a region in the catalog, optionally persisting it,
    /// and notifies observers.
    pub fn update_region(&self, region: RegionMeta, persist: bool) -> Result<()> {
        if persist {
            self.inner.manifest.put_region(&region)?;
        }
        self.inner.catalog.write()?.insert(region.clone());
        let observers = self.inner.observers.read()?.clone();
        for observer in observers {
            observer.on_region_changed(&region);
        }
        Ok(())
    }

    /// Removes a region from the catalog and the manifest.
    pub fn remove_region(&self, region_id: RegionId) -> Result<Option<RegionMeta>> {
        self.inner.manifest.remove_region(region_id)?;
        Ok(self.inner.catalog.write()?.remove(region_id))
    }

    /// Updates a region's lifecycle state.
    pub fn update_region_state(&self, region_id: RegionId, state: RegionState) -> Result<()> {
        let Some(mut region) = self.region_meta_by_id(region_id)? else {
            return errinput!("region {region_id} not found");
        };
        region.state = state;
        self.update_region(region, true)
    }

    /// Returns the current metadata of the given region and of the regions
    /// containing the given keys, for EpochNotMatch errors.
    fn current_regions(&self, region: &RegionMeta, keys: &[&[u8]]) -> Result<Vec<RegionMeta>> {
        let catalog = self.inner.catalog.read()?;
        let mut regions = vec![catalog.get(region.id).cloned().unwrap_or_else(|| region.clone())];
        for key in keys {
            if let Some(other) = catalog.region_for_key(key) {
                if !regions.iter().any(|r| r.id == other.id) {
                    regions.push(other.clone());
                }
            }
        }
        Ok(regions)
    }

    /// Steps an inbound Raft message. Messages for unknown regions create an
    /// uninitialized peer, which waits for a snapshot from the leader.
    /// Messages for removed peers are dropped.
    pub fn step(&self, message: RaftMessage) -> Result<()> {
        let (region_id, to) = (message.region_id, message.to_peer);
        if to.store_id != self.id() {
            debug!("Dropping message for store {} on store {}", to.store_id, self.id());
            return Ok(());
        }
        let peer = match self.peer(region_id)? {
            Some(peer) if peer.peer_id() == to.peer_id => peer,
            Some(peer) => {
                debug!("Dropping message for peer {} of region {region_id}, local peer {}", to.peer_id, peer.peer_id());
                return Ok(());
            }
            None => {
                if let Some(region) = self.region_meta_by_id(region_id)? {
                    // A newer membership may re-add the store to the region.
                    let readded = message.region_epoch.conf_ver > region.epoch.conf_ver;
                    if region.state != RegionState::Tombstone || !readded {
                        debug!("Dropping message for {:?} {region}", region.state);
                        return Ok(());
                    }
                    self.remove_region(region_id)?;
                }
                info!("Creating uninitialized peer {} for region {region_id}", to.peer_id);
                match self.start_peer(RegionMeta::new(region_id, vec![], vec![], vec![]), to, false) {
                    Ok(peer) => peer,
                    // Raced with another message for the region.
                    Err(Error::InvalidInput(_)) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        };
        match peer.step(message) {
            Ok(()) | Err(Error::Abort) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Ticks all local peers. Failures are logged.
    pub fn tick(&self) -> Result<()> {
        self.tick_shard(0, 1)
    }

    /// Ticks the local peers of the given shard, i.e. the regions whose ID
    /// modulo shards is shard. Failed peers are restarted instead. Failures
    /// are logged.
    pub fn tick_shard(&self, shard: usize, shards: usize) -> Result<()> {
        for peer in self.peers()? {
            if shard_of(peer.region_id(), shards) != shard {
                continue;
            }
            if peer.is_failed() {
                if let Err(err) = self.restart_peer(&peer) {
                    error!("Failed restarting peer {} of region {}: {err}", peer.peer_id(), peer.region_id());
                }
                continue;
            }
            match peer.tick() {
                Ok(()) | Err(Error::Abort) => {}
                Err(err) => error!("Failed ticking peer {} of region {}: {err}", peer.peer_id(), peer.region_id()),
            }
        }
        Ok(())
    }

    /// Validates a command against the catalog: the region must be hosted
    /// and running here (or fenced for a merge, for a merge rollback), the
    /// epoch must match exactly, the local peer must be the leader, and all
    /// keys must be in the region. Returns the region and peer.
    fn check_command(&self, command: &RaftCmdRequest) -> Result<RegionResult<(RegionMeta, Arc<Peer>)>> {
        let region_id = command.header.region_id;
        let rollback = matches!(command.admin, Some(AdminCommand::RollbackMerge { .. }));
        let region = self
            .inner
            .catalog
            .read()?
            .get(region_id)
            .filter(|r| r.state == RegionState::Running || (rollback && r.is_merging()))
            .cloned();
        let (Some(region), Some(peer)) = (region, self.peer(region_id)?) else {
            return Ok(Err(RegionError::RegionNotFound { region_id }));
        };
        let keys = command.keys();
        if command.header.region_epoch != region.epoch {
            return Ok(Err(RegionError::EpochNotMatch { current_regions: self.current_regions(&region, &keys)? }));
        }
        if !peer.is_leader()? {
            return Ok(Err(RegionError::NotLeader { region_id, leader: peer.leader()? }));
        }
        if !keys.iter().all(|key| region.contains(key)) {
            return Ok(Err(RegionError::EpochNotMatch { current_regions: self.current_regions(&region, &keys)? }));
        }
        Ok(Ok((region, peer)))
    }

    /// Proposes a command through the region's Raft log, waiting for it to
    /// apply. Returns Error::Timeout if it doesn't apply within the proposal
    /// timeout, in which case it may or may not apply later.
    pub fn propose_command(&self, mut command: RaftCmdRequest) -> Result<CmdResult> {
        let peer = match self.check_command(&command)? {
            Ok((_, peer)) => peer,
            Err(err) => return Ok(Err(err)),
        };
        let pipeline = &self.inner.pipeline;
        let (request_id, rx) = pipeline.register(command.header.region_id)?;
        command.header.peer_id = peer.peer_id();
        command.header.request_id = request_id;
        command.header.incarnation = pipeline.incarnation();
        let key = ProposalKey::Request(request_id);
        let proposed = encode_command(&command).and_then(|data| peer.propose(data));
        if let Err(err) = proposed {
            pipeline.cancel(key)?;
            return Err(err);
        }
        pipeline.wait(key, rx, self.inner.config.proposal_timeout())
    }

    /// Waits for a headerless entry proposed via Peer::propose_entry() or
    /// Peer::propose_conf_change_entry(), registered at its log position.
    fn wait_entry(
        &self,
        peer: &Peer,
        proposed: Result<bool>,
        registered: Option<(u64, Receiver<CmdResult>)>,
    ) -> Result<CmdResult> {
        let pipeline = &self.inner.pipeline;
        let region_id = peer.region_id();
        let key = |index| ProposalKey::Entry { region_id, index };
        match proposed {
            Ok(true) => {}
            Ok(false) => return Ok(Err(RegionError::NotLeader { region_id, leader: peer.leader()? })),
            Err(err) => {
                if let Some((index, _)) = registered {
                    pipeline.cancel(key(index))?;
                }
                return Err(err);
            }
        }
        let Some((index, rx)) = registered else {
            return errdata!("proposal for region {region_id} was not registered");
        };
        pipeline.wait(key(index), rx, self.inner.config.proposal_timeout())
    }

    /// Executes read requests at the region leader, after a read index
    /// barrier. Scans are clipped to the region.
    pub fn read_command(&self, command: RaftCmdRequest) -> Result<CmdResult> {
        if command.admin.is_some() || !command.requests.iter().all(Request::is_read) {
            return errinput!("read commands can only contain reads");
        }
        let (_, peer) = match self.check_command(&command)? {
            Ok(checked) => checked,
            Err(err) => return Ok(Err(err)),
        };
        let rx = peer.read_index()?;
        match rx.recv_timeout(self.inner.config.read_timeout()) {
            Ok(index) => debug!("Read index {} for region {}", index?, peer.region_id()),
            Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
            // The waiter is dropped when leadership changes.
            Err(RecvTimeoutError::Disconnected) => {
                return Ok(Err(RegionError::NotLeader { region_id: peer.region_id(), leader: peer.leader()? }))
            }
        }

        // The region may have changed while waiting.
        let region = peer.region()?;
        if command.header.region_epoch.version != region.epoch.version {
            let keys = command.keys();
            return Ok(Err(RegionError::EpochNotMatch { current_regions: self.current_regions(&region, &keys)? }));
        }
        let responses = command
            .requests
            .into_iter()
            .map(|request| apply::execute(&self.inner.mvcc, &region, request))
            .collect::<Result<_>>()?;
        Ok(Ok(responses))
    }

    /// Proposes a raw record through the region containing its key. Returns
    /// once it has been applied locally.
    pub fn propose_raw(&self, record: RawRecord) -> Result<RegionResult<()>> {
        let Some(region) = self.region_for_key(&record.key)? else {
            return Ok(Err(RegionError::RegionNotFound { region_id: 0 }));
        };
        let Some(peer) = self.peer(region.id)? else {
            return Ok(Err(RegionError::RegionNotFound { region_id: region.id }));
        };
        let data = encode_raw(&record)?;
        let mut registered = None;
        let proposed = peer.propose_entry(data, |index, term| {
            registered = Some((index, self.inner.pipeline.register_entry(region.id, index, term)?));
            Ok(())
        });
        Ok(self.wait_entry(&peer, proposed, registered)?.map(|_| ()))
    }

    /// Reads a raw record from the local engine.
    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.engine.lock()?.get_unversioned(&apply::raw_key(key))
    }

    /// Returns the number of pending proposals.
    pub fn pending_proposals(&self) -> Result<usize> {
        self.inner.pipeline.len()
    }

    /// Returns the storage engine status.
    pub fn engine_status(&self) -> Result<crate::storage::Status> {
        self.inner.engine.lock()?.status()
    }

    /// Returns an error if the store has no running peer for the region.
    fn local_peer(&self, region_id: RegionId) -> Result<Arc<Peer>> {
        match self.peer(region_id)? {
            Some(peer) => Ok(peer),
            None => errdata!("no local peer for region {region_id}"),
        }
    }
}

/// Returns the worker shard of a region.
fn shard_of(region_id: RegionId, shards: usize) -> usize {
    (region_id % shards.max(1) as u64) as usize
}
