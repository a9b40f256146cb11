use super::placement::{Placement, RegionHeartbeat, StoreHeartbeat};
use super::scheduler::Operation;
use super::{shard_of, Store};
use crate::errinput;
use crate::error::Result;
use crate::raft::RaftMessage;
use crate::region::RegionMeta;

use crossbeam::channel::{Receiver, RecvError};
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Observes region metadata changes in the store catalog. Called
/// synchronously on every update, possibly from a peer's apply path, so it
/// must not call back into peers.
pub trait RegionObserver: Send + Sync {
    fn on_region_changed(&self, region: &RegionMeta);
}

/// Reports region metadata changes to the placement service, without
/// leadership information. Leaders report their leadership in periodic
/// heartbeats.
pub struct PlacementObserver {
    placement: Arc<dyn Placement>,
}

impl PlacementObserver {
    pub fn new(placement: Arc<dyn Placement>) -> Self {
        Self { placement }
    }
}

impl RegionObserver for PlacementObserver {
    fn on_region_changed(&self, region: &RegionMeta) {
        // Uninitialized regions have nothing to report.
        if region.peers.is_empty() {
            return;
        }
        let heartbeat = RegionHeartbeat { region: region.clone(), leader: None, term: 0, applied_index: 0 };
        if let Err(err) = self.placement.region_heartbeat(heartbeat) {
            error!("Failed to report {region} to placement: {err}");
        }
    }
}

impl Store {
    /// Reports region heartbeats for led regions and a store heartbeat to the
    /// placement service, and queues the operations it plans for the store.
    pub fn heartbeat(&self) -> Result<()> {
        let placement = self.placement().clone();
        let peers = self.peers()?;
        let mut leader_count = 0;
        for peer in &peers {
            let status = peer.status()?;
            if !status.is_leader {
                continue;
            }
            let region = peer.region()?;
            if region.peers.is_empty() {
                continue;
            }
            leader_count += 1;
            placement.region_heartbeat(RegionHeartbeat {
                region,
                leader: Some(peer.meta()),
                term: status.term,
                applied_index: status.applied_index,
            })?;
        }
        placement.store_heartbeat(StoreHeartbeat {
            store_id: self.id(),
            region_count: peers.len(),
            leader_count,
            pending_proposals: self.pending_proposals()?,
        })?;

        let Some(planner) = placement.planner() else {
            return Ok(());
        };
        for operation in planner.plan(self.id())? {
            if !self.inner.scheduler.submit(operation.clone())? {
                debug!("Dropped operation {operation:?}");
            }
        }
        Ok(())
    }

    /// Applies queued scheduling operations, up to the configured burst.
    /// Returns the number of operations applied.
    pub fn run_operations(&self) -> Result<usize> {
        self.inner.scheduler.run(|operation| self.apply_operation(operation))
    }

    /// Submits a scheduling operation, e.g. from an operator. Returns false
    /// if it was dropped.
    pub fn submit_operation(&self, operation: Operation) -> Result<bool> {
        self.inner.scheduler.submit(operation)
    }

    fn apply_operation(&self, operation: &Operation) -> Result<()> {
        match operation {
            Operation::TransferLeader { region_id, source, target } => {
                let Some(peer) = self.peer(*region_id)? else {
                    return errinput!("region {region_id} not found");
                };
                // The plan may be outdated by the time it's applied.
                if peer.peer_id() != *source || !peer.is_leader()? {
                    debug!("Skipping {operation:?}, peer {} is no longer leader", peer.peer_id());
                    return Ok(());
                }
                match self.transfer_leader(*region_id, target.peer_id)? {
                    Ok(()) => Ok(()),
                    Err(err) => errinput!("{err}"),
                }
            }
        }
    }

    /// Starts the background threads, which run until shutdown():
    ///
    /// * Raft workers, each ticking the peers of its shard of regions and
    ///   stepping their inbound messages. Regions are sharded by ID, so a
    ///   slow region only holds up the regions sharing its worker.
    /// * A dispatcher routing inbound messages to the workers.
    /// * The heartbeat loop and the operation loop.
    pub fn start(&self, inbound: Receiver<RaftMessage>) -> Result<()> {
        let mut shutdown_tx = self.inner.shutdown_tx.lock()?;
        if shutdown_tx.is_some() {
            return errinput!("store {} already started", self.id());
        }
        let (tx, shutdown_rx) = crossbeam::channel::bounded::<()>(0);
        *shutdown_tx = Some(tx);

        let config = self.config();
        let mut threads = self.inner.threads.lock()?;

        let workers = config.raft_workers;
        let mut worker_txs = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (worker_tx, worker_rx) = crossbeam::channel::unbounded::<RaftMessage>();
            worker_txs.push(worker_tx);
            let (store, shutdown) = (self.clone(), shutdown_rx.clone());
            let ticker = crossbeam::channel::tick(config.tick_interval());
            threads.push(std::thread::spawn(move || loop {
                crossbeam::select! {
                    recv(shutdown) -> _ => return,
                    recv(ticker) -> _ => {
                        if let Err(err) = store.tick_shard(shard, workers) {
                            error!("Tick of shard {shard} failed: {err}");
                        }
                    }
                    recv(worker_rx) -> message => match message {
                        Ok(message) => {
                            if let Err(err) = store.step(message) {
                                warn!("Failed to step message: {err}");
                            }
                        }
                        Err(RecvError) => return,
                    },
                }
            }));
        }

        let shutdown = shutdown_rx.clone();
        threads.push(std::thread::spawn(move || loop {
            crossbeam::select! {
                recv(shutdown) -> _ => return,
                recv(inbound) -> message => match message {
                    Ok(message) => {
                        let shard = shard_of(message.region_id, workers);
                        if worker_txs[shard].send(message).is_err() {
                            return;
                        }
                    }
                    Err(RecvError) => return,
                },
            }
        }));

        let (store, shutdown) = (self.clone(), shutdown_rx.clone());
        let ticker = crossbeam::channel::tick(config.heartbeat_interval());
        threads.push(std::thread::spawn(move || loop {
            crossbeam::select! {
                recv(shutdown) -> _ => return,
                recv(ticker) -> _ => {
                    if let Err(err) = store.heartbeat() {
                        error!("Heartbeat failed: {err}");
                    }
                }
            }
        }));

        let (store, shutdown) = (self.clone(), shutdown_rx);
        let ticker = crossbeam::channel::tick(config.heartbeat_interval());
        threads.push(std::thread::spawn(move || loop {
            crossbeam::select! {
                recv(shutdown) -> _ => return,
                recv(ticker) -> _ => match store.run_operations() {
                    Ok(0) => {}
                    Ok(n) => debug!("Applied {n} scheduled operations"),
                    Err(err) => error!("Operations failed: {err}"),
                },
            }
        }));
        info!("Started store {} with {workers} raft workers", self.id());
        Ok(())
    }

    /// Stops the background threads and all local peers.
    pub fn shutdown(&self) -> Result<()> {
        // Dropping the sender disconnects the shutdown channel.
        drop(self.inner.shutdown_tx.lock()?.take());
        let threads: Vec<_> = self.inner.threads.lock()?.drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                error!("Store thread panicked");
            }
        }
        let region_ids: Vec<_> = self.peers()?.iter().map(|p| p.region_id()).collect();
        for region_id in region_ids {
            self.stop_peer(region_id)?;
        }
        info!("Shut down store {}", self.id());
        Ok(())
    }
}
