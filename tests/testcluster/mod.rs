use regionkv::error::Result;
use regionkv::raft::{LocalTransport, Peer};
use regionkv::region::{PeerMeta, RegionId, RegionMeta, StoreId};
use regionkv::storage::{Engine, Memory};
use regionkv::store::{Config, LocalPlacement, Placement, Store};
use regionkv::{Client, Server};

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// An in-process test cluster. Stores are connected by a local transport
/// and share a placement service, and each serves clients on a local TCP
/// port. Region 1 spans the key space and is replicated across all stores,
/// with peer IDs equal to store IDs.
pub struct TestCluster {
    dir: tempfile::TempDir,
    transport: LocalTransport,
    placement: Arc<LocalPlacement>,
    engines: HashMap<StoreId, Arc<Mutex<Memory>>>,
    stores: HashMap<StoreId, Store>,
    addrs: HashMap<StoreId, String>,
}

impl TestCluster {
    /// Starts a cluster with the given stores, and elects store 1's peer as
    /// the leader of region 1.
    pub fn run(store_ids: &[StoreId]) -> Result<Self> {
        let mut cluster = Self {
            dir: tempfile::tempdir()?,
            transport: LocalTransport::new(),
            placement: Arc::new(LocalPlacement::new(0)),
            engines: HashMap::new(),
            stores: HashMap::new(),
            addrs: HashMap::new(),
        };
        cluster.placement.observe_id(1000);
        let peers = store_ids.iter().map(|id| PeerMeta { store_id: *id, peer_id: *id }).collect();
        let region = RegionMeta::new(1, Vec::new(), Vec::new(), peers);
        for id in store_ids {
            cluster.engines.insert(*id, Arc::new(Mutex::new(Memory::new())));
            cluster.open(*id)?.bootstrap(region.clone())?;
        }
        cluster.elect(store_ids[0], 1)?;
        Ok(cluster)
    }

    /// Opens (or reopens) a store with its existing engine, starts it, and
    /// serves clients on a new port.
    pub fn open(&mut self, id: StoreId) -> Result<Store> {
        let config = Config {
            store_id: id,
            data_dir: self.dir.path().join(format!("store{id}")),
            tick_interval_ms: 10,
            heartbeat_interval_ms: 50,
            proposal_timeout_ms: 5000,
            read_timeout_ms: 5000,
            sync: false,
            ..Config::default()
        };
        let inbound = self.transport.register(id)?;
        let engine: Arc<Mutex<dyn Engine>> = self.engines[&id].clone();
        let placement: Arc<dyn Placement> = self.placement.clone();
        let store = Store::open(config, engine, Arc::new(self.transport.clone()), placement)?;
        store.start(inbound)?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        self.addrs.insert(id, listener.local_addr()?.to_string());
        let server = Server::new(store.clone());
        std::thread::spawn(move || server.serve(listener));

        self.stores.insert(id, store.clone());
        Ok(store)
    }

    /// Shuts down a store and disconnects it.
    pub fn stop(&mut self, id: StoreId) -> Result<()> {
        if let Some(store) = self.stores.remove(&id) {
            store.shutdown()?;
        }
        self.addrs.remove(&id);
        self.transport.deregister(id)
    }

    /// Stops and reopens a store.
    pub fn restart(&mut self, id: StoreId) -> Result<Store> {
        self.stop(id)?;
        self.open(id)
    }

    pub fn store(&self, id: StoreId) -> &Store {
        &self.stores[&id]
    }

    pub fn transport(&self) -> &LocalTransport {
        &self.transport
    }

    /// Returns a client connected to all running stores.
    pub fn client(&self) -> Result<Client> {
        Client::new(self.addrs.clone())
    }

    /// Campaigns a store's peer of the region, and waits for it to lead.
    pub fn elect(&self, store_id: StoreId, region_id: RegionId) -> Result<Arc<Peer>> {
        let peer = self.store(store_id).peer(region_id)?.expect("no peer");
        peer.campaign()?;
        wait_for(|| peer.is_leader())?;
        Ok(peer)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for store in self.stores.values() {
            store.shutdown().ok();
        }
    }
}

/// Waits up to 10 seconds for the condition to hold.
pub fn wait_for(condition: impl Fn() -> Result<bool>) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition()? {
        assert!(Instant::now() < deadline, "condition not met within deadline");
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}
