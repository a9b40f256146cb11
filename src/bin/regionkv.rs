//! The regionkv server. Opens a store, bootstraps the cluster's initial
//! region on first start, and serves Raft traffic from other stores and
//! client requests over TCP.

#![warn(clippy::all)]

use clap::Parser as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use regionkv::error::Result;
use regionkv::raft::{RaftMessage, TcpTransport};
use regionkv::region::{PeerMeta, RegionMeta, StoreId};
use regionkv::storage::Memory;
use regionkv::store::{self, LeaderBalance, LocalPlacement, Store};
use regionkv::{errinput, Server};

/// The ID of the initial region, spanning the entire key space.
const INITIAL_REGION_ID: u64 = 1;

/// The default Raft port, used for store addresses without a port.
const DEFAULT_RAFT_PORT: u16 = 9705;

fn main() {
    if let Err(error) = Command::parse().run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

/// Starts a regionkv server.
#[derive(clap::Parser)]
#[command(about = "Starts a regionkv server.", version, propagate_version = true)]
struct Command {
    /// The configuration file path.
    #[arg(short = 'c', long, default_value = "config/regionkv.yaml")]
    config: String,
}

impl Command {
    fn run(self) -> Result<()> {
        let cfg = Config::load(&self.config)?;

        let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
        let mut logconfig = simplelog::ConfigBuilder::new();
        if loglevel != simplelog::LevelFilter::Debug {
            logconfig.add_filter_allow_str("regionkv");
        }
        simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

        let peers = cfg.parse_peers()?;
        let store_config = store::Config { store_id: cfg.id, data_dir: cfg.data_dir.clone().into(), ..cfg.store };

        // The engine is in-memory, so a restarted store recovers its
        // regions from their Raft logs.
        let engine = Arc::new(Mutex::new(Memory::new()));
        let transport = Arc::new(TcpTransport::new(peers.clone()));
        let placement = Arc::new(LocalPlacement::new(cfg.id).with_strategy(Arc::new(LeaderBalance::default())));
        let store = Store::open(store_config, engine, transport, placement.clone())?;
        placement.observe_id(store.max_id()?);

        // Every store bootstraps the same initial region, with a peer per
        // store using the store ID as peer ID.
        if store.regions()?.is_empty() {
            let mut store_ids: Vec<StoreId> = peers.keys().copied().chain(std::iter::once(cfg.id)).collect();
            store_ids.sort_unstable();
            let replicas = store_ids.into_iter().map(|id| PeerMeta { store_id: id, peer_id: id }).collect();
            store.bootstrap(RegionMeta::new(INITIAL_REGION_ID, Vec::new(), Vec::new(), replicas))?;
        }

        let (inbound_tx, inbound_rx) = crossbeam::channel::unbounded::<RaftMessage>();
        TcpTransport::listen(TcpListener::bind(&cfg.listen_raft)?, inbound_tx);
        store.start(inbound_rx)?;

        Server::new(store).serve(TcpListener::bind(&cfg.listen)?)
    }
}

/// The server configuration.
#[derive(Debug, Deserialize)]
struct Config {
    /// The store ID.
    id: StoreId,
    /// The client listen address.
    listen: String,
    /// The Raft listen address.
    listen_raft: String,
    /// The log level.
    log_level: String,
    /// The data directory.
    data_dir: String,
    /// The Raft addresses of the other stores, by store ID.
    #[serde(default)]
    peers: HashMap<String, String>,
    /// Store tuning. The store ID and data dir are taken from above.
    #[serde(default)]
    store: store::Config,
}

impl Config {
    fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", 1)?
            .set_default("listen", "0.0.0.0:9605")?
            .set_default("listen_raft", format!("0.0.0.0:{DEFAULT_RAFT_PORT}"))?
            .set_default("log_level", "info")?
            .set_default("data_dir", "data")?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("REGIONKV"))
            .build()?
            .try_deserialize()?)
    }

    /// Parses the peer store IDs and addresses, adding the default Raft
    /// port where missing.
    fn parse_peers(&self) -> Result<HashMap<StoreId, String>> {
        let mut peers = HashMap::new();
        for (id, address) in &self.peers {
            let Ok(id) = id.parse::<StoreId>() else {
                return errinput!("invalid store ID {id}");
            };
            if id == self.id {
                return errinput!("store {id} can't be its own peer");
            }
            let address = match address.parse::<std::net::SocketAddr>() {
                Ok(addr) => addr,
                Err(_) => std::net::SocketAddr::new(address.parse::<std::net::IpAddr>()?, DEFAULT_RAFT_PORT),
            };
            peers.insert(id, address.to_string());
        }
        Ok(peers)
    }
}
