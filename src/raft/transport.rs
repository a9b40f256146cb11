use crate::encoding::{self, protobuf, Value as _};
use crate::error::{Error, Result};
use crate::region::{Epoch, PeerMeta, RegionId, StoreId};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error};
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A Raft message between two peers of a region, with the routing metadata
/// needed to deliver it to the right store and peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMessage {
    pub region_id: RegionId,
    pub from_peer: PeerMeta,
    pub to_peer: PeerMeta,
    /// The sender's region epoch.
    pub region_epoch: Epoch,
    #[serde(with = "protobuf")]
    pub message: Message,
}

impl encoding::Value for RaftMessage {}

/// Delivers Raft messages to other stores. Sending is asynchronous and
/// best-effort: Raft handles message loss. An error means the target is
/// known to be unreachable. Inbound messages are delivered through a channel
/// handed out by the concrete transport.
pub trait Transport: Send + Sync {
    /// Sends a message to the store of message.to_peer.
    fn send(&self, message: RaftMessage) -> Result<()>;
}

/// An in-process transport connecting stores in the same process, for tests
/// and single-process clusters. Links between stores can be cut to simulate
/// network partitions.
#[derive(Clone, Default)]
pub struct LocalTransport {
    inner: Arc<RwLock<LocalInner>>,
}

#[derive(Default)]
struct LocalInner {
    stores: HashMap<StoreId, Sender<RaftMessage>>,
    /// Cut links, as (from, to) store pairs.
    cut: HashSet<(StoreId, StoreId)>,
}

impl LocalTransport {
    /// Creates a new local transport with no stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a store, returning its inbound message channel.
    pub fn register(&self, store_id: StoreId) -> Result<Receiver<RaftMessage>> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.inner.write()?.stores.insert(store_id, tx);
        Ok(rx)
    }

    /// Removes a store, dropping its inbound channel.
    pub fn deregister(&self, store_id: StoreId) -> Result<()> {
        self.inner.write()?.stores.remove(&store_id);
        Ok(())
    }

    /// Cuts all links to and from the given store.
    pub fn isolate(&self, store_id: StoreId) -> Result<()> {
        let mut inner = self.inner.write()?;
        let others: Vec<StoreId> = inner.stores.keys().copied().filter(|id| *id != store_id).collect();
        for other in others {
            inner.cut.insert((store_id, other));
            inner.cut.insert((other, store_id));
        }
        Ok(())
    }

    /// Cuts the link between two stores, in both directions.
    pub fn partition(&self, a: StoreId, b: StoreId) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner.cut.insert((a, b));
        inner.cut.insert((b, a));
        Ok(())
    }

    /// Restores all links.
    pub fn heal(&self) -> Result<()> {
        self.inner.write()?.cut.clear();
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn send(&self, message: RaftMessage) -> Result<()> {
        let inner = self.inner.read()?;
        let (from, to) = (message.from_peer.store_id, message.to_peer.store_id);
        if inner.cut.contains(&(from, to)) {
            return Err(Error::IO(format!("store {to} unreachable from store {from}")));
        }
        match inner.stores.get(&to) {
            Some(tx) => Ok(tx.send(message)?),
            None => Err(Error::IO(format!("unknown store {to}"))),
        }
    }
}

/// A TCP transport. Messages are sent as bincode frames over one long-lived
/// connection per remote store, each served by a sender thread that
/// reconnects on failure.
pub struct TcpTransport {
    peers: HashMap<StoreId, Sender<RaftMessage>>,
}

impl TcpTransport {
    /// The per-store send buffer. Messages are dropped when it is full.
    const BUFFER: usize = 1000;

    /// The delay between reconnection attempts.
    const RECONNECT_DELAY: Duration = Duration::from_millis(1000);

    /// Creates a transport sending to the given store addresses, spawning a
    /// sender thread for each.
    pub fn new(peers: HashMap<StoreId, String>) -> Self {
        let peers = peers
            .into_iter()
            .map(|(id, addr)| {
                let (tx, rx) = crossbeam::channel::bounded(Self::BUFFER);
                std::thread::spawn(move || Self::send_peer(addr, rx));
                (id, tx)
            })
            .collect();
        Self { peers }
    }

    /// Accepts inbound connections from other stores, delivering their
    /// messages to the given channel. Spawns a thread and returns.
    pub fn listen(listener: TcpListener, inbound: Sender<RaftMessage>) {
        std::thread::spawn(move || loop {
            let (socket, peer) = match listener.accept() {
                Ok(r) => r,
                Err(err) => {
                    error!("Raft connection failed: {err}");
                    continue;
                }
            };
            let inbound = inbound.clone();
            std::thread::spawn(move || {
                debug!("Raft peer {peer} connected");
                match Self::receive_peer(socket, inbound) {
                    Ok(()) => debug!("Raft peer {peer} disconnected"),
                    Err(err) => error!("Raft peer {peer} error: {err}"),
                }
            });
        });
    }

    /// Receives inbound messages from a peer connection.
    fn receive_peer(socket: TcpStream, inbound: Sender<RaftMessage>) -> Result<()> {
        let mut reader = std::io::BufReader::new(socket);
        while let Some(message) = RaftMessage::maybe_decode_from(&mut reader)? {
            inbound.send(message)?;
        }
        Ok(())
    }

    /// Sends outbound messages to a peer, continuously reconnecting.
    fn send_peer(addr: String, rx: Receiver<RaftMessage>) {
        loop {
            match TcpStream::connect(&addr) {
                Ok(socket) => {
                    debug!("Connected to store {addr}");
                    match Self::send_peer_session(socket, &rx) {
                        Ok(()) => break,
                        Err(err) => error!("Failed sending to store {addr}: {err}"),
                    }
                }
                Err(err) => debug!("Failed connecting to store {addr}: {err}"),
            }
            std::thread::sleep(Self::RECONNECT_DELAY);
        }
        debug!("Disconnected from store {addr}");
    }

    /// Sends outbound messages on a connection, until the channel closes.
    fn send_peer_session(socket: TcpStream, rx: &Receiver<RaftMessage>) -> Result<()> {
        let mut writer = std::io::BufWriter::new(socket);
        while let Ok(message) = rx.recv() {
            message.encode_into(&mut writer)?;
            // Batch up any queued messages before flushing.
            while let Ok(message) = rx.try_recv() {
                message.encode_into(&mut writer)?;
            }
            std::io::Write::flush(&mut writer)?;
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn send(&self, message: RaftMessage) -> Result<()> {
        let to = message.to_peer.store_id;
        let Some(tx) = self.peers.get(&to) else {
            return Err(Error::IO(format!("unknown store {to}")));
        };
        tx.try_send(message).map_err(|err| {
            error!("Full send buffer for store {to}, discarding message");
            Error::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::MessageType;

    fn message(from: StoreId, to: StoreId) -> RaftMessage {
        let mut message = Message::default();
        message.set_msg_type(MessageType::MsgHeartbeat);
        message.from = from;
        message.to = to;
        message.term = 3;
        RaftMessage {
            region_id: 1,
            from_peer: PeerMeta { store_id: from, peer_id: from },
            to_peer: PeerMeta { store_id: to, peer_id: to },
            region_epoch: Epoch { version: 1, conf_ver: 1 },
            message,
        }
    }

    #[test]
    fn local_delivery_and_partitions() -> Result<()> {
        let transport = LocalTransport::new();
        let rx1 = transport.register(1)?;
        let rx2 = transport.register(2)?;
        let _rx3 = transport.register(3)?;

        transport.send(message(1, 2))?;
        assert_eq!(rx2.try_recv()?, message(1, 2));
        assert!(transport.send(message(1, 9)).is_err());

        transport.isolate(1)?;
        assert!(transport.send(message(1, 2)).is_err());
        assert!(transport.send(message(2, 1)).is_err());
        transport.send(message(2, 3))?;

        transport.heal()?;
        transport.partition(2, 3)?;
        transport.send(message(2, 1))?;
        assert_eq!(rx1.try_recv()?, message(2, 1));
        assert!(transport.send(message(3, 2)).is_err());
        Ok(())
    }

    #[test]
    fn raft_message_encoding() -> Result<()> {
        let message = message(1, 2);
        assert_eq!(RaftMessage::decode(&message.encode()?)?, message);
        Ok(())
    }

    #[test]
    fn tcp_delivery() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();
        let (tx, rx) = crossbeam::channel::unbounded();
        TcpTransport::listen(listener, tx);

        let transport = TcpTransport::new(HashMap::from([(2, addr)]));
        transport.send(message(1, 2))?;
        transport.send(message(1, 2))?;
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, message(1, 2));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, message(1, 2));
        assert!(transport.send(message(1, 3)).is_err());
        Ok(())
    }
}
