//! The client-facing service: the transactional KV RPCs and the admin and
//! routing requests served alongside them. Each KV response carries an
//! optional region error, which takes precedence over the payload: the
//! client must refresh its routing information and retry.

use crate::encoding;
use crate::errdata;
use crate::error::Result;
use crate::mvcc::{KeyError, KeyResult, KvPair, Mutation, TxnStatus};
use crate::region::{Epoch, PeerId, PeerMeta, RegionId, RegionMeta, StoreId};
use crate::storage;
use crate::store::{RaftCmdRequest, RawRecord, RegionError, RegionResult, Request as Command, Response as Reply, Store};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// The routing context of a KV request: the region the client believes
/// holds the keys, and the epoch it knows it at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub region_id: RegionId,
    pub region_epoch: Epoch,
}

impl Context {
    pub fn new(region: &RegionMeta) -> Self {
        Self { region_id: region.id, region_epoch: region.epoch }
    }
}

/// A KV response. If region_error is set, the payload is empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KvResponse<T> {
    pub region_error: Option<RegionError>,
    pub payload: Option<T>,
}

impl<T> KvResponse<T> {
    fn from_result(result: RegionResult<T>) -> Self {
        match result {
            Ok(payload) => Self { region_error: None, payload: Some(payload) },
            Err(err) => Self { region_error: Some(err), payload: None },
        }
    }

    /// Converts the response into a result, with the region error taking
    /// precedence.
    pub fn into_result(self) -> Result<RegionResult<T>> {
        match (self.region_error, self.payload) {
            (Some(err), _) => Ok(Err(err)),
            (None, Some(payload)) => Ok(Ok(payload)),
            (None, None) => errdata!("response has neither payload nor region error"),
        }
    }
}

/// A region's status on a store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionStatus {
    pub region: RegionMeta,
    pub is_leader: bool,
    pub leader: Option<PeerMeta>,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
}

/// A store's status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub store_id: StoreId,
    pub regions: Vec<RegionStatus>,
    pub pending_proposals: usize,
    pub engine: storage::Status,
}

/// A region and its known leader, for client routing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub region: RegionMeta,
    pub leader: Option<PeerMeta>,
}

/// A client protocol request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    KvGet {
        ctx: Context,
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        version: u64,
    },
    KvBatchGet {
        ctx: Context,
        keys: Vec<ByteBuf>,
        version: u64,
    },
    KvScan {
        ctx: Context,
        #[serde(with = "serde_bytes")]
        start_key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        end_key: Vec<u8>,
        limit: usize,
        version: u64,
        key_only: bool,
    },
    KvPrewrite {
        ctx: Context,
        mutations: Vec<Mutation>,
        #[serde(with = "serde_bytes")]
        primary: Vec<u8>,
        start_version: u64,
        lock_ttl: u64,
        min_commit_ts: u64,
    },
    KvCommit {
        ctx: Context,
        keys: Vec<ByteBuf>,
        start_version: u64,
        commit_version: u64,
    },
    KvBatchRollback {
        ctx: Context,
        keys: Vec<ByteBuf>,
        start_version: u64,
    },
    KvResolveLock {
        ctx: Context,
        keys: Vec<ByteBuf>,
        start_version: u64,
        commit_version: u64,
    },
    KvCheckTxnStatus {
        ctx: Context,
        #[serde(with = "serde_bytes")]
        primary: Vec<u8>,
        lock_ts: u64,
        current_ts: u64,
        caller_start_ts: u64,
        rollback_if_not_exist: bool,
    },
    RawPut {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    RawGet {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
    /// Allocates a timestamp.
    Tso,
    /// Looks up the local region containing the key.
    Route(#[serde(with = "serde_bytes")] Vec<u8>),
    Status,
    Split {
        region_id: RegionId,
        #[serde(with = "serde_bytes")]
        split_key: Vec<u8>,
    },
    Merge {
        target_region_id: RegionId,
        source_region_id: RegionId,
    },
    AddPeer {
        region_id: RegionId,
        store_id: StoreId,
    },
    RemovePeer {
        region_id: RegionId,
        peer_id: PeerId,
    },
    TransferLeader {
        region_id: RegionId,
        peer_id: PeerId,
    },
}

impl encoding::Value for Request {}

/// A client protocol response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    KvGet(KvResponse<KeyResult<Option<ByteBuf>>>),
    KvBatchGet(KvResponse<Vec<KvPair>>),
    KvScan(KvResponse<Vec<KvPair>>),
    KvPrewrite(KvResponse<Vec<KeyError>>),
    KvCommit(KvResponse<KeyResult<()>>),
    KvBatchRollback(KvResponse<KeyResult<()>>),
    KvResolveLock(KvResponse<KeyResult<()>>),
    KvCheckTxnStatus(KvResponse<KeyResult<TxnStatus>>),
    RawPut(KvResponse<()>),
    RawGet(Option<ByteBuf>),
    Tso(u64),
    Route(Option<Route>),
    Status(StoreStatus),
    Split(KvResponse<Vec<RegionMeta>>),
    Merge(KvResponse<RegionMeta>),
    AddPeer(KvResponse<RegionMeta>),
    RemovePeer(KvResponse<RegionMeta>),
    TransferLeader(KvResponse<()>),
}

impl encoding::Value for Response {}

/// The KV service, executing requests against a store.
#[derive(Clone)]
pub struct KvService {
    store: Store,
}

impl KvService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Proposes a single write request and extracts its response.
    fn write<T>(&self, ctx: Context, request: Command, extract: fn(Reply) -> Option<T>) -> Result<KvResponse<T>> {
        let command = RaftCmdRequest::new(ctx.region_id, ctx.region_epoch, vec![request]);
        Self::single(self.store.propose_command(command)?, extract)
    }

    /// Executes a single read request and extracts its response.
    fn read<T>(&self, ctx: Context, request: Command, extract: fn(Reply) -> Option<T>) -> Result<KvResponse<T>> {
        let command = RaftCmdRequest::new(ctx.region_id, ctx.region_epoch, vec![request]);
        Self::single(self.store.read_command(command)?, extract)
    }

    fn single<T>(result: RegionResult<Vec<Reply>>, extract: fn(Reply) -> Option<T>) -> Result<KvResponse<T>> {
        let replies = match result {
            Ok(replies) => replies,
            Err(err) => return Ok(KvResponse::from_result(Err(err))),
        };
        let mut replies = replies.into_iter();
        match (replies.next(), replies.next()) {
            (Some(reply), None) => match extract(reply.clone()) {
                Some(payload) => Ok(KvResponse::from_result(Ok(payload))),
                None => errdata!("unexpected response {reply:?}"),
            },
            (first, second) => errdata!("expected a single response, got {first:?} and {second:?}"),
        }
    }

    pub fn kv_get(&self, ctx: Context, key: Vec<u8>, version: u64) -> Result<KvResponse<KeyResult<Option<ByteBuf>>>> {
        self.read(ctx, Command::Get { key, read_ts: version }, |reply| match reply {
            Reply::Get(result) => Some(result),
            _ => None,
        })
    }

    pub fn kv_batch_get(&self, ctx: Context, keys: Vec<ByteBuf>, version: u64) -> Result<KvResponse<Vec<KvPair>>> {
        self.read(ctx, Command::BatchGet { keys, read_ts: version }, |reply| match reply {
            Reply::BatchGet(pairs) => Some(pairs),
            _ => None,
        })
    }

    /// Scans [start_key, end_key) within the region, returning at most limit
    /// pairs (0 for no limit).
    pub fn kv_scan(
        &self,
        ctx: Context,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        limit: usize,
        version: u64,
        key_only: bool,
    ) -> Result<KvResponse<Vec<KvPair>>> {
        let request = Command::Scan { start_key, end_key, limit, read_ts: version, key_only };
        self.read(ctx, request, |reply| match reply {
            Reply::Scan(pairs) => Some(pairs),
            _ => None,
        })
    }

    pub fn kv_prewrite(
        &self,
        ctx: Context,
        mutations: Vec<Mutation>,
        primary: Vec<u8>,
        start_version: u64,
        lock_ttl: u64,
        min_commit_ts: u64,
    ) -> Result<KvResponse<Vec<KeyError>>> {
        let request = Command::Prewrite { mutations, primary, start_ts: start_version, lock_ttl, min_commit_ts };
        self.write(ctx, request, |reply| match reply {
            Reply::Prewrite(errors) => Some(errors),
            _ => None,
        })
    }

    pub fn kv_commit(
        &self,
        ctx: Context,
        keys: Vec<ByteBuf>,
        start_version: u64,
        commit_version: u64,
    ) -> Result<KvResponse<KeyResult<()>>> {
        let request = Command::Commit { keys, start_ts: start_version, commit_ts: commit_version };
        self.write(ctx, request, |reply| match reply {
            Reply::Commit(result) => Some(result),
            _ => None,
        })
    }

    pub fn kv_batch_rollback(
        &self,
        ctx: Context,
        keys: Vec<ByteBuf>,
        start_version: u64,
    ) -> Result<KvResponse<KeyResult<()>>> {
        self.write(ctx, Command::BatchRollback { keys, start_ts: start_version }, |reply| match reply {
            Reply::BatchRollback(result) => Some(result),
            _ => None,
        })
    }

    /// Commits (commit_version > 0) or rolls back the transaction's locks on
    /// the given keys, or on all of its keys in the region if none are given.
    pub fn kv_resolve_lock(
        &self,
        ctx: Context,
        keys: Vec<ByteBuf>,
        start_version: u64,
        commit_version: u64,
    ) -> Result<KvResponse<KeyResult<()>>> {
        let request = Command::ResolveLock { keys, start_ts: start_version, commit_ts: commit_version };
        self.write(ctx, request, |reply| match reply {
            Reply::ResolveLock(result) => Some(result),
            _ => None,
        })
    }

    pub fn kv_check_txn_status(
        &self,
        ctx: Context,
        primary: Vec<u8>,
        lock_ts: u64,
        current_ts: u64,
        caller_start_ts: u64,
        rollback_if_not_exist: bool,
    ) -> Result<KvResponse<KeyResult<TxnStatus>>> {
        let request = Command::CheckTxnStatus { primary, lock_ts, current_ts, caller_start_ts, rollback_if_not_exist };
        self.write(ctx, request, |reply| match reply {
            Reply::CheckTxnStatus(result) => Some(result),
            _ => None,
        })
    }

    /// Returns the local region containing the key and its known leader.
    pub fn route(&self, key: &[u8]) -> Result<Option<Route>> {
        let Some(region) = self.store.region_for_key(key)? else {
            return Ok(None);
        };
        let leader = match self.store.peer(region.id)? {
            Some(peer) => peer.leader()?,
            None => None,
        };
        Ok(Some(Route { region, leader }))
    }

    /// Returns the store status.
    pub fn status(&self) -> Result<StoreStatus> {
        let mut regions = Vec::new();
        for peer in self.store.peers()? {
            let status = peer.status()?;
            regions.push(RegionStatus {
                region: peer.region()?,
                is_leader: status.is_leader,
                leader: peer.leader()?,
                term: status.term,
                commit_index: status.commit_index,
                applied_index: status.applied_index,
            });
        }
        regions.sort_by_key(|r| r.region.id);
        Ok(StoreStatus {
            store_id: self.store.id(),
            regions,
            pending_proposals: self.store.pending_proposals()?,
            engine: self.store.engine_status()?,
        })
    }

    /// Executes a protocol request.
    pub fn execute(&self, request: Request) -> Result<Response> {
        Ok(match request {
            Request::KvGet { ctx, key, version } => Response::KvGet(self.kv_get(ctx, key, version)?),
            Request::KvBatchGet { ctx, keys, version } => Response::KvBatchGet(self.kv_batch_get(ctx, keys, version)?),
            Request::KvScan { ctx, start_key, end_key, limit, version, key_only } => {
                Response::KvScan(self.kv_scan(ctx, start_key, end_key, limit, version, key_only)?)
            }
            Request::KvPrewrite { ctx, mutations, primary, start_version, lock_ttl, min_commit_ts } => {
                Response::KvPrewrite(self.kv_prewrite(
                    ctx,
                    mutations,
                    primary,
                    start_version,
                    lock_ttl,
                    min_commit_ts,
                )?)
            }
            Request::KvCommit { ctx, keys, start_version, commit_version } => {
                Response::KvCommit(self.kv_commit(ctx, keys, start_version, commit_version)?)
            }
            Request::KvBatchRollback { ctx, keys, start_version } => {
                Response::KvBatchRollback(self.kv_batch_rollback(ctx, keys, start_version)?)
            }
            Request::KvResolveLock { ctx, keys, start_version, commit_version } => {
                Response::KvResolveLock(self.kv_resolve_lock(ctx, keys, start_version, commit_version)?)
            }
            Request::KvCheckTxnStatus { ctx, primary, lock_ts, current_ts, caller_start_ts, rollback_if_not_exist } => {
                Response::KvCheckTxnStatus(self.kv_check_txn_status(
                    ctx,
                    primary,
                    lock_ts,
                    current_ts,
                    caller_start_ts,
                    rollback_if_not_exist,
                )?)
            }
            Request::RawPut { key, value } => {
                Response::RawPut(KvResponse::from_result(self.store.propose_raw(RawRecord { key, value })?))
            }
            Request::RawGet { key } => Response::RawGet(self.store.get_raw(&key)?.map(ByteBuf::from)),
            Request::Tso => Response::Tso(self.store.placement().tso()?),
            Request::Route(key) => Response::Route(self.route(&key)?),
            Request::Status => Response::Status(self.status()?),
            Request::Split { region_id, split_key } => {
                Response::Split(KvResponse::from_result(self.store.propose_split(region_id, split_key)?))
            }
            Request::Merge { target_region_id, source_region_id } => Response::Merge(KvResponse::from_result(
                self.store.propose_merge(target_region_id, source_region_id)?,
            )),
            Request::AddPeer { region_id, store_id } => {
                Response::AddPeer(KvResponse::from_result(self.store.propose_add_peer(region_id, store_id)?))
            }
            Request::RemovePeer { region_id, peer_id } => {
                Response::RemovePeer(KvResponse::from_result(self.store.propose_remove_peer(region_id, peer_id)?))
            }
            Request::TransferLeader { region_id, peer_id } => {
                Response::TransferLeader(KvResponse::from_result(self.store.transfer_leader(region_id, peer_id)?))
            }
        })
    }
}
