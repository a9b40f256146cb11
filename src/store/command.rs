//! Raft command wire format. A normal Raft entry payload is one of:
//!
//! * Empty: a leader no-op, appended on election.
//! * COMMAND_MARKER followed by a Bincode RaftCmdRequest.
//! * A Bincode RawRecord, written to the raw (non-transactional) keyspace.

use crate::encoding::{self, Value as _};
use crate::errinput;
use crate::error::Result;
use crate::mvcc::{KeyError, KeyResult, KvPair, Mutation, TxnStatus};
use crate::region::{Epoch, PeerId, PeerMeta, RegionId, RegionMeta};

use serde::{Deserialize, Serialize};

/// Prefixes encoded RaftCmdRequests in entry payloads.
pub const COMMAND_MARKER: u8 = 0xCE;

/// Routing and deduplication metadata for a command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CmdHeader {
    pub region_id: RegionId,
    /// The region epoch the command was routed with.
    pub region_epoch: Epoch,
    /// The proposing peer, which delivers the result when applied.
    pub peer_id: PeerId,
    /// The proposal's request ID, assigned by the pipeline.
    pub request_id: u64,
    /// The pipeline incarnation that assigned the request ID. Request IDs
    /// restart with every store run, so results are only delivered for
    /// entries proposed by the current run.
    pub incarnation: u64,
}

/// A command replicated through a region's Raft log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftCmdRequest {
    pub header: CmdHeader,
    pub requests: Vec<Request>,
    pub admin: Option<AdminCommand>,
}

impl encoding::Value for RaftCmdRequest {}

impl RaftCmdRequest {
    /// Creates a command for the given region and requests.
    pub fn new(region_id: RegionId, region_epoch: Epoch, requests: Vec<Request>) -> Self {
        Self { header: CmdHeader { region_id, region_epoch, ..Default::default() }, requests, admin: None }
    }

    /// Creates an admin command for the given region.
    pub fn admin(region_id: RegionId, region_epoch: Epoch, admin: AdminCommand) -> Self {
        Self {
            header: CmdHeader { region_id, region_epoch, ..Default::default() },
            requests: Vec::new(),
            admin: Some(admin),
        }
    }

    /// Returns all keys touched by the requests.
    pub fn keys(&self) -> Vec<&[u8]> {
        self.requests.iter().flat_map(Request::keys).collect()
    }
}

/// A raw key/value write, bypassing transactions. An empty value deletes the
/// key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl encoding::Value for RawRecord {}

/// A decoded entry payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Noop,
    Command(RaftCmdRequest),
    Raw(RawRecord),
}

impl Payload {
    /// Decodes an entry payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        match data.split_first() {
            None => Ok(Self::Noop),
            Some((&COMMAND_MARKER, command)) => Ok(Self::Command(RaftCmdRequest::decode(command)?)),
            Some(_) => Ok(Self::Raw(RawRecord::decode(data)?)),
        }
    }
}

/// Encodes a command as an entry payload.
pub fn encode_command(command: &RaftCmdRequest) -> Result<Vec<u8>> {
    let mut data = vec![COMMAND_MARKER];
    command.encode_into(&mut data)?;
    Ok(data)
}

/// Encodes a raw record as an entry payload. Records whose encoding starts
/// with COMMAND_MARKER (i.e. a key length of 206 bytes) are ambiguous and
/// rejected.
pub fn encode_raw(record: &RawRecord) -> Result<Vec<u8>> {
    let data = record.encode()?;
    if data.first() == Some(&COMMAND_MARKER) {
        return errinput!("raw key length {} is reserved", record.key.len());
    }
    Ok(data)
}

/// A transactional request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Get {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        read_ts: u64,
    },
    BatchGet {
        keys: Vec<serde_bytes::ByteBuf>,
        read_ts: u64,
    },
    Scan {
        #[serde(with = "serde_bytes")]
        start_key: Vec<u8>,
        /// The exclusive end key. Empty means unbounded.
        #[serde(with = "serde_bytes")]
        end_key: Vec<u8>,
        /// The maximum number of pairs returned. 0 means no limit.
        limit: usize,
        read_ts: u64,
        key_only: bool,
    },
    Prewrite {
        mutations: Vec<Mutation>,
        #[serde(with = "serde_bytes")]
        primary: Vec<u8>,
        start_ts: u64,
        lock_ttl: u64,
        min_commit_ts: u64,
    },
    Commit {
        keys: Vec<serde_bytes::ByteBuf>,
        start_ts: u64,
        commit_ts: u64,
    },
    BatchRollback {
        keys: Vec<serde_bytes::ByteBuf>,
        start_ts: u64,
    },
    /// Commits (commit_ts > 0) or rolls back the transaction's locks. With
    /// no keys, all of its locks in the region are resolved.
    ResolveLock {
        keys: Vec<serde_bytes::ByteBuf>,
        start_ts: u64,
        commit_ts: u64,
    },
    CheckTxnStatus {
        #[serde(with = "serde_bytes")]
        primary: Vec<u8>,
        lock_ts: u64,
        current_ts: u64,
        caller_start_ts: u64,
        rollback_if_not_exist: bool,
    },
}

impl Request {
    /// Returns the keys the request addresses. Scans return their start key.
    pub fn keys(&self) -> Vec<&[u8]> {
        match self {
            Self::Get { key, .. } => vec![key.as_slice()],
            Self::Scan { start_key, .. } => vec![start_key.as_slice()],
            Self::BatchGet { keys, .. }
            | Self::Commit { keys, .. }
            | Self::BatchRollback { keys, .. }
            | Self::ResolveLock { keys, .. } => keys.iter().map(|k| k.as_slice()).collect(),
            Self::Prewrite { mutations, .. } => mutations.iter().map(Mutation::key).collect(),
            Self::CheckTxnStatus { primary, .. } => vec![primary.as_slice()],
        }
    }

    /// Returns whether the request is a read, served locally via a read
    /// index instead of through the Raft log.
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get { .. } | Self::BatchGet { .. } | Self::Scan { .. })
    }
}

/// A transactional response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Get(KeyResult<Option<serde_bytes::ByteBuf>>),
    BatchGet(Vec<KvPair>),
    Scan(Vec<KvPair>),
    Prewrite(Vec<KeyError>),
    Commit(KeyResult<()>),
    BatchRollback(KeyResult<()>),
    ResolveLock(KeyResult<()>),
    CheckTxnStatus(KeyResult<TxnStatus>),
    /// An admin command result: the regions it created or changed.
    Admin(Vec<RegionMeta>),
}

impl encoding::Value for Response {}

/// A region admin command, applied on every replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AdminCommand {
    /// Splits the parent at the child's start key. The child carries the
    /// new region and peer IDs.
    Split {
        parent_region_id: RegionId,
        #[serde(with = "serde_bytes")]
        split_key: Vec<u8>,
        child: RegionMeta,
    },
    /// Fences the source region for a merge into the target, via the
    /// source's log. Once applied, the source rejects all further commands.
    PrepareMerge { source_region_id: RegionId, target_region_id: RegionId },
    /// Merges the prepared source region into the adjacent target region,
    /// whose log carries the command. Replicas first apply the source's log
    /// up to source_index, the index of its PrepareMerge. The source is
    /// tombstoned.
    Merge { target_region_id: RegionId, source_region_id: RegionId, source_index: u64 },
    /// Lifts a merge fence from the source region, via the source's log.
    RollbackMerge { source_region_id: RegionId },
}

/// A routing error, returned in-band. The client should refresh its region
/// cache and retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RegionError {
    /// The local peer is not the leader. Carries the known leader, if any.
    NotLeader { region_id: RegionId, leader: Option<PeerMeta> },
    /// The command's epoch or keys don't match the region. Carries the
    /// current local metadata of the relevant regions.
    EpochNotMatch { current_regions: Vec<RegionMeta> },
    /// The region is not hosted on this store.
    RegionNotFound { region_id: RegionId },
}

impl std::fmt::Display for RegionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLeader { region_id, leader: Some(leader) } => {
                write!(f, "not leader of region {region_id}, leader is peer {}", leader.peer_id)
            }
            Self::NotLeader { region_id, leader: None } => {
                write!(f, "not leader of region {region_id}, leader unknown")
            }
            Self::EpochNotMatch { current_regions } => {
                write!(f, "epoch not match, current regions: ")?;
                for (i, region) in current_regions.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{region}")?;
                }
                Ok(())
            }
            Self::RegionNotFound { region_id } => write!(f, "region {region_id} not found"),
        }
    }
}

/// A result with an in-band RegionError.
pub type RegionResult<T> = std::result::Result<T, RegionError>;

/// The result of a command: one response per request, or a region error.
pub type CmdResult = RegionResult<Vec<Response>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_decoding() -> Result<()> {
        assert_eq!(Payload::decode(&[])?, Payload::Noop);

        let mut command = RaftCmdRequest::new(
            7,
            Epoch { version: 2, conf_ver: 3 },
            vec![Request::Get { key: b"a".to_vec(), read_ts: 9 }],
        );
        command.header.request_id = 42;
        command.header.incarnation = 7;
        let data = encode_command(&command)?;
        assert_eq!(data[0], COMMAND_MARKER);
        assert_eq!(Payload::decode(&data)?, Payload::Command(command));

        let raw = RawRecord { key: b"k".to_vec(), value: b"v".to_vec() };
        assert_eq!(Payload::decode(&encode_raw(&raw)?)?, Payload::Raw(raw));
        assert!(encode_raw(&RawRecord { key: vec![0; 206], value: vec![] }).is_err());
        Ok(())
    }

    #[test]
    fn request_keys() {
        let request = Request::Prewrite {
            mutations: vec![
                Mutation::Put { key: b"a".to_vec(), value: b"1".to_vec() },
                Mutation::Delete { key: b"b".to_vec() },
            ],
            primary: b"a".to_vec(),
            start_ts: 1,
            lock_ttl: 1,
            min_commit_ts: 0,
        };
        assert_eq!(request.keys(), vec![b"a".as_slice(), b"b".as_slice()]);
        assert!(!request.is_read());
        assert!(Request::Get { key: vec![], read_ts: 1 }.is_read());
    }
}
