//! A Percolator-style distributed transaction engine, giving cross-key (and
//! cross-region) atomicity on top of the versioned storage engine.
//!
//! A transaction takes a start timestamp, buffers its writes client-side,
//! and commits them in two phases:
//!
//! 1. Prewrite: every key is locked (Lock column family) and its value is
//!    written provisionally at the start timestamp (Default column family).
//!    One key is designated the primary, and all locks point to it. A key
//!    that is already locked by another transaction, or was committed by a
//!    transaction after our start timestamp, fails the prewrite.
//!
//! 2. Commit: the client takes a commit timestamp and commits the primary
//!    key, replacing its lock with a commit record (Write column family) at
//!    the commit timestamp. The transaction is committed once the primary is.
//!    Secondary keys are committed afterwards, possibly lazily by readers.
//!
//! Readers at a read timestamp find the newest commit record at or below it
//! and fetch the value via the record's start timestamp (or directly from
//! the record, for short values). A lock below the read timestamp blocks the
//! read, since the transaction may still commit below the read timestamp.
//! Clients resolve such locks by checking the status of the primary
//! (CheckTxnStatus), which rolls back expired transactions, and then
//! committing or rolling back the secondary locks (ResolveLock).
//!
//! Rollbacks leave a Rollback record at the start timestamp, so that a late
//! prewrite or commit of the rolled back transaction fails.

mod latch;
mod reader;
mod txn;

pub use latch::{LatchGuard, LatchManager};
pub use reader::Reader;

use crate::encoding;
use crate::error::Result;
use crate::storage::{Engine, KeyRange};

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Values up to this size are stored inline in the lock and commit record,
/// instead of in the Default column family.
pub const SHORT_VALUE_MAX_LEN: usize = 64;

/// The version at which locks are stored in the Lock column family. There is
/// at most one lock per key.
const LOCK_VERSION: u64 = 0;

/// The kind of a lock, or of a commit record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Put,
    Delete,
    /// Locks the key without writing it, e.g. for SELECT FOR UPDATE.
    Lock,
}

/// A transaction lock on a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    #[serde(with = "serde_bytes")]
    pub primary: Vec<u8>,
    /// The transaction's start timestamp.
    pub ts: u64,
    /// The lock time-to-live, in timestamp units.
    pub ttl: u64,
    pub kind: LockKind,
    /// The transaction may not commit below this timestamp. Readers push it
    /// past their read timestamp to avoid blocking on the lock.
    pub min_commit_ts: u64,
    pub short_value: Option<serde_bytes::ByteBuf>,
}

impl encoding::Value for Lock {}

impl Lock {
    /// Returns lock info for the given key, for errors.
    fn info(&self, key: &[u8]) -> LockInfo {
        LockInfo {
            key: key.to_vec(),
            primary: self.primary.clone(),
            ts: self.ts,
            ttl: self.ttl,
            kind: self.kind,
            min_commit_ts: self.min_commit_ts,
        }
    }
}

/// The kind of a commit record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Put,
    Delete,
    Lock,
    /// The transaction was rolled back. Stored at the start timestamp.
    Rollback,
}

impl From<LockKind> for WriteKind {
    fn from(kind: LockKind) -> Self {
        match kind {
            LockKind::Put => Self::Put,
            LockKind::Delete => Self::Delete,
            LockKind::Lock => Self::Lock,
        }
    }
}

/// A commit (or rollback) record, keyed by key and commit timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Write {
    pub kind: WriteKind,
    pub start_ts: u64,
    pub short_value: Option<serde_bytes::ByteBuf>,
}

impl encoding::Value for Write {}

impl Write {
    fn rollback(start_ts: u64) -> Self {
        Self { kind: WriteKind::Rollback, start_ts, short_value: None }
    }
}

/// A transaction mutation, as prewritten.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    Delete {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
    Lock {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
}

impl Mutation {
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } | Self::Lock { key } => key,
        }
    }

    fn kind(&self) -> LockKind {
        match self {
            Self::Put { .. } => LockKind::Put,
            Self::Delete { .. } => LockKind::Delete,
            Self::Lock { .. } => LockKind::Lock,
        }
    }
}

/// Information about a lock, returned when it blocks an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub primary: Vec<u8>,
    pub ts: u64,
    pub ttl: u64,
    pub kind: LockKind,
    pub min_commit_ts: u64,
}

/// A transaction error for a key. These are returned in-band to the client,
/// which resolves them (e.g. by resolving locks and retrying).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyError {
    /// The key is locked by another transaction.
    Locked(LockInfo),
    /// The key was committed by another transaction after our start ts.
    WriteConflict {
        start_ts: u64,
        conflict_start_ts: u64,
        conflict_commit_ts: u64,
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        primary: Vec<u8>,
    },
    /// The transaction can't proceed and must be aborted.
    Abort(String),
    /// The operation failed transiently and can be retried.
    Retryable(String),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked(lock) => {
                write!(f, "key {} locked by txn {}", lock.key.escape_ascii(), lock.ts)
            }
            Self::WriteConflict { start_ts, conflict_commit_ts, key, .. } => write!(
                f,
                "write conflict on key {} for txn {start_ts}: committed at {conflict_commit_ts}",
                key.escape_ascii()
            ),
            Self::Abort(msg) => write!(f, "txn aborted: {msg}"),
            Self::Retryable(msg) => write!(f, "retryable: {msg}"),
        }
    }
}

/// A result with an in-band KeyError.
pub type KeyResult<T> = std::result::Result<T, KeyError>;

/// The action taken by CheckTxnStatus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnAction {
    NoAction,
    /// The lock had expired and was rolled back.
    TtlExpireRollback,
    /// There was no lock, and a rollback record exists or was written.
    LockNotExistRollback,
    /// The lock's min_commit_ts was pushed past the caller's start ts.
    MinCommitTsPushed,
}

/// A transaction's status, as returned by CheckTxnStatus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnStatus {
    /// The remaining lock TTL, if the transaction is still locked.
    pub lock_ttl: u64,
    /// The commit timestamp, if the transaction committed.
    pub commit_version: u64,
    pub action: TxnAction,
}

/// A key/value pair returned by reads, or the error for the key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    pub value: KeyResult<serde_bytes::ByteBuf>,
}

/// The transaction engine, over a shared storage engine. All operations
/// acquire the latches of the keys they touch.
pub struct Mvcc<E: Engine + ?Sized> {
    engine: Arc<Mutex<E>>,
    latches: Arc<LatchManager>,
}

impl<E: Engine + ?Sized> Clone for Mvcc<E> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), latches: self.latches.clone() }
    }
}

impl<E: Engine + ?Sized> Mvcc<E> {
    pub fn new(engine: Arc<Mutex<E>>, latches: Arc<LatchManager>) -> Self {
        Self { engine, latches }
    }

    /// Returns a reader, which does not take latches.
    pub fn reader(&self) -> Reader<'_, E> {
        Reader::new(&self.engine)
    }

    /// Prewrites mutations, returning per-key errors. If there are any
    /// errors, nothing is written.
    pub fn prewrite(
        &self,
        mutations: &[Mutation],
        primary: &[u8],
        start_ts: u64,
        lock_ttl: u64,
        min_commit_ts: u64,
    ) -> Result<Vec<KeyError>> {
        let _guard = self.latches.acquire(mutations.iter().map(Mutation::key))?;
        txn::prewrite(&self.engine, mutations, primary, start_ts, lock_ttl, min_commit_ts)
    }

    /// Commits the given keys of a transaction.
    pub fn commit(&self, keys: &[Vec<u8>], start_ts: u64, commit_ts: u64) -> Result<KeyResult<()>> {
        let _guard = self.latches.acquire(keys.iter().map(Vec::as_slice))?;
        txn::commit(&self.engine, keys, start_ts, commit_ts)
    }

    /// Rolls back the given keys of a transaction.
    pub fn batch_rollback(&self, keys: &[Vec<u8>], start_ts: u64) -> Result<KeyResult<()>> {
        let _guard = self.latches.acquire(keys.iter().map(Vec::as_slice))?;
        txn::rollback(&self.engine, keys, start_ts)
    }

    /// Commits (commit_ts > 0) or rolls back (commit_ts = 0) a transaction's
    /// locks on the given keys. With no keys, all of the transaction's locks
    /// in the given range are resolved.
    pub fn resolve_lock(
        &self,
        range: KeyRange,
        keys: &[Vec<u8>],
        start_ts: u64,
        commit_ts: u64,
    ) -> Result<KeyResult<()>> {
        let keys = match keys.is_empty() {
            true => self.reader().scan_locks(range, start_ts)?,
            false => keys.to_vec(),
        };
        let _guard = self.latches.acquire(keys.iter().map(Vec::as_slice))?;
        txn::resolve(&self.engine, &keys, start_ts, commit_ts)
    }

    /// Checks the status of a transaction via its primary key, rolling back
    /// expired locks and pushing the min commit ts of live ones.
    pub fn check_txn_status(
        &self,
        primary: &[u8],
        lock_ts: u64,
        current_ts: u64,
        caller_start_ts: u64,
        rollback_if_not_exist: bool,
    ) -> Result<KeyResult<TxnStatus>> {
        let _guard = self.latches.acquire([primary])?;
        txn::check_txn_status(
            &self.engine,
            primary,
            lock_ts,
            current_ts,
            caller_start_ts,
            rollback_if_not_exist,
        )
    }

    /// Reads a key at the given timestamp, failing if it is locked.
    pub fn get(&self, key: &[u8], read_ts: u64) -> Result<KeyResult<Option<Vec<u8>>>> {
        let reader = self.reader();
        if let Err(err) = reader.check_lock(key, read_ts)? {
            return Ok(Err(err));
        }
        Ok(Ok(reader.get_value(key, read_ts)?))
    }

    /// Reads multiple keys at the given timestamp. Missing keys are omitted.
    pub fn batch_get(&self, keys: &[Vec<u8>], read_ts: u64) -> Result<Vec<KvPair>> {
        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            let value = match self.get(key, read_ts)? {
                Ok(Some(value)) => Ok(value.into()),
                Ok(None) => continue,
                Err(err) => Err(err),
            };
            pairs.push(KvPair { key: key.clone(), value });
        }
        Ok(pairs)
    }

    /// Scans a key range at the given timestamp.
    pub fn scan(&self, range: KeyRange, limit: usize, read_ts: u64, key_only: bool) -> Result<Vec<KvPair>> {
        self.reader().scan(range, limit, read_ts, key_only)
    }
}

#[cfg(test)]
mod tests;
