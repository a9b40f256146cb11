use super::{KeyError, KeyResult, KvPair, Lock, LockKind, Write, WriteKind, LOCK_VERSION};
use crate::encoding::Value as _;
use crate::error::Result;
use crate::storage::{ColumnFamily, Engine, KeyRange};

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

/// The commit status of a transaction on a key, found via its commit record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnCommitRecord {
    /// The key was committed at the given commit timestamp.
    Committed(u64, Write),
    /// The key was rolled back.
    RolledBack,
    /// There is no commit record for the transaction.
    None,
}

/// Reads transactional data from the storage engine. The engine is locked
/// per primitive read, so a reader observes writes made between calls;
/// callers that need a consistent view of a key hold its latch.
pub struct Reader<'a, E: Engine + ?Sized> {
    engine: &'a Mutex<E>,
}

impl<'a, E: Engine + ?Sized> Reader<'a, E> {
    pub fn new(engine: &'a Mutex<E>) -> Self {
        Self { engine }
    }

    /// Loads the lock on a key, if any.
    pub fn load_lock(&self, key: &[u8]) -> Result<Option<Lock>> {
        let mut engine = self.engine.lock()?;
        engine.get(ColumnFamily::Lock, key, LOCK_VERSION)?.map(|v| Lock::decode(&v)).transpose()
    }

    /// Returns the newest write of a key at or below the given commit
    /// timestamp, of any kind, as (commit_ts, write).
    pub fn seek_write(&self, key: &[u8], ts: u64) -> Result<Option<(u64, Write)>> {
        let mut engine = self.engine.lock()?;
        let mut versions = engine.versions(ColumnFamily::Write, key, ts);
        match versions.next().transpose()? {
            Some((commit_ts, value)) => Ok(Some((commit_ts, Write::decode(&value)?))),
            None => Ok(None),
        }
    }

    /// Looks for the commit record of the transaction with the given start
    /// timestamp. A transaction commits after it starts, so only writes at or
    /// above the start timestamp are considered.
    pub fn get_txn_commit_record(&self, key: &[u8], start_ts: u64) -> Result<TxnCommitRecord> {
        let mut engine = self.engine.lock()?;
        for item in engine.versions(ColumnFamily::Write, key, u64::MAX) {
            let (commit_ts, value) = item?;
            if commit_ts < start_ts {
                break;
            }
            let write = Write::decode(&value)?;
            if write.start_ts != start_ts {
                continue;
            }
            return Ok(match write.kind {
                WriteKind::Rollback => TxnCommitRecord::RolledBack,
                _ => TxnCommitRecord::Committed(commit_ts, write),
            });
        }
        Ok(TxnCommitRecord::None)
    }

    /// Returns the newest data write (Put or Delete) at or below the read
    /// timestamp, skipping rollbacks and locks.
    fn find_data_write(&self, key: &[u8], read_ts: u64) -> Result<Option<(u64, Write)>> {
        let mut engine = self.engine.lock()?;
        for item in engine.versions(ColumnFamily::Write, key, read_ts) {
            let (commit_ts, value) = item?;
            let write = Write::decode(&value)?;
            match write.kind {
                WriteKind::Put | WriteKind::Delete => return Ok(Some((commit_ts, write))),
                WriteKind::Rollback | WriteKind::Lock => {}
            }
        }
        Ok(None)
    }

    /// Loads the value of a Put write, from the write itself or the Default
    /// column family.
    fn load_value(&self, key: &[u8], write: Write) -> Result<Option<Vec<u8>>> {
        if let Some(value) = write.short_value {
            return Ok(Some(value.into_vec()));
        }
        self.engine.lock()?.get(ColumnFamily::Default, key, write.start_ts)
    }

    /// Returns the value of a key visible at the read timestamp, ignoring
    /// locks. Rollback records only mark an aborted transaction, so they are
    /// skipped in favor of older committed writes.
    pub fn get_value(&self, key: &[u8], read_ts: u64) -> Result<Option<Vec<u8>>> {
        match self.find_data_write(key, read_ts)? {
            Some((_, write)) if write.kind == WriteKind::Put => self.load_value(key, write),
            Some(_) | None => Ok(None),
        }
    }

    /// Checks whether a lock on the key blocks a read at the given timestamp.
    pub fn check_lock(&self, key: &[u8], read_ts: u64) -> Result<KeyResult<()>> {
        match self.load_lock(key)? {
            Some(lock) if blocks(&lock, read_ts) => Ok(Err(KeyError::Locked(lock.info(key)))),
            Some(_) | None => Ok(Ok(())),
        }
    }

    /// Returns the keys in the range locked by the transaction with the given
    /// start timestamp.
    pub fn scan_locks(&self, range: KeyRange, start_ts: u64) -> Result<Vec<Vec<u8>>> {
        let mut engine = self.engine.lock()?;
        let mut keys = Vec::new();
        for item in engine.scan(ColumnFamily::Lock, range) {
            let (key, _, value) = item?;
            if Lock::decode(&value)?.ts == start_ts {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Scans the key/value pairs visible at the read timestamp, in key order,
    /// returning up to limit pairs (0 means no limit). Keys with a blocking
    /// lock are returned with a Locked error instead of a value. Iteration
    /// stops once the limit is reached.
    pub fn scan(&self, range: KeyRange, limit: usize, read_ts: u64, key_only: bool) -> Result<Vec<KvPair>> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        let mut locks = self.scan_blocking_locks(range.clone(), read_ts)?;
        let (mut start, end) = range;
        let mut results = Vec::new();
        loop {
            let want = limit - results.len();
            let (candidates, exhausted) =
                self.scan_candidates((start.clone(), end.clone()), want, read_ts, &mut locks)?;
            if let Some((key, _)) = candidates.last() {
                start = Bound::Excluded(key.clone());
            }
            // Values are loaded after the scan, since the engine can't be read
            // while iterating. A write with a missing value is skipped, and
            // the scan resumes to make up for it.
            for (key, candidate) in candidates {
                let value = match candidate {
                    Err(err) => Err(err),
                    Ok(_) if key_only => Ok(Vec::new()),
                    Ok(write) => match self.load_value(&key, write)? {
                        Some(value) => Ok(value),
                        None => continue,
                    },
                };
                results.push(KvPair { key, value: value.map(Into::into) });
            }
            if exhausted || results.len() >= limit {
                return Ok(results);
            }
        }
    }

    /// Returns the locks in the range that block a read at the timestamp.
    fn scan_blocking_locks(&self, range: KeyRange, read_ts: u64) -> Result<BTreeMap<Vec<u8>, Lock>> {
        let mut engine = self.engine.lock()?;
        let mut locks = BTreeMap::new();
        for item in engine.scan(ColumnFamily::Lock, range) {
            let (key, _, value) = item?;
            let lock = Lock::decode(&value)?;
            if blocks(&lock, read_ts) {
                locks.insert(key, lock);
            }
        }
        Ok(locks)
    }

    /// Scans the Write column family in key order for up to want visible
    /// Puts or blocked keys, merging in the blocking locks (which are removed
    /// from the map as they are emitted). Returns the candidates and whether
    /// the range was exhausted.
    #[allow(clippy::type_complexity)]
    fn scan_candidates(
        &self,
        range: KeyRange,
        want: usize,
        read_ts: u64,
        locks: &mut BTreeMap<Vec<u8>, Lock>,
    ) -> Result<(Vec<(Vec<u8>, KeyResult<Write>)>, bool)> {
        let mut candidates = Vec::new();
        // The last key whose visible version has been found. Versions of a
        // key are iterated newest first.
        let mut decided: Option<Vec<u8>> = None;
        let mut engine = self.engine.lock()?;
        for item in engine.scan(ColumnFamily::Write, range) {
            let (key, commit_ts, value) = item?;
            if decided.as_ref() == Some(&key) {
                continue;
            }
            // Locked keys without writes sort before this one.
            while candidates.len() < want && locks.first_key_value().is_some_and(|(k, _)| *k < key) {
                if let Some((locked, lock)) = locks.pop_first() {
                    let err = KeyError::Locked(lock.info(&locked));
                    candidates.push((locked, Err(err)));
                }
            }
            if candidates.len() >= want {
                return Ok((candidates, false));
            }
            if let Some(lock) = locks.remove(&key) {
                let err = KeyError::Locked(lock.info(&key));
                candidates.push((key.clone(), Err(err)));
                decided = Some(key);
            } else if commit_ts <= read_ts {
                let write = Write::decode(&value)?;
                match write.kind {
                    WriteKind::Put => {
                        candidates.push((key.clone(), Ok(write)));
                        decided = Some(key);
                    }
                    WriteKind::Delete => decided = Some(key),
                    WriteKind::Rollback | WriteKind::Lock => {}
                }
            }
            if candidates.len() >= want {
                return Ok((candidates, false));
            }
        }
        while candidates.len() < want {
            let Some((locked, lock)) = locks.pop_first() else { break };
            let err = KeyError::Locked(lock.info(&locked));
            candidates.push((locked, Err(err)));
        }
        Ok((candidates, locks.is_empty()))
    }
}

/// Returns whether a lock blocks a read at the given timestamp: the lock's
/// transaction writes the key and may still commit at or below the read
/// timestamp.
fn blocks(lock: &Lock, read_ts: u64) -> bool {
    matches!(lock.kind, LockKind::Put | LockKind::Delete)
        && lock.ts <= read_ts
        && lock.min_commit_ts <= read_ts
}
