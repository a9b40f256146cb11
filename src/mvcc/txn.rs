//! Transaction actions. Each action first checks all keys without writing,
//! then applies its writes under a single engine lock, so a failed action
//! never leaves a partial write behind. Callers hold the keys' latches.

use super::reader::{Reader, TxnCommitRecord};
use super::{
    KeyError, KeyResult, Lock, Mutation, TxnAction, TxnStatus, Write, WriteKind,
    LOCK_VERSION, SHORT_VALUE_MAX_LEN,
};
use crate::encoding::Value as _;
use crate::error::Result;
use crate::storage::{ColumnFamily, Engine};

use log::{debug, warn};
use std::sync::Mutex;

pub(super) fn prewrite<E: Engine + ?Sized>(
    engine: &Mutex<E>,
    mutations: &[Mutation],
    primary: &[u8],
    start_ts: u64,
    lock_ttl: u64,
    min_commit_ts: u64,
) -> Result<Vec<KeyError>> {
    let reader = Reader::new(engine);
    let mut errors = Vec::new();
    let mut pending = Vec::with_capacity(mutations.len());
    for mutation in mutations {
        let key = mutation.key();
        if key.is_empty() {
            errors.push(KeyError::Abort("empty key".into()));
            continue;
        }
        match reader.load_lock(key)? {
            Some(lock) if lock.ts != start_ts => {
                errors.push(KeyError::Locked(lock.info(key)));
                continue;
            }
            // Already prewritten by this transaction, e.g. a retry.
            Some(_) => continue,
            None => {}
        }
        if let Some((commit_ts, write)) = reader.seek_write(key, u64::MAX)? {
            if commit_ts >= start_ts {
                errors.push(KeyError::WriteConflict {
                    start_ts,
                    conflict_start_ts: write.start_ts,
                    conflict_commit_ts: commit_ts,
                    key: key.to_vec(),
                    primary: primary.to_vec(),
                });
                continue;
            }
        }
        pending.push(mutation);
    }
    if !errors.is_empty() {
        debug!("Prewrite of txn {start_ts} failed with {} key errors", errors.len());
        return Ok(errors);
    }

    let mut engine = engine.lock()?;
    for mutation in pending {
        let key = mutation.key();
        let mut lock = Lock {
            primary: primary.to_vec(),
            ts: start_ts,
            ttl: lock_ttl,
            kind: mutation.kind(),
            min_commit_ts,
            short_value: None,
        };
        if let Mutation::Put { value, .. } = mutation {
            if value.len() <= SHORT_VALUE_MAX_LEN {
                lock.short_value = Some(value.clone().into());
            } else {
                engine.set(ColumnFamily::Default, key, start_ts, value.clone())?;
            }
        }
        engine.set(ColumnFamily::Lock, key, LOCK_VERSION, lock.encode()?)?;
    }
    Ok(errors)
}

pub(super) fn commit<E: Engine + ?Sized>(
    engine: &Mutex<E>,
    keys: &[Vec<u8>],
    start_ts: u64,
    commit_ts: u64,
) -> Result<KeyResult<()>> {
    let reader = Reader::new(engine);
    let mut pending = Vec::with_capacity(keys.len());
    for key in keys {
        let other = match reader.load_lock(key)? {
            Some(lock) if lock.ts == start_ts => {
                if commit_ts < lock.min_commit_ts {
                    return Ok(Err(KeyError::Abort(format!(
                        "commit ts {commit_ts} below min commit ts {}",
                        lock.min_commit_ts
                    ))));
                }
                pending.push((key, lock));
                continue;
            }
            other => other,
        };
        match reader.get_txn_commit_record(key, start_ts)? {
            TxnCommitRecord::Committed(ts, _) => {
                if ts != commit_ts {
                    warn!(
                        "Txn {start_ts} already committed key {} at {ts}, not {commit_ts}",
                        key.escape_ascii()
                    );
                }
            }
            TxnCommitRecord::RolledBack => {
                return Ok(Err(KeyError::Abort("already rolled back".into())));
            }
            TxnCommitRecord::None => {
                return Ok(Err(match other {
                    Some(lock) => KeyError::Locked(lock.info(key)),
                    None => KeyError::Abort("lock not found".into()),
                }));
            }
        }
    }

    let mut engine = engine.lock()?;
    for (key, lock) in pending {
        let write = Write { kind: lock.kind.into(), start_ts, short_value: lock.short_value };
        engine.set(ColumnFamily::Write, key, commit_ts, write.encode()?)?;
        engine.delete(ColumnFamily::Lock, key, LOCK_VERSION)?;
    }
    Ok(Ok(()))
}

pub(super) fn rollback<E: Engine + ?Sized>(
    engine: &Mutex<E>,
    keys: &[Vec<u8>],
    start_ts: u64,
) -> Result<KeyResult<()>> {
    let reader = Reader::new(engine);
    let mut pending = Vec::with_capacity(keys.len());
    for key in keys {
        if key.is_empty() {
            return Ok(Err(KeyError::Abort("empty key".into())));
        }
        if let TxnCommitRecord::Committed(..) = reader.get_txn_commit_record(key, start_ts)? {
            continue;
        }
        let locked = reader.load_lock(key)?.is_some_and(|lock| lock.ts == start_ts);
        pending.push((key, locked));
    }

    let mut engine = engine.lock()?;
    for (key, locked) in pending {
        rollback_key(&mut *engine, key, start_ts, locked)?;
    }
    Ok(Ok(()))
}

/// Rolls back a key: removes the transaction's lock and provisional value
/// (if locked), and leaves a rollback record at the start timestamp unless
/// some write already occupies that version.
fn rollback_key<E: Engine + ?Sized>(engine: &mut E, key: &[u8], start_ts: u64, locked: bool) -> Result<()> {
    if locked {
        engine.delete(ColumnFamily::Lock, key, LOCK_VERSION)?;
        engine.delete(ColumnFamily::Default, key, start_ts)?;
    }
    if engine.get(ColumnFamily::Write, key, start_ts)?.is_none() {
        engine.set(ColumnFamily::Write, key, start_ts, Write::rollback(start_ts).encode()?)?;
    }
    Ok(())
}

pub(super) fn resolve<E: Engine + ?Sized>(
    engine: &Mutex<E>,
    keys: &[Vec<u8>],
    start_ts: u64,
    commit_ts: u64,
) -> Result<KeyResult<()>> {
    let reader = Reader::new(engine);
    let mut locked = Vec::with_capacity(keys.len());
    for key in keys {
        if reader.load_lock(key)?.is_some_and(|lock| lock.ts == start_ts) {
            locked.push(key.clone());
        }
    }
    debug!("Resolving {} locks of txn {start_ts} with commit ts {commit_ts}", locked.len());
    match commit_ts {
        0 => rollback(engine, &locked, start_ts),
        commit_ts => commit(engine, &locked, start_ts, commit_ts),
    }
}

pub(super) fn check_txn_status<E: Engine + ?Sized>(
    engine: &Mutex<E>,
    primary: &[u8],
    lock_ts: u64,
    current_ts: u64,
    caller_start_ts: u64,
    rollback_if_not_exist: bool,
) -> Result<KeyResult<TxnStatus>> {
    let reader = Reader::new(engine);
    if let Some(mut lock) = reader.load_lock(primary)?.filter(|lock| lock.ts == lock_ts) {
        if current_ts >= lock.ts.saturating_add(lock.ttl) {
            debug!("Rolling back expired txn {lock_ts} at {current_ts}");
            rollback_key(&mut *engine.lock()?, primary, lock_ts, true)?;
            return Ok(Ok(TxnStatus {
                lock_ttl: 0,
                commit_version: 0,
                action: TxnAction::TtlExpireRollback,
            }));
        }
        let mut action = TxnAction::NoAction;
        let pushed = caller_start_ts.saturating_add(1);
        if pushed > lock.min_commit_ts {
            lock.min_commit_ts = pushed;
            engine.lock()?.set(ColumnFamily::Lock, primary, LOCK_VERSION, lock.encode()?)?;
            action = TxnAction::MinCommitTsPushed;
        }
        return Ok(Ok(TxnStatus { lock_ttl: lock.ttl, commit_version: 0, action }));
    }

    let action = match reader.get_txn_commit_record(primary, lock_ts)? {
        TxnCommitRecord::Committed(commit_ts, write) => {
            debug_assert_ne!(write.kind, WriteKind::Rollback);
            return Ok(Ok(TxnStatus { lock_ttl: 0, commit_version: commit_ts, action: TxnAction::NoAction }));
        }
        TxnCommitRecord::RolledBack => TxnAction::LockNotExistRollback,
        TxnCommitRecord::None if rollback_if_not_exist => {
            rollback_key(&mut *engine.lock()?, primary, lock_ts, false)?;
            TxnAction::LockNotExistRollback
        }
        TxnCommitRecord::None => return Ok(Err(KeyError::Abort("txn not found".into()))),
    };
    Ok(Ok(TxnStatus { lock_ttl: 0, commit_version: 0, action }))
}
