use super::*;
use crate::storage::{key_range, ColumnFamily, Memory};

use pretty_assertions::assert_eq;

fn setup() -> Mvcc<Memory> {
    Mvcc::new(Arc::new(Mutex::new(Memory::new())), Arc::new(LatchManager::new(16)))
}

fn put(key: &[u8], value: &[u8]) -> Mutation {
    Mutation::Put { key: key.to_vec(), value: value.to_vec() }
}

fn keys(keys: &[&[u8]]) -> Vec<Vec<u8>> {
    keys.iter().map(|k| k.to_vec()).collect()
}

/// Prewrites and commits a single put.
fn write(mvcc: &Mvcc<Memory>, key: &[u8], value: &[u8], start_ts: u64, commit_ts: u64) -> Result<()> {
    assert_eq!(mvcc.prewrite(&[put(key, value)], key, start_ts, 100, 0)?, vec![]);
    assert_eq!(mvcc.commit(&keys(&[key]), start_ts, commit_ts)?, Ok(()));
    Ok(())
}

/// Returns all raw engine entries of a column family.
fn dump(mvcc: &Mvcc<Memory>, cf: ColumnFamily) -> Result<Vec<(Vec<u8>, u64, Vec<u8>)>> {
    let mut engine = mvcc.engine.lock()?;
    let entries = engine.scan(cf, key_range(b"", b"")).collect::<Result<Vec<_>>>()?;
    Ok(entries)
}

#[test]
fn prewrite_commit_get() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 15)?;

    let reader = mvcc.reader();
    assert_eq!(reader.get_value(b"a", 9)?, None);
    assert_eq!(reader.get_value(b"a", 10)?, None);
    assert_eq!(reader.get_value(b"a", 14)?, None);
    assert_eq!(reader.get_value(b"a", 15)?, Some(b"1".to_vec()));
    assert_eq!(reader.get_value(b"a", u64::MAX)?, Some(b"1".to_vec()));
    assert_eq!(mvcc.get(b"a", 20)?, Ok(Some(b"1".to_vec())));

    // The lock is gone, and the short value lives in the commit record.
    assert!(dump(&mvcc, ColumnFamily::Lock)?.is_empty());
    assert!(dump(&mvcc, ColumnFamily::Default)?.is_empty());
    Ok(())
}

#[test]
fn long_values_use_default_cf() -> Result<()> {
    let mvcc = setup();
    let value = vec![7; SHORT_VALUE_MAX_LEN + 1];
    write(&mvcc, b"a", &value, 10, 15)?;

    assert_eq!(dump(&mvcc, ColumnFamily::Default)?, vec![(b"a".to_vec(), 10, value.clone())]);
    assert_eq!(mvcc.reader().get_value(b"a", 15)?, Some(value));
    Ok(())
}

#[test]
fn prewrite_locked() -> Result<()> {
    let mvcc = setup();
    assert_eq!(mvcc.prewrite(&[put(b"a", b"1")], b"a", 10, 100, 0)?, vec![]);
    let before = dump(&mvcc, ColumnFamily::Lock)?;

    // A different transaction fails on the lock, and writes nothing even for
    // its unlocked keys.
    let errors = mvcc.prewrite(&[put(b"a", b"2"), put(b"b", b"2")], b"a", 20, 100, 0)?;
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], KeyError::Locked(info) if info.ts == 10 && info.key == b"a"));
    assert_eq!(dump(&mvcc, ColumnFamily::Lock)?, before);
    assert!(dump(&mvcc, ColumnFamily::Default)?.is_empty());

    // The same transaction retrying is a noop.
    assert_eq!(mvcc.prewrite(&[put(b"a", b"1")], b"a", 10, 100, 0)?, vec![]);
    assert_eq!(dump(&mvcc, ColumnFamily::Lock)?, before);
    Ok(())
}

#[test]
fn prewrite_write_conflict() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 15)?;

    let errors = mvcc.prewrite(&[put(b"a", b"2")], b"a", 12, 100, 0)?;
    assert_eq!(
        errors,
        vec![KeyError::WriteConflict {
            start_ts: 12,
            conflict_start_ts: 10,
            conflict_commit_ts: 15,
            key: b"a".to_vec(),
            primary: b"a".to_vec(),
        }]
    );

    // A later transaction is fine.
    assert_eq!(mvcc.prewrite(&[put(b"a", b"2")], b"a", 16, 100, 0)?, vec![]);
    Ok(())
}

#[test]
fn prewrite_empty_key() -> Result<()> {
    let mvcc = setup();
    let errors = mvcc.prewrite(&[put(b"", b"1")], b"", 10, 100, 0)?;
    assert!(matches!(errors.as_slice(), [KeyError::Abort(_)]));
    Ok(())
}

/// Two transactions race for a key: the one that commits first wins, and the
/// other fails its prewrite, on the lock while the winner is in flight and
/// with a write conflict once it has committed.
#[test]
fn concurrent_prewrite_conflict() -> Result<()> {
    let mvcc = setup();
    assert_eq!(mvcc.prewrite(&[put(b"k", b"t10")], b"k", 10, 100, 0)?, vec![]);
    let errors = mvcc.prewrite(&[put(b"k", b"t20")], b"k", 20, 100, 0)?;
    assert!(matches!(errors.as_slice(), [KeyError::Locked(info)] if info.ts == 10));

    assert_eq!(mvcc.commit(&keys(&[b"k"]), 10, 15)?, Ok(()));
    assert_eq!(mvcc.prewrite(&[put(b"k", b"t20")], b"k", 20, 100, 0)?, vec![]);
    let errors = mvcc.prewrite(&[put(b"k", b"t12")], b"k", 12, 100, 0)?;
    assert!(matches!(errors.as_slice(), [KeyError::Locked(info)] if info.ts == 20));
    assert_eq!(mvcc.batch_rollback(&keys(&[b"k"]), 20)?, Ok(()));
    let errors = mvcc.prewrite(&[put(b"k", b"t12")], b"k", 12, 100, 0)?;
    assert!(matches!(
        errors.as_slice(),
        [KeyError::WriteConflict { conflict_start_ts: 20, conflict_commit_ts: 20, .. }]
    ));
    Ok(())
}

#[test]
fn commit_errors() -> Result<()> {
    let mvcc = setup();

    // No lock.
    assert_eq!(mvcc.commit(&keys(&[b"a"]), 10, 15)?, Err(KeyError::Abort("lock not found".into())));

    // Another transaction's lock.
    mvcc.prewrite(&[put(b"a", b"1")], b"a", 20, 100, 0)?;
    assert!(matches!(mvcc.commit(&keys(&[b"a"]), 10, 15)?, Err(KeyError::Locked(info)) if info.ts == 20));

    // Commit ts below the min commit ts.
    mvcc.prewrite(&[put(b"b", b"1")], b"b", 30, 100, 40)?;
    assert!(matches!(mvcc.commit(&keys(&[b"b"]), 30, 35)?, Err(KeyError::Abort(_))));
    assert_eq!(mvcc.commit(&keys(&[b"b"]), 30, 40)?, Ok(()));
    Ok(())
}

#[test]
fn commit_is_all_or_nothing() -> Result<()> {
    let mvcc = setup();
    mvcc.prewrite(&[put(b"a", b"1")], b"a", 10, 100, 0)?;
    let result = mvcc.commit(&keys(&[b"a", b"missing"]), 10, 15)?;
    assert_eq!(result, Err(KeyError::Abort("lock not found".into())));
    assert_eq!(dump(&mvcc, ColumnFamily::Lock)?.len(), 1);
    assert!(dump(&mvcc, ColumnFamily::Write)?.is_empty());
    Ok(())
}

/// Committing an already committed key succeeds, even with a different
/// commit ts: the original commit stands.
#[test]
fn commit_idempotent() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 15)?;
    assert_eq!(mvcc.commit(&keys(&[b"a"]), 10, 15)?, Ok(()));
    assert_eq!(mvcc.commit(&keys(&[b"a"]), 10, 17)?, Ok(()));
    assert_eq!(dump(&mvcc, ColumnFamily::Write)?.len(), 1);
    assert_eq!(mvcc.reader().get_value(b"a", 16)?, Some(b"1".to_vec()));

    // Also when another transaction has locked the key since.
    mvcc.prewrite(&[put(b"a", b"2")], b"a", 20, 100, 0)?;
    assert_eq!(mvcc.commit(&keys(&[b"a"]), 10, 15)?, Ok(()));
    Ok(())
}

#[test]
fn rollback() -> Result<()> {
    let mvcc = setup();
    let long = vec![1; 100];
    mvcc.prewrite(&[put(b"a", &long), put(b"b", b"1")], b"a", 10, 100, 0)?;
    assert_eq!(mvcc.batch_rollback(&keys(&[b"a", b"b"]), 10)?, Ok(()));

    assert!(dump(&mvcc, ColumnFamily::Lock)?.is_empty());
    assert!(dump(&mvcc, ColumnFamily::Default)?.is_empty());
    for ts in [5, 10, 15, u64::MAX] {
        assert_eq!(mvcc.reader().get_value(b"a", ts)?, None);
        assert_eq!(mvcc.reader().get_value(b"b", ts)?, None);
    }

    // The rolled back transaction can't commit or prewrite again.
    assert_eq!(mvcc.commit(&keys(&[b"a"]), 10, 15)?, Err(KeyError::Abort("already rolled back".into())));
    let errors = mvcc.prewrite(&[put(b"a", b"1")], b"a", 10, 100, 0)?;
    assert!(matches!(errors.as_slice(), [KeyError::WriteConflict { .. }]));

    // Rolling back again is a noop.
    assert_eq!(mvcc.batch_rollback(&keys(&[b"a"]), 10)?, Ok(()));
    assert_eq!(dump(&mvcc, ColumnFamily::Write)?.len(), 2);
    Ok(())
}

#[test]
fn rollback_committed_is_noop() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 15)?;
    assert_eq!(mvcc.batch_rollback(&keys(&[b"a"]), 10)?, Ok(()));
    assert_eq!(mvcc.reader().get_value(b"a", 15)?, Some(b"1".to_vec()));
    assert_eq!(dump(&mvcc, ColumnFamily::Write)?.len(), 1);
    Ok(())
}

#[test]
fn rollback_without_prewrite_blocks_later_prewrite() -> Result<()> {
    let mvcc = setup();
    assert_eq!(mvcc.batch_rollback(&keys(&[b"a"]), 10)?, Ok(()));
    let errors = mvcc.prewrite(&[put(b"a", b"1")], b"a", 10, 100, 0)?;
    assert!(matches!(errors.as_slice(), [KeyError::WriteConflict { conflict_commit_ts: 10, .. }]));
    Ok(())
}

#[test]
fn resolve_lock() -> Result<()> {
    let mvcc = setup();
    let mutations = [put(b"a", b"1"), put(b"b", b"2"), put(b"c", b"3")];
    mvcc.prewrite(&mutations, b"a", 10, 100, 0)?;
    mvcc.prewrite(&[put(b"d", b"4")], b"d", 11, 100, 0)?;

    // Commit the given keys.
    assert_eq!(mvcc.resolve_lock(key_range(b"", b""), &keys(&[b"a", b"d"]), 10, 15)?, Ok(()));
    assert_eq!(mvcc.get(b"a", 20)?, Ok(Some(b"1".to_vec())));
    assert!(matches!(mvcc.get(b"d", 20)?, Err(KeyError::Locked(_))));

    // Roll back the rest by scanning the range.
    assert_eq!(mvcc.resolve_lock(key_range(b"b", b"z"), &[], 10, 0)?, Ok(()));
    assert_eq!(mvcc.get(b"b", 20)?, Ok(None));
    assert_eq!(mvcc.get(b"c", 20)?, Ok(None));
    assert_eq!(dump(&mvcc, ColumnFamily::Lock)?.len(), 1);
    Ok(())
}

#[test]
fn check_txn_status_ttl_expired() -> Result<()> {
    let mvcc = setup();
    mvcc.prewrite(&[put(b"a", b"1")], b"a", 10, 5, 11)?;

    // Not yet expired.
    let status = mvcc.check_txn_status(b"a", 10, 14, 0, false)?;
    assert_eq!(status, Ok(TxnStatus { lock_ttl: 5, commit_version: 0, action: TxnAction::NoAction }));

    let status = mvcc.check_txn_status(b"a", 10, 15, 0, false)?;
    assert_eq!(
        status,
        Ok(TxnStatus { lock_ttl: 0, commit_version: 0, action: TxnAction::TtlExpireRollback })
    );
    assert_eq!(mvcc.commit(&keys(&[b"a"]), 10, 20)?, Err(KeyError::Abort("already rolled back".into())));

    let status = mvcc.check_txn_status(b"a", 10, 30, 0, false)?;
    assert_eq!(status.map(|s| s.action), Ok(TxnAction::LockNotExistRollback));
    Ok(())
}

#[test]
fn check_txn_status_pushes_min_commit_ts() -> Result<()> {
    let mvcc = setup();
    mvcc.prewrite(&[put(b"a", b"1")], b"a", 10, 100, 11)?;
    assert!(matches!(mvcc.get(b"a", 20)?, Err(KeyError::Locked(_))));

    let status = mvcc.check_txn_status(b"a", 10, 12, 20, false)?;
    assert_eq!(
        status,
        Ok(TxnStatus { lock_ttl: 100, commit_version: 0, action: TxnAction::MinCommitTsPushed })
    );
    // The reader at 20 is no longer blocked, and the txn can't commit below 21.
    assert_eq!(mvcc.get(b"a", 20)?, Ok(None));
    assert!(matches!(mvcc.commit(&keys(&[b"a"]), 10, 20)?, Err(KeyError::Abort(_))));

    // Pushing to a lower ts does nothing.
    let status = mvcc.check_txn_status(b"a", 10, 12, 15, false)?;
    assert_eq!(status.map(|s| s.action), Ok(TxnAction::NoAction));
    Ok(())
}

#[test]
fn check_txn_status_without_lock() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 15)?;
    let status = mvcc.check_txn_status(b"a", 10, 100, 0, false)?;
    assert_eq!(status, Ok(TxnStatus { lock_ttl: 0, commit_version: 15, action: TxnAction::NoAction }));

    assert_eq!(mvcc.check_txn_status(b"b", 10, 100, 0, false)?, Err(KeyError::Abort("txn not found".into())));
    let status = mvcc.check_txn_status(b"b", 10, 100, 0, true)?;
    assert_eq!(status.map(|s| s.action), Ok(TxnAction::LockNotExistRollback));
    let errors = mvcc.prewrite(&[put(b"b", b"1")], b"b", 10, 100, 0)?;
    assert!(matches!(errors.as_slice(), [KeyError::WriteConflict { .. }]));
    Ok(())
}

#[test]
fn reads_skip_rollbacks_and_locks() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 15)?;
    mvcc.prewrite(&[Mutation::Lock { key: b"a".to_vec() }], b"a", 20, 100, 0)?;
    // Lock-only locks don't block reads.
    assert_eq!(mvcc.get(b"a", 30)?, Ok(Some(b"1".to_vec())));
    mvcc.commit(&keys(&[b"a"]), 20, 25)?;
    mvcc.batch_rollback(&keys(&[b"a"]), 30)?;
    assert_eq!(mvcc.get(b"a", 40)?, Ok(Some(b"1".to_vec())));

    // Deletes hide older values.
    mvcc.prewrite(&[Mutation::Delete { key: b"a".to_vec() }], b"a", 50, 100, 0)?;
    mvcc.commit(&keys(&[b"a"]), 50, 55)?;
    assert_eq!(mvcc.get(b"a", 60)?, Ok(None));
    assert_eq!(mvcc.get(b"a", 54)?, Ok(Some(b"1".to_vec())));
    Ok(())
}

#[test]
fn check_lock_only_blocks_older_locks() -> Result<()> {
    let mvcc = setup();
    mvcc.prewrite(&[put(b"a", b"1")], b"a", 10, 100, 0)?;
    assert_eq!(mvcc.reader().check_lock(b"a", 9)?, Ok(()));
    assert!(matches!(mvcc.reader().check_lock(b"a", 10)?, Err(KeyError::Locked(_))));
    Ok(())
}

#[test]
fn scan() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 11)?;
    write(&mvcc, b"b", b"2", 10, 11)?;
    write(&mvcc, b"c", b"old", 10, 11)?;
    write(&mvcc, b"c", b"new", 20, 21)?;
    mvcc.prewrite(&[Mutation::Delete { key: b"b".to_vec() }], b"b", 30, 100, 0)?;
    mvcc.commit(&keys(&[b"b"]), 30, 31)?;
    mvcc.prewrite(&[put(b"d", b"4")], b"d", 40, 100, 0)?;

    let pairs = |pairs: Vec<KvPair>| -> Vec<(Vec<u8>, KeyResult<Vec<u8>>)> {
        pairs.into_iter().map(|p| (p.key, p.value.map(|v| v.into_vec()))).collect()
    };

    let result = pairs(mvcc.scan(key_range(b"", b""), 0, 25, false)?);
    assert_eq!(
        result,
        vec![
            (b"a".to_vec(), Ok(b"1".to_vec())),
            (b"b".to_vec(), Ok(b"2".to_vec())),
            (b"c".to_vec(), Ok(b"new".to_vec())),
        ]
    );

    let result = pairs(mvcc.scan(key_range(b"", b""), 0, 50, true)?);
    assert_eq!(result.len(), 3);
    assert_eq!(result[0], (b"a".to_vec(), Ok(vec![])));
    assert_eq!(result[1], (b"c".to_vec(), Ok(vec![])));
    assert!(matches!(&result[2], (key, Err(KeyError::Locked(_))) if key == b"d"));

    let result = pairs(mvcc.scan(key_range(b"b", b"d"), 1, 15, false)?);
    assert_eq!(result, vec![(b"b".to_vec(), Ok(b"2".to_vec()))]);
    Ok(())
}

#[test]
fn batch_get() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 11)?;
    mvcc.prewrite(&[put(b"b", b"2")], b"b", 12, 100, 0)?;
    let pairs = mvcc.batch_get(&keys(&[b"a", b"b", b"c"]), 20)?;
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0], KvPair { key: b"a".to_vec(), value: Ok(b"1".to_vec().into()) });
    assert!(matches!(&pairs[1].value, Err(KeyError::Locked(info)) if info.key == b"b"));
    Ok(())
}

/// A rolled-back transaction leaves a Rollback record at its start
/// timestamp. Reads above it still see the older committed value.
#[test]
fn rollback_does_not_hide_older_writes() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 11)?;
    assert_eq!(mvcc.prewrite(&[put(b"a", b"2")], b"a", 20, 100, 0)?, vec![]);
    assert_eq!(mvcc.batch_rollback(&keys(&[b"a"]), 20)?, Ok(()));

    let reader = mvcc.reader();
    assert_eq!(reader.seek_write(b"a", 30)?.map(|(ts, w)| (ts, w.kind)), Some((20, WriteKind::Rollback)));
    assert_eq!(reader.get_value(b"a", 30)?, Some(b"1".to_vec()));
    assert_eq!(mvcc.get(b"a", 30)?, Ok(Some(b"1".to_vec())));

    // A key with only a rollback has no value.
    assert_eq!(mvcc.prewrite(&[put(b"b", b"1")], b"b", 40, 100, 0)?, vec![]);
    assert_eq!(mvcc.batch_rollback(&keys(&[b"b"]), 40)?, Ok(()));
    assert_eq!(reader.get_value(b"b", 50)?, None);
    Ok(())
}

#[test]
fn scan_limit() -> Result<()> {
    let mvcc = setup();
    write(&mvcc, b"a", b"1", 10, 11)?;
    mvcc.prewrite(&[Mutation::Delete { key: b"a".to_vec() }], b"a", 12, 100, 0)?;
    mvcc.commit(&keys(&[b"a"]), 12, 13)?;
    write(&mvcc, b"b", b"2", 10, 11)?;
    mvcc.prewrite(&[put(b"c", b"3")], b"c", 14, 100, 0)?;
    write(&mvcc, b"d", b"4", 10, 11)?;
    write(&mvcc, b"e", b"5", 10, 11)?;

    let scan = |start: &[u8], limit| -> Result<Vec<Vec<u8>>> {
        Ok(mvcc.scan(key_range(start, b""), limit, 20, false)?.into_iter().map(|p| p.key).collect())
    };
    assert_eq!(scan(b"", 0)?, keys(&[b"b", b"c", b"d", b"e"]));
    assert_eq!(scan(b"", 1)?, keys(&[b"b"]));
    assert_eq!(scan(b"", 2)?, keys(&[b"b", b"c"]));
    assert_eq!(scan(b"c", 2)?, keys(&[b"c", b"d"]));
    assert_eq!(scan(b"", 10)?, keys(&[b"b", b"c", b"d", b"e"]));

    // A lock with no writes below it sorts among the written keys.
    mvcc.prewrite(&[put(b"bb", b"x")], b"bb", 15, 100, 0)?;
    assert_eq!(scan(b"", 3)?, keys(&[b"b", b"bb", b"c"]));
    Ok(())
}
