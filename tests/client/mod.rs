use super::testcluster::{wait_for, TestCluster};

use regionkv::client::DEFAULT_LOCK_TTL;
use regionkv::error::Result;
use regionkv::mvcc::{KeyError, Mutation};
use regionkv::service::{Context, KvService};
use regionkv::store::Store;

use pretty_assertions::assert_eq;
use serde_bytes::ByteBuf;

fn pairs(pairs: &[(&[u8], &[u8])]) -> Vec<(Vec<u8>, Vec<u8>)> {
    pairs.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect()
}

fn put(key: &[u8], value: &[u8]) -> Mutation {
    Mutation::Put { key: key.to_vec(), value: value.to_vec() }
}

/// Prewrites the mutations on the store's region 1, as a client that then
/// goes away would.
fn prewrite(store: &Store, mutations: Vec<Mutation>, primary: &[u8], start_ts: u64, ttl: u64) -> Result<()> {
    let region = store.region_meta_by_id(1)?.expect("no region");
    let service = KvService::new(store.clone());
    let errors = service
        .kv_prewrite(Context::new(&region), mutations, primary.to_vec(), start_ts, ttl, 0)?
        .into_result()?
        .expect("region error");
    assert_eq!(errors, vec![]);
    Ok(())
}

/// Commits the keys on the store's region 1.
fn commit(store: &Store, keys: &[&[u8]], start_ts: u64, commit_ts: u64) -> Result<std::result::Result<(), KeyError>> {
    let region = store.region_meta_by_id(1)?.expect("no region");
    let keys = keys.iter().map(|k| ByteBuf::from(k.to_vec())).collect();
    KvService::new(store.clone())
        .kv_commit(Context::new(&region), keys, start_ts, commit_ts)?
        .into_result()
        .map(|result| result.expect("region error"))
}

#[test]
fn transactions() -> Result<()> {
    let cluster = TestCluster::run(&[1, 2, 3])?;
    let mut client = cluster.client()?;

    let mut txn = client.begin()?;
    txn.set(b"a", b"1".to_vec());
    txn.set(b"b", b"2".to_vec());
    txn.set(b"c", b"3".to_vec());
    txn.delete(b"c");
    assert_eq!(txn.get(b"a")?, Some(b"1".to_vec()));
    assert_eq!(txn.get(b"c")?, None);
    let commit_ts = txn.commit()?.expect("txn failed");

    let ts = client.tso()?;
    assert!(ts > commit_ts);
    assert_eq!(client.get(b"a", ts)?, Some(b"1".to_vec()));
    assert_eq!(client.get(b"a", commit_ts - 1)?, None);
    assert_eq!(client.get(b"c", ts)?, None);
    assert_eq!(
        client.batch_get(vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()], ts)?,
        pairs(&[(b"a", b"1"), (b"b", b"2")])
    );
    assert_eq!(client.scan(b"", b"", 0, ts)?, pairs(&[(b"a", b"1"), (b"b", b"2")]));
    assert_eq!(client.scan(b"", b"", 1, ts)?, pairs(&[(b"a", b"1")]));
    assert_eq!(client.scan(b"b", b"", 0, ts)?, pairs(&[(b"b", b"2")]));

    // A transaction reads a snapshot as of its start.
    let mut other = cluster.client()?;
    let mut old = client.begin()?;
    let mut new = other.begin()?;
    new.set(b"a", b"x".to_vec());
    new.commit()?.expect("txn failed");
    assert_eq!(old.get(b"a")?, Some(b"1".to_vec()));
    old.rollback();

    let ts = client.tso()?;
    assert_eq!(client.get(b"a", ts)?, Some(b"x".to_vec()));

    // Read-only transactions commit at their start.
    let txn = client.begin()?;
    let start_ts = txn.start_ts();
    assert_eq!(txn.commit()?, Ok(start_ts));
    Ok(())
}

#[test]
fn write_conflict() -> Result<()> {
    let cluster = TestCluster::run(&[1, 2, 3])?;
    let (mut c1, mut c2) = (cluster.client()?, cluster.client()?);

    // The later transaction commits first, so the earlier one conflicts.
    let mut t1 = c1.begin()?;
    let mut t2 = c2.begin()?;
    let t1_start = t1.start_ts();
    t1.set(b"k", b"1".to_vec());
    t1.set(b"l", b"1".to_vec());
    t2.set(b"k", b"2".to_vec());
    let t2_commit = t2.commit()?.expect("txn failed");
    match t1.commit()? {
        Err(KeyError::WriteConflict { start_ts, conflict_commit_ts, .. }) => {
            assert_eq!(start_ts, t1_start);
            assert_eq!(conflict_commit_ts, t2_commit);
        }
        result => panic!("unexpected result {result:?}"),
    }

    // Nothing of t1 is visible, and its locks are gone.
    let ts = c1.tso()?;
    assert_eq!(c1.get(b"k", ts)?, Some(b"2".to_vec()));
    assert_eq!(c1.get(b"l", ts)?, None);
    let mut t3 = c1.begin()?;
    t3.set(b"l", b"3".to_vec());
    assert!(t3.commit()?.is_ok());
    Ok(())
}

#[test]
fn resolve_locks() -> Result<()> {
    let cluster = TestCluster::run(&[1, 2, 3])?;
    let store = cluster.store(1);
    let mut client = cluster.client()?;

    // A transaction dies after prewriting. Its expired locks are rolled
    // back by a reader, and it can no longer commit.
    let start_ts = client.tso()?;
    prewrite(store, vec![put(b"x", b"1"), put(b"y", b"1")], b"x", start_ts, 1)?;
    let ts = client.tso()?;
    assert_eq!(client.get(b"y", ts)?, None);
    assert_eq!(client.get(b"x", ts)?, None);
    let commit_ts = client.tso()?;
    assert!(matches!(commit(store, &[b"x"], start_ts, commit_ts)?, Err(KeyError::Abort(_))));

    // A transaction dies after committing its primary. A reader of a
    // secondary commits it.
    let start_ts = client.tso()?;
    prewrite(store, vec![put(b"x", b"2"), put(b"y", b"2")], b"x", start_ts, DEFAULT_LOCK_TTL)?;
    let commit_ts = client.tso()?;
    assert_eq!(commit(store, &[b"x"], start_ts, commit_ts)?, Ok(()));
    let ts = client.tso()?;
    assert_eq!(client.get(b"y", ts)?, Some(b"2".to_vec()));
    assert_eq!(client.scan(b"x", b"z", 0, ts)?, pairs(&[(b"x", b"2"), (b"y", b"2")]));

    // A live primary lock has its min commit ts pushed past the reader, so
    // the reader doesn't wait for it.
    let start_ts = client.tso()?;
    prewrite(store, vec![put(b"x", b"3")], b"x", start_ts, DEFAULT_LOCK_TTL)?;
    let ts = client.tso()?;
    assert_eq!(client.get(b"x", ts)?, Some(b"2".to_vec()));

    // A writer waits for an expired lock to be rolled back.
    let start_ts = client.tso()?;
    prewrite(store, vec![put(b"w", b"1")], b"w", start_ts, 1)?;
    let mut txn = client.begin()?;
    txn.set(b"w", b"2".to_vec());
    assert!(txn.commit()?.is_ok());
    let ts = client.tso()?;
    assert_eq!(client.get(b"w", ts)?, Some(b"2".to_vec()));
    Ok(())
}

#[test]
fn split_and_merge() -> Result<()> {
    let cluster = TestCluster::run(&[1, 2, 3])?;
    let mut client = cluster.client()?;

    let mut txn = client.begin()?;
    for key in [b"a", b"f", b"m", b"t", b"z"] {
        txn.set(key, key.to_vec());
    }
    txn.commit()?.expect("txn failed");

    let regions = client.split(b"m")?;
    assert_eq!(regions.len(), 2);
    let (parent, child) = (&regions[0], &regions[1]);
    assert_eq!(parent.id, 1);
    assert_eq!(parent.end_key, b"m".to_vec());
    assert_eq!(child.start_key, b"m".to_vec());
    assert_eq!(child.end_key, Vec::<u8>::new());
    assert_eq!(client.locate(b"l")?.region.id, parent.id);
    assert_eq!(client.locate(b"m")?.region.id, child.id);

    // Reads and writes span regions.
    let ts = client.tso()?;
    let all = pairs(&[(b"a", b"a"), (b"f", b"f"), (b"m", b"m"), (b"t", b"t"), (b"z", b"z")]);
    assert_eq!(client.scan(b"", b"", 0, ts)?, all);
    assert_eq!(client.scan(b"e", b"u", 3, ts)?, pairs(&[(b"f", b"f"), (b"m", b"m"), (b"t", b"t")]));
    assert_eq!(client.batch_get(vec![b"a".to_vec(), b"z".to_vec()], ts)?, pairs(&[(b"a", b"a"), (b"z", b"z")]));

    let mut txn = client.begin()?;
    txn.set(b"b", b"b".to_vec());
    txn.set(b"y", b"y".to_vec());
    txn.commit()?.expect("txn failed");

    // The split is replicated to all stores.
    wait_for(|| {
        for id in [1, 2, 3] {
            if cluster.store(id).region_meta_by_id(child.id)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    })?;

    let merged = client.merge(b"a", b"m")?;
    assert_eq!(merged.id, parent.id);
    assert_eq!((merged.start_key.as_slice(), merged.end_key.as_slice()), (&b""[..], &b""[..]));
    assert!(merged.epoch.version > parent.epoch.version);

    let ts = client.tso()?;
    assert_eq!(client.scan(b"", b"", 0, ts)?.len(), 7);
    assert_eq!(client.get(b"y", ts)?, Some(b"y".to_vec()));
    Ok(())
}

#[test]
fn membership_and_leadership() -> Result<()> {
    let mut cluster = TestCluster::run(&[1, 2, 3])?;
    let mut client = cluster.client()?;

    let mut txn = client.begin()?;
    txn.set(b"a", b"1".to_vec());
    txn.commit()?.expect("txn failed");

    // Move leadership to store 2, and read through it.
    client.transfer_leader(b"a", 2)?;
    let peer = cluster.store(2).peer(1)?.expect("no peer");
    wait_for(|| peer.is_leader())?;
    let ts = client.tso()?;
    assert_eq!(client.get(b"a", ts)?, Some(b"1".to_vec()));

    // Remove store 3's replica, and stop it. The region keeps going.
    let region = client.remove_peer(b"a", 3)?;
    assert_eq!(region.peers.len(), 2);
    assert!(region.peers.iter().all(|p| p.store_id != 3));
    wait_for(|| Ok(cluster.store(3).peer(1)?.is_none()))?;
    cluster.stop(3)?;

    let mut client = cluster.client()?;
    let mut txn = client.begin()?;
    txn.set(b"b", b"2".to_vec());
    txn.commit()?.expect("txn failed");
    let ts = client.tso()?;
    assert_eq!(client.scan(b"", b"", 0, ts)?, pairs(&[(b"a", b"1"), (b"b", b"2")]));
    Ok(())
}

#[test]
fn raw_and_status() -> Result<()> {
    let cluster = TestCluster::run(&[1, 2, 3])?;
    let mut client = cluster.client()?;

    assert_eq!(client.raw_get(b"r")?, None);
    client.raw_put(b"r", b"v".to_vec())?;
    assert_eq!(client.raw_get(b"r")?, Some(b"v".to_vec()));
    client.raw_put(b"r", Vec::new())?;
    assert_eq!(client.raw_get(b"r")?, None);

    let status = client.status(1)?;
    assert_eq!(status.store_id, 1);
    assert_eq!(status.regions.len(), 1);
    assert!(status.regions[0].is_leader);
    assert_eq!(status.pending_proposals, 0);

    let status = client.status(2)?;
    assert!(!status.regions[0].is_leader);
    assert_eq!(status.regions[0].leader.map(|l| l.store_id), Some(1));
    Ok(())
}
