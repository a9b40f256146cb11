use super::testcluster::{wait_for, TestCluster};

use regionkv::error::Result;

use pretty_assertions::assert_eq;

/// A store that crashes after appending to its WAL, but before advancing
/// the manifest pointer, replays the WAL on restart without losing
/// committed writes.
#[test]
fn recover_unpointed_wal() -> Result<()> {
    let mut cluster = TestCluster::run(&[1])?;
    let mut client = cluster.client()?;
    let mut txn = client.begin()?;
    txn.set(b"a", b"1".to_vec());
    txn.commit()?.expect("txn failed");

    let peer = cluster.store(1).peer(1)?.expect("no peer");
    peer.fail_pointer_updates(true)?;
    let mut txn = client.begin()?;
    txn.set(b"b", b"2".to_vec());
    txn.set(b"c", b"3".to_vec());
    txn.commit()?.expect("txn failed");
    let status = peer.status()?;
    drop((client, peer));

    let store = cluster.restart(1)?;
    let peer = cluster.elect(1, 1)?;
    assert!(peer.status()?.applied_index >= status.last_index);
    assert!(peer.status()?.term > status.term);
    assert_eq!(store.regions()?.len(), 1);

    let mut client = cluster.client()?;
    let ts = client.tso()?;
    assert_eq!(
        client.scan(b"", b"", 0, ts)?,
        vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec()), (b"c".to_vec(), b"3".to_vec())]
    );
    Ok(())
}

/// A follower that restarts catches up on writes it missed.
#[test]
fn follower_restart() -> Result<()> {
    let mut cluster = TestCluster::run(&[1, 2, 3])?;
    cluster.stop(3)?;

    let mut client = cluster.client()?;
    let mut txn = client.begin()?;
    txn.set(b"a", b"1".to_vec());
    txn.commit()?.expect("txn failed");
    let leader = cluster.store(1).peer(1)?.expect("no peer");
    let commit_index = leader.status()?.commit_index;

    cluster.open(3)?;
    let follower = cluster.store(3).peer(1)?.expect("no peer");
    wait_for(|| Ok(follower.status()?.applied_index >= commit_index))?;

    // Read through the restarted follower once it leads.
    cluster.elect(3, 1)?;
    let mut client = cluster.client()?;
    let ts = client.tso()?;
    assert_eq!(client.get(b"a", ts)?, Some(b"1".to_vec()));
    Ok(())
}
