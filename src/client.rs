use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::mvcc::{KeyError, KeyResult, KvPair, LockInfo, Mutation, TxnAction, TxnStatus};
use crate::region::{PeerId, RegionMeta, StoreId};
use crate::service::{Context, KvResponse, Request, Response, Route, StoreStatus};
use crate::store::{RegionError, TSO_LOGICAL_BITS};
use crate::{errdata, errinput};

use log::{debug, warn};
use rand::Rng as _;
use serde_bytes::ByteBuf;
use std::collections::btree_map::BTreeMap;
use std::collections::hash_map::{Entry, HashMap};
use std::io::{BufReader, BufWriter, Write as _};
use std::net::TcpStream;
use std::ops::Bound;
use std::time::Duration;

/// The maximum number of attempts for a request that keeps failing with
/// region errors, lock conflicts or transient errors.
const MAX_ATTEMPTS: usize = 20;

/// The initial and maximum retry backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// The default transaction lock TTL: 3 seconds, in timestamp units.
pub const DEFAULT_LOCK_TTL: u64 = 3000 << TSO_LOGICAL_BITS;

/// A client connection to a store.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn connect(addr: &str) -> Result<Self> {
        let socket = TcpStream::connect(addr)?;
        socket.set_nodelay(true)?;
        Ok(Self { reader: BufReader::new(socket.try_clone()?), writer: BufWriter::new(socket) })
    }

    fn call(&mut self, request: &Request) -> Result<Response> {
        request.encode_into(&mut self.writer)?;
        self.writer.flush()?;
        match <Result<Response>>::maybe_decode_from(&mut self.reader)? {
            Some(response) => response,
            None => Err(Error::IO("server closed the connection".into())),
        }
    }
}

/// A regionkv client. Routes requests to region leaders using a region
/// cache, which is refreshed from the stores on region errors, and resolves
/// the locks of other transactions that block its reads and writes.
///
/// Timestamps are allocated by the first store (by ID), so all clients of a
/// cluster must be given the same store set.
pub struct Client {
    addrs: BTreeMap<StoreId, String>,
    conns: HashMap<StoreId, Connection>,
    /// Cached regions by start key, with their last known leader.
    regions: BTreeMap<Vec<u8>, Route>,
}

impl Client {
    /// Creates a client for a cluster with the given store addresses.
    /// Connections are established on demand.
    pub fn new(addrs: HashMap<StoreId, String>) -> Result<Self> {
        if addrs.is_empty() {
            return errinput!("no store addresses given");
        }
        Ok(Self { addrs: addrs.into_iter().collect(), conns: HashMap::new(), regions: BTreeMap::new() })
    }

    /// Calls a store. Connection errors drop the connection, and the next
    /// call reconnects.
    fn call(&mut self, store_id: StoreId, request: Request) -> Result<Response> {
        let Some(addr) = self.addrs.get(&store_id) else {
            return errinput!("unknown store {store_id}");
        };
        let conn = match self.conns.entry(store_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Connection::connect(addr)?),
        };
        let result = conn.call(&request);
        if let Err(Error::IO(err)) = &result {
            debug!("Dropping connection to store {store_id}: {err}");
            self.conns.remove(&store_id);
        }
        result
    }

    /// Sleeps for a jittered, exponentially increasing backoff.
    fn backoff(attempt: usize) {
        let max = BACKOFF_BASE.saturating_mul(1 << attempt.min(6)).min(BACKOFF_MAX).as_millis() as u64;
        let delay = rand::thread_rng().gen_range(max / 2..=max);
        std::thread::sleep(Duration::from_millis(delay));
    }

    /// Returns whether an error may go away when retrying, possibly on
    /// another store.
    fn is_transient(err: &Error) -> bool {
        err.is_retryable() || matches!(err, Error::IO(_))
    }

    /// Allocates a timestamp.
    pub fn tso(&mut self) -> Result<u64> {
        let Some(store_id) = self.addrs.keys().next().copied() else {
            return errinput!("no stores");
        };
        match self.call(store_id, Request::Tso)? {
            Response::Tso(ts) => Ok(ts),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Returns a store's status.
    pub fn status(&mut self, store_id: StoreId) -> Result<StoreStatus> {
        match self.call(store_id, Request::Status)? {
            Response::Status(status) => Ok(status),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Returns the region containing the key and its known leader, from the
    /// cache or else the stores. If stores disagree, the region with the
    /// newest epoch wins.
    pub fn locate(&mut self, key: &[u8]) -> Result<Route> {
        if let Some(route) = self.cached(key) {
            return Ok(route.clone());
        }
        let mut best: Option<Route> = None;
        let store_ids: Vec<StoreId> = self.addrs.keys().copied().collect();
        for store_id in store_ids {
            let route = match self.call(store_id, Request::Route(key.to_vec())) {
                Ok(Response::Route(Some(route))) => route,
                Ok(Response::Route(None)) => continue,
                Ok(response) => return errdata!("unexpected response {response:?}"),
                Err(err) => {
                    debug!("Failed to route key on store {store_id}: {err}");
                    continue;
                }
            };
            let newer = match &best {
                None => true,
                Some(best) => {
                    let (epoch, best_epoch) = (route.region.epoch, best.region.epoch);
                    best_epoch.is_stale(&epoch) || (epoch == best_epoch && best.leader.is_none())
                }
            };
            if newer {
                best = Some(route);
            }
        }
        // Possibly a split or merge in progress.
        let Some(route) = best else {
            debug!("No store has a region for key {}", key.escape_ascii());
            return Err(Error::Abort);
        };
        self.cache(route.clone());
        Ok(route)
    }

    /// Returns the cached region containing the key, if any.
    fn cached(&self, key: &[u8]) -> Option<&Route> {
        let (_, route) = self.regions.range::<[u8], _>((Bound::Unbounded, Bound::Included(key))).next_back()?;
        route.region.contains(key).then_some(route)
    }

    /// Caches a region, evicting any cached regions it overlaps.
    fn cache(&mut self, route: Route) {
        let region = &route.region;
        let overlaps = |other: &RegionMeta| {
            (region.end_key.is_empty() || other.start_key < region.end_key)
                && (other.end_key.is_empty() || other.end_key > region.start_key)
        };
        self.regions.retain(|_, cached| cached.region.id != region.id && !overlaps(&cached.region));
        self.regions.insert(region.start_key.clone(), route);
    }

    /// Evicts a region from the cache.
    fn evict(&mut self, region_id: u64) {
        self.regions.retain(|_, cached| cached.region.id != region_id);
    }

    /// Updates the region cache from a region error.
    fn on_region_error(&mut self, err: RegionError) {
        debug!("Region error: {err}");
        match err {
            RegionError::NotLeader { region_id, leader } => {
                match self.regions.values_mut().find(|route| route.region.id == region_id) {
                    Some(route) => route.leader = leader,
                    None => self.evict(region_id),
                }
            }
            RegionError::EpochNotMatch { current_regions } => {
                for region in current_regions.into_iter().filter(|r| !r.peers.is_empty()) {
                    let stale = self.regions.values().any(|r| r.region.id == region.id && region.epoch.is_stale(&r.region.epoch));
                    if !stale {
                        self.cache(Route { region, leader: None });
                    }
                }
            }
            RegionError::RegionNotFound { region_id } => self.evict(region_id),
        }
    }

    /// Sends a request to a region's leader, or a random replica if the
    /// leader is unknown.
    fn send(&mut self, route: &Route, request: Request) -> Result<Response> {
        let store_id = match (route.leader, route.region.peers.len()) {
            (Some(leader), _) => leader.store_id,
            (None, 0) => return errdata!("region {} has no peers", route.region.id),
            (None, n) => route.region.peers[rand::thread_rng().gen_range(0..n)].store_id,
        };
        self.call(store_id, request)
    }

    /// Groups keys by their regions.
    fn group(&mut self, keys: &[Vec<u8>]) -> Result<Vec<(Route, Vec<Vec<u8>>)>> {
        let mut groups: Vec<(Route, Vec<Vec<u8>>)> = Vec::new();
        for key in keys {
            let route = self.locate(key)?;
            match groups.iter_mut().find(|(r, _)| r.region.id == route.region.id) {
                Some((_, keys)) => keys.push(key.clone()),
                None => groups.push((route, vec![key.clone()])),
            }
        }
        Ok(groups)
    }

    /// Sends a request per region for the given keys, built from the
    /// region's context and its keys. Keys hit by region errors or transient
    /// failures are regrouped and retried. Returns the responses of all
    /// groups.
    fn on_keys<T>(
        &mut self,
        keys: Vec<Vec<u8>>,
        build: impl Fn(Context, Vec<Vec<u8>>) -> Request,
        extract: fn(Response) -> Option<KvResponse<T>>,
    ) -> Result<Vec<T>> {
        let mut results = Vec::new();
        let mut pending = keys;
        let mut attempt = 0;
        loop {
            let mut retry = Vec::new();
            match self.group(&pending) {
                Ok(groups) => {
                    for (route, keys) in groups {
                        let request = build(Context::new(&route.region), keys.clone());
                        let result = self.send(&route, request).and_then(|response| match extract(response) {
                            Some(response) => response.into_result(),
                            None => errdata!("unexpected response for region {}", route.region.id),
                        });
                        match result {
                            Ok(Ok(payload)) => results.push(payload),
                            Ok(Err(err)) => {
                                self.on_region_error(err);
                                retry.extend(keys);
                            }
                            Err(err) if Self::is_transient(&err) => {
                                debug!("Request to region {} failed: {err}", route.region.id);
                                self.evict(route.region.id);
                                retry.extend(keys);
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
                Err(err) if Self::is_transient(&err) => retry = std::mem::take(&mut pending),
                Err(err) => return Err(err),
            }
            if retry.is_empty() {
                return Ok(results);
            }
            attempt += 1;
            if attempt >= MAX_ATTEMPTS {
                return Err(Error::Timeout);
            }
            Self::backoff(attempt);
            pending = retry;
        }
    }

    /// Sends a request to the region containing the key.
    fn on_key<T>(
        &mut self,
        key: &[u8],
        build: impl Fn(Context) -> Request,
        extract: fn(Response) -> Option<KvResponse<T>>,
    ) -> Result<T> {
        match self.on_keys(vec![key.to_vec()], |ctx, _| build(ctx), extract)?.pop() {
            Some(payload) => Ok(payload),
            None => errdata!("no response for key {}", key.escape_ascii()),
        }
    }

    /// Resolves a lock held by another transaction, by checking the status
    /// of its primary key and committing or rolling back the lock if the
    /// transaction is done. Readers pass their read timestamp as the caller
    /// timestamp, pushing the lock's min commit timestamp past it. Returns
    /// true if the caller may retry immediately.
    fn resolve_lock(&mut self, lock: &LockInfo, caller_start_ts: u64) -> Result<bool> {
        let current_ts = self.tso()?;
        let status = self.on_key(
            &lock.primary,
            |ctx| Request::KvCheckTxnStatus {
                ctx,
                primary: lock.primary.clone(),
                lock_ts: lock.ts,
                current_ts,
                caller_start_ts,
                rollback_if_not_exist: true,
            },
            |response| match response {
                Response::KvCheckTxnStatus(response) => Some(response),
                _ => None,
            },
        )?;
        let status: TxnStatus = match status {
            Ok(status) => status,
            Err(err) => {
                warn!("Failed to check status of txn {}: {err}", lock.ts);
                return Ok(false);
            }
        };
        // A pushed primary no longer blocks the reader. Secondaries aren't
        // pushed, so their readers wait for the lock to go away.
        if status.lock_ttl > 0 {
            let pushed = status.action == TxnAction::MinCommitTsPushed && lock.key == lock.primary;
            return Ok(pushed && caller_start_ts > 0);
        }
        debug!("Resolving lock on {} of txn {} at {}", lock.key.escape_ascii(), lock.ts, status.commit_version);
        let result = self.on_key(
            &lock.key,
            |ctx| Request::KvResolveLock {
                ctx,
                keys: vec![ByteBuf::from(lock.key.clone())],
                start_version: lock.ts,
                commit_version: status.commit_version,
            },
            |response| match response {
                Response::KvResolveLock(response) => Some(response),
                _ => None,
            },
        )?;
        if let Err(err) = result {
            warn!("Failed to resolve lock on {}: {err}", lock.key.escape_ascii());
        }
        Ok(true)
    }

    /// Reads a key at the given version, resolving blocking locks.
    pub fn get(&mut self, key: &[u8], version: u64) -> Result<Option<Vec<u8>>> {
        for attempt in 0..MAX_ATTEMPTS {
            let result = self.on_key(
                key,
                |ctx| Request::KvGet { ctx, key: key.to_vec(), version },
                |response| match response {
                    Response::KvGet(response) => Some(response),
                    _ => None,
                },
            )?;
            match result {
                Ok(value) => return Ok(value.map(ByteBuf::into_vec)),
                Err(KeyError::Locked(lock)) => {
                    if !self.resolve_lock(&lock, version)? {
                        Self::backoff(attempt);
                    }
                }
                Err(err) => return errdata!("read failed: {err}"),
            }
        }
        Err(Error::Timeout)
    }

    /// Reads multiple keys at the given version, across regions. Missing
    /// keys are omitted. Returns pairs in key order.
    pub fn batch_get(&mut self, keys: Vec<Vec<u8>>, version: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut found = BTreeMap::new();
        let mut pending = keys;
        for attempt in 0..MAX_ATTEMPTS {
            let pairs: Vec<KvPair> = self
                .on_keys(
                    pending,
                    |ctx, keys| Request::KvBatchGet {
                        ctx,
                        keys: keys.into_iter().map(ByteBuf::from).collect(),
                        version,
                    },
                    |response| match response {
                        Response::KvBatchGet(response) => Some(response),
                        _ => None,
                    },
                )?
                .into_iter()
                .flatten()
                .collect();
            pending = Vec::new();
            let mut blocked = false;
            for KvPair { key, value } in pairs {
                match value {
                    Ok(value) => {
                        found.insert(key, value.into_vec());
                    }
                    Err(KeyError::Locked(lock)) => {
                        blocked |= !self.resolve_lock(&lock, version)?;
                        pending.push(key);
                    }
                    Err(err) => return errdata!("read failed: {err}"),
                }
            }
            if pending.is_empty() {
                return Ok(found.into_iter().collect());
            }
            if blocked {
                Self::backoff(attempt);
            }
        }
        Err(Error::Timeout)
    }

    /// Scans [start, end) at the given version across regions, returning at
    /// most limit pairs (0 for no limit). An empty end is unbounded.
    pub fn scan(&mut self, start: &[u8], end: &[u8], limit: usize, version: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut results = Vec::new();
        let mut cursor = start.to_vec();
        let mut attempt = 0;
        loop {
            let remaining = match limit {
                0 => 0,
                limit => limit - results.len(),
            };
            let pairs = self.on_key(
                &cursor,
                |ctx| Request::KvScan {
                    ctx,
                    start_key: cursor.clone(),
                    end_key: end.to_vec(),
                    limit: remaining,
                    version,
                    key_only: false,
                },
                |response| match response {
                    Response::KvScan(response) => Some(response),
                    _ => None,
                },
            )?;
            let mut locked = None;
            for KvPair { key, value } in pairs {
                match value {
                    Ok(value) => results.push((key, value.into_vec())),
                    Err(KeyError::Locked(lock)) => {
                        locked = Some(lock);
                        break;
                    }
                    Err(err) => return errdata!("scan failed: {err}"),
                }
            }
            // Resume from the locked key once it's resolved.
            if let Some(lock) = locked {
                cursor = lock.key.clone();
                if !self.resolve_lock(&lock, version)? {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(Error::Timeout);
                    }
                    Self::backoff(attempt);
                }
                continue;
            }
            if limit > 0 && results.len() >= limit {
                return Ok(results);
            }
            let region = self.locate(&cursor)?.region;
            if region.end_key.is_empty() || (!end.is_empty() && region.end_key.as_slice() >= end) {
                return Ok(results);
            }
            cursor = region.end_key;
        }
    }

    /// Writes a raw key, bypassing transactions. An empty value deletes it.
    pub fn raw_put(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.on_key(
            key,
            |_| Request::RawPut { key: key.to_vec(), value: value.clone() },
            |response| match response {
                Response::RawPut(response) => Some(response),
                _ => None,
            },
        )
    }

    /// Reads a raw key from the leader of its region.
    pub fn raw_get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        for attempt in 0..MAX_ATTEMPTS {
            let route = self.locate(key)?;
            match self.send(&route, Request::RawGet { key: key.to_vec() }) {
                Ok(Response::RawGet(value)) => return Ok(value.map(ByteBuf::into_vec)),
                Ok(response) => return errdata!("unexpected response {response:?}"),
                Err(err) if Self::is_transient(&err) => {
                    self.evict(route.region.id);
                    Self::backoff(attempt);
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::Timeout)
    }

    /// Begins a transaction at a new start timestamp.
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        let start_ts = self.tso()?;
        debug!("Began txn {start_ts}");
        Ok(Transaction { client: self, start_ts, lock_ttl: DEFAULT_LOCK_TTL, writes: BTreeMap::new() })
    }

    /// Splits the region containing the key at the key. Returns the parent
    /// and the new child region.
    pub fn split(&mut self, split_key: &[u8]) -> Result<Vec<RegionMeta>> {
        let regions = self.on_key(
            split_key,
            |ctx| Request::Split { region_id: ctx.region_id, split_key: split_key.to_vec() },
            |response| match response {
                Response::Split(response) => Some(response),
                _ => None,
            },
        )?;
        for region in &regions {
            self.cache(Route { region: region.clone(), leader: None });
        }
        Ok(regions)
    }

    /// Merges the region containing source_key into the adjacent region
    /// containing target_key.
    pub fn merge(&mut self, target_key: &[u8], source_key: &[u8]) -> Result<RegionMeta> {
        let source = self.locate(source_key)?.region;
        let merged = self.on_key(
            target_key,
            |ctx| Request::Merge { target_region_id: ctx.region_id, source_region_id: source.id },
            |response| match response {
                Response::Merge(response) => Some(response),
                _ => None,
            },
        )?;
        self.evict(source.id);
        self.cache(Route { region: merged.clone(), leader: None });
        Ok(merged)
    }

    /// Adds a replica of the region containing the key on the given store.
    pub fn add_peer(&mut self, key: &[u8], store_id: StoreId) -> Result<RegionMeta> {
        let region = self.on_key(
            key,
            |ctx| Request::AddPeer { region_id: ctx.region_id, store_id },
            |response| match response {
                Response::AddPeer(response) => Some(response),
                _ => None,
            },
        )?;
        self.evict(region.id);
        Ok(region)
    }

    /// Removes a replica of the region containing the key.
    pub fn remove_peer(&mut self, key: &[u8], peer_id: PeerId) -> Result<RegionMeta> {
        let region = self.on_key(
            key,
            |ctx| Request::RemovePeer { region_id: ctx.region_id, peer_id },
            |response| match response {
                Response::RemovePeer(response) => Some(response),
                _ => None,
            },
        )?;
        self.evict(region.id);
        Ok(region)
    }

    /// Transfers leadership of the region containing the key.
    pub fn transfer_leader(&mut self, key: &[u8], peer_id: PeerId) -> Result<()> {
        self.on_key(
            key,
            |ctx| Request::TransferLeader { region_id: ctx.region_id, peer_id },
            |response| match response {
                Response::TransferLeader(response) => Some(response),
                _ => None,
            },
        )
    }
}

/// A client transaction. Writes are buffered, and written atomically on
/// commit with a two-phase commit: all keys are prewritten (the primary key
/// first), then the primary is committed at a new commit timestamp, which
/// commits the transaction, and then the secondaries are committed.
/// Secondaries that fail to commit are resolved by later readers.
///
/// Reads see the transaction's own writes, and otherwise a snapshot at the
/// start timestamp.
pub struct Transaction<'a> {
    client: &'a mut Client,
    start_ts: u64,
    lock_ttl: u64,
    /// Buffered writes. None is a delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Transaction<'_> {
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    /// Sets the lock TTL, in timestamp units.
    pub fn set_lock_ttl(&mut self, lock_ttl: u64) {
        self.lock_ttl = lock_ttl;
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(write) = self.writes.get(key) {
            return Ok(write.clone());
        }
        self.client.get(key, self.start_ts)
    }

    pub fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.writes.insert(key.to_vec(), Some(value));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    /// Commits the transaction, returning the commit timestamp, or a key
    /// error if it conflicted with another transaction and was rolled back.
    /// Read-only transactions commit at their start timestamp.
    pub fn commit(self) -> Result<KeyResult<u64>> {
        let (start_ts, lock_ttl) = (self.start_ts, self.lock_ttl);
        let mutations: BTreeMap<Vec<u8>, Mutation> = self
            .writes
            .into_iter()
            .map(|(key, value)| {
                let mutation = match value {
                    Some(value) => Mutation::Put { key: key.clone(), value },
                    None => Mutation::Delete { key: key.clone() },
                };
                (key, mutation)
            })
            .collect();
        let Some(primary) = mutations.keys().next().cloned() else {
            return Ok(Ok(start_ts));
        };
        let secondaries: Vec<Vec<u8>> = mutations.keys().skip(1).cloned().collect();
        let client = self.client;

        for keys in [vec![primary.clone()], secondaries.clone()] {
            if keys.is_empty() {
                continue;
            }
            if let Err(err) = Self::prewrite(client, keys, &mutations, &primary, start_ts, lock_ttl)? {
                debug!("Txn {start_ts} prewrite failed: {err}");
                Self::rollback_keys(client, mutations.keys().cloned().collect(), start_ts)?;
                return Ok(Err(err));
            }
        }

        let commit_ts = client.tso()?;
        let commit = |ctx: Context, keys: Vec<Vec<u8>>| Request::KvCommit {
            ctx,
            keys: keys.into_iter().map(ByteBuf::from).collect(),
            start_version: start_ts,
            commit_version: commit_ts,
        };
        let extract = |response: Response| match response {
            Response::KvCommit(response) => Some(response),
            _ => None,
        };
        if let Err(err) = client.on_key(&primary, |ctx| commit(ctx, vec![primary.clone()]), extract)? {
            debug!("Txn {start_ts} primary commit failed: {err}");
            return Ok(Err(err));
        }
        if !secondaries.is_empty() {
            match client.on_keys(secondaries, commit, extract) {
                Ok(results) => {
                    for err in results.into_iter().filter_map(|r| r.err()) {
                        warn!("Txn {start_ts} secondary commit failed: {err}");
                    }
                }
                Err(err) => warn!("Txn {start_ts} secondary commit failed: {err}"),
            }
        }
        debug!("Committed txn {start_ts} at {commit_ts}");
        Ok(Ok(commit_ts))
    }

    /// Prewrites the given keys, resolving locks of other transactions.
    fn prewrite(
        client: &mut Client,
        keys: Vec<Vec<u8>>,
        mutations: &BTreeMap<Vec<u8>, Mutation>,
        primary: &[u8],
        start_ts: u64,
        lock_ttl: u64,
    ) -> Result<KeyResult<()>> {
        for attempt in 0..MAX_ATTEMPTS {
            let errors: Vec<KeyError> = client
                .on_keys(
                    keys.clone(),
                    |ctx, keys| Request::KvPrewrite {
                        ctx,
                        mutations: keys.iter().filter_map(|key| mutations.get(key).cloned()).collect(),
                        primary: primary.to_vec(),
                        start_version: start_ts,
                        lock_ttl,
                        min_commit_ts: 0,
                    },
                    |response| match response {
                        Response::KvPrewrite(response) => Some(response),
                        _ => None,
                    },
                )?
                .into_iter()
                .flatten()
                .collect();
            if errors.is_empty() {
                return Ok(Ok(()));
            }
            let mut blocked = false;
            for err in errors {
                match err {
                    KeyError::Locked(lock) => blocked |= !client.resolve_lock(&lock, 0)?,
                    err => return Ok(Err(err)),
                }
            }
            if blocked {
                Client::backoff(attempt);
            }
        }
        Ok(Err(KeyError::Retryable(format!("txn {start_ts} kept conflicting with locks"))))
    }

    fn rollback_keys(client: &mut Client, keys: Vec<Vec<u8>>, start_ts: u64) -> Result<()> {
        let results = client.on_keys(
            keys,
            |ctx, keys| Request::KvBatchRollback {
                ctx,
                keys: keys.into_iter().map(ByteBuf::from).collect(),
                start_version: start_ts,
            },
            |response| match response {
                Response::KvBatchRollback(response) => Some(response),
                _ => None,
            },
        )?;
        for err in results.into_iter().filter_map(|r| r.err()) {
            warn!("Txn {start_ts} rollback failed: {err}");
        }
        Ok(())
    }

    /// Discards the transaction. Nothing has been written, so there is
    /// nothing to roll back.
    pub fn rollback(self) {
        debug!("Discarded txn {}", self.start_ts);
    }
}
