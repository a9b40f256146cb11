use super::scheduler::Operation;
use crate::error::Result;
use crate::region::{PeerMeta, RegionId, RegionMeta, StoreId};

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// The number of logical bits in a TSO timestamp. The remaining high bits
/// hold the physical time in milliseconds.
pub const TSO_LOGICAL_BITS: u32 = 18;

/// A region heartbeat, sent by the region's leader (or on metadata changes,
/// without a leader).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionHeartbeat {
    pub region: RegionMeta,
    pub leader: Option<PeerMeta>,
    pub term: u64,
    pub applied_index: u64,
}

/// A store heartbeat, with per-store statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreHeartbeat {
    pub store_id: StoreId,
    pub region_count: usize,
    pub leader_count: usize,
    pub pending_proposals: usize,
}

/// The placement service (PD): allocates cluster-unique IDs and
/// timestamps, and collects heartbeats to plan scheduling operations.
pub trait Placement: Send + Sync {
    /// Allocates a cluster-unique ID, for regions and peers.
    fn alloc_id(&self) -> Result<u64>;

    /// Allocates a monotonically increasing timestamp.
    fn tso(&self) -> Result<u64>;

    fn region_heartbeat(&self, heartbeat: RegionHeartbeat) -> Result<()>;

    fn store_heartbeat(&self, heartbeat: StoreHeartbeat) -> Result<()>;

    /// Returns the operation planner, if the service schedules operations.
    fn planner(&self) -> Option<&dyn Planner> {
        None
    }
}

/// Plans scheduling operations for a store.
pub trait Planner: Send + Sync {
    fn plan(&self, store_id: StoreId) -> Result<Vec<Operation>>;
}

/// The cluster state known to the placement service.
#[derive(Clone, Debug, Default)]
pub struct ClusterView {
    pub regions: HashMap<RegionId, RegionHeartbeat>,
    pub stores: HashMap<StoreId, StoreHeartbeat>,
}

impl ClusterView {
    /// Returns the number of regions led by each known store.
    pub fn leader_counts(&self) -> HashMap<StoreId, usize> {
        let mut counts: HashMap<StoreId, usize> = self.stores.keys().map(|id| (*id, 0)).collect();
        for leader in self.regions.values().filter_map(|r| r.leader) {
            *counts.entry(leader.store_id).or_default() += 1;
        }
        counts
    }
}

/// A scheduling strategy, producing operations for a store from the cluster
/// view.
pub trait Strategy: Send + Sync {
    fn plan(&self, view: &ClusterView, store_id: StoreId) -> Vec<Operation>;
}

/// Moves leaders off a store that leads more than its share of regions, to
/// the follower on the least-loaded store.
#[derive(Clone, Copy, Debug, Default)]
pub struct LeaderBalance {
    /// The number of leaders a store may exceed the average by.
    pub tolerance: usize,
}

impl Strategy for LeaderBalance {
    fn plan(&self, view: &ClusterView, store_id: StoreId) -> Vec<Operation> {
        let counts = view.leader_counts();
        let total: usize = counts.values().sum();
        if counts.is_empty() || total == 0 {
            return Vec::new();
        }
        let average = total.div_ceil(counts.len());
        let local = counts.get(&store_id).copied().unwrap_or(0);
        if local <= average + self.tolerance {
            return Vec::new();
        }

        // Pick the led region whose least-loaded follower is least loaded.
        let mut regions: Vec<&RegionHeartbeat> = view
            .regions
            .values()
            .filter(|r| r.leader.is_some_and(|l| l.store_id == store_id))
            .collect();
        regions.sort_by_key(|r| r.region.id);
        let candidate = regions
            .into_iter()
            .filter_map(|r| {
                let leader = r.leader?;
                let target = r
                    .region
                    .peers
                    .iter()
                    .filter(|p| p.store_id != store_id)
                    .min_by_key(|p| (counts.get(&p.store_id).copied().unwrap_or(0), p.store_id))?;
                Some((counts.get(&target.store_id).copied().unwrap_or(0), r.region.id, leader, *target))
            })
            .min_by_key(|(load, id, _, _)| (*load, *id));

        match candidate {
            Some((load, region_id, source, target)) if load + 1 < local => {
                vec![Operation::TransferLeader { region_id, source: source.peer_id, target }]
            }
            _ => Vec::new(),
        }
    }
}

/// An in-process placement service, for single-process clusters and tests.
/// IDs are allocated from a per-instance range seeded by the given store
/// ID, so that separate instances don't collide.
pub struct LocalPlacement {
    next_id: AtomicU64,
    /// The last timestamp as (physical ms, logical).
    tso: Mutex<(u64, u64)>,
    view: Mutex<ClusterView>,
    strategy: Option<Arc<dyn Strategy>>,
}

impl LocalPlacement {
    /// The number of low ID bits allocated per instance.
    const ID_BITS: u32 = 40;

    pub fn new(seed: StoreId) -> Self {
        Self {
            next_id: AtomicU64::new((seed << Self::ID_BITS) + 1),
            tso: Mutex::new((0, 0)),
            view: Mutex::new(ClusterView::default()),
            strategy: None,
        }
    }

    /// Sets the scheduling strategy, enabling the planner.
    pub fn with_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Ensures future IDs are above the given ID, e.g. IDs recovered from
    /// a store's catalog after a restart.
    pub fn observe_id(&self, id: u64) {
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Returns a copy of the cluster view.
    pub fn view(&self) -> Result<ClusterView> {
        Ok(self.view.lock()?.clone())
    }
}

impl Placement for LocalPlacement {
    fn alloc_id(&self) -> Result<u64> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn tso(&self) -> Result<u64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
        let mut last = self.tso.lock()?;
        let (physical, logical) = match now > last.0 {
            true => (now, 0),
            false if last.1 + 1 < 1 << TSO_LOGICAL_BITS => (last.0, last.1 + 1),
            // Logical overflow: borrow from the next millisecond.
            false => (last.0 + 1, 0),
        };
        *last = (physical, logical);
        Ok(physical << TSO_LOGICAL_BITS | logical)
    }

    fn region_heartbeat(&self, mut heartbeat: RegionHeartbeat) -> Result<()> {
        let mut view = self.view.lock()?;
        if let Some(known) = view.regions.get(&heartbeat.region.id) {
            if heartbeat.region.epoch.is_stale(&known.region.epoch) {
                debug!("Ignoring stale heartbeat for {}", heartbeat.region);
                return Ok(());
            }
            // Metadata-only heartbeats keep the known leader, unless it left.
            if heartbeat.leader.is_none() {
                heartbeat.leader = known.leader.filter(|l| heartbeat.region.peer(l.peer_id).is_some());
                heartbeat.term = known.term;
            }
        }
        view.regions.insert(heartbeat.region.id, heartbeat);
        Ok(())
    }

    fn store_heartbeat(&self, heartbeat: StoreHeartbeat) -> Result<()> {
        self.view.lock()?.stores.insert(heartbeat.store_id, heartbeat);
        Ok(())
    }

    fn planner(&self) -> Option<&dyn Planner> {
        self.strategy.as_ref().map(|_| self as &dyn Planner)
    }
}

impl Planner for LocalPlacement {
    fn plan(&self, store_id: StoreId) -> Result<Vec<Operation>> {
        let Some(strategy) = &self.strategy else {
            return Ok(Vec::new());
        };
        let view = self.view.lock()?;
        Ok(strategy.plan(&view, store_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(id: RegionId, leader_store: StoreId, stores: &[StoreId]) -> RegionHeartbeat {
        let peers: Vec<PeerMeta> =
            stores.iter().map(|s| PeerMeta { store_id: *s, peer_id: id * 10 + s }).collect();
        let leader = peers.iter().find(|p| p.store_id == leader_store).copied();
        RegionHeartbeat { region: RegionMeta::new(id, vec![], vec![], peers), leader, term: 1, applied_index: 0 }
    }

    #[test]
    fn alloc_id_unique_and_seeded() -> Result<()> {
        let placement = LocalPlacement::new(2);
        let a = placement.alloc_id()?;
        let b = placement.alloc_id()?;
        assert!(b > a);
        assert_eq!(a >> LocalPlacement::ID_BITS, 2);

        placement.observe_id(a + 100);
        assert_eq!(placement.alloc_id()?, a + 101);
        Ok(())
    }

    #[test]
    fn tso_monotonic() -> Result<()> {
        let placement = LocalPlacement::new(1);
        let mut last = 0;
        for _ in 0..10_000 {
            let ts = placement.tso()?;
            assert!(ts > last, "{ts} <= {last}");
            last = ts;
        }
        Ok(())
    }

    #[test]
    fn stale_heartbeats_ignored() -> Result<()> {
        let placement = LocalPlacement::new(1);
        let mut hb = heartbeat(1, 1, &[1, 2]);
        hb.region.epoch.version = 3;
        placement.region_heartbeat(hb.clone())?;

        let mut stale = heartbeat(1, 2, &[1, 2]);
        stale.region.epoch.version = 2;
        placement.region_heartbeat(stale)?;
        assert_eq!(placement.view()?.regions[&1].leader, hb.leader);

        // Metadata-only heartbeats keep the leader.
        let mut meta = hb.clone();
        meta.leader = None;
        meta.region.epoch.version = 4;
        placement.region_heartbeat(meta)?;
        assert_eq!(placement.view()?.regions[&1].leader, hb.leader);
        Ok(())
    }

    #[test]
    fn leader_balance() -> Result<()> {
        let placement = LocalPlacement::new(1).with_strategy(Arc::new(LeaderBalance::default()));
        for store_id in 1..=3 {
            placement.store_heartbeat(StoreHeartbeat { store_id, ..Default::default() })?;
        }
        for id in 1..=3 {
            placement.region_heartbeat(heartbeat(id, 1, &[1, 2, 3]))?;
        }
        let planner = placement.planner().expect("no planner");
        assert_eq!(
            planner.plan(1)?,
            vec![Operation::TransferLeader {
                region_id: 1,
                source: 11,
                target: PeerMeta { store_id: 2, peer_id: 12 },
            }]
        );
        assert_eq!(planner.plan(2)?, vec![]);

        // Balanced clusters need nothing.
        placement.region_heartbeat(heartbeat(2, 2, &[1, 2, 3]))?;
        placement.region_heartbeat(heartbeat(3, 3, &[1, 2, 3]))?;
        assert_eq!(planner.plan(1)?, vec![]);

        assert!(LocalPlacement::new(1).planner().is_none());
        Ok(())
    }
}
