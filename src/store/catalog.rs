use crate::region::{RegionId, RegionMeta, RegionState};

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// The store's region catalog: metadata for all regions with a local peer,
/// plus tombstones of removed ones. Routable regions (initialized and not
/// tombstoned) are indexed by start key for key lookups.
#[derive(Debug, Default)]
pub struct Catalog {
    regions: HashMap<RegionId, RegionMeta>,
    by_start_key: BTreeMap<Vec<u8>, RegionId>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the region can serve keys: it has been initialized
    /// with peers and is not tombstoned.
    fn is_routable(region: &RegionMeta) -> bool {
        !region.peers.is_empty() && region.state != RegionState::Tombstone
    }

    /// Returns a region by ID.
    pub fn get(&self, id: RegionId) -> Option<&RegionMeta> {
        self.regions.get(&id)
    }

    /// Inserts or replaces a region, returning the previous version.
    pub fn insert(&mut self, region: RegionMeta) -> Option<RegionMeta> {
        let previous = self.remove(region.id);
        if Self::is_routable(&region) {
            // A stale region may still claim the start key, e.g. before its
            // own split or merge has been applied. The newer metadata wins.
            if let Some(other) = self.by_start_key.insert(region.start_key.clone(), region.id) {
                if other != region.id {
                    log::debug!("Region {} displaced region {other} from routing index", region.id);
                }
            }
        }
        self.regions.insert(region.id, region);
        previous
    }

    /// Removes a region, returning it.
    pub fn remove(&mut self, id: RegionId) -> Option<RegionMeta> {
        let region = self.regions.remove(&id)?;
        if self.by_start_key.get(&region.start_key) == Some(&id) {
            self.by_start_key.remove(&region.start_key);
        }
        Some(region)
    }

    /// Returns the routable region containing the key, if any.
    pub fn region_for_key(&self, key: &[u8]) -> Option<&RegionMeta> {
        let (_, id) = self.by_start_key.range::<[u8], _>((Bound::Unbounded, Bound::Included(key))).next_back()?;
        self.regions.get(id).filter(|region| region.contains(key))
    }

    /// Returns the routable regions overlapping the range [start, end), where
    /// an empty end is unbounded, in key order.
    pub fn regions_in_range(&self, start: &[u8], end: &[u8]) -> Vec<&RegionMeta> {
        let first = self.region_for_key(start).map(|r| r.start_key.clone()).unwrap_or_else(|| start.to_vec());
        self.by_start_key
            .range(first..)
            .take_while(|(key, _)| end.is_empty() || key.as_slice() < end)
            .filter_map(|(_, id)| self.regions.get(id))
            .collect()
    }

    /// Iterates over all regions, including tombstones.
    pub fn iter(&self) -> impl Iterator<Item = &RegionMeta> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::PeerMeta;

    fn region(id: RegionId, start: &[u8], end: &[u8]) -> RegionMeta {
        let mut region =
            RegionMeta::new(id, start.to_vec(), end.to_vec(), vec![PeerMeta { store_id: 1, peer_id: id }]);
        region.state = RegionState::Running;
        region
    }

    #[test]
    fn routing() {
        let mut catalog = Catalog::new();
        catalog.insert(region(1, b"", b"m"));
        catalog.insert(region(2, b"m", b""));

        assert_eq!(catalog.region_for_key(b"").map(|r| r.id), Some(1));
        assert_eq!(catalog.region_for_key(b"l\xff").map(|r| r.id), Some(1));
        assert_eq!(catalog.region_for_key(b"m").map(|r| r.id), Some(2));
        assert_eq!(catalog.region_for_key(b"zzz").map(|r| r.id), Some(2));

        let ids: Vec<_> = catalog.regions_in_range(b"c", b"n").iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        let ids: Vec<_> = catalog.regions_in_range(b"c", b"d").iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn gaps_and_tombstones() {
        let mut catalog = Catalog::new();
        catalog.insert(region(1, b"a", b"c"));
        let mut tombstone = region(2, b"c", b"e");
        tombstone.state = RegionState::Tombstone;
        catalog.insert(tombstone);
        // Uninitialized regions have no peers and are not routable.
        catalog.insert(RegionMeta::new(3, vec![], vec![], vec![]));

        assert_eq!(catalog.region_for_key(b"0"), None);
        assert_eq!(catalog.region_for_key(b"b").map(|r| r.id), Some(1));
        assert_eq!(catalog.region_for_key(b"d"), None);
        assert_eq!(catalog.len(), 3);
        assert!(catalog.get(2).is_some());
    }

    #[test]
    fn reinsert_moves_start_key() {
        let mut catalog = Catalog::new();
        catalog.insert(region(1, b"a", b"z"));
        // Merge into a region extending leftwards.
        catalog.insert(region(1, b"", b"z"));
        assert_eq!(catalog.region_for_key(b"").map(|r| r.id), Some(1));
        assert_eq!(catalog.region_for_key(b"b").map(|r| r.id), Some(1));
        assert_eq!(catalog.by_start_key.len(), 1);
        assert!(catalog.remove(1).is_some());
        assert_eq!(catalog.region_for_key(b"b"), None);
    }
}
