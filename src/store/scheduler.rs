use crate::error::Result;
use crate::region::{PeerId, PeerMeta, RegionId};

use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A scheduling operation, planned by the placement service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Transfers region leadership from the source peer to the target.
    TransferLeader { region_id: RegionId, source: PeerId, target: PeerMeta },
}

/// An operation kind, for deduplication and cooldowns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    TransferLeader,
}

impl Operation {
    pub fn region_id(&self) -> RegionId {
        match self {
            Self::TransferLeader { region_id, .. } => *region_id,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::TransferLeader { .. } => OperationKind::TransferLeader,
        }
    }

    fn slot(&self) -> (RegionId, OperationKind) {
        (self.region_id(), self.kind())
    }
}

/// Queues scheduling operations and applies them at a bounded rate. The
/// queue is bounded and drops new operations when full. At most one
/// operation per (region, kind) is queued at a time, and after applying
/// one, further operations for the same (region, kind) are dropped until
/// the cooldown expires.
pub struct OperationScheduler {
    tx: Sender<Operation>,
    rx: Receiver<Operation>,
    burst: usize,
    cooldown: Duration,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    pending: HashSet<(RegionId, OperationKind)>,
    applied: HashMap<(RegionId, OperationKind), Instant>,
}

impl OperationScheduler {
    pub fn new(capacity: usize, burst: usize, cooldown: Duration) -> Self {
        let (tx, rx) = crossbeam::channel::bounded(capacity.max(1));
        Self { tx, rx, burst: burst.max(1), cooldown, state: Mutex::new(SchedulerState::default()) }
    }

    /// Queues an operation. Returns false if it was dropped, because an
    /// operation for the same region and kind is pending or cooling down,
    /// or the queue is full.
    pub fn submit(&self, operation: Operation) -> Result<bool> {
        let slot = operation.slot();
        let mut state = self.state.lock()?;
        if state.pending.contains(&slot) || self.cooling(&state, slot) {
            return Ok(false);
        }
        match self.tx.try_send(operation) {
            Ok(()) => {
                state.pending.insert(slot);
                Ok(true)
            }
            Err(TrySendError::Full(operation)) => {
                debug!("Operation queue full, dropping {operation:?}");
                Ok(false)
            }
            Err(err @ TrySendError::Disconnected(_)) => Err(err.into()),
        }
    }

    /// Returns whether the slot's last operation is within the cooldown.
    fn cooling(&self, state: &SchedulerState, slot: (RegionId, OperationKind)) -> bool {
        state.applied.get(&slot).is_some_and(|at| at.elapsed() < self.cooldown)
    }

    /// Applies up to burst queued operations with the given function,
    /// returning the number applied. Failed operations are logged and
    /// dropped.
    pub fn run(&self, mut apply: impl FnMut(&Operation) -> Result<()>) -> Result<usize> {
        let mut applied = 0;
        while applied < self.burst {
            let Ok(operation) = self.rx.try_recv() else {
                break;
            };
            let slot = operation.slot();
            {
                let mut state = self.state.lock()?;
                state.pending.remove(&slot);
                if self.cooling(&state, slot) {
                    continue;
                }
                let cooldown = self.cooldown;
                state.applied.retain(|_, at| at.elapsed() < cooldown);
                state.applied.insert(slot, Instant::now());
            }
            match apply(&operation) {
                Ok(()) => applied += 1,
                Err(err) => warn!("Operation {operation:?} failed: {err}"),
            }
        }
        Ok(applied)
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn transfer(region_id: RegionId) -> Operation {
        Operation::TransferLeader { region_id, source: 1, target: PeerMeta { store_id: 2, peer_id: 2 } }
    }

    #[test]
    fn dedup_and_capacity() -> Result<()> {
        let scheduler = OperationScheduler::new(2, 10, Duration::ZERO);
        assert!(scheduler.submit(transfer(1))?);
        assert!(!scheduler.submit(transfer(1))?);
        assert!(scheduler.submit(transfer(2))?);
        // Full.
        assert!(!scheduler.submit(transfer(3))?);
        assert_eq!(scheduler.len(), 2);

        let mut seen = Vec::new();
        assert_eq!(scheduler.run(|op| Ok(seen.push(op.region_id())))?, 2);
        assert_eq!(seen, vec![1, 2]);
        assert!(scheduler.is_empty());

        // Region 3 can be submitted now that there's room.
        assert!(scheduler.submit(transfer(3))?);
        Ok(())
    }

    #[test]
    fn burst_and_cooldown() -> Result<()> {
        let scheduler = OperationScheduler::new(10, 2, Duration::from_secs(60));
        for id in 1..=3 {
            assert!(scheduler.submit(transfer(id))?);
        }
        assert_eq!(scheduler.run(|_| Ok(()))?, 2);
        assert_eq!(scheduler.len(), 1);

        // Applied operations cool down.
        assert!(!scheduler.submit(transfer(1))?);
        assert_eq!(scheduler.run(|_| Ok(()))?, 1);
        assert!(!scheduler.submit(transfer(3))?);
        Ok(())
    }

    #[test]
    fn failures_are_dropped() -> Result<()> {
        let scheduler = OperationScheduler::new(10, 10, Duration::ZERO);
        scheduler.submit(transfer(1))?;
        scheduler.submit(transfer(2))?;
        let applied = scheduler.run(|op| match op.region_id() {
            1 => Err(Error::Abort),
            _ => Ok(()),
        })?;
        assert_eq!(applied, 1);
        assert!(scheduler.is_empty());
        Ok(())
    }
}
