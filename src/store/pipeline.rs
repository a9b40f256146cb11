use super::command::{CmdResult, RegionError};
use crate::error::{Error, Result};
use crate::region::RegionId;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Identifies a pending proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProposalKey {
    /// A command, by the request ID carried in its header.
    Request(u64),
    /// An entry without a command header (raw records and membership
    /// changes), by its log position in the region. The term it was proposed
    /// in is kept with the proposal.
    Entry { region_id: RegionId, index: u64 },
}

/// A proposal awaiting its apply result.
struct Proposal {
    region_id: RegionId,
    /// The term an entry proposal was appended in. Unused for requests.
    term: u64,
    tx: Sender<CmdResult>,
}

/// Tracks proposed commands until they are applied. Each command gets a
/// unique request ID, carried in the command header along with the
/// pipeline's incarnation, and a single-slot channel that receives the
/// result when the local peer applies the entry. Headerless entries are
/// tracked by log position instead.
///
/// The incarnation is random per pipeline, i.e. per store run. A committed
/// entry proposed by an earlier run carries a request ID that may have been
/// reused, and must not complete the current run's proposal.
pub struct CommandPipeline {
    incarnation: u64,
    next_id: AtomicU64,
    proposals: Mutex<HashMap<ProposalKey, Proposal>>,
}

impl CommandPipeline {
    pub fn new() -> Self {
        Self::with_incarnation(rand::random())
    }

    /// Creates a pipeline with the given incarnation.
    pub fn with_incarnation(incarnation: u64) -> Self {
        Self { incarnation, next_id: AtomicU64::new(1), proposals: Mutex::new(HashMap::new()) }
    }

    /// Returns the pipeline incarnation.
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Registers a new command proposal, returning its request ID and result
    /// channel.
    pub fn register(&self, region_id: RegionId) -> Result<(u64, Receiver<CmdResult>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.proposals.lock()?.insert(ProposalKey::Request(id), Proposal { region_id, term: 0, tx });
        Ok((id, rx))
    }

    /// Registers a proposal for the entry appended at the given index and
    /// term of a region's log.
    pub fn register_entry(&self, region_id: RegionId, index: u64, term: u64) -> Result<Receiver<CmdResult>> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.proposals.lock()?.insert(ProposalKey::Entry { region_id, index }, Proposal { region_id, term, tx });
        Ok(rx)
    }

    /// Completes a command proposal with its result. Returns false if the
    /// proposal is unknown, e.g. because it timed out or was proposed by
    /// another incarnation.
    pub fn complete(&self, incarnation: u64, request_id: u64, result: CmdResult) -> Result<bool> {
        if incarnation != self.incarnation {
            debug!("Discarding result of request {request_id} from incarnation {incarnation}");
            return Ok(false);
        }
        let Some(proposal) = self.proposals.lock()?.remove(&ProposalKey::Request(request_id)) else {
            debug!("Discarding result of unknown proposal {request_id}");
            return Ok(false);
        };
        // The receiver may be gone if the caller gave up.
        Ok(proposal.tx.try_send(result).is_ok())
    }

    /// Completes the entry proposal at the given log position, if any. If the
    /// applied entry has a different term, the proposal was overwritten by
    /// another leader and fails with NotLeader.
    pub fn complete_entry(&self, region_id: RegionId, index: u64, term: u64, result: CmdResult) -> Result<bool> {
        let Some(proposal) = self.proposals.lock()?.remove(&ProposalKey::Entry { region_id, index }) else {
            return Ok(false);
        };
        if proposal.term != term {
            debug!("Entry {index} of region {region_id} was replaced in term {term}");
            let _ = proposal.tx.try_send(Err(RegionError::NotLeader { region_id, leader: None }));
            return Ok(false);
        }
        Ok(proposal.tx.try_send(result).is_ok())
    }

    /// Removes a proposal without completing it.
    pub fn cancel(&self, key: ProposalKey) -> Result<()> {
        self.proposals.lock()?.remove(&key);
        Ok(())
    }

    /// Aborts all proposals of a region, e.g. when its peer stops. Waiters
    /// receive Error::Abort.
    pub fn abort_region(&self, region_id: RegionId) -> Result<usize> {
        let mut proposals = self.proposals.lock()?;
        let before = proposals.len();
        proposals.retain(|_, p| p.region_id != region_id);
        Ok(before - proposals.len())
    }

    /// Waits for a proposal's result. On timeout the proposal is removed, so
    /// a late result is discarded, and Error::Timeout is returned: the
    /// command may or may not have been applied.
    pub fn wait(&self, key: ProposalKey, rx: Receiver<CmdResult>, timeout: Duration) -> Result<CmdResult> {
        match rx.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                self.cancel(key)?;
                // The result may have raced with the timeout.
                rx.try_recv().or(Err(Error::Timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Abort),
        }
    }

    /// Returns the number of pending proposals.
    pub fn len(&self) -> Result<usize> {
        Ok(self.proposals.lock()?.len())
    }
}
