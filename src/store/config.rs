use crate::errinput;
use crate::error::Result;
use crate::raft;
use crate::region::StoreId;

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Store configuration. Durations are given in milliseconds.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The store ID. Must be unique and non-zero.
    pub store_id: StoreId,
    /// The data directory, holding the manifest and Raft logs.
    pub data_dir: PathBuf,
    /// The interval between Raft ticks.
    pub tick_interval_ms: u64,
    /// The number of Raft worker threads. Regions are sharded across workers
    /// by region ID.
    pub raft_workers: usize,
    /// Raft ticks without a leader heartbeat before a follower campaigns.
    pub election_tick: usize,
    /// Raft ticks between leader heartbeats.
    pub heartbeat_tick: usize,
    /// The number of applied entries to retain when compacting Raft logs.
    pub log_retain: u64,
    /// Raft ticks to wait for a snapshot acknowledgement before resending.
    pub snapshot_resend_ticks: usize,
    /// The size at which WAL segments are rolled over.
    pub wal_segment_size: u64,
    /// Whether to fsync WAL and manifest writes.
    pub sync: bool,
    /// How long to wait for a proposed command to apply.
    pub proposal_timeout_ms: u64,
    /// How long to wait for a read index to be confirmed and applied.
    pub read_timeout_ms: u64,
    /// The interval between heartbeats to the placement service.
    pub heartbeat_interval_ms: u64,
    /// The maximum number of scheduled operations applied per round.
    pub operation_burst: usize,
    /// The minimum interval between operations of the same kind on a region.
    pub operation_cooldown_ms: u64,
    /// The maximum number of queued operations. Further ones are dropped.
    pub operation_queue: usize,
    /// The number of transaction latch stripes.
    pub latch_stripes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let raft = raft::Options::default();
        Self {
            store_id: 1,
            data_dir: PathBuf::from("data"),
            tick_interval_ms: 100,
            raft_workers: 4,
            election_tick: raft.election_tick,
            heartbeat_tick: raft.heartbeat_tick,
            log_retain: raft.log_retain,
            snapshot_resend_ticks: raft.snapshot_resend_ticks,
            wal_segment_size: 8 << 20,
            sync: true,
            proposal_timeout_ms: 3000,
            read_timeout_ms: 3000,
            heartbeat_interval_ms: 1000,
            operation_burst: 4,
            operation_cooldown_ms: 10_000,
            operation_queue: 256,
            latch_stripes: 256,
        }
    }
}

impl Config {
    /// Checks that the configuration is valid.
    pub fn validate(&self) -> Result<()> {
        if self.store_id == 0 {
            return errinput!("store ID must be non-zero");
        }
        if self.tick_interval_ms == 0 {
            return errinput!("tick interval must be non-zero");
        }
        if self.raft_workers == 0 {
            return errinput!("raft worker count must be non-zero");
        }
        if self.heartbeat_tick == 0 || self.election_tick <= self.heartbeat_tick {
            return errinput!(
                "election tick {} must be larger than heartbeat tick {}",
                self.election_tick,
                self.heartbeat_tick
            );
        }
        if self.wal_segment_size == 0 {
            return errinput!("WAL segment size must be non-zero");
        }
        if self.operation_queue == 0 {
            return errinput!("operation queue capacity must be non-zero");
        }
        Ok(())
    }

    /// Returns the Raft peer options.
    pub fn raft_options(&self) -> raft::Options {
        raft::Options {
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            log_retain: self.log_retain,
            snapshot_resend_ticks: self.snapshot_resend_ticks,
            ..raft::Options::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn operation_cooldown(&self) -> Duration {
        Duration::from_millis(self.operation_cooldown_ms)
    }

    /// Returns the directory of a region's Raft log.
    pub fn raft_dir(&self, region_id: u64) -> PathBuf {
        self.data_dir.join("raft").join(region_id.to_string())
    }

    /// Returns the manifest path.
    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("MANIFEST")
    }
}
