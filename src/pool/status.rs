//! Observable pool state.

use serde::{Deserialize, Serialize};

/// Counters describing what the pool has done so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Tasks accepted by the pool (blank code never reaches it)
    pub submitted: u64,
    /// Tasks that resolved with a value
    pub succeeded: u64,
    /// Tasks that settled with a setup, task or environment error
    pub failed: u64,
    /// Tasks killed by the execution time limit
    pub timed_out: u64,
    /// Handles destroyed and replaced
    pub resets: u64,
    /// Handles that finished booting
    pub boots: u64,
    /// Average time from spawn to `Ready`, in milliseconds
    pub avg_boot_ms: f64,
    #[serde(skip)]
    total_boot_ms: f64,
}

impl PoolMetrics {
    /// Records a handle that became ready after `duration_ms`.
    pub fn record_boot(&mut self, duration_ms: f64) {
        self.boots += 1;
        self.total_boot_ms += duration_ms;
        self.avg_boot_ms = self.total_boot_ms / self.boots as f64;
    }
}

/// Snapshot of the pool, published after every state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Workers idle and ready for a task
    pub available: usize,
    /// Workers running a task
    pub busy: usize,
    /// Workers whose handle has booted (available + busy)
    pub ready: usize,
    /// Workers in the pool
    pub total: usize,
    /// Tasks waiting for a worker
    pub queued: usize,
    /// Running counters
    pub metrics: PoolMetrics,
}

impl PoolStatus {
    /// Returns true when nothing is running or waiting.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.busy == 0 && self.queued == 0
    }
}
