//! Worker lifecycle state machine.
//!
//! The whole lifecycle lives in one atomic counter of pending items:
//!
//! - `0` means `Idle`: no worker is running and none is about to.
//! - `> 0` means `Running`: exactly one worker owns the drain loop and will
//!   not exit until it has processed every unit counted here.
//!
//! Producers push the item first and call [`WorkerState::claim`] second. The
//! caller that moves the counter off zero owns the right to start a worker.
//! The worker leaves through [`WorkerState::retire`], which subtracts exactly
//! the work it processed. The subtraction and the "nothing left" check are the
//! same atomic step, so an enqueue racing the exit either keeps the worker
//! alive or lands after the counter hit zero and claims a fresh worker.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of recording one unit of pending work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The state was `Idle`; the caller must start a worker.
    Claimed,
    /// A worker is already running and will pick the item up.
    AlreadyActive,
}

/// Outcome of a worker handing back the work it has processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retire {
    /// Nothing arrived meanwhile; the worker must exit now.
    Idle,
    /// More items were counted during the batch; keep draining.
    MoreWork,
}

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Idle,
    Running,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Idle => write!(f, "idle"),
            Lifecycle::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerState {
    pending: AtomicUsize,
}

impl WorkerState {
    pub const fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
        }
    }

    /// Count one more pending item. Call only after the item is in the queue.
    pub fn claim(&self) -> Claim {
        if self.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            Claim::Claimed
        } else {
            Claim::AlreadyActive
        }
    }

    /// Items the running worker still owes. The worker reads this to size its
    /// next batch; every counted item is already in the queue.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Hand back `done` processed items.
    pub fn retire(&self, done: usize) -> Retire {
        let prev = self.pending.fetch_sub(done, Ordering::AcqRel);
        debug_assert!(prev >= done, "retired {done} items but only {prev} pending");
        if prev == done {
            Retire::Idle
        } else {
            Retire::MoreWork
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.pending() == 0 {
            Lifecycle::Idle
        } else {
            Lifecycle::Running
        }
    }
}
