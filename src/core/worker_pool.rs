//! Bounded command pools with dedicated worker threads.
//!
//! A [`CommandPool`] owns a fixed set of OS threads pulling commands from a
//! bounded crossbeam channel. Submission never blocks: a full queue is
//! reported as [`Submission::Rejected`], and a command whose dedup key is
//! already pending is reported as [`Submission::Collapsed`].
//!
//! Each command moves `Queued -> Running -> Completed | Failed`. Errors and
//! panics raised by the executor are logged and counted; the worker thread
//! keeps running. Commands are never retried.

mod native;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use native::CommandPool;

/// A unit of work a pool can run.
pub trait PoolCommand: Send + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Key identifying duplicates. While a command with this key is queued,
    /// further submissions with the same key collapse into it. While it
    /// runs, one further submission is held and runs after it finishes.
    fn dedup_key(&self) -> Option<String> {
        None
    }
}

/// Runs commands on pool worker threads.
pub trait CommandExecutor<C: PoolCommand>: Send + Sync + 'static {
    /// Result of a successful command, logged at debug level.
    type Output: fmt::Debug;
    /// Failure type, logged at warn level.
    type Error: fmt::Display;

    /// Execute one command. Blocking calls are expected.
    ///
    /// # Errors
    /// Any failure; the pool logs it and moves on.
    fn execute(&self, command: C) -> Result<Self::Output, Self::Error>;
}

/// How a submission was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Enqueued for execution.
    Queued,
    /// A pending command with the same dedup key absorbed it.
    Collapsed,
    /// The queue was full.
    Rejected,
}

impl Submission {
    /// True if the command was enqueued.
    #[must_use]
    pub const fn is_queued(self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// Pool utilization snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Pool name.
    pub name: String,
    /// Number of worker threads.
    pub worker_count: usize,
    /// Commands accepted into the queue.
    pub submitted: u64,
    /// Commands that finished without error.
    pub completed: u64,
    /// Commands that returned an error or panicked.
    pub failed: u64,
    /// Submissions absorbed by a pending duplicate.
    pub collapsed: u64,
    /// Submissions refused because the queue was full.
    pub rejected: u64,
    /// Commands running now.
    pub active: u64,
    /// Commands waiting in the queue.
    pub queued: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub collapsed: AtomicU64,
    pub rejected: AtomicU64,
    pub active: AtomicU64,
    pub queued: AtomicU64,
}

impl PoolCounters {
    pub fn snapshot(&self, name: &str, worker_count: usize) -> PoolStats {
        PoolStats {
            name: name.to_string(),
            worker_count,
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            collapsed: self.collapsed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}
