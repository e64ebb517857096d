//! Command pool configuration.

use serde::{Deserialize, Serialize};

/// Default worker thread stack size (2 MiB).
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Sizing for one bounded command pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker threads pulling from the queue.
    pub worker_count: usize,
    /// Commands that may wait in the queue before submissions are rejected.
    pub queue_capacity: usize,
    /// Stack size for each worker thread, in bytes.
    #[serde(default = "default_stack_size")]
    pub thread_stack_size: usize,
}

const fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1000,
            thread_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl PoolConfig {
    /// Default sizing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread count.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the worker stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}
