//! The three dispatch pools and command routing between them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use super::commands::{BookHost, CommandContext, DispatchCommand, Lane};
use super::error::PoolError;
use super::ledger::DispatchHost;
use super::worker_pool::{CommandPool, PoolStats, Submission};
use crate::config::DispatchConfig;

type Pool = CommandPool<DispatchCommand, CommandContext>;

/// Booking, kill and management pools sharing one [`CommandContext`].
pub struct DispatchQueues {
    booking: Pool,
    kill: Pool,
    manage: Pool,
    context: Arc<CommandContext>,
}

impl DispatchQueues {
    /// Start every pool from `config`.
    ///
    /// # Errors
    /// Invalid pool configuration or thread spawn failure.
    pub fn new(config: &DispatchConfig, context: Arc<CommandContext>) -> Result<Self, PoolError> {
        let booking = CommandPool::new("booking", config.booking.clone(), Arc::clone(&context))?;
        let kill = CommandPool::new("kill", config.kill.clone(), Arc::clone(&context))?;
        let manage = CommandPool::new("manage", config.manage.clone(), Arc::clone(&context))?;
        Ok(Self {
            booking,
            kill,
            manage,
            context,
        })
    }

    /// Shared execution context.
    #[must_use]
    pub const fn context(&self) -> &Arc<CommandContext> {
        &self.context
    }

    /// Route `command` to its pool.
    ///
    /// # Errors
    /// [`PoolError::PoolShutdown`] after shutdown.
    pub fn submit(&self, command: DispatchCommand) -> Result<Submission, PoolError> {
        self.pool(command.lane()).submit(command)
    }

    /// Queue a booking for `host`.
    ///
    /// # Errors
    /// [`PoolError::PoolShutdown`] after shutdown.
    pub fn book(&self, host: DispatchHost) -> Result<Submission, PoolError> {
        self.submit(DispatchCommand::BookHost(BookHost::new(host)))
    }

    /// Pool for a lane.
    #[must_use]
    pub const fn pool(&self, lane: Lane) -> &Pool {
        match lane {
            Lane::Booking => &self.booking,
            Lane::Kill => &self.kill,
            Lane::Manage => &self.manage,
        }
    }

    /// Statistics for every pool.
    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        vec![self.booking.stats(), self.kill.stats(), self.manage.stats()]
    }

    /// Wait for every pool to go idle. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        [&self.manage, &self.booking, &self.kill]
            .into_iter()
            .all(|pool| pool.wait_idle(deadline.saturating_duration_since(Instant::now())))
    }

    /// Shut every pool down, draining queued commands.
    pub fn shutdown(&self) {
        self.booking.shutdown();
        self.manage.shutdown();
        self.kill.shutdown();
        info!("dispatch queues shut down");
    }
}
