//! Periodic booking on a tokio runtime.
//!
//! Every tick asks a [`HostSource`] for hosts with idle resources and queues
//! a booking for each. Bookings already pending for a host collapse in the
//! booking pool, so a slow pass never piles up work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::error::AppResult;
use crate::core::ledger::DispatchHost;
use crate::core::queues::DispatchQueues;
use crate::core::worker_pool::Submission;

/// Supplies hosts that have reported idle resources.
#[async_trait]
pub trait HostSource: Send + Sync + 'static {
    /// Hosts worth booking now.
    async fn bookable_hosts(&self) -> AppResult<Vec<DispatchHost>>;
}

/// What one tick submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Bookings queued.
    pub queued: usize,
    /// Bookings absorbed by one already pending.
    pub collapsed: usize,
    /// Bookings refused by a full queue.
    pub rejected: usize,
}

/// Drives booking from a [`HostSource`] at a fixed interval.
pub struct BookingTicker<S: HostSource> {
    source: Arc<S>,
    queues: Arc<DispatchQueues>,
    interval: Duration,
}

impl<S: HostSource> BookingTicker<S> {
    /// Create a ticker firing every `interval`.
    pub const fn new(source: Arc<S>, queues: Arc<DispatchQueues>, interval: Duration) -> Self {
        Self {
            source,
            queues,
            interval,
        }
    }

    /// Queue a booking for every host the source returns.
    ///
    /// # Errors
    /// Source failures, or the booking pool has shut down.
    pub async fn tick(&self) -> AppResult<TickReport> {
        let hosts = self.source.bookable_hosts().await?;
        let mut report = TickReport::default();
        for host in hosts {
            match self.queues.book(host)? {
                Submission::Queued => report.queued += 1,
                Submission::Collapsed => report.collapsed += 1,
                Submission::Rejected => report.rejected += 1,
            }
        }
        Ok(report)
    }

    /// Tick until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis(), "booking ticker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.tick().await {
                    Ok(report) => debug!(
                        queued = report.queued,
                        collapsed = report.collapsed,
                        rejected = report.rejected,
                        "booking tick"
                    ),
                    Err(e) => warn!(error = %e, "booking tick failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("booking ticker stopped");
    }

    /// Run on the current tokio runtime. Send `true` on the returned sender
    /// to stop.
    pub fn spawn(self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(stop_rx));
        (handle, stop_tx)
    }
}
