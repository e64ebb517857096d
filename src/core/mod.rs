//! Booking engine: resource accounting, proc sizing, the dispatcher, and
//! the command pools that run it.

pub mod commands;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod ledger;
pub mod local;
pub mod proc;
pub mod queues;
pub mod worker_pool;

pub use commands::{BookHost, CommandContext, CommandOutcome, DispatchCommand, Lane};
pub use dispatcher::{BookingTarget, DispatchStats, Dispatcher};
pub use entity::{DispatchFrame, DispatchJob, FrameRef, FrameState, JobLaunch, JobRef, LayerLaunch, LayerRef};
pub use error::{AppResult, DependencyError, DispatchError, FrameRangeError, PoolError, RemoteAgentError, StoreError};
pub use ledger::{DispatchHost, LocalHostAssignment, LockState, RenderPartitionType, ResourceLedger, ThreadMode};
pub use local::LocalDispatcher;
pub use proc::VirtualProc;
pub use queues::DispatchQueues;
pub use worker_pool::{CommandExecutor, CommandPool, PoolCommand, PoolStats, Submission};
