//! Remote execution agent contract.
//!
//! Every worker host runs an agent that launches and kills frame processes.
//! The booking engine reaches it through [`RemoteAgentClient`]. The wire
//! transport is supplied by the embedding application as an
//! [`AgentConnector`]; [`CachedAgentClient`] adds per-host connection
//! caching and test mode on top of it.

pub mod cache;
pub mod client;

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::entity::DispatchFrame;
use crate::core::error::RemoteAgentError;
use crate::core::ledger::LockState;
use crate::core::proc::VirtualProc;

pub use cache::ChannelCache;
pub use client::CachedAgentClient;

/// Placeholder in frame commands replaced by the frame number.
pub const FRAME_NUMBER_TOKEN: &str = "#IFRAME#";

/// Everything an agent needs to start a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFrame {
    /// Frame id.
    pub frame_id: Uuid,
    /// Frame display name.
    pub frame_name: String,
    /// Frame number.
    pub frame_number: i32,
    /// Layer id.
    pub layer_id: Uuid,
    /// Job id.
    pub job_id: Uuid,
    /// Job name.
    pub job_name: String,
    /// Show id.
    pub show_id: Uuid,
    /// Proc the frame runs on.
    pub proc_id: Uuid,
    /// Fully expanded command line.
    pub command: String,
    /// Reserved core units.
    pub num_cores: i32,
    /// Reserved memory in KB.
    pub memory: i64,
    /// Reserved GPUs.
    pub num_gpus: i32,
    /// OS tag.
    pub os: String,
}

impl RunFrame {
    /// Launch spec for `frame` on `proc`.
    #[must_use]
    pub fn new(frame: &DispatchFrame, proc: &VirtualProc) -> Self {
        Self {
            frame_id: frame.id,
            frame_name: frame.name.clone(),
            frame_number: frame.number,
            layer_id: frame.layer_id,
            job_id: frame.job_id,
            job_name: frame.job_name.clone(),
            show_id: frame.show_id,
            proc_id: proc.id,
            command: frame.command.replace(FRAME_NUMBER_TOKEN, &frame.number.to_string()),
            num_cores: proc.cores_reserved,
            memory: proc.memory_reserved,
            num_gpus: proc.gpus_reserved,
            os: proc.os.clone(),
        }
    }
}

/// Status of a running frame as reported by its agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningFrameInfo {
    /// Frame id.
    pub frame_id: Uuid,
    /// Process id on the host.
    pub pid: Option<u32>,
    /// Resident memory in KB.
    pub rss: i64,
    /// Peak resident memory in KB.
    pub max_rss: i64,
    /// Seconds since launch.
    pub elapsed_secs: u64,
}

/// One request on the agent wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Start a frame.
    LaunchFrame(RunFrame),
    /// Kill a running frame.
    KillRunningFrame {
        /// Frame to kill.
        frame_id: Uuid,
        /// Reason recorded by the agent.
        message: String,
    },
    /// Report on a running frame.
    GetRunningFrameStatus {
        /// Frame to report on.
        frame_id: Uuid,
    },
    /// Reboot immediately.
    RebootNow,
    /// Reboot once running frames finish.
    RebootIdle,
    /// Lock every core.
    LockAll,
    /// Unlock every core.
    UnlockAll,
}

/// One response on the agent wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    /// The request was accepted.
    Ack,
    /// Status of a running frame.
    FrameStatus(RunningFrameInfo),
}

/// An open connection to one host's agent.
pub trait AgentConnection: Send + Sync {
    /// Perform one blocking request.
    ///
    /// # Errors
    /// Transport failures, including timeouts.
    fn call(&self, request: AgentRequest, timeout: Duration) -> io::Result<AgentResponse>;

    /// Release the connection. Called when it leaves the cache.
    fn close(&self) {}
}

/// Opens connections to agents.
pub trait AgentConnector: Send + Sync {
    /// Connection type produced.
    type Connection: AgentConnection + 'static;

    /// Connect to the agent on `host`.
    ///
    /// # Errors
    /// Transport failures, including timeouts.
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<Self::Connection>;
}

/// What the booking engine needs from worker agents.
pub trait RemoteAgentClient: Send + Sync {
    /// Start `frame` on the proc's host.
    ///
    /// # Errors
    /// Wrapped transport failure.
    fn launch_frame(&self, frame: &RunFrame, proc: &VirtualProc) -> Result<(), RemoteAgentError>;

    /// Kill a frame by host name and frame id.
    ///
    /// # Errors
    /// Wrapped transport failure.
    fn kill_frame_on(&self, host: &str, frame_id: Uuid, reason: &str) -> Result<(), RemoteAgentError>;

    /// Status of the frame running on `proc`.
    ///
    /// # Errors
    /// Wrapped transport failure, or the proc has no frame.
    fn get_frame_status(&self, proc: &VirtualProc) -> Result<RunningFrameInfo, RemoteAgentError>;

    /// Reboot `host` now.
    ///
    /// # Errors
    /// Wrapped transport failure.
    fn reboot_now(&self, host: &str) -> Result<(), RemoteAgentError>;

    /// Reboot `host` once it is idle.
    ///
    /// # Errors
    /// Wrapped transport failure.
    fn reboot_when_idle(&self, host: &str) -> Result<(), RemoteAgentError>;

    /// Lock every core on `host`.
    ///
    /// # Errors
    /// Wrapped transport failure.
    fn lock_host(&self, host: &str) -> Result<(), RemoteAgentError>;

    /// Unlock every core on `host`.
    ///
    /// # Errors
    /// Wrapped transport failure.
    fn unlock_host(&self, host: &str) -> Result<(), RemoteAgentError>;

    /// Turn mutating calls into no-ops.
    fn set_test_mode(&self, enabled: bool);

    /// Whether mutating calls are no-ops.
    fn is_test_mode(&self) -> bool;

    /// Kill the frame running on `proc`.
    ///
    /// # Errors
    /// Wrapped transport failure, or the proc has no frame.
    fn kill_frame(&self, proc: &VirtualProc, reason: &str) -> Result<(), RemoteAgentError> {
        let frame_id = proc
            .frame_id
            .ok_or_else(|| RemoteAgentError::new(format!("proc {} on {} has no frame", proc.id, proc.host_name)))?;
        self.kill_frame_on(&proc.host_name, frame_id, reason)
    }

    /// Apply a lock state to the host's agent. Nimby locks are owned by the
    /// agent itself and are left alone.
    ///
    /// # Errors
    /// Wrapped transport failure.
    fn set_host_lock(&self, host: &str, state: LockState) -> Result<(), RemoteAgentError> {
        match state {
            LockState::Open => self.unlock_host(host),
            LockState::Locked => self.lock_host(host),
            LockState::NimbyLocked => Ok(()),
        }
    }
}
