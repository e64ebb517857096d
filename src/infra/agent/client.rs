//! [`RemoteAgentClient`] over a pluggable transport with connection caching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::ChannelCache;
use super::{AgentConnection, AgentConnector, AgentRequest, AgentResponse, RemoteAgentClient, RunFrame, RunningFrameInfo};
use crate::config::AgentConfig;
use crate::core::error::RemoteAgentError;
use crate::core::proc::VirtualProc;

/// Agent client caching one connection per host.
pub struct CachedAgentClient<C: AgentConnector> {
    connector: C,
    port: u16,
    connect_timeout: Duration,
    call_timeout: Duration,
    cache: ChannelCache<C::Connection>,
    test_mode: AtomicBool,
}

impl<C: AgentConnector> CachedAgentClient<C> {
    /// Build a client from configuration.
    pub fn new(connector: C, config: &AgentConfig) -> Self {
        Self {
            connector,
            port: config.port,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            cache: ChannelCache::new(config.cache_size, Duration::from_secs(config.cache_expire_secs)),
            test_mode: AtomicBool::new(config.test_mode),
        }
    }

    /// Number of cached connections.
    pub fn cached_connections(&self) -> usize {
        self.cache.len()
    }

    fn channel(&self, host: &str) -> Result<Arc<C::Connection>, RemoteAgentError> {
        if let Some(connection) = self.cache.get(host) {
            return Ok(connection);
        }
        let connection = self
            .connector
            .connect(host, self.port, self.connect_timeout)
            .map_err(|e| RemoteAgentError::with_source(format!("failed to connect to agent on {host}"), e))?;
        debug!(host, port = self.port, "opened agent connection");
        Ok(self.cache.insert(host, connection))
    }

    fn call(&self, host: &str, request: AgentRequest, action: &str) -> Result<AgentResponse, RemoteAgentError> {
        let channel = self.channel(host)?;
        channel.call(request, self.call_timeout).map_err(|e| {
            warn!(host, action, error = %e, "agent call failed");
            RemoteAgentError::with_source(format!("failed to {action} on {host}"), e)
        })
    }

    fn mutate(&self, host: &str, request: AgentRequest, action: &str) -> Result<(), RemoteAgentError> {
        if self.is_test_mode() {
            debug!(host, action, "test mode, skipping agent call");
            return Ok(());
        }
        self.call(host, request, action).map(|_| ())
    }
}

impl<C: AgentConnector> RemoteAgentClient for CachedAgentClient<C> {
    fn launch_frame(&self, frame: &RunFrame, proc: &VirtualProc) -> Result<(), RemoteAgentError> {
        self.mutate(&proc.host_name, AgentRequest::LaunchFrame(frame.clone()), "launch frame")?;
        info!(host = %proc.host_name, frame = %frame.frame_name, cores = proc.cores_reserved, "launched frame");
        Ok(())
    }

    fn kill_frame_on(&self, host: &str, frame_id: Uuid, reason: &str) -> Result<(), RemoteAgentError> {
        self.mutate(
            host,
            AgentRequest::KillRunningFrame {
                frame_id,
                message: reason.to_string(),
            },
            "kill frame",
        )
    }

    fn get_frame_status(&self, proc: &VirtualProc) -> Result<RunningFrameInfo, RemoteAgentError> {
        let frame_id = proc
            .frame_id
            .ok_or_else(|| RemoteAgentError::new(format!("proc {} on {} has no frame", proc.id, proc.host_name)))?;
        match self.call(
            &proc.host_name,
            AgentRequest::GetRunningFrameStatus { frame_id },
            "get frame status",
        )? {
            AgentResponse::FrameStatus(info) => Ok(info),
            AgentResponse::Ack => Err(RemoteAgentError::new(format!(
                "agent on {} returned no status for frame {frame_id}",
                proc.host_name
            ))),
        }
    }

    fn reboot_now(&self, host: &str) -> Result<(), RemoteAgentError> {
        self.mutate(host, AgentRequest::RebootNow, "reboot host")
    }

    fn reboot_when_idle(&self, host: &str) -> Result<(), RemoteAgentError> {
        self.mutate(host, AgentRequest::RebootIdle, "reboot host when idle")
    }

    fn lock_host(&self, host: &str) -> Result<(), RemoteAgentError> {
        self.mutate(host, AgentRequest::LockAll, "lock host")
    }

    fn unlock_host(&self, host: &str) -> Result<(), RemoteAgentError> {
        self.mutate(host, AgentRequest::UnlockAll, "unlock host")
    }

    fn set_test_mode(&self, enabled: bool) {
        self.test_mode.store(enabled, Ordering::Release);
    }

    fn is_test_mode(&self) -> bool {
        self.test_mode.load(Ordering::Acquire)
    }
}

impl<C: AgentConnector> Drop for CachedAgentClient<C> {
    fn drop(&mut self) {
        self.cache.clear();
    }
}
