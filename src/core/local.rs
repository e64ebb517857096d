//! Booking against local assignments: slices of a desktop host a user has
//! lent to one job, layer or frame.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::dispatcher::{Dispatcher, MEM_RESERVED_MIN};
use super::entity::DispatchFrame;
use super::error::{DispatchError, StoreError};
use super::ledger::{DispatchHost, LocalHostAssignment, RenderPartitionType, ResourceLedger};
use super::proc::VirtualProc;
use crate::util::units::CORE_UNITS_PER_CORE;

/// Books frames into a host's local assignments.
pub struct LocalDispatcher {
    dispatcher: Arc<Dispatcher>,
}

impl LocalDispatcher {
    /// Wrap a dispatcher; its store, agent and test mode are shared.
    #[must_use]
    pub const fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Book every local assignment carved from `host`.
    ///
    /// An assignment that books nothing is removed once its job is complete
    /// or gone.
    ///
    /// # Errors
    /// Persistence failures while loading or removing assignments.
    pub fn dispatch_host(&self, host: &DispatchHost) -> Result<Vec<VirtualProc>, DispatchError> {
        let store = self.dispatcher.store();
        let mut procs = Vec::new();

        for mut assignment in store.local_assignments(host)? {
            let mut local_host = prep_host(host, &assignment);
            match self.dispatch_assignment(&mut local_host, &mut assignment) {
                Ok(booked) => {
                    if booked.is_empty() {
                        self.remove_if_inactive(host, &assignment)?;
                    }
                    procs.extend(booked);
                }
                Err(DispatchError::Stopped(reason)) => {
                    warn!(host = %host.name, assignment = %assignment.id, %reason, "stopped local booking");
                    break;
                }
                Err(DispatchError::Store(StoreError::NotFound(what))) => {
                    debug!(host = %host.name, assignment = %assignment.id, %what, "local assignment work not found");
                    self.remove_if_inactive(host, &assignment)?;
                }
                Err(e) => warn!(host = %host.name, assignment = %assignment.id, error = %e, "local booking failed"),
            }
        }
        Ok(procs)
    }

    fn remove_if_inactive(&self, host: &DispatchHost, assignment: &LocalHostAssignment) -> Result<(), DispatchError> {
        let store = self.dispatcher.store();
        let inactive = match assignment.job_id {
            None => true,
            Some(job_id) => match store.is_job_complete(job_id) {
                Ok(complete) => complete,
                Err(StoreError::NotFound(_)) => true,
                Err(e) => return Err(e.into()),
            },
        };
        if inactive {
            info!(host = %host.name, assignment = %assignment.id, "local assignment job is done, removing");
            store.remove_local_assignment(assignment)?;
        }
        Ok(())
    }

    fn dispatch_assignment(
        &self,
        host: &mut DispatchHost,
        assignment: &mut LocalHostAssignment,
    ) -> Result<Vec<VirtualProc>, DispatchError> {
        let store = self.dispatcher.store();
        let limit = self.dispatcher.config().frame_query_max;
        let frames = match assignment.partition_type {
            RenderPartitionType::JobPartition => match assignment.job_id {
                Some(job_id) => {
                    let job = store.get_dispatch_job(job_id)?;
                    store.find_next_dispatch_frames(&job, host, limit)?
                }
                None => Vec::new(),
            },
            RenderPartitionType::LayerPartition => match assignment.layer_id {
                Some(layer_id) => store.find_next_layer_frames(layer_id, host, limit)?,
                None => Vec::new(),
            },
            RenderPartitionType::FramePartition => match assignment.frame_id {
                Some(frame_id) => vec![store.get_dispatch_frame(frame_id)?],
                None => Vec::new(),
            },
        };
        debug!(
            host = %host.name,
            partition = ?assignment.partition_type,
            frames = frames.len(),
            "found frames for local assignment"
        );
        self.book_frames(host, assignment, frames)
    }

    fn book_frames(
        &self,
        host: &mut DispatchHost,
        assignment: &mut LocalHostAssignment,
        frames: Vec<DispatchFrame>,
    ) -> Result<Vec<VirtualProc>, DispatchError> {
        let thread_units = assignment.threads * CORE_UNITS_PER_CORE;
        let mut procs = Vec::new();

        for frame in frames {
            if !assignment.has_additional_resources(thread_units, frame.min_memory, frame.min_gpus) {
                continue;
            }
            let mut proc = VirtualProc::build_local(host, &frame, assignment)?;
            if !self.dispatcher.try_dispatch(&frame, &mut proc)? {
                continue;
            }

            assignment.use_resources(proc.cores_reserved, proc.memory_reserved, proc.gpus_reserved);
            host.use_resources(proc.cores_reserved, proc.memory_reserved, proc.gpus_reserved);
            self.dispatcher.store().update_local_assignment(assignment)?;
            procs.push(proc);

            if !assignment.has_additional_resources(thread_units, MEM_RESERVED_MIN, 0)
                || procs.len() >= self.dispatcher.config().local_frame_dispatch_max
            {
                break;
            }
        }
        Ok(procs)
    }
}

/// A copy of `host` whose idle resources are the assignment's.
fn prep_host(host: &DispatchHost, assignment: &LocalHostAssignment) -> DispatchHost {
    let mut local = host.clone();
    local.idle_cores = assignment.idle_cores;
    local.idle_memory = assignment.idle_memory;
    local.idle_gpus = assignment.idle_gpus;
    local.stranded_cores = 0;
    local.is_local_dispatch = true;
    local
}
