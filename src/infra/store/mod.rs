//! Persistence collaborator contract.
//!
//! The booking engine never talks to a database directly. Everything it
//! needs to read or persist goes through [`DispatchStore`]; a production
//! deployment supplies an implementation backed by its database, and
//! [`InMemoryStore`] serves tests and development.

pub mod memory;

use uuid::Uuid;

use crate::core::entity::{DispatchFrame, DispatchJob, FrameRef, JobLaunch};
use crate::core::error::StoreError;
use crate::core::ledger::{DispatchHost, LocalHostAssignment};
use crate::core::proc::VirtualProc;
use crate::frames::FrameSet;

pub use memory::InMemoryStore;

/// Which jobs a booking pass may consider for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobScope {
    /// Jobs from shows subscribed to the host's allocation.
    Host,
    /// Jobs of one show.
    Show(Uuid),
    /// Jobs of one group.
    Group(Uuid),
    /// Jobs of any show, ignoring subscriptions.
    AllShows,
}

/// Frames marked eaten and the procs that were running them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EatenFrames {
    /// Frames that moved to the eaten state.
    pub frames: Vec<FrameRef>,
    /// Procs released from those frames; they still need a kill.
    pub procs: Vec<VirtualProc>,
}

/// Reads and writes the booking engine needs from persistence.
pub trait DispatchStore: Send + Sync {
    /// Ids of jobs with frames that fit `host`, best first.
    ///
    /// # Errors
    /// Backend failure.
    fn find_dispatch_jobs(&self, host: &DispatchHost, scope: JobScope, limit: usize) -> Result<Vec<Uuid>, StoreError>;

    /// Like [`find_dispatch_jobs`](Self::find_dispatch_jobs), restricted to
    /// jobs with a fitting frame that needs at least one GPU.
    ///
    /// # Errors
    /// Backend failure.
    fn find_gpu_dispatch_jobs(
        &self,
        host: &DispatchHost,
        scope: JobScope,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Load a job for booking.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown jobs.
    fn get_dispatch_job(&self, job_id: Uuid) -> Result<DispatchJob, StoreError>;

    /// Waiting, unblocked frames of `job` that fit `host`, in dispatch order.
    ///
    /// # Errors
    /// Backend failure.
    fn find_next_dispatch_frames(
        &self,
        job: &DispatchJob,
        host: &DispatchHost,
        limit: usize,
    ) -> Result<Vec<DispatchFrame>, StoreError>;

    /// Waiting, unblocked frames of one layer that fit `host`.
    ///
    /// # Errors
    /// Backend failure.
    fn find_next_layer_frames(
        &self,
        layer_id: Uuid,
        host: &DispatchHost,
        limit: usize,
    ) -> Result<Vec<DispatchFrame>, StoreError>;

    /// Load a single frame for booking.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown frames.
    fn get_dispatch_frame(&self, frame_id: Uuid) -> Result<DispatchFrame, StoreError>;

    /// True when the job's show already uses its burst on the host's
    /// allocation.
    ///
    /// # Errors
    /// Backend failure.
    fn is_show_at_or_over_burst(&self, job: &DispatchJob, host: &DispatchHost) -> Result<bool, StoreError>;

    /// True when the job may take another proc of the given size.
    ///
    /// # Errors
    /// Backend failure.
    fn is_job_bookable(&self, job: &DispatchJob, cores: i32, memory: i64) -> Result<bool, StoreError>;

    /// True when every frame of the layer has succeeded or been eaten.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown layers.
    fn is_layer_complete(&self, layer_id: Uuid) -> Result<bool, StoreError>;

    /// True when every frame of the job has succeeded or been eaten.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown jobs.
    fn is_job_complete(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Move the frame from waiting to running on `proc`.
    ///
    /// # Errors
    /// [`StoreError::FrameReservation`] when the frame was taken first.
    fn start_frame(&self, proc: &VirtualProc, frame: &DispatchFrame) -> Result<(), StoreError>;

    /// Persist the proc and its reservation.
    ///
    /// # Errors
    /// [`StoreError::ResourceDuplication`] or [`StoreError::ResourceReservation`].
    fn reserve_proc(&self, proc: &VirtualProc, frame: &DispatchFrame) -> Result<(), StoreError>;

    /// Release a proc. Unknown procs are ignored.
    ///
    /// # Errors
    /// Backend failure.
    fn unbook_proc(&self, proc: &VirtualProc) -> Result<(), StoreError>;

    /// Put a frame that could not be launched back to waiting.
    ///
    /// # Errors
    /// Backend failure.
    fn clear_frame(&self, frame: &DispatchFrame) -> Result<(), StoreError>;

    /// Repair a frame left with a stale proc reservation.
    ///
    /// # Errors
    /// Backend failure.
    fn fix_frame(&self, frame: &DispatchFrame) -> Result<(), StoreError>;

    /// Clear the host's stranded core record once they have been used.
    ///
    /// # Errors
    /// Backend failure.
    fn pickup_stranded_cores(&self, host: &DispatchHost) -> Result<(), StoreError>;

    /// Local assignments carved from `host`.
    ///
    /// # Errors
    /// Backend failure.
    fn local_assignments(&self, host: &DispatchHost) -> Result<Vec<LocalHostAssignment>, StoreError>;

    /// Persist the assignment's remaining idle resources.
    ///
    /// # Errors
    /// Backend failure.
    fn update_local_assignment(&self, assignment: &LocalHostAssignment) -> Result<(), StoreError>;

    /// Delete an assignment that could not book anything.
    ///
    /// # Errors
    /// Backend failure.
    fn remove_local_assignment(&self, assignment: &LocalHostAssignment) -> Result<(), StoreError>;

    /// Mark frames of a layer as eaten.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown layers.
    fn eat_frames(&self, layer_id: Uuid, frames: &FrameSet) -> Result<EatenFrames, StoreError>;

    /// Insert a job with its layers and frames.
    ///
    /// # Errors
    /// Backend failure, or a job with the same id already exists.
    fn launch_job(&self, launch: &JobLaunch) -> Result<(), StoreError>;

    /// Move hosts to another allocation. Returns how many moved.
    ///
    /// # Errors
    /// Backend failure.
    fn reparent_hosts(&self, hosts: &[String], allocation_id: Uuid) -> Result<usize, StoreError>;

    /// Load a host by name.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown hosts.
    fn get_host(&self, name: &str) -> Result<DispatchHost, StoreError>;

    /// Persist satisfied dependency edges.
    ///
    /// # Errors
    /// Backend failure.
    fn deactivate_depends(&self, signatures: &[Uuid]) -> Result<(), StoreError>;
}
