//! The booking loop: fills a host's idle resources with waiting frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entity::{DispatchFrame, DispatchJob};
use super::error::{DispatchError, StoreError};
use super::ledger::{DispatchHost, ResourceLedger};
use super::proc::VirtualProc;
use crate::config::DispatcherConfig;
use crate::infra::agent::{RemoteAgentClient, RunFrame};
use crate::infra::store::{DispatchStore, JobScope};
use crate::util::units::CORE_UNITS_PER_CORE;

/// Default core reservation for a frame.
pub const CORE_POINTS_RESERVED_DEFAULT: i32 = CORE_UNITS_PER_CORE;
/// Fewest idle core units worth booking.
pub const CORE_POINTS_RESERVED_MIN: i32 = 10;
/// Default memory reservation for a frame (KB).
pub const MEM_RESERVED_DEFAULT: i64 = 3_355_443;
/// Least idle memory worth booking (KB).
pub const MEM_RESERVED_MIN: i64 = 262_144;
/// Fewest idle GPUs worth booking.
pub const GPU_RESERVED_MIN: i32 = 0;

const ACCOUNTING_KILL_REASON: &str = "An accounting error occurred when booking this frame.";

/// What a booking pass may pick work from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookingTarget {
    /// Any job the host may run.
    Host,
    /// Jobs of one show.
    Show(Uuid),
    /// Jobs of one group.
    Group(Uuid),
    /// One job.
    Job(Uuid),
    /// Jobs of any show.
    AllShows,
}

/// Counters over the dispatcher's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Procs booked.
    pub booked_procs: u64,
    /// Core units booked.
    pub booked_cores: u64,
    /// Frames skipped because another booking took them first.
    pub frame_retries: u64,
    /// Bookings that failed with an accounting or launch error.
    pub booking_errors: u64,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    booked_procs: AtomicU64,
    booked_cores: AtomicU64,
    frame_retries: AtomicU64,
    booking_errors: AtomicU64,
}

impl DispatchCounters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            booked_procs: self.booked_procs.load(Ordering::Relaxed),
            booked_cores: self.booked_cores.load(Ordering::Relaxed),
            frame_retries: self.frame_retries.load(Ordering::Relaxed),
            booking_errors: self.booking_errors.load(Ordering::Relaxed),
        }
    }
}

/// Books frames onto hosts.
///
/// Every booking method takes `&mut DispatchHost`: the resource check and
/// debit for a host happen under that exclusive borrow, and the booking
/// queue never runs two bookings for one host at once.
pub struct Dispatcher {
    store: Arc<dyn DispatchStore>,
    agent: Arc<dyn RemoteAgentClient>,
    config: DispatcherConfig,
    test_mode: AtomicBool,
    job_locks: Cache<Uuid, ()>,
    counters: DispatchCounters,
}

impl Dispatcher {
    /// Create a dispatcher over the given collaborators.
    pub fn new(store: Arc<dyn DispatchStore>, agent: Arc<dyn RemoteAgentClient>, config: DispatcherConfig) -> Self {
        let test_mode = AtomicBool::new(config.test_mode);
        let job_locks = Cache::builder()
            .time_to_live(Duration::from_secs(config.job_lock_expire_secs))
            .build();
        Self {
            store,
            agent,
            config,
            test_mode,
            job_locks,
            counters: DispatchCounters::default(),
        }
    }

    /// Persistence collaborator.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DispatchStore> {
        &self.store
    }

    /// Agent client.
    #[must_use]
    pub fn agent(&self) -> &Arc<dyn RemoteAgentClient> {
        &self.agent
    }

    /// Booking limits.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Skip remote launches when enabled.
    pub fn set_test_mode(&self, enabled: bool) {
        self.test_mode.store(enabled, Ordering::Release);
    }

    /// Whether remote launches are skipped.
    pub fn is_test_mode(&self) -> bool {
        self.test_mode.load(Ordering::Acquire)
    }

    /// Lifetime counters.
    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Book any job the host may run.
    ///
    /// # Errors
    /// Persistence failures while searching for jobs.
    pub fn dispatch_host(&self, host: &mut DispatchHost) -> Result<Vec<VirtualProc>, DispatchError> {
        self.dispatch_host_to(host, BookingTarget::Host)
    }

    /// Book work from `target` onto `host`.
    ///
    /// For host and show targets a GPU host first looks for work needing its
    /// GPU; if there is none, the GPU and a slice of CPU and memory are held
    /// back for the rest of the pass. The reservation is always restored
    /// before returning.
    ///
    /// # Errors
    /// Persistence failures while searching for jobs, and for job targets
    /// any error raised while booking that job.
    pub fn dispatch_host_to(
        &self,
        host: &mut DispatchHost,
        target: BookingTarget,
    ) -> Result<Vec<VirtualProc>, DispatchError> {
        let started = Instant::now();
        let result = match target {
            BookingTarget::Host => self.book_scope(host, JobScope::Host, true),
            BookingTarget::Show(show) => self.book_scope(host, JobScope::Show(show), true),
            BookingTarget::Group(group) => self.book_scope(host, JobScope::Group(group), false),
            BookingTarget::AllShows => self.book_scope(host, JobScope::AllShows, false),
            BookingTarget::Job(job_id) => self
                .store
                .get_dispatch_job(job_id)
                .map_err(DispatchError::from)
                .and_then(|job| self.dispatch_job(host, &job)),
        };
        host.restore_gpu();

        if let Ok(procs) = &result {
            debug!(
                host = %host.name,
                target = ?target,
                booked = procs.len(),
                elapsed_ms = started.elapsed().as_millis(),
                "booking pass finished"
            );
        }
        result
    }

    fn book_scope(
        &self,
        host: &mut DispatchHost,
        scope: JobScope,
        gpu_first: bool,
    ) -> Result<Vec<VirtualProc>, DispatchError> {
        let jobs = match gpu_first.then(|| self.gpu_jobs(host, scope)).transpose()?.flatten() {
            Some(jobs) => jobs,
            None => self.store.find_dispatch_jobs(host, scope, self.config.job_query_max)?,
        };
        Ok(self.dispatch_jobs(host, &jobs))
    }

    /// Jobs for an idle GPU, or `None` after holding the GPU back because
    /// nothing needs it.
    fn gpu_jobs(&self, host: &mut DispatchHost, scope: JobScope) -> Result<Option<Vec<Uuid>>, DispatchError> {
        if !host.has_additional_resources(CORE_POINTS_RESERVED_DEFAULT, MEM_RESERVED_MIN, 1) {
            return Ok(None);
        }
        let jobs = self.store.find_gpu_dispatch_jobs(host, scope, self.config.job_query_max)?;
        if jobs.is_empty() {
            host.remove_gpu();
            return Ok(None);
        }
        Ok(Some(jobs))
    }

    /// Book each job in turn until the host runs dry or hits its frame cap.
    /// Jobs locked by a concurrent pass are skipped. A job-level error moves
    /// on to the next job; [`DispatchError::Stopped`] ends the pass.
    fn dispatch_jobs(&self, host: &mut DispatchHost, jobs: &[Uuid]) -> Vec<VirtualProc> {
        let mut procs = Vec::new();
        for &job_id in jobs {
            if !host.has_additional_resources(CORE_POINTS_RESERVED_MIN, MEM_RESERVED_MIN, GPU_RESERVED_MIN) {
                break;
            }
            if procs.len() >= self.config.host_frame_dispatch_max {
                break;
            }
            if !self.try_lock_job(job_id) {
                debug!(job = %job_id, "job locked by another booking pass");
                continue;
            }

            let booked = self
                .store
                .get_dispatch_job(job_id)
                .map_err(DispatchError::from)
                .and_then(|job| self.dispatch_job(host, &job));
            match booked {
                Ok(booked) => procs.extend(booked),
                Err(DispatchError::Stopped(reason)) => {
                    warn!(host = %host.name, job = %job_id, %reason, "stopped booking host");
                    break;
                }
                Err(e) => info!(host = %host.name, job = %job_id, error = %e, "failed to book job"),
            }
        }
        procs
    }

    /// Book frames of one job onto `host`.
    ///
    /// # Errors
    /// [`DispatchError::Stopped`] when booking on this host must end;
    /// other errors abandon only this job.
    pub fn dispatch_job(&self, host: &mut DispatchHost, job: &DispatchJob) -> Result<Vec<VirtualProc>, DispatchError> {
        let mut procs = Vec::new();
        if host.stranded_cores == 0 && self.store.is_show_at_or_over_burst(job, host)? {
            return Ok(procs);
        }

        let frames = self
            .store
            .find_next_dispatch_frames(job, host, self.config.frame_query_max)?;
        debug!(host = %host.name, job = %job.name, frames = frames.len(), "found frames to book");

        for frame in frames {
            if !host.has_additional_resources(frame.min_cores, frame.min_memory, frame.min_gpus) {
                break;
            }
            let mut proc = VirtualProc::build(host, &frame)?;
            if !self
                .store
                .is_job_bookable(job, proc.cores_reserved, proc.memory_reserved)?
            {
                break;
            }
            if !self.try_dispatch(&frame, &mut proc)? {
                continue;
            }

            host.use_resources(proc.cores_reserved, proc.memory_reserved, proc.gpus_reserved);
            procs.push(proc);

            if host.stranded_cores > 0 {
                self.store.pickup_stranded_cores(host)?;
                host.stranded_cores = 0;
                break;
            }
            if !host.has_additional_resources(CORE_POINTS_RESERVED_MIN, MEM_RESERVED_MIN, GPU_RESERVED_MIN)
                || procs.len() >= self.config.job_frame_dispatch_max
                || procs.len() >= self.config.host_frame_dispatch_max
            {
                break;
            }
        }
        Ok(procs)
    }

    /// Start, reserve and launch one frame, classifying failures.
    ///
    /// Returns `Ok(false)` when the frame should be skipped and booking can
    /// go on.
    ///
    /// # Errors
    /// [`DispatchError::Stopped`] when booking on this host must end.
    pub(crate) fn try_dispatch(&self, frame: &DispatchFrame, proc: &mut VirtualProc) -> Result<bool, DispatchError> {
        let started = Instant::now();
        match self.dispatch(frame, proc) {
            Ok(()) => {
                self.counters.booked_procs.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .booked_cores
                    .fetch_add(u64::try_from(proc.cores_reserved).unwrap_or(0), Ordering::Relaxed);
                info!(
                    host = %proc.host_name,
                    frame = %frame.name,
                    job = %frame.job_name,
                    cores = proc.cores_reserved,
                    memory = proc.memory_reserved,
                    elapsed_ms = started.elapsed().as_millis(),
                    "booked frame"
                );
                Ok(true)
            }
            Err(DispatchError::Store(StoreError::FrameReservation(reason))) => {
                self.counters.frame_retries.fetch_add(1, Ordering::Relaxed);
                info!(host = %proc.host_name, frame = %frame.name, %reason, "frame taken by another booking");
                Ok(false)
            }
            Err(DispatchError::Store(StoreError::ResourceDuplication(reason))) => {
                self.counters.booking_errors.fetch_add(1, Ordering::Relaxed);
                warn!(host = %proc.host_name, frame = %frame.name, %reason, "proc already reserved, fixing frame");
                if let Err(e) = self.store.fix_frame(frame) {
                    warn!(frame = %frame.name, error = %e, "failed to fix frame");
                }
                Ok(false)
            }
            Err(DispatchError::Store(StoreError::ResourceReservation(reason))) => {
                self.counters.booking_errors.fetch_add(1, Ordering::Relaxed);
                warn!(host = %proc.host_name, frame = %frame.name, %reason, "failed to reserve host resources");
                self.release(frame, proc);
                Err(DispatchError::Stopped(format!(
                    "failed to reserve resources on {} for {}: {reason}",
                    proc.host_name, frame.name
                )))
            }
            Err(e) => {
                self.counters.booking_errors.fetch_add(1, Ordering::Relaxed);
                warn!(host = %proc.host_name, frame = %frame.name, error = %e, "failed to launch frame");
                self.release(frame, proc);
                if let Err(kill) = self.agent.kill_frame(proc, ACCOUNTING_KILL_REASON) {
                    debug!(host = %proc.host_name, frame = %frame.name, error = %kill, "kill after failed launch also failed");
                }
                Err(DispatchError::Stopped(format!(
                    "failed to launch {} on {}: {e}",
                    frame.name, proc.host_name
                )))
            }
        }
    }

    /// Start the frame, reserve the proc and, outside test mode, launch it on
    /// the agent.
    ///
    /// # Errors
    /// Any persistence or agent failure, unclassified.
    pub fn dispatch(&self, frame: &DispatchFrame, proc: &mut VirtualProc) -> Result<(), DispatchError> {
        proc.frame_id = Some(frame.id);
        self.store.start_frame(proc, frame)?;
        self.store.reserve_proc(proc, frame)?;
        if self.is_test_mode() {
            debug!(host = %proc.host_name, frame = %frame.name, "test mode, not launching");
            return Ok(());
        }
        self.agent.launch_frame(&RunFrame::new(frame, proc), proc)?;
        Ok(())
    }

    fn release(&self, frame: &DispatchFrame, proc: &VirtualProc) {
        if let Err(e) = self.store.unbook_proc(proc) {
            warn!(proc = %proc.id, error = %e, "failed to unbook proc");
        }
        if let Err(e) = self.store.clear_frame(frame) {
            warn!(frame = %frame.name, error = %e, "failed to clear frame");
        }
    }

    /// Claim a job for this pass. Claims lapse on their own after
    /// `job_lock_expire_secs`.
    fn try_lock_job(&self, job_id: Uuid) -> bool {
        self.job_locks.entry(job_id).or_insert(()).is_fresh()
    }
}
