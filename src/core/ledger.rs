//! Resource accounting for bookable units.
//!
//! A bookable unit is either a whole host ([`DispatchHost`]) or a local
//! desktop partition carved out of one ([`LocalHostAssignment`]). Both expose
//! idle and total cores (in core units), memory (KB) and GPUs through
//! [`ResourceLedger`].
//!
//! `has_additional_resources` followed by `use_resources` is not atomic. The
//! booking code holds `&mut` access to the unit for the whole decision, and
//! the booking queue runs at most one booking per host at a time, so no two
//! decisions ever act on one unit at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::units::{CORE_UNITS_PER_CORE, GB4};

/// Core units withheld from CPU bookings while a GPU host is reserved for
/// GPU frames.
pub const GPU_RESERVE_CORES: i32 = CORE_UNITS_PER_CORE;
/// Memory (KB) withheld from CPU bookings while a GPU host is reserved.
pub const GPU_RESERVE_MEMORY: i64 = GB4;

/// Idle/total resource accounting shared by every bookable unit.
pub trait ResourceLedger {
    /// Idle core units.
    fn idle_cores(&self) -> i32;
    /// Idle memory in KB.
    fn idle_memory(&self) -> i64;
    /// Idle GPUs.
    fn idle_gpus(&self) -> i32;
    /// Total core units.
    fn total_cores(&self) -> i32;
    /// Total memory in KB.
    fn total_memory(&self) -> i64;
    /// Total GPUs.
    fn total_gpus(&self) -> i32;

    /// Debit idle resources. The caller must have checked
    /// [`ResourceLedger::has_additional_resources`] for the same amounts.
    fn use_resources(&mut self, cores: i32, memory: i64, gpus: i32);

    /// True when idle resources meet every minimum.
    fn has_additional_resources(&self, min_cores: i32, min_memory: i64, min_gpus: i32) -> bool {
        self.idle_cores() >= min_cores
            && self.idle_memory() >= min_memory
            && self.idle_gpus() >= min_gpus
    }
}

/// Administrative lock on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Accepting work.
    #[default]
    Open,
    /// Locked by an administrator.
    Locked,
    /// Locked because the desktop user is active.
    NimbyLocked,
}

/// Hardware state reported by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareState {
    /// Reporting and healthy.
    #[default]
    Up,
    /// Not reporting.
    Down,
    /// Rebooting now.
    Rebooting,
    /// Will reboot once its running frames finish.
    RebootWhenIdle,
    /// Out for repair.
    Repair,
}

/// How frames asking for whole cores are expanded on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    /// Size from the frame's memory needs.
    #[default]
    Auto,
    /// Give every idle whole core to the frame.
    All,
    /// Like `Auto`, but never fewer than two cores.
    Variable,
}

impl ThreadMode {
    /// Numeric code used by host reports.
    #[must_use]
    pub const fn value(self) -> i32 {
        match self {
            Self::Auto => 0,
            Self::All => 1,
            Self::Variable => 2,
        }
    }

    /// Decode a host report code; unknown codes fall back to `Auto`.
    #[must_use]
    pub const fn from_value(value: i32) -> Self {
        match value {
            1 => Self::All,
            2 => Self::Variable,
            _ => Self::Auto,
        }
    }
}

/// Idle values captured by [`DispatchHost::remove_gpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuReservation {
    /// Idle core units before the reservation.
    pub idle_cores: i32,
    /// Idle memory before the reservation.
    pub idle_memory: i64,
    /// Idle GPUs before the reservation.
    pub idle_gpus: i32,
}

/// Last time a host reported in. One writer, many readers.
#[derive(Debug, Default)]
pub struct ReportClock {
    last_report_ms: AtomicU64,
}

impl ReportClock {
    /// Record a report at `now_ms`.
    pub fn touch(&self, now_ms: u64) {
        self.last_report_ms.store(now_ms, Ordering::Release);
    }

    /// Time of the last report in epoch milliseconds, 0 if never.
    pub fn last_report_ms(&self) -> u64 {
        self.last_report_ms.load(Ordering::Acquire)
    }
}

/// A whole worker host as seen by the booking engine.
#[derive(Debug, Clone)]
pub struct DispatchHost {
    /// Host id.
    pub id: Uuid,
    /// Host name; unique on the farm.
    pub name: String,
    /// Allocation the host belongs to.
    pub allocation_id: Uuid,
    /// Operating system tag frames must match.
    pub os: String,
    /// Total core units.
    pub cores: i32,
    /// Idle core units.
    pub idle_cores: i32,
    /// Total memory in KB.
    pub memory: i64,
    /// Idle memory in KB.
    pub idle_memory: i64,
    /// Total GPUs.
    pub gpus: i32,
    /// Idle GPUs.
    pub idle_gpus: i32,
    /// Administrative lock.
    pub lock_state: LockState,
    /// Reported hardware state.
    pub hardware_state: HardwareState,
    /// Core expansion policy.
    pub thread_mode: ThreadMode,
    /// Core units that no frame could use; attached to the next booked frame.
    pub stranded_cores: i32,
    /// True while booking against a local assignment.
    pub is_local_dispatch: bool,
    gpu_reservation: Option<GpuReservation>,
    report: Arc<ReportClock>,
}

impl DispatchHost {
    /// A fully idle host with the given capacity.
    pub fn new(name: impl Into<String>, cores: i32, memory: i64, gpus: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            allocation_id: Uuid::nil(),
            os: String::from("linux"),
            cores,
            idle_cores: cores,
            memory,
            idle_memory: memory,
            gpus,
            idle_gpus: gpus,
            lock_state: LockState::Open,
            hardware_state: HardwareState::Up,
            thread_mode: ThreadMode::Auto,
            stranded_cores: 0,
            is_local_dispatch: false,
            gpu_reservation: None,
            report: Arc::default(),
        }
    }

    /// Set the allocation.
    #[must_use]
    pub const fn with_allocation(mut self, allocation_id: Uuid) -> Self {
        self.allocation_id = allocation_id;
        self
    }

    /// Set the thread mode.
    #[must_use]
    pub const fn with_thread_mode(mut self, mode: ThreadMode) -> Self {
        self.thread_mode = mode;
        self
    }

    /// Set the OS tag.
    #[must_use]
    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = os.into();
        self
    }

    /// Set stranded core units.
    #[must_use]
    pub const fn with_stranded_cores(mut self, cores: i32) -> Self {
        self.stranded_cores = cores;
        self
    }

    /// True when the host is open and up.
    #[must_use]
    pub fn is_bookable(&self) -> bool {
        self.lock_state == LockState::Open && self.hardware_state == HardwareState::Up
    }

    /// The active GPU reservation, if any.
    #[must_use]
    pub const fn gpu_reservation(&self) -> Option<&GpuReservation> {
        self.gpu_reservation.as_ref()
    }

    /// Hide the host's GPU and a slice of its CPU and memory from CPU
    /// bookings.
    ///
    /// No-op when a reservation already exists or no GPU is idle.
    pub fn remove_gpu(&mut self) {
        if self.gpu_reservation.is_some() || self.idle_gpus == 0 {
            return;
        }
        self.gpu_reservation = Some(GpuReservation {
            idle_cores: self.idle_cores,
            idle_memory: self.idle_memory,
            idle_gpus: self.idle_gpus,
        });
        self.idle_memory -= self.idle_memory.min(GPU_RESERVE_MEMORY);
        self.idle_cores -= self.idle_cores.min(GPU_RESERVE_CORES);
        self.idle_gpus = 0;
    }

    /// Undo [`DispatchHost::remove_gpu`], restoring the exact idle values it
    /// captured. No-op without a reservation.
    pub fn restore_gpu(&mut self) {
        if let Some(saved) = self.gpu_reservation.take() {
            self.idle_cores = saved.idle_cores;
            self.idle_memory = saved.idle_memory;
            self.idle_gpus = saved.idle_gpus;
        }
    }

    /// Shared report clock. Clones of this host share it.
    #[must_use]
    pub fn report_clock(&self) -> &Arc<ReportClock> {
        &self.report
    }

    /// Record a host report at `now_ms`.
    pub fn record_report(&self, now_ms: u64) {
        self.report.touch(now_ms);
    }

    /// Epoch milliseconds of the last report.
    #[must_use]
    pub fn last_report_ms(&self) -> u64 {
        self.report.last_report_ms()
    }
}

impl ResourceLedger for DispatchHost {
    fn idle_cores(&self) -> i32 {
        self.idle_cores
    }

    fn idle_memory(&self) -> i64 {
        self.idle_memory
    }

    fn idle_gpus(&self) -> i32 {
        self.idle_gpus
    }

    fn total_cores(&self) -> i32 {
        self.cores
    }

    fn total_memory(&self) -> i64 {
        self.memory
    }

    fn total_gpus(&self) -> i32 {
        self.gpus
    }

    fn use_resources(&mut self, cores: i32, memory: i64, gpus: i32) {
        self.idle_cores -= cores;
        self.idle_memory -= memory;
        self.idle_gpus -= gpus;
    }
}

/// What a local assignment is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPartitionType {
    /// Any frame of one job.
    JobPartition,
    /// Any frame of one layer.
    LayerPartition,
    /// One specific frame.
    FramePartition,
}

/// A slice of a host reserved for one user's job, layer or frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHostAssignment {
    /// Assignment id.
    pub id: Uuid,
    /// Host the assignment carves from.
    pub host_id: Uuid,
    /// Threads each booked frame receives.
    pub threads: i32,
    /// Core unit ceiling.
    pub max_cores: i32,
    /// Memory ceiling in KB.
    pub max_memory: i64,
    /// GPU ceiling.
    pub max_gpus: i32,
    /// Idle core units.
    pub idle_cores: i32,
    /// Idle memory in KB.
    pub idle_memory: i64,
    /// Idle GPUs.
    pub idle_gpus: i32,
    /// Scope.
    pub partition_type: RenderPartitionType,
    /// Job scope.
    pub job_id: Option<Uuid>,
    /// Layer scope.
    pub layer_id: Option<Uuid>,
    /// Frame scope.
    pub frame_id: Option<Uuid>,
}

impl LocalHostAssignment {
    fn new(host_id: Uuid, max_cores: i32, max_memory: i64, max_gpus: i32, threads: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id,
            threads,
            max_cores,
            max_memory,
            max_gpus,
            idle_cores: max_cores,
            idle_memory: max_memory,
            idle_gpus: max_gpus,
            partition_type: RenderPartitionType::JobPartition,
            job_id: None,
            layer_id: None,
            frame_id: None,
        }
    }

    /// An assignment serving any frame of `job_id`.
    #[must_use]
    pub fn for_job(host_id: Uuid, job_id: Uuid, max_cores: i32, max_memory: i64, max_gpus: i32, threads: i32) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::new(host_id, max_cores, max_memory, max_gpus, threads)
        }
    }

    /// An assignment serving any frame of `layer_id`.
    #[must_use]
    pub fn for_layer(
        host_id: Uuid,
        job_id: Uuid,
        layer_id: Uuid,
        max_cores: i32,
        max_memory: i64,
        max_gpus: i32,
        threads: i32,
    ) -> Self {
        Self {
            job_id: Some(job_id),
            layer_id: Some(layer_id),
            partition_type: RenderPartitionType::LayerPartition,
            ..Self::new(host_id, max_cores, max_memory, max_gpus, threads)
        }
    }

    /// An assignment serving exactly `frame_id`.
    #[must_use]
    pub fn for_frame(
        host_id: Uuid,
        job_id: Uuid,
        frame_id: Uuid,
        max_cores: i32,
        max_memory: i64,
        max_gpus: i32,
        threads: i32,
    ) -> Self {
        Self {
            job_id: Some(job_id),
            frame_id: Some(frame_id),
            partition_type: RenderPartitionType::FramePartition,
            ..Self::new(host_id, max_cores, max_memory, max_gpus, threads)
        }
    }
}

impl ResourceLedger for LocalHostAssignment {
    fn idle_cores(&self) -> i32 {
        self.idle_cores
    }

    fn idle_memory(&self) -> i64 {
        self.idle_memory
    }

    fn idle_gpus(&self) -> i32 {
        self.idle_gpus
    }

    fn total_cores(&self) -> i32 {
        self.max_cores
    }

    fn total_memory(&self) -> i64 {
        self.max_memory
    }

    fn total_gpus(&self) -> i32 {
        self.max_gpus
    }

    fn use_resources(&mut self, cores: i32, memory: i64, gpus: i32) {
        self.idle_cores -= cores;
        self.idle_memory -= memory;
        self.idle_gpus -= gpus;
    }
}
