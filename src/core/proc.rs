//! Proc sizing: how much of a host a frame gets when it is booked.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::DispatchFrame;
use super::error::DispatchError;
use super::ledger::{DispatchHost, LocalHostAssignment, ThreadMode};
use crate::util::units::{whole_cores, CORE_UNITS_PER_CORE, GB, MB512};

/// Idle memory (KB) below which a threadable frame takes every idle core,
/// since nothing else could use the remaining memory.
pub const MEM_STRANDED_THRESHOLD: i64 = GB + MB512;

/// Smallest core reservation on a `Variable` host for a threadable frame.
const VARIABLE_MIN_CORES: i32 = 2 * CORE_UNITS_PER_CORE;

/// A slice of a host reserved for one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualProc {
    /// Proc id.
    pub id: Uuid,
    /// Host the proc lives on.
    pub host_id: Uuid,
    /// Host name, used to reach the agent.
    pub host_name: String,
    /// Host allocation.
    pub allocation_id: Uuid,
    /// Frame running on the proc, set once the frame is started.
    pub frame_id: Option<Uuid>,
    /// Layer of the frame.
    pub layer_id: Uuid,
    /// Job of the frame.
    pub job_id: Uuid,
    /// Show of the frame.
    pub show_id: Uuid,
    /// Host OS tag.
    pub os: String,
    /// Reserved core units.
    pub cores_reserved: i32,
    /// Reserved memory in KB.
    pub memory_reserved: i64,
    /// Reserved GPUs.
    pub gpus_reserved: i32,
    /// Booked against a local assignment.
    pub is_local_dispatch: bool,
    /// Marked to be released when its frame finishes.
    pub unbooked: bool,
}

impl VirtualProc {
    fn for_frame(host: &DispatchHost, frame: &DispatchFrame) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id: host.id,
            host_name: host.name.clone(),
            allocation_id: host.allocation_id,
            frame_id: None,
            layer_id: frame.layer_id,
            job_id: frame.job_id,
            show_id: frame.show_id,
            os: host.os.clone(),
            cores_reserved: frame.min_cores,
            memory_reserved: frame.min_memory,
            gpus_reserved: frame.min_gpus,
            is_local_dispatch: host.is_local_dispatch,
            unbooked: false,
        }
    }

    /// Size a proc for `frame` on `host`.
    ///
    /// Stranded cores are attached to the frame. Frames asking for at least
    /// one whole core are expanded according to the host's thread mode and
    /// the frame's memory footprint, never below the request, never above
    /// the frame's `max_cores`, and never beyond the host's idle whole cores.
    /// Non-threadable frames never get more than one core.
    ///
    /// # Errors
    /// [`DispatchError::Stopped`] when the host has less than one whole core
    /// idle; [`DispatchError::JobDispatch`] when a threadable frame would get
    /// a single core on a `Variable` host.
    pub fn build(host: &DispatchHost, frame: &DispatchFrame) -> Result<Self, DispatchError> {
        let mut proc = Self::for_frame(host, frame);
        proc.cores_reserved += host.stranded_cores.max(0);

        if proc.cores_reserved >= CORE_UNITS_PER_CORE {
            proc.cores_reserved = expand_cores(host, frame, proc.cores_reserved)?;
        }
        if !frame.threadable && proc.cores_reserved > CORE_UNITS_PER_CORE {
            proc.cores_reserved = CORE_UNITS_PER_CORE;
        }
        Ok(proc)
    }

    /// Size a proc for `frame` inside a local assignment. The frame gets the
    /// assignment's thread count, clamped to the host's idle whole cores.
    ///
    /// # Errors
    /// [`DispatchError::Stopped`] when the host has less than one whole core
    /// idle.
    pub fn build_local(
        host: &DispatchHost,
        frame: &DispatchFrame,
        assignment: &LocalHostAssignment,
    ) -> Result<Self, DispatchError> {
        let mut proc = Self::for_frame(host, frame);
        proc.cores_reserved = assignment.threads * CORE_UNITS_PER_CORE;

        let whole = idle_whole_cores(host, frame)?;
        if proc.cores_reserved > host.idle_cores {
            proc.cores_reserved = whole * CORE_UNITS_PER_CORE;
        }
        Ok(proc)
    }
}

fn idle_whole_cores(host: &DispatchHost, frame: &DispatchFrame) -> Result<i32, DispatchError> {
    match whole_cores(host.idle_cores) {
        0 => Err(DispatchError::Stopped(format!(
            "host {} had only a fraction of a core remaining but frame {} required {}",
            host.name, frame.name, frame.min_cores
        ))),
        whole => Ok(whole),
    }
}

fn expand_cores(host: &DispatchHost, frame: &DispatchFrame, requested: i32) -> Result<i32, DispatchError> {
    let whole = idle_whole_cores(host, frame)?;
    let all_idle = whole * CORE_UNITS_PER_CORE;
    let variable = host.thread_mode == ThreadMode::Variable;

    let mut cores = requested;
    if host.thread_mode == ThreadMode::All {
        cores = all_idle;
    } else if frame.threadable {
        cores = if host.idle_memory - frame.min_memory <= MEM_STRANDED_THRESHOLD {
            all_idle
        } else {
            core_span(host, frame.min_memory)
        };
        if variable && cores <= VARIABLE_MIN_CORES {
            cores = VARIABLE_MIN_CORES;
            if cores > host.idle_cores {
                return Err(single_core_on_variable_host(host));
            }
        }
    }

    cores = cores.max(CORE_UNITS_PER_CORE).max(requested);
    if frame.max_cores > 0 && cores >= frame.max_cores {
        cores = frame.max_cores;
    }
    if cores > host.idle_cores {
        if variable && frame.threadable && whole == 1 {
            return Err(single_core_on_variable_host(host));
        }
        cores = all_idle;
    }
    Ok(cores)
}

fn single_core_on_variable_host(host: &DispatchHost) -> DispatchError {
    DispatchError::JobDispatch(format!(
        "threadable frames may not run on a single core of variable host {}",
        host.name
    ))
}

/// Cores to reserve so the frame's share of host memory matches its share
/// of host cores.
fn core_span(host: &DispatchHost, min_memory: i64) -> i32 {
    let total = whole_cores(host.cores);
    if whole_cores(host.idle_cores) < 1 || total < 1 {
        return CORE_UNITS_PER_CORE;
    }
    let mem_per_core = host.idle_memory / i64::from(total);
    if mem_per_core <= 0 {
        return CORE_UNITS_PER_CORE;
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let procs = (min_memory as f64 / mem_per_core as f64).round() as i32;
    procs * CORE_UNITS_PER_CORE
}
