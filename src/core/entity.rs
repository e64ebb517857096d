//! References to jobs, layers and frames, and the dispatch-time records
//! the persistence layer hands to the booking engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::depend::Dependency;
use crate::frames::FrameSet;

/// A job on the farm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    /// Job id.
    pub id: Uuid,
    /// Job name, used only for logging.
    pub name: String,
}

impl JobRef {
    /// Reference a job with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// A layer inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRef {
    /// Layer id.
    pub id: Uuid,
    /// Owning job.
    pub job_id: Uuid,
    /// Layer name, used only for logging.
    pub name: String,
}

impl LayerRef {
    /// Reference a new layer of `job`.
    pub fn new(job: &JobRef, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            name: name.into(),
        }
    }
}

/// A single frame of a layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRef {
    /// Frame id.
    pub id: Uuid,
    /// Owning layer.
    pub layer_id: Uuid,
    /// Owning job.
    pub job_id: Uuid,
    /// Frame number within the layer's range.
    pub number: i32,
}

impl FrameRef {
    /// Reference frame `number` of `layer`.
    #[must_use]
    pub fn new(layer: &LayerRef, number: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            layer_id: layer.id,
            job_id: layer.job_id,
            number,
        }
    }
}

/// Lifecycle state of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameState {
    /// Blocked by at least one active dependency.
    Depend,
    /// Ready to be booked.
    #[default]
    Waiting,
    /// Running on a proc.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Failed and out of retries.
    Dead,
    /// Marked done without running.
    Eaten,
}

impl FrameState {
    /// True once the frame will never run again.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Succeeded | Self::Eaten)
    }
}

/// A job as loaded for booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    /// Job id.
    pub id: Uuid,
    /// Job name.
    pub name: String,
    /// Owning show.
    pub show_id: Uuid,
    /// Owning group.
    pub group_id: Uuid,
    /// OS tag frames of this job must run on.
    pub os: String,
}

impl DispatchJob {
    /// Reference to this job.
    #[must_use]
    pub fn job_ref(&self) -> JobRef {
        JobRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// A frame as loaded for booking, carrying its layer's requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchFrame {
    /// Frame id.
    pub id: Uuid,
    /// Frame number.
    pub number: i32,
    /// Display name, `<number>-<layer>`.
    pub name: String,
    /// Owning layer.
    pub layer_id: Uuid,
    /// Owning layer name.
    pub layer_name: String,
    /// Owning job.
    pub job_id: Uuid,
    /// Owning job name.
    pub job_name: String,
    /// Owning show.
    pub show_id: Uuid,
    /// Command line, with `#IFRAME#` standing in for the frame number.
    pub command: String,
    /// Minimum core units.
    pub min_cores: i32,
    /// Maximum core units, 0 for no limit.
    pub max_cores: i32,
    /// Minimum memory in KB.
    pub min_memory: i64,
    /// Minimum GPUs.
    pub min_gpus: i32,
    /// Whether the frame can use more than one core.
    pub threadable: bool,
}

impl DispatchFrame {
    /// Reference to this frame.
    #[must_use]
    pub const fn frame_ref(&self) -> FrameRef {
        FrameRef {
            id: self.id,
            layer_id: self.layer_id,
            job_id: self.job_id,
            number: self.number,
        }
    }
}

/// One layer of a job being launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerLaunch {
    /// The layer.
    pub layer: LayerRef,
    /// Frames the layer renders.
    pub frames: FrameSet,
    /// Command line, with `#IFRAME#` standing in for the frame number.
    pub command: String,
    /// Minimum core units per frame.
    pub min_cores: i32,
    /// Maximum core units per frame, 0 for no limit.
    #[serde(default)]
    pub max_cores: i32,
    /// Minimum memory per frame in KB.
    pub min_memory: i64,
    /// Minimum GPUs per frame.
    #[serde(default)]
    pub min_gpus: i32,
    /// Whether frames can use more than one core.
    #[serde(default)]
    pub threadable: bool,
}

/// A job ready to be inserted, with its layers and declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLaunch {
    /// The job.
    pub job: JobRef,
    /// Owning show.
    pub show_id: Uuid,
    /// Owning group.
    pub group_id: Uuid,
    /// OS tag.
    pub os: String,
    /// Layers in dispatch order.
    pub layers: Vec<LayerLaunch>,
    /// Dependencies declared at launch.
    #[serde(default)]
    pub depends: Vec<Dependency>,
}
