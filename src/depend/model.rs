//! Dependency declarations.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::entity::{FrameRef, JobRef, LayerRef};
use crate::core::error::DependencyError;

/// Namespace for dependency signatures.
const SIGNATURE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_4b0e_8a51_d2c4_7e90_b1f3);

/// Variant tag of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependKind {
    /// Job waits on job.
    JobOnJob,
    /// Job waits on layer.
    JobOnLayer,
    /// Job waits on frame.
    JobOnFrame,
    /// Layer waits on job.
    LayerOnJob,
    /// Layer waits on layer.
    LayerOnLayer,
    /// Layer waits on frame.
    LayerOnFrame,
    /// Frame waits on job.
    FrameOnJob,
    /// Frame waits on layer.
    FrameOnLayer,
    /// Frame waits on frame.
    FrameOnFrame,
    /// Each frame of a layer waits on the same-numbered frame of another.
    PreviousFrame,
}

impl DependKind {
    /// Stable upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JobOnJob => "JOB_ON_JOB",
            Self::JobOnLayer => "JOB_ON_LAYER",
            Self::JobOnFrame => "JOB_ON_FRAME",
            Self::LayerOnJob => "LAYER_ON_JOB",
            Self::LayerOnLayer => "LAYER_ON_LAYER",
            Self::LayerOnFrame => "LAYER_ON_FRAME",
            Self::FrameOnJob => "FRAME_ON_JOB",
            Self::FrameOnLayer => "FRAME_ON_LAYER",
            Self::FrameOnFrame => "FRAME_ON_FRAME",
            Self::PreviousFrame => "PREVIOUS_FRAME",
        }
    }
}

impl fmt::Display for DependKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether both ends of a dependency live in the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependTarget {
    /// Same job.
    Internal,
    /// Different jobs.
    External,
}

/// One end of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint<'a> {
    /// A whole job.
    Job(&'a JobRef),
    /// A whole layer.
    Layer(&'a LayerRef),
    /// A single frame.
    Frame(&'a FrameRef),
}

impl Endpoint<'_> {
    /// Job containing this end.
    #[must_use]
    pub const fn job_id(&self) -> Uuid {
        match self {
            Self::Job(j) => j.id,
            Self::Layer(l) => l.job_id,
            Self::Frame(f) => f.job_id,
        }
    }

    /// True if `node` is this end or contains it.
    #[must_use]
    pub fn within(&self, node: DependNode) -> bool {
        match (node, self) {
            (DependNode::Job(id), _) => self.job_id() == id,
            (DependNode::Layer(id), Self::Layer(l)) => l.id == id,
            (DependNode::Layer(id), Self::Frame(f)) => f.layer_id == id,
            (DependNode::Frame(id), Self::Frame(f)) => f.id == id,
            (DependNode::Layer(_) | DependNode::Frame(_), _) => false,
        }
    }

    /// True if `frame` is covered by this end.
    #[must_use]
    pub fn covers(&self, frame: &FrameRef) -> bool {
        match self {
            Self::Job(j) => j.id == frame.job_id,
            Self::Layer(l) => l.id == frame.layer_id,
            Self::Frame(f) => f.id == frame.id,
        }
    }

    fn signature_part(&self) -> String {
        match self {
            Self::Job(j) => j.id.to_string(),
            Self::Layer(l) => format!("{}/{}", l.job_id, l.id),
            Self::Frame(f) => format!("{}/{}/{}", f.job_id, f.layer_id, f.id),
        }
    }
}

/// Id of a job, layer or frame, used to query the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependNode {
    /// A job id.
    Job(Uuid),
    /// A layer id.
    Layer(Uuid),
    /// A frame id.
    Frame(Uuid),
}

/// The two ends of a dependency, "`er` depends on `on`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum DependEdge {
    JobOnJob { er: JobRef, on: JobRef },
    JobOnLayer { er: JobRef, on: LayerRef },
    JobOnFrame { er: JobRef, on: FrameRef },
    LayerOnJob { er: LayerRef, on: JobRef },
    LayerOnLayer { er: LayerRef, on: LayerRef },
    LayerOnFrame { er: LayerRef, on: FrameRef },
    FrameOnJob { er: FrameRef, on: JobRef },
    FrameOnLayer { er: FrameRef, on: LayerRef },
    FrameOnFrame { er: FrameRef, on: FrameRef },
    PreviousFrame { er: LayerRef, on: LayerRef },
}

impl DependEdge {
    /// Variant tag.
    #[must_use]
    pub const fn kind(&self) -> DependKind {
        match self {
            Self::JobOnJob { .. } => DependKind::JobOnJob,
            Self::JobOnLayer { .. } => DependKind::JobOnLayer,
            Self::JobOnFrame { .. } => DependKind::JobOnFrame,
            Self::LayerOnJob { .. } => DependKind::LayerOnJob,
            Self::LayerOnLayer { .. } => DependKind::LayerOnLayer,
            Self::LayerOnFrame { .. } => DependKind::LayerOnFrame,
            Self::FrameOnJob { .. } => DependKind::FrameOnJob,
            Self::FrameOnLayer { .. } => DependKind::FrameOnLayer,
            Self::FrameOnFrame { .. } => DependKind::FrameOnFrame,
            Self::PreviousFrame { .. } => DependKind::PreviousFrame,
        }
    }

    /// The waiting end.
    #[must_use]
    pub const fn depend_er(&self) -> Endpoint<'_> {
        match self {
            Self::JobOnJob { er, .. } | Self::JobOnLayer { er, .. } | Self::JobOnFrame { er, .. } => {
                Endpoint::Job(er)
            }
            Self::LayerOnJob { er, .. }
            | Self::LayerOnLayer { er, .. }
            | Self::LayerOnFrame { er, .. }
            | Self::PreviousFrame { er, .. } => Endpoint::Layer(er),
            Self::FrameOnJob { er, .. } | Self::FrameOnLayer { er, .. } | Self::FrameOnFrame { er, .. } => {
                Endpoint::Frame(er)
            }
        }
    }

    /// The end being waited on.
    #[must_use]
    pub const fn depend_on(&self) -> Endpoint<'_> {
        match self {
            Self::JobOnJob { on, .. } | Self::LayerOnJob { on, .. } | Self::FrameOnJob { on, .. } => {
                Endpoint::Job(on)
            }
            Self::JobOnLayer { on, .. }
            | Self::LayerOnLayer { on, .. }
            | Self::FrameOnLayer { on, .. }
            | Self::PreviousFrame { on, .. } => Endpoint::Layer(on),
            Self::JobOnFrame { on, .. } | Self::LayerOnFrame { on, .. } | Self::FrameOnFrame { on, .. } => {
                Endpoint::Frame(on)
            }
        }
    }

    fn validate(&self) -> Result<(), DependencyError> {
        let kind = self.kind();
        let same_job = || DependencyError::SameJob {
            kind: kind.to_string(),
            job: self.depend_er().job_id(),
        };
        let self_reference = |entity: Uuid| DependencyError::SelfReference {
            kind: kind.to_string(),
            entity,
        };

        match self {
            Self::JobOnJob { .. }
            | Self::JobOnLayer { .. }
            | Self::JobOnFrame { .. }
            | Self::LayerOnJob { .. }
            | Self::FrameOnJob { .. } => {
                if self.depend_er().job_id() == self.depend_on().job_id() {
                    return Err(same_job());
                }
            }
            Self::LayerOnLayer { er, on } if er.id == on.id => return Err(self_reference(er.id)),
            Self::FrameOnFrame { er, on } if er.id == on.id => return Err(self_reference(er.id)),
            Self::LayerOnFrame { er, on } if on.layer_id == er.id => return Err(self_reference(er.id)),
            Self::FrameOnLayer { er, on } if er.layer_id == on.id => return Err(self_reference(on.id)),
            Self::LayerOnLayer { .. }
            | Self::FrameOnFrame { .. }
            | Self::LayerOnFrame { .. }
            | Self::FrameOnLayer { .. }
            | Self::PreviousFrame { .. } => {}
        }
        Ok(())
    }
}

/// A declared "depend-er waits on depend-on" constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    edge: DependEdge,
    #[serde(default)]
    any_frame: bool,
    #[serde(default = "active_default")]
    active: bool,
}

const fn active_default() -> bool {
    true
}

impl Dependency {
    /// Validate and wrap an edge as an active dependency.
    ///
    /// # Errors
    /// Returns [`DependencyError`] for job self-dependencies and for edges
    /// pointing at themselves or at something they contain.
    pub fn new(edge: DependEdge) -> Result<Self, DependencyError> {
        edge.validate()?;
        Ok(Self {
            edge,
            any_frame: false,
            active: true,
        })
    }

    /// `er` waits for every frame of job `on`.
    ///
    /// # Errors
    /// Fails when both refer to the same job.
    pub fn job_on_job(er: &JobRef, on: &JobRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::JobOnJob { er: er.clone(), on: on.clone() })
    }

    /// `er` waits for layer `on`.
    ///
    /// # Errors
    /// Fails when the layer belongs to `er`.
    pub fn job_on_layer(er: &JobRef, on: &LayerRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::JobOnLayer { er: er.clone(), on: on.clone() })
    }

    /// `er` waits for frame `on`.
    ///
    /// # Errors
    /// Fails when the frame belongs to `er`.
    pub fn job_on_frame(er: &JobRef, on: &FrameRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::JobOnFrame { er: er.clone(), on: on.clone() })
    }

    /// Layer `er` waits for job `on`.
    ///
    /// # Errors
    /// Fails when the layer belongs to `on`.
    pub fn layer_on_job(er: &LayerRef, on: &JobRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::LayerOnJob { er: er.clone(), on: on.clone() })
    }

    /// Layer `er` waits for layer `on`.
    ///
    /// # Errors
    /// Fails when both are the same layer.
    pub fn layer_on_layer(er: &LayerRef, on: &LayerRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::LayerOnLayer { er: er.clone(), on: on.clone() })
    }

    /// Layer `er` waits for frame `on`.
    ///
    /// # Errors
    /// Fails when the frame is part of `er`.
    pub fn layer_on_frame(er: &LayerRef, on: &FrameRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::LayerOnFrame { er: er.clone(), on: on.clone() })
    }

    /// Frame `er` waits for job `on`.
    ///
    /// # Errors
    /// Fails when the frame belongs to `on`.
    pub fn frame_on_job(er: &FrameRef, on: &JobRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::FrameOnJob { er: er.clone(), on: on.clone() })
    }

    /// Frame `er` waits for layer `on`.
    ///
    /// # Errors
    /// Fails when the frame is part of `on`.
    pub fn frame_on_layer(er: &FrameRef, on: &LayerRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::FrameOnLayer { er: er.clone(), on: on.clone() })
    }

    /// Frame `er` waits for frame `on`.
    ///
    /// # Errors
    /// Fails when both are the same frame.
    pub fn frame_on_frame(er: &FrameRef, on: &FrameRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::FrameOnFrame { er: er.clone(), on: on.clone() })
    }

    /// Frame `n` of layer `er` waits for frame `n` of layer `on`.
    ///
    /// # Errors
    /// Never fails today; kept fallible like the other constructors.
    pub fn previous_frame(er: &LayerRef, on: &LayerRef) -> Result<Self, DependencyError> {
        Self::new(DependEdge::PreviousFrame { er: er.clone(), on: on.clone() })
    }

    /// Let any single completed frame of the depend-on layer satisfy this
    /// dependency.
    #[must_use]
    pub const fn with_any_frame(mut self, any_frame: bool) -> Self {
        self.any_frame = any_frame;
        self
    }

    /// Mark as already satisfied, for upstream work that is complete at
    /// declaration time.
    #[must_use]
    pub const fn into_inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Re-check construction rules; used for dependencies that arrived
    /// through deserialization.
    ///
    /// # Errors
    /// Same as [`Dependency::new`].
    pub fn validate(&self) -> Result<(), DependencyError> {
        self.edge.validate()
    }

    /// The two ends.
    #[must_use]
    pub const fn edge(&self) -> &DependEdge {
        &self.edge
    }

    /// Variant tag.
    #[must_use]
    pub const fn kind(&self) -> DependKind {
        self.edge.kind()
    }

    /// Internal when both ends share a job.
    #[must_use]
    pub fn target(&self) -> DependTarget {
        if self.edge.depend_er().job_id() == self.edge.depend_on().job_id() {
            DependTarget::Internal
        } else {
            DependTarget::External
        }
    }

    /// Whether one upstream frame is enough.
    #[must_use]
    pub const fn any_frame(&self) -> bool {
        self.any_frame
    }

    /// Still blocking.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Declared once for a whole layer and satisfied frame by frame.
    #[must_use]
    pub const fn is_composite(&self) -> bool {
        matches!(self.edge, DependEdge::PreviousFrame { .. })
    }

    /// Deterministic natural key: a UUIDv5 over the kind and the ids of both
    /// ends.
    #[must_use]
    pub fn signature(&self) -> Uuid {
        let key = format!(
            "{}|{}|{}",
            self.kind(),
            self.edge.depend_er().signature_part(),
            self.edge.depend_on().signature_part()
        );
        Uuid::new_v5(&SIGNATURE_NAMESPACE, key.as_bytes())
    }

    pub(crate) fn set_inactive(&mut self) {
        self.active = false;
    }
}
