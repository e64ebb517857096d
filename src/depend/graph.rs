//! The dependency graph: registration, satisfaction and blocking queries.
//!
//! Each edge is a one-way latch from active to satisfied. Composite
//! (previous-frame) edges are stored once per layer pair and satisfied frame
//! by frame, so registration cost does not depend on the layer's length.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{DependNode, DependTarget, Dependency, Endpoint};
use crate::core::entity::{FrameRef, JobRef, LayerRef};
use crate::core::error::DependencyError;
use crate::frames::FrameSet;

/// A completed unit of upstream work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// One frame finished.
    Frame(FrameRef),
    /// Every frame of a layer finished.
    Layer(LayerRef),
    /// Every frame of a job finished.
    Job(JobRef),
    /// A set of frames of one layer finished, e.g. after eating a range.
    Frames {
        /// Layer the frames belong to.
        layer: LayerRef,
        /// Frame numbers.
        frames: FrameSet,
    },
}

/// Outcome of [`DependencyGraph::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new edge was inserted.
    Created(Uuid),
    /// An edge with the same signature already existed.
    Existing(Uuid),
}

impl Registration {
    /// Signature of the edge.
    #[must_use]
    pub const fn signature(&self) -> Uuid {
        match self {
            Self::Created(sig) | Self::Existing(sig) => *sig,
        }
    }

    /// True if the call inserted the edge.
    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// What a completion released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Satisfaction {
    /// Edges that became satisfied.
    pub satisfied: Vec<Uuid>,
    /// Composite edges released for a single downstream frame number.
    pub unlocked_frames: Vec<(Uuid, i32)>,
}

impl Satisfaction {
    /// True if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.satisfied.is_empty() && self.unlocked_frames.is_empty()
    }
}

/// Read-only snapshot of one edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependView {
    /// Edge signature.
    pub signature: Uuid,
    /// The declaration, with its current active flag.
    pub dependency: Dependency,
    /// Frame numbers released so far on a composite edge.
    pub satisfied_frames: Vec<i32>,
}

#[derive(Debug)]
struct Edge {
    dependency: Dependency,
    satisfied_frames: BTreeSet<i32>,
}

impl Edge {
    fn view(&self, signature: Uuid) -> DependView {
        DependView {
            signature,
            dependency: self.dependency.clone(),
            satisfied_frames: self.satisfied_frames.iter().copied().collect(),
        }
    }

    fn blocks(&self, frame: &FrameRef) -> bool {
        self.dependency.is_active()
            && self.dependency.edge().depend_er().covers(frame)
            && !(self.dependency.is_composite() && self.satisfied_frames.contains(&frame.number))
    }
}

enum Unlock {
    Nothing,
    Whole,
    Frames(Vec<i32>),
}

const fn whole_if(hit: bool) -> Unlock {
    if hit {
        Unlock::Whole
    } else {
        Unlock::Nothing
    }
}

/// Which part of an edge a completion releases.
fn unlock(dep: &Dependency, completion: &Completion) -> Unlock {
    let on = dep.edge().depend_on();
    let layer_hit = |frames: Vec<i32>| {
        if dep.is_composite() {
            Unlock::Frames(frames)
        } else {
            whole_if(dep.any_frame())
        }
    };

    match completion {
        Completion::Frame(done) => match on {
            Endpoint::Frame(f) => whole_if(f.id == done.id),
            Endpoint::Layer(l) if l.id == done.layer_id => layer_hit(vec![done.number]),
            Endpoint::Layer(_) | Endpoint::Job(_) => Unlock::Nothing,
        },
        Completion::Layer(done) => whole_if(match on {
            Endpoint::Frame(f) => f.layer_id == done.id,
            Endpoint::Layer(l) => l.id == done.id,
            Endpoint::Job(_) => false,
        }),
        Completion::Job(done) => whole_if(on.job_id() == done.id),
        Completion::Frames { layer, frames } => match on {
            Endpoint::Frame(f) => whole_if(f.layer_id == layer.id && frames.contains(f.number)),
            Endpoint::Layer(l) if l.id == layer.id && !frames.is_empty() => layer_hit(frames.iter().collect()),
            Endpoint::Layer(_) | Endpoint::Job(_) => Unlock::Nothing,
        },
    }
}

/// Signature-deduplicated set of dependency edges.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: RwLock<HashMap<Uuid, Edge>>,
}

impl DependencyGraph {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `dependency` unless an edge with its signature exists.
    ///
    /// # Errors
    /// Returns [`DependencyError`] if the declaration breaks construction
    /// rules, which can only happen for deserialized dependencies.
    pub fn register(&self, dependency: Dependency) -> Result<Registration, DependencyError> {
        dependency.validate()?;
        let signature = dependency.signature();
        let kind = dependency.kind();

        let mut edges = self.edges.write();
        if edges.contains_key(&signature) {
            debug!(%signature, %kind, "dependency already registered");
            return Ok(Registration::Existing(signature));
        }
        edges.insert(
            signature,
            Edge {
                dependency,
                satisfied_frames: BTreeSet::new(),
            },
        );
        drop(edges);

        info!(%signature, %kind, "registered dependency");
        Ok(Registration::Created(signature))
    }

    /// Release every active edge waiting on the completed work.
    pub fn satisfy_dependents(&self, completion: &Completion) -> Satisfaction {
        let mut result = Satisfaction::default();
        let mut edges = self.edges.write();
        for (signature, edge) in edges.iter_mut() {
            if !edge.dependency.is_active() {
                continue;
            }
            match unlock(&edge.dependency, completion) {
                Unlock::Nothing => {}
                Unlock::Whole => {
                    edge.dependency.set_inactive();
                    result.satisfied.push(*signature);
                }
                Unlock::Frames(numbers) => {
                    for number in numbers {
                        if edge.satisfied_frames.insert(number) {
                            result.unlocked_frames.push((*signature, number));
                        }
                    }
                }
            }
        }
        drop(edges);

        if !result.is_empty() {
            info!(
                satisfied = result.satisfied.len(),
                unlocked_frames = result.unlocked_frames.len(),
                "satisfied dependents"
            );
        }
        result
    }

    /// Satisfy one edge directly, e.g. when a user drops a dependency.
    /// Returns false if the edge is unknown or already satisfied.
    pub fn satisfy(&self, signature: Uuid) -> bool {
        let mut edges = self.edges.write();
        match edges.get_mut(&signature) {
            Some(edge) if edge.dependency.is_active() => {
                edge.dependency.set_inactive();
                true
            }
            _ => false,
        }
    }

    /// True if any active edge holds `frame` back.
    #[must_use]
    pub fn is_blocked(&self, frame: &FrameRef) -> bool {
        self.edges.read().values().any(|edge| edge.blocks(frame))
    }

    /// Number of active edges holding `frame` back.
    #[must_use]
    pub fn depend_count(&self, frame: &FrameRef) -> usize {
        self.edges.read().values().filter(|edge| edge.blocks(frame)).count()
    }

    /// Active edges whose depend-on end is, or lies within, `node`.
    #[must_use]
    pub fn what_depends_on(&self, node: DependNode, target: Option<DependTarget>) -> Vec<DependView> {
        self.query(target, |dep| dep.edge().depend_on().within(node))
    }

    /// Active edges whose waiting end is, or lies within, `node`.
    #[must_use]
    pub fn what_this_depends_on(&self, node: DependNode, target: Option<DependTarget>) -> Vec<DependView> {
        self.query(target, |dep| dep.edge().depend_er().within(node))
    }

    fn query(&self, target: Option<DependTarget>, pick: impl Fn(&Dependency) -> bool) -> Vec<DependView> {
        self.edges
            .read()
            .iter()
            .filter(|(_, edge)| {
                let dep = &edge.dependency;
                dep.is_active() && target.is_none_or(|t| dep.target() == t) && pick(dep)
            })
            .map(|(signature, edge)| edge.view(*signature))
            .collect()
    }

    /// Snapshot of one edge.
    #[must_use]
    pub fn get(&self, signature: Uuid) -> Option<DependView> {
        self.edges.read().get(&signature).map(|edge| edge.view(signature))
    }

    /// Delete an edge, returning its declaration.
    pub fn remove(&self, signature: Uuid) -> Option<Dependency> {
        let removed = self.edges.write().remove(&signature).map(|edge| edge.dependency);
        if removed.is_some() {
            info!(%signature, "removed dependency");
        }
        removed
    }

    /// Number of edges still blocking.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.edges.read().values().filter(|edge| edge.dependency.is_active()).count()
    }

    /// Number of edges, active or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.read().len()
    }

    /// True if no edges are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.read().is_empty()
    }
}
