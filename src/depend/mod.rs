//! Execution-ordering constraints between jobs, layers and frames.

pub mod graph;
pub mod model;

pub use graph::{Completion, DependView, DependencyGraph, Registration, Satisfaction};
pub use model::{DependEdge, DependKind, DependNode, DependTarget, Dependency, Endpoint};
