//! Error types for the dispatch engine.

use std::error::Error as StdError;

use thiserror::Error;
use uuid::Uuid;

/// Errors produced while parsing or slicing frame-range expressions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameRangeError {
    /// The expression does not follow the frame-range grammar.
    #[error("invalid range expression `{expr}`: {reason}")]
    InvalidRangeExpression {
        /// The offending expression or segment.
        expr: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A chunk was requested starting outside the frame set.
    #[error("chunk start index {index} is out of range for a set of {len} frames")]
    ChunkOutOfRange {
        /// Requested start index.
        index: usize,
        /// Number of frames in the set.
        len: usize,
    },
}

impl FrameRangeError {
    pub(crate) fn invalid(expr: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRangeExpression {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised when declaring a dependency.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DependencyError {
    /// Both ends of the dependency refer to the same job.
    #[error("{kind} dependency cannot depend on its own job {job}")]
    SameJob {
        /// Dependency kind name.
        kind: String,
        /// The job referenced on both sides.
        job: Uuid,
    },
    /// The dependency points at itself, or at something it contains.
    #[error("{kind} dependency cannot target itself ({entity})")]
    SelfReference {
        /// Dependency kind name.
        kind: String,
        /// The layer or frame referenced on both sides.
        entity: Uuid,
    },
}

/// Failure talking to a remote execution agent.
///
/// Always carries a human-readable message and, when available, the
/// transport error that caused it.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RemoteAgentError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl RemoteAgentError {
    /// Create an error with no underlying cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a transport error with a message describing the failed call.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The message describing the failed call.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors reported by the persistence collaborator.
///
/// The reservation variants classify booking failures so the dispatcher can
/// decide whether to skip a frame or stop booking the host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The frame was already taken by another booking.
    #[error("frame reservation failed: {0}")]
    FrameReservation(String),
    /// The proc is already reserved for a frame.
    #[error("resource duplication: {0}")]
    ResourceDuplication(String),
    /// Host resources could not be reserved.
    #[error("resource reservation failed: {0}")]
    ResourceReservation(String),
    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors raised while booking frames onto hosts.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The frame or job cannot be booked on this host; booking moves on.
    #[error("job dispatch error: {0}")]
    JobDispatch(String),
    /// Booking on this host must stop for the current pass.
    #[error("dispatcher stopped: {0}")]
    Stopped(String),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Remote agent failure.
    #[error(transparent)]
    Agent(#[from] RemoteAgentError),
    /// Invalid dependency declaration.
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    /// Invalid frame-range expression.
    #[error(transparent)]
    FrameRange(#[from] FrameRangeError),
}

/// Errors from the command pools.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has been shut down.
    #[error("pool has been shut down")]
    PoolShutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Worker threads could not be started.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
