//! Error types for planning and running the pipeline.
//!
//! Planning failures are detected before the graph is touched.  Validation
//! failures come out of passes and abort the run at the next barrier.

use thiserror::Error;

use crate::model::{FilePos, SpannerRef};

/// The module list cannot be turned into a valid stage order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no output was requested")]
    NothingRequested,

    #[error("module '{0}' is registered twice")]
    DuplicateModule(String),

    #[error("output needs module '{0}', which is not registered")]
    UnknownModule(String),

    #[error("module '{module}' runs after '{needs}', which is not registered")]
    MissingDependency { module: String, needs: String },

    #[error("module '{module}' must run after '{needs}', but is registered before it")]
    OrderViolation { module: String, needs: String },

    #[error("module '{module}' uses a destructive engine, which by-note stages do not support")]
    UnsupportedEngine { module: String },
}

/// A pass found data it refuses to process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{pos}: {kind} {id} begins but never ends", kind = .spanner.kind, id = .spanner.id)]
    UnmatchedSpannerBegin { spanner: SpannerRef, pos: FilePos },

    #[error("{pos}: {kind} {id} ends but was never begun", kind = .spanner.kind, id = .spanner.id)]
    UnmatchedSpannerEnd { spanner: SpannerRef, pos: FilePos },

    #[error(
        "{pos}: {kind} {id} cannot end where the next one begins",
        kind = .spanner.kind,
        id = .spanner.id
    )]
    SpannerCannotTouch { spanner: SpannerRef, pos: FilePos },

    #[error(
        "{pos}: {kind} {id} cannot begin and end on one note",
        kind = .spanner.kind,
        id = .spanner.id
    )]
    SpannerCannotSpanOne { spanner: SpannerRef, pos: FilePos },

    #[error("{pos}: tremolo count {count} is not a power of two between 8 and 128")]
    InvalidTremoloCount { count: u32, pos: FilePos },

    #[error("{pos}: double tremolo has no partner note")]
    MissingTremoloPartner { pos: FilePos },

    #[error("{pos}: overlap can only be resolved by dropping a note that carries spanner marks")]
    UnresolvableOverlap { pos: FilePos },

    #[error("metapart '{metapart}' names unknown part '{part}'")]
    UnknownPart { metapart: String, part: String },

    #[error("part id '{part}' is used more than once")]
    DuplicatePart { part: String },
}

impl ValidationError {
    /// Input position of the offending object, when there is one.
    pub fn pos(&self) -> Option<&FilePos> {
        match self {
            ValidationError::UnmatchedSpannerBegin { pos, .. }
            | ValidationError::UnmatchedSpannerEnd { pos, .. }
            | ValidationError::SpannerCannotTouch { pos, .. }
            | ValidationError::SpannerCannotSpanOne { pos, .. }
            | ValidationError::InvalidTremoloCount { pos, .. }
            | ValidationError::MissingTremoloPartner { pos }
            | ValidationError::UnresolvableOverlap { pos } => Some(pos),
            ValidationError::UnknownPart { .. } | ValidationError::DuplicatePart { .. } => None,
        }
    }
}

/// Top-level error of a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("module '{module}' rejected {partition}: {source}")]
    Validation {
        module: String,
        partition: String,
        #[source]
        source: ValidationError,
    },

    #[error("invalid settings or score JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl PipelineError {
    /// The validation failure behind this error, if that is what it is.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            PipelineError::Validation { source, .. } => Some(source),
            _ => None,
        }
    }
}
