//! Typed error hierarchy for the workflow orchestrator.
//!
//! - `StageError`: what a stage executor may return; the variant decides retryability
//! - `WorkflowError`: failures of orchestrator and service operations

use thiserror::Error;

use crate::workflow::models::{ExecutionStatus, FailureKind};

/// Failure reported by a stage executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// Network or service trouble. Eligible for sweep-driven retry.
    #[error("transient stage failure: {0}")]
    Transient(String),

    /// Unusable output. Never retried; escalated on the next sweep.
    #[error("permanent stage failure: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::Permanent(_) => FailureKind::Permanent,
        }
    }
}

/// Errors from orchestrator, reconciler and service operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Submission rejected: {reason}")]
    Rejected { reason: String },

    #[error("Execution is {actual}, expected {expected}")]
    Precondition {
        expected: ExecutionStatus,
        actual: ExecutionStatus,
    },

    #[error("Execution {run_id} not found")]
    NotFound { run_id: String },

    #[error("Expected {expected} answers, received {received}")]
    AnswerCountMismatch { expected: usize, received: usize },

    #[error("Question {index} already has a response")]
    AlreadyAnswered { index: usize },

    #[error("Login required to access this execution")]
    LoginRequired,

    #[error("Execution belongs to another owner")]
    Forbidden,

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;
