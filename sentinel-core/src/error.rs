use thiserror::Error;

use crate::cycle::CycleState;

pub type Result<T> = std::result::Result<T, CycleError>;

/// Every FSM-internal error is captured, classified, and converted into a
/// state transition rather than propagated as an unhandled error; this enum
/// is what the public API returns synchronously for the errors that
/// short-circuit an operation before any transition happens.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CycleError {
    #[error("engine is busy in state {0:?}")]
    Busy(CycleState),

    #[error("invalid goal: {0}")]
    InvalidGoal(String),

    #[error("curation failed: {0}")]
    CurationFailed(String),

    #[error("proposal invalid: {0}")]
    ProposalInvalid(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("apply failed: {0}")]
    ApplyFailed(String),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("no cycle is currently awaiting a decision")]
    NotAwaiting,

    #[error("too many revision iterations ({0})")]
    TooManyIterations(u32),
}

/// Errors returned synchronously by `ApprovalGate::approve`/`reject`. These
/// never affect cycle state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval id not found")]
    NotFound,

    #[error("approval already resolved")]
    AlreadyResolved,
}
