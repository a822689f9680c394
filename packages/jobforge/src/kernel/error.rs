//! Core error taxonomy.
//!
//! Retryability is a policy of the queue, not of the handler: the queue
//! retries `Store`, `Timeout`, and `Internal` failures per backoff, while
//! `BadInput`, `Forbidden`, and `Disabled` are terminal for the call that
//! produced them.

use uuid::Uuid;

use crate::common::canonical::CanonicalError;

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// Schema or canonicalization failure; terminal without retry.
    #[error("bad input: {0}")]
    BadInput(String),

    /// The caller's worker identity does not hold the job's lock.
    #[error("job {job_id} is not owned by worker {worker_id}")]
    NotOwned { job_id: Uuid, worker_id: String },

    #[error("job {0} is not running")]
    NotRunning(Uuid),

    /// Cancel is permitted from `queued` only.
    #[error("job {0} is not cancelable in its current status")]
    NotCancelable(Uuid),

    /// Reschedule is permitted from `failed`, `dead`, or `queued` only.
    #[error("job {0} is not reschedulable in its current status")]
    NotReschedulable(Uuid),

    #[error("job {0} exceeded its handler deadline")]
    Timeout(Uuid),

    /// Tenant, scope, or policy violation; terminal and audited.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Feature flag off at the time of the call.
    #[error("{0} is disabled")]
    Disabled(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient infrastructure fault; retried per backoff.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Unexpected handler failure; retried per backoff with stack captured.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// Stable code string recorded on jobs and audit entries.
    pub fn code(&self) -> &'static str {
        match self {
            ForgeError::BadInput(_) => "BadInput",
            ForgeError::NotOwned { .. } => "NotOwned",
            ForgeError::NotRunning(_) => "NotRunning",
            ForgeError::NotCancelable(_) => "NotCancelable",
            ForgeError::NotReschedulable(_) => "NotReschedulable",
            ForgeError::Timeout(_) => "Timeout",
            ForgeError::Forbidden(_) => "Forbidden",
            ForgeError::Disabled(_) => "Disabled",
            ForgeError::Conflict(_) => "Conflict",
            ForgeError::Store(_) => "Store",
            ForgeError::Internal(_) => "Internal",
        }
    }

    /// Whether the queue should retry a run that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForgeError::Store(_) | ForgeError::Timeout(_) | ForgeError::Internal(_)
        )
    }
}

impl From<CanonicalError> for ForgeError {
    fn from(err: CanonicalError) -> Self {
        ForgeError::BadInput(err.to_string())
    }
}

pub type ForgeResult<T> = Result<T, ForgeError>;
