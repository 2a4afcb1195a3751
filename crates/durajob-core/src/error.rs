//! Error taxonomy for the queue core.
//!
//! Mirrors the propagation rules of the job processing contract: only
//! [`QueueError::InvalidArgument`] ever surfaces to a `create_job` caller.
//! Everything else raised while processing a job is captured inside
//! `process_job` and recorded on the row instead of propagating.

use thiserror::Error;

/// Errors surfaced by the queue core.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Rejected `create_job` options (negative timeout/attempts, missing name).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No worker is registered for a job's `name` at execute time.
    #[error("no worker registered for job `{0}`")]
    NoWorker(String),

    /// A handler did not settle before its declared `timeout`.
    #[error("job {id} exceeded timeout of {ms}ms")]
    Timeout { id: String, ms: u64 },

    /// A handler completed abnormally.
    #[error("handler failed: {message}")]
    HandlerFailure { message: String },

    /// The persistence adapter failed.
    #[error("store failure: {0}")]
    StoreFailure(anyhow::Error),
}

impl QueueError {
    /// Construct a [`QueueError::StoreFailure`] from any adapter-side error.
    ///
    /// Deliberately not a `From` impl / `#[from]`: handler code also deals in
    /// `anyhow`-flavored errors, and an automatic conversion would let a
    /// handler's `?` silently reclassify a `HandlerFailure` as a
    /// loop-ending `StoreFailure`. Persistence adapters call this
    /// explicitly instead.
    pub fn store_failure(e: impl Into<anyhow::Error>) -> Self {
        QueueError::StoreFailure(e.into())
    }

    /// Render the message stored in a job's `data.errors` audit trail.
    pub fn audit_message(&self) -> String {
        match self {
            QueueError::NoWorker(name) => format!("no worker registered for job `{name}`"),
            QueueError::Timeout { id, ms } => format!("job {id} exceeded timeout of {ms}ms"),
            QueueError::HandlerFailure { message } => message.clone(),
            QueueError::StoreFailure(e) => format!("store failure: {e}"),
            QueueError::InvalidArgument(msg) => msg.clone(),
        }
    }

    /// Whether this error ends the run loop (a store failure) rather than
    /// just failing the one job it was raised for.
    pub fn is_fatal_to_loop(&self) -> bool {
        matches!(self, QueueError::StoreFailure(_))
    }
}
