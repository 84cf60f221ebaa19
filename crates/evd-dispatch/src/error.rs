//! Error types for dispatch contexts and events.

use crate::context::ContextState;
use crate::event::EventId;
use thiserror::Error;

/// Errors reported by context construction, posting and waiting.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A construction parameter is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread {index}")]
    ThreadCreateFailed {
        /// Index of the worker that failed to start.
        index: usize,
        /// Error reported by the OS.
        #[source]
        source: std::io::Error,
    },

    /// The context lock could not be initialized.
    #[error("failed to initialize context lock")]
    LockInitFailed,

    /// The context condition variable could not be initialized.
    #[error("failed to initialize context condition variable")]
    ConditionInitFailed,

    /// The context no longer accepts events.
    #[error("invalid state: {0}")]
    InvalidState(ContextState),

    /// The event was canceled instead of completing.
    #[error("event was canceled")]
    Canceled,

    /// The event has not reached a terminal state yet.
    #[error("event is not done")]
    NotDone,

    /// The event was already posted and is still queued, running or
    /// suspended.
    #[error("{0} is already posted")]
    AlreadyQueued(EventId),

    /// The event already completed or was canceled.
    #[error("{0} already reached a terminal state")]
    Finished(EventId),
}

impl DispatchError {
    /// Whether this error reports a canceled wait.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Result type for dispatch operations.
pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
