//! Structured errors for command processing.
//!
//! [`DerivationError`] is what a command's derivation returns.
//! [`CommandError`] is what the publisher of a command finally sees.
//!
//! # The Error Boundary Rule
//!
//! `anyhow::Error` is transport for application faults (derivation faults,
//! completion hooks, storage backends). It always reaches the caller wrapped
//! in one of the variants below, so callers can match on *where* a command
//! failed without downcasting.
//!
//! ```ignore
//! match repo.execute(cmd).await {
//!     Ok(out) => { /* committed */ }
//!     Err(e) if e.is_rejection() => { /* business rule said no, nothing stored */ }
//!     Err(e) if e.is_durable() => { /* committed, but completion failed */ }
//!     Err(e) => { /* fault, nothing stored */ }
//! }
//! ```

use std::fmt;

use thiserror::Error;

use crate::core::EntityId;
use crate::journal::JournalError;
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::lock::LockError;

/// Processing stage in which a panic was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Derivation,
    Commit,
    Completion,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Derivation => "derivation",
            Stage::Commit => "commit",
            Stage::Completion => "completion",
        };
        f.write_str(name)
    }
}

/// Failure while deriving a command's events.
///
/// Either returned by [`Command::events`](crate::Command::events) or yielded
/// as an item of the event stream. Any of these aborts the unit: nothing is
/// committed.
#[derive(Debug, Error)]
pub enum DerivationError {
    /// The command violates a business rule.
    #[error("command rejected: {reason}")]
    Rejected { reason: String },

    /// Unexpected failure in application code.
    #[error(transparent)]
    Fault(anyhow::Error),

    /// A lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The command produced more events than the pipeline reserved for it.
    #[error("command produced more than {limit} events")]
    TooManyEvents { limit: u64 },

    /// An event's type is not in the registry.
    #[error("unknown event type: {entity_type}")]
    UnknownEventType { entity_type: &'static str },

    /// The lazily evaluated event stream panicked.
    #[error("event stream panicked: {message}")]
    Panicked { message: String },
}

impl DerivationError {
    /// Business rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Unexpected fault.
    pub fn fault(error: impl Into<anyhow::Error>) -> Self {
        Self::Fault(error.into())
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Outcome of a failed `publish`, as seen by the caller.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Derivation failed; nothing was committed.
    #[error("derivation failed: {0}")]
    Derivation(#[source] DerivationError),

    /// The journal could not commit the unit; nothing was committed.
    #[error("commit failed: {0}")]
    Commit(#[source] JournalError),

    /// The unit was committed but the completion hook failed.
    #[error("completion failed after commit: {0}")]
    Completion(anyhow::Error),

    /// Application code panicked.
    #[error("{stage} panicked: {message}")]
    Panicked { stage: Stage, message: String },

    /// The queue is full and the pipeline rejects instead of waiting.
    #[error("command queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The pipeline or repository is not running.
    #[error("pipeline is {state}")]
    NotRunning { state: Lifecycle },

    /// The entity already carries a timestamp, so it was submitted before.
    #[error("command {id} was already submitted")]
    AlreadySubmitted { id: EntityId },

    /// The command's type is not in the registry.
    #[error("unknown command type: {entity_type}")]
    UnknownCommandType { entity_type: &'static str },

    /// The pipeline went away before producing a result.
    #[error("pipeline shut down before the command completed")]
    PipelineGone,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl CommandError {
    /// True if derivation rejected the command on business grounds.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Derivation(e) if e.is_rejection())
    }

    /// True if the command's entities were committed despite the error.
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            Self::Completion(_)
                | Self::Panicked {
                    stage: Stage::Completion,
                    ..
                }
        )
    }
}

impl From<JournalError> for CommandError {
    fn from(error: JournalError) -> Self {
        match error {
            // Stream errors surface through the journal but belong to derivation.
            JournalError::Derivation(e) => e.into(),
            other => Self::Commit(other),
        }
    }
}

impl From<DerivationError> for CommandError {
    fn from(error: DerivationError) -> Self {
        match error {
            DerivationError::Panicked { message } => Self::Panicked {
                stage: Stage::Derivation,
                message,
            },
            other => Self::Derivation(other),
        }
    }
}

/// Best-effort text of a captured panic payload.
pub(crate) fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
