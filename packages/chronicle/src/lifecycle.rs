//! Explicit service lifecycle.
//!
//! Every long-lived component (journal, lock provider, pipeline, repository)
//! moves through the same small state machine:
//!
//! ```text
//! NotStarted ──start──► Running ──stop──► Stopped
//!     │                    │
//!     └──────stop──────────┼──────────────► Stopped
//!                          └──fail────────► Failed
//! ```
//!
//! Starting twice is an error. Stopping twice is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// Lifecycle state of a [`Service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
    Failed,
}

impl Lifecycle {
    fn as_u8(self) -> u8 {
        match self {
            Lifecycle::NotStarted => 0,
            Lifecycle::Running => 1,
            Lifecycle::Stopped => 2,
            Lifecycle::Failed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::NotStarted,
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopped,
            _ => Lifecycle::Failed,
        }
    }

    /// True once the service can no longer be started.
    pub fn is_terminal(self) -> bool {
        matches!(self, Lifecycle::Stopped | Lifecycle::Failed)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::NotStarted => "not started",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors from lifecycle transitions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// The requested transition is not allowed from the current state.
    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: Lifecycle, to: Lifecycle },

    /// The service needs an ambient tokio runtime to start.
    #[error("no tokio runtime available to start {service}")]
    NoRuntime { service: &'static str },
}

/// Atomic lifecycle cell shared by service implementations.
#[derive(Debug)]
pub struct ServiceState(AtomicU8);

impl ServiceState {
    pub fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::NotStarted.as_u8()))
    }

    /// Current state.
    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.get() == Lifecycle::Running
    }

    /// `NotStarted -> Running`.
    pub fn start(&self) -> Result<(), LifecycleError> {
        self.transition(Lifecycle::NotStarted, Lifecycle::Running)
    }

    /// `NotStarted | Running -> Stopped`.
    ///
    /// Returns `Ok(false)` when already stopped, `Ok(true)` when this call
    /// performed the transition. A failed service stays failed.
    pub fn stop(&self) -> Result<bool, LifecycleError> {
        loop {
            let current = self.get();
            match current {
                Lifecycle::Stopped => return Ok(false),
                Lifecycle::Failed => {
                    return Err(LifecycleError::InvalidTransition {
                        from: current,
                        to: Lifecycle::Stopped,
                    })
                }
                Lifecycle::NotStarted | Lifecycle::Running => {
                    if self.transition(current, Lifecycle::Stopped).is_ok() {
                        return Ok(true);
                    }
                    // Lost a race with another transition; re-read.
                }
            }
        }
    }

    /// `Running -> Failed`.
    pub fn fail(&self) -> Result<(), LifecycleError> {
        self.transition(Lifecycle::Running, Lifecycle::Failed)
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> Result<(), LifecycleError> {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| LifecycleError::InvalidTransition {
                from: Lifecycle::from_u8(actual),
                to,
            })
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

/// A component with an explicit start/stop lifecycle.
pub trait Service: Send + Sync {
    /// Current lifecycle state.
    fn lifecycle(&self) -> Lifecycle;

    /// Move to `Running`. Fails if the service was already started.
    fn start(&self) -> Result<(), LifecycleError>;

    /// Move to `Stopped`. Stopping a stopped service is a no-op.
    fn stop(&self) -> Result<(), LifecycleError>;

    fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }
}
